//! On-disk class lookup over a list of directories and archives.
//!
//! Each element's contents are indexed lazily the first time a lookup reaches it:
//! directories by walking the tree once, archives by listing their entry names.
//! Open archives are memory mapped and kept in a small LRU pool; evicted handles
//! are closed as they fall out and the rest are closed together by [`ClassPath::close`].

use ignore::WalkBuilder;
use memmap2::Mmap;
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::config::{is_archive, path_components};
use crate::error::{ClassError, Result};

type Archive = ZipArchive<Cursor<Mmap>>;

#[derive(Debug)]
enum PathElement {
    Directory {
        root: PathBuf,
        classes: Option<HashSet<String>>,
    },
    Archive {
        path: PathBuf,
        classes: Option<HashSet<String>>,
    },
}

impl PathElement {
    fn location(&self) -> &Path {
        match self {
            PathElement::Directory { root, .. } => root,
            PathElement::Archive { path, .. } => path,
        }
    }
}

pub struct ClassPath {
    elements: Vec<PathElement>,
    jars: JarPool,
}

impl std::fmt::Debug for ClassPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassPath")
            .field("elements", &self.elements)
            .field("open_jars", &self.jars.len())
            .finish()
    }
}

impl ClassPath {
    /// Elements that do not exist on disk are dropped.
    pub fn new(elements: impl IntoIterator<Item = PathBuf>, jar_pool_capacity: usize) -> Self {
        let elements = elements
            .into_iter()
            .filter_map(|p| {
                if p.is_dir() {
                    Some(PathElement::Directory {
                        root: p,
                        classes: None,
                    })
                } else if p.is_file() {
                    if !is_archive(&p) {
                        debug!(path = %p.display(), "class path element is not .jar/.zip, reading as archive");
                    }
                    Some(PathElement::Archive {
                        path: p,
                        classes: None,
                    })
                } else {
                    None
                }
            })
            .collect();

        Self {
            elements,
            jars: JarPool::new(jar_pool_capacity),
        }
    }

    pub fn from_class_path(class_path: &str, working_dir: &Path, jar_pool_capacity: usize) -> Self {
        Self::new(path_components(class_path, working_dir), jar_pool_capacity)
    }

    pub fn elements(&self) -> Vec<&Path> {
        self.elements.iter().map(PathElement::location).collect()
    }

    pub fn open_jar_count(&self) -> usize {
        self.jars.len()
    }

    /// First element containing `name.class`, `name` in slashed form.
    pub fn location_for_class(&mut self, name: &str) -> Result<Option<PathBuf>> {
        for idx in 0..self.elements.len() {
            if self.element_contains(idx, name)? {
                return Ok(Some(self.elements[idx].location().to_path_buf()));
            }
        }
        Ok(None)
    }

    /// Every class reachable from this path, first occurrence wins.
    pub fn classes_on_path(&mut self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut res = Vec::new();
        for idx in 0..self.elements.len() {
            self.ensure_indexed(idx)?;
            let classes = match &self.elements[idx] {
                PathElement::Directory { classes, .. } | PathElement::Archive { classes, .. } => {
                    classes.as_ref()
                }
            };
            let mut names: Vec<&String> = classes.map(|c| c.iter().collect()).unwrap_or_default();
            names.sort();
            for name in names {
                if seen.insert(name.clone()) {
                    res.push(name.clone());
                }
            }
        }
        Ok(res)
    }

    /// Reads `name.class` from a directory or archive location.
    pub fn read_class_file(&mut self, name: &str, location: &Path) -> Result<Vec<u8>> {
        let file_name = class_file_name(name);
        if location.is_dir() {
            let path = location.join(&file_name);
            return std::fs::read(&path).map_err(|e| ClassError::io(path, e));
        }
        self.jars.read_entry(location, &file_name)
    }

    pub fn close(&mut self) {
        self.jars.clear();
    }

    fn element_contains(&mut self, idx: usize, name: &str) -> Result<bool> {
        self.ensure_indexed(idx)?;
        Ok(match &self.elements[idx] {
            PathElement::Directory { classes, .. } | PathElement::Archive { classes, .. } => {
                classes.as_ref().is_some_and(|c| c.contains(name))
            }
        })
    }

    fn ensure_indexed(&mut self, idx: usize) -> Result<()> {
        match &mut self.elements[idx] {
            PathElement::Directory { root, classes } => {
                if classes.is_none() {
                    *classes = Some(index_directory(root));
                }
            }
            PathElement::Archive { path, classes } => {
                if classes.is_none() {
                    let listed = match self.jars.get(path) {
                        Ok(archive) => index_archive(archive),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping unreadable archive");
                            HashSet::new()
                        }
                    };
                    *classes = Some(listed);
                }
            }
        }
        Ok(())
    }
}

pub fn class_file_name(name: &str) -> String {
    format!("{name}.class")
}

fn index_directory(root: &Path) -> HashSet<String> {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    let mut classes = HashSet::new();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if !path.extension().is_some_and(|e| e == "class") {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            classes.insert(rel.trim_end_matches(".class").to_string());
        }
    }
    classes
}

fn index_archive(archive: &Archive) -> HashSet<String> {
    archive
        .file_names()
        .filter(|n| n.ends_with(".class"))
        .map(|n| n.trim_end_matches(".class").to_string())
        .collect()
}

struct JarPool {
    capacity: usize,
    open: VecDeque<(PathBuf, Archive)>,
}

impl JarPool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            open: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.open.len()
    }

    fn get(&mut self, path: &Path) -> Result<&mut Archive> {
        if let Some(pos) = self.open.iter().position(|(p, _)| p == path) {
            if let Some(entry) = self.open.remove(pos) {
                self.open.push_back(entry);
            }
        } else {
            let archive = open_archive(path)?;
            while self.open.len() >= self.capacity {
                if let Some((evicted, _)) = self.open.pop_front() {
                    debug!(path = %evicted.display(), "closing least recently used archive");
                }
            }
            self.open.push_back((path.to_path_buf(), archive));
        }
        let last = self.open.len() - 1;
        Ok(&mut self.open[last].1)
    }

    fn read_entry(&mut self, jar: &Path, entry: &str) -> Result<Vec<u8>> {
        let archive = self.get(jar)?;
        let mut file = match archive.by_name(entry) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(ClassError::MissingEntry {
                    path: jar.to_path_buf(),
                    entry: entry.to_string(),
                });
            }
            Err(e) => return Err(ClassError::jar(jar, e)),
        };

        let len = usize::try_from(file.size()).unwrap_or(0);
        let mut buf = vec![0u8; len];
        let mut ofs = 0usize;
        // the decompressor may hand back fewer bytes than asked for
        while ofs < len {
            let n = file.read(&mut buf[ofs..]).map_err(|e| ClassError::io(jar, e))?;
            if n == 0 {
                return Err(ClassError::io(
                    jar,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("entry {entry} truncated at {ofs} of {len} bytes"),
                    ),
                ));
            }
            ofs += n;
        }
        Ok(buf)
    }

    fn clear(&mut self) {
        self.open.clear();
    }
}

fn open_archive(path: &Path) -> Result<Archive> {
    let file = File::open(path).map_err(|e| ClassError::io(path, e))?;
    // SAFETY: The file is opened read-only and the mapping is owned by the archive
    // for as long as the archive is pooled.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| ClassError::io(path, e))?;
    ZipArchive::new(Cursor::new(mmap)).map_err(|e| ClassError::jar(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::FileOptions;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "class_repo_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn finds_classes_in_dirs_and_jars_in_order() -> anyhow::Result<()> {
        let base = temp_path("cp_order");
        let dir = base.join("classes");
        std::fs::create_dir_all(dir.join("org/example"))?;
        std::fs::write(dir.join("org/example/A.class"), b"from-dir")?;
        let jar = base.join("lib.jar");
        write_jar(
            &jar,
            &[
                ("org/example/A.class", b"from-jar"),
                ("org/example/B.class", b"b-bytes"),
                ("META-INF/MANIFEST.MF", b""),
            ],
        )?;

        let mut cp = ClassPath::new(vec![dir.clone(), base.join("missing"), jar.clone()], 4);
        assert_eq!(cp.elements().len(), 2);
        assert_eq!(cp.location_for_class("org/example/A")?, Some(dir.clone()));
        assert_eq!(cp.location_for_class("org/example/B")?, Some(jar.clone()));
        assert_eq!(cp.location_for_class("org/example/C")?, None);

        assert_eq!(cp.read_class_file("org/example/A", &dir)?, b"from-dir");
        assert_eq!(cp.read_class_file("org/example/A", &jar)?, b"from-jar");
        assert_eq!(
            cp.classes_on_path()?,
            vec!["org/example/A".to_string(), "org/example/B".to_string()]
        );

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn class_path_string_resolves_relative_elements() -> anyhow::Result<()> {
        let base = temp_path("cp_string");
        std::fs::create_dir_all(base.join("classes/p"))?;
        std::fs::write(base.join("classes/p/Q.class"), b"q")?;
        write_jar(&base.join("lib/dep.jar"), &[("p/R.class", b"r")])?;

        let mut cp = ClassPath::from_class_path("classes:lib/dep.jar;gone", &base, 2);
        assert_eq!(
            cp.elements(),
            vec![base.join("classes").as_path(), base.join("lib/dep.jar").as_path()]
        );
        assert_eq!(cp.location_for_class("p/Q")?, Some(base.join("classes")));
        assert_eq!(cp.location_for_class("p/R")?, Some(base.join("lib/dep.jar")));

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn missing_jar_entry_names_the_archive() -> anyhow::Result<()> {
        let base = temp_path("cp_missing");
        let jar = base.join("a.jar");
        write_jar(&jar, &[("x/Y.class", b"y")])?;

        let mut cp = ClassPath::new(vec![jar.clone()], 2);
        match cp.read_class_file("x/Z", &jar) {
            Err(ClassError::MissingEntry { path, entry }) => {
                assert_eq!(path, jar);
                assert_eq!(entry, "x/Z.class");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn jar_pool_closes_least_recently_used() -> anyhow::Result<()> {
        let base = temp_path("cp_pool");
        let a = base.join("a.jar");
        let b = base.join("b.jar");
        write_jar(&a, &[("p/A.class", b"a")])?;
        write_jar(&b, &[("p/B.class", b"b")])?;

        let mut cp = ClassPath::new(vec![a.clone(), b.clone()], 1);
        assert_eq!(cp.read_class_file("p/A", &a)?, b"a");
        assert_eq!(cp.read_class_file("p/B", &b)?, b"b");
        assert_eq!(cp.open_jar_count(), 1);
        assert_eq!(cp.read_class_file("p/A", &a)?, b"a");
        assert_eq!(cp.open_jar_count(), 1);

        cp.close();
        assert_eq!(cp.open_jar_count(), 0);

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }
}
