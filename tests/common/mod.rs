#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "class_repo_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

pub fn write_file(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

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

pub struct Method<'a> {
    pub name: &'a str,
    pub signature: &'a str,
    pub code: &'a [u8],
    pub lines: &'a [(u16, u16)],
}

/// A class file with the given public methods and InnerClasses entries.
pub fn class_file(name: &str, methods: &[Method<'_>], inner: &[(&str, Option<&str>)]) -> Vec<u8> {
    let mut cp = Pool::default();
    let this = cp.class(name);
    let sup = cp.class("java/lang/Object");
    let code_name = cp.utf8("Code");
    let lnt_name = cp.utf8("LineNumberTable");

    let mut methods_out = Vec::new();
    for m in methods {
        let n = cp.utf8(m.name);
        let s = cp.utf8(m.signature);
        methods_out.extend_from_slice(&0x0001u16.to_be_bytes());
        methods_out.extend_from_slice(&n.to_be_bytes());
        methods_out.extend_from_slice(&s.to_be_bytes());
        methods_out.extend_from_slice(&1u16.to_be_bytes());

        let mut code = Vec::new();
        code.extend_from_slice(&2u16.to_be_bytes());
        code.extend_from_slice(&2u16.to_be_bytes());
        code.extend_from_slice(&(m.code.len() as u32).to_be_bytes());
        code.extend_from_slice(m.code);
        code.extend_from_slice(&0u16.to_be_bytes());
        if m.lines.is_empty() {
            code.extend_from_slice(&0u16.to_be_bytes());
        } else {
            code.extend_from_slice(&1u16.to_be_bytes());
            let mut lnt = (m.lines.len() as u16).to_be_bytes().to_vec();
            for (pc, line) in m.lines {
                lnt.extend_from_slice(&pc.to_be_bytes());
                lnt.extend_from_slice(&line.to_be_bytes());
            }
            attr(&mut code, lnt_name, &lnt);
        }
        attr(&mut methods_out, code_name, &code);
    }

    let mut attrs = Vec::new();
    let mut attr_count = 0u16;
    if !inner.is_empty() {
        let ic = cp.utf8("InnerClasses");
        let mut body = (inner.len() as u16).to_be_bytes().to_vec();
        for (full, simple) in inner {
            let full = cp.class(full);
            let simple = simple.map(|s| cp.utf8(s)).unwrap_or(0);
            body.extend_from_slice(&full.to_be_bytes());
            body.extend_from_slice(&this.to_be_bytes());
            body.extend_from_slice(&simple.to_be_bytes());
            body.extend_from_slice(&0u16.to_be_bytes());
        }
        attr(&mut attrs, ic, &body);
        attr_count += 1;
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&52u16.to_be_bytes());
    out.extend_from_slice(&cp.next.to_be_bytes());
    out.extend_from_slice(&cp.bytes);
    out.extend_from_slice(&0x0021u16.to_be_bytes());
    out.extend_from_slice(&this.to_be_bytes());
    out.extend_from_slice(&sup.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
    out.extend_from_slice(&methods_out);
    out.extend_from_slice(&attr_count.to_be_bytes());
    out.extend_from_slice(&attrs);
    out
}

pub fn empty_class(name: &str) -> Vec<u8> {
    class_file(name, &[], &[])
}

fn attr(out: &mut Vec<u8>, name: u16, body: &[u8]) {
    out.extend_from_slice(&name.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}

struct Pool {
    bytes: Vec<u8>,
    next: u16,
    utf8s: HashMap<String, u16>,
    classes: HashMap<String, u16>,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            bytes: Vec::new(),
            next: 1,
            utf8s: HashMap::new(),
            classes: HashMap::new(),
        }
    }
}

impl Pool {
    fn utf8(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.utf8s.get(s) {
            return idx;
        }
        self.bytes.push(1);
        self.bytes.extend_from_slice(&(s.len() as u16).to_be_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        let idx = self.next;
        self.next += 1;
        self.utf8s.insert(s.to_string(), idx);
        idx
    }

    fn class(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.classes.get(name) {
            return idx;
        }
        let name_idx = self.utf8(name);
        self.bytes.push(7);
        self.bytes.extend_from_slice(&name_idx.to_be_bytes());
        let idx = self.next;
        self.next += 1;
        self.classes.insert(name.to_string(), idx);
        idx
    }
}
