//! Session settings: cache sizes and the target VM's class paths, read from JSON
//! with defaults for anything left out.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ClassError, Result};

pub const DEFAULT_BYTE_CACHE_CAPACITY: usize = 877;
pub const DEFAULT_JAR_POOL_CAPACITY: usize = 16;
pub const DEFAULT_PRELOAD_BATCH_LIMIT: usize = 100;

/// Per-session settings for a [`ClassRegistry`](crate::registry::ClassRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Slots in the LRU byte cache.
    pub byte_cache_capacity: usize,
    /// Open archive handles kept at once.
    pub jar_pool_capacity: usize,
    /// Upper bound on VM-supplied classes fetched in one round trip.
    pub preload_batch_limit: usize,
    pub working_dir: Option<PathBuf>,
    pub class_paths: ClassPaths,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            byte_cache_capacity: DEFAULT_BYTE_CACHE_CAPACITY,
            jar_pool_capacity: DEFAULT_JAR_POOL_CAPACITY,
            preload_batch_limit: DEFAULT_PRELOAD_BATCH_LIMIT,
            working_dir: None,
            class_paths: ClassPaths::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(text).map_err(|e| ClassError::Config {
                message: e.to_string(),
            })?;
        Ok(config.sanitized())
    }

    fn sanitized(mut self) -> Self {
        self.byte_cache_capacity = self.byte_cache_capacity.max(4);
        self.jar_pool_capacity = self.jar_pool_capacity.max(1);
        self.preload_batch_limit = self.preload_batch_limit.max(1);
        self
    }

    /// Final search order for on-disk lookups.
    pub fn class_path_elements(&self) -> Vec<PathBuf> {
        let working_dir = self
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        self.class_paths.assemble(&working_dir)
    }
}

/// The target VM's user, extension and boot class paths, as separator-delimited strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassPaths {
    pub user: String,
    pub extension: String,
    pub boot: String,
}

impl ClassPaths {
    /// Boot elements first, then every archive found in the extension directories,
    /// then the user class path.
    pub fn assemble(&self, working_dir: &Path) -> Vec<PathBuf> {
        let mut elements = path_components(&self.boot, working_dir);

        for dir in path_components(&self.extension, working_dir) {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut jars: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_archive(p))
                .collect();
            jars.sort();
            elements.extend(jars);
        }

        elements.extend(path_components(&self.user, working_dir));
        elements
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"))
}

/// Splits a class path on `;` and `:`, leaving `C:\`-style drive prefixes intact,
/// and resolves relative components against `working_dir`.
pub fn path_components(path: &str, working_dir: &Path) -> Vec<PathBuf> {
    split_class_path(path)
        .into_iter()
        .map(|c| {
            let p = PathBuf::from(c);
            if p.is_absolute() || is_drive_path(c) {
                p
            } else {
                working_dir.join(p)
            }
        })
        .collect()
}

fn split_class_path(path: &str) -> Vec<&str> {
    let bytes = path.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        let is_sep = match b {
            b';' => true,
            b':' => !(i == start + 1
                && bytes[start].is_ascii_alphabetic()
                && matches!(bytes.get(i + 1), Some(b'\\') | Some(b'/'))),
            _ => false,
        };
        if is_sep {
            parts.push(&path[start..i]);
            start = i + 1;
        }
    }
    parts.push(&path[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_drive_path(c: &str) -> bool {
    let b = c.as_bytes();
    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && matches!(b[2], b'\\' | b'/')
}
