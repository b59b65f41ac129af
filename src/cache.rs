//! In-memory class file byte caches.
//!
//! [`ClassByteCache`] is a fixed-capacity, open-addressing LRU over bytes read from
//! disk. [`VmSuppliedCache`] holds bytes pushed (or promised) by the target VM and
//! fetches promised entries in batches. [`ClassFileCache`] routes a request to the
//! right one by [`ClassLocation`].

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::classpath::ClassPath;
use crate::client::TargetClient;
use crate::error::{ClassError, Result};
use crate::loader::{ClassLoaderGraph, LoaderId};

/// Where the bytes of a class came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClassLocation {
    /// Pushed by the target VM, held under this loader id.
    VmSupplied(LoaderId),
    /// A class path directory or archive.
    Path(PathBuf),
}

impl ClassLocation {
    pub fn is_vm_supplied(&self) -> bool {
        matches!(self, ClassLocation::VmSupplied(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ClassLocation::Path(p) => Some(p),
            ClassLocation::VmSupplied(_) => None,
        }
    }
}

impl fmt::Display for ClassLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLocation::VmSupplied(loader) => write!(f, "<VM_SUPPLIED>{loader}"),
            ClassLocation::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

pub fn cache_key(name: &str, location: &ClassLocation) -> String {
    format!("{name}#{location}")
}

#[derive(Debug)]
struct Slot {
    key: String,
    bytes: Arc<[u8]>,
    stamp: u64,
}

/// Fixed-capacity LRU keyed by `"name#location"`.
#[derive(Debug)]
pub struct ClassByteCache {
    slots: Vec<Option<Slot>>,
    size: usize,
    clock: u64,
}

impl ClassByteCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(4);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            size: 0,
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Never touches the disk. A hit refreshes the entry's timestamp.
    pub fn get(&mut self, key: &str) -> Option<Arc<[u8]>> {
        let idx = self.find(key)?;
        self.clock += 1;
        let clock = self.clock;
        let slot = self.slots[idx].as_mut()?;
        slot.stamp = clock;
        Some(Arc::clone(&slot.bytes))
    }

    pub fn put(&mut self, key: String, bytes: Arc<[u8]>) {
        self.clock += 1;
        if let Some(idx) = self.find(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.bytes = bytes;
                slot.stamp = self.clock;
            }
            return;
        }

        if self.size > self.capacity() * 3 / 4 {
            self.evict_oldest();
        }

        let mut idx = self.home(&key);
        while self.slots[idx].is_some() {
            idx = (idx + 1) % self.capacity();
        }
        self.slots[idx] = Some(Slot {
            key,
            bytes,
            stamp: self.clock,
        });
        self.size += 1;
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<[u8]>> {
        let idx = self.find(key)?;
        let slot = self.slots[idx].take()?;
        self.size -= 1;
        self.close_gap(idx);
        Some(slot.bytes)
    }

    /// Loads `name.class` from a class path element, then caches it.
    pub fn read_and_put(
        &mut self,
        name: &str,
        location: &Path,
        class_path: &mut ClassPath,
    ) -> Result<Arc<[u8]>> {
        let bytes: Arc<[u8]> = class_path.read_class_file(name, location)?.into();
        let key = cache_key(name, &ClassLocation::Path(location.to_path_buf()));
        self.put(key, Arc::clone(&bytes));
        Ok(bytes)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.size = 0;
        self.clock = 0;
    }

    fn home(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.capacity() as u64) as usize
    }

    fn find(&self, key: &str) -> Option<usize> {
        let cap = self.capacity();
        let mut idx = self.home(key);
        for _ in 0..cap {
            match &self.slots[idx] {
                None => return None,
                Some(slot) if slot.key == key => return Some(idx),
                Some(_) => idx = (idx + 1) % cap,
            }
        }
        None
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.stamp)))
            .min_by_key(|&(_, stamp)| stamp)
            .map(|(i, _)| i);

        if let Some(idx) = oldest
            && let Some(slot) = self.slots[idx].take()
        {
            debug!(key = %slot.key, "evicting class bytes");
            self.size -= 1;
            self.close_gap(idx);
        }
    }

    // Backward-shift deletion: pull later members of the probe run into the hole
    // so that lookups never stop early at an empty slot.
    fn close_gap(&mut self, mut hole: usize) {
        let cap = self.capacity();
        let mut j = hole;
        loop {
            j = (j + 1) % cap;
            let home = match &self.slots[j] {
                None => break,
                Some(slot) => self.home(&slot.key),
            };
            let stays = if hole <= j {
                hole < home && home <= j
            } else {
                hole < home || home <= j
            };
            if !stays {
                self.slots[hole] = self.slots[j].take();
                hole = j;
            }
        }
    }
}

/// Bytes supplied by the target VM, keyed by `(name, loader id)`.
///
/// An empty entry means the VM reported the class but its bytes have not been
/// transferred yet. Asking for one triggers a single bulk fetch of up to
/// `batch_limit` pending entries, starting with the requested one.
#[derive(Debug)]
pub struct VmSuppliedCache {
    entries: HashMap<(String, LoaderId), Arc<[u8]>>,
    batch_limit: usize,
}

impl VmSuppliedCache {
    pub fn new(batch_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            batch_limit: batch_limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|b| b.is_empty()).count()
    }

    /// Empty `bytes` registers a not-yet-fetched entry without clobbering real bytes.
    pub fn add(&mut self, name: &str, loader: LoaderId, bytes: Vec<u8>) {
        let key = (name.to_string(), loader);
        if bytes.is_empty() && self.entries.contains_key(&key) {
            return;
        }
        self.entries.insert(key, bytes.into());
    }

    pub fn preload(&mut self, names: &[String], loaders: &[LoaderId]) {
        for (name, &loader) in names.iter().zip(loaders) {
            self.add(name, loader, Vec::new());
        }
    }

    /// The loader, walking up from `loader`, that holds an entry for `name`.
    pub fn has_vm_supplied(
        &self,
        name: &str,
        loader: LoaderId,
        graph: &ClassLoaderGraph,
    ) -> Option<LoaderId> {
        let mut key = (name.to_string(), loader);
        for l in graph.ancestry(loader) {
            key.1 = l;
            if self.entries.contains_key(&key) {
                return Some(l);
            }
        }
        None
    }

    pub fn bytes(
        &mut self,
        name: &str,
        loader: LoaderId,
        client: Option<&dyn TargetClient>,
    ) -> Result<Option<Arc<[u8]>>> {
        let key = (name.to_string(), loader);
        let Some(bytes) = self.entries.get(&key) else {
            return Ok(None);
        };
        if !bytes.is_empty() {
            return Ok(Some(Arc::clone(bytes)));
        }
        let Some(client) = client else {
            trace!(class = name, loader, "pending VM bytes but no target connection");
            return Ok(None);
        };

        self.fetch_pending(&key, client)?;
        Ok(self.entries.get(&key).map(Arc::clone))
    }

    fn fetch_pending(&mut self, first: &(String, LoaderId), client: &dyn TargetClient) -> Result<()> {
        let mut batch = vec![first.clone()];
        batch.extend(
            self.entries
                .iter()
                .filter(|(k, v)| v.is_empty() && *k != first)
                .map(|(k, _)| k.clone())
                .take(self.batch_limit - 1),
        );

        let names: Vec<String> = batch.iter().map(|(n, _)| n.clone()).collect();
        let loaders: Vec<LoaderId> = batch.iter().map(|&(_, l)| l).collect();
        debug!(count = batch.len(), first = %first.0, "fetching class bytes from target VM");

        let fetched = client
            .bytes_for(&names, &loaders)
            .map_err(ClassError::from_client)?;

        for (i, key) in batch.into_iter().enumerate() {
            match fetched.get(i) {
                Some(bytes) if !bytes.is_empty() => {
                    self.entries.insert(key, bytes.as_slice().into());
                }
                _ => {
                    self.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Both byte caches behind one lookup.
#[derive(Debug)]
pub struct ClassFileCache {
    pub bytes: ClassByteCache,
    pub vm: VmSuppliedCache,
}

impl ClassFileCache {
    pub fn new(capacity: usize, batch_limit: usize) -> Self {
        Self {
            bytes: ClassByteCache::new(capacity),
            vm: VmSuppliedCache::new(batch_limit),
        }
    }

    pub fn class_file_bytes(
        &mut self,
        name: &str,
        location: &ClassLocation,
        class_path: Option<&mut ClassPath>,
        client: Option<&dyn TargetClient>,
    ) -> Result<Option<Arc<[u8]>>> {
        match location {
            ClassLocation::VmSupplied(loader) => self.vm.bytes(name, *loader, client),
            ClassLocation::Path(path) => {
                if let Some(bytes) = self.bytes.get(&cache_key(name, location)) {
                    return Ok(Some(bytes));
                }
                match class_path {
                    Some(cp) => self.bytes.read_and_put(name, path, cp).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.vm.clear();
    }
}
