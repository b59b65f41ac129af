//! Session-wide map from class name to the records known for it, one per
//! compatible class loader.
//!
//! A name usually maps to a single entry. When classes of the same name are
//! loaded by loaders that cannot see each other, they coexist in one
//! [`SameNameGroup`] and a query picks the entry its loader can resolve.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::cache::{ClassFileCache, ClassLocation};
use crate::classpath::ClassPath;
use crate::client::TargetClient;
use crate::config::SessionConfig;
use crate::dynamic::DynamicClass;
use crate::error::{ClassError, Result};
use crate::loader::{ClassLoaderGraph, LoaderId, NO_LOADER, ROOT_LOADER};
use crate::opcodes::{is_goto, is_return};
use crate::reader::parse_class;
use crate::record::{LineLookup, previous_bci};

/// Stand-in for a class whose bytes have not been looked at yet. Whatever the
/// planner records on it moves to the real class when that gets resolved.
#[derive(Debug)]
pub struct Placeholder {
    name: String,
    loader_id: AtomicI32,
    data: Mutex<PlaceholderData>,
}

#[derive(Debug, Default)]
struct PlaceholderData {
    all_methods_roots: bool,
    all_methods_markers: bool,
    subclasses: Vec<Weak<DynamicClass>>,
}

impl Placeholder {
    fn new(name: &str, loader_id: LoaderId) -> Self {
        Self {
            name: name.to_string(),
            loader_id: AtomicI32::new(loader_id),
            data: Mutex::new(PlaceholderData::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader_id.load(Ordering::Acquire)
    }

    fn narrow_loader(&self, loader: LoaderId) {
        self.loader_id.store(loader, Ordering::Release);
    }

    pub fn set_all_methods_roots(&self) {
        self.data.lock().all_methods_roots = true;
    }

    pub fn all_methods_roots(&self) -> bool {
        self.data.lock().all_methods_roots
    }

    pub fn set_all_methods_markers(&self) {
        self.data.lock().all_methods_markers = true;
    }

    pub fn all_methods_markers(&self) -> bool {
        self.data.lock().all_methods_markers
    }

    pub fn add_subclass(&self, sub: &Arc<DynamicClass>) {
        let weak = Arc::downgrade(sub);
        let mut data = self.data.lock();
        if !data.subclasses.iter().any(|s| s.ptr_eq(&weak)) {
            data.subclasses.push(weak);
        }
    }

    pub fn subclasses(&self) -> Vec<Arc<DynamicClass>> {
        self.data
            .lock()
            .subclasses
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn transfer_into(&self, class: &DynamicClass) {
        let mut data = self.data.lock();
        let subclasses = std::mem::take(&mut data.subclasses);
        class.adopt(data.all_methods_roots, data.all_methods_markers, subclasses);
    }
}

/// Array and other classes that never have a class file.
#[derive(Debug)]
pub struct SpecialClass {
    name: String,
}

impl SpecialClass {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader_id(&self) -> LoaderId {
        ROOT_LOADER
    }
}

#[derive(Debug, Clone)]
pub enum ClassEntry {
    Class(Arc<DynamicClass>),
    Placeholder(Arc<Placeholder>),
    Special(Arc<SpecialClass>),
}

impl ClassEntry {
    pub fn name(&self) -> &str {
        match self {
            ClassEntry::Class(c) => c.name(),
            ClassEntry::Placeholder(p) => p.name(),
            ClassEntry::Special(s) => s.name(),
        }
    }

    pub fn loader_id(&self) -> LoaderId {
        match self {
            ClassEntry::Class(c) => c.loader_id(),
            ClassEntry::Placeholder(p) => p.loader_id(),
            ClassEntry::Special(s) => s.loader_id(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, ClassEntry::Placeholder(_))
    }

    pub fn as_class(&self) -> Option<&Arc<DynamicClass>> {
        match self {
            ClassEntry::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_placeholder(&self) -> Option<&Arc<Placeholder>> {
        match self {
            ClassEntry::Placeholder(p) => Some(p),
            _ => None,
        }
    }

    fn same_as(&self, other: &ClassEntry) -> bool {
        match (self, other) {
            (ClassEntry::Class(a), ClassEntry::Class(b)) => Arc::ptr_eq(a, b),
            (ClassEntry::Placeholder(a), ClassEntry::Placeholder(b)) => Arc::ptr_eq(a, b),
            (ClassEntry::Special(a), ClassEntry::Special(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Every entry registered under one name, in registration order.
#[derive(Debug, Clone, Default)]
pub struct SameNameGroup {
    entries: Vec<ClassEntry>,
}

impl SameNameGroup {
    pub fn entries(&self) -> &[ClassEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn add(&mut self, entry: ClassEntry) {
        if !self.entries.iter().any(|e| e.same_as(&entry)) {
            self.entries.push(entry);
        }
    }

    fn remove(&mut self, old: &ClassEntry) {
        self.entries.retain(|e| !e.same_as(old));
    }

    fn replace(&mut self, old: &ClassEntry, new: ClassEntry) {
        match self.entries.iter().position(|e| e.same_as(old)) {
            Some(pos) => self.entries[pos] = new,
            None => self.entries.push(new),
        }
    }
}

/// A bytecode range inside one method, as needed to inject code for a source region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    pub class_name: String,
    pub method_name: String,
    pub method_signature: String,
    pub bci0: u32,
    pub bci1: u32,
}

struct Inner {
    classes: HashMap<String, SameNameGroup>,
    loaders: ClassLoaderGraph,
    files: ClassFileCache,
    class_path: Option<ClassPath>,
    not_found: HashSet<String>,
    defining_loaders: HashMap<(String, LoaderId), LoaderId>,
    unavailable: HashSet<(String, LoaderId)>,
}

/// Class registry for one profiling session. Cloning shares the session.
#[derive(Clone)]
pub struct ClassRegistry {
    config: Arc<SessionConfig>,
    client: Option<Arc<dyn TargetClient>>,
    inner: Arc<Mutex<Inner>>,
}

impl ClassRegistry {
    pub fn new(config: SessionConfig) -> Self {
        let files = ClassFileCache::new(config.byte_cache_capacity, config.preload_batch_limit);
        Self {
            config: Arc::new(config),
            client: None,
            inner: Arc::new(Mutex::new(Inner {
                classes: HashMap::new(),
                loaders: ClassLoaderGraph::new(),
                files,
                class_path: None,
                not_found: HashSet::new(),
                defining_loaders: HashMap::new(),
                unavailable: HashSet::new(),
            })),
        }
    }

    pub fn with_client(mut self, client: Arc<dyn TargetClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Indexes the configured class path; before this, nothing is looked up on disk.
    /// Misses and parse failures remembered against the old path are forgotten.
    pub fn init_class_paths(&self) {
        let elements = self.config.class_path_elements();
        debug!(elements = elements.len(), "initializing class path");
        let class_path = ClassPath::new(elements, self.config.jar_pool_capacity);
        let mut inner = self.inner.lock();
        if let Some(old) = inner.class_path.as_mut() {
            old.close();
        }
        inner.class_path = Some(class_path);
        inner.files.bytes.clear();
        inner.not_found.clear();
        inner.unavailable.clear();
    }

    // ---- loader table ----

    pub fn init_loader_table(&self, parents: &[LoaderId]) {
        self.inner.lock().loaders = ClassLoaderGraph::from_table(parents);
    }

    pub fn add_child_and_parent(&self, child: LoaderId, parent: LoaderId) {
        self.inner.lock().loaders.add_child_and_parent(child, parent);
    }

    pub fn parent_loader(&self, loader: LoaderId) -> Option<LoaderId> {
        self.inner.lock().loaders.parent_of(loader)
    }

    // ---- lookups ----

    /// The real class `name` as seen from `loader`, loading it if needed. A
    /// compatible placeholder is promoted in place. `Ok(None)` when the class is
    /// nowhere to be found, or failed to parse on an earlier attempt.
    pub fn lookup_class(&self, name: &str, loader: LoaderId) -> Result<Option<Arc<DynamicClass>>> {
        let name = canonical_name(name);
        let loader = normalize_loader(loader);
        let client = self.client.as_deref();
        self.inner.lock().lookup_class(&name, loader, client)
    }

    /// A compatible class or placeholder, creating a placeholder without any I/O
    /// when nothing fits.
    pub fn lookup_class_or_create_placeholder(&self, name: &str, loader: LoaderId) -> Result<ClassEntry> {
        let name = canonical_name(name);
        let loader = normalize_loader(loader);
        let client = self.client.as_deref();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.find_compatible(&name, loader, client, true)? {
            return Ok(entry);
        }
        let entry = ClassEntry::Placeholder(Arc::new(Placeholder::new(&name, loader)));
        trace!(class = %name, loader, "created placeholder");
        inner.classes.entry(name).or_default().add(entry.clone());
        Ok(entry)
    }

    /// Only what is already registered; never loads and never creates placeholders.
    pub fn lookup_loaded(
        &self,
        name: &str,
        loader: LoaderId,
        allow_placeholder: bool,
    ) -> Result<Option<ClassEntry>> {
        let name = canonical_name(name);
        let loader = normalize_loader(loader);
        let client = self.client.as_deref();
        self.inner
            .lock()
            .find_compatible(&name, loader, client, allow_placeholder)
    }

    /// Array classes and the like, created at the root loader on first request.
    pub fn lookup_special(&self, name: &str) -> Arc<SpecialClass> {
        let name = canonical_name(name);
        let mut inner = self.inner.lock();
        let group = inner.classes.entry(name.clone()).or_default();
        if let Some(ClassEntry::Special(s)) = group.entries.iter().find(|e| matches!(e, ClassEntry::Special(_))) {
            return Arc::clone(s);
        }
        let special = Arc::new(SpecialClass { name });
        group.add(ClassEntry::Special(Arc::clone(&special)));
        special
    }

    /// Registers a placeholder at exactly `loader`, reusing one already there.
    pub fn add_placeholder(&self, name: &str, loader: LoaderId) -> Arc<Placeholder> {
        let name = canonical_name(name);
        let loader = normalize_loader(loader);
        let mut inner = self.inner.lock();
        let group = inner.classes.entry(name.clone()).or_default();
        let existing = group
            .entries
            .iter()
            .filter_map(ClassEntry::as_placeholder)
            .find(|p| p.loader_id() == loader);
        if let Some(p) = existing {
            return Arc::clone(p);
        }
        let placeholder = Arc::new(Placeholder::new(&name, loader));
        group.add(ClassEntry::Placeholder(Arc::clone(&placeholder)));
        placeholder
    }

    pub fn all_versions(&self, name: &str) -> Vec<ClassEntry> {
        let name = canonical_name(name);
        self.inner
            .lock()
            .classes
            .get(&name)
            .map(|g| g.entries.clone())
            .unwrap_or_default()
    }

    /// Visits a snapshot of every registered entry; `f` may call back into the registry.
    pub fn for_each_class(&self, mut f: impl FnMut(&ClassEntry)) {
        let snapshot: Vec<ClassEntry> = self
            .inner
            .lock()
            .classes
            .values()
            .flat_map(|g| g.entries.iter().cloned())
            .collect();
        snapshot.iter().for_each(|e| f(e));
    }

    pub fn class_count(&self) -> usize {
        self.inner.lock().classes.values().map(SameNameGroup::len).sum()
    }

    // ---- VM-supplied bytes ----

    pub fn add_vm_supplied(&self, name: &str, loader: LoaderId, bytes: Vec<u8>) {
        let name = canonical_name(name);
        self.inner.lock().files.vm.add(&name, loader, bytes);
    }

    /// Announces classes the VM can deliver; their bytes come in one batch on first use.
    pub fn preload_bytecode(&self, names: &[String], loaders: &[LoaderId]) {
        let names: Vec<String> = names.iter().map(|n| canonical_name(n)).collect();
        debug!(count = names.len(), "registering classes for batch preload");
        self.inner.lock().files.vm.preload(&names, loaders);
    }

    pub fn defining_loader_id(&self, name: &str, loader: LoaderId) -> Result<LoaderId> {
        let name = canonical_name(name);
        let client = self.client.as_deref();
        self.inner.lock().defining_loader(&name, loader, client)
    }

    // ---- hierarchy ----

    /// Links `class` to its super class and interfaces, loading them as needed. A
    /// super class that cannot be loaded yet gets a placeholder remembering `class`,
    /// so the link is made when the super class turns up.
    pub fn resolve_hierarchy(&self, class: &Arc<DynamicClass>) -> Result<()> {
        let loader = class.loader_id();
        if let Some(sup) = class.record().super_name() {
            match self.lookup_class(sup, loader)? {
                Some(sup) => {
                    sup.add_subclass(class);
                    class.set_super_class(Some(sup));
                }
                None => {
                    if let ClassEntry::Placeholder(p) = self.lookup_class_or_create_placeholder(sup, loader)? {
                        trace!(class = class.name(), super_class = sup, "super class pending");
                        p.add_subclass(class);
                    }
                }
            }
        }
        for iface in class.record().interfaces() {
            if let Some(iface) = self.lookup_class(iface, loader)? {
                class.add_interface(iface);
            }
        }
        Ok(())
    }

    // ---- source regions ----

    /// The method and bytecode range covering source lines `start..=end` of
    /// `class` or one of its nested classes.
    pub fn method_for_source_region(
        &self,
        class: &DynamicClass,
        start: u32,
        end: u32,
    ) -> Result<Option<CodeRegion>> {
        if start > end {
            return Ok(None);
        }
        let rec = class.record();
        let (method, bci0) = match rec.method_and_bci_for_line(start) {
            LineLookup::Found { method, bci } => (method, bci),
            LineLookup::NoDebugInfo => {
                return Err(ClassError::NoDebugInfo {
                    class: rec.name().to_string(),
                });
            }
            LineLookup::NotFound => return self.region_in_nested_classes(class, start, end),
        };
        let Some(entry) = rec.method(method) else {
            return Ok(None);
        };

        // initializer tables can cover lines that belong to nested class bodies
        if entry.is_initializer() {
            if let Some(region) = self.region_in_nested_classes(class, start, end)? {
                return Ok(Some(region));
            }
        }

        let mut end = end;
        if rec.min_max_lines(method).is_some_and(|(_, max)| end <= u32::from(max)) {
            end += 1;
        }

        let bci1 = match rec.method_and_bci_for_line(end) {
            LineLookup::Found { method: m, bci } if m == method => bci,
            LineLookup::Found { .. } => return Ok(None),
            _ => {
                // past the table: the last instruction, a return or goto
                let body = class.method_bytecode(method)?;
                let code: &[u8] = body.as_deref().unwrap_or_default();
                let last = previous_bci(code, code.len());
                if !code.get(last).is_some_and(|&op| is_return(op) || is_goto(op)) {
                    trace!(class = rec.name(), method = %entry.name, bci = last, "method does not end in return or goto");
                }
                last as u32
            }
        };

        let bci0 = (start + 1..end.saturating_sub(1))
            .filter_map(|line| rec.bci_for_line(method, line))
            .fold(bci0, u32::min);

        Ok(Some(CodeRegion {
            class_name: rec.name().to_string(),
            method_name: entry.name.clone(),
            method_signature: entry.signature.clone(),
            bci0,
            bci1,
        }))
    }

    fn region_in_nested_classes(
        &self,
        class: &DynamicClass,
        start: u32,
        end: u32,
    ) -> Result<Option<CodeRegion>> {
        let outer = class.name();
        for nested in class.record().nested_class_names() {
            if !(nested.starts_with(outer) && nested.len() > outer.len()) {
                continue;
            }
            let Some(nested) = self.lookup_class(nested, class.loader_id())? else {
                continue;
            };
            match self.method_for_source_region(&nested, start, end) {
                Ok(Some(region)) => return Ok(Some(region)),
                Ok(None) => {}
                // the outer class had tables, so a bare nested class is not the answer
                Err(ClassError::NoDebugInfo { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// The whole bytecode of one method as a region.
    pub fn method_min_max_bci(
        &self,
        class: &DynamicClass,
        name: &str,
        signature: &str,
    ) -> Result<Option<CodeRegion>> {
        let Some(idx) = class.record().method_index(name, signature) else {
            return Ok(None);
        };
        let len = class.bytecode_len(idx)?;
        Ok(Some(CodeRegion {
            class_name: class.name().to_string(),
            method_name: name.to_string(),
            method_signature: signature.to_string(),
            bci0: 0,
            bci1: len.saturating_sub(1) as u32,
        }))
    }

    // ---- class path and lifecycle ----

    pub fn classes_on_class_path(&self) -> Result<Vec<String>> {
        match self.inner.lock().class_path.as_mut() {
            Some(cp) => cp.classes_on_path(),
            None => Ok(Vec::new()),
        }
    }

    /// Forgets every class and cached byte, keeping the class path and loader table.
    pub fn clear_cache(&self) {
        let mut inner = self.inner.lock();
        inner.classes.clear();
        inner.files.clear();
        inner.not_found.clear();
        inner.defining_loaders.clear();
        inner.unavailable.clear();
        debug!("class registry cleared");
    }

    /// Ends the session: drops everything and closes pooled archive handles.
    pub fn cleanup(&self) {
        self.clear_cache();
        let mut inner = self.inner.lock();
        if let Some(mut cp) = inner.class_path.take() {
            cp.close();
        }
        inner.loaders.clear();
    }
}

impl Inner {
    fn lookup_class(
        &mut self,
        name: &str,
        loader: LoaderId,
        client: Option<&dyn TargetClient>,
    ) -> Result<Option<Arc<DynamicClass>>> {
        let placeholder = match self.find_compatible(name, loader, client, true)? {
            Some(ClassEntry::Class(c)) => return Ok(Some(c)),
            Some(ClassEntry::Special(_)) => return Ok(None),
            Some(p @ ClassEntry::Placeholder(_)) => Some(p),
            None => None,
        };

        let key = (name.to_string(), loader);
        if self.unavailable.contains(&key) {
            return Ok(None);
        }
        let class = match self.try_load_real(name, loader, client) {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(None),
            Err(e) => {
                if e.is_format() {
                    warn!(class = name, loader, error = %e, "class file is unusable");
                    self.unavailable.insert(key);
                }
                return Err(e);
            }
        };

        let group = self.classes.entry(name.to_string()).or_default();
        // disk loads land at the root, which may already hold this class
        let existing = group
            .entries
            .iter()
            .filter_map(ClassEntry::as_class)
            .find(|c| c.loader_id() == class.loader_id())
            .cloned();
        let reused = existing.is_some();
        let class = existing.unwrap_or(class);

        match placeholder {
            Some(old) => {
                if let Some(p) = old.as_placeholder() {
                    p.transfer_into(&class);
                }
                if reused {
                    group.remove(&old);
                } else {
                    group.replace(&old, ClassEntry::Class(Arc::clone(&class)));
                }
                link_adopted_subclasses(&class);
                debug!(class = name, loader, reused, "promoted placeholder to loaded class");
            }
            None => group.add(ClassEntry::Class(Arc::clone(&class))),
        }
        Ok(Some(class))
    }

    /// Compatibility of a stored entry at loader L with a query at Q: same loader,
    /// or L an ancestor of Q. A placeholder below Q is narrowed to Q. Failing
    /// those, the entry at Q's defining loader for `name`.
    fn find_compatible(
        &mut self,
        name: &str,
        loader: LoaderId,
        client: Option<&dyn TargetClient>,
        allow_placeholders: bool,
    ) -> Result<Option<ClassEntry>> {
        let Some(group) = self.classes.get(name) else {
            return Ok(None);
        };
        let candidates: Vec<ClassEntry> = group
            .entries
            .iter()
            .filter(|e| allow_placeholders || !e.is_placeholder())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let direct = candidates.iter().find(|e| {
            let l = e.loader_id();
            l == loader || self.loaders.is_ancestor(l, loader)
        });
        if let Some(e) = direct {
            return Ok(Some(e.clone()));
        }

        for e in &candidates {
            if let ClassEntry::Placeholder(p) = e {
                if self.loaders.is_ancestor(loader, p.loader_id()) {
                    p.narrow_loader(loader);
                    return Ok(Some(e.clone()));
                }
            }
        }

        let defining = self.defining_loader(name, loader, client)?;
        if defining == NO_LOADER {
            return Ok(None);
        }
        Ok(candidates.into_iter().find(|e| e.loader_id() == defining))
    }

    fn defining_loader(
        &mut self,
        name: &str,
        loader: LoaderId,
        client: Option<&dyn TargetClient>,
    ) -> Result<LoaderId> {
        let key = (name.to_string(), loader);
        if let Some(&d) = self.defining_loaders.get(&key) {
            return Ok(d);
        }
        let defining = match client {
            None => NO_LOADER,
            Some(client) => match client.defining_loader_id(name, loader) {
                Ok(d) => d,
                Err(e) => {
                    let e = ClassError::from_client(e);
                    if e.is_target_terminated() {
                        return Err(e);
                    }
                    debug!(class = name, loader, error = %e, "defining loader lookup failed");
                    NO_LOADER
                }
            },
        };
        self.defining_loaders.insert(key, defining);
        Ok(defining)
    }

    /// VM-supplied bytes at `loader` and each of its ancestors, the class path at
    /// the root, and finally whatever the defining loader can offer.
    fn try_load_real(
        &mut self,
        name: &str,
        loader: LoaderId,
        client: Option<&dyn TargetClient>,
    ) -> Result<Option<Arc<DynamicClass>>> {
        let ancestry: Vec<LoaderId> = self.loaders.ancestry(loader).collect();
        for &l in &ancestry {
            if let Some(class) = self.load_at(name, l, client)? {
                trace!(class = name, loader, found_at = l, "loaded via loader chain");
                return Ok(Some(class));
            }
            if l == ROOT_LOADER {
                break;
            }
        }

        let defining = self.defining_loader(name, loader, client)?;
        if defining != NO_LOADER && !ancestry.contains(&defining) {
            if let Some(class) = self.load_at(name, defining, client)? {
                trace!(class = name, loader, defining, "loaded via defining loader");
                return Ok(Some(class));
            }
        }

        if self.not_found.insert(name.to_string()) {
            warn!(class = name, loader, "class not found anywhere");
        }
        Ok(None)
    }

    fn load_at(
        &mut self,
        name: &str,
        loader: LoaderId,
        client: Option<&dyn TargetClient>,
    ) -> Result<Option<Arc<DynamicClass>>> {
        if let Some(holder) = self.files.vm.has_vm_supplied(name, loader, &self.loaders) {
            if let Some(bytes) = self.files.vm.bytes(name, holder, client)? {
                let record = parse_named(name, bytes)?;
                let location = ClassLocation::VmSupplied(holder);
                return Ok(Some(Arc::new(DynamicClass::new(record, loader, location))));
            }
        }

        if loader != ROOT_LOADER && loader != NO_LOADER {
            return Ok(None);
        }
        let Some(class_path) = self.class_path.as_mut() else {
            return Ok(None);
        };
        let Some(path) = class_path.location_for_class(name)? else {
            return Ok(None);
        };
        let location = ClassLocation::Path(path);
        let Some(bytes) = self
            .files
            .class_file_bytes(name, &location, Some(class_path), None)?
        else {
            return Ok(None);
        };
        let record = parse_named(name, bytes)?;
        Ok(Some(Arc::new(DynamicClass::new(record, ROOT_LOADER, location))))
    }
}

/// Subclasses handed over by a placeholder had no super class object to point at.
fn link_adopted_subclasses(class: &Arc<DynamicClass>) {
    for sub in class.subclasses() {
        if sub.super_class().is_none() && sub.record().super_name() == Some(class.name()) {
            sub.set_super_class(Some(Arc::clone(class)));
        }
    }
}

fn parse_named(name: &str, bytes: Arc<[u8]>) -> Result<crate::record::ClassRecord> {
    let record = parse_class(bytes)?;
    if record.name() != name {
        return Err(ClassError::format(
            name,
            0,
            format!("class file defines {} instead", record.name()),
        ));
    }
    Ok(record)
}

pub fn canonical_name(name: &str) -> String {
    name.replace('.', "/")
}

fn normalize_loader(loader: LoaderId) -> LoaderId {
    if loader == NO_LOADER { ROOT_LOADER } else { loader }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TargetTerminated;
    use crate::record::MethodAccess;
    use crate::testing::ClassBuilder;

    fn class_bytes(name: &str) -> Vec<u8> {
        ClassBuilder::new(name).build()
    }

    fn chain_registry() -> ClassRegistry {
        let registry = ClassRegistry::new(SessionConfig::default());
        registry.add_child_and_parent(1, 0);
        registry.add_child_and_parent(2, 1);
        registry.add_child_and_parent(3, 0);
        registry
    }

    struct FakeClient {
        defining: LoaderId,
        terminated: bool,
        calls: Mutex<usize>,
    }

    impl TargetClient for FakeClient {
        fn bytes_for(&self, names: &[String], _: &[LoaderId]) -> anyhow::Result<Vec<Vec<u8>>> {
            if self.terminated {
                return Err(TargetTerminated.into());
            }
            Ok(names.iter().map(|n| class_bytes(n)).collect())
        }

        fn defining_loader_id(&self, _: &str, _: LoaderId) -> anyhow::Result<LoaderId> {
            *self.calls.lock() += 1;
            if self.terminated {
                return Err(TargetTerminated.into());
            }
            Ok(self.defining)
        }
    }

    #[test]
    fn class_at_parent_loader_is_visible_from_child_only() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p.A", 1, class_bytes("p/A"));

        let a = registry.lookup_class("p/A", 1)?.unwrap();
        assert_eq!(a.loader_id(), 1);
        let from_child = registry.lookup_class("p/A", 2)?.unwrap();
        assert!(Arc::ptr_eq(&a, &from_child));
        assert!(registry.lookup_class("p/A", 0)?.is_none());
        assert!(registry.lookup_class("p/A", 3)?.is_none());
        Ok(())
    }

    #[test]
    fn vm_bytes_at_ancestor_serve_a_child_query() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p/B", 0, class_bytes("p/B"));
        let b = registry.lookup_class("p/B", 2)?.unwrap();
        assert_eq!(b.loader_id(), 2);
        assert_eq!(b.location(), &ClassLocation::VmSupplied(0));
        Ok(())
    }

    #[test]
    fn placeholders_under_unrelated_loaders_stay_apart() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_child_and_parent(4, 0);

        let p1 = registry.lookup_class_or_create_placeholder("p/C", 1)?;
        let p3 = registry.lookup_class_or_create_placeholder("p/C", 3)?;
        assert!(p1.is_placeholder() && p3.is_placeholder());
        assert!(!p1.same_as(&p3));
        assert_eq!(registry.all_versions("p/C").len(), 2);

        let again = registry.lookup_class_or_create_placeholder("p/C", 2)?;
        assert!(again.same_as(&p1));
        assert!(registry.lookup_loaded("p/C", 4, true)?.is_none());
        assert!(registry.lookup_loaded("p/C", 1, false)?.is_none());
        Ok(())
    }

    #[test]
    fn placeholder_below_query_is_narrowed() -> anyhow::Result<()> {
        let registry = chain_registry();
        let p = registry.add_placeholder("p/D", 2);
        let found = registry.lookup_loaded("p/D", 1, true)?.unwrap();
        assert!(Arc::ptr_eq(found.as_placeholder().unwrap(), &p));
        assert_eq!(p.loader_id(), 1);
        Ok(())
    }

    #[test]
    fn promotion_carries_placeholder_data() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p/Sub", 1, class_bytes("p/Sub"));
        let sub = registry.lookup_class("p/Sub", 1)?.unwrap();

        let p = registry.add_placeholder("p/E", 1);
        p.set_all_methods_roots();
        p.add_subclass(&sub);

        registry.add_vm_supplied("p/E", 1, class_bytes("p/E"));
        let e = registry.lookup_class("p/E", 1)?.unwrap();
        assert!(e.all_methods_roots());
        assert_eq!(e.subclasses().len(), 1);

        let versions = registry.all_versions("p/E");
        assert_eq!(versions.len(), 1);
        assert!(versions[0].as_class().is_some_and(|c| Arc::ptr_eq(c, &e)));
        Ok(())
    }

    #[test]
    fn subclass_resolved_before_its_super_class_keeps_the_link() -> anyhow::Result<()> {
        let registry = chain_registry();
        let mut b = ClassBuilder::new("p/Sub");
        b.super_class(Some("p/Base"));
        registry.add_vm_supplied("p/Sub", 1, b.build());
        let sub = registry.lookup_class("p/Sub", 1)?.unwrap();

        registry.resolve_hierarchy(&sub)?;
        assert!(sub.super_class().is_none());
        let pending = registry.lookup_loaded("p/Base", 1, true)?.unwrap();
        let placeholder = pending.as_placeholder().unwrap();
        assert_eq!(placeholder.subclasses().len(), 1);

        registry.add_vm_supplied("p/Base", 1, class_bytes("p/Base"));
        let base = registry.lookup_class("p/Base", 1)?.unwrap();
        assert_eq!(base.subclasses().len(), 1);
        assert!(Arc::ptr_eq(&base.subclasses()[0], &sub));
        assert!(sub.super_class().is_some_and(|s| Arc::ptr_eq(&s, &base)));
        assert!(registry.all_versions("p/Base").iter().all(|e| !e.is_placeholder()));

        // once the super class is loaded, resolving links directly
        let mut b = ClassBuilder::new("p/Sub2");
        b.super_class(Some("p/Base"));
        registry.add_vm_supplied("p/Sub2", 2, b.build());
        let sub2 = registry.lookup_class("p/Sub2", 2)?.unwrap();
        registry.resolve_hierarchy(&sub2)?;
        assert!(sub2.super_class().is_some_and(|s| Arc::ptr_eq(&s, &base)));
        assert_eq!(base.subclasses().len(), 2);
        Ok(())
    }

    #[test]
    fn for_each_class_visits_every_entry() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p/A", 0, class_bytes("p/A"));
        registry.lookup_class("p/A", 0)?;
        registry.add_placeholder("p/B", 1);
        registry.lookup_special("[I");

        let mut seen = Vec::new();
        registry.for_each_class(|e| {
            // re-entering the registry from the callback must not deadlock
            assert!(!registry.all_versions(e.name()).is_empty());
            seen.push((e.name().to_string(), e.is_placeholder()));
        });
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("[I".to_string(), false),
                ("p/A".to_string(), false),
                ("p/B".to_string(), true),
            ]
        );
        Ok(())
    }

    #[test]
    fn reindexing_the_class_path_forgets_misses_and_failures() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.init_class_paths();
        assert!(registry.lookup_class("p/Nowhere", 0)?.is_none());
        registry.add_vm_supplied("p/Bad", 0, vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0]);
        assert!(registry.lookup_class("p/Bad", 0).is_err());
        {
            let inner = registry.inner.lock();
            assert_eq!(inner.not_found.len(), 1);
            assert_eq!(inner.unavailable.len(), 1);
        }

        registry.init_class_paths();
        let inner = registry.inner.lock();
        assert!(inner.not_found.is_empty());
        assert!(inner.unavailable.is_empty());
        Ok(())
    }

    #[test]
    fn missing_class_is_not_an_error() -> anyhow::Result<()> {
        let registry = chain_registry();
        assert!(registry.lookup_class("p/Nowhere", 2)?.is_none());
        assert!(registry.lookup_class("p/Nowhere", 2)?.is_none());
        assert_eq!(registry.inner.lock().not_found.len(), 1);
        Ok(())
    }

    #[test]
    fn broken_class_file_is_reported_once_then_unavailable() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p/Bad", 1, vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0]);
        let err = registry.lookup_class("p/Bad", 1).unwrap_err();
        assert!(err.is_format());
        assert!(registry.lookup_class("p/Bad", 1)?.is_none());

        registry.add_vm_supplied("p/Wrong", 1, class_bytes("p/Other"));
        assert!(registry.lookup_class("p/Wrong", 1).unwrap_err().is_format());
        Ok(())
    }

    #[test]
    fn defining_loader_resolves_non_tree_delegation() -> anyhow::Result<()> {
        let client = Arc::new(FakeClient {
            defining: 3,
            terminated: false,
            calls: Mutex::new(0),
        });
        let registry = chain_registry().with_client(client.clone());
        registry.add_vm_supplied("p/F", 3, class_bytes("p/F"));

        let f = registry.lookup_class("p/F", 2)?.unwrap();
        assert_eq!(f.loader_id(), 3);
        let again = registry.lookup_class("p/F", 2)?.unwrap();
        assert!(Arc::ptr_eq(&f, &again));
        assert_eq!(registry.defining_loader_id("p.F", 2)?, 3);
        assert_eq!(*client.calls.lock(), 1);
        Ok(())
    }

    #[test]
    fn terminated_target_propagates() {
        let client = Arc::new(FakeClient {
            defining: 0,
            terminated: true,
            calls: Mutex::new(0),
        });
        let registry = chain_registry().with_client(client);
        registry.preload_bytecode(&["p.G".to_string()], &[1]);
        assert!(registry.lookup_class("p/G", 1).unwrap_err().is_target_terminated());
        assert!(registry.defining_loader_id("p/H", 1).unwrap_err().is_target_terminated());
    }

    #[test]
    fn special_classes_are_created_once() {
        let registry = chain_registry();
        let a = registry.lookup_special("[java.lang.String");
        let b = registry.lookup_special("[java/lang/String");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.loader_id(), ROOT_LOADER);
        assert_eq!(registry.class_count(), 1);
    }

    fn region_class() -> Vec<u8> {
        let mut b = ClassBuilder::new("p/Region");
        b.method(
            MethodAccess::PUBLIC,
            "<init>",
            "()V",
            &[0x2a, 0xb7, 0x00, 0x01, 0xb1],
            &[(0, 3), (4, 5)],
        );
        // iconst_1, istore_1, iinc 1 1, goto -3, return
        b.method(
            MethodAccess::PUBLIC,
            "run",
            "()V",
            &[0x04, 0x3c, 0x84, 0x01, 0x01, 0xa7, 0xff, 0xfd, 0xb1],
            &[(0, 10), (2, 11), (5, 12), (8, 14)],
        );
        b.method(MethodAccess::PUBLIC, "other", "()V", &[0x00, 0xb1], &[(0, 20), (1, 21)]);
        b.build()
    }

    #[test]
    fn source_region_maps_to_bytecode_range() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p/Region", 0, region_class());
        let c = registry.lookup_class("p/Region", 0)?.unwrap();

        let r = registry.method_for_source_region(&c, 10, 12)?.unwrap();
        assert_eq!(r.method_name, "run");
        assert_eq!((r.bci0, r.bci1), (0, 8));

        // end line past the table falls back to the last instruction
        let r = registry.method_for_source_region(&c, 11, 16)?.unwrap();
        assert_eq!((r.bci0, r.bci1), (2, 8));

        assert!(registry.method_for_source_region(&c, 12, 20)?.is_none());
        assert!(registry.method_for_source_region(&c, 5, 4)?.is_none());
        assert!(registry.method_for_source_region(&c, 100, 101)?.is_none());

        let whole = registry.method_min_max_bci(&c, "run", "()V")?.unwrap();
        assert_eq!((whole.bci0, whole.bci1), (0, 8));
        Ok(())
    }

    #[test]
    fn source_region_fallback_reads_the_current_body() -> anyhow::Result<()> {
        use crate::layout::{be_u32, put_u32};

        let registry = chain_registry();
        registry.add_vm_supplied("p/Region", 0, region_class());
        let c = registry.lookup_class("p/Region", 0)?.unwrap();
        let run = c.record().method_index("run", "()V").unwrap();

        // two nops ahead of the final return
        let layout = c.layout(run)?.unwrap();
        let code_attr = layout.code_attr.unwrap();
        let mut blob = c.method_info(run).unwrap().to_vec();
        let at = layout.bytecode_offset + 8;
        blob.splice(at..at, [0x00, 0x00]);
        let code_len = be_u32(&blob, code_attr + 2).unwrap();
        put_u32(&mut blob, code_attr + 2, code_len + 2);
        let bc_len = be_u32(&blob, layout.bytecode_offset - 4).unwrap();
        put_u32(&mut blob, layout.bytecode_offset - 4, bc_len + 2);
        c.save_method_info(run, blob)?;

        let r = registry.method_for_source_region(&c, 11, 16)?.unwrap();
        assert_eq!((r.bci0, r.bci1), (2, 10));
        Ok(())
    }

    #[test]
    fn source_region_without_line_tables_is_distinct() -> anyhow::Result<()> {
        let registry = chain_registry();
        let mut b = ClassBuilder::new("p/Bare");
        b.method(MethodAccess::PUBLIC, "m", "()V", &[0xb1], &[]);
        registry.add_vm_supplied("p/Bare", 0, b.build());
        let c = registry.lookup_class("p/Bare", 0)?.unwrap();
        assert!(matches!(
            registry.method_for_source_region(&c, 1, 2),
            Err(ClassError::NoDebugInfo { .. })
        ));
        Ok(())
    }

    #[test]
    fn clear_cache_forgets_classes() -> anyhow::Result<()> {
        let registry = chain_registry();
        registry.add_vm_supplied("p/A", 0, class_bytes("p/A"));
        assert!(registry.lookup_class("p/A", 0)?.is_some());
        registry.clear_cache();
        assert_eq!(registry.class_count(), 0);
        assert!(registry.lookup_class("p/A", 0)?.is_none());
        assert_eq!(registry.parent_loader(2), Some(1));
        registry.cleanup();
        assert_eq!(registry.parent_loader(2), None);
        Ok(())
    }
}
