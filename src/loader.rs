//! Classloader topology: an array-backed child → parent table.
//!
//! Loader ids are small dense integers handed out by the target VM. Id 0 is the
//! bootstrap (root) loader; a stored parent of -1 means "delegates straight to the
//! bootstrap loader" and is treated the same as 0.

pub type LoaderId = i32;

pub const ROOT_LOADER: LoaderId = 0;
pub const NO_LOADER: LoaderId = -1;

// Slot value for ids inside the table's capacity that were never reported.
const UNSEEN: LoaderId = i32::MIN;

#[derive(Debug, Clone)]
pub struct ClassLoaderGraph {
    parents: Vec<LoaderId>,
}

impl Default for ClassLoaderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassLoaderGraph {
    pub fn new() -> Self {
        Self {
            parents: vec![ROOT_LOADER],
        }
    }

    /// Bulk initialization from the table the target VM sends at session start:
    /// `parents[id]` is the parent of loader `id`.
    pub fn from_table(parents: &[LoaderId]) -> Self {
        let mut table = parents.to_vec();
        if table.is_empty() {
            table.push(ROOT_LOADER);
        }
        table[0] = ROOT_LOADER;
        Self { parents: table }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn add_child_and_parent(&mut self, child: LoaderId, parent: LoaderId) {
        let Ok(idx) = usize::try_from(child) else {
            return;
        };
        if idx == 0 {
            return;
        }
        if idx >= self.parents.len() {
            let new_len = (self.parents.len() * 2).max(idx + 1);
            self.parents.resize(new_len, UNSEEN);
        }
        self.parents[idx] = parent;
    }

    /// Parent of `loader`, `Some(ROOT_LOADER)` for the root itself, `None` for ids
    /// that were never reported. Synthetic or reflective loaders can show up before
    /// the VM tells us about them, so an unknown id is not an error.
    pub fn parent_of(&self, loader: LoaderId) -> Option<LoaderId> {
        let idx = usize::try_from(loader).ok()?;
        match *self.parents.get(idx)? {
            UNSEEN => None,
            NO_LOADER => Some(ROOT_LOADER),
            p => Some(p),
        }
    }

    pub fn is_known(&self, loader: LoaderId) -> bool {
        self.parent_of(loader).is_some()
    }

    /// `loader`, then each parent up to and including the root.
    pub fn ancestry(&self, loader: LoaderId) -> Ancestry<'_> {
        Ancestry {
            graph: self,
            next: Some(loader),
            steps: 0,
        }
    }

    /// True when `ancestor` is a strict ancestor of `loader`.
    pub fn is_ancestor(&self, ancestor: LoaderId, loader: LoaderId) -> bool {
        ancestor != loader && self.ancestry(loader).skip(1).any(|l| l == ancestor)
    }

    pub fn clear(&mut self) {
        self.parents.clear();
        self.parents.push(ROOT_LOADER);
    }
}

pub struct Ancestry<'a> {
    graph: &'a ClassLoaderGraph,
    next: Option<LoaderId>,
    steps: usize,
}

impl Iterator for Ancestry<'_> {
    type Item = LoaderId;

    fn next(&mut self) -> Option<LoaderId> {
        let current = self.next.take()?;
        self.steps += 1;
        // a corrupted table must not make us spin forever
        if current != ROOT_LOADER && self.steps <= self.graph.parents.len() {
            self.next = self
                .graph
                .parent_of(current)
                .filter(|&parent| parent != current);
        }
        Some(current)
    }
}
