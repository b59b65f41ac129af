//! Per-class instrumentation state layered over an immutable [`ClassRecord`].
//!
//! Every method is either still [`MethodBody::Original`], read straight from the
//! parsed bytes, or [`MethodBody::Replaced`] by a rewritten method_info. All
//! accessors go through the same [`MethodLayout`] scan of whichever blob is current.

use bitflags::bitflags;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::{Arc, Weak};

use crate::cache::ClassLocation;
use crate::error::{ClassError, Result};
use crate::layout::{LocalVariable, MethodLayout, be_u16, be_u32, local_variables, put_u16, put_u32};
use crate::loader::LoaderId;
use crate::record::{AttributeKind, AttributeNames, ClassRecord, MethodEntry};
use crate::stackmap::{EditKind, StackMapPatcher, VerificationType};

bitflags! {
    /// Analysis results attached to a method by the instrumentation planner.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodStatus: u16 {
        const REACHABLE = 0x0001;
        const UNSCANNABLE = 0x0002;
        const SCANNED = 0x0004;
        const INSTRUMENTED = 0x0008;
        const LEAF = 0x0010;
        const VIRTUAL = 0x0020;
        const ROOT = 0x0040;
        const SPECIAL = 0x0080;
        const MARKER = 0x0100;
    }
}

impl Default for MethodStatus {
    fn default() -> Self {
        MethodStatus::empty()
    }
}

#[derive(Debug, Clone, Default)]
pub enum MethodBody {
    #[default]
    Original,
    Replaced(Arc<[u8]>),
}

/// A shared slice of either the class bytes or a replacement blob.
#[derive(Debug, Clone)]
pub struct MethodBytes {
    data: Arc<[u8]>,
    range: Range<usize>,
}

impl MethodBytes {
    fn sub(&self, start: usize, len: usize) -> Option<MethodBytes> {
        let begin = self.range.start + start;
        let end = begin.checked_add(len)?;
        (end <= self.range.end).then(|| MethodBytes {
            data: Arc::clone(&self.data),
            range: begin..end,
        })
    }
}

impl Deref for MethodBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }
}

#[derive(Debug, Default)]
struct MethodState {
    status: MethodStatus,
    instr_id: Option<u32>,
    body: MethodBody,
    layout: Option<Arc<MethodLayout>>,
}

struct InstrumentationState {
    methods: Vec<MethodState>,
    attribute_names: AttributeNames,
    base_cp_counts: HashMap<u32, u16>,
    current_cp_count: u16,
    super_class: Option<Arc<DynamicClass>>,
    interfaces: Vec<Arc<DynamicClass>>,
    subclasses: Vec<Weak<DynamicClass>>,
    loaded: bool,
    instrumented_count: usize,
    all_methods_roots: bool,
    all_methods_markers: bool,
}

/// A resolved class as seen by one class loader, plus everything instrumentation
/// has done to it so far.
pub struct DynamicClass {
    record: ClassRecord,
    loader_id: LoaderId,
    location: ClassLocation,
    state: RwLock<InstrumentationState>,
}

impl fmt::Debug for DynamicClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicClass")
            .field("name", &self.record.name())
            .field("loader_id", &self.loader_id)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl DynamicClass {
    pub fn new(record: ClassRecord, loader_id: LoaderId, location: ClassLocation) -> Self {
        let methods = (0..record.method_count()).map(|_| MethodState::default()).collect();
        let state = InstrumentationState {
            methods,
            attribute_names: record.attribute_names().clone(),
            base_cp_counts: HashMap::new(),
            current_cp_count: record.sections().cpool_count,
            super_class: None,
            interfaces: Vec::new(),
            subclasses: Vec::new(),
            loaded: false,
            instrumented_count: 0,
            all_methods_roots: false,
            all_methods_markers: false,
        };
        Self {
            record,
            loader_id,
            location,
            state: RwLock::new(state),
        }
    }

    pub fn record(&self) -> &ClassRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader_id
    }

    pub fn location(&self) -> &ClassLocation {
        &self.location
    }

    pub fn method(&self, idx: usize) -> Option<&MethodEntry> {
        self.record.method(idx)
    }

    pub fn method_count(&self) -> usize {
        self.record.method_count()
    }

    // ---- status bits ----

    pub fn status(&self, idx: usize) -> MethodStatus {
        self.state
            .read()
            .methods
            .get(idx)
            .map(|m| m.status)
            .unwrap_or_default()
    }

    pub fn has_status(&self, idx: usize, flags: MethodStatus) -> bool {
        self.status(idx).contains(flags)
    }

    pub fn set_status(&self, idx: usize, flags: MethodStatus) {
        self.update_status(idx, |s| s.insert(flags));
    }

    pub fn clear_status(&self, idx: usize, flags: MethodStatus) {
        self.update_status(idx, |s| s.remove(flags));
    }

    /// Applies `f` to the status of `idx`, keeping the instrumented count in step
    /// with the `INSTRUMENTED` bit.
    fn update_status(&self, idx: usize, f: impl FnOnce(&mut MethodStatus)) {
        let mut state = self.state.write();
        let Some(m) = state.methods.get_mut(idx) else {
            return;
        };
        let was = m.status.contains(MethodStatus::INSTRUMENTED);
        f(&mut m.status);
        let now = m.status.contains(MethodStatus::INSTRUMENTED);
        match (was, now) {
            (false, true) => state.instrumented_count += 1,
            (true, false) => state.instrumented_count -= 1,
            _ => {}
        }
    }

    pub fn set_instrumentation_id(&self, idx: usize, id: u32) {
        if let Some(m) = self.state.write().methods.get_mut(idx) {
            m.instr_id = Some(id);
        }
    }

    pub fn instrumentation_id(&self, idx: usize) -> Option<u32> {
        self.state.read().methods.get(idx)?.instr_id
    }

    pub fn mark_instrumented(&self, idx: usize) {
        self.set_status(idx, MethodStatus::INSTRUMENTED);
    }

    /// Drops the instrumented bit only; a replaced body stays in place.
    pub fn unset_instrumented(&self, idx: usize) {
        self.clear_status(idx, MethodStatus::INSTRUMENTED);
    }

    pub fn instrumented_count(&self) -> usize {
        self.state.read().instrumented_count
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.state.write().loaded = loaded;
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().loaded
    }

    pub fn set_all_methods_roots(&self) {
        self.state.write().all_methods_roots = true;
    }

    pub fn all_methods_roots(&self) -> bool {
        self.state.read().all_methods_roots
    }

    pub fn set_all_methods_markers(&self) {
        self.state.write().all_methods_markers = true;
    }

    pub fn all_methods_markers(&self) -> bool {
        self.state.read().all_methods_markers
    }

    /// Takes over what was recorded on a placeholder before the real bytes arrived.
    pub(crate) fn adopt(&self, roots: bool, markers: bool, subclasses: Vec<Weak<DynamicClass>>) {
        let mut state = self.state.write();
        state.all_methods_roots |= roots;
        state.all_methods_markers |= markers;
        for sub in subclasses {
            if !state.subclasses.iter().any(|s| s.ptr_eq(&sub)) {
                state.subclasses.push(sub);
            }
        }
    }

    // ---- method bodies ----

    pub fn method_body(&self, idx: usize) -> Option<MethodBody> {
        Some(self.state.read().methods.get(idx)?.body.clone())
    }

    pub fn is_replaced(&self, idx: usize) -> bool {
        matches!(self.method_body(idx), Some(MethodBody::Replaced(_)))
    }

    /// Discards a replacement body; later accessors read the parsed class bytes again.
    pub fn restore_original_body(&self, idx: usize) {
        if let Some(m) = self.state.write().methods.get_mut(idx) {
            m.body = MethodBody::Original;
            m.layout = None;
        }
    }

    pub fn method_info(&self, idx: usize) -> Option<MethodBytes> {
        let state = self.state.read();
        self.info_in(&state, idx)
    }

    fn info_in(&self, state: &InstrumentationState, idx: usize) -> Option<MethodBytes> {
        match &state.methods.get(idx)?.body {
            MethodBody::Replaced(blob) => Some(MethodBytes {
                data: Arc::clone(blob),
                range: 0..blob.len(),
            }),
            MethodBody::Original => {
                let m = self.record.method(idx)?;
                Some(MethodBytes {
                    data: Arc::clone(self.record.bytes()),
                    range: m.info_offset..m.info_offset + m.info_len,
                })
            }
        }
    }

    /// Sub-offsets of the current body, computed once per body.
    pub fn layout(&self, idx: usize) -> Result<Option<Arc<MethodLayout>>> {
        Ok(self.info_and_layout(idx)?.map(|(_, layout)| layout))
    }

    /// The current body together with its layout, both taken under one guard.
    fn info_and_layout(&self, idx: usize) -> Result<Option<(MethodBytes, Arc<MethodLayout>)>> {
        {
            let state = self.state.read();
            if let Some(layout) = state.methods.get(idx).and_then(|m| m.layout.clone()) {
                return Ok(self.info_in(&state, idx).map(|info| (info, layout)));
            }
        }

        let mut state = self.state.write();
        let Some(info) = self.info_in(&state, idx) else {
            return Ok(None);
        };
        if let Some(layout) = state.methods[idx].layout.clone() {
            return Ok(Some((info, layout)));
        }
        let layout = Arc::new(MethodLayout::scan(self.name(), &info, &state.attribute_names)?);
        state.methods[idx].layout = Some(Arc::clone(&layout));
        Ok(Some((info, layout)))
    }

    fn code_layout(&self, idx: usize) -> Result<Option<(MethodBytes, Arc<MethodLayout>)>> {
        Ok(self
            .info_and_layout(idx)?
            .filter(|(_, layout)| layout.has_code()))
    }

    pub fn method_bytecode(&self, idx: usize) -> Result<Option<MethodBytes>> {
        Ok(self
            .code_layout(idx)?
            .and_then(|(info, l)| info.sub(l.bytecode_offset, l.bytecode_len)))
    }

    pub fn bytecode_len(&self, idx: usize) -> Result<usize> {
        Ok(self.code_layout(idx)?.map(|(_, l)| l.bytecode_len).unwrap_or(0))
    }

    /// Offset of the exception table length, relative to the current method_info.
    pub fn exception_table_offset(&self, idx: usize) -> Result<Option<usize>> {
        Ok(self.code_layout(idx)?.map(|(_, l)| l.exception_table))
    }

    pub fn local_variable_table_offset(&self, idx: usize) -> Result<Option<usize>> {
        Ok(self.code_layout(idx)?.and_then(|(_, l)| l.local_variables))
    }

    pub fn local_variable_type_table_offset(&self, idx: usize) -> Result<Option<usize>> {
        Ok(self.code_layout(idx)?.and_then(|(_, l)| l.local_variable_types))
    }

    pub fn stack_map_table_offset(&self, idx: usize) -> Result<Option<usize>> {
        Ok(self.code_layout(idx)?.and_then(|(_, l)| l.stack_map))
    }

    pub fn local_variables(&self, idx: usize) -> Result<Vec<LocalVariable>> {
        Ok(match self.code_layout(idx)? {
            Some((info, l)) => l
                .local_variables
                .map(|ofs| local_variables(&info, ofs))
                .unwrap_or_default(),
            None => Vec::new(),
        })
    }

    pub fn local_variable_types(&self, idx: usize) -> Result<Vec<LocalVariable>> {
        Ok(match self.code_layout(idx)? {
            Some((info, l)) => l
                .local_variable_types
                .map(|ofs| local_variables(&info, ofs))
                .unwrap_or_default(),
            None => Vec::new(),
        })
    }

    /// Replaces the method_info of `idx`. The blob must scan cleanly with this
    /// class's attribute names.
    pub fn save_method_info(&self, idx: usize, blob: Vec<u8>) -> Result<()> {
        let mut state = self.state.write();
        if idx >= state.methods.len() {
            return Err(ClassError::BadLocation {
                message: format!("{} has no method #{idx}", self.name()),
            });
        }
        let layout = MethodLayout::scan(self.name(), &blob, &state.attribute_names)?;
        let m = &mut state.methods[idx];
        m.body = MethodBody::Replaced(blob.into());
        m.layout = Some(Arc::new(layout));
        Ok(())
    }

    /// Forgets every lazily derived table; the next access rescans.
    pub fn reset_tables(&self) {
        self.record.reset_tables();
        for m in &mut self.state.write().methods {
            m.layout = None;
        }
    }

    /// Registers the constant pool index of an attribute name added by instrumentation.
    pub fn add_attribute_name(&self, cp_index: u16, kind: AttributeKind) {
        let mut state = self.state.write();
        state.attribute_names.add(cp_index, kind);
        for m in &mut state.methods {
            m.layout = None;
        }
    }

    // ---- constant pool growth ----

    pub fn current_cp_count(&self) -> u16 {
        self.state.read().current_cp_count
    }

    pub fn base_cp_count(&self, injection_type: u32) -> Option<u16> {
        self.state.read().base_cp_counts.get(&injection_type).copied()
    }

    /// Reserves `count` constant pool slots for one injection type. Returns the
    /// index of the first new slot, or `None` if this type was already added.
    pub fn reserve_cp_entries(&self, injection_type: u32, count: u16) -> Option<u16> {
        let mut state = self.state.write();
        if state.base_cp_counts.contains_key(&injection_type) {
            return None;
        }
        let base = state.current_cp_count;
        state.base_cp_counts.insert(injection_type, base);
        state.current_cp_count = base.saturating_add(count);
        Some(base)
    }

    // ---- hierarchy ----

    pub fn set_super_class(&self, sup: Option<Arc<DynamicClass>>) {
        self.state.write().super_class = sup;
    }

    pub fn super_class(&self) -> Option<Arc<DynamicClass>> {
        self.state.read().super_class.clone()
    }

    pub fn add_interface(&self, iface: Arc<DynamicClass>) {
        let mut state = self.state.write();
        if !state.interfaces.iter().any(|i| Arc::ptr_eq(i, &iface)) {
            state.interfaces.push(iface);
        }
    }

    pub fn interfaces(&self) -> Vec<Arc<DynamicClass>> {
        self.state.read().interfaces.clone()
    }

    pub fn add_subclass(&self, sub: &Arc<DynamicClass>) {
        let weak = Arc::downgrade(sub);
        let mut state = self.state.write();
        if !state.subclasses.iter().any(|s| s.ptr_eq(&weak)) {
            state.subclasses.push(weak);
        }
    }

    pub fn subclasses(&self) -> Vec<Arc<DynamicClass>> {
        self.state
            .read()
            .subclasses
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Walks the resolved super chain; the last unresolved link is matched by name.
    pub fn is_subclass_of(&self, name: &str) -> bool {
        if self.record.super_name() == Some(name) {
            return true;
        }
        let mut cur = self.super_class();
        while let Some(c) = cur {
            if c.record.super_name() == Some(name) {
                return true;
            }
            cur = c.super_class();
        }
        false
    }

    pub fn implements_interface(&self, name: &str) -> bool {
        if self.record.interfaces().iter().any(|i| i == name) {
            return true;
        }
        if self.interfaces().iter().any(|i| i.implements_interface(name)) {
            return true;
        }
        self.super_class()
            .is_some_and(|s| s.implements_interface(name))
    }

    pub fn overrides_virtual_method(&self, sup: &DynamicClass, sup_idx: usize) -> Option<usize> {
        self.record.overrides_virtual_method(&sup.record, sup_idx)
    }

    // ---- stack maps ----

    /// Decodes the stack map of the current body; empty when the method has none.
    pub fn stack_map_patcher(&self, idx: usize) -> Result<StackMapPatcher> {
        let Some((info, layout)) = self.code_layout(idx)? else {
            return Ok(StackMapPatcher::default());
        };
        let Some(attr) = layout.stack_map else {
            return Ok(StackMapPatcher::default());
        };
        let len = be_u32(&info, attr + 2).unwrap_or(0) as usize;
        let table = info.get(attr + 6..attr + 6 + len).ok_or_else(|| {
            ClassError::format(self.name(), attr, "truncated StackMapTable")
        })?;
        StackMapPatcher::decode(self.name(), table)
    }

    /// Writes `patcher` back into a replacement body, fixing the `StackMapTable` and
    /// `Code` attribute lengths. A method without a table gets one appended.
    pub fn persist_stack_map(&self, idx: usize, patcher: &StackMapPatcher) -> Result<()> {
        let Some((info, layout)) = self.code_layout(idx)? else {
            return Err(ClassError::BadLocation {
                message: format!("{} method #{idx} has no code", self.name()),
            });
        };
        let code_attr = layout.code_attr.unwrap_or_default();
        let table = patcher.encode();
        let mut blob = info.to_vec();
        let bad = || ClassError::format(self.name(), code_attr, "inconsistent Code attribute");

        let growth = match layout.stack_map {
            Some(attr) => {
                let old = be_u32(&blob, attr + 2).ok_or_else(bad)? as usize;
                let body = attr + 6;
                blob.splice(body..body + old, table.iter().copied());
                put_u32(&mut blob, attr + 2, table.len() as u32);
                table.len() as i64 - old as i64
            }
            None => {
                if patcher.is_empty() {
                    return Ok(());
                }
                let name = self
                    .state
                    .read()
                    .attribute_names
                    .index_of(AttributeKind::StackMapTable)
                    .ok_or_else(|| ClassError::BadLocation {
                        message: format!("{} has no StackMapTable name in its constant pool", self.name()),
                    })?;
                let at = layout.code_end(&blob).ok_or_else(bad)?;
                let mut attr = Vec::with_capacity(6 + table.len());
                attr.extend_from_slice(&name.to_be_bytes());
                attr.extend_from_slice(&(table.len() as u32).to_be_bytes());
                attr.extend_from_slice(&table);
                let added = attr.len() as i64;
                blob.splice(at..at, attr);
                let count = be_u16(&blob, layout.code_attr_count).ok_or_else(bad)?;
                put_u16(&mut blob, layout.code_attr_count, count + 1);
                added
            }
        };

        let code_len = i64::from(be_u32(&blob, code_attr + 2).ok_or_else(bad)?) + growth;
        let code_len = u32::try_from(code_len).map_err(|_| bad())?;
        put_u32(&mut blob, code_attr + 2, code_len);
        self.save_method_info(idx, blob)
    }

    /// Shifts the stack map of `idx` for `count` bytes injected at `pos` and stores
    /// the result if anything moved.
    pub fn update_stack_map(
        &self,
        idx: usize,
        pos: u32,
        count: u32,
        kind: EditKind,
        binds_to_following: bool,
    ) -> Result<bool> {
        let mut patcher = self.stack_map_patcher(idx)?;
        let changed = patcher.update_table(pos, count, kind, binds_to_following)?;
        if changed {
            self.persist_stack_map(idx, &patcher)?;
        }
        Ok(changed)
    }

    pub fn add_full_stack_map_frame(
        &self,
        idx: usize,
        at: u32,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    ) -> Result<()> {
        let mut patcher = self.stack_map_patcher(idx)?;
        patcher.add_full_frame(at, locals, stack)?;
        self.persist_stack_map(idx, &patcher)
    }
}
