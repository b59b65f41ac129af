//! Compact, offset-based view of one parsed class file.
//!
//! A [`ClassRecord`] keeps the original bytes plus the offsets the reader found in
//! them; everything else (line tables, method slices) is derived on demand.

use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{ClassError, Result};
use crate::opcodes::{
    OPC_ALOAD, OPC_ASTORE, OPC_IINC, OPC_ILOAD, OPC_ISTORE, OPC_LOOKUPSWITCH, OPC_RET,
    OPC_TABLESWITCH, OPC_WIDE, instruction_length, tag,
};

pub const INIT_NAME: &str = "<init>";
pub const CLINIT_NAME: &str = "<clinit>";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassAccess: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodAccess: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

/// Attributes whose layout this crate cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Code,
    LineNumberTable,
    LocalVariableTable,
    LocalVariableTypeTable,
    StackMapTable,
    InnerClasses,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 6] = [
        AttributeKind::Code,
        AttributeKind::LineNumberTable,
        AttributeKind::LocalVariableTable,
        AttributeKind::LocalVariableTypeTable,
        AttributeKind::StackMapTable,
        AttributeKind::InnerClasses,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AttributeKind::Code => "Code",
            AttributeKind::LineNumberTable => "LineNumberTable",
            AttributeKind::LocalVariableTable => "LocalVariableTable",
            AttributeKind::LocalVariableTypeTable => "LocalVariableTypeTable",
            AttributeKind::StackMapTable => "StackMapTable",
            AttributeKind::InnerClasses => "InnerClasses",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name().as_bytes() == name)
    }
}

/// Constant pool indices of the UTF8 entries naming interesting attributes.
#[derive(Debug, Clone, Default)]
pub struct AttributeNames {
    entries: Vec<(u16, AttributeKind)>,
}

impl AttributeNames {
    pub fn add(&mut self, cp_index: u16, kind: AttributeKind) {
        if !self.entries.contains(&(cp_index, kind)) {
            self.entries.push((cp_index, kind));
        }
    }

    pub fn kind_of(&self, cp_index: u16) -> Option<AttributeKind> {
        self.entries
            .iter()
            .find(|(idx, _)| *idx == cp_index)
            .map(|&(_, kind)| kind)
    }

    pub fn index_of(&self, kind: AttributeKind) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|&(idx, _)| idx)
    }
}

/// Slot offsets (just past the tag byte) and tags of the original constant pool.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    pub offsets: Vec<u32>,
    pub tags: Vec<u8>,
}

impl ConstantPool {
    pub fn count(&self) -> usize {
        self.tags.len()
    }

    pub fn tag(&self, idx: u16) -> Option<u8> {
        self.tags.get(usize::from(idx)).copied()
    }
}

/// Byte offsets of the top-level sections of the original class file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sections {
    /// Start of the constant pool, count included.
    pub cpool_start: usize,
    pub cpool_count: u16,
    /// Access flags, this class, super class and interfaces.
    pub intermediate_start: usize,
    pub fields_start: usize,
    pub methods_start: usize,
    pub attrs_start: usize,
}

/// One method_info. All offsets except `info_offset` are relative to the start of the method_info.
#[derive(Debug, Clone, Default)]
pub struct MethodEntry {
    pub name: String,
    pub signature: String,
    pub access: MethodAccess,
    pub info_offset: usize,
    pub info_len: usize,
    /// Zero for methods without code.
    pub bytecode_offset: usize,
    pub bytecode_len: usize,
    pub exception_table_offset: usize,
    /// Offset of the first line table entry and the entry count.
    pub line_numbers: Option<(usize, usize)>,
}

impl Default for ClassAccess {
    fn default() -> Self {
        ClassAccess::empty()
    }
}

impl Default for MethodAccess {
    fn default() -> Self {
        MethodAccess::empty()
    }
}

impl MethodEntry {
    pub fn is_public(&self) -> bool {
        self.access.contains(MethodAccess::PUBLIC)
    }

    pub fn is_private(&self) -> bool {
        self.access.contains(MethodAccess::PRIVATE)
    }

    pub fn is_protected(&self) -> bool {
        self.access.contains(MethodAccess::PROTECTED)
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccess::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.access.contains(MethodAccess::FINAL)
    }

    pub fn is_native(&self) -> bool {
        self.access.contains(MethodAccess::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(MethodAccess::ABSTRACT)
    }

    pub fn is_initializer(&self) -> bool {
        self.name == INIT_NAME || self.name == CLINIT_NAME
    }

    pub fn has_code(&self) -> bool {
        self.bytecode_offset != 0
    }
}

/// A method referenced from the constant pool, owner name trimmed like class refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class: String,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start_pc: u16,
    pub line: u16,
}

/// Per-method line number tables decoded from the original bytes.
#[derive(Debug, Clone, Default)]
pub struct LineNumberTables {
    tables: Vec<Option<Vec<LineEntry>>>,
}

impl LineNumberTables {
    pub fn any(&self) -> bool {
        self.tables.iter().any(Option::is_some)
    }

    pub fn entries(&self, method: usize) -> Option<&[LineEntry]> {
        self.tables.get(method)?.as_deref()
    }

    pub fn min_max_lines(&self, method: usize) -> Option<(u16, u16)> {
        let entries = self.entries(method)?;
        let min = entries.iter().map(|e| e.line).min()?;
        let max = entries.iter().map(|e| e.line).max()?;
        Some((min, max))
    }

    /// The bci of `line`, or failing an exact match, the smallest bci among the
    /// closest following lines. `None` when `line` is outside this method's range.
    pub fn bci_for_line(&self, method: usize, line: u32) -> Option<u32> {
        let entries = self.entries(method)?;
        let mut min_line = u32::MAX;
        let mut max_line = 0u32;
        let mut best_line = u32::MAX;
        let mut best_bci = u32::MAX;

        for e in entries {
            let cur = u32::from(e.line);
            max_line = max_line.max(cur);
            min_line = min_line.min(cur);
            if cur == line {
                return Some(u32::from(e.start_pc));
            }
            // a `while` loop puts two bcis on its line; the smaller is right either way
            if cur > line && cur <= best_line && u32::from(e.start_pc) < best_bci {
                best_bci = u32::from(e.start_pc);
                best_line = cur;
            }
        }

        (line >= min_line && line <= max_line && best_bci != u32::MAX).then_some(best_bci)
    }

    pub fn line_for_bci(&self, method: usize, bci: u32) -> Option<u16> {
        let mut best = None;
        for e in self.entries(method)? {
            if u32::from(e.start_pc) > bci {
                break;
            }
            best = Some(e.line);
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLookup {
    Found { method: usize, bci: u32 },
    NotFound,
    /// None of the class's methods carry a line number table.
    NoDebugInfo,
}

#[derive(Debug)]
pub struct ClassRecord {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) access: ClassAccess,
    pub(crate) package: String,
    pub(crate) methods: Vec<MethodEntry>,
    pub(crate) class_refs: Vec<(u16, String)>,
    pub(crate) method_refs: Vec<(u16, MethodRef)>,
    pub(crate) nested: Vec<String>,
    pub(crate) sections: Sections,
    pub(crate) cpool: ConstantPool,
    pub(crate) attribute_names: AttributeNames,
    pub(crate) bytes: Arc<[u8]>,
    pub(crate) line_tables: Mutex<Option<Arc<LineNumberTables>>>,
}

impl ClassRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` only for `java/lang/Object`.
    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn access(&self) -> ClassAccess {
        self.access
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(ClassAccess::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(ClassAccess::ABSTRACT)
    }

    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn sections(&self) -> Sections {
        self.sections
    }

    pub fn constant_pool(&self) -> &ConstantPool {
        &self.cpool
    }

    pub fn attribute_names(&self) -> &AttributeNames {
        &self.attribute_names
    }

    pub fn nested_class_names(&self) -> &[String] {
        &self.nested
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn methods(&self) -> &[MethodEntry] {
        &self.methods
    }

    pub fn method(&self, idx: usize) -> Option<&MethodEntry> {
        self.methods.get(idx)
    }

    pub fn method_index(&self, name: &str, signature: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.signature == signature)
    }

    /// The method_info as it appears in the original class file.
    pub fn method_info(&self, idx: usize) -> Option<&[u8]> {
        let m = self.methods.get(idx)?;
        self.bytes.get(m.info_offset..m.info_offset + m.info_len)
    }

    pub fn method_bytecode(&self, idx: usize) -> Option<&[u8]> {
        let m = self.methods.get(idx)?;
        let start = m.info_offset + m.bytecode_offset;
        self.bytes.get(start..start + m.bytecode_len)
    }

    pub fn ref_class_name(&self, cp_index: u16) -> Option<&str> {
        self.class_refs
            .iter()
            .find(|(idx, _)| *idx == cp_index)
            .map(|(_, name)| name.as_str())
    }

    pub fn ref_method(&self, cp_index: u16) -> Option<&MethodRef> {
        self.method_refs
            .iter()
            .find(|(idx, _)| *idx == cp_index)
            .map(|(_, m)| m)
    }

    pub fn class_refs(&self) -> &[(u16, String)] {
        &self.class_refs
    }

    pub fn method_refs(&self) -> &[(u16, MethodRef)] {
        &self.method_refs
    }

    /// Decodes the UTF8 constant at `idx` of the original pool.
    pub fn utf8_at(&self, idx: u16) -> Result<String> {
        if self.cpool.tag(idx) != Some(tag::UTF8) {
            return Err(ClassError::format(
                &self.name,
                0,
                format!("Constant pool entry {idx} should be UTF8 constant"),
            ));
        }
        let ofs = self.cpool.offsets[usize::from(idx)] as usize;
        let raw = self
            .bytes
            .get(ofs..ofs + 2)
            .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
            .and_then(|len| self.bytes.get(ofs + 2..ofs + 2 + len))
            .ok_or_else(|| ClassError::format(&self.name, ofs, "truncated UTF8 constant"))?;
        cesu8::from_java_cesu8(raw)
            .map(|s| s.into_owned())
            .map_err(|_| ClassError::format(&self.name, ofs, "invalid modified UTF-8"))
    }

    pub fn line_tables(&self) -> Arc<LineNumberTables> {
        let mut guard = self.line_tables.lock();
        if let Some(tables) = guard.as_ref() {
            return Arc::clone(tables);
        }
        let tables = Arc::new(self.decode_line_tables());
        *guard = Some(Arc::clone(&tables));
        tables
    }

    pub fn reset_tables(&self) {
        *self.line_tables.lock() = None;
    }

    fn decode_line_tables(&self) -> LineNumberTables {
        let tables = self
            .methods
            .iter()
            .map(|m| {
                let (ofs, count) = m.line_numbers?;
                let start = m.info_offset + ofs;
                let raw = self.bytes.get(start..start + count * 4)?;
                Some(
                    raw.chunks_exact(4)
                        .map(|c| LineEntry {
                            start_pc: u16::from_be_bytes([c[0], c[1]]),
                            line: u16::from_be_bytes([c[2], c[3]]),
                        })
                        .collect(),
                )
            })
            .collect();
        LineNumberTables { tables }
    }

    pub fn min_max_lines(&self, method: usize) -> Option<(u16, u16)> {
        self.line_tables().min_max_lines(method)
    }

    pub fn bci_for_line(&self, method: usize, line: u32) -> Option<u32> {
        self.line_tables().bci_for_line(method, line)
    }

    pub fn line_for_bci(&self, method: usize, bci: u32) -> Option<u16> {
        self.line_tables().line_for_bci(method, bci)
    }

    /// Ordinary methods are tried before initializers, whose tables may span
    /// field initializers scattered across the whole class body.
    pub fn method_and_bci_for_line(&self, line: u32) -> LineLookup {
        let tables = self.line_tables();
        if !tables.any() {
            return LineLookup::NoDebugInfo;
        }

        let ordinary = self.methods.iter().enumerate().filter(|(_, m)| !m.is_initializer());
        let initializers = self.methods.iter().enumerate().filter(|(_, m)| m.is_initializer());
        for (idx, _) in ordinary.chain(initializers) {
            if let Some(bci) = tables.bci_for_line(idx, line) {
                return LineLookup::Found { method: idx, bci };
            }
        }
        LineLookup::NotFound
    }

    /// Index of this class's method overriding `sup`'s method `sup_idx`, if any.
    /// Assumes the super method is already known to be virtual.
    pub fn overrides_virtual_method(&self, sup: &ClassRecord, sup_idx: usize) -> Option<usize> {
        let sm = sup.method(sup_idx)?;
        let idx = self.method_index(&sm.name, &sm.signature)?;
        if sm.is_public() || sm.is_protected() || sup.package == self.package {
            Some(idx)
        } else {
            None
        }
    }
}

pub fn package_name(class_name: &str) -> &str {
    class_name.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Start offset of the instruction preceding `bci` in `code`.
pub fn previous_bci(code: &[u8], bci: usize) -> usize {
    let mut prev = 0usize;
    let mut offset = 0usize;

    while offset < bci && offset < code.len() {
        prev = offset;
        let opcode = code[offset];
        let next = if opcode == OPC_WIDE {
            match code.get(offset + 1).copied() {
                Some(op)
                    if (OPC_ILOAD..=OPC_ALOAD).contains(&op)
                        || (OPC_ISTORE..=OPC_ASTORE).contains(&op)
                        || op == OPC_RET =>
                {
                    offset + 4
                }
                Some(OPC_IINC) => offset + 6,
                _ => offset + 1,
            }
        } else {
            match opcode {
                OPC_TABLESWITCH => {
                    let tbl = (offset + 4) & !3;
                    let (Some(low), Some(high)) = (int_at(code, tbl + 4), int_at(code, tbl + 8))
                    else {
                        break;
                    };
                    let entries = (i64::from(high) - i64::from(low) + 1).max(0) as usize;
                    tbl + 12 + entries * 4
                }
                OPC_LOOKUPSWITCH => {
                    let tbl = (offset + 4) & !3;
                    let Some(npairs) = int_at(code, tbl + 4) else {
                        break;
                    };
                    tbl + 8 + npairs.max(0) as usize * 8
                }
                op => offset + instruction_length(op).max(1),
            }
        };
        if next <= offset {
            break;
        }
        offset = next;
    }
    prev
}

fn int_at(code: &[u8], pos: usize) -> Option<i32> {
    let b = code.get(pos..pos + 4)?;
    Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
