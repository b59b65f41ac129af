//! Sub-offsets inside a single method_info blob.
//!
//! The same scan works on a slice of the original class file and on a rewritten
//! replacement blob, so both go through [`MethodLayout::scan`].

use crate::error::{ClassError, Result};
use crate::record::{AttributeKind, AttributeNames};

/// Offsets relative to the start of the method_info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodLayout {
    /// Start of the `Code` attribute header (its name index).
    pub code_attr: Option<usize>,
    pub bytecode_offset: usize,
    pub bytecode_len: usize,
    pub exception_table: usize,
    /// Position of the `Code` sub-attribute count.
    pub code_attr_count: usize,
    /// Position of the `line_number_table_length` field.
    pub line_numbers: Option<usize>,
    /// Position of the `local_variable_table_length` field.
    pub local_variables: Option<usize>,
    pub local_variable_types: Option<usize>,
    /// Start of the `StackMapTable` attribute header.
    pub stack_map: Option<usize>,
}

impl MethodLayout {
    pub fn scan(class: &str, info: &[u8], names: &AttributeNames) -> Result<Self> {
        let bad = |pos: usize| ClassError::format(class, pos, "truncated method_info");
        let mut layout = MethodLayout::default();

        // access, name, descriptor
        let mut pos = 6;
        let attrs = be_u16(info, pos).ok_or_else(|| bad(pos))?;
        pos += 2;

        for _ in 0..attrs {
            let name = be_u16(info, pos).ok_or_else(|| bad(pos))?;
            let len = be_u32(info, pos + 2).ok_or_else(|| bad(pos + 2))? as usize;
            let body = pos + 6;
            let end = body + len;
            if end > info.len() {
                return Err(bad(pos));
            }
            if names.kind_of(name) == Some(AttributeKind::Code) {
                layout.code_attr = Some(pos);
                layout.scan_code(info, body, end, names, &bad)?;
            }
            pos = end;
        }
        Ok(layout)
    }

    fn scan_code(
        &mut self,
        info: &[u8],
        body: usize,
        end: usize,
        names: &AttributeNames,
        bad: &dyn Fn(usize) -> ClassError,
    ) -> Result<()> {
        // max_stack, max_locals
        let len_pos = body + 4;
        self.bytecode_len = be_u32(info, len_pos).ok_or_else(|| bad(len_pos))? as usize;
        self.bytecode_offset = len_pos + 4;
        self.exception_table = self.bytecode_offset + self.bytecode_len;

        let handlers = be_u16(info, self.exception_table).ok_or_else(|| bad(self.exception_table))?;
        self.code_attr_count = self.exception_table + 2 + 8 * usize::from(handlers);
        let count = be_u16(info, self.code_attr_count).ok_or_else(|| bad(self.code_attr_count))?;

        let mut pos = self.code_attr_count + 2;
        for _ in 0..count {
            let name = be_u16(info, pos).ok_or_else(|| bad(pos))?;
            let len = be_u32(info, pos + 2).ok_or_else(|| bad(pos + 2))? as usize;
            let sub_end = pos + 6 + len;
            if sub_end > end {
                return Err(bad(pos));
            }
            match names.kind_of(name) {
                Some(AttributeKind::LineNumberTable) => self.line_numbers = Some(pos + 6),
                Some(AttributeKind::LocalVariableTable) => self.local_variables = Some(pos + 6),
                Some(AttributeKind::LocalVariableTypeTable) => {
                    self.local_variable_types = Some(pos + 6)
                }
                Some(AttributeKind::StackMapTable) => self.stack_map = Some(pos),
                _ => {}
            }
            pos = sub_end;
        }
        Ok(())
    }

    pub fn has_code(&self) -> bool {
        self.code_attr.is_some()
    }

    /// End of the `Code` attribute, where a new sub-attribute can be appended.
    pub fn code_end(&self, info: &[u8]) -> Option<usize> {
        let start = self.code_attr?;
        Some(start + 6 + be_u32(info, start + 2)? as usize)
    }
}

/// One `LocalVariableTable` or `LocalVariableTypeTable` entry. For the type table
/// `descriptor_index` points at the generic signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub slot: u16,
}

/// Decodes the table whose length field sits at `count_offset`.
pub fn local_variables(info: &[u8], count_offset: usize) -> Vec<LocalVariable> {
    let Some(count) = be_u16(info, count_offset) else {
        return Vec::new();
    };
    let start = count_offset + 2;
    let Some(raw) = info.get(start..start + usize::from(count) * 10) else {
        return Vec::new();
    };
    raw.chunks_exact(10)
        .map(|c| LocalVariable {
            start_pc: u16::from_be_bytes([c[0], c[1]]),
            length: u16::from_be_bytes([c[2], c[3]]),
            name_index: u16::from_be_bytes([c[4], c[5]]),
            descriptor_index: u16::from_be_bytes([c[6], c[7]]),
            slot: u16::from_be_bytes([c[8], c[9]]),
        })
        .collect()
}

pub(crate) fn be_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let b = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn be_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let b = buf.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn put_u16(buf: &mut [u8], pos: usize, v: u16) {
    buf[pos..pos + 2].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
}
