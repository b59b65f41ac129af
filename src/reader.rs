//! Single-pass class file reader producing a [`ClassRecord`].
//!
//! Only what the class repository needs is interpreted: the constant pool
//! cross-reference tables, the class header, per-method offsets (code, exception
//! table, line numbers) and the directly nested classes from `InnerClasses`.
//! Fields and every other attribute are skipped by their declared lengths.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{ClassError, Result};
use crate::opcodes::{JAVA_MAGIC, is_supported_version, tag};
use crate::record::{
    AttributeKind, AttributeNames, ClassAccess, ClassRecord, ConstantPool, MethodAccess,
    MethodEntry, MethodRef, Sections, package_name,
};

const OBJECT_CLASS: &str = "java/lang/Object";

/// Parses `bytes` into a record that keeps (and shares) the buffer.
pub fn parse_class(bytes: Arc<[u8]>) -> Result<ClassRecord> {
    let mut parser = ClassFileParser::new(&bytes);
    let parsed = parser.parse()?;

    Ok(ClassRecord {
        package: package_name(&parsed.name).to_string(),
        name: parsed.name,
        super_name: parsed.super_name,
        interfaces: parsed.interfaces,
        access: parsed.access,
        methods: parsed.methods,
        class_refs: parsed.class_refs,
        method_refs: parsed.method_refs,
        nested: parsed.nested,
        sections: parsed.sections,
        cpool: parsed.cpool,
        attribute_names: parsed.attribute_names,
        bytes,
        line_tables: Mutex::new(None),
    })
}

#[derive(Default)]
struct Parsed {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access: ClassAccess,
    methods: Vec<MethodEntry>,
    class_refs: Vec<(u16, String)>,
    method_refs: Vec<(u16, MethodRef)>,
    nested: Vec<String>,
    sections: Sections,
    cpool: ConstantPool,
    attribute_names: AttributeNames,
}

struct ClassFileParser<'a> {
    data: &'a [u8],
    pos: usize,
    out: Parsed,
    utf8_cache: Vec<Option<String>>,
    class_name_cache: Vec<Option<String>>,
}

impl<'a> ClassFileParser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            out: Parsed::default(),
            utf8_cache: Vec::new(),
            class_name_cache: Vec::new(),
        }
    }

    fn parse(&mut self) -> Result<Parsed> {
        self.read_preamble()?;
        self.read_constant_pool()?;
        self.read_intermediate()?;
        self.skip_fields()?;
        self.read_methods()?;
        self.read_attributes()?;
        Ok(std::mem::take(&mut self.out))
    }

    fn err(&self, message: impl Into<String>) -> ClassError {
        ClassError::format(&self.out.name, self.pos, message)
    }

    fn u1(&mut self) -> Result<u8> {
        let v = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.err("unexpected end of class file"))?;
        self.pos += 1;
        Ok(v)
    }

    fn u2(&mut self) -> Result<u16> {
        let v = self.u2_at(self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    fn u4(&mut self) -> Result<u32> {
        let b = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| self.err("unexpected end of class file"))?;
        let v = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        self.pos += 4;
        Ok(v)
    }

    fn u2_at(&self, pos: usize) -> Result<u16> {
        let b = self
            .data
            .get(pos..pos + 2)
            .ok_or_else(|| self.err("unexpected end of class file"))?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        if self.data.len() < self.pos + len {
            return Err(self.err(format!("cannot skip {len} bytes past end of class file")));
        }
        self.pos += len;
        Ok(())
    }

    fn cp_tag(&self, idx: u16) -> Option<u8> {
        self.out.cpool.tag(idx)
    }

    fn cp_offset(&self, idx: u16) -> usize {
        self.out.cpool.offsets[usize::from(idx)] as usize
    }

    fn expect_tag(&self, idx: u16, expected: u8, what: &str) -> Result<()> {
        if idx == 0 || self.cp_tag(idx) != Some(expected) {
            return Err(self.err(format!("Bad constant pool reference {idx} to {what}")));
        }
        Ok(())
    }

    fn read_preamble(&mut self) -> Result<()> {
        if self.u4()? != JAVA_MAGIC {
            return Err(self.err("Illegal start of class file"));
        }
        let minor = self.u2()?;
        let major = self.u2()?;
        if !is_supported_version(major, minor) {
            return Err(self.err(format!("Unsupported class file version: {major}.{minor}")));
        }
        Ok(())
    }

    fn read_constant_pool(&mut self) -> Result<()> {
        self.out.sections.cpool_start = self.pos;
        let count = self.u2()?;
        self.out.sections.cpool_count = count;

        let n = usize::from(count);
        let mut offsets = vec![0u32; n];
        let mut tags = vec![0u8; n];
        let mut method_refs = 0usize;
        let mut class_refs = 0usize;

        let mut i = 1usize;
        while i < n {
            let t = self.u1()?;
            offsets[i] = self.pos as u32;
            tags[i] = t;
            i += 1;
            match t {
                tag::UTF8 => {
                    let len = self.u2()?;
                    self.skip(usize::from(len))?;
                }
                tag::CLASS => {
                    class_refs += 1;
                    self.skip(2)?;
                }
                tag::STRING | tag::METHOD_TYPE | tag::MODULE | tag::PACKAGE => self.skip(2)?,
                tag::METHOD_HANDLE => self.skip(3)?,
                tag::FIELDREF
                | tag::NAME_AND_TYPE
                | tag::INTEGER
                | tag::FLOAT
                | tag::DYNAMIC
                | tag::INVOKE_DYNAMIC => self.skip(4)?,
                tag::METHODREF | tag::INTERFACE_METHODREF => {
                    method_refs += 1;
                    self.skip(4)?;
                }
                tag::LONG | tag::DOUBLE => {
                    self.skip(8)?;
                    i += 1;
                }
                other => {
                    self.pos -= 1;
                    return Err(self.err(format!("Bad constant pool tag: {other} at {}", self.pos)));
                }
            }
        }

        self.out.cpool = ConstantPool { offsets, tags };
        self.utf8_cache = vec![None; n];
        self.class_name_cache = vec![None; n];
        self.out.method_refs.reserve(method_refs);
        self.out.class_refs.reserve(class_refs);

        for idx in 1..count {
            match self.cp_tag(idx) {
                Some(tag::METHODREF) | Some(tag::INTERFACE_METHODREF) => {
                    let ofs = self.cp_offset(idx);
                    let class_idx = self.u2_at(ofs)?;
                    let nat_idx = self.u2_at(ofs + 2)?;
                    if self.cp_tag(class_idx) != Some(tag::CLASS)
                        || self.cp_tag(nat_idx) != Some(tag::NAME_AND_TYPE)
                    {
                        return Err(self.err(format!("Bad constant pool reference: {ofs} from entry {idx}")));
                    }
                    let class = self.class_name_of_class_entry(class_idx)?;
                    let nat_ofs = self.cp_offset(nat_idx);
                    let name_idx = self.u2_at(nat_ofs)?;
                    let sig_idx = self.u2_at(nat_ofs + 2)?;
                    if self.cp_tag(name_idx) != Some(tag::UTF8) || self.cp_tag(sig_idx) != Some(tag::UTF8) {
                        return Err(self.err(format!("Bad constant pool reference: {nat_ofs} from entry {idx}")));
                    }
                    let name = self.utf8_at(name_idx)?;
                    let signature = self.utf8_at(sig_idx)?;
                    self.out.method_refs.push((idx, MethodRef { class, name, signature }));
                }
                Some(tag::CLASS) => {
                    let name = self.class_name_of_class_entry(idx)?;
                    self.out.class_refs.push((idx, name));
                }
                Some(tag::UTF8) => {
                    let ofs = self.cp_offset(idx);
                    let len = usize::from(self.u2_at(ofs)?);
                    if let Some(kind) = self
                        .data
                        .get(ofs + 2..ofs + 2 + len)
                        .and_then(AttributeKind::from_name)
                    {
                        self.out.attribute_names.add(idx, kind);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn utf8_at(&mut self, idx: u16) -> Result<String> {
        if self.cp_tag(idx) != Some(tag::UTF8) {
            return Err(self.err(format!("Constant pool entry {idx} should be UTF8 constant")));
        }
        if let Some(s) = &self.utf8_cache[usize::from(idx)] {
            return Ok(s.clone());
        }
        let ofs = self.cp_offset(idx);
        let len = usize::from(self.u2_at(ofs)?);
        let raw = self
            .data
            .get(ofs + 2..ofs + 2 + len)
            .ok_or_else(|| self.err("truncated UTF8 constant"))?;
        let s = cesu8::from_java_cesu8(raw)
            .map_err(|_| self.err(format!("Constant pool entry {idx} is not valid modified UTF-8")))?
            .into_owned();
        self.utf8_cache[usize::from(idx)] = Some(s.clone());
        Ok(s)
    }

    /// The UTF8 at `idx` as a class name: `[Lfoo/Bar;` becomes `[foo/Bar`,
    /// primitive arrays and plain names are kept as they are.
    fn class_name_at(&mut self, idx: u16) -> Result<String> {
        if self.cp_tag(idx) != Some(tag::UTF8) {
            return Err(self.err(format!("Constant pool entry {idx} should be UTF8 constant")));
        }
        if let Some(s) = &self.class_name_cache[usize::from(idx)] {
            return Ok(s.clone());
        }
        let raw = self.utf8_at(idx)?;
        let depth = raw.bytes().take_while(|&b| b == b'[').count();
        let mut elem = &raw[depth..];
        if depth > 0 && elem.starts_with('L') {
            elem = &elem[1..];
            elem = elem.strip_suffix(';').unwrap_or(elem);
        }
        let name = format!("{}{}", "[".repeat(depth), elem);
        self.class_name_cache[usize::from(idx)] = Some(name.clone());
        Ok(name)
    }

    fn class_name_of_class_entry(&mut self, class_idx: u16) -> Result<String> {
        let name_idx = self.u2_at(self.cp_offset(class_idx))?;
        self.class_name_at(name_idx)
    }

    fn read_intermediate(&mut self) -> Result<()> {
        self.out.sections.intermediate_start = self.pos;
        self.out.access = ClassAccess::from_bits_retain(self.u2()?);

        let this_idx = self.u2()?;
        self.expect_tag(this_idx, tag::CLASS, "this class name")?;
        self.out.name = self.class_name_of_class_entry(this_idx)?;

        let super_idx = self.u2()?;
        if super_idx == 0 && self.out.name == OBJECT_CLASS {
            self.out.super_name = None;
        } else {
            self.expect_tag(super_idx, tag::CLASS, "super class name")?;
            self.out.super_name = Some(self.class_name_of_class_entry(super_idx)?);
        }

        let count = self.u2()?;
        for _ in 0..count {
            let idx = self.u2()?;
            self.expect_tag(idx, tag::CLASS, "an implemented interface")?;
            let name = self.class_name_of_class_entry(idx)?;
            self.out.interfaces.push(name);
        }
        Ok(())
    }

    fn skip_fields(&mut self) -> Result<()> {
        self.out.sections.fields_start = self.pos;
        let count = self.u2()?;
        for _ in 0..count {
            // flags, name, descriptor
            self.skip(6)?;
            let attrs = self.u2()?;
            for _ in 0..attrs {
                self.skip(2)?;
                let len = self.u4()? as usize;
                self.skip(len)?;
            }
        }
        Ok(())
    }

    fn read_methods(&mut self) -> Result<()> {
        self.out.sections.methods_start = self.pos;
        let count = self.u2()?;
        let mut methods = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            let info_offset = self.pos;
            let access = MethodAccess::from_bits_retain(self.u2()?);
            let name_idx = self.u2()?;
            let name = self.utf8_at(name_idx)?;
            let sig_idx = self.u2()?;
            let signature = self.utf8_at(sig_idx)?;
            let mut entry = MethodEntry {
                name,
                signature,
                access,
                info_offset,
                ..MethodEntry::default()
            };

            let attrs = self.u2()?;
            for _ in 0..attrs {
                let attr_name = self.u2()?;
                let len = self.u4()? as usize;
                let attr_end = self.pos + len;
                if attr_end > self.data.len() {
                    return Err(self.err(format!("attribute length {len} runs past end of class file")));
                }
                if self.utf8_at(attr_name)? == "Code" {
                    self.read_code(&mut entry, attr_end)?;
                }
                self.pos = attr_end;
            }

            entry.info_len = self.pos - info_offset;
            methods.push(entry);
        }

        self.out.methods = methods;
        Ok(())
    }

    fn read_code(&mut self, entry: &mut MethodEntry, attr_end: usize) -> Result<()> {
        // max_stack, max_locals
        self.skip(4)?;
        let code_len = self.u4()? as usize;
        entry.bytecode_offset = self.pos - entry.info_offset;
        entry.bytecode_len = code_len;
        self.skip(code_len)?;

        entry.exception_table_offset = self.pos - entry.info_offset;
        let handlers = usize::from(self.u2()?);
        self.skip(8 * handlers)?;

        let sub_attrs = self.u2()?;
        for _ in 0..sub_attrs {
            let attr_name = self.u2()?;
            let len = self.u4()? as usize;
            let sub_end = self.pos + len;
            if sub_end > attr_end {
                return Err(self.err("Code sub-attribute runs past its enclosing attribute"));
            }
            if self.utf8_at(attr_name)? == "LineNumberTable" {
                let entries = usize::from(self.u2()?);
                entry.line_numbers = Some((self.pos - entry.info_offset, entries));
                self.skip(4 * entries)?;
            }
            self.pos = sub_end;
        }
        Ok(())
    }

    /// Only `InnerClasses` is read, and from it only the classes nested directly in
    /// this one, recognized by name: `This$Simple` for members and
    /// `This$N$Simple` or `This$N` for the Nth local or anonymous class.
    fn read_attributes(&mut self) -> Result<()> {
        self.out.sections.attrs_start = self.pos;
        let count = self.u2()?;

        for _ in 0..count {
            let attr_name = self.u2()?;
            let len = self.u4()? as usize;
            if self.utf8_at(attr_name)? != "InnerClasses" {
                self.skip(len)?;
                continue;
            }

            let entries = self.u2()?;
            let mut non_member_count = 0u32;
            for _ in 0..entries {
                let inner_info = self.u2()?;
                let _outer_info = self.u2()?;
                let inner_name = self.u2()?;
                let _flags = self.u2()?;

                self.expect_tag(inner_info, tag::CLASS, "an inner class")?;
                let full = self.class_name_of_class_entry(inner_info)?;

                if inner_name != 0 {
                    let simple = self.utf8_at(inner_name)?;
                    if full != format!("{}${}", self.out.name, simple) {
                        let count = non_member_count + 1;
                        if full != format!("{}${}${}", self.out.name, count, simple) {
                            continue;
                        }
                        non_member_count = count;
                    }
                } else {
                    non_member_count += 1;
                    if full != format!("{}${}", self.out.name, non_member_count) {
                        continue;
                    }
                }
                self.out.nested.push(full);
            }
            break;
        }
        Ok(())
    }
}
