//! Class file assembly for unit tests.

use std::collections::HashMap;

use crate::opcodes::tag;
use crate::record::MethodAccess;

pub struct ClassBuilder {
    cp: Vec<u8>,
    next_index: u16,
    utf8s: HashMap<String, u16>,
    classes: HashMap<String, u16>,
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access: u16,
    major: u16,
    methods: Vec<MethodDef>,
    inner: Vec<(String, Option<String>)>,
}

struct MethodDef {
    access: MethodAccess,
    name: String,
    signature: String,
    code: Option<Vec<u8>>,
    lines: Vec<(u16, u16)>,
    stack_map: Option<(u16, Vec<u8>)>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            cp: Vec::new(),
            next_index: 1,
            utf8s: HashMap::new(),
            classes: HashMap::new(),
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access: 0x0021,
            major: 52,
            methods: Vec::new(),
            inner: Vec::new(),
        }
    }

    pub fn super_class(&mut self, name: Option<&str>) -> &mut Self {
        self.super_name = name.map(str::to_string);
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn access(&mut self, access: u16) -> &mut Self {
        self.access = access;
        self
    }

    pub fn major(&mut self, major: u16) -> &mut Self {
        self.major = major;
        self
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.utf8s.get(s) {
            return idx;
        }
        let encoded = cesu8::to_java_cesu8(s);
        self.cp.push(tag::UTF8);
        self.cp.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        self.cp.extend_from_slice(&encoded);
        let idx = self.take_index(1);
        self.utf8s.insert(s.to_string(), idx);
        idx
    }

    pub fn class(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.classes.get(name) {
            return idx;
        }
        let name_idx = self.utf8(name);
        self.cp.push(tag::CLASS);
        self.cp.extend_from_slice(&name_idx.to_be_bytes());
        let idx = self.take_index(1);
        self.classes.insert(name.to_string(), idx);
        idx
    }

    pub fn name_and_type(&mut self, name: &str, signature: &str) -> u16 {
        let n = self.utf8(name);
        let s = self.utf8(signature);
        self.cp.push(tag::NAME_AND_TYPE);
        self.cp.extend_from_slice(&n.to_be_bytes());
        self.cp.extend_from_slice(&s.to_be_bytes());
        self.take_index(1)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, signature: &str) -> u16 {
        let c = self.class(class);
        let nt = self.name_and_type(name, signature);
        self.cp.push(tag::METHODREF);
        self.cp.extend_from_slice(&c.to_be_bytes());
        self.cp.extend_from_slice(&nt.to_be_bytes());
        self.take_index(1)
    }

    pub fn long(&mut self, v: i64) -> u16 {
        self.cp.push(tag::LONG);
        self.cp.extend_from_slice(&v.to_be_bytes());
        self.take_index(2)
    }

    pub fn method(
        &mut self,
        access: MethodAccess,
        name: &str,
        signature: &str,
        code: &[u8],
        lines: &[(u16, u16)],
    ) -> &mut Self {
        self.methods.push(MethodDef {
            access,
            name: name.to_string(),
            signature: signature.to_string(),
            code: Some(code.to_vec()),
            lines: lines.to_vec(),
            stack_map: None,
        });
        self
    }

    /// `frames` is the raw encoding of `count` stack map frames.
    pub fn method_with_stack_map(
        &mut self,
        name: &str,
        signature: &str,
        code: &[u8],
        count: u16,
        frames: &[u8],
    ) -> &mut Self {
        self.methods.push(MethodDef {
            access: MethodAccess::PUBLIC,
            name: name.to_string(),
            signature: signature.to_string(),
            code: Some(code.to_vec()),
            lines: Vec::new(),
            stack_map: Some((count, frames.to_vec())),
        });
        self
    }

    pub fn abstract_method(&mut self, name: &str, signature: &str) -> &mut Self {
        self.methods.push(MethodDef {
            access: MethodAccess::PUBLIC | MethodAccess::ABSTRACT,
            name: name.to_string(),
            signature: signature.to_string(),
            code: None,
            lines: Vec::new(),
            stack_map: None,
        });
        self
    }

    /// An InnerClasses entry; `simple` of `None` writes a zero inner name index.
    pub fn inner_class(&mut self, full: &str, simple: Option<&str>) -> &mut Self {
        self.inner.push((full.to_string(), simple.map(str::to_string)));
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        let this_idx = self.class(&self.name.clone());
        let super_idx = match self.super_name.clone() {
            Some(s) => self.class(&s),
            None => 0,
        };
        let interface_idx: Vec<u16> = self
            .interfaces
            .clone()
            .iter()
            .map(|i| self.class(i))
            .collect();

        // one private field with an attribute, so field skipping is exercised
        let field_name = self.utf8("counter");
        let field_desc = self.utf8("I");
        let field_attr = self.utf8("Synthetic");

        let defs = std::mem::take(&mut self.methods);
        let methods: Vec<Vec<u8>> = defs.iter().map(|m| self.method_info(m)).collect();
        self.methods = defs;

        let mut attrs = Vec::new();
        let mut attr_count = 0u16;
        if !self.inner.is_empty() {
            let ic = self.utf8("InnerClasses");
            let inner = self.inner.clone();
            let mut body = Vec::new();
            body.extend_from_slice(&(inner.len() as u16).to_be_bytes());
            for (full, simple) in &inner {
                let full_idx = self.class(full);
                let simple_idx = simple.as_deref().map(|s| self.utf8(s)).unwrap_or(0);
                body.extend_from_slice(&full_idx.to_be_bytes());
                body.extend_from_slice(&this_idx.to_be_bytes());
                body.extend_from_slice(&simple_idx.to_be_bytes());
                body.extend_from_slice(&0u16.to_be_bytes());
            }
            push_attr(&mut attrs, ic, &body);
            attr_count += 1;
        }

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&self.major.to_be_bytes());
        out.extend_from_slice(&self.next_index.to_be_bytes());
        out.extend_from_slice(&self.cp);
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&this_idx.to_be_bytes());
        out.extend_from_slice(&super_idx.to_be_bytes());
        out.extend_from_slice(&(interface_idx.len() as u16).to_be_bytes());
        for i in interface_idx {
            out.extend_from_slice(&i.to_be_bytes());
        }

        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0x0002u16.to_be_bytes());
        out.extend_from_slice(&field_name.to_be_bytes());
        out.extend_from_slice(&field_desc.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        push_attr(&mut out, field_attr, &[]);

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in methods {
            out.extend_from_slice(&m);
        }
        out.extend_from_slice(&attr_count.to_be_bytes());
        out.extend_from_slice(&attrs);
        out
    }

    fn method_info(&mut self, m: &MethodDef) -> Vec<u8> {
        let name = self.utf8(&m.name);
        let sig = self.utf8(&m.signature);
        let mut out = Vec::new();
        out.extend_from_slice(&m.access.bits().to_be_bytes());
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&sig.to_be_bytes());

        let Some(code) = &m.code else {
            out.extend_from_slice(&0u16.to_be_bytes());
            return out;
        };

        let code_name = self.utf8("Code");
        let mut sub = Vec::new();
        let mut sub_count = 0u16;
        if !m.lines.is_empty() {
            let lnt = self.utf8("LineNumberTable");
            let mut body = Vec::new();
            body.extend_from_slice(&(m.lines.len() as u16).to_be_bytes());
            for (pc, line) in &m.lines {
                body.extend_from_slice(&pc.to_be_bytes());
                body.extend_from_slice(&line.to_be_bytes());
            }
            push_attr(&mut sub, lnt, &body);
            sub_count += 1;
        }
        if let Some((count, frames)) = &m.stack_map {
            let smt = self.utf8("StackMapTable");
            let mut body = count.to_be_bytes().to_vec();
            body.extend_from_slice(frames);
            push_attr(&mut sub, smt, &body);
            sub_count += 1;
        }

        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_be_bytes());
        body.extend_from_slice(&4u16.to_be_bytes());
        body.extend_from_slice(&(code.len() as u32).to_be_bytes());
        body.extend_from_slice(code);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&sub_count.to_be_bytes());
        body.extend_from_slice(&sub);

        out.extend_from_slice(&1u16.to_be_bytes());
        push_attr(&mut out, code_name, &body);
        out
    }

    fn take_index(&mut self, slots: u16) -> u16 {
        let idx = self.next_index;
        self.next_index += slots;
        idx
    }
}

pub fn push_attr(out: &mut Vec<u8>, name_idx: u16, body: &[u8]) {
    out.extend_from_slice(&name_idx.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}
