use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::insn::{self, Insn};
use crate::pool::ConstantPool;

pub const MAGIC: u32 = 0xCAFE_BABE;
/// Last format revision that verifies by type inference, so no stack-map
/// frames are required.
pub const MAJOR_VERSION: u16 = 49;
pub const MINOR_VERSION: u16 = 0;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_SYNTHETIC: u16 = 0x1000;

pub const ATTR_CODE: &str = "Code";
pub const ATTR_LINE_NUMBERS: &str = "LineNumberTable";
pub const ATTR_SOURCE_FILE: &str = "SourceFile";
/// Names of the capture-record fields a closure body expects, in order.
pub const ATTR_CAPTURES: &str = "PyCaptures";

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("class file truncated at byte {0}")]
    Truncated(usize),
    #[error("constant pool overflow")]
    PoolOverflow,
    #[error("constant #{index} is not a {expected}")]
    BadConstant { index: u16, expected: &'static str },
    #[error("duplicate constant pool entry at #{0}")]
    DuplicateConstant(u16),
    #[error("invalid modified UTF-8 in constant pool")]
    InvalidUtf8,
    #[error("unknown opcode 0x{opcode:02x} at byte {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("branch from {from} to {to} does not fit in 16 bits")]
    BranchOutOfRange { from: u32, to: u32 },
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("verification failed in {method}: {msg}")]
    Verify { method: String, msg: String },
    #[error("invalid class file: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Class constant of the caught type; 0 catches everything.
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

/// A method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: Vec<Insn>,
    pub exception_table: Vec<ExceptionEntry>,
    pub line_numbers: Vec<LineNumber>,
}

impl Code {
    /// Byte offset of every instruction plus the code length.
    pub fn offsets(&self) -> Vec<u32> {
        insn::offsets(&self.insns)
    }

    pub fn code_length(&self) -> u32 {
        self.insns.iter().map(Insn::size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub access: u16,
    pub name: u16,
    pub descriptor: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub access: u16,
    pub name: u16,
    pub descriptor: u16,
    pub code: Option<Code>,
    /// Utf8 indices of the capture-record layout, for closure bodies.
    pub captures: Option<Vec<u16>>,
}

impl MethodInfo {
    pub fn capture_names<'a>(&self, pool: &'a ConstantPool) -> Result<Vec<&'a str>, BytecodeError> {
        match &self.captures {
            Some(indices) => indices.iter().map(|&i| pool.get_utf8(i)).collect(),
            None => Ok(Vec::new()),
        }
    }
}

/// One compiled class: the binary artifact handed to the host loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub source_file: Option<u16>,
}

impl CompiledUnit {
    pub fn new(name: &str, super_name: &str) -> Result<Self, BytecodeError> {
        let mut pool = ConstantPool::new();
        let this_class = pool.class(name)?;
        let super_class = pool.class(super_name)?;
        for attr in [ATTR_CODE, ATTR_LINE_NUMBERS, ATTR_SOURCE_FILE, ATTR_CAPTURES] {
            pool.utf8(attr)?;
        }
        Ok(CompiledUnit {
            minor_version: MINOR_VERSION,
            major_version: MAJOR_VERSION,
            pool,
            access: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
        })
    }

    pub fn name(&self) -> Result<&str, BytecodeError> {
        self.pool.get_class(self.this_class)
    }

    pub fn super_name(&self) -> Result<&str, BytecodeError> {
        self.pool.get_class(self.super_class)
    }

    pub fn add_interface(&mut self, name: &str) -> Result<(), BytecodeError> {
        let idx = self.pool.class(name)?;
        if !self.interfaces.contains(&idx) {
            self.interfaces.push(idx);
        }
        Ok(())
    }

    /// Declare a field; redeclaring an existing name is a no-op.
    pub fn add_field(&mut self, access: u16, name: &str, descriptor: &str) -> Result<(), BytecodeError> {
        let name = self.pool.utf8(name)?;
        let descriptor = self.pool.utf8(descriptor)?;
        if !self.fields.iter().any(|f| f.name == name) {
            self.fields.push(FieldInfo { access, name, descriptor });
        }
        Ok(())
    }

    pub fn add_method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: Code,
        captures: Option<&[String]>,
    ) -> Result<(), BytecodeError> {
        let name_idx = self.pool.utf8(name)?;
        let descriptor_idx = self.pool.utf8(descriptor)?;
        if self
            .methods
            .iter()
            .any(|m| m.name == name_idx && m.descriptor == descriptor_idx)
        {
            return Err(BytecodeError::Invalid(format!("duplicate method {name}{descriptor}")));
        }
        let captures = match captures {
            Some(names) => Some(
                names
                    .iter()
                    .map(|n| self.pool.utf8(n))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        self.methods.push(MethodInfo {
            access,
            name: name_idx,
            descriptor: descriptor_idx,
            code: Some(code),
            captures,
        });
        Ok(())
    }

    pub fn set_source_file(&mut self, file: &str) -> Result<(), BytecodeError> {
        self.source_file = Some(self.pool.utf8(file)?);
        Ok(())
    }

    pub fn field_names(&self) -> Result<Vec<&str>, BytecodeError> {
        self.fields.iter().map(|f| self.pool.get_utf8(f.name)).collect()
    }

    pub fn method_name(&self, method: &MethodInfo) -> Result<&str, BytecodeError> {
        self.pool.get_utf8(method.name)
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| {
            self.pool.get_utf8(m.name).is_ok_and(|n| n == name)
                && self.pool.get_utf8(m.descriptor).is_ok_and(|d| d == descriptor)
        })
    }

    /// Serialize to JSON (inspection format).
    pub fn to_json(&self) -> Result<String, BytecodeError> {
        serde_json::to_string_pretty(self).map_err(|e| BytecodeError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, BytecodeError> {
        serde_json::from_str(json).map_err(|e| BytecodeError::Serialization(e.to_string()))
    }

    /// Serialize to the binary class-file format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BytecodeError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.minor_version.to_be_bytes());
        buf.extend_from_slice(&self.major_version.to_be_bytes());
        self.pool.write(&mut buf)?;
        put_u16(&mut buf, self.access);
        put_u16(&mut buf, self.this_class);
        put_u16(&mut buf, self.super_class);
        put_len(&mut buf, self.interfaces.len())?;
        for &i in &self.interfaces {
            put_u16(&mut buf, i);
        }
        put_len(&mut buf, self.fields.len())?;
        for field in &self.fields {
            put_u16(&mut buf, field.access);
            put_u16(&mut buf, field.name);
            put_u16(&mut buf, field.descriptor);
            put_u16(&mut buf, 0);
        }
        put_len(&mut buf, self.methods.len())?;
        for method in &self.methods {
            self.write_method(&mut buf, method)?;
        }
        match self.source_file {
            Some(file) => {
                put_u16(&mut buf, 1);
                put_u16(&mut buf, self.attribute_name(ATTR_SOURCE_FILE)?);
                buf.extend_from_slice(&2u32.to_be_bytes());
                put_u16(&mut buf, file);
            }
            None => put_u16(&mut buf, 0),
        }
        Ok(buf)
    }

    fn attribute_name(&self, name: &str) -> Result<u16, BytecodeError> {
        self.pool
            .find_utf8(name)
            .ok_or_else(|| BytecodeError::Invalid(format!("attribute name {name} missing from pool")))
    }

    fn write_method(&self, buf: &mut Vec<u8>, method: &MethodInfo) -> Result<(), BytecodeError> {
        put_u16(buf, method.access);
        put_u16(buf, method.name);
        put_u16(buf, method.descriptor);
        let attr_count = method.code.is_some() as u16 + method.captures.is_some() as u16;
        put_u16(buf, attr_count);
        if let Some(code) = &method.code {
            let mut body = Vec::new();
            put_u16(&mut body, code.max_stack);
            put_u16(&mut body, code.max_locals);
            let bytes = insn::encode_all(&code.insns)?;
            if bytes.is_empty() || bytes.len() >= 65536 {
                return Err(BytecodeError::Invalid(format!("code length {} out of range", bytes.len())));
            }
            body.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            body.extend_from_slice(&bytes);
            put_len(&mut body, code.exception_table.len())?;
            for entry in &code.exception_table {
                put_u16(&mut body, entry.start_pc);
                put_u16(&mut body, entry.end_pc);
                put_u16(&mut body, entry.handler_pc);
                put_u16(&mut body, entry.catch_type);
            }
            if code.line_numbers.is_empty() {
                put_u16(&mut body, 0);
            } else {
                put_u16(&mut body, 1);
                put_u16(&mut body, self.attribute_name(ATTR_LINE_NUMBERS)?);
                body.extend_from_slice(&(2 + 4 * code.line_numbers.len() as u32).to_be_bytes());
                put_len(&mut body, code.line_numbers.len())?;
                for ln in &code.line_numbers {
                    put_u16(&mut body, ln.start_pc);
                    put_u16(&mut body, ln.line);
                }
            }
            put_u16(buf, self.attribute_name(ATTR_CODE)?);
            buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            buf.extend_from_slice(&body);
        }
        if let Some(captures) = &method.captures {
            put_u16(buf, self.attribute_name(ATTR_CAPTURES)?);
            buf.extend_from_slice(&(2 + 2 * captures.len() as u32).to_be_bytes());
            put_len(buf, captures.len())?;
            for &c in captures {
                put_u16(buf, c);
            }
        }
        Ok(())
    }

    /// Deserialize from the binary class-file format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, BytecodeError> {
        let mut r = Reader::new(data);
        if r.u32()? != MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;
        if !(45..=MAJOR_VERSION).contains(&major_version) {
            return Err(BytecodeError::UnsupportedVersion { major: major_version, minor: minor_version });
        }
        let pool = ConstantPool::read(&mut r)?;
        let access = r.u16()?;
        let this_class = r.u16()?;
        let super_class = r.u16()?;
        let interfaces = (0..r.u16()?).map(|_| r.u16()).collect::<Result<Vec<_>, _>>()?;

        let mut fields = Vec::new();
        for _ in 0..r.u16()? {
            let field = FieldInfo { access: r.u16()?, name: r.u16()?, descriptor: r.u16()? };
            for _ in 0..r.u16()? {
                r.u16()?;
                let len = r.u32()? as usize;
                r.bytes(len)?;
            }
            fields.push(field);
        }

        let mut methods = Vec::new();
        for _ in 0..r.u16()? {
            let mut method = MethodInfo {
                access: r.u16()?,
                name: r.u16()?,
                descriptor: r.u16()?,
                code: None,
                captures: None,
            };
            for _ in 0..r.u16()? {
                let name = pool.get_utf8(r.u16()?)?.to_string();
                let len = r.u32()? as usize;
                let body = r.bytes(len)?;
                match name.as_str() {
                    ATTR_CODE => method.code = Some(read_code(&pool, body)?),
                    ATTR_CAPTURES => {
                        let mut cr = Reader::new(body);
                        let names = (0..cr.u16()?).map(|_| cr.u16()).collect::<Result<Vec<_>, _>>()?;
                        method.captures = Some(names);
                    }
                    _ => {}
                }
            }
            methods.push(method);
        }

        let mut source_file = None;
        for _ in 0..r.u16()? {
            let name = pool.get_utf8(r.u16()?)?.to_string();
            let len = r.u32()? as usize;
            let body = r.bytes(len)?;
            if name == ATTR_SOURCE_FILE {
                source_file = Some(Reader::new(body).u16()?);
            }
        }
        if !r.is_at_end() {
            return Err(BytecodeError::Invalid("trailing bytes after class file".into()));
        }

        Ok(CompiledUnit {
            minor_version,
            major_version,
            pool,
            access,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            source_file,
        })
    }
}

fn read_code(pool: &ConstantPool, body: &[u8]) -> Result<Code, BytecodeError> {
    let mut r = Reader::new(body);
    let max_stack = r.u16()?;
    let max_locals = r.u16()?;
    let len = r.u32()? as usize;
    let insns = insn::decode_all(r.bytes(len)?)?;
    let mut exception_table = Vec::new();
    for _ in 0..r.u16()? {
        exception_table.push(ExceptionEntry {
            start_pc: r.u16()?,
            end_pc: r.u16()?,
            handler_pc: r.u16()?,
            catch_type: r.u16()?,
        });
    }
    let mut line_numbers = Vec::new();
    for _ in 0..r.u16()? {
        let name = pool.get_utf8(r.u16()?)?;
        let len = r.u32()? as usize;
        let attr = r.bytes(len)?;
        if name == ATTR_LINE_NUMBERS {
            let mut lr = Reader::new(attr);
            for _ in 0..lr.u16()? {
                line_numbers.push(LineNumber { start_pc: lr.u16()?, line: lr.u16()? });
            }
        }
    }
    Ok(Code { max_stack, max_locals, insns, exception_table, line_numbers })
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<(), BytecodeError> {
    let len = u16::try_from(len).map_err(|_| BytecodeError::Invalid(format!("table of {len} entries is too large")))?;
    put_u16(buf, len);
    Ok(())
}

/// Big-endian cursor over a byte slice.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        let end = self.pos.checked_add(n).ok_or(BytecodeError::Truncated(self.pos))?;
        let slice = self.data.get(self.pos..end).ok_or(BytecodeError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, BytecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, BytecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, BytecodeError> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}
