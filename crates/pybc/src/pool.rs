//! Constant pool for compiled units.
//!
//! Entries are deduplicated on insertion, so the same literal or member
//! reference always resolves to one index. Long and double entries occupy
//! two slots, as the host loader expects.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::unit::{BytecodeError, Reader};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Long(i64),
    /// Raw IEEE bits, so that equal doubles share one entry.
    Double(u64),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
}

impl Constant {
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class(_) => 7,
            Constant::String(_) => 8,
            Constant::Fieldref(..) => 9,
            Constant::Methodref(..) => 10,
            Constant::InterfaceMethodref(..) => 11,
            Constant::NameAndType(..) => 12,
        }
    }

    /// Number of pool slots the entry occupies.
    pub fn width(&self) -> u16 {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// A resolved field or method reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub kind: MemberKind,
    pub class: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Constant>", into = "Vec<Constant>")]
pub struct ConstantPool {
    entries: IndexMap<Constant, u16>,
    /// Pool index -> position in `entries`; index 0 and the upper half of
    /// wide entries are empty.
    slots: Vec<Option<usize>>,
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool {
            entries: IndexMap::new(),
            slots: vec![None],
        }
    }

    /// The `constant_pool_count` value: one past the highest index.
    pub fn count(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a constant, returning the index of an existing equal entry if any.
    pub fn insert(&mut self, constant: Constant) -> Result<u16, BytecodeError> {
        if let Some(&idx) = self.entries.get(&constant) {
            return Ok(idx);
        }
        let idx = self.slots.len();
        let width = constant.width() as usize;
        if idx + width > u16::MAX as usize {
            return Err(BytecodeError::PoolOverflow);
        }
        let position = self.entries.len();
        self.entries.insert(constant, idx as u16);
        self.slots.push(Some(position));
        if width == 2 {
            self.slots.push(None);
        }
        Ok(idx as u16)
    }

    pub fn utf8(&mut self, s: &str) -> Result<u16, BytecodeError> {
        if encode_modified_utf8(s).len() > u16::MAX as usize {
            return Err(BytecodeError::Invalid(format!(
                "string constant of {} bytes is too long",
                s.len()
            )));
        }
        self.insert(Constant::Utf8(s.to_string()))
    }

    pub fn class(&mut self, name: &str) -> Result<u16, BytecodeError> {
        let name = self.utf8(name)?;
        self.insert(Constant::Class(name))
    }

    pub fn string(&mut self, s: &str) -> Result<u16, BytecodeError> {
        let utf8 = self.utf8(s)?;
        self.insert(Constant::String(utf8))
    }

    pub fn integer(&mut self, value: i32) -> Result<u16, BytecodeError> {
        self.insert(Constant::Integer(value))
    }

    pub fn long(&mut self, value: i64) -> Result<u16, BytecodeError> {
        self.insert(Constant::Long(value))
    }

    pub fn double(&mut self, value: f64) -> Result<u16, BytecodeError> {
        self.insert(Constant::Double(value.to_bits()))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, BytecodeError> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        self.insert(Constant::NameAndType(name, descriptor))
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, BytecodeError> {
        let class = self.class(class)?;
        let nat = self.name_and_type(name, descriptor)?;
        self.insert(Constant::Fieldref(class, nat))
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, BytecodeError> {
        let class = self.class(class)?;
        let nat = self.name_and_type(name, descriptor)?;
        self.insert(Constant::Methodref(class, nat))
    }

    pub fn interface_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, BytecodeError> {
        let class = self.class(class)?;
        let nat = self.name_and_type(name, descriptor)?;
        self.insert(Constant::InterfaceMethodref(class, nat))
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        let position = (*self.slots.get(index as usize)?)?;
        self.entries.get_index(position).map(|(c, _)| c)
    }

    /// Entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries.iter().map(|(c, &idx)| (idx, c))
    }

    pub fn find_utf8(&self, s: &str) -> Option<u16> {
        self.entries.get(&Constant::Utf8(s.to_string())).copied()
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, BytecodeError> {
        match self.get(index) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(BytecodeError::BadConstant { index, expected: "Utf8" }),
        }
    }

    pub fn get_class(&self, index: u16) -> Result<&str, BytecodeError> {
        match self.get(index) {
            Some(Constant::Class(name)) => self.get_utf8(*name),
            _ => Err(BytecodeError::BadConstant { index, expected: "Class" }),
        }
    }

    pub fn get_string(&self, index: u16) -> Result<&str, BytecodeError> {
        match self.get(index) {
            Some(Constant::String(utf8)) => self.get_utf8(*utf8),
            _ => Err(BytecodeError::BadConstant { index, expected: "String" }),
        }
    }

    pub fn get_name_and_type(&self, index: u16) -> Result<(&str, &str), BytecodeError> {
        match self.get(index) {
            Some(Constant::NameAndType(name, descriptor)) => {
                Ok((self.get_utf8(*name)?, self.get_utf8(*descriptor)?))
            }
            _ => Err(BytecodeError::BadConstant { index, expected: "NameAndType" }),
        }
    }

    pub fn get_member(&self, index: u16) -> Result<MemberRef<'_>, BytecodeError> {
        let (kind, class, nat) = match self.get(index) {
            Some(Constant::Fieldref(c, n)) => (MemberKind::Field, *c, *n),
            Some(Constant::Methodref(c, n)) => (MemberKind::Method, *c, *n),
            Some(Constant::InterfaceMethodref(c, n)) => (MemberKind::InterfaceMethod, *c, *n),
            _ => return Err(BytecodeError::BadConstant { index, expected: "member reference" }),
        };
        let class = self.get_class(class)?;
        let (name, descriptor) = self.get_name_and_type(nat)?;
        Ok(MemberRef { kind, class, name, descriptor })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), BytecodeError> {
        out.extend_from_slice(&self.count().to_be_bytes());
        for (constant, _) in &self.entries {
            out.push(constant.tag());
            match constant {
                Constant::Utf8(s) => {
                    let bytes = encode_modified_utf8(s);
                    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    out.extend_from_slice(&bytes);
                }
                Constant::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
                Constant::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
                Constant::Double(bits) => out.extend_from_slice(&bits.to_be_bytes()),
                Constant::Class(i) | Constant::String(i) => out.extend_from_slice(&i.to_be_bytes()),
                Constant::NameAndType(a, b)
                | Constant::Fieldref(a, b)
                | Constant::Methodref(a, b)
                | Constant::InterfaceMethodref(a, b) => {
                    out.extend_from_slice(&a.to_be_bytes());
                    out.extend_from_slice(&b.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, BytecodeError> {
        let count = reader.u16()?;
        let mut pool = ConstantPool::new();
        while pool.count() < count {
            let expected = pool.count();
            let tag = reader.u8()?;
            let constant = match tag {
                1 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(decode_modified_utf8(reader.bytes(len)?)?)
                }
                3 => Constant::Integer(reader.u32()? as i32),
                5 => Constant::Long(reader.u64()? as i64),
                6 => Constant::Double(reader.u64()?),
                7 => Constant::Class(reader.u16()?),
                8 => Constant::String(reader.u16()?),
                9 => Constant::Fieldref(reader.u16()?, reader.u16()?),
                10 => Constant::Methodref(reader.u16()?, reader.u16()?),
                11 => Constant::InterfaceMethodref(reader.u16()?, reader.u16()?),
                12 => Constant::NameAndType(reader.u16()?, reader.u16()?),
                other => {
                    return Err(BytecodeError::Invalid(format!(
                        "unsupported constant tag {other} at #{expected}"
                    )))
                }
            };
            if pool.insert(constant)? != expected {
                return Err(BytecodeError::DuplicateConstant(expected));
            }
        }
        if pool.count() != count {
            return Err(BytecodeError::Invalid("constant pool count mismatch".into()));
        }
        Ok(pool)
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ConstantPool {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.keys().zip(other.entries.keys()).all(|(a, b)| a == b)
    }
}

impl TryFrom<Vec<Constant>> for ConstantPool {
    type Error = BytecodeError;

    fn try_from(constants: Vec<Constant>) -> Result<Self, Self::Error> {
        let mut pool = ConstantPool::new();
        for constant in constants {
            let expected = pool.count();
            if pool.insert(constant)? != expected {
                return Err(BytecodeError::DuplicateConstant(expected));
            }
        }
        Ok(pool)
    }
}

impl From<ConstantPool> for Vec<Constant> {
    fn from(pool: ConstantPool) -> Self {
        pool.entries.into_keys().collect()
    }
}

/// Encode a string in the loader's modified UTF-8: NUL becomes two bytes and
/// supplementary characters are written as surrogate pairs.
pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, BytecodeError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 && b != 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1).ok_or(BytecodeError::InvalidUtf8)?;
            if b2 & 0xC0 != 0x80 {
                return Err(BytecodeError::InvalidUtf8);
            }
            units.push((((b & 0x1F) as u16) << 6) | (b2 & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1).ok_or(BytecodeError::InvalidUtf8)?;
            let b3 = *bytes.get(i + 2).ok_or(BytecodeError::InvalidUtf8)?;
            if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                return Err(BytecodeError::InvalidUtf8);
            }
            units.push((((b & 0x0F) as u16) << 12) | (((b2 & 0x3F) as u16) << 6) | (b3 & 0x3F) as u16);
            i += 3;
        } else {
            return Err(BytecodeError::InvalidUtf8);
        }
    }
    String::from_utf16(&units).map_err(|_| BytecodeError::InvalidUtf8)
}
