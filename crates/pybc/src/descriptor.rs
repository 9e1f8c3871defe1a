//! Field and method descriptor parsing.

use crate::unit::BytecodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Operand stack / local variable words the type occupies.
    pub fn words(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `V`.
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn param_words(&self) -> u16 {
        self.params.iter().map(FieldType::words).sum()
    }

    pub fn return_words(&self) -> u16 {
        self.ret.as_ref().map_or(0, FieldType::words)
    }
}

pub fn parse_field_descriptor(desc: &str) -> Result<FieldType, BytecodeError> {
    let (ty, rest) = parse_field_type(desc)?;
    if !rest.is_empty() {
        return Err(BytecodeError::InvalidDescriptor(desc.to_string()));
    }
    Ok(ty)
}

pub fn parse_method_descriptor(desc: &str) -> Result<MethodDescriptor, BytecodeError> {
    let invalid = || BytecodeError::InvalidDescriptor(desc.to_string());
    let mut rest = desc.strip_prefix('(').ok_or_else(invalid)?;
    let mut params = Vec::new();
    while !rest.starts_with(')') {
        if rest.is_empty() {
            return Err(invalid());
        }
        let (ty, tail) = parse_field_type(rest).map_err(|_| invalid())?;
        params.push(ty);
        rest = tail;
    }
    let rest = &rest[1..];
    let ret = if rest == "V" {
        None
    } else {
        Some(parse_field_descriptor(rest).map_err(|_| invalid())?)
    };
    Ok(MethodDescriptor { params, ret })
}

fn parse_field_type(s: &str) -> Result<(FieldType, &str), BytecodeError> {
    let invalid = || BytecodeError::InvalidDescriptor(s.to_string());
    let first = s.chars().next().ok_or_else(invalid)?;
    let rest = &s[first.len_utf8()..];
    let ty = match first {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        'L' => {
            let end = rest.find(';').ok_or_else(invalid)?;
            if end == 0 {
                return Err(invalid());
            }
            return Ok((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (inner, tail) = parse_field_type(rest)?;
            return Ok((FieldType::Array(Box::new(inner)), tail));
        }
        _ => return Err(invalid()),
    };
    Ok((ty, rest))
}
