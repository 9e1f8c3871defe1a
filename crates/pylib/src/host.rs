//! Access from compiled Python code to units that were not compiled from
//! Python.
//!
//! A host unit imports as a module whose attributes are its static fields
//! and static methods. Arguments and results cross the boundary according
//! to the method descriptor: `PyObject` parameters take the value as is,
//! `String` and primitive parameters take the matching Python value.

use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use pyjvm_bytecode::abi;
use pyjvm_bytecode::descriptor::{parse_method_descriptor, FieldType};
use tracing::trace;

use crate::error::VmError;
use crate::value::{Args, HostMethod, Value};
use crate::vm::{Slot, Vm};

impl Vm {
    pub(crate) fn host_attr(&mut self, unit: &str, name: &str) -> Result<Option<Value>, VmError> {
        let loaded = self.unit(unit)?;
        if loaded.has_static(name) {
            return from_slot(loaded.get_static(name), None).map(Some);
        }
        if name.starts_with('<') || loaded.overloads(name).is_empty() {
            return Ok(None);
        }
        Ok(Some(Value::HostMethod(Rc::new(HostMethod { unit: unit.to_string(), name: name.to_string() }))))
    }

    pub(crate) fn call_host(&mut self, method: &HostMethod, args: Args) -> Result<Value, VmError> {
        let shown = format!("{}.{}", method.unit.replace('/', "."), method.name);
        if let Some((k, _)) = args.keywords.first() {
            return Err(self.err("TypeError", format!("{shown}() got an unexpected keyword argument '{k}'")));
        }
        let unit = self.unit(&method.unit)?;
        for descriptor in unit.overloads(&method.name) {
            let desc = parse_method_descriptor(&descriptor)?;
            if desc.params.len() != args.positional.len() {
                continue;
            }
            let slots: Option<Vec<Slot>> =
                desc.params.iter().zip(&args.positional).map(|(ty, v)| to_slot(v, ty)).collect();
            let Some(slots) = slots else { continue };
            trace!(method = %shown, %descriptor, "host call");
            self.ensure_init(&unit)?;
            let result = self.invoke(&unit, &method.name, &descriptor, slots)?;
            return match desc.ret {
                None => Ok(Value::None),
                Some(ty) => from_slot(result, Some(&ty)),
            };
        }
        let types: Vec<String> = args.positional.iter().map(Value::type_name).collect();
        Err(self.err(
            "TypeError",
            format!("{shown}(): no overload accepts arguments ({})", types.join(", ")),
        ))
    }
}

/// Marshal one argument; `None` when the parameter type cannot take it.
fn to_slot(v: &Value, ty: &FieldType) -> Option<Slot> {
    Some(match (ty, v) {
        (FieldType::Object(class), _) if class == abi::PY_OBJECT || class == abi::JAVA_OBJECT => Slot::Obj(v.clone()),
        (FieldType::Object(class), Value::Str(s)) if class == abi::JAVA_STRING => Slot::Str(s.clone()),
        (FieldType::Object(_) | FieldType::Array(_), Value::None) => Slot::Null,
        (FieldType::Boolean, Value::Bool(b)) => Slot::Int(i32::from(*b)),
        (FieldType::Int | FieldType::Short | FieldType::Byte | FieldType::Char, _) => Slot::Int(integer(v)?.to_i32()?),
        (FieldType::Long, _) => Slot::Long(integer(v)?.to_i64()?),
        (FieldType::Double | FieldType::Float, Value::Float(f)) => Slot::Double(*f),
        (FieldType::Double | FieldType::Float, _) => Slot::Double(integer(v)?.to_f64()?),
        (FieldType::Array(item), Value::List(items)) => {
            let items = items.borrow().iter().map(|v| to_slot(v, item)).collect::<Option<Vec<_>>>()?;
            Slot::array(items)
        }
        (FieldType::Array(item), Value::Tuple(items)) => {
            Slot::array(items.iter().map(|v| to_slot(v, item)).collect::<Option<Vec<_>>>()?)
        }
        _ => return None,
    })
}

fn integer(v: &Value) -> Option<BigInt> {
    match v {
        Value::Int(i) => Some(i.clone()),
        Value::Bool(b) => Some(BigInt::from(u8::from(*b))),
        _ => None,
    }
}

/// Convert a host value back; `ty` distinguishes `boolean` from `int`.
fn from_slot(slot: Slot, ty: Option<&FieldType>) -> Result<Value, VmError> {
    Ok(match slot {
        Slot::Null => Value::None,
        Slot::Int(i) if ty == Some(&FieldType::Boolean) => Value::Bool(i != 0),
        Slot::Int(i) => Value::int(i64::from(i)),
        Slot::Long(l) => Value::int(l),
        Slot::Double(d) => Value::Float(d),
        Slot::Str(s) => Value::Str(s),
        Slot::Obj(v) => v,
        Slot::Array(items) => {
            let item = match ty {
                Some(FieldType::Array(item)) => Some(&**item),
                _ => None,
            };
            let items = items.borrow().iter().cloned().map(|s| from_slot(s, item)).collect::<Result<_, _>>()?;
            Value::list(items)
        }
        other => return Err(VmError::OperandType { expected: "host value", got: other.kind() }),
    })
}
