//! The `pylib/Dyn` entry points: unmarshal host operands, dispatch to the
//! dynamic operations, marshal the result back.

use std::rc::Rc;

use num_bigint::BigInt;
use pyjvm_bytecode::abi;
use pyjvm_bytecode::{Operator, RuntimeEntry, UnaryOperator};

use crate::error::{PyErr, VmError};
use crate::value::{Args, Cell, ClassKind, Function, SliceObj, TypeTag, Value};
use crate::vm::{Slot, Vm};

/// Sequential reader over the operands of one entry-point call.
struct Operands {
    items: std::vec::IntoIter<Slot>,
    entry: &'static str,
}

impl Operands {
    fn next(&mut self) -> Result<Slot, VmError> {
        self.items.next().ok_or(VmError::NullReference(self.entry))
    }

    fn value(&mut self) -> Result<Value, VmError> {
        match self.next()? {
            Slot::Obj(v) => Ok(v),
            Slot::Exc(e) => Ok(e.value),
            Slot::Null => Err(VmError::NullReference(self.entry)),
            other => Err(VmError::OperandType { expected: "object", got: other.kind() }),
        }
    }

    fn opt_value(&mut self) -> Result<Option<Value>, VmError> {
        match self.next()? {
            Slot::Null => Ok(None),
            Slot::Obj(v) => Ok(Some(v)),
            Slot::Exc(e) => Ok(Some(e.value)),
            other => Err(VmError::OperandType { expected: "object", got: other.kind() }),
        }
    }

    fn string(&mut self) -> Result<Rc<str>, VmError> {
        match self.next()? {
            Slot::Str(s) => Ok(s),
            other => Err(VmError::OperandType { expected: "string", got: other.kind() }),
        }
    }

    fn int(&mut self) -> Result<i32, VmError> {
        self.next()?.int()
    }

    fn long(&mut self) -> Result<i64, VmError> {
        match self.next()? {
            Slot::Long(l) => Ok(l),
            other => Err(VmError::OperandType { expected: "long", got: other.kind() }),
        }
    }

    fn double(&mut self) -> Result<f64, VmError> {
        match self.next()? {
            Slot::Double(d) => Ok(d),
            other => Err(VmError::OperandType { expected: "double", got: other.kind() }),
        }
    }

    fn cell(&mut self) -> Result<Cell, VmError> {
        match self.next()? {
            Slot::Cell(c) => Ok(c),
            other => Err(VmError::OperandType { expected: "cell", got: other.kind() }),
        }
    }

    fn exception(&mut self) -> Result<Option<PyErr>, VmError> {
        match self.next()? {
            Slot::Null => Ok(None),
            Slot::Exc(e) => Ok(Some(e)),
            other => Err(VmError::OperandType { expected: "exception", got: other.kind() }),
        }
    }

    fn array(&mut self) -> Result<Vec<Slot>, VmError> {
        let array = self.next()?.into_array()?;
        let items = array.borrow().clone();
        Ok(items)
    }

    fn values(&mut self) -> Result<Vec<Value>, VmError> {
        let entry = self.entry;
        self.array()?
            .into_iter()
            .map(|slot| match slot {
                Slot::Obj(v) => Ok(v),
                Slot::Null => Err(VmError::NullReference(entry)),
                other => Err(VmError::OperandType { expected: "object", got: other.kind() }),
            })
            .collect()
    }

    fn strings(&mut self) -> Result<Vec<String>, VmError> {
        self.array()?
            .into_iter()
            .map(|slot| match slot {
                Slot::Str(s) => Ok(s.to_string()),
                other => Err(VmError::OperandType { expected: "string", got: other.kind() }),
            })
            .collect()
    }

    fn cells(&mut self) -> Result<Vec<Cell>, VmError> {
        self.array()?
            .into_iter()
            .map(|slot| match slot {
                Slot::Cell(c) => Ok(c),
                other => Err(VmError::OperandType { expected: "cell", got: other.kind() }),
            })
            .collect()
    }
}

fn obj(v: Value) -> Slot {
    Slot::Obj(v)
}

fn flag(b: bool) -> Slot {
    Slot::Int(i32::from(b))
}

impl Vm {
    pub(crate) fn native(&mut self, entry: RuntimeEntry, args: Vec<Slot>) -> Result<Slot, VmError> {
        use RuntimeEntry as E;
        let mut a = Operands { items: args.into_iter(), entry: entry.method().name };
        Ok(match entry {
            E::GetAttr => {
                let target = a.value()?;
                let name = a.string()?;
                obj(self.getattr(&target, &name)?)
            }
            E::SetAttr => {
                let target = a.value()?;
                let name = a.string()?;
                let value = a.value()?;
                self.setattr(&target, &name, value)?;
                Slot::Null
            }
            E::DelAttr => {
                let target = a.value()?;
                let name = a.string()?;
                self.delattr(&target, &name)?;
                Slot::Null
            }
            E::Call => {
                let callee = a.value()?;
                let positional = a.values()?;
                obj(self.call_value(&callee, Args::new(positional))?)
            }
            E::CallKw => {
                let callee = a.value()?;
                let positional = a.values()?;
                let names = a.strings()?;
                let values = a.values()?;
                let keywords = names.into_iter().zip(values).collect();
                obj(self.call_value(&callee, Args { receiver: None, positional, keywords })?)
            }
            E::BinaryOp | E::InplaceOp => {
                let code = a.int()?;
                let op = Operator::from_code(code).ok_or(VmError::InvalidOperator(code))?;
                let left = a.value()?;
                let right = a.value()?;
                if entry == E::BinaryOp {
                    obj(self.binop(op, &left, &right)?)
                } else {
                    obj(self.ibinop(op, &left, &right)?)
                }
            }
            E::UnaryOp => {
                let code = a.int()?;
                let op = UnaryOperator::from_code(code).ok_or(VmError::InvalidOperator(code))?;
                let operand = a.value()?;
                obj(self.unop(op, &operand)?)
            }
            E::GetItem => {
                let target = a.value()?;
                let key = a.value()?;
                obj(self.getitem(&target, &key)?)
            }
            E::SetItem => {
                let target = a.value()?;
                let key = a.value()?;
                let value = a.value()?;
                self.setitem(&target, &key, value)?;
                Slot::Null
            }
            E::DelItem => {
                let target = a.value()?;
                let key = a.value()?;
                self.delitem(&target, &key)?;
                Slot::Null
            }
            E::Slice => {
                let start = a.opt_value()?.unwrap_or(Value::None);
                let stop = a.opt_value()?.unwrap_or(Value::None);
                let step = a.opt_value()?.unwrap_or(Value::None);
                obj(Value::Slice(Rc::new(SliceObj { start, stop, step })))
            }
            E::Iter => {
                let target = a.value()?;
                obj(self.iter(&target)?)
            }
            E::Next => {
                let it = a.value()?;
                self.next(&it)?.map_or(Slot::Null, obj)
            }
            E::Truth => {
                let v = a.value()?;
                flag(self.truth(&v)?)
            }
            E::Int => obj(Value::int(a.long()?)),
            E::BigInt => {
                let digits = a.string()?;
                let value = digits
                    .parse::<BigInt>()
                    .map_err(|_| VmError::OperandType { expected: "decimal integer literal", got: "string" })?;
                obj(Value::Int(value))
            }
            E::Float => obj(Value::Float(a.double()?)),
            E::Str => obj(Value::Str(a.string()?)),
            E::Bool => obj(Value::Bool(a.int()? != 0)),
            E::List => obj(Value::list(a.values()?)),
            E::Tuple => obj(Value::tuple(a.values()?)),
            E::Set => {
                let items = a.values()?;
                obj(self.make_set(items)?)
            }
            E::Dict => {
                let flat = a.values()?;
                let mut pairs = Vec::with_capacity(flat.len() / 2);
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                obj(self.make_dict(pairs)?)
            }
            E::ListAppend => {
                let list = a.value()?;
                let item = a.value()?;
                match list {
                    Value::List(l) => l.borrow_mut().push(item),
                    other => return Err(VmError::OperandType { expected: "list", got: other.tag().name() }),
                }
                Slot::Null
            }
            E::SetAdd => {
                let set = a.value()?;
                let item = a.value()?;
                match set {
                    Value::Set(s) => {
                        let key = self.hash_key(&item)?;
                        s.borrow_mut().entry(key).or_insert(item);
                    }
                    other => return Err(VmError::OperandType { expected: "set", got: other.tag().name() }),
                }
                Slot::Null
            }
            E::MakeFunction => {
                let unit = a.string()?.to_string();
                let method = a.string()?.to_string();
                let qualname = a.string()?.to_string();
                let params = a.strings()?;
                let defaults = a.values()?;
                let captures = a.cells()?;
                if defaults.len() > params.len() {
                    return Err(VmError::OperandType { expected: "at most one default per parameter", got: "array" });
                }
                obj(Value::Function(Rc::new(Function { qualname, unit, method, params, defaults, captures })))
            }
            E::MakeClass => {
                let unit = a.string()?;
                let name = a.string()?;
                let bases = a.values()?;
                let captures = a.cells()?;
                obj(self.make_class(&unit, &name, bases, captures)?)
            }
            E::Publish => {
                let namespace = a.value()?;
                let name = a.string()?;
                let value = a.value()?;
                match namespace {
                    Value::Class(cls) => {
                        cls.dict.borrow_mut().insert(name.to_string(), value);
                    }
                    other => self.setattr(&other, &name, value)?,
                }
                Slot::Null
            }
            E::SuperOf => {
                let class = a.value()?;
                let receiver = a.value()?;
                obj(self.super_of(class, receiver)?)
            }
            E::ImportModule => {
                let name = a.string()?;
                obj(self.import(&name)?)
            }
            E::ImportFrom => {
                let module = a.value()?;
                let name = a.string()?;
                obj(self.import_from(&module, &name)?)
            }
            E::Builtin => {
                let name = a.string()?;
                obj(self.builtin(&name)?)
            }
            E::CheckLocal => {
                let value = a.opt_value()?;
                let name = a.string()?;
                match value {
                    Some(v) => obj(v),
                    None => {
                        return Err(self.err(
                            "UnboundLocalError",
                            format!("cannot access local variable '{name}' where it is not associated with a value"),
                        ))
                    }
                }
            }
            E::CheckGlobal => {
                let value = a.opt_value()?;
                let name = a.string()?;
                match value {
                    Some(v) => obj(v),
                    None => obj(self.builtin(&name)?),
                }
            }
            E::Raise => {
                let exc = a.value()?;
                let cause = a.opt_value()?;
                Slot::Exc(self.make_exception(exc, cause)?)
            }
            E::Reraise => match self.err("RuntimeError", "No active exception to reraise") {
                VmError::Exception(e) => Slot::Exc(e),
                other => return Err(other),
            },
            E::ExcMatch => {
                let exc = a.value()?;
                let pattern = a.value()?;
                flag(self.exception_matches(&exc, &pattern)?)
            }
            E::AssertFail => {
                let message = a.opt_value()?;
                let class = self.builtin("AssertionError")?;
                let positional = message.into_iter().collect();
                let value = self.call_value(&class, Args::new(positional))?;
                Slot::Exc(PyErr { value })
            }
            E::Enter => {
                let manager = a.value()?;
                obj(self.enter(&manager)?)
            }
            E::Exit => {
                let manager = a.value()?;
                let exc = a.exception()?;
                flag(self.exit(&manager, exc)?)
            }
            E::Unpack => {
                let seq = a.value()?;
                let count = a.int()?;
                let count = usize::try_from(count).map_err(|_| VmError::ArrayIndex(i64::from(count)))?;
                let items = self.unpack(&seq, count)?;
                Slot::array(items.into_iter().map(Slot::Obj).collect())
            }
            E::CellInit => {
                a.cell()?;
                Slot::Null
            }
            E::CellGet => {
                let cell = a.cell()?;
                let value = cell.borrow().clone();
                value.map_or(Slot::Null, obj)
            }
            E::CellSet => {
                let cell = a.cell()?;
                let value = a.opt_value()?;
                *cell.borrow_mut() = value;
                Slot::Null
            }
            E::ExceptionValue => match a.exception()? {
                Some(e) => obj(e.value),
                None => return Err(VmError::NullReference("value")),
            },
        })
    }

    pub(crate) fn builtin(&self, name: &str) -> Result<Value, VmError> {
        self.builtins
            .get(name)
            .cloned()
            .ok_or_else(|| self.err("NameError", format!("name '{name}' is not defined")))
    }

    fn make_class(&mut self, unit_name: &str, name: &str, bases: Vec<Value>, captures: Vec<Cell>) -> Result<Value, VmError> {
        let mut classes = Vec::with_capacity(bases.len());
        for base in bases {
            match base {
                Value::Class(cls) => {
                    if let ClassKind::Builtin(tag) = cls.kind {
                        if tag != TypeTag::Object {
                            return Err(self.err(
                                "TypeError",
                                format!("subclassing builtin type '{}' is not supported", cls.name),
                            ));
                        }
                    }
                    classes.push(cls);
                }
                other => {
                    return Err(self.err(
                        "TypeError",
                        format!("bases must be classes, not '{}'", other.type_name()),
                    ))
                }
            }
        }
        let class = self.new_class(name, classes)?;
        let value = Value::Class(class);
        let unit = self.unit(unit_name)?;
        self.ensure_init(&unit)?;
        unit.set_static(abi::CLASS_FIELD, Slot::Obj(value.clone()));
        let captures = Slot::array(captures.into_iter().map(Slot::Cell).collect());
        let args = Slot::array(vec![Slot::Obj(value.clone())]);
        self.invoke(&unit, abi::CLASS_BODY, abi::FUNCTION_DESCRIPTOR, vec![captures, args])?;
        Ok(value)
    }

    fn import_from(&mut self, module: &Value, name: &str) -> Result<Value, VmError> {
        if let Some(v) = self.lookup_attr(module, name)? {
            return Ok(v);
        }
        let Value::Module(m) = module else {
            return Err(self.err("ImportError", format!("cannot import name '{name}'")));
        };
        let submodule = format!("{}.{}", m.name, name);
        match self.import(&submodule) {
            Ok(v) => Ok(v),
            Err(e) if e.as_exception().is_some() => Err(self.err(
                "ImportError",
                format!("cannot import name '{name}' from '{}'", m.name),
            )),
            Err(e) => Err(e),
        }
    }

    /// Normalise the operand of `raise` into an exception instance.
    fn make_exception(&mut self, exc: Value, cause: Option<Value>) -> Result<PyErr, VmError> {
        let value = self.exception_instance(exc)?;
        if let Some(cause) = cause {
            let cause = match cause {
                Value::None => Value::None,
                other => self.exception_instance(other)?,
            };
            if let Value::Instance(inst) = &value {
                inst.dict.borrow_mut().insert("__cause__".to_string(), cause);
            }
        }
        Ok(PyErr { value })
    }

    fn exception_instance(&mut self, exc: Value) -> Result<Value, VmError> {
        match &exc {
            Value::Class(cls) if cls.is_exception() => self.call_value(&exc, Args::new(Vec::new())),
            Value::Instance(inst) if inst.class.is_exception() => Ok(exc),
            _ => Err(self.err("TypeError", "exceptions must derive from BaseException")),
        }
    }

    fn exception_matches(&mut self, exc: &Value, pattern: &Value) -> Result<bool, VmError> {
        match pattern {
            Value::Tuple(items) => {
                for item in items.iter() {
                    if self.exception_matches(exc, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Class(cls) if cls.is_exception() => Ok(self.type_of(exc).is_subclass(cls)),
            _ => Err(self.err(
                "TypeError",
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    fn enter(&mut self, manager: &Value) -> Result<Value, VmError> {
        match self.call_special(manager, "__enter__", Vec::new())? {
            Some(v) => Ok(v),
            None => Err(self.err(
                "TypeError",
                format!("'{}' object does not support the context manager protocol", manager.type_name()),
            )),
        }
    }

    fn exit(&mut self, manager: &Value, exc: Option<PyErr>) -> Result<bool, VmError> {
        let args = match exc {
            Some(e) => {
                let class = Value::Class(self.type_of(&e.value));
                vec![class, e.value, Value::None]
            }
            None => vec![Value::None, Value::None, Value::None],
        };
        match self.call_special(manager, "__exit__", args)? {
            Some(v) => self.truth(&v),
            None => Err(self.err(
                "TypeError",
                format!("'{}' object does not support the context manager protocol", manager.type_name()),
            )),
        }
    }
}
