//! Type-tag dispatch behind the dynamic operations: attribute access,
//! calls, operators, subscripts and the iteration protocol.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::map::Entry;
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};
use pyjvm_bytecode::abi;
use pyjvm_bytecode::{Operator, UnaryOperator};

use crate::builtins;
use crate::error::{PyErr, VmError};
use crate::number::{self, Num, NumErr};
use crate::value::{
    Args, BoundMethod, BuiltinFunction, Class, ClassKind, DictMap, Function, HashKey, Instance, IterState, ModuleKind,
    ModuleObj, SetMap, SliceObj, SuperObj, TypeTag, Value,
};
use crate::vm::{Slot, Vm};

const MAX_REPEAT: usize = 1 << 28;

/// Attach a receiver to a class attribute found by lookup.
pub(crate) fn bind(attr: Value, receiver: &Value) -> Value {
    match attr {
        Value::Function(_) => Value::BoundMethod(Rc::new(BoundMethod { receiver: receiver.clone(), func: attr })),
        Value::Builtin(b) if b.receiver.is_none() => Value::Builtin(Rc::new(BuiltinFunction {
            name: b.name,
            func: b.func,
            receiver: Some(receiver.clone()),
        })),
        Value::ClassMethod(f) => {
            let class = match receiver {
                Value::Instance(inst) => Value::Class(inst.class.clone()),
                other => other.clone(),
            };
            Value::BoundMethod(Rc::new(BoundMethod { receiver: class, func: (*f).clone() }))
        }
        Value::StaticMethod(f) => (*f).clone(),
        other => other,
    }
}

/// C3 linearization of a class with the given bases, without the class
/// itself. `None` when no consistent order exists.
pub fn c3_linearize(bases: &[Rc<Class>]) -> Option<Vec<Rc<Class>>> {
    let mut seqs: Vec<Vec<Rc<Class>>> = bases.iter().map(|b| b.mro()).collect();
    seqs.push(bases.to_vec());
    let mut out: Vec<Rc<Class>> = Vec::new();
    loop {
        seqs.retain(|s| !s.is_empty());
        if seqs.is_empty() {
            return Some(out);
        }
        let candidate = seqs
            .iter()
            .map(|s| &s[0])
            .find(|c| !seqs.iter().any(|s| s[1..].iter().any(|x| Rc::ptr_eq(x, c))))
            .cloned()?;
        for seq in &mut seqs {
            if Rc::ptr_eq(&seq[0], &candidate) {
                seq.remove(0);
            }
        }
        out.push(candidate);
    }
}

fn dunder(op: Operator) -> Option<(&'static str, &'static str)> {
    Some(match op {
        Operator::Add => ("__add__", "__radd__"),
        Operator::Sub => ("__sub__", "__rsub__"),
        Operator::Mul => ("__mul__", "__rmul__"),
        Operator::Div => ("__truediv__", "__rtruediv__"),
        Operator::FloorDiv => ("__floordiv__", "__rfloordiv__"),
        Operator::Mod => ("__mod__", "__rmod__"),
        Operator::Pow => ("__pow__", "__rpow__"),
        Operator::LShift => ("__lshift__", "__rlshift__"),
        Operator::RShift => ("__rshift__", "__rrshift__"),
        Operator::BitAnd => ("__and__", "__rand__"),
        Operator::BitOr => ("__or__", "__ror__"),
        Operator::BitXor => ("__xor__", "__rxor__"),
        _ => return None,
    })
}

fn inplace_dunder(op: Operator) -> Option<&'static str> {
    Some(match op {
        Operator::Add => "__iadd__",
        Operator::Sub => "__isub__",
        Operator::Mul => "__imul__",
        Operator::Div => "__itruediv__",
        Operator::FloorDiv => "__ifloordiv__",
        Operator::Mod => "__imod__",
        Operator::BitAnd => "__iand__",
        Operator::BitOr => "__ior__",
        Operator::BitXor => "__ixor__",
        _ => return None,
    })
}

fn satisfies(op: Operator, ord: Option<Ordering>) -> bool {
    match (op, ord) {
        (_, None) => false,
        (Operator::Lt, Some(o)) => o == Ordering::Less,
        (Operator::Le, Some(o)) => o != Ordering::Greater,
        (Operator::Gt, Some(o)) => o == Ordering::Greater,
        (Operator::Ge, Some(o)) => o != Ordering::Less,
        _ => false,
    }
}

fn as_index(v: &Value) -> Option<BigInt> {
    match v {
        Value::Int(i) => Some(i.clone()),
        Value::Bool(b) => Some(BigInt::from(u8::from(*b))),
        _ => None,
    }
}

fn is_sequence(v: &Value) -> bool {
    matches!(v, Value::Str(_) | Value::List(_) | Value::Tuple(_))
}

fn set_op(op: Operator, x: &SetMap, y: &SetMap) -> SetMap {
    let mut out = SetMap::new();
    match op {
        Operator::BitOr => {
            out.extend(x.iter().map(|(k, v)| (k.clone(), v.clone())));
            for (k, v) in y {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Operator::BitAnd => out.extend(x.iter().filter(|(k, _)| y.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone()))),
        Operator::Sub => out.extend(x.iter().filter(|(k, _)| !y.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone()))),
        _ => {
            out.extend(x.iter().filter(|(k, _)| !y.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone())));
            out.extend(y.iter().filter(|(k, _)| !x.contains_key(*k)).map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    out
}

enum Deferred {
    Enumerate(Value),
    Zip(Vec<Value>),
    Object(Value),
}

impl Vm {
    /// Build a fresh exception of a builtin class with `args`.
    pub fn err_args(&self, kind: &str, args: Vec<Value>) -> VmError {
        match self.builtins.get(kind) {
            Some(Value::Class(cls)) => {
                let mut dict = IndexMap::new();
                dict.insert("args".to_string(), Value::tuple(args));
                let inst = Instance { class: cls.clone(), dict: RefCell::new(dict) };
                VmError::Exception(PyErr { value: Value::Instance(Rc::new(inst)) })
            }
            _ => VmError::ClassNotFound(kind.to_string()),
        }
    }

    pub fn err(&self, kind: &str, msg: impl Into<String>) -> VmError {
        let msg: String = msg.into();
        self.err_args(kind, vec![Value::str(&msg)])
    }

    pub(crate) fn num_err(&self, e: NumErr) -> VmError {
        self.err(e.kind, e.msg)
    }

    /// Whether `value` is an instance of the named builtin class.
    pub(crate) fn is_builtin_instance(&self, value: &Value, class: &str) -> bool {
        match self.builtins.get(class) {
            Some(Value::Class(cls)) => self.type_of(value).is_subclass(cls),
            _ => false,
        }
    }

    pub fn type_of(&self, v: &Value) -> Rc<Class> {
        match v {
            Value::Instance(inst) => inst.class.clone(),
            other => self.types.get(other.tag()),
        }
    }

    pub fn isinstance(&self, v: &Value, cls: &Rc<Class>) -> bool {
        self.type_of(v).is_subclass(cls)
    }

    pub(crate) fn new_class(&self, name: &str, bases: Vec<Rc<Class>>) -> Result<Rc<Class>, VmError> {
        let bases = if bases.is_empty() { vec![self.types.get(TypeTag::Object)] } else { bases };
        let ancestors = c3_linearize(&bases).ok_or_else(|| {
            let names: Vec<&str> = bases.iter().map(|b| b.name.as_str()).collect();
            self.err(
                "TypeError",
                format!("Cannot create a consistent method resolution order (MRO) for bases {}", names.join(", ")),
            )
        })?;
        Ok(Rc::new(Class {
            name: name.to_string(),
            bases,
            ancestors,
            dict: RefCell::new(IndexMap::new()),
            kind: ClassKind::User,
        }))
    }

    // ---- attributes ----

    pub fn getattr(&mut self, obj: &Value, name: &str) -> Result<Value, VmError> {
        match self.lookup_attr(obj, name)? {
            Some(v) => Ok(v),
            None => Err(self.attribute_error(obj, name)),
        }
    }

    fn attribute_error(&self, obj: &Value, name: &str) -> VmError {
        let msg = match obj {
            Value::Class(c) => format!("type object '{}' has no attribute '{name}'", c.name),
            Value::Module(m) => format!("module '{}' has no attribute '{name}'", m.name),
            other => format!("'{}' object has no attribute '{name}'", other.type_name()),
        };
        self.err("AttributeError", msg)
    }

    /// Attribute lookup; `None` when the attribute does not exist.
    pub(crate) fn lookup_attr(&mut self, obj: &Value, name: &str) -> Result<Option<Value>, VmError> {
        match obj {
            Value::Instance(inst) => {
                let class_attr = inst.class.lookup(name);
                if let Some(Value::Property(p)) = &class_attr {
                    return match &p.fget {
                        Some(getter) => self.call(getter, vec![obj.clone()]).map(Some),
                        None => Err(self.err("AttributeError", format!("property '{name}' has no getter"))),
                    };
                }
                let own = inst.dict.borrow().get(name).cloned();
                if own.is_some() {
                    return Ok(own);
                }
                if name == "__class__" {
                    return Ok(Some(Value::Class(inst.class.clone())));
                }
                if let Some(attr) = class_attr {
                    return Ok(Some(bind(attr, obj)));
                }
                if name == "__cause__" && inst.class.is_exception() {
                    return Ok(Some(Value::None));
                }
                match inst.class.lookup("__getattr__") {
                    Some(hook) => self.call(&bind(hook, obj), vec![Value::str(name)]).map(Some),
                    None => Ok(None),
                }
            }
            Value::Class(cls) => Ok(match name {
                "__name__" | "__qualname__" => Some(Value::str(&cls.name)),
                "__bases__" => Some(Value::tuple(cls.bases.iter().cloned().map(Value::Class).collect())),
                "__mro__" => Some(Value::tuple(cls.mro().into_iter().map(Value::Class).collect())),
                _ => cls.lookup(name).map(|attr| match attr {
                    Value::ClassMethod(_) | Value::StaticMethod(_) => bind(attr, obj),
                    other => other,
                }),
            }),
            Value::Module(m) => self.module_attr(m, name),
            Value::Super(s) => self.super_attr(s, name),
            Value::Function(f) => Ok(match name {
                "__name__" => Some(Value::str(f.name())),
                "__qualname__" => Some(Value::str(&f.qualname)),
                _ => None,
            }),
            Value::BoundMethod(m) => match name {
                "__self__" => Ok(Some(m.receiver.clone())),
                "__func__" => Ok(Some(m.func.clone())),
                _ => {
                    let func = m.func.clone();
                    self.lookup_attr(&func, name)
                }
            },
            Value::Builtin(b) if name == "__name__" => Ok(Some(Value::str(b.name))),
            other => {
                let cls = self.type_of(other);
                Ok(cls.lookup(name).map(|attr| bind(attr, obj)))
            }
        }
    }

    fn module_attr(&mut self, m: &Rc<ModuleObj>, name: &str) -> Result<Option<Value>, VmError> {
        let direct = match &m.kind {
            ModuleKind::Unit(unit) => match self.unit(unit)?.get_static(name) {
                Slot::Obj(v) => Some(v),
                _ => None,
            },
            ModuleKind::Host(unit) => self.host_attr(unit, name)?,
            ModuleKind::Native(ns) => ns.borrow().get(name).cloned(),
        };
        if direct.is_some() {
            return Ok(direct);
        }
        if name == abi::MODULE_NAME {
            return Ok(Some(Value::str(&m.name)));
        }
        Ok(self.cached_module(&format!("{}.{}", m.name, name)))
    }

    fn super_attr(&mut self, s: &SuperObj, name: &str) -> Result<Option<Value>, VmError> {
        let start = match &s.obj {
            Value::Class(c) => c.clone(),
            other => self.type_of(other),
        };
        let mro = start.mro();
        let Some(pos) = mro.iter().position(|c| Rc::ptr_eq(c, &s.class)) else {
            return Err(self.err("TypeError", "super(type, obj): obj must be an instance or subtype of type"));
        };
        for cls in &mro[pos + 1..] {
            let found = cls.dict.borrow().get(name).cloned();
            match found {
                Some(Value::Property(p)) => {
                    return match &p.fget {
                        Some(getter) => self.call(getter, vec![s.obj.clone()]).map(Some),
                        None => Ok(None),
                    }
                }
                Some(attr) => return Ok(Some(bind(attr, &s.obj))),
                None => {}
            }
        }
        Ok(None)
    }

    pub(crate) fn super_of(&self, class: Value, receiver: Value) -> Result<Value, VmError> {
        match class {
            Value::Class(class) => Ok(Value::Super(Rc::new(SuperObj { class, obj: receiver }))),
            other => Err(self.err(
                "TypeError",
                format!("super() argument 1 must be a type, not {}", other.type_name()),
            )),
        }
    }

    pub fn setattr(&mut self, obj: &Value, name: &str, value: Value) -> Result<(), VmError> {
        match obj {
            Value::Instance(inst) => {
                if let Some(Value::Property(p)) = inst.class.lookup(name) {
                    return match &p.fset {
                        Some(setter) => self.call(setter, vec![obj.clone(), value]).map(|_| ()),
                        None => Err(self.err(
                            "AttributeError",
                            format!("property '{name}' of '{}' object has no setter", inst.class.name),
                        )),
                    };
                }
                inst.dict.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Class(cls) if cls.kind == ClassKind::User => {
                cls.dict.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Class(cls) => Err(self.err(
                "TypeError",
                format!("cannot set '{name}' attribute of immutable type '{}'", cls.name),
            )),
            Value::Module(m) => {
                match &m.kind {
                    ModuleKind::Unit(unit) => self.unit(unit)?.set_static(name, Slot::Obj(value)),
                    ModuleKind::Host(_) => {
                        return Err(self.err(
                            "TypeError",
                            format!("cannot set '{name}' attribute of host class '{}'", m.name),
                        ))
                    }
                    ModuleKind::Native(ns) => {
                        ns.borrow_mut().insert(name.to_string(), value);
                    }
                }
                Ok(())
            }
            other => Err(self.attribute_error(other, name)),
        }
    }

    pub fn delattr(&mut self, obj: &Value, name: &str) -> Result<(), VmError> {
        let removed = match obj {
            Value::Instance(inst) => inst.dict.borrow_mut().shift_remove(name).is_some(),
            Value::Class(cls) if cls.kind == ClassKind::User => cls.dict.borrow_mut().shift_remove(name).is_some(),
            Value::Module(m) => match &m.kind {
                ModuleKind::Unit(unit) => {
                    let unit = self.unit(unit)?;
                    let present = matches!(unit.get_static(name), Slot::Obj(_));
                    unit.set_static(name, Slot::Null);
                    present
                }
                ModuleKind::Host(_) => false,
                ModuleKind::Native(ns) => ns.borrow_mut().shift_remove(name).is_some(),
            },
            _ => false,
        };
        if removed {
            Ok(())
        } else {
            Err(self.attribute_error(obj, name))
        }
    }

    /// A dunder method looked up on the type, bound to the value.
    pub(crate) fn special_method(&self, v: &Value, name: &str) -> Option<Value> {
        match v {
            Value::Instance(inst) => inst.class.lookup(name).map(|attr| bind(attr, v)),
            _ => None,
        }
    }

    pub(crate) fn call_special(&mut self, v: &Value, name: &str, args: Vec<Value>) -> Result<Option<Value>, VmError> {
        match self.special_method(v, name) {
            Some(method) => self.call(&method, args).map(Some),
            None => Ok(None),
        }
    }

    // ---- calls ----

    pub fn call(&mut self, callee: &Value, positional: Vec<Value>) -> Result<Value, VmError> {
        self.call_value(callee, Args::new(positional))
    }

    pub fn call_value(&mut self, callee: &Value, mut args: Args) -> Result<Value, VmError> {
        match callee {
            Value::Function(f) => self.call_function(f, args),
            Value::BoundMethod(m) => {
                args.positional.insert(0, m.receiver.clone());
                self.call_value(&m.func, args)
            }
            Value::Builtin(b) => {
                if args.receiver.is_none() {
                    args.receiver = b.receiver.clone();
                }
                (b.func)(self, args)
            }
            Value::HostMethod(h) => self.call_host(h, args),
            Value::Class(cls) => self.instantiate(cls, args),
            Value::StaticMethod(f) => self.call_value(f, args),
            Value::Instance(_) => match self.special_method(callee, "__call__") {
                Some(method) => self.call_value(&method, args),
                None => Err(self.not_callable(callee)),
            },
            other => Err(self.not_callable(other)),
        }
    }

    fn not_callable(&self, v: &Value) -> VmError {
        self.err("TypeError", format!("'{}' object is not callable", v.type_name()))
    }

    pub(crate) fn call_function(&mut self, f: &Rc<Function>, args: Args) -> Result<Value, VmError> {
        let bound = self.bind_arguments(f, args)?;
        let unit = self.unit(&f.unit)?;
        let captures = Slot::array(f.captures.iter().cloned().map(Slot::Cell).collect());
        let arguments = Slot::array(bound.into_iter().map(Slot::Obj).collect());
        match self.invoke(&unit, &f.method, abi::FUNCTION_DESCRIPTOR, vec![captures, arguments])? {
            Slot::Obj(v) => Ok(v),
            Slot::Null => Ok(Value::None),
            other => Err(VmError::OperandType { expected: "object", got: other.kind() }),
        }
    }

    fn bind_arguments(&self, f: &Function, args: Args) -> Result<Vec<Value>, VmError> {
        let name = f.name();
        let n = f.params.len();
        let given = args.positional.len();
        if given > n {
            return Err(self.err(
                "TypeError",
                format!(
                    "{name}() takes {n} positional argument{} but {given} {} given",
                    if n == 1 { "" } else { "s" },
                    if given == 1 { "was" } else { "were" }
                ),
            ));
        }
        let mut slots: Vec<Option<Value>> = args.positional.into_iter().map(Some).collect();
        slots.resize(n, None);
        for (key, value) in args.keywords {
            let Some(i) = f.params.iter().position(|p| *p == key) else {
                return Err(self.err("TypeError", format!("{name}() got an unexpected keyword argument '{key}'")));
            };
            if slots[i].is_some() {
                return Err(self.err("TypeError", format!("{name}() got multiple values for argument '{key}'")));
            }
            slots[i] = Some(value);
        }
        let first_default = n - f.defaults.len();
        let mut missing = Vec::new();
        let mut out = Vec::with_capacity(n);
        for (i, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(v) => out.push(v),
                None if i >= first_default => out.push(f.defaults[i - first_default].clone()),
                None => missing.push(format!("'{}'", f.params[i])),
            }
        }
        if !missing.is_empty() {
            let list = match missing.as_slice() {
                [one] => one.clone(),
                [init @ .., last] if init.len() == 1 => format!("{} and {last}", init[0]),
                [init @ .., last] => format!("{}, and {last}", init.join(", ")),
                [] => String::new(),
            };
            return Err(self.err(
                "TypeError",
                format!(
                    "{name}() missing {} required positional argument{}: {list}",
                    missing.len(),
                    if missing.len() == 1 { "" } else { "s" }
                ),
            ));
        }
        Ok(out)
    }

    fn instantiate(&mut self, cls: &Rc<Class>, args: Args) -> Result<Value, VmError> {
        if let ClassKind::Builtin(tag) = cls.kind {
            return builtins::construct(self, cls, tag, args);
        }
        let mut dict = IndexMap::new();
        if cls.is_exception() {
            dict.insert("args".to_string(), Value::tuple(args.positional.clone()));
        }
        let instance = Value::Instance(Rc::new(Instance { class: cls.clone(), dict: RefCell::new(dict) }));
        if let Some(init) = cls.lookup("__init__") {
            let result = self.call_value(&bind(init, &instance), args)?;
            if !matches!(result, Value::None) {
                return Err(self.err(
                    "TypeError",
                    format!("__init__() should return None, not '{}'", result.type_name()),
                ));
            }
        }
        Ok(instance)
    }

    // ---- operators ----

    pub fn binop(&mut self, op: Operator, a: &Value, b: &Value) -> Result<Value, VmError> {
        match op {
            Operator::Eq => return Ok(Value::Bool(self.eq(a, b)?)),
            Operator::Ne => return Ok(Value::Bool(!self.eq(a, b)?)),
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => return self.rich_compare(op, a, b),
            Operator::Is => return Ok(Value::Bool(a.is(b))),
            Operator::IsNot => return Ok(Value::Bool(!a.is(b))),
            Operator::In => return Ok(Value::Bool(self.contains(b, a)?)),
            Operator::NotIn => return Ok(Value::Bool(!self.contains(b, a)?)),
            _ => {}
        }
        if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
            return number::arith(op, x, y).map_err(|e| self.num_err(e));
        }
        if let Some(v) = self.sequence_op(op, a, b)? {
            return Ok(v);
        }
        if let Some((name, rname)) = dunder(op) {
            if let Some(r) = self.call_special(a, name, vec![b.clone()])? {
                if !matches!(r, Value::NotImplemented) {
                    return Ok(r);
                }
            }
            if let Some(r) = self.call_special(b, rname, vec![a.clone()])? {
                if !matches!(r, Value::NotImplemented) {
                    return Ok(r);
                }
            }
        }
        Err(self.err(
            "TypeError",
            format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                a.type_name(),
                b.type_name()
            ),
        ))
    }

    fn sequence_op(&mut self, op: Operator, a: &Value, b: &Value) -> Result<Option<Value>, VmError> {
        Ok(Some(match (op, a, b) {
            (Operator::Add, Value::Str(x), Value::Str(y)) => Value::str(&format!("{x}{y}")),
            (Operator::Add, Value::List(x), Value::List(y)) => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                Value::list(items)
            }
            (Operator::Add, Value::Tuple(x), Value::Tuple(y)) => {
                Value::tuple(x.iter().chain(y.iter()).cloned().collect())
            }
            (Operator::Mul, seq, n) | (Operator::Mul, n, seq) if is_sequence(seq) && as_index(n).is_some() => {
                self.repeat(seq, n)?
            }
            (Operator::Mod, Value::Str(template), args) => Value::str(&self.percent_format(template, args)?),
            (Operator::BitOr | Operator::BitAnd | Operator::Sub | Operator::BitXor, Value::Set(x), Value::Set(y)) => {
                let result = set_op(op, &x.borrow(), &y.borrow());
                Value::Set(Rc::new(RefCell::new(result)))
            }
            (Operator::BitOr, Value::Dict(x), Value::Dict(y)) => {
                let mut merged = x.borrow().clone();
                merged.extend(y.borrow().iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Dict(Rc::new(RefCell::new(merged)))
            }
            _ => return Ok(None),
        }))
    }

    fn repeat(&self, seq: &Value, n: &Value) -> Result<Value, VmError> {
        let count = as_index(n).filter(|c| c.is_positive()).map_or(Some(0), |c| c.to_usize());
        let len = match seq {
            Value::Str(s) => s.len(),
            Value::List(l) => l.borrow().len(),
            Value::Tuple(t) => t.len(),
            _ => 0,
        };
        let count = count
            .filter(|c| c.saturating_mul(len.max(1)) <= MAX_REPEAT)
            .ok_or_else(|| self.err("OverflowError", "repeated sequence is too long"))?;
        Ok(match seq {
            Value::Str(s) => Value::str(&s.repeat(count)),
            Value::List(l) => {
                let items = l.borrow();
                Value::list(items.iter().cloned().cycle().take(items.len() * count).collect())
            }
            Value::Tuple(t) => Value::tuple(t.iter().cloned().cycle().take(t.len() * count).collect()),
            other => other.clone(),
        })
    }

    /// Augmented assignment: mutable builtins update in place.
    pub fn ibinop(&mut self, op: Operator, a: &Value, b: &Value) -> Result<Value, VmError> {
        match (op, a, b) {
            (Operator::Add, Value::List(l), _) => {
                let items = self.collect(b)?;
                l.borrow_mut().extend(items);
                return Ok(a.clone());
            }
            (Operator::BitOr | Operator::BitAnd | Operator::Sub | Operator::BitXor, Value::Set(s), Value::Set(other)) => {
                let result = set_op(op, &s.borrow(), &other.borrow());
                *s.borrow_mut() = result;
                return Ok(a.clone());
            }
            (_, Value::Instance(_), _) => {
                if let Some(name) = inplace_dunder(op) {
                    if let Some(r) = self.call_special(a, name, vec![b.clone()])? {
                        if !matches!(r, Value::NotImplemented) {
                            return Ok(r);
                        }
                    }
                }
            }
            _ => {}
        }
        self.binop(op, a, b)
    }

    pub fn unop(&mut self, op: UnaryOperator, v: &Value) -> Result<Value, VmError> {
        let name = match op {
            UnaryOperator::Not => return Ok(Value::Bool(!self.truth(v)?)),
            UnaryOperator::Neg => "__neg__",
            UnaryOperator::Pos => "__pos__",
            UnaryOperator::Invert => "__invert__",
        };
        match (op, Num::of(v)) {
            (UnaryOperator::Neg, Some(Num::Int(i))) => return Ok(Value::Int(-i)),
            (UnaryOperator::Neg, Some(Num::Float(f))) => return Ok(Value::Float(-f)),
            (UnaryOperator::Pos, Some(Num::Int(i))) => return Ok(Value::Int(i)),
            (UnaryOperator::Pos, Some(Num::Float(f))) => return Ok(Value::Float(f)),
            (UnaryOperator::Invert, Some(Num::Int(i))) => return Ok(Value::Int(-i - 1)),
            _ => {}
        }
        match self.call_special(v, name, Vec::new())? {
            Some(r) => Ok(r),
            None => Err(self.err(
                "TypeError",
                format!("bad operand type for unary {}: '{}'", op.symbol(), v.type_name()),
            )),
        }
    }

    pub fn eq(&mut self, a: &Value, b: &Value) -> Result<bool, VmError> {
        if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
            return Ok(number::compare(&x, &y) == Some(Ordering::Equal));
        }
        Ok(match (a, b) {
            (Value::None, Value::None) | (Value::NotImplemented, Value::NotImplemented) => true,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::List(x), Value::List(y)) => {
                if Rc::ptr_eq(x, y) {
                    return Ok(true);
                }
                let xs = x.borrow().clone();
                let ys = y.borrow().clone();
                self.seq_eq(&xs, &ys)?
            }
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_eq(x, y)?,
            (Value::Dict(x), Value::Dict(y)) => {
                let xs: Vec<(HashKey, Value)> = x.borrow().iter().map(|(k, (_, v))| (k.clone(), v.clone())).collect();
                if xs.len() != y.borrow().len() {
                    return Ok(false);
                }
                for (k, v) in xs {
                    let other = y.borrow().get(&k).map(|(_, v)| v.clone());
                    match other {
                        Some(o) if self.eq(&v, &o)? => {}
                        _ => return Ok(false),
                    }
                }
                true
            }
            (Value::Set(x), Value::Set(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                x.len() == y.len() && x.keys().all(|k| y.contains_key(k))
            }
            (Value::Range(x), Value::Range(y)) => {
                let len = x.len();
                len == y.len() && (len.is_zero() || (x.start == y.start && (len == BigInt::from(1) || x.step == y.step)))
            }
            (Value::Instance(_), _) | (_, Value::Instance(_)) => {
                if let Some(r) = self.call_special(a, "__eq__", vec![b.clone()])? {
                    if !matches!(r, Value::NotImplemented) {
                        return self.truth(&r);
                    }
                }
                if let Some(r) = self.call_special(b, "__eq__", vec![a.clone()])? {
                    if !matches!(r, Value::NotImplemented) {
                        return self.truth(&r);
                    }
                }
                a.is(b)
            }
            _ => a.is(b),
        })
    }

    fn seq_eq(&mut self, xs: &[Value], ys: &[Value]) -> Result<bool, VmError> {
        if xs.len() != ys.len() {
            return Ok(false);
        }
        for (x, y) in xs.iter().zip(ys) {
            if !self.eq(x, y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn rich_compare(&mut self, op: Operator, a: &Value, b: &Value) -> Result<Value, VmError> {
        if let (Some(x), Some(y)) = (Num::of(a), Num::of(b)) {
            return Ok(Value::Bool(satisfies(op, number::compare(&x, &y))));
        }
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => return Ok(Value::Bool(satisfies(op, Some(x.cmp(y))))),
            (Value::List(x), Value::List(y)) => {
                let xs = x.borrow().clone();
                let ys = y.borrow().clone();
                return self.seq_compare(op, &xs, &ys).map(Value::Bool);
            }
            (Value::Tuple(x), Value::Tuple(y)) => return self.seq_compare(op, x, y).map(Value::Bool),
            (Value::Set(x), Value::Set(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                let subset = |p: &SetMap, q: &SetMap| p.keys().all(|k| q.contains_key(k));
                return Ok(Value::Bool(match op {
                    Operator::Le => subset(&x, &y),
                    Operator::Lt => subset(&x, &y) && x.len() < y.len(),
                    Operator::Ge => subset(&y, &x),
                    _ => subset(&y, &x) && y.len() < x.len(),
                }));
            }
            _ => {}
        }
        let (name, reflected) = match op {
            Operator::Lt => ("__lt__", "__gt__"),
            Operator::Le => ("__le__", "__ge__"),
            Operator::Gt => ("__gt__", "__lt__"),
            _ => ("__ge__", "__le__"),
        };
        if let Some(r) = self.call_special(a, name, vec![b.clone()])? {
            if !matches!(r, Value::NotImplemented) {
                return Ok(r);
            }
        }
        if let Some(r) = self.call_special(b, reflected, vec![a.clone()])? {
            if !matches!(r, Value::NotImplemented) {
                return Ok(r);
            }
        }
        Err(self.err(
            "TypeError",
            format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                a.type_name(),
                b.type_name()
            ),
        ))
    }

    fn seq_compare(&mut self, op: Operator, xs: &[Value], ys: &[Value]) -> Result<bool, VmError> {
        for (x, y) in xs.iter().zip(ys) {
            if !self.eq(x, y)? {
                let r = self.rich_compare(op, x, y)?;
                return self.truth(&r);
            }
        }
        Ok(satisfies(op, Some(xs.len().cmp(&ys.len()))))
    }

    /// `a < b`, as used by sorting, `min` and `max`.
    pub fn lt(&mut self, a: &Value, b: &Value) -> Result<bool, VmError> {
        let r = self.rich_compare(Operator::Lt, a, b)?;
        self.truth(&r)
    }

    pub fn truth(&mut self, v: &Value) -> Result<bool, VmError> {
        Ok(match v {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => !i.is_zero(),
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Range(r) => !r.len().is_zero(),
            Value::Instance(_) => {
                if let Some(r) = self.call_special(v, "__bool__", Vec::new())? {
                    match r {
                        Value::Bool(b) => b,
                        other => {
                            return Err(self.err(
                                "TypeError",
                                format!("__bool__ should return bool, returned {}", other.type_name()),
                            ))
                        }
                    }
                } else if let Some(r) = self.call_special(v, "__len__", Vec::new())? {
                    self.len_result(r)? != 0
                } else {
                    true
                }
            }
            _ => true,
        })
    }

    fn len_result(&self, r: Value) -> Result<usize, VmError> {
        match as_index(&r) {
            Some(i) if i.is_negative() => Err(self.err("ValueError", "__len__() should return >= 0")),
            Some(i) => i.to_usize().ok_or_else(|| self.err("OverflowError", "length too large")),
            None => Err(self.err(
                "TypeError",
                format!("'{}' object cannot be interpreted as an integer", r.type_name()),
            )),
        }
    }

    pub fn len(&mut self, v: &Value) -> Result<usize, VmError> {
        match v {
            Value::Str(s) => Ok(s.chars().count()),
            Value::List(l) => Ok(l.borrow().len()),
            Value::Tuple(t) => Ok(t.len()),
            Value::Dict(d) => Ok(d.borrow().len()),
            Value::Set(s) => Ok(s.borrow().len()),
            Value::Range(r) => r.len().to_usize().ok_or_else(|| self.err("OverflowError", "range too large")),
            Value::Instance(_) => match self.call_special(v, "__len__", Vec::new())? {
                Some(r) => self.len_result(r),
                None => Err(self.no_len(v)),
            },
            other => Err(self.no_len(other)),
        }
    }

    fn no_len(&self, v: &Value) -> VmError {
        self.err("TypeError", format!("object of type '{}' has no len()", v.type_name()))
    }

    pub fn contains(&mut self, container: &Value, item: &Value) -> Result<bool, VmError> {
        match container {
            Value::Str(s) => match item {
                Value::Str(sub) => Ok(s.contains(&**sub)),
                other => Err(self.err(
                    "TypeError",
                    format!("'in <string>' requires string as left operand, not {}", other.type_name()),
                )),
            },
            Value::List(l) => {
                let items = l.borrow().clone();
                self.any_eq(&items, item)
            }
            Value::Tuple(t) => self.any_eq(t, item),
            Value::Dict(d) => {
                let key = self.hash_key(item)?;
                Ok(d.borrow().contains_key(&key))
            }
            Value::Set(s) => {
                let key = self.hash_key(item)?;
                Ok(s.borrow().contains_key(&key))
            }
            Value::Range(r) => Ok(match Num::of(item) {
                Some(Num::Int(i)) => {
                    let inside = if r.step.is_positive() {
                        r.start <= i && i < r.stop
                    } else {
                        r.stop < i && i <= r.start
                    };
                    inside && ((&i - &r.start) % &r.step).is_zero()
                }
                _ => false,
            }),
            Value::Instance(_) if self.special_method(container, "__contains__").is_some() => {
                match self.call_special(container, "__contains__", vec![item.clone()])? {
                    Some(r) => self.truth(&r),
                    None => Ok(false),
                }
            }
            _ => {
                let it = self.iter(container)?;
                while let Some(v) = self.next(&it)? {
                    if self.eq(&v, item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn any_eq(&mut self, items: &[Value], item: &Value) -> Result<bool, VmError> {
        for v in items {
            if v.is(item) || self.eq(v, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- subscripts ----

    fn seq_index(&self, key: &Value, len: usize, what: &str) -> Result<usize, VmError> {
        let Some(i) = as_index(key) else {
            return Err(self.err(
                "TypeError",
                format!("{what} indices must be integers or slices, not {}", key.type_name()),
            ));
        };
        let i = if i.is_negative() { i + BigInt::from(len) } else { i };
        i.to_usize()
            .filter(|&i| i < len)
            .ok_or_else(|| self.err("IndexError", format!("{what} index out of range")))
    }

    /// Normalised `(start, stop, step)` of a slice over a sequence of `len`.
    fn slice_bounds(&self, s: &SliceObj, len: usize) -> Result<(i64, i64, i64), VmError> {
        let bound = |v: &Value| -> Result<Option<i64>, VmError> {
            match v {
                Value::None => Ok(None),
                Value::Int(i) => Ok(Some(i.to_i64().unwrap_or(if i.is_negative() { i64::MIN } else { i64::MAX }))),
                Value::Bool(b) => Ok(Some(i64::from(*b))),
                _ => Err(self.err("TypeError", "slice indices must be integers or None")),
            }
        };
        let step = bound(&s.step)?.unwrap_or(1);
        if step == 0 {
            return Err(self.err("ValueError", "slice step cannot be zero"));
        }
        let len = len as i64;
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |v: i64| if v < 0 { v.saturating_add(len).max(lower) } else { v.min(upper) };
        let start = bound(&s.start)?.map_or(if step < 0 { upper } else { lower }, clamp);
        let stop = bound(&s.stop)?.map_or(if step < 0 { lower } else { upper }, clamp);
        Ok((start, stop, step))
    }

    fn slice_indices(&self, s: &SliceObj, len: usize) -> Result<Vec<usize>, VmError> {
        let (start, stop, step) = self.slice_bounds(s, len)?;
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            i = i.saturating_add(step);
        }
        Ok(out)
    }

    pub fn getitem(&mut self, target: &Value, key: &Value) -> Result<Value, VmError> {
        match target {
            Value::List(l) => {
                let items = l.borrow().clone();
                self.sequence_item(&items, key, "list").map(|r| match r {
                    Ok(v) => v,
                    Err(items) => Value::list(items),
                })
            }
            Value::Tuple(t) => self.sequence_item(t, key, "tuple").map(|r| match r {
                Ok(v) => v,
                Err(items) => Value::tuple(items),
            }),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                if let Value::Slice(sl) = key {
                    let idx = self.slice_indices(sl, chars.len())?;
                    return Ok(Value::str(&idx.iter().map(|&i| chars[i]).collect::<String>()));
                }
                let i = self.seq_index(key, chars.len(), "string")?;
                Ok(Value::str(&chars[i].to_string()))
            }
            Value::Range(r) => {
                let len = r.len().to_usize().unwrap_or(usize::MAX);
                if let Value::Slice(sl) = key {
                    let idx = self.slice_indices(sl, len)?;
                    return Ok(Value::list(idx.iter().map(|&i| Value::Int(r.get(&BigInt::from(i)))).collect()));
                }
                let i = self.seq_index(key, len, "range object")?;
                Ok(Value::Int(r.get(&BigInt::from(i))))
            }
            Value::Dict(d) => {
                let k = self.hash_key(key)?;
                let found = d.borrow().get(&k).map(|(_, v)| v.clone());
                found.ok_or_else(|| self.err_args("KeyError", vec![key.clone()]))
            }
            Value::Instance(_) => match self.call_special(target, "__getitem__", vec![key.clone()])? {
                Some(v) => Ok(v),
                None => Err(self.not_subscriptable(target)),
            },
            other => Err(self.not_subscriptable(other)),
        }
    }

    /// An item (`Ok`) or a slice of items (`Err`).
    fn sequence_item(&self, items: &[Value], key: &Value, what: &str) -> Result<Result<Value, Vec<Value>>, VmError> {
        if let Value::Slice(sl) = key {
            let idx = self.slice_indices(sl, items.len())?;
            return Ok(Err(idx.iter().map(|&i| items[i].clone()).collect()));
        }
        let i = self.seq_index(key, items.len(), what)?;
        Ok(Ok(items[i].clone()))
    }

    fn not_subscriptable(&self, v: &Value) -> VmError {
        self.err("TypeError", format!("'{}' object is not subscriptable", v.type_name()))
    }

    pub fn setitem(&mut self, target: &Value, key: &Value, value: Value) -> Result<(), VmError> {
        match target {
            Value::List(l) => {
                if let Value::Slice(sl) = key {
                    let new_items = self.collect(&value)?;
                    let len = l.borrow().len();
                    let (start, stop, step) = self.slice_bounds(sl, len)?;
                    if step == 1 {
                        let stop = stop.max(start);
                        l.borrow_mut().splice(start as usize..stop as usize, new_items);
                        return Ok(());
                    }
                    let idx = self.slice_indices(sl, len)?;
                    if idx.len() != new_items.len() {
                        return Err(self.err(
                            "ValueError",
                            format!(
                                "attempt to assign sequence of size {} to extended slice of size {}",
                                new_items.len(),
                                idx.len()
                            ),
                        ));
                    }
                    let mut list = l.borrow_mut();
                    for (i, v) in idx.into_iter().zip(new_items) {
                        list[i] = v;
                    }
                    return Ok(());
                }
                let len = l.borrow().len();
                let i = self.seq_index(key, len, "list assignment")?;
                l.borrow_mut()[i] = value;
                Ok(())
            }
            Value::Dict(d) => {
                let k = self.hash_key(key)?;
                match d.borrow_mut().entry(k) {
                    Entry::Occupied(mut e) => e.get_mut().1 = value,
                    Entry::Vacant(e) => {
                        e.insert((key.clone(), value));
                    }
                }
                Ok(())
            }
            Value::Instance(_) => match self.call_special(target, "__setitem__", vec![key.clone(), value])? {
                Some(_) => Ok(()),
                None => Err(self.no_item_assignment(target)),
            },
            other => Err(self.no_item_assignment(other)),
        }
    }

    fn no_item_assignment(&self, v: &Value) -> VmError {
        self.err("TypeError", format!("'{}' object does not support item assignment", v.type_name()))
    }

    pub fn delitem(&mut self, target: &Value, key: &Value) -> Result<(), VmError> {
        match target {
            Value::List(l) => {
                let len = l.borrow().len();
                if let Value::Slice(sl) = key {
                    let mut idx = self.slice_indices(sl, len)?;
                    idx.sort_unstable();
                    let mut list = l.borrow_mut();
                    for i in idx.into_iter().rev() {
                        list.remove(i);
                    }
                    return Ok(());
                }
                let i = self.seq_index(key, len, "list assignment")?;
                l.borrow_mut().remove(i);
                Ok(())
            }
            Value::Dict(d) => {
                let k = self.hash_key(key)?;
                let removed = d.borrow_mut().shift_remove(&k);
                match removed {
                    Some(_) => Ok(()),
                    None => Err(self.err_args("KeyError", vec![key.clone()])),
                }
            }
            Value::Instance(_) => match self.call_special(target, "__delitem__", vec![key.clone()])? {
                Some(_) => Ok(()),
                None => Err(self.err(
                    "TypeError",
                    format!("'{}' object does not support item deletion", target.type_name()),
                )),
            },
            other => Err(self.err(
                "TypeError",
                format!("'{}' object does not support item deletion", other.type_name()),
            )),
        }
    }

    // ---- hashing and containers ----

    pub fn hash_key(&mut self, v: &Value) -> Result<HashKey, VmError> {
        Ok(match v {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(BigInt::from(u8::from(*b))),
            Value::Int(i) => HashKey::Int(i.clone()),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => match BigInt::from_f64(*f) {
                Some(i) => HashKey::Int(i),
                None => HashKey::Float(f.to_bits()),
            },
            Value::Float(f) => HashKey::Float(f.to_bits()),
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in items.iter() {
                    keys.push(self.hash_key(item)?);
                }
                HashKey::Tuple(keys)
            }
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Slice(_) => {
                return Err(self.err("TypeError", format!("unhashable type: '{}'", v.type_name())))
            }
            other => HashKey::Identity(other.identity().unwrap_or(0)),
        })
    }

    pub fn make_set(&mut self, items: Vec<Value>) -> Result<Value, VmError> {
        let mut map = SetMap::new();
        for item in items {
            let key = self.hash_key(&item)?;
            map.entry(key).or_insert(item);
        }
        Ok(Value::Set(Rc::new(RefCell::new(map))))
    }

    pub fn make_dict(&mut self, pairs: Vec<(Value, Value)>) -> Result<Value, VmError> {
        let mut map = DictMap::new();
        for (k, v) in pairs {
            let key = self.hash_key(&k)?;
            match map.entry(key) {
                Entry::Occupied(mut e) => e.get_mut().1 = v,
                Entry::Vacant(e) => {
                    e.insert((k, v));
                }
            }
        }
        Ok(Value::Dict(Rc::new(RefCell::new(map))))
    }

    // ---- iteration ----

    pub fn iter(&mut self, v: &Value) -> Result<Value, VmError> {
        let state = match v {
            Value::List(_) | Value::Tuple(_) => IterState::Seq { seq: v.clone(), index: 0 },
            Value::Str(s) => IterState::Items { items: s.chars().map(|c| Value::str(&c.to_string())).collect(), index: 0 },
            Value::Range(r) => IterState::Range { next: r.start.clone(), stop: r.stop.clone(), step: r.step.clone() },
            Value::Dict(d) => IterState::Items { items: d.borrow().values().map(|(k, _)| k.clone()).collect(), index: 0 },
            Value::Set(s) => IterState::Items { items: s.borrow().values().cloned().collect(), index: 0 },
            Value::Iterator(_) => return Ok(v.clone()),
            Value::Instance(_) => match self.call_special(v, "__iter__", Vec::new())? {
                Some(it @ Value::Iterator(_)) => return Ok(it),
                Some(other) if self.special_method(&other, "__next__").is_some() => IterState::Object(other),
                Some(other) => {
                    return Err(self.err(
                        "TypeError",
                        format!("iter() returned non-iterator of type '{}'", other.type_name()),
                    ))
                }
                None => return Err(self.not_iterable(v)),
            },
            other => return Err(self.not_iterable(other)),
        };
        Ok(Value::iterator(state))
    }

    fn not_iterable(&self, v: &Value) -> VmError {
        self.err("TypeError", format!("'{}' object is not iterable", v.type_name()))
    }

    /// Advance an iterator; `None` once it is exhausted.
    pub fn next(&mut self, it: &Value) -> Result<Option<Value>, VmError> {
        let state = match it {
            Value::Iterator(state) => state,
            Value::Instance(_) => return self.call_next(it),
            other => {
                return Err(self.err("TypeError", format!("'{}' object is not an iterator", other.type_name())))
            }
        };
        let deferred = {
            let mut st = state.borrow_mut();
            match &mut *st {
                IterState::Seq { seq, index } => {
                    let item = match seq {
                        Value::List(l) => l.borrow().get(*index).cloned(),
                        Value::Tuple(t) => t.get(*index).cloned(),
                        _ => None,
                    };
                    if item.is_some() {
                        *index += 1;
                    }
                    return Ok(item);
                }
                IterState::Range { next, stop, step } => {
                    let more = if step.is_positive() { *next < *stop } else { *next > *stop };
                    if !more {
                        return Ok(None);
                    }
                    let value = next.clone();
                    *next += &*step;
                    return Ok(Some(Value::Int(value)));
                }
                IterState::Items { items, index } => {
                    let item = items.get(*index).cloned();
                    if item.is_some() {
                        *index += 1;
                    }
                    return Ok(item);
                }
                IterState::Enumerate { inner, .. } => Deferred::Enumerate(inner.clone()),
                IterState::Zip { iters } => Deferred::Zip(iters.clone()),
                IterState::Object(obj) => Deferred::Object(obj.clone()),
            }
        };
        match deferred {
            Deferred::Enumerate(inner) => {
                let Some(item) = self.next(&inner)? else { return Ok(None) };
                let mut st = state.borrow_mut();
                let IterState::Enumerate { count, .. } = &mut *st else { return Ok(None) };
                let index = count.clone();
                *count += 1u32;
                Ok(Some(Value::tuple(vec![Value::Int(index), item])))
            }
            Deferred::Zip(iters) => {
                if iters.is_empty() {
                    return Ok(None);
                }
                let mut items = Vec::with_capacity(iters.len());
                for inner in &iters {
                    match self.next(inner)? {
                        Some(v) => items.push(v),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::tuple(items)))
            }
            Deferred::Object(obj) => self.call_next(&obj),
        }
    }

    fn call_next(&mut self, obj: &Value) -> Result<Option<Value>, VmError> {
        match self.call_special(obj, "__next__", Vec::new()) {
            Ok(Some(v)) => Ok(Some(v)),
            Ok(None) => Err(self.err("TypeError", format!("'{}' object is not an iterator", obj.type_name()))),
            Err(VmError::Exception(e)) if self.is_builtin_instance(&e.value, "StopIteration") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drain any iterable into a vector.
    pub fn collect(&mut self, v: &Value) -> Result<Vec<Value>, VmError> {
        match v {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Tuple(t) => Ok(t.to_vec()),
            _ => {
                let it = self.iter(v)?;
                let mut out = Vec::new();
                while let Some(item) = self.next(&it)? {
                    out.push(item);
                }
                Ok(out)
            }
        }
    }

    /// Destructure exactly `count` items out of an iterable.
    pub fn unpack(&mut self, v: &Value, count: usize) -> Result<Vec<Value>, VmError> {
        let items = self.collect(v)?;
        match items.len().cmp(&count) {
            Ordering::Equal => Ok(items),
            Ordering::Less => Err(self.err(
                "ValueError",
                format!("not enough values to unpack (expected {count}, got {})", items.len()),
            )),
            Ordering::Greater => Err(self.err("ValueError", format!("too many values to unpack (expected {count})"))),
        }
    }

    /// Stable merge sort driven by `<`, so that comparison errors propagate.
    pub fn sort_values(&mut self, items: Vec<(Value, Value)>, reverse: bool) -> Result<Vec<Value>, VmError> {
        let mut items = items;
        if reverse {
            items.reverse();
        }
        let mut sorted = self.merge_sort(items)?;
        if reverse {
            sorted.reverse();
        }
        Ok(sorted.into_iter().map(|(_, v)| v).collect())
    }

    fn merge_sort(&mut self, mut items: Vec<(Value, Value)>) -> Result<Vec<(Value, Value)>, VmError> {
        if items.len() <= 1 {
            return Ok(items);
        }
        let right = items.split_off(items.len() / 2);
        let left = self.merge_sort(items)?;
        let right = self.merge_sort(right)?;
        let mut out = Vec::with_capacity(left.len() + right.len());
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        loop {
            let take_right = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => self.lt(&r.0, &l.0)?,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (None, None) => break,
            };
            let next = if take_right { right.next() } else { left.next() };
            out.extend(next);
        }
        Ok(out)
    }
}
