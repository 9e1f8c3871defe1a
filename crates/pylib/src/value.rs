use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::error::VmError;
use crate::vm::Vm;

/// A capture-record slot. `None` means the variable is not bound yet.
pub type Cell = Rc<RefCell<Option<Value>>>;
pub type Namespace = RefCell<IndexMap<String, Value>>;
pub type DictMap = IndexMap<HashKey, (Value, Value)>;
pub type SetMap = IndexMap<HashKey, Value>;

/// A dynamically-typed value. Every runtime object the emitted code sees
/// through the `PyObject` interface is one of these.
#[derive(Clone)]
pub enum Value {
    None,
    NotImplemented,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<DictMap>>),
    Set(Rc<RefCell<SetMap>>),
    Range(Rc<RangeObj>),
    Slice(Rc<SliceObj>),
    Iterator(Rc<RefCell<IterState>>),
    Function(Rc<Function>),
    BoundMethod(Rc<BoundMethod>),
    Builtin(Rc<BuiltinFunction>),
    HostMethod(Rc<HostMethod>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Module(Rc<ModuleObj>),
    Super(Rc<SuperObj>),
    Property(Rc<Property>),
    StaticMethod(Rc<Value>),
    ClassMethod(Rc<Value>),
}

/// Type tags used for dispatch on builtin values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Object,
    NoneType,
    NotImplementedType,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    Range,
    Slice,
    Iterator,
    Function,
    Method,
    BuiltinFunction,
    Type,
    Module,
    Super,
    Property,
    StaticMethod,
    ClassMethod,
}

impl TypeTag {
    /// Every tag, in declaration order.
    pub const ALL: [TypeTag; 23] = [
        TypeTag::Object,
        TypeTag::NoneType,
        TypeTag::NotImplementedType,
        TypeTag::Bool,
        TypeTag::Int,
        TypeTag::Float,
        TypeTag::Str,
        TypeTag::List,
        TypeTag::Tuple,
        TypeTag::Dict,
        TypeTag::Set,
        TypeTag::Range,
        TypeTag::Slice,
        TypeTag::Iterator,
        TypeTag::Function,
        TypeTag::Method,
        TypeTag::BuiltinFunction,
        TypeTag::Type,
        TypeTag::Module,
        TypeTag::Super,
        TypeTag::Property,
        TypeTag::StaticMethod,
        TypeTag::ClassMethod,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Object => "object",
            TypeTag::NoneType => "NoneType",
            TypeTag::NotImplementedType => "NotImplementedType",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::List => "list",
            TypeTag::Tuple => "tuple",
            TypeTag::Dict => "dict",
            TypeTag::Set => "set",
            TypeTag::Range => "range",
            TypeTag::Slice => "slice",
            TypeTag::Iterator => "iterator",
            TypeTag::Function => "function",
            TypeTag::Method => "method",
            TypeTag::BuiltinFunction => "builtin_function_or_method",
            TypeTag::Type => "type",
            TypeTag::Module => "module",
            TypeTag::Super => "super",
            TypeTag::Property => "property",
            TypeTag::StaticMethod => "staticmethod",
            TypeTag::ClassMethod => "classmethod",
        }
    }
}

pub struct RangeObj {
    pub start: BigInt,
    pub stop: BigInt,
    pub step: BigInt,
}

impl RangeObj {
    pub fn len(&self) -> BigInt {
        let zero = BigInt::zero();
        if self.step > zero && self.start < self.stop {
            (&self.stop - &self.start - 1) / &self.step + 1
        } else if self.step < zero && self.start > self.stop {
            (&self.start - &self.stop - 1) / (-&self.step) + 1
        } else {
            zero
        }
    }

    pub fn get(&self, index: &BigInt) -> BigInt {
        &self.start + &self.step * index
    }
}

pub struct SliceObj {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

pub enum IterState {
    /// Walks a list or tuple by index, observing later mutation.
    Seq { seq: Value, index: usize },
    Range { next: BigInt, stop: BigInt, step: BigInt },
    Items { items: Vec<Value>, index: usize },
    Enumerate { inner: Value, count: BigInt },
    Zip { iters: Vec<Value> },
    /// An instance implementing `__next__`.
    Object(Value),
}

pub struct Function {
    pub qualname: String,
    pub unit: String,
    pub method: String,
    pub params: Vec<String>,
    /// Defaults for the trailing parameters.
    pub defaults: Vec<Value>,
    pub captures: Vec<Cell>,
}

impl Function {
    pub fn name(&self) -> &str {
        self.qualname.rsplit('.').next().unwrap_or(&self.qualname)
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

pub struct Args {
    pub receiver: Option<Value>,
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Args { receiver: None, positional, keywords: Vec::new() }
    }

    /// The bound receiver, or the first positional argument for unbound
    /// calls such as `str.upper(s)`.
    pub fn take_receiver(&mut self) -> Option<Value> {
        match self.receiver.take() {
            Some(r) => Some(r),
            None if !self.positional.is_empty() => Some(self.positional.remove(0)),
            None => None,
        }
    }

    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let pos = self.keywords.iter().position(|(k, _)| k == name)?;
        Some(self.keywords.remove(pos).1)
    }
}

pub type NativeFn = fn(&mut Vm, Args) -> Result<Value, VmError>;

pub struct BuiltinFunction {
    pub name: &'static str,
    pub func: NativeFn,
    pub receiver: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// A builtin type; instances are native values.
    Builtin(TypeTag),
    /// `BaseException` and its builtin subclasses.
    Exception,
    User,
}

pub struct Class {
    pub name: String,
    pub bases: Vec<Rc<Class>>,
    /// Linearization without the class itself.
    pub ancestors: Vec<Rc<Class>>,
    pub dict: Namespace,
    pub kind: ClassKind,
}

impl Class {
    pub fn mro(self: &Rc<Self>) -> Vec<Rc<Class>> {
        let mut mro = Vec::with_capacity(self.ancestors.len() + 1);
        mro.push(self.clone());
        mro.extend(self.ancestors.iter().cloned());
        mro
    }

    pub fn lookup(self: &Rc<Self>, name: &str) -> Option<Value> {
        if let Some(v) = self.dict.borrow().get(name) {
            return Some(v.clone());
        }
        self.ancestors.iter().find_map(|c| c.dict.borrow().get(name).cloned())
    }

    pub fn is_subclass(self: &Rc<Self>, other: &Rc<Class>) -> bool {
        Rc::ptr_eq(self, other) || self.ancestors.iter().any(|c| Rc::ptr_eq(c, other))
    }

    pub fn is_exception(self: &Rc<Self>) -> bool {
        self.kind == ClassKind::Exception || self.ancestors.iter().any(|c| c.kind == ClassKind::Exception)
    }
}

pub struct Instance {
    pub class: Rc<Class>,
    pub dict: Namespace,
}

pub enum ModuleKind {
    /// Attributes are the static fields of a loaded unit.
    Unit(String),
    /// A unit not compiled from Python: static fields and static methods.
    Host(String),
    Native(Namespace),
}

/// The static methods named `name` of a host unit. The overload is chosen
/// per call from the argument count and types.
pub struct HostMethod {
    pub unit: String,
    pub name: String,
}

pub struct ModuleObj {
    pub name: String,
    pub kind: ModuleKind,
}

pub struct SuperObj {
    pub class: Rc<Class>,
    pub obj: Value,
}

pub struct Property {
    pub fget: Option<Value>,
    pub fset: Option<Value>,
}

/// Hashable projection of a value, used as dict and set key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(BigInt),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
    Identity(usize),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn int(i: i64) -> Value {
        Value::Int(BigInt::from(i))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn iterator(state: IterState) -> Value {
        Value::Iterator(Rc::new(RefCell::new(state)))
    }

    pub fn tag(&self) -> TypeTag {
        match self {
            Value::None => TypeTag::NoneType,
            Value::NotImplemented => TypeTag::NotImplementedType,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::Dict(_) => TypeTag::Dict,
            Value::Set(_) => TypeTag::Set,
            Value::Range(_) => TypeTag::Range,
            Value::Slice(_) => TypeTag::Slice,
            Value::Iterator(_) => TypeTag::Iterator,
            Value::Function(_) => TypeTag::Function,
            Value::BoundMethod(_) => TypeTag::Method,
            Value::Builtin(_) | Value::HostMethod(_) => TypeTag::BuiltinFunction,
            Value::Class(_) => TypeTag::Type,
            Value::Instance(_) => TypeTag::Object,
            Value::Module(_) => TypeTag::Module,
            Value::Super(_) => TypeTag::Super,
            Value::Property(_) => TypeTag::Property,
            Value::StaticMethod(_) => TypeTag::StaticMethod,
            Value::ClassMethod(_) => TypeTag::ClassMethod,
        }
    }

    /// Name of the value's type as shown in error messages.
    pub fn type_name(&self) -> String {
        match self {
            Value::Instance(inst) => inst.class.name.clone(),
            other => other.tag().name().to_string(),
        }
    }

    /// Identity of heap objects; `None` for value types.
    pub fn identity(&self) -> Option<usize> {
        fn addr<T: ?Sized>(rc: &Rc<T>) -> usize {
            Rc::as_ptr(rc) as *const () as usize
        }
        Some(match self {
            Value::Str(s) => addr(s),
            Value::List(l) => addr(l),
            Value::Tuple(t) => addr(t),
            Value::Dict(d) => addr(d),
            Value::Set(s) => addr(s),
            Value::Range(r) => addr(r),
            Value::Slice(s) => addr(s),
            Value::Iterator(i) => addr(i),
            Value::Function(f) => addr(f),
            Value::BoundMethod(m) => addr(m),
            Value::Builtin(b) => addr(b),
            Value::HostMethod(h) => addr(h),
            Value::Class(c) => addr(c),
            Value::Instance(i) => addr(i),
            Value::Module(m) => addr(m),
            Value::Super(s) => addr(s),
            Value::Property(p) => addr(p),
            Value::StaticMethod(f) => addr(f),
            Value::ClassMethod(f) => addr(f),
            Value::None | Value::NotImplemented | Value::Bool(_) | Value::Int(_) | Value::Float(_) => return None,
        })
    }

    /// The `is` operator.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::NotImplemented, Value::NotImplemented) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b && a.to_i64().is_some_and(|v| (-5..=256).contains(&v)),
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{}", crate::number::float_repr(*x)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Instance(inst) => write!(f, "<{} object>", inst.class.name),
            Value::Class(c) => write!(f, "<class '{}'>", c.name),
            Value::Function(func) => write!(f, "<function {}>", func.qualname),
            other => write!(f, "<{}>", other.tag().name()),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mro: Vec<&str> = self.ancestors.iter().map(|c| c.name.as_str()).collect();
        f.debug_struct("Class").field("name", &self.name).field("kind", &self.kind).field("ancestors", &mro).finish()
    }
}
