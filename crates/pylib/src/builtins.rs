//! The builtin namespace: type objects, the exception hierarchy, builtin
//! functions and the native `math` module. Other native modules live in
//! `stdlib`.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, One, Signed, ToPrimitive, Zero};
use pyjvm_bytecode::Operator;

use crate::error::VmError;
use crate::methods;
use crate::number::{round_half_even, Num};
use crate::ops::c3_linearize;
use crate::stdlib;
use crate::value::{
    Args, BuiltinFunction, Class, ClassKind, HashKey, Instance, IterState, ModuleKind, ModuleObj, NativeFn, Property,
    RangeObj, SliceObj, TypeTag, Value,
};
use crate::vm::Vm;

/// Builtin type objects, indexed by tag.
pub struct TypeTable {
    classes: Vec<Rc<Class>>,
}

impl TypeTable {
    pub fn get(&self, tag: TypeTag) -> Rc<Class> {
        self.classes[tag as usize].clone()
    }
}

const EXCEPTIONS: &[(&str, &str)] = &[
    ("Exception", "BaseException"),
    ("SystemExit", "BaseException"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("OverflowError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("IndexError", "LookupError"),
    ("KeyError", "LookupError"),
    ("ValueError", "Exception"),
    ("TypeError", "Exception"),
    ("AttributeError", "Exception"),
    ("NameError", "Exception"),
    ("UnboundLocalError", "NameError"),
    ("RuntimeError", "Exception"),
    ("NotImplementedError", "RuntimeError"),
    ("RecursionError", "RuntimeError"),
    ("StopIteration", "Exception"),
    ("AssertionError", "Exception"),
    ("ImportError", "Exception"),
    ("ModuleNotFoundError", "ImportError"),
];

pub(crate) fn m(name: &'static str, func: NativeFn) -> (&'static str, NativeFn) {
    (name, func)
}

pub(crate) fn native(name: &'static str, func: NativeFn) -> Value {
    Value::Builtin(Rc::new(BuiltinFunction { name, func, receiver: None }))
}

fn builtin_class(
    name: &str,
    kind: ClassKind,
    bases: Vec<Rc<Class>>,
    methods: Vec<(&'static str, NativeFn)>,
) -> Rc<Class> {
    let ancestors = c3_linearize(&bases).unwrap_or_default();
    let dict = methods.into_iter().map(|(n, f)| (n.to_string(), native(n, f))).collect();
    Rc::new(Class { name: name.to_string(), bases, ancestors, dict: RefCell::new(dict), kind })
}

/// Build the type table and the builtin namespace.
pub fn install() -> (TypeTable, IndexMap<&'static str, Value>) {
    let object = builtin_class(
        "object",
        ClassKind::Builtin(TypeTag::Object),
        Vec::new(),
        vec![m("__init__", object_init), m("__repr__", object_repr), m("__str__", object_str)],
    );
    let mut by_tag: HashMap<TypeTag, Rc<Class>> = HashMap::new();
    by_tag.insert(TypeTag::Object, object.clone());
    for tag in TypeTag::ALL {
        if matches!(tag, TypeTag::Object | TypeTag::Bool) {
            continue;
        }
        let cls = builtin_class(tag.name(), ClassKind::Builtin(tag), vec![object.clone()], methods::for_tag(tag));
        by_tag.insert(tag, cls);
    }
    let int = by_tag.get(&TypeTag::Int).cloned().into_iter().collect();
    by_tag.insert(
        TypeTag::Bool,
        builtin_class("bool", ClassKind::Builtin(TypeTag::Bool), int, methods::for_tag(TypeTag::Bool)),
    );
    let classes: Vec<Rc<Class>> = TypeTag::ALL
        .iter()
        .map(|tag| by_tag.get(tag).cloned().unwrap_or_else(|| object.clone()))
        .collect();
    let types = TypeTable { classes };

    let mut ns: IndexMap<&'static str, Value> = IndexMap::new();
    for tag in [
        TypeTag::Object,
        TypeTag::Bool,
        TypeTag::Int,
        TypeTag::Float,
        TypeTag::Str,
        TypeTag::List,
        TypeTag::Tuple,
        TypeTag::Dict,
        TypeTag::Set,
        TypeTag::Range,
        TypeTag::Type,
        TypeTag::StaticMethod,
        TypeTag::ClassMethod,
        TypeTag::Property,
    ] {
        ns.insert(tag.name(), Value::Class(types.get(tag)));
    }

    let base_exception = builtin_class(
        "BaseException",
        ClassKind::Exception,
        vec![object],
        vec![m("__init__", exception_init), m("__repr__", exception_repr), m("__str__", exception_str)],
    );
    ns.insert("BaseException", Value::Class(base_exception));
    for &(name, parent) in EXCEPTIONS {
        let Some(Value::Class(parent)) = ns.get(parent).cloned() else { continue };
        ns.insert(name, Value::Class(builtin_class(name, ClassKind::Exception, vec![parent], Vec::new())));
    }

    for (name, func) in [
        m("print", print),
        m("len", len),
        m("repr", repr),
        m("abs", abs),
        m("min", min),
        m("max", max),
        m("sum", sum),
        m("enumerate", enumerate),
        m("zip", zip),
        m("sorted", sorted),
        m("reversed", reversed),
        m("isinstance", isinstance),
        m("issubclass", issubclass),
        m("getattr", getattr),
        m("setattr", setattr),
        m("hasattr", hasattr),
        m("delattr", delattr),
        m("iter", iter),
        m("next", next),
        m("any", any),
        m("all", all),
        m("ord", ord),
        m("chr", chr),
        m("hex", hex),
        m("oct", oct),
        m("bin", bin),
        m("hash", hash),
        m("id", id),
        m("round", round),
        m("divmod", divmod),
        m("pow", pow),
    ] {
        ns.insert(name, native(name, func));
    }
    ns.insert("NotImplemented", Value::NotImplemented);
    (types, ns)
}

/// Modules implemented natively by the runtime.
pub fn native_module(vm: &Vm, name: &str) -> Option<Value> {
    if name != "math" {
        return stdlib::module(vm, name);
    }
    let mut ns = IndexMap::new();
    ns.insert("pi".to_string(), Value::Float(std::f64::consts::PI));
    ns.insert("e".to_string(), Value::Float(std::f64::consts::E));
    for (name, func) in [
        m("sqrt", math_sqrt),
        m("floor", math_floor),
        m("ceil", math_ceil),
        m("fabs", math_fabs),
        m("gcd", math_gcd),
    ] {
        ns.insert(name.to_string(), native(name, func));
    }
    Some(Value::Module(Rc::new(ModuleObj { name: name.to_string(), kind: ModuleKind::Native(RefCell::new(ns)) })))
}

// ---- argument helpers ----

pub(crate) fn check_arity(vm: &Vm, name: &str, args: &Args, min: usize, max: usize) -> Result<(), VmError> {
    let given = args.positional.len();
    if (min..=max).contains(&given) {
        return Ok(());
    }
    let plural = |n: usize| if n == 1 { "" } else { "s" };
    let msg = if min == max {
        match min {
            0 => format!("{name}() takes no arguments ({given} given)"),
            1 => format!("{name}() takes exactly one argument ({given} given)"),
            n => format!("{name}() takes exactly {n} arguments ({given} given)"),
        }
    } else if given < min {
        format!("{name} expected at least {min} argument{}, got {given}", plural(min))
    } else {
        format!("{name} expected at most {max} argument{}, got {given}", plural(max))
    };
    Err(vm.err("TypeError", msg))
}

pub(crate) fn no_keywords(vm: &Vm, name: &str, args: &Args) -> Result<(), VmError> {
    match args.keywords.first() {
        None => Ok(()),
        Some((k, _)) => Err(vm.err("TypeError", format!("'{k}' is an invalid keyword argument for {name}()"))),
    }
}

/// The receiver of a method call on a builtin value.
pub(crate) fn receiver(vm: &Vm, name: &str, args: &mut Args) -> Result<Value, VmError> {
    args.take_receiver()
        .ok_or_else(|| vm.err("TypeError", format!("unbound method {name}() needs an argument")))
}

pub(crate) fn int_arg(vm: &Vm, v: &Value) -> Result<BigInt, VmError> {
    match v {
        Value::Int(i) => Ok(i.clone()),
        Value::Bool(b) => Ok(BigInt::from(u8::from(*b))),
        other => Err(vm.err(
            "TypeError",
            format!("'{}' object cannot be interpreted as an integer", other.type_name()),
        )),
    }
}

pub(crate) fn index_arg(vm: &Vm, v: &Value) -> Result<i64, VmError> {
    let i = int_arg(vm, v)?;
    i.to_i64()
        .ok_or_else(|| vm.err("OverflowError", "Python int too large to convert to C ssize_t"))
}

fn positional<const N: usize>(args: Args) -> [Option<Value>; N] {
    let mut out: [Option<Value>; N] = std::array::from_fn(|_| None);
    for (slot, v) in out.iter_mut().zip(args.positional) {
        *slot = Some(v);
    }
    out
}

fn float_to_int(vm: &Vm, f: f64) -> Result<BigInt, VmError> {
    if f.is_nan() {
        return Err(vm.err("ValueError", "cannot convert float NaN to integer"));
    }
    BigInt::from_f64(f.trunc()).ok_or_else(|| vm.err("OverflowError", "cannot convert float infinity to integer"))
}

/// Parse an integer literal as `int(text, base)` does.
pub fn parse_int(text: &str, base: u32) -> Option<BigInt> {
    let t = text.trim();
    let (negative, t) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };
    let lower = t.to_ascii_lowercase();
    let (base, digits) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &lower[2..]),
        (0 | 8, Some("0o")) => (8, &lower[2..]),
        (0 | 2, Some("0b")) => (2, &lower[2..]),
        (0, _) => (10, lower.as_str()),
        (b, _) => (b, lower.as_str()),
    };
    let digits = if base != 10 { digits.strip_prefix('_').unwrap_or(digits) } else { digits };
    if digits.is_empty()
        || digits.starts_with(|c: char| matches!(c, '_' | '+' | '-'))
        || digits.ends_with('_')
        || digits.contains("__")
    {
        return None;
    }
    let clean: String = digits.chars().filter(|&c| c != '_').collect();
    let value = BigInt::parse_bytes(clean.as_bytes(), base)?;
    Some(if negative { -value } else { value })
}

fn parse_float(text: &str) -> Option<f64> {
    let t = text.trim();
    let lower = t.to_ascii_lowercase();
    let unsigned = lower.trim_start_matches(|c: char| c == '+' || c == '-');
    match unsigned {
        "inf" | "infinity" | "nan" => return lower.parse().ok(),
        _ => {}
    }
    if t.is_empty() || t.contains("__") || t.starts_with('_') || t.ends_with('_') {
        return None;
    }
    let clean: String = t.chars().filter(|&c| c != '_').collect();
    if !clean.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')) {
        return None;
    }
    clean.parse().ok()
}

// ---- constructors ----

/// Call a builtin type object.
pub(crate) fn construct(vm: &mut Vm, cls: &Rc<Class>, tag: TypeTag, mut args: Args) -> Result<Value, VmError> {
    let name = tag.name();
    match tag {
        TypeTag::Object => {
            check_arity(vm, name, &args, 0, 0)?;
            no_keywords(vm, name, &args)?;
            Ok(Value::Instance(Rc::new(Instance { class: cls.clone(), dict: RefCell::new(IndexMap::new()) })))
        }
        TypeTag::Int => {
            let base_kw = args.take_keyword("base");
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 0, 2)?;
            let [x, base] = positional::<2>(args);
            let base = base.or(base_kw);
            let Some(x) = x else { return Ok(Value::int(0)) };
            if let Some(base) = base {
                let Value::Str(s) = &x else {
                    return Err(vm.err("TypeError", "int() can't convert non-string with explicit base"));
                };
                let b = index_arg(vm, &base)?;
                if b != 0 && !(2..=36).contains(&b) {
                    return Err(vm.err("ValueError", "int() base must be >= 2 and <= 36, or 0"));
                }
                return parse_int(s, b as u32).map(Value::Int).ok_or_else(|| {
                    vm.err(
                        "ValueError",
                        format!("invalid literal for int() with base {b}: {}", crate::format::quote(s)),
                    )
                });
            }
            match &x {
                Value::Int(_) => Ok(x),
                Value::Bool(b) => Ok(Value::int(i64::from(*b))),
                Value::Float(f) => float_to_int(vm, *f).map(Value::Int),
                Value::Str(s) => parse_int(s, 10).map(Value::Int).ok_or_else(|| {
                    vm.err("ValueError", format!("invalid literal for int() with base 10: {}", crate::format::quote(s)))
                }),
                Value::Instance(_) => match vm.call_special(&x, "__int__", Vec::new())? {
                    Some(v @ Value::Int(_)) => Ok(v),
                    Some(other) => Err(vm.err(
                        "TypeError",
                        format!("__int__ returned non-int (type {})", other.type_name()),
                    )),
                    None => Err(int_type_error(vm, &x)),
                },
                other => Err(int_type_error(vm, other)),
            }
        }
        TypeTag::Float => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 0, 1)?;
            let [x] = positional::<1>(args);
            match x {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float(&s).map(Value::Float).ok_or_else(|| {
                    vm.err("ValueError", format!("could not convert string to float: {}", crate::format::quote(&s)))
                }),
                Some(v) => match Num::of(&v) {
                    Some(n) => n.to_f64().map(Value::Float).map_err(|e| vm.num_err(e)),
                    None => match vm.call_special(&v, "__float__", Vec::new())? {
                        Some(f @ Value::Float(_)) => Ok(f),
                        _ => Err(vm.err(
                            "TypeError",
                            format!("float() argument must be a string or a real number, not '{}'", v.type_name()),
                        )),
                    },
                },
            }
        }
        TypeTag::Str => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 0, 1)?;
            let [x] = positional::<1>(args);
            match x {
                None => Ok(Value::str("")),
                Some(v @ Value::Str(_)) => Ok(v),
                Some(v) => vm.to_str(&v).map(|s| Value::str(&s)),
            }
        }
        TypeTag::Bool => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 0, 1)?;
            let [x] = positional::<1>(args);
            match x {
                None => Ok(Value::Bool(false)),
                Some(v) => vm.truth(&v).map(Value::Bool),
            }
        }
        TypeTag::List | TypeTag::Tuple | TypeTag::Set => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 0, 1)?;
            let [x] = positional::<1>(args);
            if let (TypeTag::Tuple, Some(t @ Value::Tuple(_))) = (tag, &x) {
                return Ok(t.clone());
            }
            let items = match x {
                None => Vec::new(),
                Some(v) => vm.collect(&v)?,
            };
            match tag {
                TypeTag::List => Ok(Value::list(items)),
                TypeTag::Tuple => Ok(Value::tuple(items)),
                _ => vm.make_set(items),
            }
        }
        TypeTag::Dict => {
            check_arity(vm, name, &args, 0, 1)?;
            let keywords = std::mem::take(&mut args.keywords);
            let [x] = positional::<1>(args);
            let mut pairs = match x {
                None => Vec::new(),
                Some(v) => dict_pairs(vm, &v)?,
            };
            pairs.extend(keywords.into_iter().map(|(k, v)| (Value::str(&k), v)));
            vm.make_dict(pairs)
        }
        TypeTag::Range => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 1, 3)?;
            let mut ints = Vec::with_capacity(3);
            for v in &args.positional {
                ints.push(int_arg(vm, v)?);
            }
            let (start, stop, step) = match ints.len() {
                1 => (BigInt::zero(), ints[0].clone(), BigInt::one()),
                2 => (ints[0].clone(), ints[1].clone(), BigInt::one()),
                _ => (ints[0].clone(), ints[1].clone(), ints[2].clone()),
            };
            if step.is_zero() {
                return Err(vm.err("ValueError", "range() arg 3 must not be zero"));
            }
            Ok(Value::Range(Rc::new(RangeObj { start, stop, step })))
        }
        TypeTag::Slice => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 1, 3)?;
            let (start, stop, step) = match positional::<3>(args) {
                [Some(stop), None, None] => (Value::None, stop, Value::None),
                [start, stop, step] => (
                    start.unwrap_or(Value::None),
                    stop.unwrap_or(Value::None),
                    step.unwrap_or(Value::None),
                ),
            };
            Ok(Value::Slice(Rc::new(SliceObj { start, stop, step })))
        }
        TypeTag::Type => {
            no_keywords(vm, name, &args)?;
            match args.positional.len() {
                1 => Ok(Value::Class(vm.type_of(&args.positional[0]))),
                3 => {
                    let [name, bases, dict] = positional::<3>(args);
                    let name = match name {
                        Some(Value::Str(s)) => s,
                        _ => return Err(vm.err("TypeError", "type.__new__() argument 1 must be str")),
                    };
                    let mut classes = Vec::new();
                    if let Some(Value::Tuple(items)) = &bases {
                        for base in items.iter() {
                            match base {
                                Value::Class(c) => classes.push(c.clone()),
                                _ => return Err(vm.err("TypeError", "bases must be types")),
                            }
                        }
                    }
                    let cls = vm.new_class(&name, classes)?;
                    if let Some(Value::Dict(d)) = &dict {
                        for (k, v) in d.borrow().values() {
                            if let Value::Str(k) = k {
                                cls.dict.borrow_mut().insert(k.to_string(), v.clone());
                            }
                        }
                    }
                    Ok(Value::Class(cls))
                }
                _ => Err(vm.err("TypeError", "type() takes 1 or 3 arguments")),
            }
        }
        TypeTag::StaticMethod | TypeTag::ClassMethod => {
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 1, 1)?;
            let [f] = positional::<1>(args);
            let f = Rc::new(f.unwrap_or(Value::None));
            Ok(if tag == TypeTag::StaticMethod { Value::StaticMethod(f) } else { Value::ClassMethod(f) })
        }
        TypeTag::Property => {
            let fget_kw = args.take_keyword("fget");
            let fset_kw = args.take_keyword("fset");
            args.take_keyword("doc");
            no_keywords(vm, name, &args)?;
            check_arity(vm, name, &args, 0, 3)?;
            let [fget, fset, _] = positional::<3>(args);
            let some = |v: Option<Value>| v.filter(|v| !matches!(v, Value::None));
            Ok(Value::Property(Rc::new(Property {
                fget: some(fget.or(fget_kw)),
                fset: some(fset.or(fset_kw)),
            })))
        }
        other => Err(vm.err("TypeError", format!("cannot create '{}' instances", other.name()))),
    }
}

fn int_type_error(vm: &Vm, v: &Value) -> VmError {
    vm.err(
        "TypeError",
        format!("int() argument must be a string, a bytes-like object or a real number, not '{}'", v.type_name()),
    )
}

/// Key/value pairs of a mapping or an iterable of pairs.
pub(crate) fn dict_pairs(vm: &mut Vm, v: &Value) -> Result<Vec<(Value, Value)>, VmError> {
    if let Value::Dict(d) = v {
        return Ok(d.borrow().values().cloned().collect());
    }
    let items = vm.collect(v)?;
    let mut pairs = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let kv = vm.collect(item).map_err(|e| {
            if e.as_exception().is_some() {
                vm.err("TypeError", format!("cannot convert dictionary update sequence element #{i} to a sequence"))
            } else {
                e
            }
        })?;
        match <[Value; 2]>::try_from(kv) {
            Ok([k, v]) => pairs.push((k, v)),
            Err(kv) => {
                return Err(vm.err(
                    "ValueError",
                    format!("dictionary update sequence element #{i} has length {}; 2 is required", kv.len()),
                ))
            }
        }
    }
    Ok(pairs)
}

// ---- object and exception methods ----

fn object_init(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let this = receiver(vm, "__init__", &mut args)?;
    if !args.positional.is_empty() || !args.keywords.is_empty() {
        return Err(vm.err("TypeError", format!("{}() takes no arguments", this.type_name())));
    }
    Ok(Value::None)
}

fn object_repr(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let this = receiver(vm, "__repr__", &mut args)?;
    Ok(Value::str(&vm.default_repr(&this)))
}

fn object_str(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let this = receiver(vm, "__str__", &mut args)?;
    vm.repr(&this).map(|s| Value::str(&s))
}

fn exception_init(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let this = receiver(vm, "__init__", &mut args)?;
    no_keywords(vm, "BaseException", &args)?;
    if let Value::Instance(inst) = &this {
        inst.dict.borrow_mut().insert("args".to_string(), Value::tuple(args.positional));
    }
    Ok(Value::None)
}

fn exception_repr(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let this = receiver(vm, "__repr__", &mut args)?;
    vm.exception_repr(&this).map(|s| Value::str(&s))
}

fn exception_str(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let this = receiver(vm, "__str__", &mut args)?;
    vm.exception_str(&this).map(|s| Value::str(&s))
}

// ---- builtin functions ----

fn print(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let sep = args.take_keyword("sep");
    let end = args.take_keyword("end");
    args.take_keyword("flush");
    no_keywords(vm, "print", &args)?;
    fn text_arg(vm: &Vm, v: Option<Value>, default: &str, what: &str) -> Result<String, VmError> {
        match v {
            None | Some(Value::None) => Ok(default.to_string()),
            Some(Value::Str(s)) => Ok(s.to_string()),
            Some(other) => Err(vm.err(
                "TypeError",
                format!("{what} must be None or a string, not {}", other.type_name()),
            )),
        }
    }
    let sep = text_arg(vm, sep, " ", "sep")?;
    let end = text_arg(vm, end, "\n", "end")?;
    let mut parts = Vec::with_capacity(args.positional.len());
    for v in &args.positional {
        parts.push(vm.to_str(v)?);
    }
    let mut text = parts.join(&sep);
    text.push_str(&end);
    vm.write_text(&text);
    Ok(Value::None)
}

fn len(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "len", &args, 1, 1)?;
    let n = vm.len(&args.positional[0])?;
    Ok(Value::Int(BigInt::from(n)))
}

fn repr(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "repr", &args, 1, 1)?;
    vm.repr(&args.positional[0]).map(|s| Value::str(&s))
}

pub(crate) fn abs(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "abs", &args, 1, 1)?;
    let x = &args.positional[0];
    match Num::of(x) {
        Some(Num::Int(i)) => Ok(Value::Int(i.abs())),
        Some(Num::Float(f)) => Ok(Value::Float(f.abs())),
        None => match vm.call_special(x, "__abs__", Vec::new())? {
            Some(v) => Ok(v),
            None => Err(vm.err("TypeError", format!("bad operand type for abs(): '{}'", x.type_name()))),
        },
    }
}

fn extreme(vm: &mut Vm, mut args: Args, name: &str, want_max: bool) -> Result<Value, VmError> {
    let key = args.take_keyword("key").filter(|k| !matches!(k, Value::None));
    let default = args.take_keyword("default");
    no_keywords(vm, name, &args)?;
    let items = match args.positional.len() {
        0 => return Err(vm.err("TypeError", format!("{name} expected at least 1 argument, got 0"))),
        1 => vm.collect(&args.positional[0])?,
        _ => {
            if default.is_some() {
                return Err(vm.err(
                    "TypeError",
                    format!("Cannot specify a default for {name}() with multiple positional arguments"),
                ));
            }
            args.positional
        }
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = match &key {
            Some(f) => vm.call(f, vec![item.clone()])?,
            None => item.clone(),
        };
        let better = match &best {
            None => true,
            Some((bk, _)) if want_max => vm.lt(bk, &k)?,
            Some((bk, _)) => vm.lt(&k, bk)?,
        };
        if better {
            best = Some((k, item));
        }
    }
    match (best, default) {
        (Some((_, v)), _) => Ok(v),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(vm.err("ValueError", format!("{name}() arg is an empty sequence"))),
    }
}

pub(crate) fn min(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    extreme(vm, args, "min", false)
}

pub(crate) fn max(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    extreme(vm, args, "max", true)
}

fn sum(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let start_kw = args.take_keyword("start");
    no_keywords(vm, "sum", &args)?;
    check_arity(vm, "sum", &args, 1, 2)?;
    let [iterable, start] = positional::<2>(args);
    let mut total = start.or(start_kw).unwrap_or_else(|| Value::int(0));
    if matches!(total, Value::Str(_)) {
        return Err(vm.err("TypeError", "sum() can't sum strings [use ''.join(seq) instead]"));
    }
    let it = vm.iter(&iterable.unwrap_or(Value::None))?;
    while let Some(item) = vm.next(&it)? {
        total = vm.binop(Operator::Add, &total, &item)?;
    }
    Ok(total)
}

fn enumerate(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let start_kw = args.take_keyword("start");
    no_keywords(vm, "enumerate", &args)?;
    check_arity(vm, "enumerate", &args, 1, 2)?;
    let [iterable, start] = positional::<2>(args);
    let count = match start.or(start_kw) {
        Some(s) => int_arg(vm, &s)?,
        None => BigInt::zero(),
    };
    let inner = vm.iter(&iterable.unwrap_or(Value::None))?;
    Ok(Value::iterator(IterState::Enumerate { inner, count }))
}

fn zip(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    no_keywords(vm, "zip", &args)?;
    let mut iters = Vec::with_capacity(args.positional.len());
    for v in &args.positional {
        iters.push(vm.iter(v)?);
    }
    Ok(Value::iterator(IterState::Zip { iters }))
}

fn sorted(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let key = args.take_keyword("key").filter(|k| !matches!(k, Value::None));
    let reverse = args.take_keyword("reverse");
    no_keywords(vm, "sorted", &args)?;
    check_arity(vm, "sorted", &args, 1, 1)?;
    let items = vm.collect(&args.positional[0])?;
    let reverse = match reverse {
        Some(r) => vm.truth(&r)?,
        None => false,
    };
    sort_items(vm, items, key, reverse).map(Value::list)
}

/// Sort with an optional key function, as `sorted` and `list.sort` do.
pub(crate) fn sort_items(
    vm: &mut Vm,
    items: Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> Result<Vec<Value>, VmError> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = match &key {
            Some(f) => vm.call(f, vec![item.clone()])?,
            None => item.clone(),
        };
        keyed.push((k, item));
    }
    vm.sort_values(keyed, reverse)
}

fn reversed(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "reversed", &args, 1, 1)?;
    let seq = &args.positional[0];
    let mut items = match seq {
        Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range(_) => vm.collect(seq)?,
        Value::Instance(_) => {
            if let Some(it) = vm.call_special(seq, "__reversed__", Vec::new())? {
                return Ok(it);
            }
            if vm.special_method(seq, "__getitem__").is_none() {
                return Err(vm.err("TypeError", format!("'{}' object is not reversible", seq.type_name())));
            }
            let n = vm.len(seq)?;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                items.push(vm.getitem(seq, &Value::Int(BigInt::from(i)))?);
            }
            items
        }
        other => return Err(vm.err("TypeError", format!("'{}' object is not reversible", other.type_name()))),
    };
    items.reverse();
    Ok(Value::iterator(IterState::Items { items, index: 0 }))
}

fn class_spec(vm: &Vm, spec: &Value, what: &str) -> Result<Vec<Rc<Class>>, VmError> {
    match spec {
        Value::Class(c) => Ok(vec![c.clone()]),
        Value::Tuple(items) => {
            let mut out = Vec::new();
            for item in items.iter() {
                out.extend(class_spec(vm, item, what)?);
            }
            Ok(out)
        }
        _ => Err(vm.err("TypeError", format!("{what}() arg 2 must be a type, a tuple of types, or a union"))),
    }
}

fn isinstance(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "isinstance", &args, 2, 2)?;
    let classes = class_spec(vm, &args.positional[1], "isinstance")?;
    let obj = &args.positional[0];
    Ok(Value::Bool(classes.iter().any(|c| vm.isinstance(obj, c))))
}

fn issubclass(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "issubclass", &args, 2, 2)?;
    let Value::Class(cls) = &args.positional[0] else {
        return Err(vm.err("TypeError", "issubclass() arg 1 must be a class"));
    };
    let classes = class_spec(vm, &args.positional[1], "issubclass")?;
    Ok(Value::Bool(classes.iter().any(|c| cls.is_subclass(c))))
}

fn attr_name(vm: &Vm, v: &Value) -> Result<Rc<str>, VmError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(vm.err(
            "TypeError",
            format!("attribute name must be string, not '{}'", other.type_name()),
        )),
    }
}

fn getattr(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "getattr", &args, 2, 3)?;
    let name = attr_name(vm, &args.positional[1])?;
    let obj = &args.positional[0];
    match args.positional.get(2) {
        None => vm.getattr(obj, &name),
        Some(default) => match vm.lookup_attr(obj, &name) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Ok(default.clone()),
            Err(VmError::Exception(e)) if vm.is_builtin_instance(&e.value, "AttributeError") => Ok(default.clone()),
            Err(e) => Err(e),
        },
    }
}

fn setattr(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "setattr", &args, 3, 3)?;
    let name = attr_name(vm, &args.positional[1])?;
    vm.setattr(&args.positional[0], &name, args.positional[2].clone())?;
    Ok(Value::None)
}

fn hasattr(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "hasattr", &args, 2, 2)?;
    let name = attr_name(vm, &args.positional[1])?;
    match vm.lookup_attr(&args.positional[0], &name) {
        Ok(found) => Ok(Value::Bool(found.is_some())),
        Err(VmError::Exception(e)) if vm.is_builtin_instance(&e.value, "AttributeError") => Ok(Value::Bool(false)),
        Err(e) => Err(e),
    }
}

fn delattr(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "delattr", &args, 2, 2)?;
    let name = attr_name(vm, &args.positional[1])?;
    vm.delattr(&args.positional[0], &name)?;
    Ok(Value::None)
}

fn iter(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "iter", &args, 1, 1)?;
    vm.iter(&args.positional[0])
}

fn next(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "next", &args, 1, 2)?;
    match vm.next(&args.positional[0])? {
        Some(v) => Ok(v),
        None => match args.positional.get(1) {
            Some(default) => Ok(default.clone()),
            None => Err(vm.err_args("StopIteration", Vec::new())),
        },
    }
}

fn any(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "any", &args, 1, 1)?;
    let it = vm.iter(&args.positional[0])?;
    while let Some(v) = vm.next(&it)? {
        if vm.truth(&v)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn all(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "all", &args, 1, 1)?;
    let it = vm.iter(&args.positional[0])?;
    while let Some(v) = vm.next(&it)? {
        if !vm.truth(&v)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn ord(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "ord", &args, 1, 1)?;
    match &args.positional[0] {
        Value::Str(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::int(i64::from(u32::from(c)))),
                _ => Err(vm.err(
                    "TypeError",
                    format!("ord() expected a character, but string of length {} found", s.chars().count()),
                )),
            }
        }
        other => Err(vm.err(
            "TypeError",
            format!("ord() expected string of length 1, but {} found", other.type_name()),
        )),
    }
}

fn chr(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "chr", &args, 1, 1)?;
    let i = int_arg(vm, &args.positional[0])?;
    i.to_u32()
        .and_then(char::from_u32)
        .map(|c| Value::str(&c.to_string()))
        .ok_or_else(|| vm.err("ValueError", "chr() arg not in range(0x110000)"))
}

fn radix(vm: &mut Vm, args: Args, name: &str, prefix: &str, base: u32) -> Result<Value, VmError> {
    check_arity(vm, name, &args, 1, 1)?;
    let i = int_arg(vm, &args.positional[0])?;
    let sign = if i.is_negative() { "-" } else { "" };
    Ok(Value::str(&format!("{sign}{prefix}{}", i.abs().to_str_radix(base))))
}

fn hex(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    radix(vm, args, "hex", "0x", 16)
}

fn oct(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    radix(vm, args, "oct", "0o", 8)
}

fn bin(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    radix(vm, args, "bin", "0b", 2)
}

/// Hash of an int: its value reduced modulo the Mersenne prime 2**61 - 1.
fn int_hash(i: &BigInt) -> i64 {
    let modulus = BigInt::from((1i64 << 61) - 1);
    let h = i.abs().mod_floor(&modulus).to_i64().unwrap_or(0);
    let h = if i.is_negative() { -h } else { h };
    if h == -1 {
        -2
    } else {
        h
    }
}

fn hash(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "hash", &args, 1, 1)?;
    let key = vm.hash_key(&args.positional[0])?;
    let h = match &key {
        HashKey::Int(i) => int_hash(i),
        other => {
            let mut hasher = DefaultHasher::new();
            other.hash(&mut hasher);
            hasher.finish() as i64
        }
    };
    Ok(Value::int(h))
}

fn id(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "id", &args, 1, 1)?;
    let v = &args.positional[0];
    let id = match v.identity() {
        Some(addr) => addr as i64,
        None => {
            let key = vm.hash_key(v)?;
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() >> 1) as i64
        }
    };
    Ok(Value::int(id))
}

fn round(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let ndigits_kw = args.take_keyword("ndigits");
    no_keywords(vm, "round", &args)?;
    check_arity(vm, "round", &args, 1, 2)?;
    let [x, ndigits] = positional::<2>(args);
    let x = x.unwrap_or(Value::None);
    let ndigits = match ndigits.or(ndigits_kw) {
        None | Some(Value::None) => None,
        Some(n) => Some(index_arg(vm, &n)?),
    };
    match (Num::of(&x), ndigits) {
        (Some(Num::Int(i)), None) => Ok(Value::Int(i)),
        (Some(Num::Int(i)), Some(n)) if n >= 0 => Ok(Value::Int(i)),
        (Some(Num::Int(i)), Some(n)) => {
            let digits = i.magnitude().to_string().len() as u64;
            if n.unsigned_abs() > digits {
                return Ok(Value::int(0));
            }
            let exp = u32::try_from(n.unsigned_abs()).map_err(|_| vm.err("OverflowError", "ndigits too large"))?;
            let unit = num_traits::pow(BigInt::from(10), exp as usize);
            let (q, r) = i.div_mod_floor(&unit);
            let twice = r * 2u32;
            let q = if twice > unit || (twice == unit && q.is_odd()) { q + 1 } else { q };
            Ok(Value::Int(q * unit))
        }
        (Some(Num::Float(f)), None) => float_to_int(vm, round_half_even(f)).map(Value::Int),
        (Some(Num::Float(f)), Some(n)) => {
            if !f.is_finite() {
                return Ok(Value::Float(f));
            }
            if n >= 0 {
                let n = usize::try_from(n.min(300)).unwrap_or(300);
                Ok(Value::Float(format!("{f:.n$}").parse().unwrap_or(f)))
            } else {
                let scale = 10f64.powi(i32::try_from(n.unsigned_abs()).unwrap_or(i32::MAX));
                if scale.is_infinite() {
                    return Ok(Value::Float(0.0f64.copysign(f)));
                }
                Ok(Value::Float(round_half_even(f / scale) * scale))
            }
        }
        (None, _) => {
            let extra = ndigits.map(|n| vec![Value::int(n)]).unwrap_or_default();
            match vm.call_special(&x, "__round__", extra)? {
                Some(v) => Ok(v),
                None => Err(vm.err(
                    "TypeError",
                    format!("type {} doesn't define __round__ method", x.type_name()),
                )),
            }
        }
    }
}

fn divmod(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "divmod", &args, 2, 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    let q = vm.binop(Operator::FloorDiv, a, b)?;
    let r = vm.binop(Operator::Mod, a, b)?;
    Ok(Value::tuple(vec![q, r]))
}

fn pow(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "pow", &args, 2, 3)?;
    let (base, exp) = (&args.positional[0], &args.positional[1]);
    let Some(modulus) = args.positional.get(2).filter(|m| !matches!(m, Value::None)) else {
        return vm.binop(Operator::Pow, base, exp);
    };
    let (Some(Num::Int(b)), Some(Num::Int(e)), Some(Num::Int(m))) = (Num::of(base), Num::of(exp), Num::of(modulus))
    else {
        return Err(vm.err("TypeError", "pow() 3rd argument not allowed unless all arguments are integers"));
    };
    if m.is_zero() {
        return Err(vm.err("ValueError", "pow() 3rd argument cannot be 0"));
    }
    if e.is_negative() {
        return Err(vm.err("ValueError", "base is not invertible for the given modulus"));
    }
    Ok(Value::Int(b.modpow(&e, &m)))
}

// ---- math ----

pub(crate) fn math_float(vm: &Vm, args: &Args, name: &str) -> Result<f64, VmError> {
    check_arity(vm, name, args, 1, 1)?;
    let v = &args.positional[0];
    match Num::of(v) {
        Some(n) => n.to_f64().map_err(|e| vm.num_err(e)),
        None => Err(vm.err("TypeError", format!("must be real number, not {}", v.type_name()))),
    }
}

fn math_sqrt(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    let x = math_float(vm, &args, "sqrt")?;
    if x < 0.0 {
        return Err(vm.err("ValueError", "math domain error"));
    }
    Ok(Value::Float(x.sqrt()))
}

fn math_round(vm: &mut Vm, args: Args, name: &str, op: fn(f64) -> f64) -> Result<Value, VmError> {
    if let Some(Value::Int(i)) = args.positional.first() {
        check_arity(vm, name, &args, 1, 1)?;
        return Ok(Value::Int(i.clone()));
    }
    let x = math_float(vm, &args, name)?;
    float_to_int(vm, op(x)).map(Value::Int)
}

fn math_floor(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    math_round(vm, args, "floor", f64::floor)
}

fn math_ceil(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    math_round(vm, args, "ceil", f64::ceil)
}

fn math_fabs(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    math_float(vm, &args, "fabs").map(|x| Value::Float(x.abs()))
}

fn math_gcd(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    no_keywords(vm, "gcd", &args)?;
    let mut acc = BigInt::zero();
    for v in &args.positional {
        acc = acc.gcd(&int_arg(vm, v)?);
    }
    Ok(Value::Int(acc))
}
