//! Native `sys` and `time` modules, and the `java.lang` classes programs
//! reach through `from java.lang import ...`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use num_bigint::BigInt;

use crate::builtins::{self, check_arity, m, native, no_keywords};
use crate::error::VmError;
use crate::number::Num;
use crate::value::{Args, ModuleKind, ModuleObj, Value};
use crate::vm::Vm;

pub(crate) fn module(vm: &Vm, name: &str) -> Option<Value> {
    let mut ns = IndexMap::new();
    let funcs = match name {
        "sys" => {
            let argv = vm.argv.iter().map(|a| Value::str(a)).collect();
            ns.insert("argv".to_string(), Value::list(argv));
            ns.insert("path".to_string(), Value::list(Vec::new()));
            ns.insert("platform".to_string(), Value::str("java"));
            ns.insert("version".to_string(), Value::str(env!("CARGO_PKG_VERSION")));
            ns.insert("maxsize".to_string(), Value::int(i64::MAX));
            vec![m("exit", sys_exit)]
        }
        "time" => vec![
            m("time", time_time),
            m("sleep", time_sleep),
            m("monotonic", time_monotonic),
            m("perf_counter", time_monotonic),
            m("clock", time_monotonic),
        ],
        // Packages.
        "java" | "java.lang" => Vec::new(),
        "java.lang.String" => vec![m("valueOf", string_value_of)],
        "java.lang.Math" => {
            ns.insert("PI".to_string(), Value::Float(std::f64::consts::PI));
            ns.insert("E".to_string(), Value::Float(std::f64::consts::E));
            vec![m("max", math_max), m("min", math_min), m("abs", builtins::abs), m("sqrt", math_sqrt)]
        }
        "java.lang.System" => vec![
            m("currentTimeMillis", system_millis),
            m("nanoTime", system_nanos),
            m("exit", system_exit),
        ],
        _ => return None,
    };
    for (func_name, func) in funcs {
        ns.insert(func_name.to_string(), native(func_name, func));
    }
    Some(Value::Module(Rc::new(ModuleObj { name: name.to_string(), kind: ModuleKind::Native(RefCell::new(ns)) })))
}

// ---- sys ----

/// `sys.exit([status])`: raise `SystemExit`. `None` means status 0.
fn sys_exit(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    no_keywords(vm, "exit", &args)?;
    check_arity(vm, "exit", &args, 0, 1)?;
    let status = args.positional.into_iter().filter(|v| !matches!(v, Value::None)).collect();
    Err(vm.err_args("SystemExit", status))
}

// ---- time ----

fn since_epoch() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

fn time_time(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "time", &args, 0, 0)?;
    Ok(Value::Float(since_epoch()))
}

fn time_monotonic(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "monotonic", &args, 0, 0)?;
    Ok(Value::Float(vm.started.elapsed().as_secs_f64()))
}

fn time_sleep(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    no_keywords(vm, "sleep", &args)?;
    let secs = builtins::math_float(vm, &args, "sleep")?;
    if secs.is_nan() || secs < 0.0 {
        return Err(vm.err("ValueError", "sleep length must be non-negative"));
    }
    let duration =
        Duration::try_from_secs_f64(secs).map_err(|_| vm.err("OverflowError", "sleep length is too large"))?;
    std::thread::sleep(duration);
    Ok(Value::None)
}

// ---- java.lang ----

fn string_value_of(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "valueOf", &args, 1, 1)?;
    let text = match &args.positional[0] {
        Value::None => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        other => vm.to_str(other)?,
    };
    Ok(Value::str(&text))
}

fn math_max(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    two_numbers(vm, "max", &args)?;
    builtins::max(vm, args)
}

fn math_min(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    two_numbers(vm, "min", &args)?;
    builtins::min(vm, args)
}

fn two_numbers(vm: &Vm, name: &str, args: &Args) -> Result<(), VmError> {
    no_keywords(vm, name, args)?;
    check_arity(vm, name, args, 2, 2)?;
    match args.positional.iter().find(|v| Num::of(v).is_none()) {
        Some(v) => Err(vm.err("TypeError", format!("{name}() needs numbers, not {}", v.type_name()))),
        None => Ok(()),
    }
}

/// Unlike `math.sqrt`, negative input yields NaN.
fn math_sqrt(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    builtins::math_float(vm, &args, "sqrt").map(|x| Value::Float(x.sqrt()))
}

fn system_millis(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "currentTimeMillis", &args, 0, 0)?;
    Ok(Value::Int(BigInt::from((since_epoch() * 1000.0) as i64)))
}

fn system_nanos(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "nanoTime", &args, 0, 0)?;
    Ok(Value::Int(BigInt::from(vm.started.elapsed().as_nanos())))
}

fn system_exit(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    check_arity(vm, "exit", &args, 1, 1)?;
    Err(vm.err_args("SystemExit", args.positional))
}
