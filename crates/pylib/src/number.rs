//! The numeric tower: `bool` < `int` (arbitrary precision) < `float`.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};
use pyjvm_bytecode::Operator;

use crate::value::Value;

const MAX_SHIFT: u64 = 1 << 20;

pub enum Num {
    Int(BigInt),
    Float(f64),
}

/// A failed numeric operation: exception class name plus message.
#[derive(Debug)]
pub struct NumErr {
    pub kind: &'static str,
    pub msg: String,
}

fn err(kind: &'static str, msg: impl Into<String>) -> NumErr {
    NumErr { kind, msg: msg.into() }
}

impl Num {
    pub fn of(v: &Value) -> Option<Num> {
        match v {
            Value::Bool(b) => Some(Num::Int(BigInt::from(*b as u8))),
            Value::Int(i) => Some(Num::Int(i.clone())),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Result<f64, NumErr> {
        match self {
            Num::Int(i) => int_to_f64(i),
            Num::Float(f) => Ok(*f),
        }
    }
}

pub fn int_to_f64(i: &BigInt) -> Result<f64, NumErr> {
    match i.to_f64() {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(err("OverflowError", "int too large to convert to float")),
    }
}

pub fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Bool(_) | Value::Int(_) | Value::Float(_))
}

/// Arithmetic on two numbers. `/` between two ints floors toward negative
/// infinity and yields an int.
pub fn arith(op: Operator, a: Num, b: Num) -> Result<Value, NumErr> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_arith(op, x, y),
        (a, b) => {
            if matches!(
                op,
                Operator::LShift | Operator::RShift | Operator::BitAnd | Operator::BitOr | Operator::BitXor
            ) {
                return Err(err("TypeError", format!("unsupported operand type(s) for {}: 'float'", op.symbol())));
            }
            float_arith(op, a.to_f64()?, b.to_f64()?)
        }
    }
}

fn int_arith(op: Operator, x: BigInt, y: BigInt) -> Result<Value, NumErr> {
    let zero_div = || err("ZeroDivisionError", "integer division or modulo by zero");
    let v = match op {
        Operator::Add => x + y,
        Operator::Sub => x - y,
        Operator::Mul => x * y,
        Operator::Div | Operator::FloorDiv => {
            if y.is_zero() {
                return Err(if op == Operator::Div {
                    err("ZeroDivisionError", "division by zero")
                } else {
                    zero_div()
                });
            }
            x.div_floor(&y)
        }
        Operator::Mod => {
            if y.is_zero() {
                return Err(zero_div());
            }
            x.mod_floor(&y)
        }
        Operator::Pow => {
            if y.is_negative() {
                return float_arith(op, int_to_f64(&x)?, int_to_f64(&y)?);
            }
            let exp = y
                .to_u32()
                .ok_or_else(|| err("OverflowError", "exponent too large"))?;
            num_traits::pow(x, exp as usize)
        }
        Operator::LShift | Operator::RShift => {
            if y.is_negative() {
                return Err(err("ValueError", "negative shift count"));
            }
            let n = y.to_u64().filter(|n| *n < MAX_SHIFT);
            match (op, n) {
                (Operator::LShift, Some(n)) => x << n as usize,
                (Operator::LShift, None) => return Err(err("OverflowError", "shift count too large")),
                (_, Some(n)) => x >> n as usize,
                (_, None) => {
                    if x.is_negative() {
                        BigInt::from(-1)
                    } else {
                        BigInt::zero()
                    }
                }
            }
        }
        Operator::BitAnd => x & y,
        Operator::BitOr => x | y,
        Operator::BitXor => x ^ y,
        other => return Err(err("TypeError", format!("bad numeric operator {}", other.symbol()))),
    };
    Ok(Value::Int(v))
}

fn float_arith(op: Operator, x: f64, y: f64) -> Result<Value, NumErr> {
    let v = match op {
        Operator::Add => x + y,
        Operator::Sub => x - y,
        Operator::Mul => x * y,
        Operator::Div => {
            if y == 0.0 {
                return Err(err("ZeroDivisionError", "float division by zero"));
            }
            x / y
        }
        Operator::FloorDiv => {
            if y == 0.0 {
                return Err(err("ZeroDivisionError", "float floor division by zero"));
            }
            (x - float_mod(x, y)) / y
        }
        Operator::Mod => {
            if y == 0.0 {
                return Err(err("ZeroDivisionError", "float modulo"));
            }
            float_mod(x, y)
        }
        Operator::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(err("ZeroDivisionError", "0.0 cannot be raised to a negative power"));
            }
            x.powf(y)
        }
        other => return Err(err("TypeError", format!("bad numeric operator {}", other.symbol()))),
    };
    Ok(Value::Float(v))
}

/// Remainder with the sign of the divisor.
pub fn float_mod(x: f64, y: f64) -> f64 {
    let m = x % y;
    if m != 0.0 && (m < 0.0) != (y < 0.0) {
        m + y
    } else {
        m
    }
}

pub fn compare(a: &Num, b: &Num) -> Option<Ordering> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Some(x.cmp(y)),
        (Num::Float(x), Num::Float(y)) => x.partial_cmp(y),
        (Num::Int(x), Num::Float(y)) => compare_int_float(x, *y),
        (Num::Float(x), Num::Int(y)) => compare_int_float(y, *x).map(Ordering::reverse),
    }
}

fn compare_int_float(i: &BigInt, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f.is_infinite() {
        return Some(if f > 0.0 { Ordering::Less } else { Ordering::Greater });
    }
    let floor = f.floor();
    let fi = BigInt::from_f64(floor)?;
    match i.cmp(&fi) {
        Ordering::Equal if f > floor => Some(Ordering::Less),
        other => Some(other),
    }
}

/// Shortest round-tripping rendering, in the source language's style.
pub fn float_repr(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }
    let abs = x.abs();
    if (1e-4..1e16).contains(&abs) {
        let s = format!("{x}");
        if s.contains('.') {
            s
        } else {
            format!("{s}.0")
        }
    } else {
        let s = format!("{x:e}");
        match s.split_once('e') {
            Some((mantissa, exp)) => {
                let exp: i32 = exp.parse().unwrap_or(0);
                format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
            }
            None => s,
        }
    }
}

/// `round(x)` with ties to even.
pub fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}
