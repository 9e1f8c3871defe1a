//! `repr`/`str` rendering and the two string-formatting mini-languages
//! (`%` interpolation and `str.format`).

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive};

use crate::error::{PyErr, VmError};
use crate::number::{self, float_repr};
use crate::value::{Args, Value};
use crate::vm::Vm;

/// Quote a string the way `repr` does.
pub fn quote(s: &str) -> String {
    let q = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(q);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == q => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(q);
    out
}

/// A parsed `[[fill]align][sign][#][0][width][,|_][.precision][type]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSpec {
    pub fill: Option<char>,
    pub align: Option<char>,
    pub sign: Option<char>,
    pub alternate: bool,
    pub zero: bool,
    pub width: usize,
    pub grouping: Option<char>,
    pub precision: Option<usize>,
    pub kind: Option<char>,
}

fn is_align(c: char) -> bool {
    matches!(c, '<' | '>' | '=' | '^')
}

fn digits(chars: &[char], i: &mut usize) -> Option<usize> {
    let start = *i;
    while *i < chars.len() && chars[*i].is_ascii_digit() {
        *i += 1;
    }
    if *i == start {
        return None;
    }
    chars[start..*i].iter().collect::<String>().parse().ok()
}

pub fn parse_format_spec(spec: &str) -> Option<FormatSpec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = FormatSpec::default();
    let mut i = 0;
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
        out.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    out.width = digits(&chars, &mut i).unwrap_or(0);
    if let Some(&c @ (',' | '_')) = chars.get(i) {
        out.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        out.precision = Some(digits(&chars, &mut i)?);
    }
    match &chars[i..] {
        [] => {}
        [kind] => out.kind = Some(*kind),
        _ => return None,
    }
    Some(out)
}

fn group(int_part: &str, sep: char, every: usize) -> String {
    let n = int_part.len();
    let mut out = String::with_capacity(n + n / every);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (n - i) % every == 0 {
            out.push(sep);
        }
        out.push(c);
    }
    out
}

fn fixed(x: f64, precision: usize) -> String {
    format!("{:.*}", precision, x)
}

/// `1.5e+03` style exponent notation.
fn exponent(x: f64, precision: usize) -> String {
    let s = format!("{:.*e}", precision, x);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
        }
        None => s,
    }
}

fn strip_zeros(s: &str) -> String {
    match s.split_once('e') {
        Some((mantissa, exp)) => format!("{}e{exp}", strip_zeros(mantissa)),
        None if s.contains('.') => s.trim_end_matches('0').trim_end_matches('.').to_string(),
        None => s.to_string(),
    }
}

fn general(x: f64, precision: usize, alternate: bool) -> String {
    let p = precision.max(1);
    let exp_form = exponent(x, p - 1);
    let exp: i32 = exp_form.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0);
    let s = if -4 <= exp && exp < p as i32 {
        fixed(x, (p as i32 - 1 - exp).max(0) as usize)
    } else {
        exp_form
    };
    if alternate {
        s
    } else {
        strip_zeros(&s)
    }
}

impl FormatSpec {
    /// Pad `body` (already carrying no sign) to the field width.
    fn pad(&self, sign: &str, body: &str, numeric: bool) -> String {
        let len = sign.chars().count() + body.chars().count();
        let (fill, align) = match (self.fill, self.align) {
            (fill, Some(align)) => (fill.unwrap_or(' '), align),
            (_, None) if self.zero && numeric => ('0', '='),
            (_, None) => (' ', if numeric { '>' } else { '<' }),
        };
        if len >= self.width {
            return format!("{sign}{body}");
        }
        let padding = self.width - len;
        let run = |n: usize| fill.to_string().repeat(n);
        match align {
            '<' => format!("{sign}{body}{}", run(padding)),
            '^' => format!("{}{sign}{body}{}", run(padding / 2), run(padding - padding / 2)),
            '=' => format!("{sign}{}{body}", run(padding)),
            _ => format!("{}{sign}{body}", run(padding)),
        }
    }

    fn sign_of(&self, negative: bool) -> &'static str {
        match (negative, self.sign) {
            (true, _) => "-",
            (false, Some('+')) => "+",
            (false, Some(' ')) => " ",
            _ => "",
        }
    }
}

impl Vm {
    pub fn repr(&mut self, v: &Value) -> Result<String, VmError> {
        Ok(match v {
            Value::None => "None".into(),
            Value::NotImplemented => "NotImplemented".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::Str(s) => quote(s),
            Value::List(l) => {
                let items = l.borrow().clone();
                self.guarded(v, "[...]", |vm| Ok(format!("[{}]", vm.join_reprs(&items)?)))?
            }
            Value::Tuple(t) => match t.as_slice() {
                [] => "()".into(),
                [one] => format!("({},)", self.repr(one)?),
                items => format!("({})", self.join_reprs(items)?),
            },
            Value::Dict(d) => {
                let pairs: Vec<(Value, Value)> = d.borrow().values().cloned().collect();
                self.guarded(v, "{...}", |vm| {
                    let mut parts = Vec::with_capacity(pairs.len());
                    for (k, val) in &pairs {
                        parts.push(format!("{}: {}", vm.repr(k)?, vm.repr(val)?));
                    }
                    Ok(format!("{{{}}}", parts.join(", ")))
                })?
            }
            Value::Set(s) => {
                let items: Vec<Value> = s.borrow().values().cloned().collect();
                if items.is_empty() {
                    "set()".into()
                } else {
                    format!("{{{}}}", self.join_reprs(&items)?)
                }
            }
            Value::Range(r) => {
                if r.step == BigInt::from(1) {
                    format!("range({}, {})", r.start, r.stop)
                } else {
                    format!("range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Value::Slice(s) => {
                format!("slice({}, {}, {})", self.repr(&s.start)?, self.repr(&s.stop)?, self.repr(&s.step)?)
            }
            Value::Function(f) => format!("<function {} at {}>", f.qualname, address(v)),
            Value::BoundMethod(m) => {
                let name = match &m.func {
                    Value::Function(f) => f.qualname.clone(),
                    other => self.repr(other)?,
                };
                format!("<bound method {name} of {}>", self.repr(&m.receiver)?)
            }
            Value::Builtin(b) => match &b.receiver {
                Some(r) => format!("<built-in method {} of {} object at {}>", b.name, r.type_name(), address(r)),
                None => format!("<built-in function {}>", b.name),
            },
            Value::HostMethod(h) => format!("<host method {}.{}>", h.unit.replace('/', "."), h.name),
            Value::Class(c) => format!("<class '{}'>", c.name),
            Value::Module(m) => format!("<module '{}'>", m.name),
            Value::Super(s) => format!("<super: <class '{}'>, <{} object>>", s.class.name, s.obj.type_name()),
            Value::Instance(_) => match self.call_special(v, "__repr__", Vec::new())? {
                Some(r) => return self.expect_str(r, "__repr__"),
                None => self.default_repr(v),
            },
            other => self.default_repr(other),
        })
    }

    /// Render a container unless it is already on the rendering stack.
    fn guarded(
        &mut self,
        v: &Value,
        cycle: &str,
        render: impl FnOnce(&mut Vm) -> Result<String, VmError>,
    ) -> Result<String, VmError> {
        let id = v.identity().unwrap_or(0);
        if self.repr_active.contains(&id) {
            return Ok(cycle.to_string());
        }
        self.repr_active.push(id);
        let result = render(self);
        self.repr_active.pop();
        result
    }

    fn join_reprs(&mut self, items: &[Value]) -> Result<String, VmError> {
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(self.repr(item)?);
        }
        Ok(parts.join(", "))
    }

    fn expect_str(&self, r: Value, method: &str) -> Result<String, VmError> {
        match r {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(self.err(
                "TypeError",
                format!("{method} returned non-string (type {})", other.type_name()),
            )),
        }
    }

    /// `str(v)`.
    pub fn to_str(&mut self, v: &Value) -> Result<String, VmError> {
        match v {
            Value::Str(s) => Ok(s.to_string()),
            Value::Instance(_) => match self.call_special(v, "__str__", Vec::new())? {
                Some(r) => self.expect_str(r, "__str__"),
                None => self.repr(v),
            },
            other => self.repr(other),
        }
    }

    pub(crate) fn default_repr(&self, v: &Value) -> String {
        format!("<{} object at {}>", v.type_name(), address(v))
    }

    fn exception_args(&self, v: &Value) -> Vec<Value> {
        match v {
            Value::Instance(inst) => match inst.dict.borrow().get("args") {
                Some(Value::Tuple(items)) => items.to_vec(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// `ValueError('message')`.
    pub(crate) fn exception_repr(&mut self, v: &Value) -> Result<String, VmError> {
        let args = self.exception_args(v);
        Ok(format!("{}({})", v.type_name(), self.join_reprs(&args)?))
    }

    /// The message of an exception: its single argument, or the argument
    /// tuple. `KeyError` shows its key quoted.
    pub(crate) fn exception_str(&mut self, v: &Value) -> Result<String, VmError> {
        let args = self.exception_args(v);
        match args.as_slice() {
            [] => Ok(String::new()),
            [one] if self.is_builtin_instance(v, "KeyError") => self.repr(one),
            [one] => self.to_str(one),
            _ => self.repr(&Value::tuple(args)),
        }
    }

    /// `Name: message`, as printed for an uncaught exception.
    pub fn describe_exception(&mut self, e: &PyErr) -> String {
        let message = self.to_str(&e.value).unwrap_or_else(|_| e.message());
        if message.is_empty() {
            e.class_name()
        } else {
            format!("{}: {message}", e.class_name())
        }
    }

    /// `format(v, spec)` for builtin values.
    pub fn format_value(&mut self, v: &Value, spec: &FormatSpec) -> Result<String, VmError> {
        match (v, spec.kind) {
            (Value::Int(_) | Value::Bool(_), None | Some('d' | 'x' | 'X' | 'o' | 'b' | 'c' | 'n'))
                if !(matches!(v, Value::Bool(_)) && spec.kind.is_none()) =>
            {
                let i = match v {
                    Value::Int(i) => i.clone(),
                    _ => BigInt::from(u8::from(matches!(v, Value::Bool(true)))),
                };
                self.format_int(&i, spec)
            }
            (Value::Int(_) | Value::Bool(_) | Value::Float(_), Some('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%'))
            | (Value::Float(_), None) => {
                let x = match number::Num::of(v) {
                    Some(n) => n.to_f64().map_err(|e| self.num_err(e))?,
                    None => 0.0,
                };
                Ok(self.format_float(x, spec))
            }
            (_, Some(kind)) if kind != 's' => Err(self.err(
                "ValueError",
                format!("Unknown format code '{kind}' for object of type '{}'", v.type_name()),
            )),
            _ => {
                let mut s = self.to_str(v)?;
                if let Some(p) = spec.precision {
                    s = s.chars().take(p).collect();
                }
                Ok(spec.pad("", &s, false))
            }
        }
    }

    fn format_int(&mut self, i: &BigInt, spec: &FormatSpec) -> Result<String, VmError> {
        let abs = i.abs();
        let (prefix, digits) = match spec.kind {
            Some('x') => ("0x", abs.to_str_radix(16)),
            Some('X') => ("0X", abs.to_str_radix(16).to_uppercase()),
            Some('o') => ("0o", abs.to_str_radix(8)),
            Some('b') => ("0b", abs.to_str_radix(2)),
            Some('c') => {
                let c = i
                    .to_u32()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.err("OverflowError", "%c arg not in range(0x110000)"))?;
                return Ok(spec.pad("", &c.to_string(), false));
            }
            _ => ("", abs.to_string()),
        };
        let digits = match spec.grouping {
            Some(sep) if spec.kind.is_none() || spec.kind == Some('d') => group(&digits, sep, 3),
            Some(sep) => group(&digits, sep, 4),
            None => digits,
        };
        let sign = format!("{}{}", spec.sign_of(i.is_negative()), if spec.alternate { prefix } else { "" });
        Ok(spec.pad(&sign, &digits, true))
    }

    fn format_float(&self, x: f64, spec: &FormatSpec) -> String {
        let upper = matches!(spec.kind, Some('F' | 'E' | 'G'));
        let sign = spec.sign_of(x.is_sign_negative() && !x.is_nan());
        let abs = x.abs();
        let mut body = if !abs.is_finite() {
            let special = if abs.is_nan() { "nan" } else { "inf" };
            special.to_string()
        } else {
            match spec.kind {
                Some('f' | 'F') => fixed(abs, spec.precision.unwrap_or(6)),
                Some('e' | 'E') => exponent(abs, spec.precision.unwrap_or(6)),
                Some('g' | 'G') => general(abs, spec.precision.unwrap_or(6), spec.alternate),
                Some('%') => format!("{}%", fixed(abs * 100.0, spec.precision.unwrap_or(6))),
                _ => match spec.precision {
                    Some(p) => general(abs, p, spec.alternate),
                    None => float_repr(abs),
                },
            }
        };
        if upper {
            body = body.to_uppercase();
        }
        if let Some(sep) = spec.grouping {
            let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
            let (int_part, rest) = body.split_at(split);
            body = format!("{}{rest}", group(int_part, sep, 3));
        }
        spec.pad(sign, &body, true)
    }

    /// `template % args`.
    pub(crate) fn percent_format(&mut self, template: &str, args: &Value) -> Result<String, VmError> {
        let items: Vec<Value> = match args {
            Value::Tuple(t) => t.to_vec(),
            other => vec![other.clone()],
        };
        let chars: Vec<char> = template.chars().collect();
        let mut out = String::with_capacity(template.len());
        let mut next_arg = 0;
        let mut used_mapping = false;
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            i += 1;
            if c != '%' {
                out.push(c);
                continue;
            }
            if chars.get(i) == Some(&'%') {
                out.push('%');
                i += 1;
                continue;
            }
            let mut key = None;
            if chars.get(i) == Some(&'(') {
                let close = chars[i..].iter().position(|&c| c == ')').map(|p| i + p);
                let Some(close) = close else {
                    return Err(self.err("ValueError", "incomplete format key"));
                };
                key = Some(chars[i + 1..close].iter().collect::<String>());
                i = close + 1;
            }
            let mut spec = FormatSpec::default();
            while let Some(&flag @ ('-' | '+' | ' ' | '0' | '#')) = chars.get(i) {
                match flag {
                    '-' => spec.align = Some('<'),
                    '0' => spec.zero = true,
                    '#' => spec.alternate = true,
                    sign => {
                        if spec.sign != Some('+') {
                            spec.sign = Some(sign);
                        }
                    }
                }
                i += 1;
            }
            spec.width = digits(&chars, &mut i).unwrap_or(0);
            if chars.get(i) == Some(&'.') {
                i += 1;
                spec.precision = Some(digits(&chars, &mut i).unwrap_or(0));
            }
            let Some(&conversion) = chars.get(i) else {
                return Err(self.err("ValueError", "incomplete format"));
            };
            i += 1;
            let value = match &key {
                Some(k) => {
                    used_mapping = true;
                    self.getitem(args, &Value::str(k))?
                }
                None => {
                    let v = items
                        .get(next_arg)
                        .cloned()
                        .ok_or_else(|| self.err("TypeError", "not enough arguments for format string"))?;
                    next_arg += 1;
                    v
                }
            };
            if spec.align == Some('<') {
                spec.zero = false;
            }
            let piece = match conversion {
                's' | 'r' => {
                    let mut s = if conversion == 's' { self.to_str(&value)? } else { self.repr(&value)? };
                    if let Some(p) = spec.precision {
                        s = s.chars().take(p).collect();
                    }
                    spec.zero = false;
                    spec.pad("", &s, false)
                }
                'c' => {
                    let c = match &value {
                        Value::Str(s) if s.chars().count() == 1 => s.to_string(),
                        Value::Int(i) => match i.to_u32().and_then(char::from_u32) {
                            Some(c) => c.to_string(),
                            None => return Err(self.err("OverflowError", "%c arg not in range(0x110000)")),
                        },
                        _ => return Err(self.err("TypeError", "%c requires an int or a unicode character")),
                    };
                    spec.zero = false;
                    spec.pad("", &c, false)
                }
                'd' | 'i' | 'u' | 'x' | 'X' | 'o' => {
                    let int = match number::Num::of(&value) {
                        Some(number::Num::Int(i)) => i,
                        Some(number::Num::Float(f)) => match trunc_to_int(f) {
                            Some(i) => i,
                            None => return Err(self.err("OverflowError", "cannot convert float infinity to integer")),
                        },
                        None => {
                            return Err(self.err(
                                "TypeError",
                                format!("%{conversion} format: a real number is required, not {}", value.type_name()),
                            ))
                        }
                    };
                    let abs = int.abs();
                    let (prefix, mut body) = match conversion {
                        'x' => ("0x", abs.to_str_radix(16)),
                        'X' => ("0X", abs.to_str_radix(16).to_uppercase()),
                        'o' => ("0o", abs.to_str_radix(8)),
                        _ => ("", abs.to_string()),
                    };
                    if let Some(p) = spec.precision {
                        body = format!("{body:0>p$}");
                    }
                    let sign = format!("{}{}", spec.sign_of(int.is_negative()), if spec.alternate { prefix } else { "" });
                    spec.pad(&sign, &body, true)
                }
                'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                    let Some(n) = number::Num::of(&value) else {
                        return Err(self.err(
                            "TypeError",
                            format!("must be real number, not {}", value.type_name()),
                        ));
                    };
                    let x = n.to_f64().map_err(|e| self.num_err(e))?;
                    spec.kind = Some(conversion);
                    self.format_float(x, &spec)
                }
                other => {
                    return Err(self.err(
                        "ValueError",
                        format!("unsupported format character '{other}' (0x{:x})", other as u32),
                    ))
                }
            };
            out.push_str(&piece);
        }
        if !used_mapping && next_arg < items.len() && !matches!(args, Value::Dict(_)) {
            return Err(self.err("TypeError", "not all arguments converted during string formatting"));
        }
        Ok(out)
    }

    /// `template.format(*args, **kwargs)`.
    pub(crate) fn format_str(&mut self, template: &str, args: &Args) -> Result<String, VmError> {
        let mut auto = 0usize;
        let mut manual = false;
        self.format_fields(template, args, &mut auto, &mut manual, 0)
    }

    fn format_fields(
        &mut self,
        template: &str,
        args: &Args,
        auto: &mut usize,
        manual: &mut bool,
        depth: usize,
    ) -> Result<String, VmError> {
        if depth > 1 {
            return Err(self.err("ValueError", "Max string recursion exceeded"));
        }
        let chars: Vec<char> = template.chars().collect();
        let mut out = String::with_capacity(template.len());
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    out.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    out.push('}');
                    i += 2;
                }
                '}' => return Err(self.err("ValueError", "Single '}' encountered in format string")),
                '{' => {
                    let mut nesting = 1;
                    let mut j = i + 1;
                    while j < chars.len() {
                        match chars[j] {
                            '{' => nesting += 1,
                            '}' => {
                                nesting -= 1;
                                if nesting == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        j += 1;
                    }
                    if j >= chars.len() {
                        return Err(self.err("ValueError", "Single '{' encountered in format string"));
                    }
                    let field: String = chars[i + 1..j].iter().collect();
                    let piece = self.format_field(&field, args, auto, manual, depth)?;
                    out.push_str(&piece);
                    i = j + 1;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    fn format_field(
        &mut self,
        field: &str,
        args: &Args,
        auto: &mut usize,
        manual: &mut bool,
        depth: usize,
    ) -> Result<String, VmError> {
        let (head, spec) = match field.find(':') {
            Some(p) => (&field[..p], &field[p + 1..]),
            None => (field, ""),
        };
        let (name, conversion) = match head.rsplit_once('!') {
            Some((name, conv)) => (name, Some(conv)),
            None => (head, None),
        };
        let split = name.find(|c: char| c == '.' || c == '[').unwrap_or(name.len());
        let (first, mut rest) = name.split_at(split);
        let mut value = if first.is_empty() {
            if *manual {
                return Err(self.err(
                    "ValueError",
                    "cannot switch from manual field specification to automatic field numbering",
                ));
            }
            let index = *auto;
            *auto += 1;
            self.positional_field(args, index)?
        } else if let Ok(index) = first.parse::<usize>() {
            if *auto > 0 {
                return Err(self.err(
                    "ValueError",
                    "cannot switch from automatic field numbering to manual field specification",
                ));
            }
            *manual = true;
            self.positional_field(args, index)?
        } else {
            match args.keywords.iter().find(|(k, _)| k == first) {
                Some((_, v)) => v.clone(),
                None => return Err(self.err_args("KeyError", vec![Value::str(first)])),
            }
        };
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c: char| c == '.' || c == '[').unwrap_or(after.len());
                value = self.getattr(&value, &after[..end])?;
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let Some(end) = after.find(']') else {
                    return Err(self.err("ValueError", "Missing ']' in format string"));
                };
                let key = &after[..end];
                let key = match key.parse::<i64>() {
                    Ok(i) => Value::int(i),
                    Err(_) => Value::str(key),
                };
                value = self.getitem(&value, &key)?;
                rest = &after[end + 1..];
            } else {
                return Err(self.err("ValueError", "Only '.' or '[' may follow ']' in format field specifier"));
            }
        }
        let value = match conversion {
            None => value,
            Some("r") => Value::str(&self.repr(&value)?),
            Some("s") => Value::str(&self.to_str(&value)?),
            Some(other) => {
                return Err(self.err("ValueError", format!("Unknown conversion specifier {other}")));
            }
        };
        let spec = if spec.contains('{') {
            self.format_fields(spec, args, auto, manual, depth + 1)?
        } else {
            spec.to_string()
        };
        if let Some(method) = self.special_method(&value, "__format__") {
            let r = self.call(&method, vec![Value::str(&spec)])?;
            return self.expect_str(r, "__format__");
        }
        let parsed = parse_format_spec(&spec).ok_or_else(|| self.err("ValueError", "Invalid format specifier"))?;
        self.format_value(&value, &parsed)
    }

    fn positional_field(&self, args: &Args, index: usize) -> Result<Value, VmError> {
        args.positional.get(index).cloned().ok_or_else(|| {
            self.err(
                "IndexError",
                format!("Replacement index {index} out of range for positional args tuple"),
            )
        })
    }
}

fn address(v: &Value) -> String {
    format!("0x{:012x}", v.identity().unwrap_or(0))
}

fn trunc_to_int(f: f64) -> Option<BigInt> {
    if f.is_finite() {
        BigInt::from_f64(f.trunc())
    } else {
        None
    }
}
