//! Methods of the builtin value types (`str`, `list`, `dict`, `set`,
//! `tuple`, `int`, `float`, `property`).

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::map::Entry;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};

use crate::builtins::{check_arity, index_arg, m, no_keywords, receiver, sort_items};
use crate::error::VmError;
use crate::value::{Args, DictMap, NativeFn, Property, SetMap, TypeTag, Value};
use crate::vm::Vm;

/// Native methods installed on the type object for `tag`.
pub(crate) fn for_tag(tag: TypeTag) -> Vec<(&'static str, NativeFn)> {
    match tag {
        TypeTag::Str => vec![
            m("upper", str_upper),
            m("lower", str_lower),
            m("capitalize", str_capitalize),
            m("title", str_title),
            m("strip", str_strip),
            m("lstrip", str_lstrip),
            m("rstrip", str_rstrip),
            m("split", str_split),
            m("splitlines", str_splitlines),
            m("join", str_join),
            m("replace", str_replace),
            m("startswith", str_startswith),
            m("endswith", str_endswith),
            m("find", str_find),
            m("index", str_index),
            m("count", str_count),
            m("format", str_format),
            m("zfill", str_zfill),
            m("center", str_center),
            m("ljust", str_ljust),
            m("rjust", str_rjust),
            m("isdigit", str_isdigit),
            m("isalpha", str_isalpha),
            m("isalnum", str_isalnum),
            m("isspace", str_isspace),
            m("isupper", str_isupper),
            m("islower", str_islower),
        ],
        TypeTag::List => vec![
            m("append", list_append),
            m("extend", list_extend),
            m("pop", list_pop),
            m("insert", list_insert),
            m("remove", list_remove),
            m("index", list_index),
            m("count", list_count),
            m("sort", list_sort),
            m("reverse", list_reverse),
            m("clear", list_clear),
            m("copy", list_copy),
        ],
        TypeTag::Tuple => vec![m("index", tuple_index), m("count", tuple_count)],
        TypeTag::Dict => vec![
            m("get", dict_get),
            m("keys", dict_keys),
            m("values", dict_values),
            m("items", dict_items),
            m("pop", dict_pop),
            m("popitem", dict_popitem),
            m("setdefault", dict_setdefault),
            m("update", dict_update),
            m("clear", dict_clear),
            m("copy", dict_copy),
        ],
        TypeTag::Set => vec![
            m("add", set_add),
            m("remove", set_remove),
            m("discard", set_discard),
            m("pop", set_pop),
            m("clear", set_clear),
            m("copy", set_copy),
            m("union", set_union),
            m("intersection", set_intersection),
            m("difference", set_difference),
            m("update", set_update),
            m("issubset", set_issubset),
            m("issuperset", set_issuperset),
        ],
        TypeTag::Int | TypeTag::Bool => vec![m("bit_length", int_bit_length)],
        TypeTag::Float => vec![m("is_integer", float_is_integer)],
        TypeTag::Property => vec![m("getter", property_getter), m("setter", property_setter)],
        _ => Vec::new(),
    }
}

fn this<T>(
    vm: &Vm,
    args: &mut Args,
    name: &str,
    ty: &str,
    pick: impl FnOnce(Value) -> Result<T, Value>,
) -> Result<T, VmError> {
    let value = receiver(vm, name, args)?;
    pick(value).map_err(|other| {
        vm.err(
            "TypeError",
            format!("descriptor '{name}' for '{ty}' objects doesn't apply to a '{}' object", other.type_name()),
        )
    })
}

fn this_str(vm: &Vm, args: &mut Args, name: &str) -> Result<Rc<str>, VmError> {
    this(vm, args, name, "str", |v| match v {
        Value::Str(s) => Ok(s),
        other => Err(other),
    })
}

fn this_list(vm: &Vm, args: &mut Args, name: &str) -> Result<Rc<RefCell<Vec<Value>>>, VmError> {
    this(vm, args, name, "list", |v| match v {
        Value::List(l) => Ok(l),
        other => Err(other),
    })
}

fn this_dict(vm: &Vm, args: &mut Args, name: &str) -> Result<Rc<RefCell<DictMap>>, VmError> {
    this(vm, args, name, "dict", |v| match v {
        Value::Dict(d) => Ok(d),
        other => Err(other),
    })
}

fn this_set(vm: &Vm, args: &mut Args, name: &str) -> Result<Rc<RefCell<SetMap>>, VmError> {
    this(vm, args, name, "set", |v| match v {
        Value::Set(s) => Ok(s),
        other => Err(other),
    })
}

fn str_arg(vm: &Vm, v: &Value, what: &str) -> Result<Rc<str>, VmError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(vm.err("TypeError", format!("{what} must be str, not {}", other.type_name()))),
    }
}

fn text(s: String) -> Value {
    Value::Str(Rc::from(s))
}

// ---- str ----

fn str_map(vm: &mut Vm, mut args: Args, name: &str, f: fn(&str) -> String) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, name)?;
    check_arity(vm, name, &args, 0, 0)?;
    Ok(text(f(&s)))
}

fn str_upper(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_map(vm, args, "upper", str::to_uppercase)
}

fn str_lower(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_map(vm, args, "lower", str::to_lowercase)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn str_capitalize(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_map(vm, args, "capitalize", capitalize)
}

fn title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

fn str_title(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_map(vm, args, "title", title)
}

#[derive(Clone, Copy)]
enum Side {
    Both,
    Left,
    Right,
}

fn strip(vm: &mut Vm, mut args: Args, name: &str, side: Side) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, name)?;
    check_arity(vm, name, &args, 0, 1)?;
    let chars: Option<Vec<char>> = match args.positional.first() {
        None | Some(Value::None) => None,
        Some(v) => Some(str_arg(vm, v, "strip arg")?.chars().collect()),
    };
    let hit = |c: char| match &chars {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };
    let out = match side {
        Side::Both => s.trim_matches(hit),
        Side::Left => s.trim_start_matches(hit),
        Side::Right => s.trim_end_matches(hit),
    };
    Ok(Value::str(out))
}

fn str_strip(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    strip(vm, args, "strip", Side::Both)
}

fn str_lstrip(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    strip(vm, args, "lstrip", Side::Left)
}

fn str_rstrip(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    strip(vm, args, "rstrip", Side::Right)
}

/// Whitespace split with an optional split limit.
fn split_whitespace(s: &str, maxsplit: Option<usize>) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if maxsplit.is_some_and(|n| out.len() >= n) {
            out.push(Value::str(rest));
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        out.push(Value::str(&rest[..end]));
        rest = rest[end..].trim_start();
    }
    out
}

fn str_split(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "split")?;
    let sep_kw = args.take_keyword("sep");
    let max_kw = args.take_keyword("maxsplit");
    no_keywords(vm, "split", &args)?;
    check_arity(vm, "split", &args, 0, 2)?;
    let mut pos = args.positional.into_iter();
    let sep = pos.next().or(sep_kw);
    let maxsplit = match pos.next().or(max_kw) {
        Some(v) => index_arg(vm, &v)?,
        None => -1,
    };
    let maxsplit = usize::try_from(maxsplit).ok();
    let parts = match sep {
        None | Some(Value::None) => split_whitespace(&s, maxsplit),
        Some(v) => {
            let sep = str_arg(vm, &v, "sep")?;
            if sep.is_empty() {
                return Err(vm.err("ValueError", "empty separator"));
            }
            match maxsplit {
                Some(n) => s.splitn(n + 1, &*sep).map(Value::str).collect(),
                None => s.split(&*sep).map(Value::str).collect(),
            }
        }
    };
    Ok(Value::list(parts))
}

fn str_splitlines(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "splitlines")?;
    check_arity(vm, "splitlines", &args, 0, 0)?;
    Ok(Value::list(s.lines().map(Value::str).collect()))
}

fn str_join(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let sep = this_str(vm, &mut args, "join")?;
    check_arity(vm, "join", &args, 1, 1)?;
    let items = vm.collect(&args.positional[0])?;
    let mut parts = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::Str(s) => parts.push(s.to_string()),
            other => {
                return Err(vm.err(
                    "TypeError",
                    format!("sequence item {i}: expected str instance, {} found", other.type_name()),
                ))
            }
        }
    }
    Ok(text(parts.join(&*sep)))
}

fn str_replace(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "replace")?;
    check_arity(vm, "replace", &args, 2, 3)?;
    let old = str_arg(vm, &args.positional[0], "replace() argument 1")?;
    let new = str_arg(vm, &args.positional[1], "replace() argument 2")?;
    let count = match args.positional.get(2) {
        Some(c) => index_arg(vm, c)?,
        None => -1,
    };
    Ok(text(match usize::try_from(count) {
        Ok(n) => s.replacen(&*old, &new, n),
        Err(_) => s.replace(&*old, &new),
    }))
}

fn affix(vm: &mut Vm, mut args: Args, name: &str, prefix: bool) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, name)?;
    check_arity(vm, name, &args, 1, 1)?;
    let candidates = match &args.positional[0] {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    for c in &candidates {
        let Value::Str(c) = c else {
            return Err(vm.err(
                "TypeError",
                format!("{name} first arg must be str or a tuple of str, not {}", c.type_name()),
            ));
        };
        if (prefix && s.starts_with(&**c)) || (!prefix && s.ends_with(&**c)) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn str_startswith(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    affix(vm, args, "startswith", true)
}

fn str_endswith(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    affix(vm, args, "endswith", false)
}

/// Char index of `sub` within `s[start:end]`, with slice-style bounds.
fn find_in(vm: &Vm, s: &str, args: &Args, name: &str) -> Result<Option<usize>, VmError> {
    check_arity(vm, name, args, 1, 3)?;
    let sub = str_arg(vm, &args.positional[0], "substring")?;
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let bound = |v: Option<&Value>, default: i64| -> Result<usize, VmError> {
        let i = match v {
            None | Some(Value::None) => default,
            Some(v) => index_arg(vm, v)?,
        };
        let i = if i < 0 { (i + len).max(0) } else { i.min(len) };
        Ok(i as usize)
    };
    let start = bound(args.positional.get(1), 0)?;
    let end = bound(args.positional.get(2), len)?;
    if start > end {
        return Ok(None);
    }
    let window: String = chars[start..end].iter().collect();
    Ok(window.find(&*sub).map(|byte| start + window[..byte].chars().count()))
}

fn str_find(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "find")?;
    let found = find_in(vm, &s, &args, "find")?;
    Ok(Value::int(found.map_or(-1, |i| i as i64)))
}

fn str_index(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "index")?;
    match find_in(vm, &s, &args, "index")? {
        Some(i) => Ok(Value::int(i as i64)),
        None => Err(vm.err("ValueError", "substring not found")),
    }
}

fn str_count(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "count")?;
    check_arity(vm, "count", &args, 1, 1)?;
    let sub = str_arg(vm, &args.positional[0], "count() argument")?;
    let n = if sub.is_empty() { s.chars().count() + 1 } else { s.matches(&*sub).count() };
    Ok(Value::int(n as i64))
}

fn str_format(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "format")?;
    vm.format_str(&s, &args).map(text)
}

fn str_zfill(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, "zfill")?;
    check_arity(vm, "zfill", &args, 1, 1)?;
    let width = index_arg(vm, &args.positional[0])?;
    let len = s.chars().count();
    let Some(pad) = usize::try_from(width).ok().and_then(|w| w.checked_sub(len)) else {
        return Ok(Value::Str(s));
    };
    let (sign, digits) = match s.chars().next() {
        Some(c @ ('+' | '-')) => (c.to_string(), &s[1..]),
        _ => (String::new(), &s[..]),
    };
    Ok(text(format!("{sign}{}{digits}", "0".repeat(pad))))
}

fn justify(vm: &mut Vm, mut args: Args, name: &str, align: char) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, name)?;
    check_arity(vm, name, &args, 1, 2)?;
    let width = usize::try_from(index_arg(vm, &args.positional[0])?).unwrap_or(0);
    let fill = match args.positional.get(1) {
        None => ' ',
        Some(v) => {
            let f = str_arg(vm, v, "fill character")?;
            let mut chars = f.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err(vm.err("TypeError", "The fill character must be exactly one character long")),
            }
        }
    };
    let len = s.chars().count();
    if width <= len {
        return Ok(Value::Str(s));
    }
    let pad = width - len;
    let run = |n: usize| fill.to_string().repeat(n);
    Ok(text(match align {
        '<' => format!("{s}{}", run(pad)),
        '>' => format!("{}{s}", run(pad)),
        _ => {
            let left = pad / 2 + (pad & width & 1);
            format!("{}{s}{}", run(left), run(pad - left))
        }
    }))
}

fn str_center(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    justify(vm, args, "center", '^')
}

fn str_ljust(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    justify(vm, args, "ljust", '<')
}

fn str_rjust(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    justify(vm, args, "rjust", '>')
}

fn str_test(vm: &mut Vm, mut args: Args, name: &str, test: fn(&str) -> bool) -> Result<Value, VmError> {
    let s = this_str(vm, &mut args, name)?;
    check_arity(vm, name, &args, 0, 0)?;
    Ok(Value::Bool(test(&s)))
}

fn str_isdigit(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_test(vm, args, "isdigit", |s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

fn str_isalpha(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_test(vm, args, "isalpha", |s| !s.is_empty() && s.chars().all(char::is_alphabetic))
}

fn str_isalnum(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_test(vm, args, "isalnum", |s| !s.is_empty() && s.chars().all(char::is_alphanumeric))
}

fn str_isspace(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_test(vm, args, "isspace", |s| !s.is_empty() && s.chars().all(char::is_whitespace))
}

fn str_isupper(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_test(vm, args, "isupper", |s| {
        s.chars().any(char::is_uppercase) && !s.chars().any(char::is_lowercase)
    })
}

fn str_islower(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    str_test(vm, args, "islower", |s| {
        s.chars().any(char::is_lowercase) && !s.chars().any(char::is_uppercase)
    })
}

// ---- list ----

fn list_append(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "append")?;
    check_arity(vm, "append", &args, 1, 1)?;
    list.borrow_mut().extend(args.positional);
    Ok(Value::None)
}

fn list_extend(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "extend")?;
    check_arity(vm, "extend", &args, 1, 1)?;
    let items = vm.collect(&args.positional[0])?;
    list.borrow_mut().extend(items);
    Ok(Value::None)
}

fn list_pop(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "pop")?;
    check_arity(vm, "pop", &args, 0, 1)?;
    let len = list.borrow().len();
    if len == 0 {
        return Err(vm.err("IndexError", "pop from empty list"));
    }
    let index = match args.positional.first() {
        Some(i) => index_arg(vm, i)?,
        None => -1,
    };
    let index = if index < 0 { index + len as i64 } else { index };
    match usize::try_from(index).ok().filter(|&i| i < len) {
        Some(i) => Ok(list.borrow_mut().remove(i)),
        None => Err(vm.err("IndexError", "pop index out of range")),
    }
}

fn list_insert(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "insert")?;
    check_arity(vm, "insert", &args, 2, 2)?;
    let index = index_arg(vm, &args.positional[0])?;
    let len = list.borrow().len() as i64;
    let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
    let item = args.positional.swap_remove(1);
    list.borrow_mut().insert(index as usize, item);
    Ok(Value::None)
}

/// Position of the first element equal to `x`.
fn position(vm: &mut Vm, items: &[Value], x: &Value) -> Result<Option<usize>, VmError> {
    for (i, item) in items.iter().enumerate() {
        if item.is(x) || vm.eq(item, x)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn occurrences(vm: &mut Vm, items: &[Value], x: &Value) -> Result<Value, VmError> {
    let mut n = 0i64;
    for item in items {
        if item.is(x) || vm.eq(item, x)? {
            n += 1;
        }
    }
    Ok(Value::int(n))
}

fn list_remove(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "remove")?;
    check_arity(vm, "remove", &args, 1, 1)?;
    let items = list.borrow().clone();
    match position(vm, &items, &args.positional[0])? {
        Some(i) => {
            list.borrow_mut().remove(i);
            Ok(Value::None)
        }
        None => Err(vm.err("ValueError", "list.remove(x): x not in list")),
    }
}

fn list_index(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "index")?;
    check_arity(vm, "index", &args, 1, 1)?;
    let items = list.borrow().clone();
    match position(vm, &items, &args.positional[0])? {
        Some(i) => Ok(Value::int(i as i64)),
        None => {
            let shown = vm.repr(&args.positional[0])?;
            Err(vm.err("ValueError", format!("{shown} is not in list")))
        }
    }
}

fn list_count(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "count")?;
    check_arity(vm, "count", &args, 1, 1)?;
    let items = list.borrow().clone();
    occurrences(vm, &items, &args.positional[0])
}

fn list_sort(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "sort")?;
    let key = args.take_keyword("key").filter(|k| !matches!(k, Value::None));
    let reverse = args.take_keyword("reverse");
    no_keywords(vm, "sort", &args)?;
    check_arity(vm, "sort", &args, 0, 0)?;
    let reverse = match reverse {
        Some(r) => vm.truth(&r)?,
        None => false,
    };
    let items = list.borrow().clone();
    let sorted = sort_items(vm, items, key, reverse)?;
    *list.borrow_mut() = sorted;
    Ok(Value::None)
}

fn list_reverse(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "reverse")?;
    check_arity(vm, "reverse", &args, 0, 0)?;
    list.borrow_mut().reverse();
    Ok(Value::None)
}

fn list_clear(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "clear")?;
    check_arity(vm, "clear", &args, 0, 0)?;
    list.borrow_mut().clear();
    Ok(Value::None)
}

fn list_copy(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let list = this_list(vm, &mut args, "copy")?;
    check_arity(vm, "copy", &args, 0, 0)?;
    let items = list.borrow().clone();
    Ok(Value::list(items))
}

// ---- tuple ----

fn this_tuple(vm: &Vm, args: &mut Args, name: &str) -> Result<Rc<Vec<Value>>, VmError> {
    this(vm, args, name, "tuple", |v| match v {
        Value::Tuple(t) => Ok(t),
        other => Err(other),
    })
}

fn tuple_index(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let items = this_tuple(vm, &mut args, "index")?;
    check_arity(vm, "index", &args, 1, 1)?;
    match position(vm, &items, &args.positional[0])? {
        Some(i) => Ok(Value::int(i as i64)),
        None => Err(vm.err("ValueError", "tuple.index(x): x not in tuple")),
    }
}

fn tuple_count(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let items = this_tuple(vm, &mut args, "count")?;
    check_arity(vm, "count", &args, 1, 1)?;
    occurrences(vm, &items, &args.positional[0])
}

// ---- dict ----

fn dict_get(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "get")?;
    check_arity(vm, "get", &args, 1, 2)?;
    let key = vm.hash_key(&args.positional[0])?;
    let found = dict.borrow().get(&key).map(|(_, v)| v.clone());
    Ok(found.or_else(|| args.positional.get(1).cloned()).unwrap_or(Value::None))
}

fn dict_view(vm: &mut Vm, mut args: Args, name: &str) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, name)?;
    check_arity(vm, name, &args, 0, 0)?;
    let entries = dict.borrow();
    Ok(Value::list(match name {
        "keys" => entries.values().map(|(k, _)| k.clone()).collect(),
        "values" => entries.values().map(|(_, v)| v.clone()).collect(),
        _ => entries.values().map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()])).collect(),
    }))
}

fn dict_keys(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    dict_view(vm, args, "keys")
}

fn dict_values(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    dict_view(vm, args, "values")
}

fn dict_items(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    dict_view(vm, args, "items")
}

fn dict_pop(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "pop")?;
    check_arity(vm, "pop", &args, 1, 2)?;
    let key = vm.hash_key(&args.positional[0])?;
    let removed = dict.borrow_mut().shift_remove(&key);
    match (removed, args.positional.get(1)) {
        (Some((_, v)), _) => Ok(v),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(vm.err_args("KeyError", vec![args.positional[0].clone()])),
    }
}

fn dict_popitem(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "popitem")?;
    check_arity(vm, "popitem", &args, 0, 0)?;
    let last = dict.borrow_mut().pop();
    match last {
        Some((_, (k, v))) => Ok(Value::tuple(vec![k, v])),
        None => Err(vm.err("KeyError", "popitem(): dictionary is empty")),
    }
}

fn dict_setdefault(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "setdefault")?;
    check_arity(vm, "setdefault", &args, 1, 2)?;
    let default = args.positional.get(1).cloned().unwrap_or(Value::None);
    let key = vm.hash_key(&args.positional[0])?;
    let mut entries = dict.borrow_mut();
    let (_, value) = entries.entry(key).or_insert_with(|| (args.positional[0].clone(), default));
    Ok(value.clone())
}

fn dict_update(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "update")?;
    check_arity(vm, "update", &args, 0, 1)?;
    let mut pairs = match args.positional.first() {
        Some(other) => crate::builtins::dict_pairs(vm, other)?,
        None => Vec::new(),
    };
    pairs.extend(args.keywords.into_iter().map(|(k, v)| (Value::str(&k), v)));
    for (k, v) in pairs {
        let key = vm.hash_key(&k)?;
        match dict.borrow_mut().entry(key) {
            Entry::Occupied(mut e) => e.get_mut().1 = v,
            Entry::Vacant(e) => {
                e.insert((k, v));
            }
        }
    }
    Ok(Value::None)
}

fn dict_clear(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "clear")?;
    check_arity(vm, "clear", &args, 0, 0)?;
    dict.borrow_mut().clear();
    Ok(Value::None)
}

fn dict_copy(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let dict = this_dict(vm, &mut args, "copy")?;
    check_arity(vm, "copy", &args, 0, 0)?;
    let entries = dict.borrow().clone();
    Ok(Value::Dict(Rc::new(RefCell::new(entries))))
}

// ---- set ----

fn set_add(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "add")?;
    check_arity(vm, "add", &args, 1, 1)?;
    let item = args.positional.swap_remove(0);
    let key = vm.hash_key(&item)?;
    set.borrow_mut().entry(key).or_insert(item);
    Ok(Value::None)
}

fn set_remove(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "remove")?;
    check_arity(vm, "remove", &args, 1, 1)?;
    let key = vm.hash_key(&args.positional[0])?;
    let removed = set.borrow_mut().shift_remove(&key);
    match removed {
        Some(_) => Ok(Value::None),
        None => Err(vm.err_args("KeyError", vec![args.positional[0].clone()])),
    }
}

fn set_discard(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "discard")?;
    check_arity(vm, "discard", &args, 1, 1)?;
    let key = vm.hash_key(&args.positional[0])?;
    set.borrow_mut().shift_remove(&key);
    Ok(Value::None)
}

fn set_pop(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "pop")?;
    check_arity(vm, "pop", &args, 0, 0)?;
    let first = set.borrow_mut().shift_remove_index(0);
    match first {
        Some((_, v)) => Ok(v),
        None => Err(vm.err("KeyError", "pop from an empty set")),
    }
}

fn set_clear(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "clear")?;
    check_arity(vm, "clear", &args, 0, 0)?;
    set.borrow_mut().clear();
    Ok(Value::None)
}

fn set_copy(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "copy")?;
    check_arity(vm, "copy", &args, 0, 0)?;
    let items = set.borrow().clone();
    Ok(Value::Set(Rc::new(RefCell::new(items))))
}

/// The hashed contents of every argument iterable.
fn other_sets(vm: &mut Vm, args: &Args) -> Result<Vec<SetMap>, VmError> {
    let mut out = Vec::with_capacity(args.positional.len());
    for other in &args.positional {
        let items = vm.collect(other)?;
        let mut map = SetMap::new();
        for item in items {
            let key = vm.hash_key(&item)?;
            map.entry(key).or_insert(item);
        }
        out.push(map);
    }
    Ok(out)
}

fn set_combine(vm: &mut Vm, mut args: Args, name: &str) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, name)?;
    no_keywords(vm, name, &args)?;
    let others = other_sets(vm, &args)?;
    let mut result = set.borrow().clone();
    for other in others {
        match name {
            "union" => {
                for (k, v) in other {
                    result.entry(k).or_insert(v);
                }
            }
            "intersection" => result.retain(|k, _| other.contains_key(k)),
            _ => result.retain(|k, _| !other.contains_key(k)),
        }
    }
    Ok(Value::Set(Rc::new(RefCell::new(result))))
}

fn set_union(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    set_combine(vm, args, "union")
}

fn set_intersection(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    set_combine(vm, args, "intersection")
}

fn set_difference(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    set_combine(vm, args, "difference")
}

fn set_update(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, "update")?;
    let others = other_sets(vm, &args)?;
    let mut entries = set.borrow_mut();
    for other in others {
        for (k, v) in other {
            entries.entry(k).or_insert(v);
        }
    }
    Ok(Value::None)
}

fn set_relation(vm: &mut Vm, mut args: Args, name: &str, subset: bool) -> Result<Value, VmError> {
    let set = this_set(vm, &mut args, name)?;
    check_arity(vm, name, &args, 1, 1)?;
    let others = other_sets(vm, &args)?;
    let mine = set.borrow();
    let other = others.first().cloned().unwrap_or_default();
    let holds = if subset {
        mine.keys().all(|k| other.contains_key(k))
    } else {
        other.keys().all(|k| mine.contains_key(k))
    };
    Ok(Value::Bool(holds))
}

fn set_issubset(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    set_relation(vm, args, "issubset", true)
}

fn set_issuperset(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    set_relation(vm, args, "issuperset", false)
}

// ---- numbers ----

fn int_bit_length(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let i = this(vm, &mut args, "bit_length", "int", |v| match v {
        Value::Int(i) => Ok(i),
        Value::Bool(b) => Ok(BigInt::from(u8::from(b))),
        other => Err(other),
    })?;
    check_arity(vm, "bit_length", &args, 0, 0)?;
    Ok(Value::Int(BigInt::from(if i.is_zero() { 0 } else { i.abs().bits() })))
}

fn float_is_integer(vm: &mut Vm, mut args: Args) -> Result<Value, VmError> {
    let x = this(vm, &mut args, "is_integer", "float", |v| match v {
        Value::Float(x) => Ok(x),
        other => Err(other),
    })?;
    check_arity(vm, "is_integer", &args, 0, 0)?;
    Ok(Value::Bool(x.is_finite() && x.fract() == 0.0))
}

// ---- property ----

fn property_accessor(vm: &mut Vm, mut args: Args, name: &str, setter: bool) -> Result<Value, VmError> {
    let prop = this(vm, &mut args, name, "property", |v| match v {
        Value::Property(p) => Ok(p),
        other => Err(other),
    })?;
    check_arity(vm, name, &args, 1, 1)?;
    let func = args.positional.swap_remove(0);
    let (fget, fset) = if setter {
        (prop.fget.clone(), Some(func))
    } else {
        (Some(func), prop.fset.clone())
    };
    Ok(Value::Property(Rc::new(Property { fget, fset })))
}

fn property_getter(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    property_accessor(vm, args, "getter", false)
}

fn property_setter(vm: &mut Vm, args: Args) -> Result<Value, VmError> {
    property_accessor(vm, args, "setter", true)
}
