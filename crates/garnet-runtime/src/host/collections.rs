//! String, Symbol, Array, Hash and Range methods

use super::inspect::{inspect_str, inspect_symbol, is_plain_identifier};
use super::numeric::{core_cmp, ordering_value};
use super::{arg, check_arity, inspect_value, need_block, to_s, values_eq, ReferenceHost};
use crate::object::NativeCall;
use crate::value::{RHash, Symbol, Value};
use crate::vm::{Block, Vm, VmError};
use std::cmp::Ordering;
use std::sync::Arc;

pub(super) fn install(host: &Arc<ReferenceHost>) {
    install_string(host);
    install_symbol(host);
    install_array(host);
    install_hash(host);
    install_range(host);
}

/// Elements beyond which `Array#*`, `String#*` and friends refuse to grow
const MAX_REPEAT: usize = 1 << 24;

fn str_recv(vm: &Vm, call: &NativeCall<'_>) -> Result<String, VmError> {
    match call.recv {
        Value::Str(s) => Ok(s.lock().clone()),
        _ => Err(vm.type_error("string receiver expected")),
    }
}

fn str_arg(vm: &Vm, value: &Value) -> Result<String, VmError> {
    match value {
        Value::Str(s) => Ok(s.lock().clone()),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into String",
            implicit_name(vm, other)
        ))),
    }
}

fn int_arg(vm: &Vm, value: &Value) -> Result<i64, VmError> {
    match value {
        Value::Fixnum(n) => Ok(*n),
        Value::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into Integer",
            implicit_name(vm, other)
        ))),
    }
}

fn implicit_name(vm: &Vm, value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::True => "true".to_string(),
        Value::False => "false".to_string(),
        other => vm.host().class_name(vm.host().class_of(other)),
    }
}

/// Resolve a possibly negative index against `len`.
fn position(idx: i64, len: usize) -> Option<usize> {
    let idx = if idx < 0 { idx + len as i64 } else { idx };
    (0..len as i64).contains(&idx).then_some(idx as usize)
}

/// `<=>` falling back to method dispatch for non-core values.
fn compare_values(vm: &mut Vm, a: &Value, b: &Value) -> Result<Ordering, VmError> {
    if let Some(ord) = core_cmp(a, b) {
        return Ok(ord);
    }
    match vm.call_method(a.clone(), "<=>", vec![b.clone()], None)? {
        Value::Fixnum(n) => Ok(n.cmp(&0)),
        _ => {
            let host = vm.host();
            let (x, y) = (host.class_of(a), host.class_of(b));
            Err(vm.raise(
                "ArgumentError",
                format!("comparison of {} with {} failed", host.class_name(x), host.class_name(y)),
            ))
        }
    }
}

// ======================================================================
// String
// ======================================================================

fn install_string(host: &Arc<ReferenceHost>) {
    let string = host.core().string;

    host.define_native(string, "+", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let (a, b) = (str_recv(vm, &call)?, str_arg(vm, &call.args[0])?);
        Ok(Value::str(a + &b))
    });
    host.define_native(string, "*", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let s = str_recv(vm, &call)?;
        let n = int_arg(vm, &call.args[0])?;
        if n < 0 {
            return Err(vm.raise("ArgumentError", "negative argument"));
        }
        if (n as usize).saturating_mul(s.len()) > MAX_REPEAT {
            return Err(vm.raise("ArgumentError", "argument too big"));
        }
        Ok(Value::str(s.repeat(n as usize)))
    });
    for name in ["<<", "concat"] {
        host.define_native(string, name, |vm, call| {
            check_arity(vm, &call, 1, 1)?;
            let Value::Str(target) = call.recv else {
                return Err(vm.type_error("string receiver expected"));
            };
            let tail = match &call.args[0] {
                Value::Fixnum(code) => u32::try_from(*code)
                    .ok()
                    .and_then(char::from_u32)
                    .map(String::from)
                    .ok_or_else(|| vm.raise("RangeError", format!("{} out of char range", code)))?,
                other => str_arg(vm, other)?,
            };
            target.lock().push_str(&tail);
            Ok(call.recv.clone())
        });
    }
    host.define_native(string, "==", |_, call| Ok(Value::bool(string_eq(call.recv, &arg(&call, 0)))));
    host.define_native(string, "eql?", |_, call| Ok(Value::bool(string_eq(call.recv, &arg(&call, 0)))));
    host.define_native(string, "!=", |_, call| Ok(Value::bool(!string_eq(call.recv, &arg(&call, 0)))));
    host.define_native(string, "===", |_, call| Ok(Value::bool(string_eq(call.recv, &arg(&call, 0)))));
    host.define_native(string, "<=>", |_, call| Ok(ordering_value(core_cmp(call.recv, &arg(&call, 0)))));
    for (name, test) in [
        ("<", Ordering::is_lt as fn(Ordering) -> bool),
        ("<=", Ordering::is_le),
        (">", Ordering::is_gt),
        (">=", Ordering::is_ge),
    ] {
        host.define_native(string, name, move |vm, call| {
            check_arity(vm, &call, 1, 1)?;
            let b = str_arg(vm, &call.args[0])?;
            Ok(Value::bool(test(str_recv(vm, &call)?.as_str().cmp(b.as_str()))))
        });
    }
    for name in ["length", "size"] {
        host.define_native(string, name, |vm, call| {
            Ok(Value::int(str_recv(vm, &call)?.chars().count() as i64))
        });
    }
    host.define_native(string, "bytesize", |vm, call| Ok(Value::int(str_recv(vm, &call)?.len() as i64)));
    host.define_native(string, "empty?", |vm, call| Ok(Value::bool(str_recv(vm, &call)?.is_empty())));
    host.define_native(string, "to_s", |_, call| Ok(call.recv.clone()));
    host.define_native(string, "to_str", |_, call| Ok(call.recv.clone()));
    host.define_native(string, "inspect", |vm, call| Ok(Value::str(inspect_str(&str_recv(vm, &call)?))));
    for name in ["to_sym", "intern"] {
        host.define_native(string, name, |vm, call| Ok(Value::sym(&str_recv(vm, &call)?)));
    }
    host.define_native(string, "to_i", |vm, call| Ok(Value::int(parse_leading_int(&str_recv(vm, &call)?))));
    host.define_native(string, "to_f", |vm, call| {
        Ok(Value::Float(parse_leading_float(&str_recv(vm, &call)?)))
    });
    host.define_native(string, "upcase", |vm, call| Ok(Value::str(str_recv(vm, &call)?.to_uppercase())));
    host.define_native(string, "downcase", |vm, call| {
        Ok(Value::str(str_recv(vm, &call)?.to_lowercase()))
    });
    host.define_native(string, "capitalize", |vm, call| {
        let s = str_recv(vm, &call)?;
        let mut chars = s.chars();
        let out = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            None => String::new(),
        };
        Ok(Value::str(out))
    });
    host.define_native(string, "reverse", |vm, call| {
        Ok(Value::str(str_recv(vm, &call)?.chars().rev().collect::<String>()))
    });
    host.define_native(string, "strip", |vm, call| Ok(Value::str(str_recv(vm, &call)?.trim())));
    host.define_native(string, "chars", |vm, call| {
        let chars = str_recv(vm, &call)?.chars().map(|c| Value::str(c.to_string())).collect();
        Ok(Value::array(chars))
    });
    host.define_native(string, "include?", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let needle = str_arg(vm, &call.args[0])?;
        Ok(Value::bool(str_recv(vm, &call)?.contains(&needle)))
    });
    host.define_native(string, "start_with?", |vm, call| {
        let s = str_recv(vm, &call)?;
        for prefix in call.args {
            if s.starts_with(&str_arg(vm, prefix)?) {
                return Ok(Value::True);
            }
        }
        Ok(Value::False)
    });
    host.define_native(string, "end_with?", |vm, call| {
        let s = str_recv(vm, &call)?;
        for suffix in call.args {
            if s.ends_with(&str_arg(vm, suffix)?) {
                return Ok(Value::True);
            }
        }
        Ok(Value::False)
    });
    host.define_native(string, "split", |vm, call| {
        check_arity(vm, &call, 0, 1)?;
        let s = str_recv(vm, &call)?;
        let parts: Vec<Value> = match call.args.first() {
            None | Some(Value::Nil) => s.split_whitespace().map(Value::str).collect(),
            Some(sep) => {
                let sep = str_arg(vm, sep)?;
                if sep.is_empty() {
                    s.chars().map(|c| Value::str(c.to_string())).collect()
                } else if sep == " " {
                    s.split_whitespace().map(Value::str).collect()
                } else {
                    let mut parts: Vec<&str> = s.split(sep.as_str()).collect();
                    while parts.last().map_or(false, |p| p.is_empty()) {
                        parts.pop();
                    }
                    parts.into_iter().map(Value::str).collect()
                }
            }
        };
        Ok(Value::array(parts))
    });
    host.define_native(string, "[]", |vm, call| {
        check_arity(vm, &call, 1, 2)?;
        let chars: Vec<char> = str_recv(vm, &call)?.chars().collect();
        let start = int_arg(vm, &call.args[0])?;
        let Some(start) = position(start, chars.len() + 1) else {
            return Ok(Value::Nil);
        };
        match call.args.get(1) {
            None if start == chars.len() => Ok(Value::Nil),
            None => Ok(Value::str(chars[start].to_string())),
            Some(len) => {
                let len = int_arg(vm, len)?;
                if len < 0 {
                    return Ok(Value::Nil);
                }
                let end = (start + len as usize).min(chars.len());
                Ok(Value::str(chars[start..end].iter().collect::<String>()))
            }
        }
    });
    host.define_native(string, "dup", |vm, call| Ok(Value::str(str_recv(vm, &call)?)));
    host.define_native(string, "hash", |vm, call| {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        str_recv(vm, &call)?.hash(&mut hasher);
        Ok(Value::int((hasher.finish() >> 2) as i64))
    });
}

fn string_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Arc::ptr_eq(x, y) || *x.lock() == *y.lock(),
        _ => false,
    }
}

fn parse_leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits: String = digits
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '_')
        .filter(|c| *c != '_')
        .collect();
    digits.parse::<i64>().map_or(0, |n| sign * n)
}

fn parse_leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    for (i, c) in s.char_indices() {
        let ok = match c {
            '0'..='9' => true,
            '+' | '-' => i == 0 || s[..i].ends_with(['e', 'E']),
            '.' if !seen_dot && !seen_exp => {
                seen_dot = true;
                true
            }
            'e' | 'E' if !seen_exp && i > 0 => {
                seen_exp = true;
                true
            }
            _ => false,
        };
        if !ok {
            break;
        }
        end = i + c.len_utf8();
    }
    // Trim a dangling exponent or sign
    let mut text = &s[..end];
    while let Some(stripped) = text.strip_suffix(['e', 'E', '+', '-', '.']) {
        text = stripped;
    }
    text.parse::<f64>().unwrap_or(0.0)
}

// ======================================================================
// Symbol
// ======================================================================

fn install_symbol(host: &Arc<ReferenceHost>) {
    let symbol = host.core().symbol;
    fn sym(vm: &Vm, call: &NativeCall<'_>) -> Result<Symbol, VmError> {
        match call.recv {
            Value::Symbol(sym) => Ok(sym.clone()),
            _ => Err(vm.type_error("symbol receiver expected")),
        }
    }
    for name in ["to_s", "name", "id2name"] {
        host.define_native(symbol, name, |vm, call| Ok(Value::str(sym(vm, &call)?.as_str())));
    }
    host.define_native(symbol, "to_sym", |_, call| Ok(call.recv.clone()));
    host.define_native(symbol, "inspect", |vm, call| Ok(Value::str(inspect_symbol(&sym(vm, &call)?))));
    for name in ["length", "size"] {
        host.define_native(symbol, name, |vm, call| {
            Ok(Value::int(sym(vm, &call)?.as_str().chars().count() as i64))
        });
    }
    host.define_native(symbol, "<=>", |_, call| Ok(ordering_value(core_cmp(call.recv, &arg(&call, 0)))));
    host.define_native(symbol, "to_proc", |vm, _| {
        Err(vm.raise("NotImplementedError", "Symbol#to_proc is not supported"))
    });
}

// ======================================================================
// Array
// ======================================================================

fn array_recv(vm: &Vm, call: &NativeCall<'_>) -> Result<Vec<Value>, VmError> {
    match call.recv {
        Value::Array(items) => Ok(items.lock().clone()),
        _ => Err(vm.type_error("array receiver expected")),
    }
}

fn array_arg(vm: &Vm, value: &Value) -> Result<Vec<Value>, VmError> {
    match value {
        Value::Array(items) => Ok(items.lock().clone()),
        other => Err(vm.type_error(format!(
            "no implicit conversion of {} into Array",
            implicit_name(vm, other)
        ))),
    }
}

fn with_array<R>(
    vm: &Vm,
    call: &NativeCall<'_>,
    f: impl FnOnce(&mut Vec<Value>) -> R,
) -> Result<R, VmError> {
    match call.recv {
        Value::Array(items) => Ok(f(&mut items.lock())),
        _ => Err(vm.type_error("array receiver expected")),
    }
}

/// Yield each element, collecting the block results.
fn map_block(vm: &mut Vm, block: &Block, items: &[Value]) -> Result<Vec<Value>, VmError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(vm.call_block(block, vec![item.clone()])?);
    }
    Ok(out)
}

fn install_array(host: &Arc<ReferenceHost>) {
    let array = host.core().array;

    host.define_native(array, "[]", |vm, call| {
        check_arity(vm, &call, 1, 2)?;
        let items = array_recv(vm, &call)?;
        let start = int_arg(vm, &call.args[0])?;
        match call.args.get(1) {
            None => Ok(position(start, items.len()).map_or(Value::Nil, |i| items[i].clone())),
            Some(len) => {
                let len = int_arg(vm, len)?;
                let Some(start) = position(start, items.len() + 1) else {
                    return Ok(Value::Nil);
                };
                if len < 0 {
                    return Ok(Value::Nil);
                }
                let end = (start + len as usize).min(items.len());
                Ok(Value::array(items[start..end].to_vec()))
            }
        }
    });
    host.define_native(array, "[]=", |vm, call| {
        check_arity(vm, &call, 2, 2)?;
        let idx = int_arg(vm, &call.args[0])?;
        let value = call.args[1].clone();
        let stored = with_array(vm, &call, |items| {
            let len = items.len() as i64;
            let idx = if idx < 0 { idx + len } else { idx };
            if idx < 0 {
                return false;
            }
            let idx = idx as usize;
            if idx >= items.len() {
                items.resize(idx + 1, Value::Nil);
            }
            items[idx] = value.clone();
            true
        })?;
        if !stored {
            return Err(vm.raise(
                "IndexError",
                format!("index {} too small for array", idx),
            ));
        }
        Ok(value)
    });
    for name in ["<<", "push", "append"] {
        host.define_native(array, name, |vm, call| {
            let args = call.args.to_vec();
            with_array(vm, &call, |items| items.extend(args))?;
            Ok(call.recv.clone())
        });
    }
    host.define_native(array, "pop", |vm, call| {
        Ok(with_array(vm, &call, |items| items.pop())?.unwrap_or(Value::Nil))
    });
    host.define_native(array, "shift", |vm, call| {
        Ok(with_array(vm, &call, |items| (!items.is_empty()).then(|| items.remove(0)))?
            .unwrap_or(Value::Nil))
    });
    for name in ["unshift", "prepend"] {
        host.define_native(array, name, |vm, call| {
            let args = call.args.to_vec();
            with_array(vm, &call, |items| {
                items.splice(0..0, args);
            })?;
            Ok(call.recv.clone())
        });
    }
    for name in ["length", "size"] {
        host.define_native(array, name, |vm, call| Ok(Value::int(array_recv(vm, &call)?.len() as i64)));
    }
    host.define_native(array, "empty?", |vm, call| Ok(Value::bool(array_recv(vm, &call)?.is_empty())));
    host.define_native(array, "first", |vm, call| {
        let items = array_recv(vm, &call)?;
        match call.args.first() {
            None => Ok(items.first().cloned().unwrap_or(Value::Nil)),
            Some(n) => {
                let n = int_arg(vm, n)?.max(0) as usize;
                Ok(Value::array(items.into_iter().take(n).collect()))
            }
        }
    });
    host.define_native(array, "last", |vm, call| {
        let items = array_recv(vm, &call)?;
        match call.args.first() {
            None => Ok(items.last().cloned().unwrap_or(Value::Nil)),
            Some(n) => {
                let n = (int_arg(vm, n)?.max(0) as usize).min(items.len());
                Ok(Value::array(items[items.len() - n..].to_vec()))
            }
        }
    });
    host.define_native(array, "each", |vm, call| {
        let block = need_block(vm, &call)?;
        let Value::Array(items) = call.recv else {
            return Err(vm.type_error("array receiver expected"));
        };
        // the block may grow the array while it runs
        let mut i = 0;
        loop {
            let item = items.lock().get(i).cloned();
            let Some(item) = item else { break };
            vm.call_block(block, vec![item])?;
            i += 1;
        }
        Ok(call.recv.clone())
    });
    host.define_native(array, "each_with_index", |vm, call| {
        let block = need_block(vm, &call)?;
        for (i, item) in array_recv(vm, &call)?.into_iter().enumerate() {
            vm.call_block(block, vec![item, Value::int(i as i64)])?;
        }
        Ok(call.recv.clone())
    });
    for name in ["map", "collect"] {
        host.define_native(array, name, |vm, call| {
            let block = need_block(vm, &call)?;
            let items = array_recv(vm, &call)?;
            Ok(Value::array(map_block(vm, block, &items)?))
        });
    }
    for (name, keep) in [("select", true), ("filter", true), ("reject", false)] {
        host.define_native(array, name, move |vm, call| {
            let block = need_block(vm, &call)?;
            let mut out = Vec::new();
            for item in array_recv(vm, &call)? {
                if vm.call_block(block, vec![item.clone()])?.truthy() == keep {
                    out.push(item);
                }
            }
            Ok(Value::array(out))
        });
    }
    host.define_native(array, "find", |vm, call| {
        let block = need_block(vm, &call)?;
        for item in array_recv(vm, &call)? {
            if vm.call_block(block, vec![item.clone()])?.truthy() {
                return Ok(item);
            }
        }
        Ok(Value::Nil)
    });
    for (name, want) in [("any?", true), ("all?", false)] {
        host.define_native(array, name, move |vm, call| {
            for item in array_recv(vm, &call)? {
                let hit = match call.block {
                    Some(block) => vm.call_block(block, vec![item])?.truthy(),
                    None => item.truthy(),
                };
                if hit == want {
                    return Ok(Value::bool(want));
                }
            }
            Ok(Value::bool(!want))
        });
    }
    for name in ["inject", "reduce"] {
        host.define_native(array, name, |vm, call| {
            check_arity(vm, &call, 0, 2)?;
            let mut items = array_recv(vm, &call)?.into_iter();
            let (init, op) = match (call.args, call.block) {
                ([init, Value::Symbol(op)], _) => (Some(init.clone()), Some(op.clone())),
                ([Value::Symbol(op)], None) => (None, Some(op.clone())),
                ([init], Some(_)) => (Some(init.clone()), None),
                ([], Some(_)) => (None, None),
                _ => return Err(vm.raise("ArgumentError", "inject needs a block or a symbol")),
            };
            let Some(mut acc) = init.or_else(|| items.next()) else {
                return Ok(Value::Nil);
            };
            for item in items {
                acc = match (&op, call.block) {
                    (Some(op), _) => vm.call_method(acc, op.as_str(), vec![item], None)?,
                    (None, Some(block)) => vm.call_block(block, vec![acc, item])?,
                    (None, None) => unreachable!("checked above"),
                };
            }
            Ok(acc)
        });
    }
    host.define_native(array, "sum", |vm, call| {
        let mut acc = call.args.first().cloned().unwrap_or(Value::int(0));
        for item in array_recv(vm, &call)? {
            let item = match call.block {
                Some(block) => vm.call_block(block, vec![item])?,
                None => item,
            };
            acc = vm.call_method(acc, "+", vec![item], None)?;
        }
        Ok(acc)
    });
    host.define_native(array, "include?", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        for item in array_recv(vm, &call)? {
            if values_eq(vm, &item, &call.args[0])? {
                return Ok(Value::True);
            }
        }
        Ok(Value::False)
    });
    host.define_native(array, "index", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        for (i, item) in array_recv(vm, &call)?.into_iter().enumerate() {
            if values_eq(vm, &item, &call.args[0])? {
                return Ok(Value::int(i as i64));
            }
        }
        Ok(Value::Nil)
    });
    host.define_native(array, "join", |vm, call| {
        check_arity(vm, &call, 0, 1)?;
        let sep = match call.args.first() {
            None | Some(Value::Nil) => String::new(),
            Some(sep) => str_arg(vm, sep)?,
        };
        let mut parts = Vec::new();
        for item in array_recv(vm, &call)? {
            parts.push(match &item {
                Value::Array(_) => {
                    let joined = vm.call_method(item.clone(), "join", call.args.to_vec(), None)?;
                    to_s(vm, &joined)?
                }
                other => to_s(vm, other)?,
            });
        }
        Ok(Value::str(parts.join(&sep)))
    });
    host.define_native(array, "reverse", |vm, call| {
        let mut items = array_recv(vm, &call)?;
        items.reverse();
        Ok(Value::array(items))
    });
    host.define_native(array, "sort", |vm, call| {
        let mut items = array_recv(vm, &call)?;
        let mut failure = None;
        items.sort_by(|a, b| {
            if failure.is_some() {
                return Ordering::Equal;
            }
            let ord = match call.block {
                Some(block) => vm
                    .call_block(block, vec![a.clone(), b.clone()])
                    .and_then(|v| match v {
                        Value::Fixnum(n) => Ok(n.cmp(&0)),
                        _ => Err(vm.raise("ArgumentError", "comparison failed")),
                    }),
                None => compare_values(vm, a, b),
            };
            ord.unwrap_or_else(|err| {
                failure = Some(err);
                Ordering::Equal
            })
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(Value::array(items)),
        }
    });
    for (name, want) in [("min", Ordering::Less), ("max", Ordering::Greater)] {
        host.define_native(array, name, move |vm, call| {
            let mut best: Option<Value> = None;
            for item in array_recv(vm, &call)? {
                best = match best {
                    Some(current) if compare_values(vm, &item, &current)? != want => Some(current),
                    _ => Some(item),
                };
            }
            Ok(best.unwrap_or(Value::Nil))
        });
    }
    host.define_native(array, "+", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let mut items = array_recv(vm, &call)?;
        items.extend(array_arg(vm, &call.args[0])?);
        Ok(Value::array(items))
    });
    host.define_native(array, "-", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let remove = array_arg(vm, &call.args[0])?;
        let mut out = Vec::new();
        'items: for item in array_recv(vm, &call)? {
            for r in &remove {
                if values_eq(vm, &item, r)? {
                    continue 'items;
                }
            }
            out.push(item);
        }
        Ok(Value::array(out))
    });
    host.define_native(array, "*", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let items = array_recv(vm, &call)?;
        if let Value::Str(_) = &call.args[0] {
            return vm.call_method(call.recv.clone(), "join", call.args.to_vec(), None);
        }
        let n = int_arg(vm, &call.args[0])?;
        if n < 0 {
            return Err(vm.raise("ArgumentError", "negative argument"));
        }
        if (n as usize).saturating_mul(items.len()) > MAX_REPEAT {
            return Err(vm.raise("ArgumentError", "argument too big"));
        }
        Ok(Value::array(std::iter::repeat(items.iter().cloned()).take(n as usize).flatten().collect()))
    });
    host.define_native(array, "concat", |vm, call| {
        let mut more = Vec::new();
        for other in call.args {
            more.extend(array_arg(vm, other)?);
        }
        with_array(vm, &call, |items| items.extend(more))?;
        Ok(call.recv.clone())
    });
    host.define_native(array, "compact", |vm, call| {
        Ok(Value::array(array_recv(vm, &call)?.into_iter().filter(|v| !v.is_nil()).collect()))
    });
    host.define_native(array, "flatten", |vm, call| {
        fn flatten(items: Vec<Value>, out: &mut Vec<Value>, depth: usize) {
            for item in items {
                match item {
                    Value::Array(inner) if depth < 64 => {
                        let inner = inner.lock().clone();
                        flatten(inner, out, depth + 1)
                    }
                    other => out.push(other),
                }
            }
        }
        let mut out = Vec::new();
        flatten(array_recv(vm, &call)?, &mut out, 0);
        Ok(Value::array(out))
    });
    host.define_native(array, "uniq", |vm, call| {
        let mut seen = std::collections::HashSet::new();
        let out = array_recv(vm, &call)?
            .into_iter()
            .filter(|v| seen.insert(v.hash_key(false)))
            .collect();
        Ok(Value::array(out))
    });
    host.define_native(array, "==", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        Ok(Value::bool(values_eq(vm, call.recv, &call.args[0])?))
    });
    host.define_native(array, "to_a", |_, call| Ok(call.recv.clone()));
    host.define_native(array, "dup", |vm, call| Ok(Value::array(array_recv(vm, &call)?)));
    for name in ["inspect", "to_s"] {
        host.define_native(array, name, |vm, call| {
            let mut out = String::from("[");
            for (i, item) in array_recv(vm, &call)?.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&inspect_value(vm, item)?);
            }
            out.push(']');
            Ok(Value::str(out))
        });
    }
}

// ======================================================================
// Hash
// ======================================================================

fn hash_recv(vm: &Vm, call: &NativeCall<'_>) -> Result<RHash, VmError> {
    match call.recv {
        Value::Hash(hash) => Ok(hash.lock().clone()),
        _ => Err(vm.type_error("hash receiver expected")),
    }
}

fn pair(key: &Value, value: &Value) -> Value {
    Value::array(vec![key.clone(), value.clone()])
}

fn install_hash(host: &Arc<ReferenceHost>) {
    let hash_class = host.core().hash;

    host.define_native(hash_class, "[]", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        Ok(hash_recv(vm, &call)?.get(&call.args[0]).unwrap_or(Value::Nil))
    });
    for name in ["[]=", "store"] {
        host.define_native(hash_class, name, |vm, call| {
            check_arity(vm, &call, 2, 2)?;
            let Value::Hash(hash) = call.recv else {
                return Err(vm.type_error("hash receiver expected"));
            };
            hash.lock().insert(call.args[0].clone(), call.args[1].clone());
            Ok(call.args[1].clone())
        });
    }
    host.define_native(hash_class, "fetch", |vm, call| {
        check_arity(vm, &call, 1, 2)?;
        match hash_recv(vm, &call)?.get(&call.args[0]) {
            Some(value) => Ok(value),
            None => match (call.args.get(1), call.block) {
                (_, Some(block)) => vm.call_block(block, vec![call.args[0].clone()]),
                (Some(default), None) => Ok(default.clone()),
                (None, None) => {
                    let key = inspect_value(vm, &call.args[0])?;
                    Err(vm.raise("KeyError", format!("key not found: {}", key)))
                }
            },
        }
    });
    for name in ["key?", "has_key?", "include?", "member?"] {
        host.define_native(hash_class, name, |vm, call| {
            check_arity(vm, &call, 1, 1)?;
            Ok(Value::bool(hash_recv(vm, &call)?.get(&call.args[0]).is_some()))
        });
    }
    host.define_native(hash_class, "delete", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let Value::Hash(hash) = call.recv else {
            return Err(vm.type_error("hash receiver expected"));
        };
        let mut guard = hash.lock();
        let removed = guard.get(&call.args[0]);
        if removed.is_some() {
            // rebuild without the key, keeping insertion order
            let identity = guard.compare_by_identity();
            let key = call.args[0].hash_key(identity);
            let mut rebuilt = RHash::new();
            if identity {
                rebuilt.set_compare_by_identity();
            }
            for (k, v) in guard.iter() {
                if k.hash_key(identity) != key {
                    rebuilt.insert(k.clone(), v.clone());
                }
            }
            *guard = rebuilt;
        }
        Ok(removed.unwrap_or(Value::Nil))
    });
    for name in ["length", "size"] {
        host.define_native(hash_class, name, |vm, call| Ok(Value::int(hash_recv(vm, &call)?.len() as i64)));
    }
    host.define_native(hash_class, "empty?", |vm, call| Ok(Value::bool(hash_recv(vm, &call)?.is_empty())));
    host.define_native(hash_class, "keys", |vm, call| Ok(Value::array(hash_recv(vm, &call)?.keys())));
    host.define_native(hash_class, "values", |vm, call| Ok(Value::array(hash_recv(vm, &call)?.values())));
    host.define_native(hash_class, "to_a", |vm, call| {
        let pairs = hash_recv(vm, &call)?.iter().map(|(k, v)| pair(k, v)).collect();
        Ok(Value::array(pairs))
    });
    for name in ["each", "each_pair"] {
        host.define_native(hash_class, name, |vm, call| {
            let block = need_block(vm, &call)?;
            let entries: Vec<_> = hash_recv(vm, &call)?.iter().cloned().collect();
            for (key, value) in entries {
                vm.call_block(block, vec![pair(&key, &value)])?;
            }
            Ok(call.recv.clone())
        });
    }
    host.define_native(hash_class, "map", |vm, call| {
        let block = need_block(vm, &call)?;
        let pairs: Vec<_> = hash_recv(vm, &call)?.iter().map(|(k, v)| pair(k, v)).collect();
        Ok(Value::array(map_block(vm, block, &pairs)?))
    });
    host.define_native(hash_class, "merge", |vm, call| {
        let mut merged = hash_recv(vm, &call)?;
        for other in call.args {
            let Value::Hash(other) = other else {
                return Err(vm.type_error("no implicit conversion into Hash"));
            };
            let entries: Vec<_> = other.lock().iter().cloned().collect();
            for (key, value) in entries {
                merged.insert(key, value);
            }
        }
        Ok(Value::hash(merged))
    });
    host.define_native(hash_class, "compare_by_identity", |vm, call| {
        let Value::Hash(hash) = call.recv else {
            return Err(vm.type_error("hash receiver expected"));
        };
        hash.lock().set_compare_by_identity();
        Ok(call.recv.clone())
    });
    host.define_native(hash_class, "==", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        Ok(Value::bool(values_eq(vm, call.recv, &call.args[0])?))
    });
    for name in ["inspect", "to_s"] {
        host.define_native(hash_class, name, |vm, call| {
            let entries: Vec<_> = hash_recv(vm, &call)?.iter().cloned().collect();
            if entries.is_empty() {
                return Ok(Value::str("{}"));
            }
            let mut out = String::from("{");
            for (i, (key, value)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match key {
                    Value::Symbol(sym) if is_plain_identifier(sym.as_str()) => {
                        out.push_str(sym.as_str());
                        out.push_str(": ");
                    }
                    _ => {
                        out.push_str(&inspect_value(vm, key)?);
                        out.push_str(" => ");
                    }
                }
                out.push_str(&inspect_value(vm, value)?);
            }
            out.push('}');
            Ok(Value::str(out))
        });
    }
}

// ======================================================================
// Range
// ======================================================================

/// Integer bounds of a range, end inclusive.
fn int_bounds(vm: &Vm, recv: &Value) -> Result<(i64, i64), VmError> {
    let Value::Range(range) = recv else {
        return Err(vm.type_error("range receiver expected"));
    };
    match (&range.low, &range.high) {
        (Value::Fixnum(low), Value::Fixnum(high)) => {
            Ok((*low, if range.exclude_end { high - 1 } else { *high }))
        }
        _ => Err(vm.type_error("can't iterate from non-integer range")),
    }
}

fn install_range(host: &Arc<ReferenceHost>) {
    let range = host.core().range;

    for name in ["first", "begin", "min"] {
        host.define_native(range, name, |vm, call| match call.recv {
            Value::Range(r) => Ok(r.low.clone()),
            _ => Err(vm.type_error("range receiver expected")),
        });
    }
    for name in ["last", "end"] {
        host.define_native(range, name, |vm, call| match call.recv {
            Value::Range(r) => Ok(r.high.clone()),
            _ => Err(vm.type_error("range receiver expected")),
        });
    }
    host.define_native(range, "exclude_end?", |vm, call| match call.recv {
        Value::Range(r) => Ok(Value::bool(r.exclude_end)),
        _ => Err(vm.type_error("range receiver expected")),
    });
    host.define_native(range, "each", |vm, call| {
        let block = need_block(vm, &call)?;
        let (low, high) = int_bounds(vm, call.recv)?;
        for i in low..=high {
            vm.call_block(block, vec![Value::int(i)])?;
        }
        Ok(call.recv.clone())
    });
    host.define_native(range, "map", |vm, call| {
        let block = need_block(vm, &call)?;
        let (low, high) = int_bounds(vm, call.recv)?;
        let items: Vec<Value> = (low..=high).map(Value::int).collect();
        Ok(Value::array(map_block(vm, block, &items)?))
    });
    host.define_native(range, "to_a", |vm, call| {
        let (low, high) = int_bounds(vm, call.recv)?;
        if high.saturating_sub(low) >= MAX_REPEAT as i64 {
            return Err(vm.raise("RangeError", "range too large"));
        }
        Ok(Value::array((low..=high).map(Value::int).collect()))
    });
    for name in ["size", "count"] {
        host.define_native(range, name, |vm, call| {
            let (low, high) = int_bounds(vm, call.recv)?;
            Ok(Value::int((high - low + 1).max(0)))
        });
    }
    for name in ["include?", "member?", "==="] {
        host.define_native(range, name, |vm, call| {
            check_arity(vm, &call, 1, 1)?;
            let Value::Range(r) = call.recv else {
                return Err(vm.type_error("range receiver expected"));
            };
            let value = &call.args[0];
            let above = matches!(
                compare_or_none(vm, &r.low, value)?,
                Some(Ordering::Less | Ordering::Equal)
            );
            let below = match compare_or_none(vm, value, &r.high)? {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => !r.exclude_end,
                _ => false,
            };
            Ok(Value::bool(above && below))
        });
    }
    for (name, inspect) in [("inspect", true), ("to_s", false)] {
        host.define_native(range, name, move |vm, call| {
            let Value::Range(r) = call.recv else {
                return Err(vm.type_error("range receiver expected"));
            };
            let dots = if r.exclude_end { "..." } else { ".." };
            let (low, high) = if inspect {
                (inspect_value(vm, &r.low)?, inspect_value(vm, &r.high)?)
            } else {
                (to_s(vm, &r.low)?, to_s(vm, &r.high)?)
            };
            Ok(Value::str(format!("{}{}{}", low, dots, high)))
        });
    }
}

/// `<=>` that yields `None` for incomparable values instead of raising.
fn compare_or_none(vm: &mut Vm, a: &Value, b: &Value) -> Result<Option<Ordering>, VmError> {
    if let Some(ord) = core_cmp(a, b) {
        return Ok(Some(ord));
    }
    if a.core_kind().is_some() && b.core_kind().is_some() {
        return Ok(None);
    }
    Ok(match vm.call_method(a.clone(), "<=>", vec![b.clone()], None)? {
        Value::Fixnum(n) => Some(n.cmp(&0)),
        _ => None,
    })
}
