//! `inspect` and `to_s` renderings of core values

use super::ReferenceHost;
use crate::object::ObjectModel;
use crate::value::{Symbol, Value};

/// Nesting beyond which containers print as `[...]` / `{...}`
const MAX_DEPTH: usize = 64;

pub(super) fn inspect(host: &ReferenceHost, value: &Value) -> String {
    let mut out = String::new();
    write_inspect(host, value, 0, &mut out);
    out
}

fn write_inspect(host: &ReferenceHost, value: &Value, depth: usize, out: &mut String) {
    match value {
        Value::Str(s) => out.push_str(&inspect_str(&s.lock())),
        Value::Symbol(sym) => out.push_str(&inspect_symbol(sym)),
        Value::Nil => out.push_str("nil"),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                out.push_str("[...]");
                return;
            }
            let items = items.lock().clone();
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_inspect(host, item, depth + 1, out);
            }
            out.push(']');
        }
        Value::Hash(hash) => {
            if depth >= MAX_DEPTH {
                out.push_str("{...}");
                return;
            }
            let entries: Vec<_> = hash.lock().iter().cloned().collect();
            if entries.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push('{');
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
                        write_inspect(host, key, depth + 1, out);
                        out.push_str(" => ");
                    }
                }
                write_inspect(host, value, depth + 1, out);
            }
            out.push('}');
        }
        Value::Range(range) => {
            write_inspect(host, &range.low, depth + 1, out);
            out.push_str(if range.exclude_end { "..." } else { ".." });
            write_inspect(host, &range.high, depth + 1, out);
        }
        Value::Object(obj) => {
            let class = host.class_name(obj.class);
            if host.is_exception(value) {
                let message = host.exception_message(value);
                if message.is_empty() || message == class {
                    out.push_str(&class);
                } else {
                    out.push_str(&format!("#<{}: {}>", class, message));
                }
                return;
            }
            out.push_str("#<");
            out.push_str(&class);
            let ivars = host.ivars_of(obj);
            for (i, (name, ivar)) in ivars.iter().enumerate() {
                out.push_str(if i == 0 { " " } else { ", " });
                out.push_str(name.as_str());
                out.push('=');
                if depth >= MAX_DEPTH {
                    out.push_str("...");
                } else {
                    write_inspect(host, ivar, depth + 1, out);
                }
            }
            out.push('>');
        }
        Value::Proc(proc) => {
            out.push_str(&format!("#<Proc:{}", proc.block.routine.name));
            if proc.lambda {
                out.push_str(" (lambda)");
            }
            out.push('>');
        }
        other => out.push_str(&to_s(host, other)),
    }
}

/// `to_s` of values whose rendering needs no method dispatch.
pub(super) fn to_s(host: &dyn ObjectModel, value: &Value) -> String {
    match value {
        Value::Nil => String::new(),
        Value::True => "true".to_string(),
        Value::False => "false".to_string(),
        Value::Fixnum(n) => n.to_string(),
        Value::Bignum(n) => n.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Symbol(sym) => sym.to_string(),
        Value::Str(s) => s.lock().clone(),
        Value::Class(class) => host.class_name(*class),
        other => host.inspect(other),
    }
}

/// Shortest round-tripping decimal, always with a fractional part or an
/// exponent.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{:e}", f);
        let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
        let mantissa = if mantissa.contains('.') {
            mantissa.to_string()
        } else {
            format!("{}.0", mantissa)
        };
        let exp = exp.parse::<i32>().unwrap_or(0);
        return format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs());
    }
    let text = f.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

pub(crate) fn inspect_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{1b}' => out.push_str("\\e"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\x{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

const OPERATOR_SYMBOLS: &[&str] = &[
    "+", "-", "*", "/", "%", "**", "==", "!=", "<", "<=", ">", ">=", "<=>", "===", "<<", ">>", "&",
    "|", "^", "!", "~", "[]", "[]=", "+@", "-@", "=~",
];

pub(crate) fn inspect_symbol(sym: &Symbol) -> String {
    let name = sym.as_str();
    let plain = OPERATOR_SYMBOLS.contains(&name)
        || name
            .strip_suffix(['?', '!', '='])
            .map_or(is_plain_identifier(name), is_plain_identifier)
        || name
            .strip_prefix("@@")
            .or_else(|| name.strip_prefix(['@', '$']))
            .map_or(false, is_plain_identifier);
    if plain {
        format!(":{}", name)
    } else {
        format!(":{}", inspect_str(name))
    }
}

pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RHash;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(1.0, "1.0")]
    #[case(-2.5, "-2.5")]
    #[case(0.1, "0.1")]
    #[case(1e20, "1.0e+20")]
    #[case(1.5e-7, "1.5e-07")]
    #[case(f64::INFINITY, "Infinity")]
    #[case(f64::NAN, "NaN")]
    fn test_format_float(#[case] f: f64, #[case] expected: &str) {
        assert_eq!(format_float(f), expected);
    }

    #[rstest]
    #[case("foo", ":foo")]
    #[case("empty?", ":empty?")]
    #[case("+", ":+")]
    #[case("@ivar", ":@ivar")]
    #[case("two words", ":\"two words\"")]
    fn test_inspect_symbol(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(inspect_symbol(&Symbol::new(name)), expected);
    }

    #[test]
    fn test_inspect_escapes_strings() {
        assert_eq!(inspect_str("a\"b\\c\n"), r#""a\"b\\c\n""#);
    }

    #[test]
    fn test_inspect_containers() {
        let host = ReferenceHost::new();
        let mut hash = RHash::new();
        hash.insert(Value::sym("a"), Value::int(1));
        hash.insert(Value::str("b"), Value::array(vec![Value::Nil, Value::Float(2.0)]));
        assert_eq!(inspect(&host, &Value::hash(hash)), r#"{a: 1, "b" => [nil, 2.0]}"#);
        assert_eq!(
            inspect(&host, &Value::range(Value::int(1), Value::int(5), true)),
            "1...5"
        );
    }
}
