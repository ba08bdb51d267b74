//! Integer and Float methods
//!
//! The dispatch loop inlines fixnum and flonum arithmetic; these natives
//! cover what it leaves out: bignums, mixed operands, zero divisors and
//! the methods without an instruction.

use super::inspect::format_float;
use super::{arg, check_arity, need_block, ReferenceHost};
use crate::object::NativeCall;
use crate::value::Value;
use crate::vm::{Vm, VmError};
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, Pow, Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::sync::Arc;

/// A numeric operand
#[derive(Debug, Clone)]
pub(crate) enum Num {
    Int(BigInt),
    Float(f64),
}

impl Num {
    pub(crate) fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Fixnum(n) => Some(Num::Int(BigInt::from(*n))),
            Value::Bignum(n) => Some(Num::Int((**n).clone())),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    fn to_f64(&self) -> f64 {
        match self {
            Num::Int(n) => n.to_f64().unwrap_or(f64::NAN),
            Num::Float(f) => *f,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// Why an arithmetic operation produced no value
enum ArithError {
    ZeroDivision,
    Type,
}

fn arith(op: Arith, a: Num, b: Num) -> Result<Value, ArithError> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_arith(op, x, y),
        (a, b) => Ok(Value::Float(float_arith(op, a.to_f64(), b.to_f64()))),
    }
}

fn int_arith(op: Arith, x: BigInt, y: BigInt) -> Result<Value, ArithError> {
    let value = match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div if y.is_zero() => return Err(ArithError::ZeroDivision),
        Arith::Div => x.div_floor(&y),
        Arith::Mod if y.is_zero() => return Err(ArithError::ZeroDivision),
        Arith::Mod => x.mod_floor(&y),
        Arith::Pow => {
            if y.is_negative() {
                let (x, y) = (x.to_f64().unwrap_or(f64::NAN), y.to_f64().unwrap_or(f64::NAN));
                return Ok(Value::Float(x.powf(y)));
            }
            let Some(exp) = y.to_u32() else {
                return Err(ArithError::Type);
            };
            Pow::pow(x, exp)
        }
    };
    Ok(Value::from_bigint(value))
}

fn float_arith(op: Arith, x: f64, y: f64) -> f64 {
    match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div => x / y,
        Arith::Mod => {
            if y == 0.0 {
                f64::NAN
            } else {
                let r = x % y;
                if r != 0.0 && (r < 0.0) != (y < 0.0) {
                    r + y
                } else {
                    r
                }
            }
        }
        Arith::Pow => x.powf(y),
    }
}

fn compare(a: &Num, b: &Num) -> Option<Ordering> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Some(x.cmp(y)),
        (Num::Int(x), Num::Float(y)) => compare_int_float(x, *y),
        (Num::Float(x), Num::Int(y)) => compare_int_float(y, *x).map(Ordering::reverse),
        (Num::Float(x), Num::Float(y)) => x.partial_cmp(y),
    }
}

fn compare_int_float(x: &BigInt, y: f64) -> Option<Ordering> {
    if y.is_nan() {
        return None;
    }
    if y.is_infinite() {
        return Some(if y > 0.0 { Ordering::Less } else { Ordering::Greater });
    }
    // Compare exactly when the float is integral
    if y.fract() == 0.0 {
        if let Some(y) = BigInt::from_f64(y) {
            return Some(x.cmp(&y));
        }
    }
    x.to_f64().and_then(|x| x.partial_cmp(&y))
}

/// Equality of core values without method dispatch.
pub(crate) fn core_eq(a: &Value, b: &Value) -> bool {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => compare(&x, &y) == Some(Ordering::Equal),
        (Some(_), None) | (None, Some(_)) => false,
        (None, None) => match (a, b) {
            (Value::Str(x), Value::Str(y)) => Arc::ptr_eq(x, y) || *x.lock() == *y.lock(),
            (Value::Range(x), Value::Range(y)) => {
                x.exclude_end == y.exclude_end && core_eq(&x.low, &y.low) && core_eq(&x.high, &y.high)
            }
            _ => a.same(b),
        },
    }
}

/// `<=>` of two core values, when they are comparable without dispatch.
pub(crate) fn core_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => compare(&x, &y),
        _ => match (a, b) {
            (Value::Str(x), Value::Str(y)) => {
                if Arc::ptr_eq(x, y) {
                    return Some(Ordering::Equal);
                }
                let (x, y) = (x.lock().clone(), y.lock().clone());
                Some(x.cmp(&y))
            }
            (Value::Symbol(x), Value::Symbol(y)) => Some(x.as_str().cmp(y.as_str())),
            _ => None,
        },
    }
}

pub(crate) fn ordering_value(ord: Option<Ordering>) -> Value {
    match ord {
        Some(Ordering::Less) => Value::int(-1),
        Some(Ordering::Equal) => Value::int(0),
        Some(Ordering::Greater) => Value::int(1),
        None => Value::Nil,
    }
}

fn operand(vm: &Vm, call: &NativeCall<'_>) -> Result<Num, VmError> {
    check_arity(vm, call, 1, 1)?;
    Num::of(&call.args[0]).ok_or_else(|| {
        let other = &call.args[0];
        let kind = match other {
            Value::Nil => "nil".to_string(),
            _ => vm.host().class_name(vm.host().class_of(other)),
        };
        let class = vm.host().class_name(vm.host().class_of(call.recv));
        vm.type_error(format!("{} can't be coerced into {}", kind, class))
    })
}

fn receiver(vm: &Vm, call: &NativeCall<'_>) -> Result<Num, VmError> {
    Num::of(call.recv).ok_or_else(|| vm.type_error("numeric receiver expected"))
}

fn define_arith(host: &ReferenceHost, name: &'static str, op: Arith) {
    let core = *host.core();
    for class in [core.integer, core.float] {
        host.define_native(class, name, move |vm, call| {
            let a = receiver(vm, &call)?;
            let b = operand(vm, &call)?;
            arith(op, a, b).map_err(|err| match err {
                ArithError::ZeroDivision => vm.raise("ZeroDivisionError", "divided by 0"),
                ArithError::Type => vm.raise("ArgumentError", "exponent too large"),
            })
        });
    }
}

fn define_compare(host: &ReferenceHost, name: &'static str, test: fn(Ordering) -> bool) {
    let core = *host.core();
    for class in [core.integer, core.float] {
        host.define_native(class, name, move |vm, call| {
            let a = receiver(vm, &call)?;
            let b = match Num::of(&arg(&call, 0)) {
                Some(b) => b,
                None => {
                    let other = arg(&call, 0);
                    let class = vm.host().class_name(vm.host().class_of(&other));
                    let recv = vm.host().class_name(vm.host().class_of(call.recv));
                    return Err(vm.raise(
                        "ArgumentError",
                        format!("comparison of {} with {} failed", recv, class),
                    ));
                }
            };
            Ok(Value::bool(compare(&a, &b).map_or(false, test)))
        });
    }
}

pub(super) fn install(host: &Arc<ReferenceHost>) {
    let core = *host.core();

    define_arith(host, "+", Arith::Add);
    define_arith(host, "-", Arith::Sub);
    define_arith(host, "*", Arith::Mul);
    define_arith(host, "/", Arith::Div);
    define_arith(host, "%", Arith::Mod);
    define_arith(host, "modulo", Arith::Mod);
    define_arith(host, "**", Arith::Pow);
    define_compare(host, "<", |o| o == Ordering::Less);
    define_compare(host, "<=", |o| o != Ordering::Greater);
    define_compare(host, ">", |o| o == Ordering::Greater);
    define_compare(host, ">=", |o| o != Ordering::Less);

    for class in [core.integer, core.float] {
        host.define_native(class, "==", |_, call| Ok(Value::bool(core_eq(call.recv, &arg(&call, 0)))));
        host.define_native(class, "!=", |_, call| Ok(Value::bool(!core_eq(call.recv, &arg(&call, 0)))));
        host.define_native(class, "<=>", |_, call| {
            Ok(ordering_value(core_cmp(call.recv, &arg(&call, 0))))
        });
        host.define_native(class, "-@", |vm, call| {
            let a = receiver(vm, &call)?;
            Ok(match a {
                Num::Int(n) => Value::from_bigint(-n),
                Num::Float(f) => Value::Float(-f),
            })
        });
        host.define_native(class, "abs", |vm, call| {
            Ok(match receiver(vm, &call)? {
                Num::Int(n) => Value::from_bigint(n.abs()),
                Num::Float(f) => Value::Float(f.abs()),
            })
        });
        host.define_native(class, "zero?", |vm, call| {
            Ok(Value::bool(match receiver(vm, &call)? {
                Num::Int(n) => n.is_zero(),
                Num::Float(f) => f == 0.0,
            }))
        });
        host.define_native(class, "to_f", |vm, call| {
            Ok(Value::Float(receiver(vm, &call)?.to_f64()))
        });
        host.define_native(class, "to_s", |vm, call| Ok(Value::str(number_to_s(&receiver(vm, &call)?))));
        host.define_native(class, "inspect", |vm, call| {
            Ok(Value::str(number_to_s(&receiver(vm, &call)?)))
        });
    }

    // Integer
    host.define_native(core.integer, "to_i", |_, call| Ok(call.recv.clone()));
    host.define_native(core.integer, "succ", |vm, call| {
        int_arith(Arith::Add, int_recv(vm, &call)?, BigInt::from(1))
            .map_err(|_| vm.raise("RangeError", "integer overflow"))
    });
    host.define_native(core.integer, "pred", |vm, call| {
        int_arith(Arith::Sub, int_recv(vm, &call)?, BigInt::from(1))
            .map_err(|_| vm.raise("RangeError", "integer overflow"))
    });
    host.define_native(core.integer, "even?", |vm, call| Ok(Value::bool(int_recv(vm, &call)?.is_even())));
    host.define_native(core.integer, "odd?", |vm, call| Ok(Value::bool(int_recv(vm, &call)?.is_odd())));
    host.define_native(core.integer, "<<", |vm, call| shift(vm, &call, 1));
    host.define_native(core.integer, ">>", |vm, call| shift(vm, &call, -1));
    host.define_native(core.integer, "&", |vm, call| {
        let (a, b) = int_pair(vm, &call)?;
        Ok(Value::from_bigint(a & b))
    });
    host.define_native(core.integer, "|", |vm, call| {
        let (a, b) = int_pair(vm, &call)?;
        Ok(Value::from_bigint(a | b))
    });
    host.define_native(core.integer, "^", |vm, call| {
        let (a, b) = int_pair(vm, &call)?;
        Ok(Value::from_bigint(a ^ b))
    });
    host.define_native(core.integer, "divmod", |vm, call| {
        let a = receiver(vm, &call)?;
        let b = operand(vm, &call)?;
        let zero = |_| vm.raise("ZeroDivisionError", "divided by 0");
        let q = arith(Arith::Div, a.clone(), b.clone()).map_err(zero)?;
        let r = arith(Arith::Mod, a, b).map_err(zero)?;
        let q = match q {
            Value::Float(f) => Value::Float(f.floor()),
            q => q,
        };
        Ok(Value::array(vec![q, r]))
    });
    host.define_native(core.integer, "times", |vm, call| {
        let block = need_block(vm, &call)?;
        let n = int_recv(vm, &call)?.to_i64().unwrap_or(i64::MAX);
        for i in 0..n.max(0) {
            vm.call_block(block, vec![Value::int(i)])?;
        }
        Ok(call.recv.clone())
    });
    host.define_native(core.integer, "upto", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let block = need_block(vm, &call)?;
        let (from, to) = int_pair(vm, &call)?;
        let (Some(from), Some(to)) = (from.to_i64(), to.to_i64()) else {
            return Err(vm.raise("RangeError", "bignum too big to iterate"));
        };
        for i in from..=to {
            vm.call_block(block, vec![Value::int(i)])?;
        }
        Ok(call.recv.clone())
    });

    // Float
    host.define_native(core.float, "to_i", |vm, call| float_to_int(vm, float_recv(vm, &call)?));
    host.define_native(core.float, "floor", |vm, call| {
        float_to_int(vm, float_recv(vm, &call)?.floor())
    });
    host.define_native(core.float, "ceil", |vm, call| float_to_int(vm, float_recv(vm, &call)?.ceil()));
    host.define_native(core.float, "round", |vm, call| {
        float_to_int(vm, float_recv(vm, &call)?.round())
    });
    host.define_native(core.float, "nan?", |vm, call| Ok(Value::bool(float_recv(vm, &call)?.is_nan())));
    host.define_native(core.float, "infinite?", |vm, call| {
        let f = float_recv(vm, &call)?;
        Ok(match f.is_infinite() {
            true if f > 0.0 => Value::int(1),
            true => Value::int(-1),
            false => Value::Nil,
        })
    });
}

fn number_to_s(n: &Num) -> String {
    match n {
        Num::Int(n) => n.to_string(),
        Num::Float(f) => format_float(*f),
    }
}

fn int_recv(vm: &Vm, call: &NativeCall<'_>) -> Result<BigInt, VmError> {
    match receiver(vm, call)? {
        Num::Int(n) => Ok(n),
        Num::Float(_) => Err(vm.type_error("integer receiver expected")),
    }
}

fn float_recv(vm: &Vm, call: &NativeCall<'_>) -> Result<f64, VmError> {
    match receiver(vm, call)? {
        Num::Float(f) => Ok(f),
        Num::Int(n) => Ok(n.to_f64().unwrap_or(f64::NAN)),
    }
}

fn int_pair(vm: &Vm, call: &NativeCall<'_>) -> Result<(BigInt, BigInt), VmError> {
    let a = int_recv(vm, call)?;
    match operand(vm, call)? {
        Num::Int(b) => Ok((a, b)),
        Num::Float(_) => Err(vm.type_error("Float can't be coerced into Integer")),
    }
}

fn shift(vm: &Vm, call: &NativeCall<'_>, direction: i64) -> Result<Value, VmError> {
    let (a, b) = int_pair(vm, call)?;
    let Some(bits) = b.to_i64().and_then(|b| b.checked_mul(direction)) else {
        return Err(vm.raise("RangeError", "shift width too big"));
    };
    let magnitude = bits.unsigned_abs();
    if bits >= 0 {
        if magnitude > 1 << 24 {
            return Err(vm.raise("RangeError", "shift width too big"));
        }
        Ok(Value::from_bigint(a << magnitude as usize))
    } else {
        // floor semantics for negative receivers
        let divisor = Pow::pow(BigInt::from(2), magnitude.min(u32::MAX as u64) as u32);
        Ok(Value::from_bigint(a.div_floor(&divisor)))
    }
}

fn float_to_int(vm: &Vm, f: f64) -> Result<Value, VmError> {
    if f.is_nan() {
        return Err(vm.raise("FloatDomainError", "NaN"));
    }
    if f.is_infinite() {
        let text = if f > 0.0 { "Infinity" } else { "-Infinity" };
        return Err(vm.raise("FloatDomainError", text));
    }
    match BigInt::from_f64(f.trunc()) {
        Some(n) => Ok(Value::from_bigint(n)),
        None => Err(vm.raise("FloatDomainError", format_float(f))),
    }
}
