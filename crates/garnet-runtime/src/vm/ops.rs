//! Inlined operator fast paths
//!
//! The pure functions compute an operator for operand kinds the loop
//! handles itself; `None` means "not handled here" and sends the
//! instruction to full method dispatch. The `Vm` methods below pick the
//! fast path by the instruction's current variant and rewrite or deopt
//! it as needed.

use super::frame::{BranchOnReturn, ReturnTo};
use super::{Step, Vm, VmError};
use crate::object::BasicOp;
use crate::rtl::{BinOp, Operand, Routine, Slot, UnaryOp, Variant, VariantCell};
use crate::value::{CoreKind, Value};
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use std::sync::Arc;

// ============================================================================
// Numeric tower
// ============================================================================

/// Fixnum arithmetic and comparison. Overflow promotes to a bignum;
/// a zero divisor is left to full dispatch.
pub(crate) fn fixnum_binary(op: BinOp, a: i64, b: i64) -> Option<Value> {
    let (wa, wb) = (a as i128, b as i128);
    Some(match op {
        BinOp::Plus => Value::int_wide(wa + wb),
        BinOp::Minus => Value::int_wide(wa - wb),
        BinOp::Mult => Value::int_wide(wa * wb),
        BinOp::Div if b == 0 => return None,
        BinOp::Div => Value::int_wide(Integer::div_floor(&wa, &wb)),
        BinOp::Mod if b == 0 => return None,
        BinOp::Mod => Value::int_wide(Integer::mod_floor(&wa, &wb)),
        BinOp::Or => Value::Fixnum(a | b),
        BinOp::And => Value::Fixnum(a & b),
        BinOp::Eq => Value::bool(a == b),
        BinOp::Ne => Value::bool(a != b),
        BinOp::Lt => Value::bool(a < b),
        BinOp::Gt => Value::bool(a > b),
        BinOp::Le => Value::bool(a <= b),
        BinOp::Ge => Value::bool(a >= b),
        BinOp::Ltlt => return None,
    })
}

/// Float modulo with the sign of the divisor.
pub(crate) fn float_mod(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return f64::NAN;
    }
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// Float arithmetic and comparison; `0.0 == -0.0`.
pub(crate) fn float_binary(op: BinOp, a: f64, b: f64) -> Option<Value> {
    Some(match op {
        BinOp::Plus => Value::Float(a + b),
        BinOp::Minus => Value::Float(a - b),
        BinOp::Mult => Value::Float(a * b),
        BinOp::Div => Value::Float(a / b),
        BinOp::Mod => Value::Float(float_mod(a, b)),
        BinOp::Eq => Value::bool(a == b),
        BinOp::Ne => Value::bool(a != b),
        BinOp::Lt => Value::bool(a < b),
        BinOp::Gt => Value::bool(a > b),
        BinOp::Le => Value::bool(a <= b),
        BinOp::Ge => Value::bool(a >= b),
        BinOp::Or | BinOp::And | BinOp::Ltlt => return None,
    })
}

/// Exact `int == float`; converting the fixnum would round above 2**53.
fn fixnum_float_eq(x: i64, y: f64) -> bool {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    y.fract() == 0.0 && (-LIMIT..LIMIT).contains(&y) && y as i64 == x
}

/// Equality of values whose `==` the loop knows, `None` otherwise.
pub(crate) fn fast_eq(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Fixnum(x), Value::Fixnum(y)) => Some(x == y),
        (Value::Float(x), Value::Float(y)) => Some(x == y),
        (Value::Fixnum(x), Value::Float(y)) | (Value::Float(y), Value::Fixnum(x)) => {
            Some(fixnum_float_eq(*x, *y))
        }
        (Value::Bignum(x), Value::Bignum(y)) => Some(x == y),
        (Value::Bignum(_), Value::Fixnum(_)) | (Value::Fixnum(_), Value::Bignum(_)) => Some(false),
        (Value::Bignum(x), Value::Float(y)) | (Value::Float(y), Value::Bignum(x)) => {
            Some(y.fract() == 0.0 && BigInt::from_f64(*y).map_or(false, |y| y == **x))
        }
        (Value::Str(x), Value::Str(y)) => {
            if Arc::ptr_eq(x, y) {
                return Some(true);
            }
            let x = x.lock().clone();
            Some(*y.lock() == x)
        }
        (Value::Symbol(x), Value::Symbol(y)) => Some(x == y),
        (Value::Nil | Value::True | Value::False, _) | (_, Value::Nil | Value::True | Value::False) => {
            Some(a.same(b))
        }
        (Value::Class(x), Value::Class(y)) => Some(x == y),
        _ => {
            let (ka, kb) = (a.core_kind()?, b.core_kind()?);
            let numeric = |k| matches!(k, CoreKind::Integer | CoreKind::Float);
            if ka == kb || (numeric(ka) && numeric(kb)) {
                None
            } else {
                Some(false)
            }
        }
    }
}

/// String and array fast paths of the generic binary forms.
fn container_binary(op: BinOp, a: &Value, b: &Value) -> Option<Value> {
    match (op, a, b) {
        (BinOp::Plus, Value::Str(x), Value::Str(y)) => {
            let mut out = x.lock().clone();
            out.push_str(&y.lock());
            Some(Value::str(out))
        }
        (BinOp::Plus, Value::Array(x), Value::Array(y)) => {
            let mut out = x.lock().clone();
            out.extend(y.lock().iter().cloned());
            Some(Value::array(out))
        }
        (BinOp::Eq | BinOp::Ne, Value::Str(_), Value::Str(_)) => {
            let eq = fast_eq(a, b)?;
            Some(Value::bool(if op == BinOp::Eq { eq } else { !eq }))
        }
        (BinOp::Ltlt, Value::Str(x), Value::Str(y)) => {
            let tail = y.lock().clone();
            x.lock().push_str(&tail);
            Some(a.clone())
        }
        (BinOp::Ltlt, Value::Array(x), _) => {
            x.lock().push(b.clone());
            Some(a.clone())
        }
        _ => None,
    }
}

/// Normalize an index against a length (negative counts from the end).
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    if idx >= 0 {
        Some(idx as usize)
    } else {
        let back = idx.unsigned_abs() as usize;
        len.checked_sub(back)
    }
}

pub(crate) fn array_get(items: &Mutex<Vec<Value>>, idx: i64) -> Value {
    let items = items.lock();
    resolve_index(idx, items.len())
        .and_then(|i| items.get(i).cloned())
        .unwrap_or(Value::Nil)
}

/// `None` when the index falls before the start of the array.
pub(crate) fn array_set(items: &Mutex<Vec<Value>>, idx: i64, value: Value) -> Option<()> {
    let mut items = items.lock();
    let i = resolve_index(idx, items.len())?;
    if i >= items.len() {
        items.resize(i + 1, Value::Nil);
    }
    items[i] = value;
    Some(())
}

/// Unary operators on core kinds.
fn unary_fast(op: UnaryOp, v: &Value) -> Option<Value> {
    match (op, v) {
        (UnaryOp::Length | UnaryOp::Size, Value::Str(s)) => {
            Some(Value::int(s.lock().chars().count() as i64))
        }
        (UnaryOp::Length | UnaryOp::Size, Value::Array(a)) => Some(Value::int(a.lock().len() as i64)),
        (UnaryOp::Length | UnaryOp::Size, Value::Hash(h)) => Some(Value::int(h.lock().len() as i64)),
        (UnaryOp::EmptyP, Value::Str(s)) => Some(Value::bool(s.lock().is_empty())),
        (UnaryOp::EmptyP, Value::Array(a)) => Some(Value::bool(a.lock().is_empty())),
        (UnaryOp::EmptyP, Value::Hash(h)) => Some(Value::bool(h.lock().is_empty())),
        (UnaryOp::Succ, Value::Fixnum(n)) => Some(Value::int_wide(*n as i128 + 1)),
        (UnaryOp::Not, _) => Some(Value::bool(!v.truthy())),
        _ => None,
    }
}

// ============================================================================
// Variant handlers
// ============================================================================

/// Where a binary result goes
#[derive(Debug, Clone, Copy)]
pub(crate) struct BinaryTarget {
    pub dst: u32,
    /// Set for compare-and-branch
    pub branch: Option<BranchOnReturn>,
}

impl Vm {
    #[inline]
    fn unredefined(&self, op: BasicOp, kind: CoreKind) -> bool {
        self.globals.unredefined(op, kind)
    }

    pub(crate) fn read(&self, slot: Slot) -> Value {
        match slot {
            Slot::Temp(t) => self.stack.temp(t),
            Slot::Local(l) => self.stack.local(l),
        }
    }

    pub(crate) fn operand(&self, operand: &Operand) -> Value {
        match operand {
            Operand::Slot(slot) => self.read(*slot),
            Operand::Imm(lit) => lit.to_value(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn exec_binary(
        &mut self,
        routine: &Routine,
        pc: usize,
        op: BinOp,
        lhs: Slot,
        rhs: &Operand,
        cd: u32,
        cell: &VariantCell,
        target: BinaryTarget,
    ) -> Result<Step, VmError> {
        let a = self.read(lhs);
        let b = self.operand(rhs);
        let basic = op.basic_op();

        let result = match cell.get() {
            Variant::Fixnum => match (&a, &b) {
                (Value::Fixnum(x), Value::Fixnum(y)) if self.unredefined(basic, CoreKind::Integer) => {
                    fixnum_binary(op, *x, *y)
                }
                _ => return Ok(Step::Deopt(Variant::Unchanging)),
            },
            Variant::Flonum => match (&a, &b) {
                (Value::Float(x), Value::Float(y)) if self.unredefined(basic, CoreKind::Float) => {
                    float_binary(op, *x, *y)
                }
                _ => return Ok(Step::Deopt(Variant::Unchanging)),
            },
            variant => match (&a, &b) {
                (Value::Fixnum(x), Value::Fixnum(y)) if self.unredefined(basic, CoreKind::Integer) => {
                    let result = fixnum_binary(op, *x, *y);
                    if result.is_some() && variant == Variant::Generic && op.specializes_fixnum() {
                        self.rewrite(routine, pc, cell, Variant::Fixnum);
                    }
                    result
                }
                (Value::Float(x), Value::Float(y)) if self.unredefined(basic, CoreKind::Float) => {
                    let result = float_binary(op, *x, *y);
                    if result.is_some() && variant == Variant::Generic && op.specializes_flonum() {
                        self.rewrite(routine, pc, cell, Variant::Flonum);
                    }
                    result
                }
                _ => match a.core_kind() {
                    Some(kind) if self.unredefined(basic, kind) => container_binary(op, &a, &b),
                    _ => None,
                },
            },
        };

        match result {
            Some(value) => {
                let truth = value.truthy();
                self.stack.set_temp(target.dst, value);
                Ok(match target.branch {
                    Some(branch) if truth == branch.when => Step::Goto(branch.target),
                    _ => Step::Next,
                })
            }
            None => {
                let ret = ReturnTo {
                    pc: pc + 1,
                    slot: Some(target.dst),
                    branch: target.branch,
                    once: None,
                };
                self.call_operator(routine, cd, a, vec![b], ret)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn exec_index(
        &mut self,
        routine: &Routine,
        pc: usize,
        dst: u32,
        recv: Slot,
        key: &Operand,
        cd: u32,
        cell: &VariantCell,
    ) -> Result<Step, VmError> {
        let r = self.read(recv);
        let k = self.operand(key);
        let variant = cell.get();

        let result = match (&r, k.as_fixnum()) {
            (Value::Array(items), Some(idx))
                if self.unredefined(BasicOp::Aref, CoreKind::Array)
                    && matches!(variant, Variant::Generic | Variant::Array | Variant::Unchanging) =>
            {
                if variant == Variant::Generic {
                    self.rewrite(routine, pc, cell, Variant::Array);
                }
                Some(array_get(items, idx))
            }
            (Value::Hash(hash), _)
                if self.unredefined(BasicOp::Aref, CoreKind::Hash)
                    && matches!(variant, Variant::Generic | Variant::Hash | Variant::Unchanging) =>
            {
                if variant == Variant::Generic {
                    self.rewrite(routine, pc, cell, Variant::Hash);
                }
                Some(hash.lock().get(&k).unwrap_or(Value::Nil))
            }
            _ if variant.is_speculative() => return Ok(Step::Deopt(Variant::Unchanging)),
            _ => None,
        };

        match result {
            Some(value) => {
                self.stack.set_temp(dst, value);
                Ok(Step::Next)
            }
            None => {
                let ret = ReturnTo {
                    pc: pc + 1,
                    slot: Some(dst),
                    ..Default::default()
                };
                self.call_operator(routine, cd, r, vec![k], ret)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn exec_index_set(
        &mut self,
        routine: &Routine,
        pc: usize,
        dst: u32,
        recv: Slot,
        key: &Operand,
        value: Slot,
        cd: u32,
        cell: &VariantCell,
    ) -> Result<Step, VmError> {
        let r = self.read(recv);
        let k = self.operand(key);
        let v = self.read(value);
        let variant = cell.get();

        let done = match (&r, k.as_fixnum()) {
            (Value::Array(items), Some(idx))
                if self.unredefined(BasicOp::Aset, CoreKind::Array)
                    && matches!(variant, Variant::Generic | Variant::Array | Variant::Unchanging) =>
            {
                let stored = array_set(items, idx, v.clone()).is_some();
                if stored && variant == Variant::Generic {
                    self.rewrite(routine, pc, cell, Variant::Array);
                }
                stored
            }
            (Value::Hash(hash), _)
                if self.unredefined(BasicOp::Aset, CoreKind::Hash)
                    && matches!(variant, Variant::Generic | Variant::Hash | Variant::Unchanging) =>
            {
                hash.lock().insert(k.clone(), v.clone());
                if variant == Variant::Generic {
                    self.rewrite(routine, pc, cell, Variant::Hash);
                }
                true
            }
            _ if variant.is_speculative() => return Ok(Step::Deopt(Variant::Unchanging)),
            _ => false,
        };

        if done {
            self.stack.set_temp(dst, v);
            return Ok(Step::Next);
        }
        let ret = ReturnTo {
            pc: pc + 1,
            slot: Some(dst),
            ..Default::default()
        };
        self.call_operator(routine, cd, r, vec![k, v], ret)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn exec_unary(
        &mut self,
        routine: &Routine,
        pc: usize,
        op: UnaryOp,
        dst: u32,
        src: Slot,
        cd: u32,
        cell: &VariantCell,
    ) -> Result<Step, VmError> {
        let v = self.read(src);
        let variant = cell.get();

        // `snot` only re-checks that `!` is still the builtin
        if variant == Variant::Builtin {
            return match v.core_kind() {
                Some(kind) if self.unredefined(BasicOp::Not, kind) => {
                    self.stack.set_temp(dst, Value::bool(!v.truthy()));
                    Ok(Step::Next)
                }
                _ => Ok(Step::Deopt(Variant::Unchanging)),
            };
        }

        let fast = match v.core_kind() {
            Some(kind) if self.unredefined(op.basic_op(), kind) => unary_fast(op, &v),
            _ => None,
        };
        if fast.is_some() && variant == Variant::Generic && op == UnaryOp::Not {
            self.rewrite(routine, pc, cell, Variant::Builtin);
        }
        match fast {
            Some(result) => {
                self.stack.set_temp(dst, result);
                Ok(Step::Next)
            }
            None => {
                let ret = ReturnTo {
                    pc: pc + 1,
                    slot: Some(dst),
                    ..Default::default()
                };
                self.call_operator(routine, cd, v, Vec::new(), ret)
            }
        }
    }

    /// `pattern === target`, inlined for core kinds.
    pub(crate) fn case_eq(&mut self, pattern: &Value, target: &Value) -> Result<bool, VmError> {
        if let Some(kind) = pattern.core_kind() {
            if self.unredefined(BasicOp::Eqq, kind) {
                if let Some(eq) = fast_eq(pattern, target) {
                    return Ok(eq);
                }
            }
        }
        let result = self.call_method(pattern.clone(), "===", vec![target.clone()], None)?;
        Ok(result.truthy())
    }
}
