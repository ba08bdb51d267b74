//! Instruction handlers
//!
//! One arm per register instruction. Operator instructions with
//! speculative forms live in `ops`, calls in `call`.

use super::frame::{BranchOnReturn, FrameKind, FrameSpec, ReturnTo};
use super::ops::BinaryTarget;
use super::profiler::CacheKind;
use super::{Step, Vm, VmError};
use crate::cache::{IvarCache, Lookup, Stamp};
use crate::iseq::EventFlags;
use crate::object::{BasicOp, DefinedKind, MethodBody};
use crate::rtl::{CaseTable, Insn, Operand, Routine, Slot};
use crate::value::{ClassId, RHash, Symbol, Value};
use std::sync::Arc;

impl Vm {
    pub(crate) fn exec(&mut self, routine: &Arc<Routine>, pc: usize, insn: &Insn) -> Result<Step, VmError> {
        match insn {
            Insn::Nop => Ok(Step::Next),

            // ===== Moves =====
            Insn::Temp2Temp { dst, src } => {
                let value = self.stack.temp(*src);
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::Loc2Loc { dst, src } => {
                let value = self.stack.local(*src);
                self.stack.set_local(*dst, value, self.host.as_ref());
                Ok(Step::Next)
            }
            Insn::Loc2Temp { dst, src } => {
                let value = self.stack.local(*src);
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::Temp2Loc { dst, src } => {
                let value = self.stack.temp(*src);
                self.stack.set_local(*dst, value, self.host.as_ref());
                Ok(Step::Next)
            }
            Insn::UpLoc2Temp { dst, idx, level } => {
                let value = self.stack.up_local(*idx, *level).ok_or_else(|| {
                    VmError::InvariantViolation(format!("no environment {} levels up", level))
                })?;
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::Var2UpLoc { idx, level, src } => {
                let value = self.read(*src);
                self.store_up_local(*idx, *level, value)
            }
            Insn::Val2UpLoc { idx, level, value } => self.store_up_local(*idx, *level, value.to_value()),
            Insn::Val2Loc { dst, value } => {
                self.stack.set_local(*dst, value.to_value(), self.host.as_ref());
                Ok(Step::Next)
            }
            Insn::Val2Temp { dst, value } => {
                self.stack.set_temp(*dst, value.to_value());
                Ok(Step::Next)
            }
            Insn::Str2Var { dst, text } => {
                self.write(*dst, Value::str(text.as_ref()));
                Ok(Step::Next)
            }
            Insn::Self2Var { dst } => {
                let value = self.frame()?.self_value.clone();
                self.write(*dst, value);
                Ok(Step::Next)
            }
            Insn::VarSwap { a, b } => {
                let (va, vb) = (self.stack.temp(*a), self.stack.temp(*b));
                self.stack.set_temp(*a, vb);
                self.stack.set_temp(*b, va);
                Ok(Step::Next)
            }
            Insn::TempReverse { start, count } => {
                self.stack.temps_mut(*start, *count).reverse();
                Ok(Step::Next)
            }

            // ===== Variables and constants =====
            Insn::Ivar2Var { dst, name, ic } => {
                let recv = self.frame()?.self_value.clone();
                let value = self.ivar_get(&recv, name, routine.ivar_caches.get(*ic as usize));
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::Var2Ivar { name, ic, src } => {
                let recv = self.frame()?.self_value.clone();
                let value = self.operand(src);
                self.ivar_set(&recv, name.clone(), value, routine.ivar_caches.get(*ic as usize))?;
                Ok(Step::Next)
            }
            Insn::Cvar2Var { dst, name } => {
                let cref = self.frame()?.cref;
                match self.host.get_cvar(cref, name) {
                    Some(value) => {
                        self.stack.set_temp(*dst, value);
                        Ok(Step::Next)
                    }
                    None => Err(self.raise(
                        "NameError",
                        format!(
                            "uninitialized class variable {} in {}",
                            name,
                            self.host.class_name(cref)
                        ),
                    )),
                }
            }
            Insn::Var2Cvar { name, src } => {
                let cref = self.frame()?.cref;
                let value = self.read(*src);
                self.host.set_cvar(cref, name.clone(), value);
                Ok(Step::Next)
            }
            Insn::Global2Var { dst, name } => {
                let value = self.host.get_global(name);
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::Var2Global { name, src } => {
                let value = self.read(*src);
                self.host.set_global(name.clone(), value);
                Ok(Step::Next)
            }
            Insn::ConstLoad { dst, base, name, ic } => {
                let value = match (*base).map(|slot| self.read(slot)) {
                    None | Some(Value::Nil) => self.lexical_const(routine, name, *ic)?,
                    Some(Value::Class(class)) => self.host.get_const_under(class, name).ok_or_else(|| {
                        self.raise(
                            "NameError",
                            format!("uninitialized constant {}::{}", self.host.class_name(class), name),
                        )
                    })?,
                    Some(other) => {
                        return Err(self.type_error(format!(
                            "{} is not a class/module",
                            self.host.inspect(&other)
                        )))
                    }
                };
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::ConstCachedLoad { dst, name, ic } => {
                let value = self.lexical_const(routine, name, *ic)?;
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::Var2Const { name, base, src } => {
                let scope = match self.read(*base) {
                    Value::Nil => self.frame()?.cref,
                    Value::Class(class) => class,
                    other => {
                        return Err(self.type_error(format!(
                            "{} is not a class/module",
                            self.host.inspect(&other)
                        )))
                    }
                };
                let value = self.read(*src);
                self.host.set_const(scope, name.clone(), value);
                Ok(Step::Next)
            }
            Insn::GetInlineCache { dst, offset, ic } => {
                let stamp = self.const_stamp()?;
                let lookup = match routine.const_caches.get(*ic as usize) {
                    Some(cache) => cache.lookup(stamp),
                    None => Lookup::Miss,
                };
                if let Some(profiler) = &mut self.profiler {
                    profiler.record_cache(CacheKind::Const, &lookup);
                }
                match lookup {
                    Lookup::Hit(value) => {
                        self.stack.set_temp(*dst, value);
                        Ok(Step::Jump(*offset))
                    }
                    _ => {
                        self.stack.set_temp(*dst, Value::Nil);
                        Ok(Step::Next)
                    }
                }
            }
            Insn::SetInlineCache { src, ic } => {
                let stamp = self.const_stamp()?;
                if let Some(cache) = routine.const_caches.get(*ic as usize) {
                    cache.fill(stamp, self.stack.temp(*src));
                }
                Ok(Step::Next)
            }
            Insn::RunOnce { dst, iseq, ic } => {
                let cached = routine
                    .once_caches
                    .get(*ic as usize)
                    .and_then(|cell| cell.lock().clone());
                if let Some(value) = cached {
                    self.stack.set_temp(*dst, value);
                    return Ok(Step::Next);
                }
                let body = child(routine, *iseq)?;
                let frame = self.frame()?;
                let mut spec = FrameSpec::new(body, FrameKind::Once, frame.self_value.clone(), frame.cref);
                spec.method = frame.method.clone();
                spec.method_home = frame.method_home;
                spec.ret = ReturnTo {
                    pc: pc + 1,
                    slot: Some(*dst),
                    once: Some(*ic),
                    ..Default::default()
                };
                spec.outer = self.stack.capture_env();
                self.push_frame(spec, &[], false)?;
                Ok(Step::Reload)
            }

            // ===== Calls and returns =====
            Insn::Call { kind, cd, start } => self.exec_call(routine, pc, *kind, *cd, *start),
            Insn::CallSuper { cd, start } => self.exec_call_super(routine, pc, *cd, *start),
            Insn::CallBlock { cd, start } => self.exec_call_block(routine, pc, *cd, *start),
            Insn::TempRet { src } => Ok(Step::Return(self.stack.temp(*src))),
            Insn::LocRet { src } => Ok(Step::Return(self.stack.local(*src))),
            Insn::ValRet { value } => Ok(Step::Return(value.to_value())),
            Insn::RaiseExcept { src, kind } => {
                let value = self.operand(src);
                Err(self.throw(*kind, value))
            }

            // ===== Branches =====
            Insn::Goto { offset } => Ok(Step::Jump(*offset)),
            Insn::Bt { cond, offset } => Ok(branch(self.read(*cond).truthy(), *offset)),
            Insn::Bf { cond, offset } => Ok(branch(!self.read(*cond).truthy(), *offset)),
            Insn::Bnil { cond, offset } => Ok(branch(self.read(*cond).is_nil(), *offset)),
            Insn::CaseDispatch {
                src,
                table,
                else_offset,
            } => Ok(self.case_dispatch(&self.read(*src), table, *else_offset)),

            // ===== Operators =====
            Insn::Binary {
                op,
                dst,
                lhs,
                rhs,
                cd,
                variant,
            } => self.exec_binary(
                routine,
                pc,
                *op,
                *lhs,
                rhs,
                *cd,
                variant,
                BinaryTarget {
                    dst: *dst,
                    branch: None,
                },
            ),
            Insn::CmpBranch {
                op,
                branch_if,
                dst,
                lhs,
                rhs,
                offset,
                cd,
                variant,
            } => self.exec_binary(
                routine,
                pc,
                *op,
                *lhs,
                rhs,
                *cd,
                variant,
                BinaryTarget {
                    dst: *dst,
                    branch: Some(BranchOnReturn {
                        when: *branch_if,
                        target: (pc as i64 + 1 + *offset as i64) as usize,
                    }),
                },
            ),
            Insn::Index {
                dst,
                recv,
                key,
                cd,
                variant,
            } => self.exec_index(routine, pc, *dst, *recv, key, *cd, variant),
            Insn::IndexSet {
                dst,
                recv,
                key,
                value,
                cd,
                variant,
            } => self.exec_index_set(routine, pc, *dst, *recv, key, *value, *cd, variant),
            Insn::Unary {
                op,
                dst,
                src,
                cd,
                variant,
            } => self.exec_unary(routine, pc, *op, *dst, *src, *cd, variant),

            // ===== Objects =====
            Insn::MakeArray { dst, count } => {
                let items = self.stack.temps(*dst, *count).to_vec();
                self.stack.set_temp(*dst, Value::array(items));
                Ok(Step::Next)
            }
            Insn::MakeHash { dst, count } => {
                let mut hash = RHash::new();
                for pair in self.stack.temps(*dst, *count).chunks(2) {
                    if let [key, value] = pair {
                        hash.insert(key.clone(), value.clone());
                    }
                }
                self.stack.set_temp(*dst, Value::hash(hash));
                Ok(Step::Next)
            }
            Insn::MakeRange {
                dst,
                low,
                high,
                exclude_end,
            } => {
                let range = Value::range(self.read(*low), self.read(*high), *exclude_end);
                self.stack.set_temp(*dst, range);
                Ok(Step::Next)
            }
            Insn::CloneArray { dst, values } => {
                let items = values.iter().map(|lit| lit.to_value()).collect();
                self.stack.set_temp(*dst, Value::array(items));
                Ok(Step::Next)
            }
            Insn::SpreadArray { start, num, splat } => {
                let items = match self.stack.temp(*start) {
                    Value::Array(items) => items.lock().clone(),
                    other => vec![other],
                };
                let (num, splat) = (*num, u32::from(*splat));
                for i in 0..num {
                    let value = items.get(i as usize).cloned().unwrap_or(Value::Nil);
                    self.stack.set_temp(start + splat + (num - 1 - i), value);
                }
                if splat == 1 {
                    let rest = items.get(num as usize..).map(<[Value]>::to_vec).unwrap_or_default();
                    self.stack.set_temp(*start, Value::array(rest));
                }
                Ok(Step::Next)
            }
            Insn::SplatArray { dst, src, dup } => {
                let value = match self.read(*src) {
                    Value::Array(items) if *dup => Value::array(items.lock().clone()),
                    array @ Value::Array(_) => array,
                    Value::Nil => Value::array(Vec::new()),
                    other => Value::array(vec![other]),
                };
                self.stack.set_temp(*dst, value);
                Ok(Step::Next)
            }
            Insn::ConcatArray { dst, lhs, rhs } => {
                let mut items = match self.read(*lhs) {
                    Value::Array(items) => items.lock().clone(),
                    other => vec![other],
                };
                match self.read(*rhs) {
                    Value::Array(more) => items.extend(more.lock().iter().cloned()),
                    other => items.push(other),
                }
                self.stack.set_temp(*dst, Value::array(items));
                Ok(Step::Next)
            }
            Insn::ConcatStrings { dst, count } => {
                let parts = self.stack.temps(*dst, *count).to_vec();
                let mut out = String::new();
                for part in parts {
                    match part {
                        Value::Str(s) => out.push_str(&s.lock()),
                        other => {
                            match self.call_method(other, "to_s", Vec::new(), None)? {
                                Value::Str(s) => out.push_str(&s.lock()),
                                text => out.push_str(&self.host.inspect(&text)),
                            }
                        }
                    }
                }
                self.stack.set_temp(*dst, Value::str(out));
                Ok(Step::Next)
            }
            Insn::ToString { dst, src, cd } => match self.read(*src) {
                string @ Value::Str(_) => {
                    self.stack.set_temp(*dst, string);
                    Ok(Step::Next)
                }
                other => {
                    let ret = ReturnTo {
                        pc: pc + 1,
                        slot: Some(*dst),
                        ..Default::default()
                    };
                    self.call_operator(routine, *cd, other, Vec::new(), ret)
                }
            },

            // ===== Definitions and checks =====
            Insn::DefineClass {
                dst,
                name,
                iseq,
                module,
                cbase,
                superclass,
            } => {
                let scope = match self.read(*cbase) {
                    Value::Nil => self.frame()?.cref,
                    Value::Class(class) => class,
                    other => {
                        return Err(self.type_error(format!(
                            "{} is not a class/module",
                            self.host.inspect(&other)
                        )))
                    }
                };
                let superclass = match self.read(*superclass) {
                    Value::Nil => None,
                    Value::Class(class) => Some(class),
                    _ => return Err(self.type_error("superclass must be a Class")),
                };
                let class = self
                    .host
                    .open_class(scope, name, superclass, *module)
                    .map_err(|message| self.type_error(message))?;
                let body = child(routine, *iseq)?;
                let mut spec = FrameSpec::new(body, FrameKind::Class, Value::Class(class), class);
                spec.ret = ReturnTo {
                    pc: pc + 1,
                    slot: Some(*dst),
                    ..Default::default()
                };
                self.push_frame(spec, &[], false)?;
                Ok(Step::Reload)
            }
            Insn::DefineMethod {
                dst,
                name,
                iseq,
                singleton,
            } => {
                let body = child(routine, *iseq)?;
                let class = match singleton {
                    None => self.frame()?.cref,
                    Some(slot) => {
                        let recv = self.read(*slot);
                        self.host
                            .singleton_class(&recv)
                            .map_err(|message| self.type_error(message))?
                    }
                };
                self.host.define_method(class, name.clone(), MethodBody::Routine(body));
                self.stack.set_temp(*dst, Value::Symbol(name.clone()));
                Ok(Step::Next)
            }
            Insn::Defined {
                dst,
                kind,
                name,
                obj,
                message,
            } => {
                let defined = self.is_defined(*kind, name.as_ref(), obj)?;
                let result = if defined {
                    Value::str(message.as_ref())
                } else {
                    Value::Nil
                };
                self.stack.set_temp(*dst, result);
                Ok(Step::Next)
            }
            Insn::CheckMatch {
                dst,
                target,
                pattern,
                array,
                ..
            } => {
                let target = self.read(*target);
                let pattern = self.read(*pattern);
                let matched = match (&pattern, *array) {
                    (Value::Array(items), true) => {
                        let items = items.lock().clone();
                        let mut any = false;
                        for item in &items {
                            if self.case_eq(item, &target)? {
                                any = true;
                                break;
                            }
                        }
                        any
                    }
                    _ => self.case_eq(&pattern, &target)?,
                };
                self.stack.set_temp(*dst, Value::bool(matched));
                Ok(Step::Next)
            }
            Insn::TraceCoverage { .. } => {
                if self.hook.is_some() {
                    self.report(routine, pc, EventFlags::COVERAGE_LINE);
                }
                Ok(Step::Next)
            }
        }
    }

    fn write(&mut self, slot: Slot, value: Value) {
        match slot {
            Slot::Temp(t) => self.stack.set_temp(t, value),
            Slot::Local(l) => self.stack.set_local(l, value, self.host.as_ref()),
        }
    }

    fn store_up_local(&mut self, idx: u32, level: u32, value: Value) -> Result<Step, VmError> {
        if self.stack.set_up_local(idx, level, value, self.host.as_ref()) {
            Ok(Step::Next)
        } else {
            Err(VmError::InvariantViolation(format!(
                "no environment {} levels up",
                level
            )))
        }
    }

    fn case_dispatch(&self, value: &Value, table: &CaseTable, else_offset: i32) -> Step {
        let Some(kind) = value.core_kind() else {
            return Step::Next;
        };
        if !self.globals.unredefined(BasicOp::Eqq, kind) {
            return Step::Next;
        }
        let offset = table.lookup(value).or_else(|| match value {
            // 1.0 matches `when 1`
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => table.lookup(&Value::int(*f as i64)),
            _ => None,
        });
        Step::Jump(offset.unwrap_or(else_offset))
    }

    // ------------------------------------------------------------------
    // Instance variables
    // ------------------------------------------------------------------

    pub(crate) fn ivar_get(&mut self, recv: &Value, name: &Symbol, cache: Option<&IvarCache>) -> Value {
        match recv {
            Value::Object(obj) => match self.ivar_slot(obj.class, name, cache, false) {
                Some(slot) => obj.ivar(slot),
                None => Value::Nil,
            },
            _ => self.host.generic_ivar_get(recv, name).unwrap_or(Value::Nil),
        }
    }

    pub(crate) fn ivar_set(
        &mut self,
        recv: &Value,
        name: Symbol,
        value: Value,
        cache: Option<&IvarCache>,
    ) -> Result<(), VmError> {
        match recv {
            Value::Object(obj) => {
                if let Some(slot) = self.ivar_slot(obj.class, &name, cache, true) {
                    obj.set_ivar(slot, value);
                }
                Ok(())
            }
            _ => self
                .host
                .generic_ivar_set(recv, name, value)
                .map_err(|message| self.raise("RuntimeError", message)),
        }
    }

    fn ivar_slot(
        &mut self,
        class: ClassId,
        name: &Symbol,
        cache: Option<&IvarCache>,
        create: bool,
    ) -> Option<usize> {
        let stamp = Stamp::new(0, class.0 as u64);
        if let Some(cache) = cache {
            let lookup = cache.lookup(stamp);
            if let Some(profiler) = &mut self.profiler {
                profiler.record_cache(CacheKind::Ivar, &lookup);
            }
            if let Lookup::Hit(slot) = lookup {
                return Some(slot);
            }
        }
        let slot = self.host.ivar_index(class, name, create)?;
        if let Some(cache) = cache {
            cache.fill(stamp, slot);
        }
        Some(slot)
    }

    // ------------------------------------------------------------------
    // Constants
    // ------------------------------------------------------------------

    fn const_stamp(&self) -> Result<Stamp, VmError> {
        let cref = self.frame()?.cref;
        Ok(Stamp::new(self.globals.constant_generation(), cref.0 as u64))
    }

    /// Lexical constant lookup through the site's cache.
    fn lexical_const(&mut self, routine: &Routine, name: &Symbol, ic: u32) -> Result<Value, VmError> {
        let stamp = self.const_stamp()?;
        let cache = routine.const_caches.get(ic as usize);
        if let Some(cache) = cache {
            let lookup = cache.lookup(stamp);
            if let Some(profiler) = &mut self.profiler {
                profiler.record_cache(CacheKind::Const, &lookup);
            }
            if let Lookup::Hit(value) = lookup {
                return Ok(value);
            }
        }
        let cref = self.frame()?.cref;
        let Some(value) = self.host.get_const(cref, name) else {
            return Err(self.raise("NameError", format!("uninitialized constant {}", name)));
        };
        if let Some(cache) = cache {
            cache.fill(stamp, value.clone());
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // defined?
    // ------------------------------------------------------------------

    fn is_defined(&mut self, kind: DefinedKind, name: Option<&Symbol>, obj: &Operand) -> Result<bool, VmError> {
        let frame = self.frame()?;
        let (self_value, cref, has_block) = (frame.self_value.clone(), frame.cref, frame.block.is_some());
        let Some(name) = name else {
            return Ok(match kind {
                DefinedKind::Yield => has_block,
                _ => true,
            });
        };
        Ok(match kind {
            DefinedKind::Ivar => match &self_value {
                Value::Object(obj) => self
                    .host
                    .ivar_index(obj.class, name, false)
                    .map_or(false, |slot| !obj.ivar(slot).is_nil()),
                other => self.host.generic_ivar_get(other, name).is_some(),
            },
            DefinedKind::Gvar => !self.host.get_global(name).is_nil(),
            DefinedKind::Cvar => self.host.get_cvar(cref, name).is_some(),
            DefinedKind::Const => match self.operand(obj) {
                Value::Class(class) => self.host.get_const_under(class, name).is_some(),
                _ => self.host.get_const(cref, name).is_some(),
            },
            DefinedKind::Method => {
                let recv = self.operand(obj);
                self.host.find_method(self.host.class_of(&recv), name).is_some()
            }
            DefinedKind::Yield => has_block,
            DefinedKind::Expr => true,
        })
    }
}

#[inline]
fn branch(taken: bool, offset: i32) -> Step {
    if taken {
        Step::Jump(offset)
    } else {
        Step::Next
    }
}

fn child(routine: &Routine, idx: usize) -> Result<Arc<Routine>, VmError> {
    routine.children.get(idx).cloned().ok_or_else(|| {
        VmError::InvariantViolation(format!("{} has no child routine {}", routine.name, idx))
    })
}
