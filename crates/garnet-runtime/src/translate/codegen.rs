//! Register code generation
//!
//! Replays the stack code once, keeping the same abstract stack as the
//! analysis. Slots that the analysis left symbolic are handed to their
//! consumer as operands (a local, an immediate); everything else lives in
//! the temporary whose index equals its stack position, so stack position
//! `i` and temporary `t<i>` are interchangeable throughout.
//!
//! Branches are emitted with a zero offset and a relocation; once every
//! position has its register address the relocations, the catch table,
//! the line table and the optional-argument table are remapped.

use super::analyze::{AbstractSlot, Analysis, SlotKind};
use super::events::{finish_event_table, PosEvent};
use super::{try_vec, TranslateError, TranslateOptions};
use crate::cache::{ConstCache, IvarCache};
use crate::iseq::{CallFlags, CatchEntry, EventEntry, Iseq, Literal, StackInsn};
use crate::rtl::{
    AccelState, BinOp, CallData, CallKind, CaseTable, Insn, Operand, Routine, Slot, UnaryOp,
    VariantCell,
};
use crate::value::Symbol;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Which operand of an emitted instruction a relocation patches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocSlot {
    /// The instruction's own branch offset (or dispatch `else`)
    Branch,
    /// Offset of a dispatch-table arm
    CaseArm(usize),
}

/// Branch operand waiting for the final position of its target
#[derive(Debug, Clone, Copy)]
struct Reloc {
    pc: usize,
    slot: RelocSlot,
    /// Stack position of the target
    target: usize,
}

/// Emit the register routine for `iseq`.
pub fn generate(
    iseq: &Iseq,
    analysis: &Analysis,
    events: &[Option<PosEvent>],
    children: Vec<Arc<Routine>>,
    options: &TranslateOptions,
) -> Result<Routine, TranslateError> {
    let mut code = Vec::new();
    code.try_reserve(iseq.insns.len())
        .map_err(|_| TranslateError::OutOfMemory { what: "code buffer" })?;

    let mut gen = Generator {
        iseq,
        analysis,
        events,
        options,
        code,
        stack: Vec::new(),
        new_offsets: try_vec(iseq.insns.len(), 0, "position map")?,
        relocs: Vec::new(),
        event_table: Vec::new(),
        call_data: Vec::new(),
        ivar_sites: 0,
        const_sites: inline_cache_count(iseq),
    };
    gen.run()?;
    gen.finish(children)
}

/// Inline caches named by the stack code come first in the constant
/// cache space; translator-allocated sites follow them.
fn inline_cache_count(iseq: &Iseq) -> u32 {
    iseq.insns
        .iter()
        .filter_map(|insn| match insn {
            StackInsn::GetInlineCache { ic, .. } | StackInsn::SetInlineCache { ic } => {
                Some(ic + 1)
            }
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn once_cache_count(iseq: &Iseq) -> u32 {
    iseq.insns
        .iter()
        .filter_map(|insn| match insn {
            StackInsn::Once { ic, .. } => Some(ic + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn binary_op(insn: &StackInsn) -> Option<BinOp> {
    Some(match insn {
        StackInsn::OptPlus => BinOp::Plus,
        StackInsn::OptMinus => BinOp::Minus,
        StackInsn::OptMult => BinOp::Mult,
        StackInsn::OptDiv => BinOp::Div,
        StackInsn::OptMod => BinOp::Mod,
        StackInsn::OptOr => BinOp::Or,
        StackInsn::OptAnd => BinOp::And,
        StackInsn::OptLtlt => BinOp::Ltlt,
        StackInsn::OptEq => BinOp::Eq,
        StackInsn::OptNeq => BinOp::Ne,
        StackInsn::OptLt => BinOp::Lt,
        StackInsn::OptGt => BinOp::Gt,
        StackInsn::OptLe => BinOp::Le,
        StackInsn::OptGe => BinOp::Ge,
        _ => return None,
    })
}

fn unary_op(insn: &StackInsn) -> Option<UnaryOp> {
    Some(match insn {
        StackInsn::OptLength => UnaryOp::Length,
        StackInsn::OptSize => UnaryOp::Size,
        StackInsn::OptEmptyP => UnaryOp::EmptyP,
        StackInsn::OptSucc => UnaryOp::Succ,
        StackInsn::OptNot => UnaryOp::Not,
        _ => return None,
    })
}

struct Generator<'a> {
    iseq: &'a Iseq,
    analysis: &'a Analysis,
    events: &'a [Option<PosEvent>],
    options: &'a TranslateOptions,
    code: Vec<Insn>,
    stack: Vec<AbstractSlot>,
    /// Register position of every stack position
    new_offsets: Vec<usize>,
    relocs: Vec<Reloc>,
    event_table: Vec<EventEntry>,
    call_data: Vec<CallData>,
    ivar_sites: u32,
    const_sites: u32,
}

impl Generator<'_> {
    fn run(&mut self) -> Result<(), TranslateError> {
        let len = self.iseq.insns.len();
        let mut after_jump = false;
        let mut pos = 0;
        while pos < len {
            if !self.analysis.reached(pos) {
                self.new_offsets[pos] = self.code.len();
                if self.analysis.catch_bound[pos] {
                    // Keep the region bound addressable
                    self.code.push(Insn::Nop);
                }
                after_jump = true;
                pos += 1;
                continue;
            }
            if self.analysis.is_label(pos) {
                self.tune_stack(pos, after_jump);
            }
            if self.analysis.catch_bound[pos] {
                for i in 0..self.stack.len() {
                    self.to_temp(i);
                }
            }
            self.attach_event(pos);
            self.new_offsets[pos] = self.code.len();

            let consumed = self.generate_insn(pos)?;
            for skipped in pos + 1..pos + consumed {
                self.new_offsets[skipped] = self.new_offsets[pos];
            }
            after_jump = self.iseq.insns[pos + consumed - 1].ends_block();
            pos += consumed;
        }
        Ok(())
    }

    fn finish(mut self, children: Vec<Arc<Routine>>) -> Result<Routine, TranslateError> {
        for reloc in &self.relocs {
            let target = self.new_offsets[reloc.target];
            let offset = i32::try_from(target as i64 - (reloc.pc as i64 + 1)).map_err(|_| {
                TranslateError::LimitExceeded {
                    what: "branch distance",
                    limit: i32::MAX as usize,
                    actual: target.abs_diff(reloc.pc + 1),
                }
            })?;
            match (reloc.slot, &mut self.code[reloc.pc]) {
                (RelocSlot::CaseArm(arm), Insn::CaseDispatch { table, .. }) => {
                    table.arms[arm].offset = offset;
                }
                (_, insn) => {
                    if let Some(slot) = insn.branch_offset_mut() {
                        *slot = offset;
                    }
                }
            }
        }

        let mut params = self.iseq.params.clone();
        for entry in &mut params.opt_table {
            if let Some(&pc) = self.new_offsets.get(*entry) {
                *entry = pc;
            }
        }

        let mut catch_table = Vec::new();
        catch_table
            .try_reserve(self.iseq.catch_table.len())
            .map_err(|_| TranslateError::OutOfMemory {
                what: "catch table",
            })?;
        for (index, entry) in self.iseq.catch_table.iter().enumerate() {
            if !self.analysis.catch_valid[index] {
                continue;
            }
            catch_table.push(CatchEntry {
                start: self.new_offsets[entry.start],
                end: self.new_offsets[entry.end],
                cont: self.new_offsets[entry.cont],
                ..*entry
            });
        }

        let events = finish_event_table(&self.event_table, self.code.len());
        trace!(
            routine = %self.iseq.name,
            stack_insns = self.iseq.insns.len(),
            register_insns = self.code.len(),
            "generated"
        );

        Ok(Routine {
            name: self.iseq.name.clone(),
            kind: self.iseq.kind,
            local_table: self
                .iseq
                .local_table
                .iter()
                .map(|name| Symbol::new(name))
                .collect(),
            params,
            code: self.code,
            temp_count: self.analysis.max_depth as u32,
            catch_table,
            events,
            call_data: self.call_data,
            ivar_caches: (0..self.ivar_sites).map(|_| IvarCache::new()).collect(),
            const_caches: (0..self.const_sites).map(|_| ConstCache::new()).collect(),
            once_caches: (0..once_cache_count(self.iseq))
                .map(|_| Mutex::new(None))
                .collect(),
            children,
            accel: AccelState::default(),
        })
    }

    // ------------------------------------------------------------------
    // Stack helpers
    // ------------------------------------------------------------------

    fn emit(&mut self, insn: Insn) {
        self.code.push(insn);
    }

    fn emit_branch(&mut self, insn: Insn, target: usize) {
        self.relocs.push(Reloc {
            pc: self.code.len(),
            slot: RelocSlot::Branch,
            target,
        });
        self.code.push(insn);
    }

    fn push_temp(&mut self, pos: usize) {
        self.stack.push(AbstractSlot::temp(pos));
    }

    fn pop(&mut self, pos: usize) -> Result<AbstractSlot, TranslateError> {
        self.stack.pop().ok_or_else(|| TranslateError::MalformedInput {
            pos,
            reason: "stack underflow".into(),
        })
    }

    fn top(&self) -> usize {
        self.stack.len()
    }

    fn target(&self, pos: usize, offset: i32) -> Result<usize, TranslateError> {
        Iseq::branch_target(pos, offset)
            .filter(|&t| t < self.iseq.insns.len())
            .ok_or_else(|| TranslateError::MalformedInput {
                pos,
                reason: format!("branch offset {} out of range", offset),
            })
    }

    fn string_at(&self, pos: usize) -> Arc<str> {
        match &self.iseq.insns[pos] {
            StackInsn::PutString { value } => Arc::from(value.as_str()),
            _ => Arc::from(""),
        }
    }

    /// Emit the load of a symbolic slot into `dst`.
    fn load(&mut self, slot: &AbstractSlot, dst: Slot) {
        match &slot.kind {
            SlotKind::SelfRef => self.emit(Insn::Self2Var { dst }),
            SlotKind::Val(value) => match dst {
                Slot::Temp(t) => self.emit(Insn::Val2Temp {
                    dst: t,
                    value: value.clone(),
                }),
                Slot::Local(l) => self.emit(Insn::Val2Loc {
                    dst: l,
                    value: value.clone(),
                }),
            },
            SlotKind::Str(pos) => {
                let text = self.string_at(*pos);
                self.emit(Insn::Str2Var { dst, text });
            }
            SlotKind::Loc(src) => match dst {
                Slot::Temp(t) => self.emit(Insn::Loc2Temp { dst: t, src: *src }),
                Slot::Local(l) => self.emit(Insn::Loc2Loc { dst: l, src: *src }),
            },
            SlotKind::Temp | SlotKind::Unknown => {}
        }
    }

    /// Materialize stack slot `idx` into its temporary.
    fn to_temp(&mut self, idx: usize) {
        let slot = self.stack[idx].clone();
        if slot.is_temp() || slot.kind == SlotKind::Unknown {
            return;
        }
        self.load(&slot, Slot::Temp(idx as u32));
        self.stack[idx].kind = SlotKind::Temp;
    }

    /// Operand for a popped slot that lived at stack index `idx`.
    fn to_var(&mut self, slot: &AbstractSlot, idx: usize) -> Slot {
        match slot.kind {
            SlotKind::Loc(l) => Slot::Local(l),
            SlotKind::Temp | SlotKind::Unknown => Slot::Temp(idx as u32),
            _ => {
                self.load(slot, Slot::Temp(idx as u32));
                Slot::Temp(idx as u32)
            }
        }
    }

    /// Like [`to_var`](Self::to_var) but literals may stay immediates.
    fn to_operand(&mut self, slot: &AbstractSlot, idx: usize) -> Operand {
        match &slot.kind {
            SlotKind::Val(value) => Operand::Imm(value.clone()),
            _ => Operand::Slot(self.to_var(slot, idx)),
        }
    }

    /// Materialize the top `n` slots.
    fn put_on_stack(&mut self, n: usize) {
        let len = self.stack.len();
        for i in len - n..len {
            self.to_temp(i);
        }
    }

    /// Materialize the top `n` slots and pop them; returns the index of
    /// the first one.
    fn put_args_on_stack(&mut self, pos: usize, n: usize) -> Result<usize, TranslateError> {
        if self.stack.len() < n {
            return Err(TranslateError::MalformedInput {
                pos,
                reason: "stack underflow".into(),
            });
        }
        self.put_on_stack(n);
        let start = self.stack.len() - n;
        self.stack.truncate(start);
        Ok(start)
    }

    /// Bring the stack in line with the state saved at `label`: reload it
    /// after unreachable code, otherwise materialize what the label keeps
    /// in temporaries.
    fn tune_stack(&mut self, label: usize, restore: bool) {
        let Some(saved) = self.analysis.saved_at(label) else {
            return;
        };
        if restore {
            // String literals are always materialized here
            self.stack = saved
                .iter()
                .map(|slot| match slot.kind {
                    SlotKind::Str(_) => AbstractSlot::temp(slot.source),
                    _ => slot.clone(),
                })
                .collect();
            return;
        }
        let n = saved.len().min(self.stack.len());
        for i in 0..n {
            if saved[i].is_temp() {
                self.to_temp(i);
            }
        }
    }

    fn attach_event(&mut self, pos: usize) {
        let Some(event) = self.events[pos] else {
            return;
        };
        let here = self.code.len();
        if let Some(last) = self.event_table.last_mut().filter(|e| e.pos == here) {
            let previous = PosEvent {
                line: last.line,
                events: last.events,
            };
            if let Ok(Some(merged)) = PosEvent::combine(Some(previous), Some(event)) {
                last.line = merged.line;
                last.events = merged.events;
                return;
            }
            // The previous event keeps an instruction of its own
            self.code.push(Insn::Nop);
        }
        self.event_table.push(event.entry(self.code.len()));
    }

    fn new_call_data(&mut self, data: CallData) -> u32 {
        self.call_data.push(data);
        (self.call_data.len() - 1) as u32
    }

    fn operator_cd(&mut self, name: &str, argc: u32) -> u32 {
        self.new_call_data(CallData::operator(name, argc))
    }

    fn accepts_imm(&self, op: Option<BinOp>, value: &Literal) -> bool {
        if !self.options.immediate_operands {
            return false;
        }
        match op {
            Some(op) => value.is_fixnum() || (value.is_flonum() && op.specializes_flonum()),
            // Index keys
            None => value.is_fixnum() || matches!(value, Literal::Str(_)),
        }
    }

    /// Operand for the second input of an operator that lives at `idx`.
    fn second_operand(&mut self, op: Option<BinOp>, slot: &AbstractSlot, idx: usize) -> Operand {
        match &slot.kind {
            SlotKind::Val(value) if self.accepts_imm(op, value) => Operand::Imm(value.clone()),
            _ => Operand::Slot(self.to_var(slot, idx)),
        }
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// Generate the instruction at `pos`; returns how many stack
    /// instructions were consumed.
    fn generate_insn(&mut self, pos: usize) -> Result<usize, TranslateError> {
        let iseq = self.iseq;
        let insn = &iseq.insns[pos];
        let temp_only = self.analysis.temp_only[pos];
        if self.stack.len() < insn.required_depth() {
            return Err(TranslateError::MalformedInput {
                pos,
                reason: format!("stack underflow in {}", insn.name()),
            });
        }

        if let Some(op) = binary_op(insn) {
            return self.generate_binary(pos, op);
        }
        if let Some(op) = unary_op(insn) {
            let slot = self.pop(pos)?;
            let dst = self.top();
            let src = self.to_var(&slot, dst);
            let cd = self.operator_cd(op.basic_op().method_name(), 0);
            self.emit(Insn::Unary {
                op,
                dst: dst as u32,
                src,
                cd,
                variant: VariantCell::default(),
            });
            self.push_temp(pos);
            return Ok(1);
        }

        match insn {
            StackInsn::Nop => {}
            StackInsn::GetLocal { idx, level } => self.get_local(pos, *idx, *level, temp_only),
            StackInsn::SetLocal { idx, level } => self.set_local(pos, *idx, *level)?,
            StackInsn::GetIvar { name } => {
                let ic = self.ivar_sites;
                self.ivar_sites += 1;
                self.emit(Insn::Ivar2Var {
                    dst: self.top() as u32,
                    name: Symbol::new(name),
                    ic,
                });
                self.push_temp(pos);
            }
            StackInsn::SetIvar { name } => {
                let slot = self.pop(pos)?;
                let src = self.to_operand(&slot, self.top());
                let ic = self.ivar_sites;
                self.ivar_sites += 1;
                self.emit(Insn::Var2Ivar {
                    name: Symbol::new(name),
                    ic,
                    src,
                });
            }
            StackInsn::GetCvar { name } => {
                self.emit(Insn::Cvar2Var {
                    dst: self.top() as u32,
                    name: Symbol::new(name),
                });
                self.push_temp(pos);
            }
            StackInsn::SetCvar { name } => {
                let slot = self.pop(pos)?;
                let src = self.to_var(&slot, self.top());
                self.emit(Insn::Var2Cvar {
                    name: Symbol::new(name),
                    src,
                });
            }
            StackInsn::GetGlobal { name } => {
                self.emit(Insn::Global2Var {
                    dst: self.top() as u32,
                    name: Symbol::new(name),
                });
                self.push_temp(pos);
            }
            StackInsn::SetGlobal { name } => {
                let slot = self.pop(pos)?;
                let src = self.to_var(&slot, self.top());
                self.emit(Insn::Var2Global {
                    name: Symbol::new(name),
                    src,
                });
            }
            StackInsn::GetConstant { name } => {
                let base_slot = self.pop(pos)?;
                let dst = self.top();
                let base = match &base_slot.kind {
                    SlotKind::Val(Literal::Nil) => None,
                    _ => Some(self.to_var(&base_slot, dst)),
                };
                let ic = self.const_sites;
                self.const_sites += 1;
                self.emit(Insn::ConstLoad {
                    dst: dst as u32,
                    base,
                    name: Symbol::new(name),
                    ic,
                });
                self.push_temp(pos);
            }
            StackInsn::SetConstant { name } => {
                let scope = self.pop(pos)?;
                let scope_idx = self.top();
                let value = self.pop(pos)?;
                let value_idx = self.top();
                let base = self.to_var(&scope, scope_idx);
                let src = self.to_var(&value, value_idx);
                self.emit(Insn::Var2Const {
                    name: Symbol::new(name),
                    base,
                    src,
                });
            }
            StackInsn::GetInlineCache { offset, ic } => {
                if let Some(name) = self.cached_constant(pos, *offset, *ic) {
                    self.emit(Insn::ConstCachedLoad {
                        dst: self.top() as u32,
                        name: Symbol::new(name),
                        ic: *ic,
                    });
                    self.push_temp(pos);
                    return Ok(3);
                }
                let target = self.target(pos, *offset)?;
                let dst = self.top() as u32;
                self.stack.push(AbstractSlot::temp(pos));
                self.tune_stack(target, false);
                self.emit_branch(
                    Insn::GetInlineCache {
                        dst,
                        offset: 0,
                        ic: *ic,
                    },
                    target,
                );
            }
            StackInsn::SetInlineCache { ic } => {
                let idx = self.top() - 1;
                self.to_temp(idx);
                self.emit(Insn::SetInlineCache {
                    src: idx as u32,
                    ic: *ic,
                });
            }
            StackInsn::Once { iseq, ic } => {
                self.emit(Insn::RunOnce {
                    dst: self.top() as u32,
                    iseq: *iseq,
                    ic: *ic,
                });
                self.push_temp(pos);
            }

            StackInsn::PutNil => self.put_value(pos, Literal::Nil, temp_only),
            StackInsn::PutObject { value } => self.put_value(pos, value.clone(), temp_only),
            StackInsn::PutSelf => {
                if temp_only {
                    self.emit(Insn::Self2Var {
                        dst: Slot::Temp(self.top() as u32),
                    });
                    self.push_temp(pos);
                } else {
                    self.stack.push(AbstractSlot::new(SlotKind::SelfRef, pos));
                }
            }
            StackInsn::PutString { value } => {
                // Always a fresh object in its own temporary, so copies of
                // the slot share one string
                self.emit(Insn::Str2Var {
                    dst: Slot::Temp(self.top() as u32),
                    text: Arc::from(value.as_str()),
                });
                self.push_temp(pos);
            }
            StackInsn::DupArray { values } => {
                self.emit(Insn::CloneArray {
                    dst: self.top() as u32,
                    values: values.clone(),
                });
                self.push_temp(pos);
            }

            StackInsn::Send {
                name,
                argc,
                flags,
                block,
            } => {
                self.put_args_on_stack(pos, *argc as usize)?;
                let recv = self.pop(pos)?;
                let start = self.top();
                let kind = match recv.kind {
                    SlotKind::SelfRef => CallKind::SelfRecv,
                    SlotKind::Loc(l) => CallKind::LocRecv(l),
                    _ => {
                        self.stack.push(recv);
                        self.to_temp(start);
                        self.stack.pop();
                        CallKind::Plain
                    }
                };
                let cd = self.new_call_data(CallData::new(
                    Symbol::new(name),
                    *argc,
                    *flags,
                    *block,
                ));
                self.emit(Insn::Call {
                    kind,
                    cd,
                    start: start as u32,
                });
                self.push_temp(pos);
            }
            StackInsn::InvokeSuper { argc, flags, block } => {
                self.put_args_on_stack(pos, *argc as usize)?;
                // The receiver is always the frame's self
                self.pop(pos)?;
                let start = self.top();
                let cd = self.new_call_data(CallData::new(
                    Symbol::new("super"),
                    *argc,
                    *flags,
                    *block,
                ));
                self.emit(Insn::CallSuper {
                    cd,
                    start: start as u32,
                });
                self.push_temp(pos);
            }
            StackInsn::InvokeBlock { argc } => {
                let start = self.put_args_on_stack(pos, *argc as usize)?;
                let cd = self.new_call_data(CallData::new(
                    Symbol::new("yield"),
                    *argc,
                    CallFlags::default(),
                    None,
                ));
                self.emit(Insn::CallBlock {
                    cd,
                    start: start as u32,
                });
                self.push_temp(pos);
            }
            StackInsn::Leave => self.generate_leave(pos)?,
            StackInsn::Throw { kind } => {
                let slot = self.pop(pos)?;
                let src = self.to_operand(&slot, self.top());
                self.emit(Insn::RaiseExcept { src, kind: *kind });
                self.push_temp(pos);
            }

            StackInsn::Jump { offset } => {
                let target = self.target(pos, *offset)?;
                if matches!(iseq.insns[target], StackInsn::Leave) {
                    self.generate_leave(pos)?;
                } else {
                    self.tune_stack(target, false);
                    self.emit_branch(Insn::Goto { offset: 0 }, target);
                }
            }
            StackInsn::BranchIf { offset }
            | StackInsn::BranchUnless { offset }
            | StackInsn::BranchNil { offset } => {
                let target = self.target(pos, *offset)?;
                let slot = self.pop(pos)?;
                let cond = self.to_var(&slot, self.top());
                self.tune_stack(target, false);
                let insn = match insn {
                    StackInsn::BranchIf { .. } => Insn::Bt { cond, offset: 0 },
                    StackInsn::BranchUnless { .. } => Insn::Bf { cond, offset: 0 },
                    _ => Insn::Bnil { cond, offset: 0 },
                };
                self.emit_branch(insn, target);
            }
            StackInsn::OptCaseDispatch { table, else_offset } => {
                let slot = self.pop(pos)?;
                let src = self.to_var(&slot, self.top());
                let mut targets = Vec::with_capacity(table.len());
                for arm in table {
                    targets.push(self.target(pos, arm.offset)?);
                }
                let else_target = self.target(pos, *else_offset)?;
                for &target in targets.iter().chain(std::iter::once(&else_target)) {
                    self.tune_stack(target, false);
                }
                let pc = self.code.len();
                for (arm, &target) in targets.iter().enumerate() {
                    self.relocs.push(Reloc {
                        pc,
                        slot: RelocSlot::CaseArm(arm),
                        target,
                    });
                }
                self.emit_branch(
                    Insn::CaseDispatch {
                        src,
                        table: CaseTable::new(table.clone()),
                        else_offset: 0,
                    },
                    else_target,
                );
            }

            StackInsn::OptAref => {
                let key_slot = self.pop(pos)?;
                let recv_slot = self.pop(pos)?;
                let dst = self.top();
                let recv = self.to_var(&recv_slot, dst);
                let key = self.second_operand(None, &key_slot, dst + 1);
                let cd = self.operator_cd("[]", 1);
                self.emit(Insn::Index {
                    dst: dst as u32,
                    recv,
                    key,
                    cd,
                    variant: VariantCell::default(),
                });
                self.push_temp(pos);
            }
            StackInsn::OptAset => {
                let value_slot = self.pop(pos)?;
                let key_slot = self.pop(pos)?;
                let recv_slot = self.pop(pos)?;
                let dst = self.top();
                let recv = self.to_var(&recv_slot, dst);
                let key = self.second_operand(None, &key_slot, dst + 1);
                let value = self.to_var(&value_slot, dst + 2);
                let cd = self.operator_cd("[]=", 2);
                self.emit(Insn::IndexSet {
                    dst: dst as u32,
                    recv,
                    key,
                    value,
                    cd,
                    variant: VariantCell::default(),
                });
                self.push_temp(pos);
            }

            StackInsn::NewArray { count } => {
                let dst = self.put_args_on_stack(pos, *count as usize)?;
                self.emit(Insn::MakeArray {
                    dst: dst as u32,
                    count: *count,
                });
                self.push_temp(pos);
            }
            StackInsn::NewHash { count } => {
                let dst = self.put_args_on_stack(pos, *count as usize)?;
                self.emit(Insn::MakeHash {
                    dst: dst as u32,
                    count: *count,
                });
                self.push_temp(pos);
            }
            StackInsn::ConcatStrings { count } => {
                let dst = self.put_args_on_stack(pos, *count as usize)?;
                self.emit(Insn::ConcatStrings {
                    dst: dst as u32,
                    count: *count,
                });
                self.push_temp(pos);
            }
            StackInsn::NewRange { exclude_end } => {
                let (dst, low, high) = self.get_2vars(pos)?;
                self.emit(Insn::MakeRange {
                    dst,
                    low,
                    high,
                    exclude_end: *exclude_end,
                });
                self.push_temp(pos);
            }
            StackInsn::ConcatArray => {
                let (dst, lhs, rhs) = self.get_2vars(pos)?;
                self.emit(Insn::ConcatArray { dst, lhs, rhs });
                self.push_temp(pos);
            }
            StackInsn::ExpandArray { num, flag } => {
                let start = self.top() - 1;
                self.to_temp(start);
                self.pop(pos)?;
                self.emit(Insn::SpreadArray {
                    start: start as u32,
                    num: *num,
                    splat: flag & 1 != 0,
                });
                for _ in 0..num + (flag & 1) {
                    self.push_temp(pos);
                }
            }
            StackInsn::SplatArray { dup } => {
                let slot = self.pop(pos)?;
                let dst = self.top();
                let src = self.to_var(&slot, dst);
                self.emit(Insn::SplatArray {
                    dst: dst as u32,
                    src,
                    dup: *dup,
                });
                self.push_temp(pos);
            }
            StackInsn::ToString => {
                let slot = self.pop(pos)?;
                let dst = self.top();
                let src = self.to_var(&slot, dst);
                let cd = self.operator_cd("to_s", 0);
                self.emit(Insn::ToString {
                    dst: dst as u32,
                    src,
                    cd,
                });
                self.push_temp(pos);
            }

            StackInsn::DefineClass { name, iseq, module } => {
                let (dst, cbase, superclass) = self.get_2vars(pos)?;
                self.emit(Insn::DefineClass {
                    dst,
                    name: Symbol::new(name),
                    iseq: *iseq,
                    module: *module,
                    cbase,
                    superclass,
                });
                self.push_temp(pos);
            }
            StackInsn::DefineMethod { name, iseq } => {
                self.emit(Insn::DefineMethod {
                    dst: self.top() as u32,
                    name: Symbol::new(name),
                    iseq: *iseq,
                    singleton: None,
                });
                self.push_temp(pos);
            }
            StackInsn::DefineSMethod { name, iseq } => {
                let slot = self.pop(pos)?;
                let dst = self.top();
                let recv = self.to_var(&slot, dst);
                self.emit(Insn::DefineMethod {
                    dst: dst as u32,
                    name: Symbol::new(name),
                    iseq: *iseq,
                    singleton: Some(recv),
                });
                self.push_temp(pos);
            }
            StackInsn::Defined {
                kind,
                name,
                message,
            } => {
                let slot = self.pop(pos)?;
                let dst = self.top();
                let obj = match &slot.kind {
                    SlotKind::Val(value) => Operand::Imm(value.clone()),
                    _ => Operand::Slot(self.to_var(&slot, dst)),
                };
                self.emit(Insn::Defined {
                    dst: dst as u32,
                    kind: *kind,
                    name: name.as_deref().map(Symbol::new),
                    obj,
                    message: Arc::from(message.as_str()),
                });
                self.push_temp(pos);
            }
            StackInsn::CheckMatch { array } => {
                let (dst, target, pattern) = self.get_2vars(pos)?;
                let cd = self.operator_cd("===", 1);
                self.emit(Insn::CheckMatch {
                    dst,
                    target,
                    pattern,
                    array: *array,
                    cd,
                });
                self.push_temp(pos);
            }
            StackInsn::TraceCoverage { line } => self.emit(Insn::TraceCoverage { line: *line }),

            StackInsn::Pop => {
                self.pop(pos)?;
            }
            StackInsn::AdjustStack { n } => {
                let len = self.stack.len();
                self.stack.truncate(len - *n as usize);
            }
            StackInsn::Dup => {
                let src = self.top() - 1;
                self.duplicate(pos, src, temp_only);
            }
            StackInsn::TopN { n } => {
                let src = self.top() - 1 - *n as usize;
                self.duplicate(pos, src, temp_only);
            }
            StackInsn::DupN { n } => {
                let first = self.top() - *n as usize;
                for i in 0..*n as usize {
                    self.duplicate(pos, first + i, temp_only);
                }
            }
            StackInsn::SetN { n } => {
                let top = self.top() - 1;
                let dst = top - *n as usize;
                let slot = self.stack[top].clone();
                if dst != top {
                    if slot.is_temp() {
                        self.emit(Insn::Temp2Temp {
                            dst: dst as u32,
                            src: top as u32,
                        });
                    }
                    self.stack[dst] = slot;
                }
            }
            StackInsn::Swap => {
                let a = self.top() - 1;
                let b = a - 1;
                match (self.stack[a].is_temp(), self.stack[b].is_temp()) {
                    (true, true) => self.emit(Insn::VarSwap {
                        a: a as u32,
                        b: b as u32,
                    }),
                    (true, false) => self.emit(Insn::Temp2Temp {
                        dst: b as u32,
                        src: a as u32,
                    }),
                    (false, true) => self.emit(Insn::Temp2Temp {
                        dst: a as u32,
                        src: b as u32,
                    }),
                    (false, false) => {}
                }
                self.stack.swap(a, b);
            }
            StackInsn::Reverse { n } => {
                let n = *n as usize;
                self.put_on_stack(n);
                if n > 1 {
                    self.emit(Insn::TempReverse {
                        start: (self.top() - n) as u32,
                        count: n as u32,
                    });
                }
            }

            // Handled above
            StackInsn::OptPlus
            | StackInsn::OptMinus
            | StackInsn::OptMult
            | StackInsn::OptDiv
            | StackInsn::OptMod
            | StackInsn::OptEq
            | StackInsn::OptNeq
            | StackInsn::OptLt
            | StackInsn::OptLe
            | StackInsn::OptGt
            | StackInsn::OptGe
            | StackInsn::OptLtlt
            | StackInsn::OptAnd
            | StackInsn::OptOr
            | StackInsn::OptLength
            | StackInsn::OptSize
            | StackInsn::OptEmptyP
            | StackInsn::OptSucc
            | StackInsn::OptNot => {}
        }
        Ok(1)
    }

    fn get_local(&mut self, pos: usize, idx: u32, level: u32, temp_only: bool) {
        let dst = self.top() as u32;
        if level == 0 {
            if temp_only {
                self.emit(Insn::Loc2Temp { dst, src: idx });
                self.push_temp(pos);
            } else {
                self.stack.push(AbstractSlot::new(SlotKind::Loc(idx), pos));
            }
        } else {
            self.emit(Insn::UpLoc2Temp { dst, idx, level });
            self.push_temp(pos);
        }
    }

    fn set_local(&mut self, pos: usize, idx: u32, level: u32) -> Result<(), TranslateError> {
        let slot = self.pop(pos)?;
        let top = self.top();
        if level == 0 {
            // Aliases must read the old value
            for i in 0..self.stack.len() {
                if self.stack[i].kind == SlotKind::Loc(idx) {
                    self.to_temp(i);
                }
            }
            match slot.kind {
                SlotKind::Temp | SlotKind::Unknown => self.emit(Insn::Temp2Loc {
                    dst: idx,
                    src: top as u32,
                }),
                SlotKind::Loc(src) if src == idx => {}
                _ => self.load(&slot, Slot::Local(idx)),
            }
            return Ok(());
        }
        match &slot.kind {
            SlotKind::Val(value) => self.emit(Insn::Val2UpLoc {
                idx,
                level,
                value: value.clone(),
            }),
            _ => {
                let src = self.to_var(&slot, top);
                self.emit(Insn::Var2UpLoc { idx, level, src });
            }
        }
        Ok(())
    }

    fn put_value(&mut self, pos: usize, value: Literal, temp_only: bool) {
        if temp_only {
            self.emit(Insn::Val2Temp {
                dst: self.top() as u32,
                value,
            });
            self.push_temp(pos);
        } else {
            self.stack.push(AbstractSlot::new(SlotKind::Val(value), pos));
        }
    }

    /// Push a copy of stack slot `src`.
    fn duplicate(&mut self, pos: usize, src: usize, temp_only: bool) {
        let slot = self.stack[src].clone();
        let dst = self.top();
        if slot.is_temp() {
            self.emit(Insn::Temp2Temp {
                dst: dst as u32,
                src: src as u32,
            });
            self.push_temp(pos);
        } else if temp_only {
            self.load(&slot, Slot::Temp(dst as u32));
            self.push_temp(pos);
        } else {
            self.stack.push(slot);
        }
    }

    /// Pop two slots and return the result temp and both operands.
    fn get_2vars(&mut self, pos: usize) -> Result<(u32, Slot, Slot), TranslateError> {
        let second = self.pop(pos)?;
        let first = self.pop(pos)?;
        let dst = self.top();
        let a = self.to_var(&first, dst);
        let b = self.to_var(&second, dst + 1);
        Ok((dst as u32, a, b))
    }

    fn generate_binary(&mut self, pos: usize, op: BinOp) -> Result<usize, TranslateError> {
        let rhs_slot = self.pop(pos)?;
        let lhs_slot = self.pop(pos)?;
        let dst = self.top();
        let lhs = self.to_var(&lhs_slot, dst);
        let rhs = self.second_operand(Some(op), &rhs_slot, dst + 1);
        let cd = self.operator_cd(op.basic_op().method_name(), 1);

        if let Some((branch_if, target)) = self.fusable_branch(pos, op)? {
            self.tune_stack(target, false);
            self.emit_branch(
                Insn::CmpBranch {
                    op,
                    branch_if,
                    dst: dst as u32,
                    lhs,
                    rhs,
                    offset: 0,
                    cd,
                    variant: VariantCell::default(),
                },
                target,
            );
            return Ok(2);
        }

        self.emit(Insn::Binary {
            op,
            dst: dst as u32,
            lhs,
            rhs,
            cd,
            variant: VariantCell::default(),
        });
        self.push_temp(pos);
        Ok(1)
    }

    /// A compare immediately consumed by `branchif`/`branchunless` can
    /// become one compare-and-branch instruction.
    fn fusable_branch(
        &self,
        pos: usize,
        op: BinOp,
    ) -> Result<Option<(bool, usize)>, TranslateError> {
        let next = pos + 1;
        if !self.options.fuse_compare_branch
            || !op.is_compare()
            || next >= self.iseq.insns.len()
            || self.analysis.is_label(next)
            || self.events[next].is_some()
        {
            return Ok(None);
        }
        let (branch_if, offset) = match self.iseq.insns[next] {
            StackInsn::BranchIf { offset } => (true, offset),
            StackInsn::BranchUnless { offset } => (false, offset),
            _ => return Ok(None),
        };
        Ok(Some((branch_if, self.target(next, offset)?)))
    }

    /// `getinlinecache; getconstant; setinlinecache` on one cache with
    /// nothing jumping into the middle
    fn cached_constant(&self, pos: usize, offset: i32, ic: u32) -> Option<&str> {
        let insns = &self.iseq.insns;
        if pos + 2 >= insns.len() || offset != 2 {
            return None;
        }
        for inner in pos + 1..=pos + 2 {
            if self.analysis.is_label(inner) || self.events[inner].is_some() {
                return None;
            }
        }
        match (&insns[pos + 1], &insns[pos + 2]) {
            (StackInsn::GetConstant { name }, StackInsn::SetInlineCache { ic: set_ic })
                if *set_ic == ic =>
            {
                Some(name.as_str())
            }
            _ => None,
        }
    }

    fn generate_leave(&mut self, pos: usize) -> Result<(), TranslateError> {
        let Some(slot) = self.stack.last().cloned() else {
            return Err(TranslateError::MalformedInput {
                pos,
                reason: "return with an empty stack".into(),
            });
        };
        let top = (self.stack.len() - 1) as u32;
        match slot.kind {
            SlotKind::Val(value) => self.emit(Insn::ValRet { value }),
            SlotKind::Loc(src) => self.emit(Insn::LocRet { src }),
            SlotKind::Temp | SlotKind::Unknown => self.emit(Insn::TempRet { src: top }),
            SlotKind::SelfRef | SlotKind::Str(_) => {
                self.load(&slot, Slot::Temp(top));
                self.emit(Insn::TempRet { src: top });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::IseqKind;
    use crate::rtl::{disassemble, format_insn};
    use crate::translate::translate;
    use pretty_assertions::assert_eq;

    fn lines(iseq: &Iseq, options: &TranslateOptions) -> Vec<String> {
        let routine = translate(iseq, options).unwrap();
        routine
            .code
            .iter()
            .enumerate()
            .map(|(pc, insn)| format_insn(pc, insn))
            .collect()
    }

    fn int(n: i64) -> StackInsn {
        StackInsn::PutObject {
            value: Literal::Int(n),
        }
    }

    fn compare_and_branch() -> Iseq {
        Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                int(10),
                StackInsn::OptLt,
                StackInsn::BranchUnless { offset: 2 },
                int(1),
                StackInsn::Leave,
                int(2),
                StackInsn::Leave,
            ],
        )
        .with_locals(&["a"])
    }

    #[test]
    fn test_local_plus_literal_is_one_instruction() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                int(1),
                StackInsn::OptPlus,
                StackInsn::Leave,
            ],
        )
        .with_locals(&["a"]);
        assert_eq!(
            lines(&iseq, &TranslateOptions::default()),
            vec!["plusi t0, l0, 1, cd0", "temp_ret t0"]
        );
    }

    #[test]
    fn test_join_materializes_both_arms() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                StackInsn::BranchIf { offset: 2 },
                int(1),
                StackInsn::Jump { offset: 1 },
                StackInsn::GetLocal { idx: 1, level: 0 },
                StackInsn::Leave,
            ],
        )
        .with_locals(&["c", "x"]);
        assert_eq!(
            lines(&iseq, &TranslateOptions::default()),
            vec![
                "bt l0 -> @0003",
                "val2temp t0, 1",
                "temp_ret t0",
                "loc2temp t0, l1",
                "temp_ret t0",
            ]
        );
    }

    #[test]
    fn test_compare_fuses_with_branch() {
        assert_eq!(
            lines(&compare_and_branch(), &TranslateOptions::default()),
            vec!["bflti t0, l0, 10, cd0 -> @0002", "val_ret 1", "val_ret 2"]
        );
    }

    #[test]
    fn test_fusion_and_immediates_can_be_disabled() {
        let options = TranslateOptions {
            fuse_compare_branch: false,
            immediate_operands: false,
            ..Default::default()
        };
        assert_eq!(
            lines(&compare_and_branch(), &options),
            vec![
                "val2temp t1, 10",
                "lt t0, l0, t1, cd0",
                "bf t0 -> @0004",
                "val_ret 1",
                "val_ret 2",
            ]
        );
    }

    #[test]
    fn test_constant_cache_sequence_fuses() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Top,
            vec![
                StackInsn::GetInlineCache { offset: 2, ic: 0 },
                StackInsn::GetConstant { name: "Foo".into() },
                StackInsn::SetInlineCache { ic: 0 },
                StackInsn::Leave,
            ],
        );
        let routine = translate(&iseq, &TranslateOptions::default()).unwrap();
        assert_eq!(
            format_insn(0, &routine.code[0]),
            "const_cached_val_ld t0, Foo, ic0"
        );
        assert_eq!(routine.code.len(), 2);
        assert_eq!(routine.const_caches.len(), 1);
    }

    #[test]
    fn test_string_literal_is_always_fresh() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Top,
            vec![
                StackInsn::PutString {
                    value: "a".into(),
                },
                StackInsn::Leave,
            ],
        );
        assert_eq!(
            lines(&iseq, &TranslateOptions::default()),
            vec!["str2var t0, \"a\"", "temp_ret t0"]
        );
    }

    #[test]
    fn test_assignment_copies_pending_reads_of_the_local() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                int(5),
                StackInsn::SetLocal { idx: 0, level: 0 },
                StackInsn::Leave,
            ],
        )
        .with_locals(&["a"]);
        assert_eq!(
            lines(&iseq, &TranslateOptions::default()),
            vec!["loc2temp t0, l0", "val2loc l0, 5", "temp_ret t0"]
        );
    }

    #[test]
    fn test_catch_entries_are_remapped() {
        let mut iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::PutSelf,
                StackInsn::Send {
                    name: "risky".into(),
                    argc: 0,
                    flags: CallFlags(CallFlags::FCALL),
                    block: None,
                },
                StackInsn::Leave,
                StackInsn::Leave,
            ],
        );
        iseq.catch_table.push(CatchEntry {
            kind: crate::iseq::CatchKind::Rescue,
            start: 0,
            end: 2,
            cont: 3,
            depth: 0,
            iseq: None,
        });
        let routine = translate(&iseq, &TranslateOptions::default()).unwrap();
        let entry = routine.catch_table[0];
        assert_eq!(entry.start, 0);
        assert!(entry.end >= entry.start);
        assert!(entry.cont < routine.code.len());
        assert!(matches!(routine.code[entry.cont], Insn::TempRet { .. }));
    }

    #[test]
    fn test_translation_is_deterministic() {
        let iseq = compare_and_branch();
        let first = translate(&iseq, &TranslateOptions::default()).unwrap();
        let second = translate(&iseq, &TranslateOptions::default()).unwrap();
        assert_eq!(disassemble(&first), disassemble(&second));
    }
}
