//! Register bytecode
//!
//! The executable form produced by [`translate`](crate::translate). Each
//! instruction names its operands explicitly: temporaries (`t3`), locals of
//! the current frame (`l0`), up-level locals (index plus nesting level),
//! immediates, call-data handles and branch offsets. Offsets are relative
//! to the instruction following the branch.
//!
//! Speculating instructions carry a [`VariantCell`]. Rewriting an
//! instruction is a single atomic store into that cell; the rest of the
//! instruction is immutable once the routine is built.

pub mod disasm;

pub use disasm::{disassemble, format_insn};

use crate::cache::{CallCache, ConstCache, IvarCache};
use crate::iseq::{
    CallFlags, CaseArm, CatchEntry, EventEntry, EventFlags, IseqKind, Literal, Params, ThrowKind,
};
use crate::object::{BasicOp, DefinedKind};
use crate::value::{HashKey, Symbol, Value};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

// ============================================================================
// Operands
// ============================================================================

/// A register of the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Temp(u32),
    Local(u32),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Temp(i) => write!(f, "t{}", i),
            Slot::Local(i) => write!(f, "l{}", i),
        }
    }
}

/// A register or an immediate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Slot(Slot),
    Imm(Literal),
}

impl Operand {
    pub fn temp(i: u32) -> Self {
        Operand::Slot(Slot::Temp(i))
    }

    /// Disassembly suffix of immediate-operand forms.
    pub fn imm_suffix(&self) -> &'static str {
        match self {
            Operand::Imm(Literal::Int(_)) => "i",
            Operand::Imm(Literal::Float(_)) => "f",
            Operand::Imm(Literal::Str(_)) => "s",
            _ => "",
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Slot(slot) => write!(f, "{}", slot),
            Operand::Imm(lit) => f.write_str(&disasm::format_literal(lit)),
        }
    }
}

// ============================================================================
// Variants
// ============================================================================

/// Current form of a self-rewriting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Variant {
    /// Inspects operand kinds and may rewrite itself
    Generic = 0,
    /// Assumes fixnum operands
    Fixnum = 1,
    /// Assumes float operands
    Flonum = 2,
    /// Deoptimized: inspects operand kinds, never rewrites again
    Unchanging = 3,
    /// Assumes an array receiver
    Array = 4,
    /// Assumes a hash receiver
    Hash = 5,
    /// Assumes the builtin method of the operand's class is in effect
    Builtin = 6,
}

impl Variant {
    fn from_u8(raw: u8) -> Variant {
        match raw {
            1 => Variant::Fixnum,
            2 => Variant::Flonum,
            3 => Variant::Unchanging,
            4 => Variant::Array,
            5 => Variant::Hash,
            6 => Variant::Builtin,
            _ => Variant::Generic,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Variant::Generic => "",
            Variant::Fixnum => "i",
            Variant::Flonum => "f",
            Variant::Unchanging => "u",
            Variant::Array => "a",
            Variant::Hash => "h",
            Variant::Builtin => "s",
        }
    }

    pub fn is_speculative(self) -> bool {
        matches!(
            self,
            Variant::Fixnum | Variant::Flonum | Variant::Array | Variant::Hash | Variant::Builtin
        )
    }
}

/// Atomic holder of an instruction's [`Variant`].
///
/// Stores publish with `Release` and loads use `Acquire`, so a thread that
/// observes a rewritten variant also observes everything written before
/// the rewrite.
pub struct VariantCell(AtomicU8);

impl VariantCell {
    pub fn new(variant: Variant) -> Self {
        VariantCell(AtomicU8::new(variant as u8))
    }

    #[inline]
    pub fn get(&self) -> Variant {
        Variant::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, variant: Variant) {
        self.0.store(variant as u8, Ordering::Release);
    }
}

impl Default for VariantCell {
    fn default() -> Self {
        VariantCell::new(Variant::Generic)
    }
}

impl Clone for VariantCell {
    fn clone(&self) -> Self {
        VariantCell::new(self.get())
    }
}

impl fmt::Debug for VariantCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

impl Serialize for VariantCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Two-operand operators with inlined fast paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Or,
    And,
    Ltlt,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    pub fn name(self) -> &'static str {
        match self {
            BinOp::Plus => "plus",
            BinOp::Minus => "minus",
            BinOp::Mult => "mult",
            BinOp::Div => "div",
            BinOp::Mod => "mod",
            BinOp::Or => "or",
            BinOp::And => "and",
            BinOp::Ltlt => "ltlt",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Gt => "gt",
            BinOp::Le => "le",
            BinOp::Ge => "ge",
        }
    }

    pub fn basic_op(self) -> BasicOp {
        match self {
            BinOp::Plus => BasicOp::Plus,
            BinOp::Minus => BasicOp::Minus,
            BinOp::Mult => BasicOp::Mult,
            BinOp::Div => BasicOp::Div,
            BinOp::Mod => BasicOp::Mod,
            BinOp::Or => BasicOp::Or,
            BinOp::And => BasicOp::And,
            BinOp::Ltlt => BasicOp::Ltlt,
            BinOp::Eq => BasicOp::Eq,
            BinOp::Ne => BasicOp::Neq,
            BinOp::Lt => BasicOp::Lt,
            BinOp::Gt => BasicOp::Gt,
            BinOp::Le => BasicOp::Le,
            BinOp::Ge => BasicOp::Ge,
        }
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }

    /// Has a fixnum-speculating form.
    pub fn specializes_fixnum(self) -> bool {
        self != BinOp::Ltlt
    }

    /// Has a float-speculating form (and accepts float immediates).
    pub fn specializes_flonum(self) -> bool {
        !matches!(self, BinOp::Or | BinOp::And | BinOp::Ltlt)
    }
}

/// One-operand operators with inlined fast paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Length,
    Size,
    EmptyP,
    Succ,
    Not,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Length => "length",
            UnaryOp::Size => "size",
            UnaryOp::EmptyP => "empty_p",
            UnaryOp::Succ => "succ",
            UnaryOp::Not => "not",
        }
    }

    pub fn basic_op(self) -> BasicOp {
        match self {
            UnaryOp::Length => BasicOp::Length,
            UnaryOp::Size => BasicOp::Size,
            UnaryOp::EmptyP => BasicOp::EmptyP,
            UnaryOp::Succ => BasicOp::Succ,
            UnaryOp::Not => BasicOp::Not,
        }
    }
}

/// Where a call finds its receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Receiver materialized in the call-start temp
    Plain,
    /// Receiver is the frame's self
    SelfRecv,
    /// Receiver is a local of the current frame
    LocRecv(u32),
}

/// `case_dispatch` jump table
#[derive(Debug, Clone, Serialize)]
pub struct CaseTable {
    pub arms: Vec<CaseArm>,
    #[serde(skip)]
    index: HashMap<HashKey, usize>,
}

impl CaseTable {
    pub fn new(arms: Vec<CaseArm>) -> Self {
        let mut index = HashMap::with_capacity(arms.len());
        for (i, arm) in arms.iter().enumerate() {
            index.entry(arm.key.to_value().hash_key(false)).or_insert(i);
        }
        Self { arms, index }
    }

    /// Branch offset for `key`, if the table has an arm for it.
    pub fn lookup(&self, key: &Value) -> Option<i32> {
        self.index
            .get(&key.hash_key(false))
            .map(|&i| self.arms[i].offset)
    }
}

// ============================================================================
// Instructions
// ============================================================================

/// Register instruction
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Insn {
    Nop,

    // ===== Moves =====
    Temp2Temp { dst: u32, src: u32 },
    Loc2Loc { dst: u32, src: u32 },
    Loc2Temp { dst: u32, src: u32 },
    Temp2Loc { dst: u32, src: u32 },
    UpLoc2Temp { dst: u32, idx: u32, level: u32 },
    Var2UpLoc { idx: u32, level: u32, src: Slot },
    Val2UpLoc { idx: u32, level: u32, value: Literal },
    Val2Loc { dst: u32, value: Literal },
    Val2Temp { dst: u32, value: Literal },
    /// Allocates a fresh string
    Str2Var { dst: Slot, text: Arc<str> },
    Self2Var { dst: Slot },
    VarSwap { a: u32, b: u32 },
    TempReverse { start: u32, count: u32 },

    // ===== Variables and constants =====
    Ivar2Var { dst: u32, name: Symbol, ic: u32 },
    Var2Ivar { name: Symbol, ic: u32, src: Operand },
    Cvar2Var { dst: u32, name: Symbol },
    Var2Cvar { name: Symbol, src: Slot },
    Global2Var { dst: u32, name: Symbol },
    Var2Global { name: Symbol, src: Slot },
    /// Lexical lookup when `base` is absent, otherwise under `base`
    ConstLoad {
        dst: u32,
        base: Option<Slot>,
        name: Symbol,
        ic: u32,
    },
    ConstCachedLoad { dst: u32, name: Symbol, ic: u32 },
    Var2Const { name: Symbol, base: Slot, src: Slot },
    /// Loads the cached value and jumps when the cache is valid
    GetInlineCache { dst: u32, offset: i32, ic: u32 },
    SetInlineCache { src: u32, ic: u32 },
    RunOnce { dst: u32, iseq: usize, ic: u32 },

    // ===== Calls and returns =====
    /// Arguments in `start + 1 ..`, result into `start`
    Call { kind: CallKind, cd: u32, start: u32 },
    CallSuper { cd: u32, start: u32 },
    /// Arguments in `start ..`, result into `start`
    CallBlock { cd: u32, start: u32 },
    TempRet { src: u32 },
    LocRet { src: u32 },
    ValRet { value: Literal },
    RaiseExcept { src: Operand, kind: ThrowKind },

    // ===== Branches =====
    Goto { offset: i32 },
    Bt { cond: Slot, offset: i32 },
    Bf { cond: Slot, offset: i32 },
    Bnil { cond: Slot, offset: i32 },
    CaseDispatch {
        src: Slot,
        table: CaseTable,
        else_offset: i32,
    },

    // ===== Operators =====
    Binary {
        #[serde(rename = "operator")]
        op: BinOp,
        dst: u32,
        lhs: Slot,
        rhs: Operand,
        cd: u32,
        variant: VariantCell,
    },
    /// Fused compare and conditional branch; the flag is also stored in `dst`
    CmpBranch {
        #[serde(rename = "operator")]
        op: BinOp,
        branch_if: bool,
        dst: u32,
        lhs: Slot,
        rhs: Operand,
        offset: i32,
        cd: u32,
        variant: VariantCell,
    },
    Index {
        dst: u32,
        recv: Slot,
        key: Operand,
        cd: u32,
        variant: VariantCell,
    },
    IndexSet {
        dst: u32,
        recv: Slot,
        key: Operand,
        value: Slot,
        cd: u32,
        variant: VariantCell,
    },
    Unary {
        #[serde(rename = "operator")]
        op: UnaryOp,
        dst: u32,
        src: Slot,
        cd: u32,
        variant: VariantCell,
    },

    // ===== Objects =====
    /// Elements in `dst .. dst + count`
    MakeArray { dst: u32, count: u32 },
    /// Alternating keys and values in `dst .. dst + count`
    MakeHash { dst: u32, count: u32 },
    MakeRange {
        dst: u32,
        low: Slot,
        high: Slot,
        exclude_end: bool,
    },
    CloneArray { dst: u32, values: Vec<Literal> },
    /// Replaces the array in `start` with its elements, first one on top
    SpreadArray { start: u32, num: u32, splat: bool },
    SplatArray { dst: u32, src: Slot, dup: bool },
    ConcatArray { dst: u32, lhs: Slot, rhs: Slot },
    ConcatStrings { dst: u32, count: u32 },
    ToString { dst: u32, src: Slot, cd: u32 },

    // ===== Definitions and checks =====
    DefineClass {
        dst: u32,
        name: Symbol,
        iseq: usize,
        module: bool,
        cbase: Slot,
        superclass: Slot,
    },
    DefineMethod {
        dst: u32,
        name: Symbol,
        iseq: usize,
        singleton: Option<Slot>,
    },
    Defined {
        dst: u32,
        kind: DefinedKind,
        name: Option<Symbol>,
        obj: Operand,
        message: Arc<str>,
    },
    CheckMatch {
        dst: u32,
        target: Slot,
        pattern: Slot,
        array: bool,
        cd: u32,
    },
    TraceCoverage { line: u32 },
}

impl Insn {
    /// Relative branch offset, for relocation and disassembly.
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Insn::Goto { offset }
            | Insn::Bt { offset, .. }
            | Insn::Bf { offset, .. }
            | Insn::Bnil { offset, .. }
            | Insn::CmpBranch { offset, .. }
            | Insn::GetInlineCache { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    pub fn branch_offset_mut(&mut self) -> Option<&mut i32> {
        match self {
            Insn::Goto { offset }
            | Insn::Bt { offset, .. }
            | Insn::Bf { offset, .. }
            | Insn::Bnil { offset, .. }
            | Insn::CmpBranch { offset, .. }
            | Insn::GetInlineCache { offset, .. } => Some(offset),
            Insn::CaseDispatch { else_offset, .. } => Some(else_offset),
            _ => None,
        }
    }

    /// Instructions at which the loop polls for interrupts.
    pub fn polls_interrupts(&self) -> bool {
        match self {
            Insn::Goto { offset } => *offset < 0,
            Insn::Bt { .. }
            | Insn::Bf { .. }
            | Insn::Bnil { .. }
            | Insn::CmpBranch { .. }
            | Insn::Call { .. }
            | Insn::CallSuper { .. }
            | Insn::CallBlock { .. } => true,
            _ => false,
        }
    }

    /// Instructions that may run code outside the instruction set
    /// (method calls, conversions, hooks).
    pub fn may_call_out(&self) -> bool {
        matches!(
            self,
            Insn::Call { .. }
                | Insn::CallSuper { .. }
                | Insn::CallBlock { .. }
                | Insn::Binary { .. }
                | Insn::CmpBranch { .. }
                | Insn::Index { .. }
                | Insn::IndexSet { .. }
                | Insn::Unary { .. }
                | Insn::ToString { .. }
                | Insn::CheckMatch { .. }
                | Insn::DefineClass { .. }
                | Insn::RunOnce { .. }
                | Insn::SplatArray { .. }
                | Insn::RaiseExcept { .. }
        )
    }

    /// The variant cell of a self-rewriting instruction.
    pub fn variant(&self) -> Option<&VariantCell> {
        match self {
            Insn::Binary { variant, .. }
            | Insn::CmpBranch { variant, .. }
            | Insn::Index { variant, .. }
            | Insn::IndexSet { variant, .. }
            | Insn::Unary { variant, .. } => Some(variant),
            _ => None,
        }
    }
}

// ============================================================================
// Routines
// ============================================================================

/// Per call-site data: the call's shape and its method cache.
#[derive(Debug, Serialize)]
pub struct CallData {
    pub name: Symbol,
    pub argc: u32,
    pub flags: CallFlags,
    /// Child routine passed as the literal block
    pub block: Option<usize>,
    #[serde(skip)]
    pub cache: CallCache,
}

impl CallData {
    pub fn new(name: Symbol, argc: u32, flags: CallFlags, block: Option<usize>) -> Self {
        Self {
            name,
            argc,
            flags,
            block,
            cache: CallCache::new(),
        }
    }

    /// Operator call sites dispatch with one argument, or two for `[]=`.
    pub fn operator(name: &str, argc: u32) -> Self {
        Self::new(Symbol::new(name), argc, CallFlags::default(), None)
    }
}

/// Accelerator bookkeeping of one routine.
#[derive(Debug, Default)]
pub struct AccelState {
    cancelled: AtomicBool,
    entries: AtomicU32,
}

impl AccelState {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the routine's compiled code untrusted. Never undone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Count an entry into the routine, returning the new count.
    pub fn record_entry(&self) -> u32 {
        self.entries.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }
}

/// A translated routine, ready to run
#[derive(Debug, Serialize)]
pub struct Routine {
    pub name: String,
    pub kind: IseqKind,
    pub local_table: Vec<Symbol>,
    /// `opt_table` holds register positions
    pub params: Params,
    pub code: Vec<Insn>,
    pub temp_count: u32,
    /// Positions are register positions
    pub catch_table: Vec<CatchEntry>,
    /// Sorted by register position
    pub events: Vec<EventEntry>,
    pub call_data: Vec<CallData>,
    #[serde(skip)]
    pub ivar_caches: Vec<IvarCache>,
    /// Inline caches and constant-load caches share one index space
    #[serde(skip)]
    pub const_caches: Vec<ConstCache>,
    #[serde(skip)]
    pub once_caches: Vec<Mutex<Option<Value>>>,
    pub children: Vec<Arc<Routine>>,
    #[serde(skip)]
    pub accel: AccelState,
}

impl Routine {
    pub fn local_size(&self) -> u32 {
        self.local_table.len() as u32
    }

    /// Cells a frame of this routine occupies: locals, the base cell and
    /// the temporaries.
    pub fn frame_size(&self) -> usize {
        self.local_table.len() + 1 + self.temp_count as usize
    }

    /// Events attached to the instruction at `pc`.
    pub fn events_at(&self, pc: usize) -> EventFlags {
        match self.events.binary_search_by_key(&pc, |e| e.pos) {
            Ok(i) => self.events[i].events,
            Err(_) => EventFlags::NONE,
        }
    }

    /// Source line of the instruction at `pc`.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        let idx = self.events.partition_point(|e| e.pos <= pc);
        idx.checked_sub(1).map(|i| self.events[i].line)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_variant_cell_rewrite() {
        let cell = VariantCell::default();
        assert_eq!(cell.get(), Variant::Generic);
        cell.set(Variant::Fixnum);
        assert_eq!(cell.get(), Variant::Fixnum);

        let copy = cell.clone();
        cell.set(Variant::Unchanging);
        assert_eq!(copy.get(), Variant::Fixnum);
        assert_eq!(cell.get(), Variant::Unchanging);
    }

    #[test]
    fn test_case_table_lookup_uses_eql_keys() {
        let table = CaseTable::new(vec![
            CaseArm {
                key: Literal::Int(1),
                offset: 4,
            },
            CaseArm {
                key: Literal::Str("a".into()),
                offset: 8,
            },
            CaseArm {
                key: Literal::Int(1),
                offset: 12,
            },
        ]);
        assert_eq!(table.lookup(&Value::int(1)), Some(4));
        assert_eq!(table.lookup(&Value::str("a")), Some(8));
        assert_eq!(table.lookup(&Value::Float(1.0)), None);
        assert_eq!(table.lookup(&Value::sym("a")), None);
    }

    #[test]
    fn test_operator_families() {
        assert!(BinOp::Lt.is_compare());
        assert!(!BinOp::Plus.is_compare());
        assert!(BinOp::Or.specializes_fixnum());
        assert!(!BinOp::Or.specializes_flonum());
        assert!(!BinOp::Ltlt.specializes_fixnum());
        assert_eq!(BinOp::Ne.basic_op(), BasicOp::Neq);
    }

    #[test]
    fn test_goto_polls_only_backward() {
        assert!(Insn::Goto { offset: -3 }.polls_interrupts());
        assert!(!Insn::Goto { offset: 2 }.polls_interrupts());
        assert!(Insn::Bt {
            cond: Slot::Temp(0),
            offset: 2
        }
        .polls_interrupts());
    }
}
