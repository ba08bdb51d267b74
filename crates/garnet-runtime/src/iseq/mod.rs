//! Stack bytecode: the translator's input
//!
//! A front end (out of scope here) compiles source into [`Iseq`]s. Each
//! instruction occupies one position, operands are implicit positions on
//! an operand stack, and branch offsets are relative to the position
//! following the branch. Routines are serde-serializable so they can be
//! handed over as JSON.

pub mod validator;

pub use validator::{validate, ValidationError, ValidationErrorKind};

use crate::object::DefinedKind;
use crate::value::Value;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IseqKind {
    #[default]
    Top,
    Method,
    Block,
    Class,
    Rescue,
    Ensure,
    Eval,
}

/// Literal operand of `putobject`, `duparray` and case-dispatch tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Nil,
    True,
    False,
    Int(i64),
    /// Arbitrary-precision integer in decimal notation
    BigInt(String),
    Float(f64),
    Symbol(String),
    Str(String),
    Array(Vec<Literal>),
}

impl Literal {
    /// Identity of two literals as run-time objects.
    ///
    /// Floats compare by bits, so `0.0` and `-0.0` are different literals.
    pub fn same(&self, other: &Literal) -> bool {
        match (self, other) {
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Array(a), Literal::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same(y))
            }
            _ => self == other,
        }
    }

    pub fn is_fixnum(&self) -> bool {
        matches!(self.to_value(), Value::Fixnum(_))
    }

    pub fn is_flonum(&self) -> bool {
        matches!(self, Literal::Float(_))
    }

    /// Materialize a fresh run-time value for this literal.
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Nil => Value::Nil,
            Literal::True => Value::True,
            Literal::False => Value::False,
            Literal::Int(n) => Value::int(*n),
            Literal::BigInt(digits) => BigInt::from_str(digits)
                .map(Value::from_bigint)
                .unwrap_or(Value::Nil),
            Literal::Float(f) => Value::Float(*f),
            Literal::Symbol(s) => Value::sym(s),
            Literal::Str(s) => Value::str(s.clone()),
            Literal::Array(items) => Value::array(items.iter().map(Literal::to_value).collect()),
        }
    }
}

/// Control signal carried by `throw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrowKind {
    Return,
    Break,
    Next,
    Retry,
    Redo,
    Raise,
    Throw,
}

/// Call-site flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallFlags(pub u32);

impl CallFlags {
    /// Receiver is implicit self; private methods are callable.
    pub const FCALL: u32 = 0x01;
    /// Bare identifier that may also be a local.
    pub const VCALL: u32 = 0x02;
    /// Last argument is an array to splat.
    pub const ARGS_SPLAT: u32 = 0x04;
    /// Last argument is a proc passed as the block.
    pub const ARGS_BLOCKARG: u32 = 0x08;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Events attached to an instruction position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFlags(pub u32);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const LINE: EventFlags = EventFlags(0x0001);
    pub const CLASS: EventFlags = EventFlags(0x0002);
    pub const END: EventFlags = EventFlags(0x0004);
    pub const CALL: EventFlags = EventFlags(0x0008);
    pub const RETURN: EventFlags = EventFlags(0x0010);
    pub const RAISE: EventFlags = EventFlags(0x0080);
    pub const B_CALL: EventFlags = EventFlags(0x0100);
    pub const B_RETURN: EventFlags = EventFlags(0x0200);
    pub const COVERAGE_LINE: EventFlags = EventFlags(0x1_0000);

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventFlags, &str); 9] = [
            (EventFlags::LINE, "line"),
            (EventFlags::CLASS, "class"),
            (EventFlags::END, "end"),
            (EventFlags::CALL, "call"),
            (EventFlags::RETURN, "return"),
            (EventFlags::RAISE, "raise"),
            (EventFlags::B_CALL, "b_call"),
            (EventFlags::B_RETURN, "b_return"),
            (EventFlags::COVERAGE_LINE, "coverage"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// Line/event annotation of one position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub pos: usize,
    pub line: u32,
    #[serde(default)]
    pub events: EventFlags,
}

/// Kind of catch-table region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchKind {
    Rescue,
    Ensure,
    Retry,
    Break,
    Redo,
    Next,
}

impl CatchKind {
    /// Regions whose continuation receives the thrown value on the stack.
    pub fn pushes_value(self) -> bool {
        matches!(self, CatchKind::Rescue | CatchKind::Next | CatchKind::Break)
    }
}

/// Exception region: covers `start..end`, resumes at `cont` with `depth`
/// live stack slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchEntry {
    pub kind: CatchKind,
    pub start: usize,
    pub end: usize,
    pub cont: usize,
    pub depth: i32,
    /// Child routine run when the region catches (rescue/ensure bodies)
    #[serde(default)]
    pub iseq: Option<usize>,
}

/// One arm of an `opt_case_dispatch` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArm {
    pub key: Literal,
    pub offset: i32,
}

/// Parameter description
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Number of required leading parameters
    pub lead: u32,
    /// Entry positions for 0, 1, ... supplied optional arguments.
    /// Empty when the routine has no optional parameters.
    pub opt_table: Vec<usize>,
    /// Local index of the rest parameter
    pub rest: Option<u32>,
    /// Local index of the `&block` parameter
    pub block: Option<u32>,
}

impl Params {
    /// Number of optional parameters
    pub fn opt_count(&self) -> u32 {
        self.opt_table.len().saturating_sub(1) as u32
    }
}

/// Stack bytecode instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StackInsn {
    // ===== Locals and variables =====
    Nop,
    GetLocal { idx: u32, #[serde(default)] level: u32 },
    SetLocal { idx: u32, #[serde(default)] level: u32 },
    GetIvar { name: String },
    SetIvar { name: String },
    GetCvar { name: String },
    SetCvar { name: String },
    GetGlobal { name: String },
    SetGlobal { name: String },
    /// Pops the scope (nil for lexical lookup), pushes the constant
    GetConstant { name: String },
    /// Pops the scope (on top) and the value beneath it
    SetConstant { name: String },
    /// Pushes the cached value and jumps if the cache is valid
    GetInlineCache { offset: i32, ic: u32 },
    SetInlineCache { ic: u32 },
    /// Evaluates a child routine once per site
    Once { iseq: usize, ic: u32 },

    // ===== Literals =====
    PutNil,
    PutSelf,
    PutObject { value: Literal },
    /// Pushes a fresh copy of a string literal
    PutString { value: String },
    DupArray { values: Vec<Literal> },

    // ===== Calls =====
    Send {
        name: String,
        argc: u32,
        #[serde(default)]
        flags: CallFlags,
        #[serde(default)]
        block: Option<usize>,
    },
    InvokeSuper {
        argc: u32,
        #[serde(default)]
        flags: CallFlags,
        #[serde(default)]
        block: Option<usize>,
    },
    InvokeBlock { argc: u32 },
    Leave,
    Throw { kind: ThrowKind },

    // ===== Branches =====
    Jump { offset: i32 },
    BranchIf { offset: i32 },
    BranchUnless { offset: i32 },
    BranchNil { offset: i32 },
    OptCaseDispatch { table: Vec<CaseArm>, else_offset: i32 },

    // ===== Specialized operators =====
    OptPlus,
    OptMinus,
    OptMult,
    OptDiv,
    OptMod,
    OptEq,
    OptNeq,
    OptLt,
    OptLe,
    OptGt,
    OptGe,
    OptLtlt,
    OptAnd,
    OptOr,
    OptAref,
    OptAset,
    OptLength,
    OptSize,
    OptEmptyP,
    OptSucc,
    OptNot,

    // ===== Object construction =====
    NewArray { count: u32 },
    NewHash { count: u32 },
    NewRange { #[serde(default)] exclude_end: bool },
    /// Pops an array, pushes `num` elements (first element on top) and,
    /// with `flag & 1`, the remaining elements as an array beneath them.
    ExpandArray { num: u32, #[serde(default)] flag: u32 },
    SplatArray { #[serde(default)] dup: bool },
    ConcatArray,
    ConcatStrings { count: u32 },
    ToString,

    // ===== Definitions and checks =====
    /// Pops the scope and the superclass, pushes the class body result
    DefineClass { name: String, iseq: usize, #[serde(default)] module: bool },
    DefineMethod { name: String, iseq: usize },
    /// Pops the receiver whose singleton gets the method
    DefineSMethod { name: String, iseq: usize },
    Defined {
        kind: DefinedKind,
        #[serde(default)]
        name: Option<String>,
        message: String,
    },
    /// Pops target and pattern, pushes `pattern === target`
    CheckMatch { #[serde(default)] array: bool },
    TraceCoverage { line: u32 },

    // ===== Stack manipulation =====
    Pop,
    Dup,
    DupN { n: u32 },
    Swap,
    Reverse { n: u32 },
    TopN { n: u32 },
    SetN { n: u32 },
    AdjustStack { n: u32 },
}

impl StackInsn {
    /// Number of values popped and pushed.
    pub fn stack_effect(&self) -> (usize, usize) {
        use StackInsn::*;
        match self {
            Nop | Jump { .. } | TraceCoverage { .. } => (0, 0),
            GetLocal { .. } | GetIvar { .. } | GetCvar { .. } | GetGlobal { .. } => (0, 1),
            SetLocal { .. } | SetIvar { .. } | SetCvar { .. } | SetGlobal { .. } => (1, 0),
            GetConstant { .. } => (1, 1),
            SetConstant { .. } => (2, 0),
            GetInlineCache { .. } | Once { .. } => (0, 1),
            SetInlineCache { .. } => (1, 1),
            PutNil | PutSelf | PutObject { .. } | PutString { .. } | DupArray { .. } => (0, 1),
            Send { argc, .. } | InvokeSuper { argc, .. } => (*argc as usize + 1, 1),
            InvokeBlock { argc } => (*argc as usize, 1),
            Leave => (1, 0),
            Throw { .. } => (1, 1),
            BranchIf { .. } | BranchUnless { .. } | BranchNil { .. } => (1, 0),
            OptCaseDispatch { .. } => (1, 0),
            OptPlus | OptMinus | OptMult | OptDiv | OptMod | OptEq | OptNeq | OptLt | OptLe
            | OptGt | OptGe | OptLtlt | OptAnd | OptOr | OptAref => (2, 1),
            OptAset => (3, 1),
            OptLength | OptSize | OptEmptyP | OptSucc | OptNot => (1, 1),
            NewArray { count } | NewHash { count } | ConcatStrings { count } => {
                (*count as usize, 1)
            }
            NewRange { .. } | ConcatArray => (2, 1),
            ExpandArray { num, flag } => (1, *num as usize + (*flag & 1) as usize),
            SplatArray { .. } | ToString => (1, 1),
            DefineClass { .. } => (2, 1),
            DefineMethod { .. } => (0, 1),
            DefineSMethod { .. } => (1, 1),
            Defined { .. } => (1, 1),
            CheckMatch { .. } => (2, 1),
            Pop => (1, 0),
            Dup => (1, 2),
            DupN { n } => (*n as usize, 2 * *n as usize),
            Swap => (2, 2),
            Reverse { n } => (*n as usize, *n as usize),
            TopN { n } => (*n as usize + 1, *n as usize + 2),
            SetN { n } => (*n as usize + 1, *n as usize + 1),
            AdjustStack { n } => (*n as usize, 0),
        }
    }

    /// Minimum stack depth needed before executing this instruction.
    pub fn required_depth(&self) -> usize {
        self.stack_effect().0
    }

    /// Depth after executing at depth `depth` (which must be at least
    /// [`required_depth`](Self::required_depth)).
    pub fn depth_after(&self, depth: usize) -> usize {
        let (pops, pushes) = self.stack_effect();
        depth - pops + pushes
    }

    /// Relative offset of a jump, conditional branch or inline-cache hit.
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            StackInsn::Jump { offset }
            | StackInsn::BranchIf { offset }
            | StackInsn::BranchUnless { offset }
            | StackInsn::BranchNil { offset }
            | StackInsn::GetInlineCache { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Control never falls through to the next position.
    pub fn ends_block(&self) -> bool {
        matches!(self, StackInsn::Jump { .. } | StackInsn::Leave)
    }

    /// Child routine referenced by this instruction.
    pub fn child_iseq(&self) -> Option<usize> {
        match self {
            StackInsn::Send { block, .. } | StackInsn::InvokeSuper { block, .. } => *block,
            StackInsn::Once { iseq, .. }
            | StackInsn::DefineClass { iseq, .. }
            | StackInsn::DefineMethod { iseq, .. }
            | StackInsn::DefineSMethod { iseq, .. } => Some(*iseq),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        use StackInsn::*;
        match self {
            Nop => "nop",
            GetLocal { .. } => "getlocal",
            SetLocal { .. } => "setlocal",
            GetIvar { .. } => "getinstancevariable",
            SetIvar { .. } => "setinstancevariable",
            GetCvar { .. } => "getclassvariable",
            SetCvar { .. } => "setclassvariable",
            GetGlobal { .. } => "getglobal",
            SetGlobal { .. } => "setglobal",
            GetConstant { .. } => "getconstant",
            SetConstant { .. } => "setconstant",
            GetInlineCache { .. } => "getinlinecache",
            SetInlineCache { .. } => "setinlinecache",
            Once { .. } => "once",
            PutNil => "putnil",
            PutSelf => "putself",
            PutObject { .. } => "putobject",
            PutString { .. } => "putstring",
            DupArray { .. } => "duparray",
            Send { .. } => "send",
            InvokeSuper { .. } => "invokesuper",
            InvokeBlock { .. } => "invokeblock",
            Leave => "leave",
            Throw { .. } => "throw",
            Jump { .. } => "jump",
            BranchIf { .. } => "branchif",
            BranchUnless { .. } => "branchunless",
            BranchNil { .. } => "branchnil",
            OptCaseDispatch { .. } => "opt_case_dispatch",
            OptPlus => "opt_plus",
            OptMinus => "opt_minus",
            OptMult => "opt_mult",
            OptDiv => "opt_div",
            OptMod => "opt_mod",
            OptEq => "opt_eq",
            OptNeq => "opt_neq",
            OptLt => "opt_lt",
            OptLe => "opt_le",
            OptGt => "opt_gt",
            OptGe => "opt_ge",
            OptLtlt => "opt_ltlt",
            OptAnd => "opt_and",
            OptOr => "opt_or",
            OptAref => "opt_aref",
            OptAset => "opt_aset",
            OptLength => "opt_length",
            OptSize => "opt_size",
            OptEmptyP => "opt_empty_p",
            OptSucc => "opt_succ",
            OptNot => "opt_not",
            NewArray { .. } => "newarray",
            NewHash { .. } => "newhash",
            NewRange { .. } => "newrange",
            ExpandArray { .. } => "expandarray",
            SplatArray { .. } => "splatarray",
            ConcatArray => "concatarray",
            ConcatStrings { .. } => "concatstrings",
            ToString => "tostring",
            DefineClass { .. } => "defineclass",
            DefineMethod { .. } => "definemethod",
            DefineSMethod { .. } => "definesmethod",
            Defined { .. } => "defined",
            CheckMatch { .. } => "checkmatch",
            TraceCoverage { .. } => "tracecoverage",
            Pop => "pop",
            Dup => "dup",
            DupN { .. } => "dupn",
            Swap => "swap",
            Reverse { .. } => "reverse",
            TopN { .. } => "topn",
            SetN { .. } => "setn",
            AdjustStack { .. } => "adjuststack",
        }
    }
}

/// A routine of stack bytecode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iseq {
    pub name: String,
    #[serde(default)]
    pub kind: IseqKind,
    #[serde(default)]
    pub local_table: Vec<String>,
    #[serde(default)]
    pub params: Params,
    pub insns: Vec<StackInsn>,
    #[serde(default)]
    pub catch_table: Vec<CatchEntry>,
    /// Sorted by position
    #[serde(default)]
    pub events: Vec<EventEntry>,
    /// Blocks, method bodies, class bodies and rescue/ensure bodies
    #[serde(default)]
    pub children: Vec<Iseq>,
}

impl Iseq {
    pub fn new(name: impl Into<String>, kind: IseqKind, insns: Vec<StackInsn>) -> Self {
        Self {
            name: name.into(),
            kind,
            local_table: Vec::new(),
            params: Params::default(),
            insns,
            catch_table: Vec::new(),
            events: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_locals(mut self, names: &[&str]) -> Self {
        self.local_table = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Target position of a branch at `pos` with relative `offset`.
    pub fn branch_target(pos: usize, offset: i32) -> Option<usize> {
        let target = pos as i64 + 1 + offset as i64;
        usize::try_from(target).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stack_effects() {
        assert_eq!(StackInsn::OptPlus.stack_effect(), (2, 1));
        assert_eq!(
            StackInsn::Send {
                name: "foo".into(),
                argc: 2,
                flags: CallFlags::default(),
                block: None
            }
            .stack_effect(),
            (3, 1)
        );
        assert_eq!(StackInsn::ExpandArray { num: 2, flag: 1 }.stack_effect(), (1, 3));
        assert_eq!(StackInsn::DupN { n: 2 }.depth_after(3), 5);
        assert_eq!(StackInsn::SetN { n: 1 }.depth_after(3), 3);
    }

    #[test]
    fn test_branch_target_is_relative_to_next_insn() {
        assert_eq!(Iseq::branch_target(3, 2), Some(6));
        assert_eq!(Iseq::branch_target(3, -4), Some(0));
        assert_eq!(Iseq::branch_target(0, -2), None);
    }

    #[test]
    fn test_json_round_trip() {
        let text = r#"{
            "name": "<main>",
            "local_table": ["a"],
            "insns": [
                {"op": "get_local", "idx": 0},
                {"op": "put_object", "value": {"int": 1}},
                {"op": "opt_plus"},
                {"op": "leave"}
            ],
            "events": [{"pos": 0, "line": 1, "events": 1}]
        }"#;
        let iseq = Iseq::from_json(text).unwrap();
        assert_eq!(iseq.insns.len(), 4);
        assert_eq!(iseq.insns[0], StackInsn::GetLocal { idx: 0, level: 0 });
        assert_eq!(iseq.events[0].events, EventFlags::LINE);

        let again = Iseq::from_json(&iseq.to_json().unwrap()).unwrap();
        assert_eq!(again, iseq);
    }

    #[test]
    fn test_literal_identity() {
        assert!(Literal::Int(0).same(&Literal::Int(0)));
        assert!(!Literal::Float(0.0).same(&Literal::Float(-0.0)));
        assert!(Literal::Int(3).is_fixnum());
        assert!(!Literal::Int(i64::MAX).is_fixnum());
    }

    #[test]
    fn test_event_flags_display() {
        assert_eq!((EventFlags::LINE | EventFlags::CALL).to_string(), "line,call");
        assert_eq!(EventFlags::NONE.to_string(), "-");
    }
}
