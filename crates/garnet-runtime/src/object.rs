//! Object-model contract
//!
//! The dispatch loop never inspects classes, method tables or constants
//! directly. Everything goes through [`ObjectModel`], and validity of the
//! loop's caches is tracked by the monotone counters in [`GlobalState`].

use crate::rtl::Routine;
use crate::value::{ClassId, CoreKind, Symbol, Value};
use crate::vm::frame::{Block, Env};
use crate::vm::{Vm, VmError};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Operations with an inlined fast path in the instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BasicOp {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Ltlt,
    And,
    Or,
    Aref,
    Aset,
    Length,
    Size,
    EmptyP,
    Succ,
    Not,
    Eqq,
}

impl BasicOp {
    pub const COUNT: usize = 22;

    pub const ALL: [BasicOp; BasicOp::COUNT] = [
        BasicOp::Plus,
        BasicOp::Minus,
        BasicOp::Mult,
        BasicOp::Div,
        BasicOp::Mod,
        BasicOp::Eq,
        BasicOp::Neq,
        BasicOp::Lt,
        BasicOp::Le,
        BasicOp::Gt,
        BasicOp::Ge,
        BasicOp::Ltlt,
        BasicOp::And,
        BasicOp::Or,
        BasicOp::Aref,
        BasicOp::Aset,
        BasicOp::Length,
        BasicOp::Size,
        BasicOp::EmptyP,
        BasicOp::Succ,
        BasicOp::Not,
        BasicOp::Eqq,
    ];

    /// Method name implementing the operation.
    pub fn method_name(self) -> &'static str {
        match self {
            BasicOp::Plus => "+",
            BasicOp::Minus => "-",
            BasicOp::Mult => "*",
            BasicOp::Div => "/",
            BasicOp::Mod => "%",
            BasicOp::Eq => "==",
            BasicOp::Neq => "!=",
            BasicOp::Lt => "<",
            BasicOp::Le => "<=",
            BasicOp::Gt => ">",
            BasicOp::Ge => ">=",
            BasicOp::Ltlt => "<<",
            BasicOp::And => "&",
            BasicOp::Or => "|",
            BasicOp::Aref => "[]",
            BasicOp::Aset => "[]=",
            BasicOp::Length => "length",
            BasicOp::Size => "size",
            BasicOp::EmptyP => "empty?",
            BasicOp::Succ => "succ",
            BasicOp::Not => "!",
            BasicOp::Eqq => "===",
        }
    }

    pub fn from_method_name(name: &str) -> Option<BasicOp> {
        BasicOp::ALL
            .iter()
            .copied()
            .find(|op| op.method_name() == name)
    }
}

/// Process-wide generation counters and redefinition flags.
///
/// Counters only grow. Writers publish with `Release`, readers observe
/// with `Acquire`, so a cache stamped with an older generation is never
/// mistaken for a current one.
#[derive(Debug)]
pub struct GlobalState {
    method_generation: AtomicU64,
    constant_generation: AtomicU64,
    redefined: [AtomicU32; BasicOp::COUNT],
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            method_generation: AtomicU64::new(1),
            constant_generation: AtomicU64::new(1),
            redefined: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub fn method_generation(&self) -> u64 {
        self.method_generation.load(Ordering::Acquire)
    }

    pub fn constant_generation(&self) -> u64 {
        self.constant_generation.load(Ordering::Acquire)
    }

    /// Invalidate every call-site cache.
    pub fn bump_method_generation(&self) {
        self.method_generation.fetch_add(1, Ordering::Release);
    }

    /// Invalidate every constant cache.
    pub fn bump_constant_generation(&self) {
        self.constant_generation.fetch_add(1, Ordering::Release);
    }

    /// Record that `op` was redefined for `kind`. Never undone.
    pub fn redefine(&self, op: BasicOp, kind: CoreKind) {
        self.redefined[op as usize].fetch_or(kind.bit(), Ordering::Release);
        self.bump_method_generation();
    }

    /// True while the builtin `op` of `kind` is still in effect.
    #[inline]
    pub fn unredefined(&self, op: BasicOp, kind: CoreKind) -> bool {
        self.redefined[op as usize].load(Ordering::Acquire) & kind.bit() == 0
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments handed to a native method.
pub struct NativeCall<'a> {
    pub name: &'a Symbol,
    pub recv: &'a Value,
    pub args: &'a [Value],
    pub block: Option<&'a Block>,
}

/// Native method implementation
pub type NativeFn = Arc<dyn Fn(&mut Vm, NativeCall<'_>) -> Result<Value, VmError> + Send + Sync>;

#[derive(Clone)]
pub enum MethodBody {
    /// Interpreted method
    Routine(Arc<Routine>),
    Native(NativeFn),
    AttrReader(Symbol),
    AttrWriter(Symbol),
}

/// A resolved method
#[derive(Clone)]
pub struct MethodEntry {
    /// Class the method was found in (the start point for `super`)
    pub owner: ClassId,
    pub name: Symbol,
    pub body: MethodBody,
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.body {
            MethodBody::Routine(_) => "routine",
            MethodBody::Native(_) => "native",
            MethodBody::AttrReader(_) => "attr_reader",
            MethodBody::AttrWriter(_) => "attr_writer",
        };
        write!(f, "MethodEntry({}#{} {})", self.owner.0, self.name, kind)
    }
}

/// What `defined?` asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinedKind {
    Ivar,
    Gvar,
    Cvar,
    Const,
    Method,
    Yield,
    Expr,
}

/// Object-model contract consumed by the dispatch loop
///
/// Implementations use interior mutability: the loop holds the model
/// behind an `Arc` and only ever takes `&self`.
pub trait ObjectModel: Send + Sync {
    /// Counters shared with every cache stamp.
    fn global_state(&self) -> &Arc<GlobalState>;

    fn class_of(&self, value: &Value) -> ClassId;

    fn class_name(&self, class: ClassId) -> String;

    /// Root of the lexical scope chain.
    fn object_class(&self) -> ClassId;

    fn is_kind_of(&self, value: &Value, class: ClassId) -> bool;

    /// Full method resolution along the ancestor chain.
    fn find_method(&self, class: ClassId, name: &Symbol) -> Option<MethodEntry>;

    /// Resolution starting after `owner` in the ancestor chain of `class`.
    fn find_super_method(&self, class: ClassId, owner: ClassId, name: &Symbol)
        -> Option<MethodEntry>;

    fn define_method(&self, class: ClassId, name: Symbol, body: MethodBody);

    /// Slot index of an instance variable for instances of `class`.
    ///
    /// Returns `None` for an unknown name unless `create` is set.
    fn ivar_index(&self, class: ClassId, name: &Symbol, create: bool) -> Option<usize>;

    /// Instance variables of receivers without slots (classes, immediates).
    fn generic_ivar_get(&self, recv: &Value, name: &Symbol) -> Option<Value>;

    fn generic_ivar_set(&self, recv: &Value, name: Symbol, value: Value) -> Result<(), String>;

    /// Lexical-then-ancestor constant lookup from `scope`.
    fn get_const(&self, scope: ClassId, name: &Symbol) -> Option<Value>;

    /// Constant lookup restricted to `base` and its ancestors.
    fn get_const_under(&self, base: ClassId, name: &Symbol) -> Option<Value>;

    fn set_const(&self, scope: ClassId, name: Symbol, value: Value);

    fn get_global(&self, name: &Symbol) -> Value;

    fn set_global(&self, name: Symbol, value: Value);

    fn get_cvar(&self, scope: ClassId, name: &Symbol) -> Option<Value>;

    fn set_cvar(&self, scope: ClassId, name: Symbol, value: Value);

    /// Open an existing class or create a new one under `scope`.
    fn open_class(
        &self,
        scope: ClassId,
        name: &Symbol,
        superclass: Option<ClassId>,
        module: bool,
    ) -> Result<ClassId, String>;

    fn singleton_class(&self, value: &Value) -> Result<ClassId, String>;

    /// Allocate an exception of the named core class.
    fn make_exception(&self, class_name: &str, message: &str) -> Value;

    fn exception_message(&self, exception: &Value) -> String;

    /// Is `value` an exception instance?
    fn is_exception(&self, value: &Value) -> bool;

    fn inspect(&self, value: &Value) -> String;

    /// Called whenever a value is stored into a captured environment.
    fn write_barrier(&self, _env: &Env, _value: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redefinition_flags_are_per_kind() {
        let state = GlobalState::new();
        let before = state.method_generation();
        assert!(state.unredefined(BasicOp::Plus, CoreKind::Integer));

        state.redefine(BasicOp::Plus, CoreKind::Integer);

        assert!(!state.unredefined(BasicOp::Plus, CoreKind::Integer));
        assert!(state.unredefined(BasicOp::Plus, CoreKind::Float));
        assert!(state.unredefined(BasicOp::Minus, CoreKind::Integer));
        assert!(state.method_generation() > before);
    }

    #[test]
    fn test_basic_op_names_round_trip() {
        for op in BasicOp::ALL {
            assert_eq!(BasicOp::from_method_name(op.method_name()), Some(op));
        }
    }
}
