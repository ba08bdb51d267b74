//! Activation records
//!
//! All frames of one thread of control live in a [`FrameStack`]: a vector
//! of frame records plus one arena of value cells. A frame owns a window of
//! the arena:
//!
//! ```text
//! locals_start            base      base + 1              sp
//! | l0 | l1 | ... | lN-1 | ---- | t0 | t1 | ... | tM-1 |
//! ```
//!
//! Temporaries always live in the arena. Locals start there too
//! ([`LocalsMode::Base`]); once a closure captures them they move to a
//! heap [`Env`] shared with the closure ([`LocalsMode::Env`]) and the
//! arena cells go unused. Up-level locals are reached through the frame's
//! `outer` environment chain.
//!
//! The stack pointer of a frame stays at `base + 1 + temp_count` whenever
//! control may leave the instruction set.

use crate::object::ObjectModel;
use crate::rtl::Routine;
use crate::value::{ClassId, Symbol, Value};
use crate::vm::VmError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Heap-allocated locals of a frame captured by a closure.
pub struct Env {
    values: Mutex<Vec<Value>>,
    parent: Option<Arc<Env>>,
}

impl Env {
    pub fn new(values: Vec<Value>, parent: Option<Arc<Env>>) -> Self {
        Self {
            values: Mutex::new(values),
            parent,
        }
    }

    pub fn get(&self, idx: usize) -> Value {
        self.values.lock().get(idx).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&self, idx: usize, value: Value) {
        let mut values = self.values.lock();
        if values.len() <= idx {
            values.resize(idx + 1, Value::Nil);
        }
        values[idx] = value;
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parent(&self) -> Option<&Arc<Env>> {
        self.parent.as_ref()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("len", &self.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Where a frame keeps its locals. Resolved once per access, never
/// switches back once a closure captured the frame.
#[derive(Debug, Clone)]
pub enum LocalsMode {
    /// In the arena at `locals_start`
    Base,
    /// In a captured environment
    Env(Arc<Env>),
}

/// Method a frame executes, for `super`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub owner: ClassId,
    pub name: Symbol,
}

/// A block literal bound to the frame that created it
#[derive(Clone)]
pub struct Block {
    pub routine: Arc<Routine>,
    pub self_value: Value,
    /// Locals of the creating frame
    pub outer: Arc<Env>,
    pub cref: ClassId,
    /// Frame that created the block; target of `break`
    pub home: u64,
    /// Method frame a `return` inside the block leaves
    pub method_home: Option<u64>,
    pub method: Option<MethodInfo>,
    /// Block of the enclosing method, for `yield` inside the block
    pub yield_block: Option<Arc<Block>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("routine", &self.routine.name)
            .field("home", &self.home)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Top,
    Method,
    Block,
    Class,
    /// Rescue or ensure body run by the unwinder
    Handler,
    /// Body of a `run_once` site
    Once,
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// The caller is native code: returning from this frame ends the
    /// current dispatch loop.
    pub const FINISH: u8 = 0x01;
    /// The accelerator gave up on this frame's routine, or on a caller's.
    /// Methods entered from such a frame are not offered to it.
    pub const CANCEL: u8 = 0x02;

    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }
}

/// Conditional branch taken in the caller once an operator call returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchOnReturn {
    pub when: bool,
    pub target: usize,
}

/// What happens in the caller when a frame returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReturnTo {
    /// Caller pc to resume at
    pub pc: usize,
    /// Caller temporary receiving the result
    pub slot: Option<u32>,
    pub branch: Option<BranchOnReturn>,
    /// `run_once` cache of the caller to fill with the result
    pub once: Option<u32>,
}

/// One activation record
#[derive(Debug)]
pub struct Frame {
    /// Unique for the lifetime of the frame stack
    pub id: u64,
    pub routine: Arc<Routine>,
    pub pc: usize,
    pub locals_start: usize,
    /// Reserved cell between locals and temporaries
    pub base: usize,
    pub sp: usize,
    pub locals: LocalsMode,
    /// Environment of the lexically enclosing frame
    pub outer: Option<Arc<Env>>,
    pub self_value: Value,
    /// Lexical class scope for constants, class variables and `def`
    pub cref: ClassId,
    pub kind: FrameKind,
    /// Block available to `yield`
    pub block: Option<Arc<Block>>,
    pub method: Option<MethodInfo>,
    pub method_home: Option<u64>,
    pub break_home: Option<u64>,
    pub lambda: bool,
    pub ret: ReturnTo,
    /// Signal re-thrown when an ensure handler completes
    pub pending: Option<VmError>,
    pub flags: FrameFlags,
}

impl Frame {
    /// First temporary cell
    #[inline]
    pub fn temps_start(&self) -> usize {
        self.base + 1
    }

    /// Stack pointer position outside of calls
    #[inline]
    pub fn default_sp(&self) -> usize {
        self.base + 1 + self.routine.temp_count as usize
    }

    pub fn end(&self) -> usize {
        self.locals_start + self.routine.frame_size()
    }

    /// Environment `level` steps out (level 1 is the enclosing frame).
    pub fn env_at(&self, level: u32) -> Option<Arc<Env>> {
        let mut env = self.outer.clone()?;
        for _ in 1..level {
            env = env.parent()?.clone();
        }
        Some(env)
    }
}

/// Description of a frame to push
#[derive(Debug)]
pub struct FrameSpec {
    pub routine: Arc<Routine>,
    pub kind: FrameKind,
    pub self_value: Value,
    pub cref: ClassId,
    pub outer: Option<Arc<Env>>,
    pub block: Option<Arc<Block>>,
    pub method: Option<MethodInfo>,
    pub method_home: Option<u64>,
    pub break_home: Option<u64>,
    pub lambda: bool,
    pub ret: ReturnTo,
    pub pc: usize,
}

impl FrameSpec {
    pub fn new(routine: Arc<Routine>, kind: FrameKind, self_value: Value, cref: ClassId) -> Self {
        Self {
            routine,
            kind,
            self_value,
            cref,
            outer: None,
            block: None,
            method: None,
            method_home: None,
            break_home: None,
            lambda: false,
            ret: ReturnTo::default(),
            pc: 0,
        }
    }
}

/// Frames plus their register arena
#[derive(Debug, Default)]
pub struct FrameStack {
    cells: Vec<Value>,
    frames: Vec<Frame>,
    next_id: u64,
}

impl FrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Is a frame with this id still live?
    pub fn contains(&self, id: u64) -> bool {
        self.frames.iter().any(|f| f.id == id)
    }

    /// Push a frame above the current one, with `args` as its first
    /// locals. Returns the new frame's id.
    pub fn push(&mut self, spec: FrameSpec, locals: &[Value]) -> u64 {
        let locals_start = self.frames.last().map_or(0, Frame::end);
        let local_size = spec.routine.local_size() as usize;
        let base = locals_start + local_size;
        let end = locals_start + spec.routine.frame_size();
        if self.cells.len() < end {
            self.cells.resize(end, Value::Nil);
        }
        for (i, cell) in self.cells[locals_start..end].iter_mut().enumerate() {
            *cell = locals.get(i).filter(|_| i < local_size).cloned().unwrap_or(Value::Nil);
        }

        self.next_id += 1;
        let id = self.next_id;
        let temp_count = spec.routine.temp_count as usize;
        let is_method = matches!(spec.kind, FrameKind::Method | FrameKind::Top) || spec.lambda;
        self.frames.push(Frame {
            id,
            pc: spec.pc,
            locals_start,
            base,
            sp: base + 1 + temp_count,
            locals: LocalsMode::Base,
            outer: spec.outer,
            self_value: spec.self_value,
            cref: spec.cref,
            kind: spec.kind,
            block: spec.block,
            method: spec.method,
            method_home: if is_method { Some(id) } else { spec.method_home },
            break_home: spec.break_home,
            lambda: spec.lambda,
            ret: spec.ret,
            pending: None,
            flags: FrameFlags::default(),
            routine: spec.routine,
        });
        id
    }

    /// Pop the current frame, releasing its cells.
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.cells.truncate(frame.locals_start);
        Some(frame)
    }

    // ------------------------------------------------------------------
    // Register access for the current frame
    // ------------------------------------------------------------------

    #[inline]
    fn top(&self) -> &Frame {
        // Only called while executing a frame
        &self.frames[self.frames.len() - 1]
    }

    #[inline]
    pub fn temp(&self, t: u32) -> Value {
        let frame = self.top();
        self.cells[frame.temps_start() + t as usize].clone()
    }

    #[inline]
    pub fn set_temp(&mut self, t: u32, value: Value) {
        let idx = self.top().temps_start() + t as usize;
        self.cells[idx] = value;
    }

    /// Temporaries `start .. start + count` of the current frame.
    pub fn temps(&self, start: u32, count: u32) -> &[Value] {
        let first = self.top().temps_start() + start as usize;
        &self.cells[first..first + count as usize]
    }

    pub fn temps_mut(&mut self, start: u32, count: u32) -> &mut [Value] {
        let first = self.top().temps_start() + start as usize;
        &mut self.cells[first..first + count as usize]
    }

    pub fn local(&self, idx: u32) -> Value {
        let frame = self.top();
        match &frame.locals {
            LocalsMode::Base => self.cells[frame.locals_start + idx as usize].clone(),
            LocalsMode::Env(env) => env.get(idx as usize),
        }
    }

    pub fn set_local(&mut self, idx: u32, value: Value, host: &dyn ObjectModel) {
        let frame = self.top();
        let cell = frame.locals_start + idx as usize;
        match frame.locals.clone() {
            LocalsMode::Base => self.cells[cell] = value,
            LocalsMode::Env(env) => {
                host.write_barrier(&env, &value);
                env.set(idx as usize, value);
            }
        }
    }

    /// Up-level local `idx` at nesting `level` (at least 1).
    pub fn up_local(&self, idx: u32, level: u32) -> Option<Value> {
        self.top().env_at(level).map(|env| env.get(idx as usize))
    }

    pub fn set_up_local(
        &mut self,
        idx: u32,
        level: u32,
        value: Value,
        host: &dyn ObjectModel,
    ) -> bool {
        match self.top().env_at(level) {
            Some(env) => {
                host.write_barrier(&env, &value);
                env.set(idx as usize, value);
                true
            }
            None => false,
        }
    }

    /// Move the current frame's locals into a heap environment (once) and
    /// return it.
    pub fn capture_env(&mut self) -> Option<Arc<Env>> {
        let frame = self.frames.last()?;
        if let LocalsMode::Env(env) = &frame.locals {
            return Some(env.clone());
        }
        let values = self.cells[frame.locals_start..frame.base].to_vec();
        let env = Arc::new(Env::new(values, frame.outer.clone()));
        if let Some(frame) = self.frames.last_mut() {
            frame.locals = LocalsMode::Env(env.clone());
        }
        Some(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::{Iseq, IseqKind, StackInsn};
    use crate::translate::{translate, TranslateOptions};
    use pretty_assertions::assert_eq;

    fn routine(locals: &[&str]) -> Arc<Routine> {
        let iseq = Iseq::new(
            "r",
            IseqKind::Method,
            vec![
                StackInsn::PutNil,
                StackInsn::PutNil,
                StackInsn::Pop,
                StackInsn::Leave,
            ],
        )
        .with_locals(locals);
        translate(&iseq, &TranslateOptions::default()).unwrap()
    }

    fn spec(routine: Arc<Routine>) -> FrameSpec {
        FrameSpec::new(routine, FrameKind::Method, Value::Nil, ClassId(0))
    }

    #[test]
    fn test_frames_are_laid_out_back_to_back() {
        let mut stack = FrameStack::new();
        let r = routine(&["a", "b"]);
        stack.push(spec(r.clone()), &[Value::int(1), Value::int(2)]);
        let first = stack.current().unwrap();
        assert_eq!(first.locals_start, 0);
        assert_eq!(first.base, 2);
        assert_eq!(first.sp, first.default_sp());
        let end = first.end();

        stack.push(spec(r), &[Value::int(3)]);
        let second = stack.current().unwrap();
        assert_eq!(second.locals_start, end);
        assert_eq!(stack.local(0).as_fixnum(), Some(3));
        assert!(stack.local(1).is_nil());

        stack.pop();
        assert_eq!(stack.local(1).as_fixnum(), Some(2));
    }

    #[test]
    fn test_captured_locals_are_shared() {
        let mut stack = FrameStack::new();
        stack.push(spec(routine(&["a"])), &[Value::int(1)]);

        let env = stack.capture_env().unwrap();
        assert_eq!(env.get(0).as_fixnum(), Some(1));
        env.set(0, Value::int(5));
        assert_eq!(stack.local(0).as_fixnum(), Some(5));

        // A second capture hands out the same environment
        let again = stack.capture_env().unwrap();
        assert!(Arc::ptr_eq(&env, &again));
    }

    #[test]
    fn test_env_chain_levels() {
        let outer = Arc::new(Env::new(vec![Value::int(1)], None));
        let inner = Arc::new(Env::new(vec![Value::int(2)], Some(outer)));
        let mut stack = FrameStack::new();
        let mut s = spec(routine(&[]));
        s.outer = Some(inner);
        stack.push(s, &[]);

        assert_eq!(stack.up_local(0, 1).unwrap().as_fixnum(), Some(2));
        assert_eq!(stack.up_local(0, 2).unwrap().as_fixnum(), Some(1));
        assert!(stack.up_local(0, 3).is_none());
    }
}
