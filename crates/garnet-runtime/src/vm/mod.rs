//! Register-machine dispatch loop
//!
//! [`Vm`] executes translated [`Routine`]s on a [`FrameStack`]. Calls into
//! interpreted code push a frame and continue in the same loop (a
//! trampoline); only natives that yield back into blocks nest a second
//! loop, whose entry frame carries the FINISH flag.
//!
//! Handlers return a [`Step`] telling the loop how to continue. A
//! speculative instruction whose assumption fails asks for a deopt: the
//! loop stores the fallback variant into the instruction's cell and runs
//! the same pc again.

pub mod accel;
mod call;
mod dispatch;
pub mod frame;
pub mod interrupt;
mod ops;
pub mod profiler;
pub mod unwind;

pub use accel::{AccelOutcome, AccelRequest, Accelerator};
pub(crate) use call::arity_message;
pub use frame::{Block, Env, Frame, FrameKind, FrameStack};
pub use interrupt::{Interrupt, InterruptToken};
pub use profiler::{CacheKind, Profiler};
pub use unwind::{CatchTableUnwinder, Signal, Transfer, Unwinder};

use crate::iseq::{EventFlags, ThrowKind};
use crate::object::{GlobalState, ObjectModel};
use crate::rtl::{Insn, Routine, Variant, VariantCell};
use crate::translate::TranslateError;
use crate::value::{RObject, Value};
use frame::{FrameFlags, FrameSpec};
use garnet_config::VmSettings;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors leaving the dispatch loop
#[derive(Debug, Error)]
pub enum VmError {
    /// An exception escaped the outermost frame
    #[error("uncaught exception: {0:?}")]
    Raised(Value),

    /// A break/next/return/throw found no frame to land in
    #[error("uncaught {tag:?}: {value:?}")]
    Thrown {
        tag: ThrowKind,
        value: Value,
        /// Frame the signal is addressed to
        target: Option<u64>,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// Raised as SystemStackError when it reaches the unwinder
    #[error("stack level too deep ({depth} frames)")]
    StackOverflow { depth: usize },
}

/// Dispatch-loop knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmOptions {
    pub max_frames: usize,
    /// Let generic instructions rewrite themselves
    pub specialize: bool,
    pub profile: bool,
    pub check_interrupts: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self::from(&VmSettings::default())
    }
}

impl From<&VmSettings> for VmOptions {
    fn from(settings: &VmSettings) -> Self {
        Self {
            max_frames: settings.max_frames,
            specialize: settings.specialize,
            profile: settings.profile,
            check_interrupts: settings.check_interrupts,
        }
    }
}

/// How the loop continues after an instruction
#[derive(Debug)]
pub(crate) enum Step {
    Next,
    /// Relative to the next instruction
    Jump(i32),
    /// Absolute pc in the current frame
    Goto(usize),
    /// Store this variant and run the same pc again
    Deopt(Variant),
    /// A frame was pushed or popped; reload the current frame
    Reload,
    Return(Value),
}

/// An event reported to the hook
#[derive(Debug, Clone)]
pub struct TraceEvent<'a> {
    pub events: EventFlags,
    pub routine: &'a str,
    pub pc: usize,
    pub line: Option<u32>,
    pub depth: usize,
}

pub type EventHook = Box<dyn FnMut(&TraceEvent<'_>) + Send>;

/// Decides what a pending interrupt does. Returning an exception raises
/// it at the polling instruction.
pub type InterruptHandler = Arc<dyn Fn(&dyn ObjectModel, Interrupt) -> Option<Value> + Send + Sync>;

fn default_interrupt_handler() -> InterruptHandler {
    Arc::new(|host: &dyn ObjectModel, interrupt: Interrupt| match interrupt {
        Interrupt::Stop => Some(host.make_exception("Interrupt", "")),
        Interrupt::Timer | Interrupt::Custom(_) => None,
    })
}

/// Virtual machine state
pub struct Vm {
    host: Arc<dyn ObjectModel>,
    globals: Arc<GlobalState>,
    options: VmOptions,
    stack: FrameStack,
    unwinder: Arc<dyn Unwinder>,
    accel: Option<Arc<dyn Accelerator>>,
    interrupts: InterruptToken,
    on_interrupt: InterruptHandler,
    profiler: Option<Profiler>,
    hook: Option<EventHook>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("options", &self.options)
            .field("depth", &self.stack.depth())
            .field("accelerator", &self.accel.is_some())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Vm {
    pub fn new(host: Arc<dyn ObjectModel>, options: VmOptions) -> Self {
        let globals = host.global_state().clone();
        Self {
            host,
            globals,
            options,
            stack: FrameStack::new(),
            unwinder: Arc::new(CatchTableUnwinder),
            accel: None,
            interrupts: InterruptToken::new(),
            on_interrupt: default_interrupt_handler(),
            profiler: options.profile.then(Profiler::enabled),
            hook: None,
        }
    }

    pub fn host(&self) -> &Arc<dyn ObjectModel> {
        &self.host
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    pub fn profiler(&self) -> Option<&Profiler> {
        self.profiler.as_ref()
    }

    pub fn profiler_mut(&mut self) -> Option<&mut Profiler> {
        self.profiler.as_mut()
    }

    /// Handle other threads use to interrupt this VM.
    pub fn interrupt_token(&self) -> InterruptToken {
        self.interrupts.clone()
    }

    pub fn set_interrupt_handler(&mut self, handler: InterruptHandler) {
        self.on_interrupt = handler;
    }

    pub fn set_unwinder(&mut self, unwinder: Arc<dyn Unwinder>) {
        self.unwinder = unwinder;
    }

    pub fn set_accelerator(&mut self, accel: Option<Arc<dyn Accelerator>>) {
        self.accel = accel;
    }

    /// Install (or remove) the event hook.
    pub fn set_event_hook(&mut self, hook: Option<EventHook>) {
        self.hook = hook;
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Run a top-level routine with a fresh main object as self.
    pub fn run(&mut self, routine: Arc<Routine>) -> Result<Value, VmError> {
        let object_class = self.host.object_class();
        let main = Value::Object(Arc::new(RObject::new(object_class)));
        let spec = FrameSpec::new(routine, FrameKind::Top, main, object_class);
        self.push_frame(spec, &[], true)?;
        self.execute()
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    pub(crate) fn push_frame(
        &mut self,
        spec: FrameSpec,
        locals: &[Value],
        finish: bool,
    ) -> Result<u64, VmError> {
        if self.stack.depth() >= self.options.max_frames {
            return Err(VmError::StackOverflow {
                depth: self.stack.depth(),
            });
        }
        debug!(routine = %spec.routine.name, kind = ?spec.kind, depth = self.stack.depth() + 1, "push frame");
        let id = self.stack.push(spec, locals);
        if finish {
            if let Some(frame) = self.stack.current_mut() {
                frame.flags.set(FrameFlags::FINISH);
            }
        }
        Ok(id)
    }

    pub(crate) fn frame(&self) -> Result<&Frame, VmError> {
        self.stack
            .current()
            .ok_or_else(|| VmError::InvariantViolation("no current frame".into()))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.stack
            .current_mut()
            .ok_or_else(|| VmError::InvariantViolation("no current frame".into()))
    }

    // ------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------

    /// Run until the innermost FINISH frame returns.
    pub(crate) fn execute(&mut self) -> Result<Value, VmError> {
        'frames: loop {
            let routine = self.frame()?.routine.clone();
            let mut retrying = false;
            loop {
                let pc = self.frame()?.pc;
                let Some(insn) = routine.code.get(pc) else {
                    let err = VmError::InvariantViolation(format!(
                        "pc {} out of range in {}",
                        pc, routine.name
                    ));
                    return Err(self.abort(err));
                };

                let step = if retrying {
                    retrying = false;
                    self.exec(&routine, pc, insn)
                } else {
                    self.before_insn(&routine, pc, insn)
                        .and_then(|()| self.exec(&routine, pc, insn))
                };

                match step {
                    Ok(Step::Next) => self.frame_mut()?.pc = pc + 1,
                    Ok(Step::Jump(offset)) => {
                        self.frame_mut()?.pc = (pc as i64 + 1 + offset as i64) as usize
                    }
                    Ok(Step::Goto(target)) => self.frame_mut()?.pc = target,
                    Ok(Step::Deopt(variant)) => {
                        if let Some(cell) = insn.variant() {
                            self.deopt(&routine, pc, cell, variant);
                        }
                        retrying = true;
                    }
                    Ok(Step::Reload) => continue 'frames,
                    Ok(Step::Return(value)) => match self.leave_frame(value)? {
                        Some(value) => return Ok(value),
                        None => continue 'frames,
                    },
                    Err(err) => match self.unwind(err)? {
                        Some(value) => return Ok(value),
                        None => continue 'frames,
                    },
                }
            }
        }
    }

    /// Events, profiling and interrupt polling for an instruction about to
    /// run for the first time.
    fn before_insn(&mut self, routine: &Routine, pc: usize, insn: &Insn) -> Result<(), VmError> {
        if self.hook.is_some() {
            let events = routine.events_at(pc);
            if !events.is_empty() {
                self.report(routine, pc, events);
            }
        }
        if let Some(profiler) = &mut self.profiler {
            profiler.record_instruction(insn);
        }
        if self.options.check_interrupts && insn.polls_interrupts() && self.interrupts.is_pending()
        {
            self.poll_interrupts()?;
        }
        if insn.may_call_out() {
            if let Some(frame) = self.stack.current() {
                debug_assert_eq!(
                    frame.sp,
                    frame.default_sp(),
                    "stack pointer off its default position at {}@{}",
                    routine.name,
                    pc
                );
            }
        }
        Ok(())
    }

    pub(crate) fn report(&mut self, routine: &Routine, pc: usize, events: EventFlags) {
        let depth = self.stack.depth();
        if let Some(hook) = &mut self.hook {
            hook(&TraceEvent {
                events,
                routine: &routine.name,
                pc,
                line: routine.line_at(pc),
                depth,
            });
        }
    }

    fn poll_interrupts(&mut self) -> Result<(), VmError> {
        while let Some(interrupt) = self.interrupts.take() {
            debug!(?interrupt, "interrupt");
            if let Some(exception) = (self.on_interrupt)(self.host.as_ref(), interrupt) {
                return Err(VmError::Raised(exception));
            }
        }
        Ok(())
    }

    /// Rewrite a generic instruction to a speculative form.
    pub(crate) fn rewrite(&mut self, routine: &Routine, pc: usize, cell: &VariantCell, to: Variant) {
        if !self.options.specialize || cell.get() != Variant::Generic {
            return;
        }
        cell.set(to);
        trace!(routine = %routine.name, pc, variant = ?to, "rewrite");
        if let Some(profiler) = &mut self.profiler {
            profiler.record_rewrite();
        }
    }

    fn deopt(&mut self, routine: &Routine, pc: usize, cell: &VariantCell, to: Variant) {
        trace!(routine = %routine.name, pc, from = ?cell.get(), to = ?to, "deopt");
        cell.set(to);
        if let Some(profiler) = &mut self.profiler {
            profiler.record_deopt();
        }
    }

    /// Pop the current frame and hand `value` to whoever called it.
    ///
    /// Returns the value when the popped frame was a FINISH frame.
    pub(crate) fn leave_frame(&mut self, value: Value) -> Result<Option<Value>, VmError> {
        let Some(frame) = self.stack.pop() else {
            return Err(VmError::InvariantViolation("return with no frame".into()));
        };
        debug!(routine = %frame.routine.name, depth = self.stack.depth(), "pop frame");
        if frame.flags.has(FrameFlags::FINISH) {
            return Ok(Some(value));
        }
        if let Some(pending) = frame.pending {
            // Ensure body done; keep unwinding from past the region
            self.frame_mut()?.pc = frame.ret.pc;
            return self.unwind(pending);
        }

        let pc = self.deliver(frame.ret, value)?;
        let caller = self.frame_mut()?;
        caller.pc = pc;
        if caller.routine.accel.is_cancelled() && !caller.flags.has(FrameFlags::CANCEL) {
            caller.flags.set(FrameFlags::CANCEL);
        }
        Ok(None)
    }

    /// Place a call result in the current frame as `ret` describes and
    /// return the pc to continue at.
    pub(crate) fn deliver(&mut self, ret: frame::ReturnTo, value: Value) -> Result<usize, VmError> {
        let frame = self.frame()?;
        if let Some(ic) = ret.once {
            if let Some(cell) = frame.routine.once_caches.get(ic as usize) {
                *cell.lock() = Some(value.clone());
            }
        }
        let mut pc = ret.pc;
        if let Some(branch) = ret.branch {
            if value.truthy() == branch.when {
                pc = branch.target;
            }
        }
        if let Some(slot) = ret.slot {
            self.stack.set_temp(slot, value);
        }
        Ok(pc)
    }

    /// Drop frames down to and including the innermost FINISH frame.
    fn abort(&mut self, err: VmError) -> VmError {
        while let Some(frame) = self.stack.pop() {
            if frame.flags.has(FrameFlags::FINISH) {
                break;
            }
        }
        err
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Exception of a core class, ready to propagate.
    pub fn raise(&self, class_name: &str, message: impl AsRef<str>) -> VmError {
        VmError::Raised(self.host.make_exception(class_name, message.as_ref()))
    }

    pub(crate) fn type_error(&self, message: impl AsRef<str>) -> VmError {
        self.raise("TypeError", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_options_from_settings() {
        let settings = VmSettings {
            specialize: false,
            max_frames: 12,
            ..Default::default()
        };
        let options = VmOptions::from(&settings);
        assert!(!options.specialize);
        assert_eq!(options.max_frames, 12);
        assert_eq!(options.check_interrupts, settings.check_interrupts);
    }

    #[test]
    fn test_error_messages() {
        let err = VmError::StackOverflow { depth: 10 };
        assert_eq!(err.to_string(), "stack level too deep (10 frames)");

        let err = VmError::from(TranslateError::MalformedInput {
            pos: 3,
            reason: "bad".into(),
        });
        assert_eq!(err.to_string(), "malformed input at position 3: bad");
    }

    #[test]
    fn test_vm_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VmError>();
    }
}
