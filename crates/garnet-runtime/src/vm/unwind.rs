//! Cross-frame control transfer
//!
//! `raise`, `break`, `next`, `return`, `retry`, `redo` and `throw` leave
//! the dispatch loop as a [`Signal`]. The loop asks its [`Unwinder`] what
//! each frame, innermost first, does with the signal: resume at a catch
//! continuation, run a rescue/ensure body, return from the frame, or let
//! the signal pass and pop the frame.

use super::frame::{Frame, FrameFlags, FrameKind, FrameSpec, ReturnTo};
use super::{Vm, VmError};
use crate::iseq::{CatchEntry, CatchKind, EventFlags, ThrowKind};
use crate::rtl::Insn;
use crate::value::Value;
use tracing::{debug, trace};

/// A control signal in flight
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: ThrowKind,
    pub value: Value,
    /// Frame the signal is addressed to; `None` means the first frame
    /// able to take it
    pub target: Option<u64>,
}

impl Signal {
    fn from_error(err: VmError, vm: &Vm) -> Result<Signal, VmError> {
        match err {
            VmError::Raised(value) => Ok(Signal {
                kind: ThrowKind::Raise,
                value,
                target: None,
            }),
            VmError::Thrown { tag, value, target } => Ok(Signal {
                kind: tag,
                value,
                target,
            }),
            VmError::StackOverflow { .. } => Ok(Signal {
                kind: ThrowKind::Raise,
                value: vm
                    .host
                    .make_exception("SystemStackError", "stack level too deep"),
                target: None,
            }),
            other => Err(other),
        }
    }

    pub fn into_error(self) -> VmError {
        match self.kind {
            ThrowKind::Raise => VmError::Raised(self.value),
            tag => VmError::Thrown {
                tag,
                value: self.value,
                target: self.target,
            },
        }
    }
}

/// What a frame does with a signal
#[derive(Debug, Clone, PartialEq)]
pub enum Transfer {
    /// Continue in this frame at `cont`, storing the value in `slot`
    Resume { cont: usize, slot: Option<u32> },
    /// Run the entry's rescue or ensure body in a handler frame
    RunHandler(CatchEntry),
    /// Return the value from this frame
    Return,
    /// Pop this frame and try the next one
    Propagate,
}

pub trait Unwinder: Send + Sync {
    fn transfer(&self, frame: &Frame, signal: &Signal) -> Transfer;
}

/// Unwinder driven by each routine's catch table
#[derive(Debug, Clone, Copy, Default)]
pub struct CatchTableUnwinder;

impl CatchTableUnwinder {
    fn applies(entry: &CatchEntry, pc: usize, signal: &Signal, at_target: bool) -> bool {
        // retry regions end exactly at the rescue continuation
        let covered = match entry.kind {
            CatchKind::Retry => entry.start <= pc && pc <= entry.end,
            _ => entry.start <= pc && pc < entry.end,
        };
        if !covered {
            return false;
        }
        match entry.kind {
            CatchKind::Rescue => signal.kind == ThrowKind::Raise && entry.iseq.is_some(),
            CatchKind::Ensure => entry.iseq.is_some(),
            CatchKind::Break => at_target && signal.kind == ThrowKind::Break,
            CatchKind::Next => at_target && signal.kind == ThrowKind::Next,
            CatchKind::Redo => at_target && signal.kind == ThrowKind::Redo,
            CatchKind::Retry => at_target && signal.kind == ThrowKind::Retry,
        }
    }
}

impl Unwinder for CatchTableUnwinder {
    fn transfer(&self, frame: &Frame, signal: &Signal) -> Transfer {
        let at_target = signal.target.map_or(true, |t| t == frame.id);
        let pc = frame.pc;

        if let Some(entry) = frame
            .routine
            .catch_table
            .iter()
            .find(|e| Self::applies(e, pc, signal, at_target))
        {
            return match entry.kind {
                CatchKind::Rescue | CatchKind::Ensure => Transfer::RunHandler(*entry),
                kind => Transfer::Resume {
                    cont: entry.cont,
                    slot: kind.pushes_value().then_some(entry.depth.max(0) as u32),
                },
            };
        }

        if signal.target != Some(frame.id) {
            return Transfer::Propagate;
        }
        match signal.kind {
            ThrowKind::Return => Transfer::Return,
            ThrowKind::Break if frame.lambda => Transfer::Return,
            // The block's caller is still at its call instruction
            ThrowKind::Break => match frame.routine.code.get(pc) {
                Some(
                    Insn::Call { start, .. }
                    | Insn::CallSuper { start, .. }
                    | Insn::CallBlock { start, .. },
                ) => Transfer::Resume {
                    cont: pc + 1,
                    slot: Some(*start),
                },
                _ => Transfer::Propagate,
            },
            ThrowKind::Next if frame.kind == FrameKind::Block => Transfer::Return,
            _ => Transfer::Propagate,
        }
    }
}

impl Vm {
    /// Build the signal a `throw` instruction of `kind` sends.
    pub(crate) fn throw(&self, kind: ThrowKind, value: Value) -> VmError {
        let Some(frame) = self.lexical_frame() else {
            return VmError::InvariantViolation("throw with no frame".into());
        };
        let target = match kind {
            ThrowKind::Raise => {
                return if self.host.is_exception(&value) {
                    VmError::Raised(value)
                } else if let Value::Str(message) = &value {
                    let message = message.lock().clone();
                    self.raise("RuntimeError", message)
                } else {
                    self.type_error("exception class/object expected")
                };
            }
            ThrowKind::Throw => None,
            ThrowKind::Break if frame.kind == FrameKind::Block && !frame.lambda => {
                match frame.break_home {
                    Some(home) if self.stack.contains(home) => Some(home),
                    _ => return self.raise("LocalJumpError", "break from proc-closure"),
                }
            }
            ThrowKind::Return if frame.kind == FrameKind::Block && !frame.lambda => {
                match frame.method_home {
                    Some(home) if self.stack.contains(home) => Some(home),
                    _ => return self.raise("LocalJumpError", "unexpected return"),
                }
            }
            ThrowKind::Return => Some(frame.method_home.unwrap_or(frame.id)),
            ThrowKind::Break | ThrowKind::Next | ThrowKind::Redo | ThrowKind::Retry => {
                Some(frame.id)
            }
        };
        VmError::Thrown {
            tag: kind,
            value,
            target,
        }
    }

    /// Innermost frame that is not a rescue/ensure body.
    fn lexical_frame(&self) -> Option<&Frame> {
        self.stack
            .frames()
            .iter()
            .rev()
            .find(|f| f.kind != FrameKind::Handler)
    }

    /// Unwind `err` through the frame stack.
    ///
    /// Returns `Some(value)` when a FINISH frame returned normally while
    /// unwinding, `None` when execution resumes in some frame.
    pub(crate) fn unwind(&mut self, err: VmError) -> Result<Option<Value>, VmError> {
        let signal = match Signal::from_error(err, self) {
            Ok(signal) => signal,
            Err(fatal) => return Err(self.abort(fatal)),
        };
        if signal.kind == ThrowKind::Raise && self.hook.is_some() {
            if let Some(frame) = self.stack.current() {
                let (routine, pc) = (frame.routine.clone(), frame.pc);
                self.report(&routine, pc, EventFlags::RAISE);
            }
        }

        loop {
            let Some(frame) = self.stack.current() else {
                return Err(signal.into_error());
            };
            let transfer = self.unwinder.transfer(frame, &signal);
            trace!(routine = %frame.routine.name, pc = frame.pc, kind = ?signal.kind, ?transfer, "unwind");

            match transfer {
                Transfer::Resume { cont, slot } => {
                    if let Some(slot) = slot {
                        self.stack.set_temp(slot, signal.value);
                    }
                    self.frame_mut()?.pc = cont;
                    return Ok(None);
                }
                Transfer::RunHandler(entry) => {
                    return match self.run_handler(entry, signal) {
                        Ok(()) => Ok(None),
                        Err(fatal) => Err(self.abort(fatal)),
                    };
                }
                Transfer::Return => return self.leave_frame(signal.value),
                Transfer::Propagate => {
                    let Some(frame) = self.stack.pop() else {
                        return Err(signal.into_error());
                    };
                    debug!(routine = %frame.routine.name, depth = self.stack.depth(), "pop frame");
                    if frame.flags.has(FrameFlags::FINISH) {
                        return Err(signal.into_error());
                    }
                    if frame.kind == FrameKind::Handler {
                        // Not caught again by the region that ran the handler
                        self.frame_mut()?.pc = frame.ret.pc;
                    }
                }
            }
        }
    }

    /// Push the rescue or ensure body of `entry` above the current frame.
    fn run_handler(&mut self, entry: CatchEntry, signal: Signal) -> Result<(), VmError> {
        let parent = self.frame()?;
        let Some(body) = entry
            .iseq
            .and_then(|idx| parent.routine.children.get(idx))
            .cloned()
        else {
            return Err(VmError::InvariantViolation(format!(
                "catch entry of {} has no handler routine",
                parent.routine.name
            )));
        };
        let mut spec = FrameSpec::new(
            body,
            FrameKind::Handler,
            parent.self_value.clone(),
            parent.cref,
        );
        spec.block = parent.block.clone();
        spec.method = parent.method.clone();
        spec.method_home = parent.method_home;
        spec.break_home = parent.break_home;
        spec.ret = ReturnTo {
            pc: entry.cont,
            slot: (entry.kind == CatchKind::Rescue).then_some(entry.depth.max(0) as u32),
            ..Default::default()
        };
        spec.outer = self.stack.capture_env();

        let error_value = signal.value.clone();
        self.push_frame(spec, &[error_value], false)?;
        if entry.kind == CatchKind::Ensure {
            self.frame_mut()?.pending = Some(signal.into_error());
        }
        Ok(())
    }
}
