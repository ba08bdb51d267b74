//! Hand-off to an external optimizing compiler
//!
//! Before interpreting a method frame the loop may offer the call to an
//! [`Accelerator`]. It either runs the routine itself, declines, or asks
//! for cancellation: the routine's compiled code is then untrusted for
//! good and the frame keeps being interpreted. Such a frame carries the
//! CANCEL flag, and methods it calls are interpreted without an offer.

use crate::rtl::Routine;
use crate::value::Value;
use crate::vm::VmError;

/// Outcome of offering a call to the accelerator
#[derive(Debug)]
pub enum AccelOutcome {
    /// The accelerator ran the call; this is its result
    Handled(Value),
    /// Interpret as usual
    NotHandled,
    /// Stop using compiled code for this routine
    Cancel,
    /// The compiled code raised
    Failed(VmError),
}

/// A call offered to the accelerator
#[derive(Debug)]
pub struct AccelRequest<'a> {
    pub routine: &'a Routine,
    pub self_value: &'a Value,
    pub args: &'a [Value],
    /// How many times the routine has been entered, this call included
    pub entries: u32,
}

pub trait Accelerator: Send + Sync {
    fn enter(&self, request: &AccelRequest<'_>) -> AccelOutcome;
}

/// Accelerator that runs a closure for routines with a given name.
/// Useful for embedding tests and benchmarks.
pub struct NamedAccelerator<F> {
    name: String,
    run: F,
}

impl<F> NamedAccelerator<F>
where
    F: Fn(&AccelRequest<'_>) -> AccelOutcome + Send + Sync,
{
    pub fn new(name: impl Into<String>, run: F) -> Self {
        Self {
            name: name.into(),
            run,
        }
    }
}

impl<F> Accelerator for NamedAccelerator<F>
where
    F: Fn(&AccelRequest<'_>) -> AccelOutcome + Send + Sync,
{
    fn enter(&self, request: &AccelRequest<'_>) -> AccelOutcome {
        if request.routine.name == self.name {
            (self.run)(request)
        } else {
            AccelOutcome::NotHandled
        }
    }
}
