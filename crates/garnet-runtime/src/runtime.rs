//! Garnet runtime API for embedding
//!
//! Ties validation, translation and execution together over a
//! [`ReferenceHost`].

use crate::host::ReferenceHost;
use crate::iseq::{validate, Iseq, ValidationError};
use crate::object::ObjectModel;
use crate::rtl::Routine;
use crate::translate::{translate, TranslateError, TranslateOptions};
use crate::value::Value;
use crate::vm::{Profiler, Vm, VmError, VmOptions};
use garnet_config::Settings;
use std::sync::Arc;
use thiserror::Error;

/// Why a routine could not be run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{} validation error(s); first: {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Result type for runtime operations
pub type RunResult<T> = Result<T, RunError>;

/// Garnet runtime instance
///
/// # Examples
///
/// ```
/// use garnet_runtime::{Garnet, Iseq, Value};
///
/// let text = r#"{"name": "<main>", "insns": [
///     {"op": "put_object", "value": {"int": 2}},
///     {"op": "put_object", "value": {"int": 3}},
///     {"op": "opt_plus"},
///     {"op": "leave"}
/// ]}"#;
/// let iseq = Iseq::from_json(text).unwrap();
/// let mut garnet = Garnet::new();
/// assert!(matches!(garnet.run(&iseq), Ok(Value::Fixnum(5))));
/// ```
pub struct Garnet {
    host: Arc<ReferenceHost>,
    translate: TranslateOptions,
    vm: Vm,
}

impl Garnet {
    /// Runtime with default settings, writing output to stdout.
    pub fn new() -> Self {
        Self::with_host(ReferenceHost::new(), &Settings::default())
    }

    /// Runtime collecting program output; see [`Garnet::take_output`].
    pub fn capturing() -> Self {
        Self::with_host(ReferenceHost::capturing(), &Settings::default())
    }

    pub fn with_host(host: Arc<ReferenceHost>, settings: &Settings) -> Self {
        let model: Arc<dyn ObjectModel> = host.clone();
        Self {
            host,
            translate: TranslateOptions::from(&settings.translator),
            vm: Vm::new(model, VmOptions::from(&settings.vm)),
        }
    }

    pub fn host(&self) -> &Arc<ReferenceHost> {
        &self.host
    }

    pub fn vm(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn profiler(&self) -> Option<&Profiler> {
        self.vm.profiler()
    }

    pub fn translate_options(&self) -> &TranslateOptions {
        &self.translate
    }

    /// Validate and translate without running.
    pub fn compile(&self, iseq: &Iseq) -> RunResult<Arc<Routine>> {
        validate(iseq).map_err(RunError::Invalid)?;
        Ok(translate(iseq, &self.translate)?)
    }

    pub fn run(&mut self, iseq: &Iseq) -> RunResult<Value> {
        let routine = self.compile(iseq)?;
        self.run_routine(routine)
    }

    /// Run an already translated routine. Its instructions keep whatever
    /// variants earlier runs rewrote them to.
    pub fn run_routine(&mut self, routine: Arc<Routine>) -> RunResult<Value> {
        Ok(self.vm.run(routine)?)
    }

    pub fn inspect(&self, value: &Value) -> String {
        self.host.inspect(value)
    }

    pub fn take_output(&self) -> String {
        self.host.take_output()
    }

    /// One-line description of a run failure, naming the exception class
    /// when a raised value escaped.
    pub fn describe(&self, err: &RunError) -> String {
        match err {
            RunError::Vm(VmError::Raised(exc)) => {
                let class = self.host.class_name(self.host.class_of(exc));
                let message = self.host.exception_message(exc);
                if message.is_empty() || message == class {
                    class
                } else {
                    format!("{} ({})", message, class)
                }
            }
            RunError::Vm(VmError::Thrown { tag, value, .. }) => {
                format!("uncaught {:?} with {}", tag, self.inspect(value))
            }
            other => other.to_string(),
        }
    }
}

impl Default for Garnet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::{IseqKind, StackInsn};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_invalid_iseq_is_rejected_before_translation() {
        let iseq = Iseq::new("<main>", IseqKind::Top, vec![StackInsn::Pop, StackInsn::Leave]);
        let err = Garnet::capturing().run(&iseq).unwrap_err();
        assert!(matches!(err, RunError::Invalid(ref errors) if !errors.is_empty()));
    }

    #[test]
    fn test_describe_uncaught_exception() {
        let iseq = Iseq::new(
            "<main>",
            IseqKind::Top,
            vec![
                StackInsn::PutSelf,
                StackInsn::Send {
                    name: "frobnicate".into(),
                    argc: 0,
                    flags: Default::default(),
                    block: None,
                },
                StackInsn::Leave,
            ],
        );
        let mut garnet = Garnet::capturing();
        let err = garnet.run(&iseq).unwrap_err();
        assert_eq!(
            garnet.describe(&err),
            "undefined method `frobnicate' for an instance of Object (NoMethodError)"
        );
    }
}
