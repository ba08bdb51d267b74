//! Stack-to-register translation
//!
//! [`translate`] lowers an [`Iseq`] and all of its children into
//! [`Routine`]s in two passes:
//!
//! 1. [`analyze`] simulates the operand stack to decide which values can
//!    stay symbolic (a local, self, a literal) and which must live in a
//!    temporary.
//! 2. [`codegen`] replays the stack code once with that knowledge and
//!    emits register instructions, patching branches and remapping the
//!    catch, line and optional-argument tables at the end.
//!
//! Translation is deterministic: the same input always yields the same
//! register code.

pub mod analyze;
pub mod codegen;
mod events;

use crate::iseq::Iseq;
use crate::rtl::Routine;
use garnet_config::TranslatorSettings;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Translator knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateOptions {
    /// Refuse routines with more stack instructions than this
    pub max_insns: usize,
    /// Refuse routines whose operand stack gets deeper than this
    pub max_temps: u32,
    /// Merge a compare with a following `branchif`/`branchunless`
    pub fuse_compare_branch: bool,
    /// Fold literal second operands into the instruction
    pub immediate_operands: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self::from(&TranslatorSettings::default())
    }
}

impl From<&TranslatorSettings> for TranslateOptions {
    fn from(settings: &TranslatorSettings) -> Self {
        Self {
            max_insns: settings.max_insns,
            max_temps: settings.max_temps,
            fuse_compare_branch: settings.fuse_compare_branch,
            immediate_operands: settings.immediate_operands,
        }
    }
}

/// Translation failure. No routine is produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("out of memory while building the {what}")]
    OutOfMemory { what: &'static str },

    #[error("{what} of {actual} exceeds the limit of {limit}")]
    LimitExceeded {
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("malformed input at position {pos}: {reason}")]
    MalformedInput { pos: usize, reason: String },
}

/// Translate `iseq` and its children.
#[instrument(level = "debug", skip_all, fields(routine = %iseq.name, insns = iseq.insns.len()))]
pub fn translate(iseq: &Iseq, options: &TranslateOptions) -> Result<Arc<Routine>, TranslateError> {
    if iseq.insns.len() > options.max_insns {
        return Err(TranslateError::LimitExceeded {
            what: "instruction count",
            limit: options.max_insns,
            actual: iseq.insns.len(),
        });
    }

    let mut children = Vec::new();
    children
        .try_reserve_exact(iseq.children.len())
        .map_err(|_| TranslateError::OutOfMemory {
            what: "child routine list",
        })?;
    for child in &iseq.children {
        children.push(translate(child, options)?);
    }

    let events = events::position_events(iseq)?;
    let analysis = analyze::analyze(iseq, &events)?;
    if analysis.max_depth > options.max_temps as usize {
        return Err(TranslateError::LimitExceeded {
            what: "stack depth",
            limit: options.max_temps as usize,
            actual: analysis.max_depth,
        });
    }

    let routine = codegen::generate(iseq, &analysis, &events, children, options)?;
    Ok(Arc::new(routine))
}

/// A vector of `len` copies of `value`, failing softly on allocation.
pub(crate) fn try_vec<T: Clone>(
    len: usize,
    value: T,
    what: &'static str,
) -> Result<Vec<T>, TranslateError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| TranslateError::OutOfMemory { what })?;
    v.resize(len, value);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::{IseqKind, Literal, StackInsn};
    use pretty_assertions::assert_eq;

    fn sum_routine() -> Iseq {
        Iseq::new(
            "sum",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                StackInsn::PutObject {
                    value: Literal::Int(1),
                },
                StackInsn::OptPlus,
                StackInsn::Leave,
            ],
        )
        .with_locals(&["a"])
    }

    #[test]
    fn test_instruction_limit() {
        let options = TranslateOptions {
            max_insns: 3,
            ..Default::default()
        };
        let err = translate(&sum_routine(), &options).unwrap_err();
        assert_eq!(
            err,
            TranslateError::LimitExceeded {
                what: "instruction count",
                limit: 3,
                actual: 4
            }
        );
    }

    #[test]
    fn test_depth_limit() {
        let options = TranslateOptions {
            max_temps: 1,
            ..Default::default()
        };
        let err = translate(&sum_routine(), &options).unwrap_err();
        assert_eq!(err.to_string(), "stack depth of 2 exceeds the limit of 1");
    }

    #[test]
    fn test_children_are_translated() {
        let mut iseq = sum_routine();
        iseq.children.push(Iseq::new(
            "block",
            IseqKind::Block,
            vec![StackInsn::PutNil, StackInsn::Leave],
        ));
        let routine = translate(&iseq, &TranslateOptions::default()).unwrap();
        assert_eq!(routine.children.len(), 1);
        assert_eq!(routine.children[0].name, "block");
    }

    #[test]
    fn test_options_from_settings() {
        let settings = TranslatorSettings {
            fuse_compare_branch: false,
            ..Default::default()
        };
        let options = TranslateOptions::from(&settings);
        assert!(!options.fuse_compare_branch);
        assert_eq!(options.max_insns, 1_000_000);
    }
}
