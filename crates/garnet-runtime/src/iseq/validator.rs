//! Stack bytecode validator: static checks before translation
//!
//! Performs five checks:
//! 1. **Branch targets**: every jump, branch, inline-cache and dispatch
//!    destination is inside the routine
//! 2. **Operand refs**: local indices and child routine indices exist
//! 3. **Stack depth**: a dataflow walk finds underflows and positions
//!    reached with two different depths
//! 4. **Catch table**: regions are inside the routine with a sane depth
//! 5. **Termination**: control cannot run off the end
//!
//! Children are validated recursively. The translator does not require a
//! clean report: it ignores malformed catch entries on its own and refuses
//! inconsistent depths.

use super::{Iseq, StackInsn};

// ============================================================================
// Public API
// ============================================================================

/// A validation error with the position where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Name of the routine containing the error.
    pub routine: String,
    /// Instruction position (or catch entry index for catch-table errors).
    pub pos: usize,
    /// What went wrong.
    pub kind: ValidationErrorKind,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @{:04}: {}", self.routine, self.pos, self.kind)
    }
}

/// Kinds of errors the validator can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// A branch target falls outside `[0, insns.len())`.
    BranchOutOfBounds { target: i64, len: usize },
    /// A local index exceeds the local table.
    LocalOutOfBounds { idx: u32, locals: usize },
    /// A child routine index exceeds the children list.
    ChildOutOfBounds { idx: usize, children: usize },
    /// Stack depth went negative.
    StackUnderflow { op: &'static str, depth_before: usize },
    /// A position is reachable with two different stack depths.
    DepthMismatch { expected: usize, found: usize },
    /// A catch entry is out of range or has a negative depth.
    MalformedCatchEntry { index: usize },
    /// The last instruction can fall through past the end.
    MissingTerminator,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BranchOutOfBounds { target, len } => {
                write!(f, "branch target {} is out of bounds (len={})", target, len)
            }
            Self::LocalOutOfBounds { idx, locals } => {
                write!(f, "local index {} out of bounds (locals={})", idx, locals)
            }
            Self::ChildOutOfBounds { idx, children } => {
                write!(
                    f,
                    "child routine {} out of bounds (children={})",
                    idx, children
                )
            }
            Self::StackUnderflow { op, depth_before } => {
                write!(
                    f,
                    "stack underflow in {}: depth before = {}",
                    op, depth_before
                )
            }
            Self::DepthMismatch { expected, found } => {
                write!(
                    f,
                    "stack depth mismatch: reached with {} and {}",
                    expected, found
                )
            }
            Self::MalformedCatchEntry { index } => {
                write!(f, "catch entry {} is malformed", index)
            }
            Self::MissingTerminator => {
                write!(f, "routine does not end with leave, jump or throw")
            }
        }
    }
}

/// Validate `iseq` and its children, collecting all errors found.
///
/// Returns `Ok(())` if no issues are found, otherwise `Err(errors)` with every
/// detected problem. Does NOT short-circuit on the first error.
pub fn validate(iseq: &Iseq) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    validate_into(iseq, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_into(iseq: &Iseq, errors: &mut Vec<ValidationError>) {
    let mut report = |pos: usize, kind: ValidationErrorKind| {
        errors.push(ValidationError {
            routine: iseq.name.clone(),
            pos,
            kind,
        })
    };

    // Pass 1: branch targets
    for (pos, insn) in iseq.insns.iter().enumerate() {
        for target in targets_of(pos, insn) {
            if target < 0 || target as usize >= iseq.insns.len() {
                report(
                    pos,
                    ValidationErrorKind::BranchOutOfBounds {
                        target,
                        len: iseq.insns.len(),
                    },
                );
            }
        }
    }

    // Pass 2: operand references
    for (pos, insn) in iseq.insns.iter().enumerate() {
        match insn {
            StackInsn::GetLocal { idx, level: 0 } | StackInsn::SetLocal { idx, level: 0 }
                if *idx as usize >= iseq.local_table.len() =>
            {
                report(
                    pos,
                    ValidationErrorKind::LocalOutOfBounds {
                        idx: *idx,
                        locals: iseq.local_table.len(),
                    },
                );
            }
            _ => {}
        }
        if let Some(child) = insn.child_iseq() {
            if child >= iseq.children.len() {
                report(
                    pos,
                    ValidationErrorKind::ChildOutOfBounds {
                        idx: child,
                        children: iseq.children.len(),
                    },
                );
            }
        }
    }

    // Pass 3: stack depth
    check_stack_depth(iseq, &mut report);

    // Pass 4: catch table
    let len = iseq.insns.len();
    for (index, entry) in iseq.catch_table.iter().enumerate() {
        let in_range = entry.start < len && entry.end < len && entry.cont < len;
        let child_ok = entry.iseq.map_or(true, |c| c < iseq.children.len());
        if entry.depth < 0 || !in_range || !child_ok || entry.start > entry.end {
            report(index, ValidationErrorKind::MalformedCatchEntry { index });
        }
    }

    // Pass 5: termination
    match iseq.insns.last() {
        Some(StackInsn::Leave) | Some(StackInsn::Jump { .. }) | Some(StackInsn::Throw { .. }) => {}
        _ => report(
            iseq.insns.len().saturating_sub(1),
            ValidationErrorKind::MissingTerminator,
        ),
    }

    for child in &iseq.children {
        validate_into(child, errors);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Every control-flow successor of `insn` other than fall-through.
fn targets_of(pos: usize, insn: &StackInsn) -> Vec<i64> {
    let rel = |offset: i32| pos as i64 + 1 + offset as i64;
    match insn {
        StackInsn::OptCaseDispatch { table, else_offset } => table
            .iter()
            .map(|arm| rel(arm.offset))
            .chain(std::iter::once(rel(*else_offset)))
            .collect(),
        _ => insn.branch_offset().map(rel).into_iter().collect(),
    }
}

fn check_stack_depth(iseq: &Iseq, report: &mut impl FnMut(usize, ValidationErrorKind)) {
    let len = iseq.insns.len();
    let mut depth_at: Vec<Option<usize>> = vec![None; len];
    let mut worklist: Vec<(usize, usize)> = vec![(0, 0)];
    for entry in &iseq.catch_table {
        if entry.depth >= 0 && entry.cont < len {
            let extra = entry.kind.pushes_value() as usize;
            worklist.push((entry.cont, entry.depth as usize + extra));
        }
    }

    while let Some((start, depth)) = worklist.pop() {
        let mut pos = start;
        let mut depth = depth;
        while pos < len {
            match depth_at[pos] {
                Some(seen) if seen == depth => break,
                Some(seen) => {
                    report(
                        pos,
                        ValidationErrorKind::DepthMismatch {
                            expected: seen,
                            found: depth,
                        },
                    );
                    break;
                }
                None => depth_at[pos] = Some(depth),
            }
            let insn = &iseq.insns[pos];
            if depth < insn.required_depth() {
                report(
                    pos,
                    ValidationErrorKind::StackUnderflow {
                        op: insn.name(),
                        depth_before: depth,
                    },
                );
                break;
            }
            depth = insn.depth_after(depth);
            for target in targets_of(pos, insn) {
                if target >= 0 && (target as usize) < len {
                    // getinlinecache jumps with its result pushed
                    worklist.push((target as usize, depth));
                }
            }
            if insn.ends_block() {
                break;
            }
            pos += 1;
        }
    }
}
