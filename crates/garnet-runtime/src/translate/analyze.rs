//! Abstract stack analysis
//!
//! Simulates the operand stack of a routine with abstract slots that
//! remember *where* a value comes from (a local, self, a literal, or an
//! already materialized temporary). Control-flow targets keep the abstract
//! stack seen on their first visit and unify every later arrival with it.
//! Whenever two arrivals disagree about a slot, the producers of that slot
//! are marked *temp-only*: the generator will materialize their result
//! into the temporary instead of forwarding the descriptor.
//!
//! The walk is repeated until a full sweep changes nothing. Marks only
//! ever get added, so this terminates.

use super::events::PosEvent;
use super::{try_vec, TranslateError};
use crate::iseq::{Iseq, Literal, StackInsn};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, trace, warn};

/// What the analysis knows about a stack slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotKind {
    /// Nothing known yet; unifies with anything
    Unknown,
    SelfRef,
    /// A literal that can be re-materialized at the consumer
    Val(Literal),
    /// A string literal pushed at the given position
    Str(usize),
    /// Still reads the local with this index
    Loc(u32),
    /// Lives in the temporary matching its stack index
    Temp,
}

/// An abstract slot and the position of the instruction that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractSlot {
    pub kind: SlotKind,
    pub source: usize,
}

impl AbstractSlot {
    pub fn new(kind: SlotKind, source: usize) -> Self {
        Self { kind, source }
    }

    pub fn temp(source: usize) -> Self {
        Self::new(SlotKind::Temp, source)
    }

    pub fn is_temp(&self) -> bool {
        self.kind == SlotKind::Temp
    }

    /// Do both slots describe the same run-time value?
    pub fn same_descriptor(&self, other: &AbstractSlot) -> bool {
        match (&self.kind, &other.kind) {
            (SlotKind::Val(a), SlotKind::Val(b)) => a.same(b),
            (SlotKind::Str(a), SlotKind::Str(b)) => a == b,
            (SlotKind::Loc(a), SlotKind::Loc(b)) => a == b,
            (SlotKind::SelfRef, SlotKind::SelfRef)
            | (SlotKind::Temp, SlotKind::Temp)
            | (SlotKind::Unknown, SlotKind::Unknown) => true,
            _ => false,
        }
    }
}

/// Kind of control-flow target at a position. Only ever rises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LabelType {
    #[default]
    None,
    /// Continuation of an exception region
    Cont,
    /// Target of a branch, jump or dispatch table
    Branch,
}

/// Result of the analysis of one routine
#[derive(Debug, Clone)]
pub struct Analysis {
    pub label_type: Vec<LabelType>,
    /// Stack depth plus one; zero for positions never reached
    pub stack_free: Vec<usize>,
    /// Abstract stack saved at each label
    pub saved: Vec<Option<Vec<AbstractSlot>>>,
    /// First or last position of an exception region
    pub catch_bound: Vec<bool>,
    /// Producers whose result must be materialized
    pub temp_only: Vec<bool>,
    /// Catch entries that passed the sanity checks
    pub catch_valid: Vec<bool>,
    pub max_depth: usize,
    pub sweeps: usize,
}

impl Analysis {
    pub fn reached(&self, pos: usize) -> bool {
        self.stack_free.get(pos).is_some_and(|&free| free != 0)
    }

    pub fn depth_at(&self, pos: usize) -> Option<usize> {
        self.stack_free.get(pos).and_then(|free| free.checked_sub(1))
    }

    pub fn is_label(&self, pos: usize) -> bool {
        self.label_type
            .get(pos)
            .is_some_and(|&ty| ty != LabelType::None)
    }

    pub fn saved_at(&self, pos: usize) -> Option<&[AbstractSlot]> {
        self.saved.get(pos).and_then(|s| s.as_deref())
    }
}

/// Run the analysis over `iseq`.
pub fn analyze(iseq: &Iseq, events: &[Option<PosEvent>]) -> Result<Analysis, TranslateError> {
    let len = iseq.insns.len();
    let mut analyzer = Analyzer {
        iseq,
        events,
        out: Analysis {
            label_type: try_vec(len, LabelType::None, "label table")?,
            stack_free: try_vec(len, 0, "depth table")?,
            saved: try_vec(len, None, "saved stacks")?,
            catch_bound: try_vec(len, false, "catch bounds")?,
            temp_only: try_vec(len, false, "temp-only flags")?,
            catch_valid: try_vec(iseq.catch_table.len(), false, "catch flags")?,
            max_depth: 0,
            sweeps: 0,
        },
        stack: Vec::new(),
        processed: try_vec(len, false, "label flags")?,
        worklist: BinaryHeap::new(),
        conts: Vec::new(),
        changed: false,
    };
    analyzer.setup_catch_table();
    loop {
        analyzer.out.sweeps += 1;
        analyzer.sweep()?;
        debug!(
            routine = %iseq.name,
            sweep = analyzer.out.sweeps,
            changed = analyzer.changed,
            "abstract stack sweep"
        );
        if !analyzer.changed {
            break;
        }
    }
    Ok(analyzer.out)
}

struct Analyzer<'a> {
    iseq: &'a Iseq,
    events: &'a [Option<PosEvent>],
    out: Analysis,
    stack: Vec<AbstractSlot>,
    processed: Vec<bool>,
    /// Labels to walk from, smallest position first
    worklist: BinaryHeap<Reverse<usize>>,
    /// (continuation, depth) of every valid catch entry
    conts: Vec<(usize, usize)>,
    changed: bool,
}

impl Analyzer<'_> {
    fn setup_catch_table(&mut self) {
        let len = self.iseq.insns.len();
        for (index, entry) in self.iseq.catch_table.iter().enumerate() {
            if entry.depth < 0 || entry.start >= len || entry.end >= len || entry.cont >= len {
                warn!(
                    routine = %self.iseq.name,
                    index,
                    start = entry.start,
                    end = entry.end,
                    cont = entry.cont,
                    depth = entry.depth,
                    "ignoring malformed catch entry"
                );
                continue;
            }
            self.out.catch_valid[index] = true;
            self.out.catch_bound[entry.start] = true;
            self.out.catch_bound[entry.end] = true;
            let depth = entry.depth as usize + usize::from(entry.kind.pushes_value());
            self.conts.push((entry.cont, depth));
        }
    }

    fn sweep(&mut self) -> Result<(), TranslateError> {
        self.changed = false;
        for i in 0..self.conts.len() {
            let (cont, depth) = self.conts[i];
            self.stack.clear();
            self.stack.resize(depth, AbstractSlot::temp(0));
            self.out.max_depth = self.out.max_depth.max(depth);
            self.process_label(LabelType::Cont, cont)?;
        }
        self.stack.clear();

        let len = self.iseq.insns.len();
        let mut pos = 0;
        loop {
            let start = pos;
            while pos < len {
                if self.out.catch_bound[pos] {
                    self.force_live_slots();
                }
                if pos != start && self.out.label_type[pos] != LabelType::None {
                    self.check_depth(pos)?;
                    if self.unify(pos) {
                        self.changed = true;
                    } else if self.processed[pos] {
                        break;
                    }
                }
                if self.step(pos)? {
                    break;
                }
                pos += 1;
            }
            let Some(Reverse(label)) = self.worklist.pop() else {
                break;
            };
            trace!(routine = %self.iseq.name, label, "walking from label");
            pos = label;
            self.stack = self.out.saved[label].clone().unwrap_or_default();
        }
        self.processed.fill(false);
        Ok(())
    }

    /// Everything live at an exception-region bound goes to temporaries.
    fn force_live_slots(&mut self) {
        for slot in &mut self.stack {
            if !slot.is_temp() {
                if !self.out.temp_only[slot.source] {
                    self.out.temp_only[slot.source] = true;
                    self.changed = true;
                }
                slot.kind = SlotKind::Temp;
            }
        }
    }

    fn check_depth(&self, pos: usize) -> Result<(), TranslateError> {
        let free = self.out.stack_free[pos];
        if free != 0 && free != self.stack.len() + 1 {
            return Err(TranslateError::MalformedInput {
                pos,
                reason: format!(
                    "stack depth mismatch at join: {} and {}",
                    free - 1,
                    self.stack.len()
                ),
            });
        }
        Ok(())
    }

    fn process_label(&mut self, ty: LabelType, pos: usize) -> Result<(), TranslateError> {
        if pos >= self.iseq.insns.len() {
            return Err(TranslateError::MalformedInput {
                pos,
                reason: "branch target out of range".into(),
            });
        }
        self.check_depth(pos)?;
        if ty > self.out.label_type[pos] {
            self.out.label_type[pos] = ty;
        }
        if self.out.saved[pos].is_none() {
            self.out.stack_free[pos] = self.stack.len() + 1;
            self.out.saved[pos] = Some(self.stack.clone());
            self.changed = true;
        } else if self.unify(pos) {
            self.changed = true;
        }
        if !self.processed[pos] {
            self.processed[pos] = true;
            self.worklist.push(Reverse(pos));
        }
        Ok(())
    }

    /// Unify the current stack with the one saved at `pos`. Returns true if
    /// the saved stack or any producer mark changed.
    fn unify(&mut self, pos: usize) -> bool {
        let Some(saved) = self.out.saved[pos].as_mut() else {
            return false;
        };
        let temp_only = &mut self.out.temp_only;
        let mut changed = false;
        for (kept, incoming) in saved.iter_mut().zip(self.stack.iter_mut()) {
            if incoming.kind == SlotKind::Unknown {
                continue;
            }
            if kept.kind == SlotKind::Unknown {
                *kept = incoming.clone();
                changed = true;
                continue;
            }
            if kept.same_descriptor(incoming) {
                continue;
            }
            if !kept.is_temp() {
                temp_only[kept.source] = true;
                kept.kind = SlotKind::Temp;
                changed = true;
            }
            if !incoming.is_temp() {
                if !temp_only[incoming.source] {
                    temp_only[incoming.source] = true;
                    changed = true;
                }
                incoming.kind = SlotKind::Temp;
            }
        }
        if changed {
            trace!(routine = %self.iseq.name, pos, "saved stack changed");
        }
        changed
    }

    fn push(&mut self, slot: AbstractSlot) {
        self.stack.push(slot);
        self.out.max_depth = self.out.max_depth.max(self.stack.len());
    }

    fn target(&self, pos: usize, offset: i32) -> Result<usize, TranslateError> {
        Iseq::branch_target(pos, offset).ok_or_else(|| TranslateError::MalformedInput {
            pos,
            reason: format!("branch offset {} out of range", offset),
        })
    }

    /// Apply the instruction at `pos` to the abstract stack. Returns true
    /// when control cannot fall through.
    fn step(&mut self, pos: usize) -> Result<bool, TranslateError> {
        use StackInsn::*;
        let iseq = self.iseq;
        let insn = &iseq.insns[pos];
        let depth = self.stack.len();
        self.out.stack_free[pos] = depth + 1;
        if depth < insn.required_depth() {
            return Err(TranslateError::MalformedInput {
                pos,
                reason: format!("stack underflow in {}", insn.name()),
            });
        }
        let new_depth = insn.depth_after(depth);

        let has_result = match insn {
            SetLocal { .. } | SetIvar { .. } | SetCvar { .. } | SetConstant { .. }
            | SetGlobal { .. } | Nop | Pop | BranchIf { .. } | BranchUnless { .. }
            | BranchNil { .. } | OptCaseDispatch { .. } | Jump { .. } | Leave | SetN { .. }
            | Swap | Reverse { .. } | AdjustStack { .. } | TraceCoverage { .. } => {
                self.stack.truncate(new_depth);
                false
            }
            DupN { .. } | ExpandArray { .. } => false,
            _ => {
                self.stack.truncate(new_depth - 1);
                true
            }
        };

        if !self.out.temp_only[pos] {
            let next = self.events.get(pos + 1).copied().flatten();
            if PosEvent::combine(self.events[pos], next).is_err() {
                // The next event needs an instruction of its own
                self.out.temp_only[pos] = true;
            }
        }
        let temp_only = self.out.temp_only[pos];
        let symbolic = |kind: SlotKind| {
            if temp_only {
                AbstractSlot::temp(pos)
            } else {
                AbstractSlot::new(kind, pos)
            }
        };

        match insn {
            BranchIf { offset }
            | BranchUnless { offset }
            | BranchNil { offset }
            | GetInlineCache { offset, .. }
            | Jump { offset } => {
                if has_result {
                    self.push(AbstractSlot::temp(pos));
                }
                let target = self.target(pos, *offset)?;
                self.process_label(LabelType::Branch, target)?;
            }
            OptCaseDispatch { table, else_offset } => {
                for arm in table {
                    let target = self.target(pos, arm.offset)?;
                    self.process_label(LabelType::Branch, target)?;
                }
                let target = self.target(pos, *else_offset)?;
                self.process_label(LabelType::Branch, target)?;
            }
            PutSelf => self.push(symbolic(SlotKind::SelfRef)),
            PutNil => self.push(symbolic(SlotKind::Val(Literal::Nil))),
            PutObject { value } => self.push(symbolic(SlotKind::Val(value.clone()))),
            PutString { .. } => self.push(symbolic(SlotKind::Str(pos))),
            GetLocal { idx, level } => {
                if *level == 0 {
                    self.push(symbolic(SlotKind::Loc(*idx)));
                } else {
                    self.push(AbstractSlot::temp(pos));
                }
            }
            SetLocal { idx, level: 0 } => {
                for slot in &mut self.stack {
                    if slot.kind == SlotKind::Loc(*idx) {
                        slot.kind = SlotKind::Temp;
                    }
                }
            }
            SetN { n } => {
                let len = self.stack.len();
                let top = self.stack[len - 1].clone();
                self.stack[len - 1 - *n as usize] = top;
            }
            TopN { n } => {
                let src = self.stack[self.stack.len() - 1 - *n as usize].clone();
                self.push(copy_slot(src, temp_only, pos));
            }
            Dup => {
                let src = self.stack[self.stack.len() - 1].clone();
                self.push(copy_slot(src, temp_only, pos));
            }
            DupN { n } => {
                let len = self.stack.len();
                for i in 0..*n as usize {
                    let src = self.stack[len - *n as usize + i].clone();
                    self.push(copy_slot(src, temp_only, pos));
                }
            }
            Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Reverse { n } => {
                let len = self.stack.len();
                for slot in &mut self.stack[len - *n as usize..] {
                    slot.kind = SlotKind::Temp;
                }
            }
            ExpandArray { num, flag } => {
                self.stack.truncate(depth - 1);
                for _ in 0..*num + (*flag & 1) {
                    self.push(AbstractSlot::temp(pos));
                }
            }
            _ => {
                if has_result {
                    self.push(AbstractSlot::temp(pos));
                }
            }
        }
        debug_assert_eq!(self.stack.len(), new_depth, "{} at {}", insn.name(), pos);
        Ok(insn.ends_block())
    }
}

/// A duplicated slot keeps its descriptor and producer unless it is
/// already a temporary or the duplicating instruction is temp-only.
fn copy_slot(src: AbstractSlot, temp_only: bool, pos: usize) -> AbstractSlot {
    if src.is_temp() || temp_only {
        AbstractSlot::temp(pos)
    } else {
        src
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::{CatchEntry, CatchKind, IseqKind};
    use crate::translate::events::position_events;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn run(iseq: &Iseq) -> Analysis {
        analyze(iseq, &position_events(iseq).unwrap()).unwrap()
    }

    #[test]
    fn test_straight_line_keeps_descriptors() {
        let iseq = Iseq::new(
            "t",
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
        .with_locals(&["a"]);
        let analysis = run(&iseq);
        assert_eq!(analysis.temp_only, vec![false; 4]);
        assert_eq!(analysis.max_depth, 2);
        assert_eq!(analysis.depth_at(3), Some(1));
        assert_eq!(analysis.sweeps, 1);
    }

    #[test]
    fn test_join_of_literal_and_local_forces_both_producers() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                StackInsn::BranchUnless { offset: 2 },
                StackInsn::PutObject {
                    value: Literal::Int(0),
                },
                StackInsn::Jump { offset: 1 },
                StackInsn::GetLocal { idx: 1, level: 0 },
                StackInsn::Leave,
            ],
        )
        .with_locals(&["c", "x"]);
        let analysis = run(&iseq);
        assert!(analysis.temp_only[2]);
        assert!(analysis.temp_only[4]);
        assert!(!analysis.temp_only[0]);
        assert_eq!(analysis.label_type[5], LabelType::Branch);
        assert_eq!(
            analysis.saved_at(5).unwrap(),
            &[AbstractSlot::temp(2)][..]
        );
    }

    #[test]
    fn test_equal_descriptors_survive_a_join() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::GetLocal { idx: 1, level: 0 },
                StackInsn::GetLocal { idx: 0, level: 0 },
                StackInsn::BranchIf { offset: 0 },
                StackInsn::Leave,
            ],
        )
        .with_locals(&["c", "x"]);
        let analysis = run(&iseq);
        assert_eq!(analysis.temp_only, vec![false; 4]);
        assert_eq!(
            analysis.saved_at(3).unwrap()[0].kind,
            SlotKind::Loc(1)
        );
    }

    #[test]
    fn test_catch_region_bounds_hold_only_temporaries() {
        let mut iseq = Iseq::new(
            "t",
            IseqKind::Method,
            vec![
                StackInsn::PutObject {
                    value: Literal::Int(1),
                },
                StackInsn::GetLocal { idx: 0, level: 0 },
                StackInsn::PutNil,
                StackInsn::Pop,
                StackInsn::Pop,
                StackInsn::Leave,
                StackInsn::Pop,
                StackInsn::Pop,
                StackInsn::Leave,
            ],
        )
        .with_locals(&["a"]);
        iseq.catch_table.push(CatchEntry {
            kind: CatchKind::Rescue,
            start: 2,
            end: 3,
            cont: 6,
            depth: 2,
            iseq: None,
        });
        let analysis = run(&iseq);
        // Both live slots at the region start are materialized...
        assert!(analysis.temp_only[0]);
        assert!(analysis.temp_only[1]);
        // ...and so is the value live at its end.
        assert!(analysis.temp_only[2]);
        assert_eq!(analysis.label_type[6], LabelType::Cont);
        assert_eq!(analysis.depth_at(6), Some(3));
        assert!(analysis
            .saved_at(6)
            .unwrap()
            .iter()
            .all(AbstractSlot::is_temp));
    }

    #[test]
    fn test_malformed_catch_entry_is_ignored() {
        let mut iseq = Iseq::new("t", IseqKind::Top, vec![StackInsn::PutNil, StackInsn::Leave]);
        iseq.catch_table.push(CatchEntry {
            kind: CatchKind::Ensure,
            start: 0,
            end: 2,
            cont: 1,
            depth: 0,
            iseq: None,
        });
        let analysis = run(&iseq);
        assert_eq!(analysis.catch_valid, vec![false]);
        assert!(!analysis.catch_bound[0]);
    }

    #[test]
    fn test_unknown_slots_adopt_incoming_descriptor() {
        let mut kept = AbstractSlot::new(SlotKind::Unknown, 0);
        let incoming = AbstractSlot::new(SlotKind::Loc(2), 3);
        assert!(!kept.same_descriptor(&incoming));
        kept = incoming.clone();
        assert!(kept.same_descriptor(&incoming));
        assert!(AbstractSlot::new(SlotKind::Val(Literal::Float(0.0)), 1)
            .same_descriptor(&AbstractSlot::new(SlotKind::Val(Literal::Float(0.0)), 7)));
    }

    #[test]
    fn test_unreached_code_has_no_depth() {
        let iseq = Iseq::new(
            "t",
            IseqKind::Top,
            vec![StackInsn::PutNil, StackInsn::Leave, StackInsn::PutNil, StackInsn::Leave],
        );
        let analysis = run(&iseq);
        assert!(analysis.reached(1));
        assert!(!analysis.reached(2));
    }

    #[test]
    fn test_line_change_forces_materialization() {
        let mut iseq = Iseq::new(
            "t",
            IseqKind::Top,
            vec![
                StackInsn::GetLocal { idx: 0, level: 0 },
                StackInsn::Leave,
            ],
        )
        .with_locals(&["a"]);
        iseq.events = vec![
            crate::iseq::EventEntry {
                pos: 0,
                line: 1,
                events: crate::iseq::EventFlags::LINE,
            },
            crate::iseq::EventEntry {
                pos: 1,
                line: 2,
                events: crate::iseq::EventFlags::LINE,
            },
        ];
        let analysis = run(&iseq);
        assert!(analysis.temp_only[0]);
    }

    #[derive(Debug, Clone)]
    enum Operand {
        Local(u32),
        Int(i64),
        SelfRef,
    }

    fn operand() -> impl Strategy<Value = Operand> {
        prop_oneof![
            (0u32..3).prop_map(Operand::Local),
            (-3i64..3).prop_map(Operand::Int),
            Just(Operand::SelfRef),
        ]
    }

    fn push(operand: &Operand) -> StackInsn {
        match operand {
            Operand::Local(idx) => StackInsn::GetLocal { idx: *idx, level: 0 },
            Operand::Int(n) => StackInsn::PutObject {
                value: Literal::Int(*n),
            },
            Operand::SelfRef => StackInsn::PutSelf,
        }
    }

    /// `[base, c ? then : else]`, optionally followed by a loop that
    /// reassigns local 2 while both values sit on the stack.
    fn branchy(base: &Operand, then: &Operand, other: &Operand, rebind: bool) -> Iseq {
        let mut insns = vec![
            push(base),
            StackInsn::GetLocal { idx: 0, level: 0 },
            StackInsn::BranchUnless { offset: 2 },
            push(then),
            StackInsn::Jump { offset: 1 },
            push(other),
        ];
        if rebind {
            let head = insns.len() as i32;
            insns.extend([
                StackInsn::GetLocal { idx: 2, level: 0 },
                StackInsn::PutObject {
                    value: Literal::Int(1),
                },
                StackInsn::OptPlus,
                StackInsn::SetLocal { idx: 2, level: 0 },
                StackInsn::GetLocal { idx: 2, level: 0 },
                StackInsn::PutObject {
                    value: Literal::Int(10),
                },
                StackInsn::OptLt,
            ]);
            let back = head - insns.len() as i32 - 1;
            insns.push(StackInsn::BranchIf { offset: back });
        }
        insns.extend([StackInsn::NewArray { count: 2 }, StackInsn::Leave]);
        Iseq::new("t", IseqKind::Method, insns).with_locals(&["c", "x", "a"])
    }

    /// Abstract stack after `insn`, recomputed from the final marks.
    fn replay(
        analysis: &Analysis,
        insn: &StackInsn,
        pos: usize,
        mut stack: Vec<AbstractSlot>,
    ) -> Vec<AbstractSlot> {
        let slot = |kind: SlotKind| {
            if analysis.temp_only[pos] {
                AbstractSlot::temp(pos)
            } else {
                AbstractSlot::new(kind, pos)
            }
        };
        match insn {
            StackInsn::GetLocal { idx, .. } => stack.push(slot(SlotKind::Loc(*idx))),
            StackInsn::PutObject { value } => stack.push(slot(SlotKind::Val(value.clone()))),
            StackInsn::PutSelf => stack.push(slot(SlotKind::SelfRef)),
            StackInsn::SetLocal { idx, .. } => {
                stack.pop();
                for slot in &mut stack {
                    if slot.kind == SlotKind::Loc(*idx) {
                        slot.kind = SlotKind::Temp;
                    }
                }
            }
            StackInsn::BranchIf { .. } | StackInsn::BranchUnless { .. } | StackInsn::Leave => {
                stack.pop();
            }
            StackInsn::Jump { .. } => {}
            other => {
                let depth = other.depth_after(stack.len());
                stack.truncate(depth - 1);
                stack.push(AbstractSlot::temp(pos));
            }
        }
        stack
    }

    /// Every edge into a label agrees with the stack saved there, slot by
    /// slot, unless the saved slot is a temporary.
    fn assert_joins_agree(iseq: &Iseq, analysis: &Analysis) {
        let check = |incoming: &[AbstractSlot], label: usize| {
            let saved = analysis.saved_at(label).unwrap();
            assert_eq!(saved.len(), incoming.len(), "depth at {}", label);
            for (kept, arriving) in saved.iter().zip(incoming) {
                if kept.is_temp() {
                    assert!(arriving.is_temp(), "{:?} joins a temporary at {}", arriving, label);
                } else {
                    assert!(
                        kept.same_descriptor(arriving),
                        "{:?} vs {:?} at {}",
                        kept,
                        arriving,
                        label
                    );
                }
            }
        };
        let mut stack = Vec::new();
        for (pos, insn) in iseq.insns.iter().enumerate() {
            if analysis.is_label(pos) {
                stack = analysis.saved_at(pos).unwrap().to_vec();
            } else if !analysis.reached(pos) {
                continue;
            }
            let after = replay(analysis, insn, pos, stack.clone());
            if let Some(offset) = insn.branch_offset() {
                check(&after, Iseq::branch_target(pos, offset).unwrap());
            }
            if !insn.ends_block() && analysis.is_label(pos + 1) {
                check(&after, pos + 1);
            }
            stack = after;
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_join_slots_agree_or_materialize(
            base in operand(),
            then in operand(),
            other in operand(),
            rebind in any::<bool>(),
        ) {
            let iseq = branchy(&base, &then, &other, rebind);
            let analysis = run(&iseq);
            assert_joins_agree(&iseq, &analysis);

            if rebind {
                // Neither value may keep reading `a` across its reassignment
                let reads_a = |operand: &Operand| matches!(operand, Operand::Local(2));
                let head = analysis.saved_at(6).unwrap();
                if reads_a(&base) {
                    prop_assert!(head[0].is_temp(), "{:?}", head);
                }
                if reads_a(&then) || reads_a(&other) {
                    prop_assert!(head[1].is_temp(), "{:?}", head);
                }
            }
        }
    }
}
