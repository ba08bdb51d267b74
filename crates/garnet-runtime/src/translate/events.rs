//! Debug-event bookkeeping shared by the analyzer and the generator

use super::{try_vec, TranslateError};
use crate::iseq::{EventEntry, EventFlags, Iseq};
use thiserror::Error;

/// Two events on different lines competing for one instruction
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("events for lines {first} and {second} cannot share an instruction")]
pub struct LineConflict {
    pub first: u32,
    pub second: u32,
}

/// Line and events attached to one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosEvent {
    pub line: u32,
    pub events: EventFlags,
}

impl PosEvent {
    /// Merge two events that would land on the same instruction.
    ///
    /// An absent side takes the other one. Two events on different lines
    /// cannot share an instruction.
    pub fn combine(
        first: Option<PosEvent>,
        second: Option<PosEvent>,
    ) -> Result<Option<PosEvent>, LineConflict> {
        match (first, second) {
            (None, other) | (other, None) => Ok(other),
            (Some(a), Some(b)) if a.line != b.line => Err(LineConflict {
                first: a.line,
                second: b.line,
            }),
            (Some(a), Some(b)) => Ok(Some(PosEvent {
                line: a.line,
                events: a.events | b.events,
            })),
        }
    }

    pub fn entry(self, pos: usize) -> EventEntry {
        EventEntry {
            pos,
            line: self.line,
            events: self.events,
        }
    }
}

/// Per-position events of `iseq`.
///
/// Entries that only switch a line event off (no events, same line as a
/// preceding line event) are dropped; the generator adds its own.
pub fn position_events(iseq: &Iseq) -> Result<Vec<Option<PosEvent>>, TranslateError> {
    let mut by_pos = try_vec(iseq.insns.len(), None, "event table")?;
    let mut prev: Option<&EventEntry> = None;
    for (i, entry) in iseq.events.iter().enumerate() {
        let keep = !entry.events.is_empty()
            || i == 0
            || prev.map_or(true, |p| {
                !p.events.contains(EventFlags::LINE) || p.line != entry.line
            });
        if keep && entry.pos < by_pos.len() {
            by_pos[entry.pos] = Some(PosEvent {
                line: entry.line,
                events: entry.events,
            });
        }
        prev = Some(entry);
    }
    Ok(by_pos)
}

/// Finish the register event table: pin the first entry to position 0
/// and bound every line-event run with a no-event entry.
pub fn finish_event_table(events: &[EventEntry], code_len: usize) -> Vec<EventEntry> {
    let mut events = events.to_vec();
    if let Some(first) = events.first_mut() {
        first.pos = 0;
    }
    let mut table = Vec::with_capacity(events.len() * 2);
    for i in 0..events.len() {
        let entry = events[i];
        table.push(entry);
        if !entry.events.contains(EventFlags::LINE) {
            continue;
        }
        let next = entry.pos + 1;
        let gap = match events.get(i + 1) {
            Some(following) => following.pos != next,
            None => next < code_len,
        };
        if gap {
            table.push(EventEntry {
                pos: next,
                line: entry.line,
                events: EventFlags::NONE,
            });
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::{IseqKind, StackInsn};
    use pretty_assertions::assert_eq;

    fn ev(line: u32, events: EventFlags) -> Option<PosEvent> {
        Some(PosEvent { line, events })
    }

    #[test]
    fn test_combine() {
        assert_eq!(PosEvent::combine(None, ev(1, EventFlags::LINE)), Ok(ev(1, EventFlags::LINE)));
        assert_eq!(
            PosEvent::combine(ev(1, EventFlags::LINE), ev(1, EventFlags::CALL)),
            Ok(ev(1, EventFlags::LINE | EventFlags::CALL))
        );
        assert_eq!(
            PosEvent::combine(ev(1, EventFlags::LINE), ev(2, EventFlags::LINE)),
            Err(LineConflict { first: 1, second: 2 })
        );
    }

    #[test]
    fn test_switch_off_entries_are_dropped() {
        let mut iseq = Iseq::new("t", IseqKind::Top, vec![StackInsn::PutNil; 4]);
        iseq.events = vec![
            EventEntry { pos: 0, line: 1, events: EventFlags::LINE },
            EventEntry { pos: 1, line: 1, events: EventFlags::NONE },
            EventEntry { pos: 2, line: 2, events: EventFlags::NONE },
        ];
        let events = position_events(&iseq).unwrap();
        assert_eq!(events[0], ev(1, EventFlags::LINE));
        assert_eq!(events[1], None);
        assert_eq!(events[2], ev(2, EventFlags::NONE));
    }

    #[test]
    fn test_entries_past_the_end_are_ignored() {
        let mut iseq = Iseq::new("t", IseqKind::Top, vec![StackInsn::PutNil; 2]);
        iseq.events = vec![EventEntry { pos: 5, line: 3, events: EventFlags::LINE }];
        assert_eq!(position_events(&iseq).unwrap(), vec![None, None]);
    }

    #[test]
    fn test_finish_event_table_bounds_line_runs() {
        let table = finish_event_table(
            &[
                EventEntry { pos: 1, line: 1, events: EventFlags::LINE },
                EventEntry { pos: 4, line: 2, events: EventFlags::LINE },
            ],
            6,
        );
        let positions: Vec<(usize, u32, u32)> =
            table.iter().map(|e| (e.pos, e.line, e.events.0)).collect();
        assert_eq!(positions, vec![(0, 1, 1), (1, 1, 0), (4, 2, 1), (5, 2, 0)]);
    }
}
