// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event trace.
//!
//! The kernel keeps a small ring of recent scheduling and locking events,
//! meant to be read out of a halted target with a debugger (or out of a
//! `Kernel` in tests). Each entry records the source line that produced it. An
//! event identical to the most recent one (same line, same payload) bumps that
//! entry's `count` instead of taking a new slot, so a task spinning on `yield`
//! doesn't wash out everything else.

use abi::{FaultInfo, LockId};

/// Records `$event` in `$trace`, tagged with the current source line.
#[macro_export]
macro_rules! klog {
    ($trace:expr, $event:expr) => {
        $trace.record(line!() as u16, $event)
    };
}

/// Things worth remembering about the kernel's recent past. Task fields are
/// task-table indices.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    None,
    Bootstrap,
    TaskCreated { task: usize, pid: u32 },
    TaskEnded { task: usize },
    TaskFaulted { task: usize, fault: FaultInfo },
    ActivationEnded { task: usize },
    PeriodicWake { task: usize },
    Dispatch { task: usize },
    Idle,
    LockBlocked { task: usize, lock: LockId },
    LockHandOff { lock: LockId, to: usize },
    LockAbandoned { lock: LockId, by: usize },
    Reaped { task: usize },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub event: Event,
}

impl TraceEntry {
    const EMPTY: Self = Self {
        line: 0,
        generation: 0,
        count: 0,
        event: Event::None,
    };
}

pub struct Trace<const N: usize> {
    last: Option<usize>,
    entries: [TraceEntry; N],
}

impl<const N: usize> Trace<N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            entries: [TraceEntry::EMPTY; N],
        }
    }

    pub fn record(&mut self, line: u16, event: Event) {
        // On first use `last` is None, which we treat as an out-of-range index
        // so that the first entry lands in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.entries.get_mut(last) {
            if ent.line == line && ent.event == event {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= N {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.entries[ndx];
        *ent = TraceEntry {
            line,
            event,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Most recent entry, if anything has been recorded.
    pub fn latest(&self) -> Option<&TraceEntry> {
        self.last.and_then(|i| self.entries.get(i))
    }

    /// Iterates over recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> + '_ {
        let start = self.last.map(|l| l + 1).unwrap_or(0);
        self.entries[start..]
            .iter()
            .chain(self.entries[..start].iter())
            .filter(|e| e.count != 0)
    }

    /// Counts occurrences of events matching `pred`, including deduplicated
    /// repeats.
    pub fn count(&self, mut pred: impl FnMut(&Event) -> bool) -> u32 {
        self.iter()
            .filter(|e| pred(&e.event))
            .map(|e| e.count)
            .sum()
    }
}

impl<const N: usize> Default for Trace<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_folded() {
        let mut t = Trace::<4>::new();
        t.record(10, Event::Idle);
        t.record(10, Event::Idle);
        t.record(10, Event::Idle);
        let e = t.latest().unwrap();
        assert_eq!(e.count, 3);
        assert_eq!(t.iter().count(), 1);
    }

    #[test]
    fn same_event_from_another_line_is_distinct() {
        let mut t = Trace::<4>::new();
        t.record(10, Event::Idle);
        t.record(11, Event::Idle);
        assert_eq!(t.iter().count(), 2);
    }

    #[test]
    fn wraps_oldest_first() {
        let mut t = Trace::<3>::new();
        for task in 0..5 {
            t.record(1, Event::Dispatch { task });
        }
        let order: Vec<_> = t
            .iter()
            .map(|e| match e.event {
                Event::Dispatch { task } => task,
                _ => usize::MAX,
            })
            .collect();
        assert_eq!(order, [2, 3, 4]);
        assert_eq!(t.count(|e| matches!(e, Event::Dispatch { .. })), 3);
    }
}
