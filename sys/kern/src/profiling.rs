// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hooks for timing the kernel from outside.
//!
//! The kernel doesn't know how a board wants to get timing out, so a board
//! that cares fills in an `EventsTable` and passes it to
//! `configure_events_table` before starting the kernel. The usual hook sets
//! or clears a GPIO for a logic analyzer to watch. Hooks run inside kernel
//! entry points with interrupts effectively masked, so keep them short.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Board-supplied hooks for kernel events.
///
/// Every hook is required; stub out the ones you don't care about with
/// `|| ()`, which costs less than checking for a missing hook on every event.
pub struct EventsTable {
    /// A task trapped into the kernel, with the trap number.
    pub trap_enter: fn(u32),
    /// The kernel is about to return from a trap.
    pub trap_exit: fn(),
    /// Entry to the deferred task switch an interrupt asked for (PendSV on
    /// ARM-M).
    pub switch_enter: fn(),
    pub switch_exit: fn(),
    /// Entry to the tick interrupt.
    pub tick_enter: fn(),
    pub tick_exit: fn(),

    /// The running task changed; gets the new task's slot.
    pub context_switch: fn(usize),
}

/// Installs `table`. Later calls replace earlier ones.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Null until a table is configured; only ever holds a `&'static`. Written
/// once at startup, so `Relaxed` is plenty.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    // Safety: only `configure_events_table` writes this, from a `&'static`.
    unsafe { p.as_ref() }
}

pub(crate) fn trap_enter(nr: u32) {
    if let Some(t) = table() {
        (t.trap_enter)(nr)
    }
}

pub(crate) fn trap_exit() {
    if let Some(t) = table() {
        (t.trap_exit)()
    }
}

pub(crate) fn switch_enter() {
    if let Some(t) = table() {
        (t.switch_enter)()
    }
}

pub(crate) fn switch_exit() {
    if let Some(t) = table() {
        (t.switch_exit)()
    }
}

pub(crate) fn tick_enter() {
    if let Some(t) = table() {
        (t.tick_enter)()
    }
}

pub(crate) fn tick_exit() {
    if let Some(t) = table() {
        (t.tick_exit)()
    }
}

pub(crate) fn context_switch(task: usize) {
    if let Some(t) = table() {
        (t.context_switch)(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static TRAPS: AtomicUsize = AtomicUsize::new(0);

    static TABLE: EventsTable = EventsTable {
        trap_enter: |nr| {
            TRAPS.fetch_add(nr as usize, Ordering::Relaxed);
        },
        trap_exit: || (),
        switch_enter: || (),
        switch_exit: || (),
        tick_enter: || (),
        tick_exit: || (),
        // Scheduler tests dispatch concurrently with this one.
        context_switch: |_| (),
    };

    // The only test that installs a table, and nothing else on the host
    // traps, so the counter is ours.
    #[test]
    fn installed_hooks_see_events() {
        configure_events_table(&TABLE);
        trap_enter(4);
        trap_exit();
        trap_enter(2);
        assert_eq!(TRAPS.load(Ordering::Relaxed), 6);
    }
}
