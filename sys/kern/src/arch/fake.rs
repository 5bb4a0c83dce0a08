// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the ARM-M support.
//!
//! Frames have the same shape as on ARMv6-M, but are built from `usize` so
//! they can live in ordinary host memory, and `resume` plays the part of the
//! exception-return hardware so tests can see where a restored task would
//! start. Nothing here can actually run a task: `trap` and
//! `start_first_task` panic.

use core::cell::Cell;
use core::mem::size_of;

use abi::Sysnum;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fail::die;
use crate::task::{ArchState, Task};

/// Thumb bit; the only thing a fresh task needs in its PSR.
pub const INITIAL_PSR: usize = 1 << 24;

/// Return to Thread mode on the process stack, no FP state.
pub const EXC_RETURN_CONST: usize = 0xFFFF_FFFD;

/// Registers the hardware stacks on exception entry.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r12: usize,
    pub lr: usize,
    pub pc: usize,
    pub xpsr: usize,
}

impl ExceptionFrame {
    pub fn initial(entry: usize, exit: usize) -> Self {
        Self {
            lr: exit,
            pc: entry & !1,
            xpsr: INITIAL_PSR,
            ..Self::default()
        }
    }
}

/// Registers the kernel saves below the hardware frame.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SavedContext {
    /// Keeps the block a multiple of 8 bytes, as on target.
    pad: usize,
    r4: usize,
    r5: usize,
    r6: usize,
    r7: usize,
    r8: usize,
    r9: usize,
    r10: usize,
    r11: usize,
    exc_return: usize,
}

impl SavedContext {
    pub fn initial() -> Self {
        Self {
            exc_return: EXC_RETURN_CONST,
            ..Self::default()
        }
    }

    pub fn exc_return(&self) -> usize {
        self.exc_return
    }

    /// Loads the registers a task would have set up at its trap site.
    pub fn set_trap(&mut self, nr: u32, args: &[usize; 7]) {
        [
            self.r4, self.r5, self.r6, self.r7, self.r8, self.r9, self.r10,
        ] = *args;
        self.r11 = nr as usize;
    }

    /// Result registers, as the task's trap stub would read them back.
    pub fn results(&self) -> [usize; 3] {
        [self.r4, self.r5, self.r6]
    }
}

impl ArchState for SavedContext {
    fn arg0(&self) -> usize {
        self.r4
    }
    fn arg1(&self) -> usize {
        self.r5
    }
    fn arg2(&self) -> usize {
        self.r6
    }
    fn arg3(&self) -> usize {
        self.r7
    }
    fn arg4(&self) -> usize {
        self.r8
    }
    fn arg5(&self) -> usize {
        self.r9
    }
    fn arg6(&self) -> usize {
        self.r10
    }

    fn ret0(&mut self, x: usize) {
        self.r4 = x
    }
    fn ret1(&mut self, x: usize) {
        self.r5 = x
    }
    fn ret2(&mut self, x: usize) {
        self.r6 = x
    }
}

thread_local! {
    /// Model of the CONTROL register: bit 0 set means Thread mode is
    /// unprivileged, bit 1 set means Thread mode uses the process stack.
    static CONTROL: Cell<u32> = const { Cell::new(0) };
}

/// Performs the boot sequence's one-way drop to unprivileged Thread mode on
/// the process stack.
pub fn demote_privilege() {
    CONTROL.with(|c| c.set(0b11));
}

pub fn control() -> u32 {
    CONTROL.with(Cell::get)
}

/// Processor state right after an exception return.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResumePoint {
    pub pc: usize,
    pub lr: usize,
    pub xpsr: usize,
    pub stack_pointer: usize,
    pub handler_mode: bool,
    pub process_stack: bool,
    pub privileged: bool,
}

/// Does what the restore sequence and exception return would do with
/// `task`'s saved context.
pub fn resume(task: &mut Task) -> ResumePoint {
    let exc_return = crate::arch::saved_context(task).exc_return;
    let frame_at = task.saved_sp() + size_of::<SavedContext>();
    // Safety: test-only model; the frame sits just above the context that
    // `saved_context` already checked.
    let Some(frame) =
        (unsafe { task.stack().view_mut::<ExceptionFrame>(frame_at) })
    else {
        die(format_args!("no exception frame at {frame_at:#x}"));
    };
    let handler_mode = exc_return & 0b1000 == 0;
    ResumePoint {
        pc: frame.pc,
        lr: frame.lr,
        xpsr: frame.xpsr,
        stack_pointer: frame_at + size_of::<ExceptionFrame>(),
        handler_mode,
        process_stack: exc_return & 0b0100 != 0,
        privileged: handler_mode || control() & 1 == 0,
    }
}

pub fn trap(nr: Sysnum, _args: &[usize; 7]) -> [usize; 3] {
    panic!("trap {nr:?} outside a task");
}

pub fn wait_for_interrupt() {
    std::thread::yield_now();
}

pub fn start_first_task(_tick_divisor: u32) -> ! {
    panic!("entering userland");
}
