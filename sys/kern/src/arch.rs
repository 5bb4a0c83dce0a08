// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names: the `SavedContext` and `ExceptionFrame` layouts, `trap`,
//! `wait_for_interrupt`, and `start_first_task`. Building and finding a
//! task's context from those is common to all of them, and lives here.

use core::mem::size_of;

use abi::Sysnum;

use crate::fail::die;
use crate::task::Task;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}

/// Builds a context at the top of `task`'s stack that, once restored, starts
/// the task at its entry point, unprivileged, returning into the exit
/// trampoline.
pub fn initialize_frame(task: &mut Task) {
    let stack = task.stack();
    let top = stack.end() & !0x7;
    let Some(ctx_at) = top
        .checked_sub(size_of::<ExceptionFrame>() + size_of::<SavedContext>())
    else {
        die("stack too small for a frame");
    };
    let frame_at = ctx_at + size_of::<SavedContext>();

    // Safety: the stack was checked against the heaps when the task was
    // created, and isn't running, so nobody else is using this memory.
    let frame = unsafe { stack.view_mut::<ExceptionFrame>(frame_at) };
    let ctx = unsafe { stack.view_mut::<SavedContext>(ctx_at) };
    match (frame, ctx) {
        (Some(frame), Some(ctx)) => {
            *frame = ExceptionFrame::initial(task.entry(), task_exit as usize);
            *ctx = SavedContext::initial();
        }
        _ => die("stack too small for a frame"),
    }
    task.set_saved_sp(ctx_at);
}

/// Produces the saved register block of a task that isn't running.
pub fn saved_context(task: &mut Task) -> &mut SavedContext {
    let sp = task.saved_sp();
    // Safety: `saved_sp` was checked against the stack when it was recorded,
    // and the task isn't running to change it.
    match unsafe { task.stack().view_mut::<SavedContext>(sp) } {
        Some(ctx) => ctx,
        None => die(format_args!("saved context at {sp:#x} outside stack")),
    }
}

/// Where a task's entry function returns to.
extern "C" fn task_exit() -> ! {
    trap(Sysnum::EndActivation, &[0; 7]);
    die("task ran past the end of its activation")
}
