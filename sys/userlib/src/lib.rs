// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library.
//!
//! This contains trap stubs and types, and re-exports the contents of the
//! `abi` crate that gets shared with the kernel.
//!
//! # Trap stubs
//!
//! Every stub goes through `kern::arch::trap`, which loads the trap number
//! into r11 and up to seven arguments into r4-r10, and hands back r4-r6.
//! Traps that can fail put a `ResponseCode` in the first result register;
//! the stubs turn that into a `Result`.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

use kern::arch::trap;

pub mod hl;

/// Decodes the status a trap leaves in its first result register.
fn status(raw: usize) -> Result<(), ResponseCode> {
    match ResponseCode::try_from(raw as u32) {
        Ok(rc) if rc.is_success() => Ok(()),
        Ok(rc) => Err(rc),
        // The kernel only writes codes it knows.
        Err(()) => sys_end_task(),
    }
}

/// Gives up the processor to the next task of equal or higher priority.
#[inline(always)]
pub fn sys_yield() {
    trap(Sysnum::Yield, &[0; 7]);
}

/// Ends the calling task. Its locks are handed on and its stack is reclaimed
/// later by the kernel.
#[inline(always)]
pub fn sys_end_task() -> ! {
    trap(Sysnum::EndTask, &[0; 7]);
    // The kernel never resumes an ended task.
    loop {
        core::hint::spin_loop();
    }
}

/// Registers a task whose stack the caller has already allocated. Most code
/// wants `hl::create_task` instead, which does the allocating.
#[inline(always)]
pub fn sys_register_task(
    entry: usize,
    stack_base: usize,
    stack_size: usize,
    priority: Priority,
    period: u32,
) -> Result<TaskId, ResponseCode> {
    let [rc, id, _] = trap(
        Sysnum::RegisterTask,
        &[
            entry,
            stack_base,
            stack_size,
            usize::from(priority.0),
            period as usize,
            0,
            0,
        ],
    );
    status(rc)?;
    TaskId::try_from(id as u32).map_err(|()| ResponseCode::NoSuchTask)
}

/// Switches straight to `target`, which must be ready or sleeping. The caller
/// stays ready.
#[inline(always)]
pub fn sys_task_switch(target: TaskId) -> Result<(), ResponseCode> {
    let [rc, ..] =
        trap(Sysnum::TaskSwitch, &[u32::from(target) as usize, 0, 0, 0, 0, 0, 0]);
    status(rc)
}

/// Takes `lock`, blocking until it's handed over if someone else has it.
#[inline(always)]
pub fn sys_acquire(lock: LockId) -> Result<(), ResponseCode> {
    let [rc, ..] = trap(Sysnum::Acquire, &[usize::from(lock.0), 0, 0, 0, 0, 0, 0]);
    status(rc)
}

#[inline(always)]
pub fn sys_release(lock: LockId) -> Result<(), ResponseCode> {
    let [rc, ..] = trap(Sysnum::Release, &[usize::from(lock.0), 0, 0, 0, 0, 0, 0]);
    status(rc)
}

#[inline(always)]
pub fn sys_create_lock(kind: LockKind) -> Result<LockId, ResponseCode> {
    let [rc, id, _] =
        trap(Sysnum::CreateLock, &[kind as u32 as usize, 0, 0, 0, 0, 0, 0]);
    status(rc)?;
    Ok(LockId(id as u16))
}

/// Returns the caller's handle and pid.
#[inline(always)]
pub fn sys_current_task() -> (TaskId, u32) {
    let [id, pid, _] = trap(Sysnum::CurrentTask, &[0; 7]);
    // The kernel hands out only handles that fit.
    let Ok(id) = TaskId::try_from(id as u32) else {
        sys_end_task()
    };
    (id, pid as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_decode_from_sign_extended_registers() {
        assert_eq!(status(0), Ok(()));
        assert_eq!(status(-3isize as usize), Err(ResponseCode::TaskTableFull));
        assert_eq!(status(-6isize as usize), Err(ResponseCode::NotOwner));
    }
}
