// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent trap implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*` modules.
//!
//! # Trap implementations
//!
//! With only a couple of exceptions, traps are implemented by functions with
//! the signature:
//!
//! ```ignore
//! fn trap(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError>;
//! ```
//!
//! `caller` is the index of the task that trapped. On return, a `NextTask`
//! indicates success with a possible scheduling hint, while a `UserError`
//! indicates a condition that needs to either be returned as a status or
//! recorded as a fault. A common wrapper takes care of the final side
//! effects, reducing code in each trap.
//!
//! Arguments are read from the saved context on the caller's stack, through
//! the proxies on `task::ArchState`.

use abi::{ResponseCode, Sysnum, TaskFlags, UsageError};

use crate::arch;
use crate::err::UserError;
use crate::fail::die;
use crate::kernel::Kernel;
use crate::task::{ArchState, NextTask, TaskDesc};

/// Handles trap `nr` from the current task.
///
/// The first trap the kernel sees comes from the boot sequence, not a task:
/// it switches the scheduler on and is otherwise treated as a yield.
pub fn handle_trap(k: &mut Kernel, nr: u32) -> NextTask {
    if !k.is_switching() {
        return k.begin_switching();
    }
    let Some(caller) = k.current() else {
        die(format_args!("trap {nr} with no current task"));
    };
    safe_syscall_entry(k, nr, caller)
}

fn safe_syscall_entry(k: &mut Kernel, nr: u32, caller: usize) -> NextTask {
    let res = match Sysnum::try_from(nr) {
        Ok(Sysnum::Yield) => Ok(NextTask::Other),
        Ok(Sysnum::EndTask) => Ok(k.end_task(caller, None)),
        Ok(Sysnum::RegisterTask) => register_task(k, caller),
        Ok(Sysnum::TaskSwitch) => task_switch(k, caller),
        Ok(Sysnum::Acquire) => acquire(k, caller),
        Ok(Sysnum::Release) => release(k, caller),
        Ok(Sysnum::EndActivation) => Ok(k.end_activation(caller)),
        Ok(Sysnum::CreateLock) => create_lock(k, caller),
        Ok(Sysnum::Reap) => reap(k, caller),
        Ok(Sysnum::CurrentTask) => Ok(current_task(k, caller)),
        Err(()) => die(format_args!(
            "unknown trap number {nr} ({nr:#x}) from task {caller}"
        )),
    };
    match res {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            arch::saved_context(&mut k.tasks[caller]).set_status(code);
            hint
        }
        Err(UserError::Unrecoverable(fault)) => k.end_task(caller, Some(fault)),
    }
}

fn register_task(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let ctx = arch::saved_context(&mut k.tasks[caller]);
    let args = ctx.as_register_task_args();
    let desc = TaskDesc {
        entry: args.entry(),
        stack: args.stack()?,
        priority: args.priority(),
        period: args.period(),
        flags: TaskFlags::empty(),
    };
    let id = k.create_task(desc)?;

    let ctx = arch::saved_context(&mut k.tasks[caller]);
    ctx.set_status(ResponseCode::Success);
    ctx.ret1(u32::from(id) as usize);

    let child = k.task(id.index()).priority();
    Ok(if child.is_more_important_than(k.task(caller).priority()) {
        NextTask::Other
    } else {
        NextTask::Same
    })
}

fn task_switch(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let target = arch::saved_context(&mut k.tasks[caller]).task_arg()?;
    let next = k.task_switch(caller, target)?;
    arch::saved_context(&mut k.tasks[caller]).set_status(ResponseCode::Success);
    Ok(next)
}

fn acquire(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let lock = arch::saved_context(&mut k.tasks[caller]).lock_arg();
    // Written up front: a caller that blocks reads this once it's been
    // handed the lock.
    arch::saved_context(&mut k.tasks[caller]).set_status(ResponseCode::Success);
    k.acquire(caller, lock)
}

fn release(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let lock = arch::saved_context(&mut k.tasks[caller]).lock_arg();
    let next = k.release(caller, lock)?;
    arch::saved_context(&mut k.tasks[caller]).set_status(ResponseCode::Success);
    Ok(next)
}

fn create_lock(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let kind = arch::saved_context(&mut k.tasks[caller]).lock_kind_arg()?;
    let id = k.create_lock(kind)?;
    let ctx = arch::saved_context(&mut k.tasks[caller]);
    ctx.set_status(ResponseCode::Success);
    ctx.ret1(usize::from(id.0));
    Ok(NextTask::Same)
}

/// Hands the reaper one ended task's stack: base, size and flags, or all
/// zeroes if there's nothing to reclaim. Nobody else gets to take stacks.
fn reap(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    if !k.task(caller).flags().contains(TaskFlags::REAPER) {
        return Err(UsageError::NotReaper.into());
    }
    let r = k.reap();
    let ctx = arch::saved_context(&mut k.tasks[caller]);
    match r {
        Some(r) => {
            ctx.ret0(r.stack.base());
            ctx.ret1(r.stack.size());
            ctx.ret2(r.flags.bits() as usize);
        }
        None => {
            ctx.ret0(0);
            ctx.ret1(0);
            ctx.ret2(0);
        }
    }
    Ok(NextTask::Same)
}

fn current_task(k: &mut Kernel, caller: usize) -> NextTask {
    let id = k.task_id(caller);
    let pid = k.task(caller).pid();
    let ctx = arch::saved_context(&mut k.tasks[caller]);
    ctx.ret0(u32::from(id) as usize);
    ctx.ret1(pid as usize);
    NextTask::Same
}
