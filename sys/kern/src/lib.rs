// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small real-time kernel for single-core microcontrollers.
//!
//! Tasks are created and ended at run time, with stacks carved out of a
//! buddy-allocated heap. The scheduler is preemptive and priority-ordered,
//! with round-robin time slicing inside a priority band and optional
//! periodic reactivation. Tasks coordinate through kernel semaphores and
//! mutexes, which hand ownership to waiters in arrival order.
//!
//! This code outside of the `arch` module is portable, and is tested on the
//! host against a simulated architecture. Only ARMv6-M, ARMv7-M and ARMv8-M
//! run tasks for real.
//!
//! # Design principles
//!
//! 1. One kernel object. All scheduler, lock and task state lives in a single
//!    `Kernel`, built at startup and handed to each entry point; nothing else
//!    in the kernel is mutable global state.
//! 2. Static sizing. Tables have capacities fixed at build time by
//!    `build.rs`; running out is an error a task can see, not an allocation.
//! 3. A strong preference for safe code where reasonable. Tasks and locks are
//!    referred to by index and handle, not by pointer.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]

/// Checks a kernel invariant, dying with the condition (or the given message)
/// if it doesn't hold.
#[macro_export]
macro_rules! uassert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::fail::die(concat!("assertion failed: ", stringify!($cond)))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fail::die(format_args!($($arg)+))
        }
    };
}

pub mod config {
    include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));
}

pub mod arch;
pub mod buddy;
pub mod cell;
pub mod err;
pub mod fail;
pub mod heap;
pub mod kernel;
pub mod klog;
pub mod list;
pub mod profiling;
pub mod sched;
pub mod startup;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod umem;

// Handles carry table indices in narrow fields.
static_assertions::const_assert!(config::LOCK_SLOTS <= u16::MAX as usize);
static_assertions::const_assert!(config::TASK_SLOTS <= abi::TaskId::INDEX_MASK as usize + 1);
