// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cells for the kernel's few statics.
//!
//! These only use atomic loads and stores, never read-modify-write, so they
//! work on ARMv6-M. That's sound because everything that touches them runs
//! either at boot, before interrupts are on, or in a kernel entry point, and
//! kernel entry points all share one exception priority and so never preempt
//! each other.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::fail::die;

/// A value filled in once at startup and shared from then on.
pub struct InstallOnce<T> {
    installed: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: the contents are written exactly once, before `installed` is set,
// and only shared afterwards.
unsafe impl<T: Sync> Sync for InstallOnce<T> {}

impl<T> InstallOnce<T> {
    pub const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Puts `value` in place. Installing twice is fatal.
    ///
    /// This must happen during boot, before any task or interrupt handler
    /// can call `get`.
    #[track_caller]
    pub fn install(&self, value: T) -> &T {
        if self.installed.load(Ordering::Acquire) {
            die("installed twice");
        }
        // Safety: not yet installed, so nobody holds a reference into the
        // cell, and boot is single-threaded.
        let v = unsafe { (*self.value.get()).write(value) };
        self.installed.store(true, Ordering::Release);
        v
    }

    pub fn get(&self) -> Option<&T> {
        if self.installed.load(Ordering::Acquire) {
            // Safety: installed, and never written again.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Default for InstallOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out `&mut T` to one caller at a time, and kills the kernel if a
/// second caller turns up while the first is still in there.
pub struct Exclusive<T> {
    borrowed: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access is serialized by `borrowed`, per the module docs.
unsafe impl<T: Send> Sync for Exclusive<T> {}

impl<T> Exclusive<T> {
    pub const fn new(value: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if self.borrowed.load(Ordering::Acquire) {
            die("kernel re-entered");
        }
        self.borrowed.store(true, Ordering::Relaxed);
        // Safety: the flag says no other reference exists.
        let r = f(unsafe { &mut *self.value.get() });
        self.borrowed.store(false, Ordering::Release);
        r
    }
}
