// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is false until the kernel
//!   reaches `die` (either explicitly or as a result of a `panic!`), at which
//!   point it becomes true. If it contains any other value, the kernel has
//!   corrupted memory on the way down.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine writes
//!   `file:line: reason` into this buffer (as UTF-8), truncating if the buffer
//!   fills. For printing, trim off any trailing NUL bytes.
//!
//! On hosts, `die` panics instead, so tests can watch the kernel fail.

use core::fmt::Display;
use core::panic::Location;

#[cfg(target_os = "none")]
use core::{fmt::Write, sync::atomic::Ordering};

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[cfg(target_os = "none")]
#[used]
#[no_mangle]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of the
/// event that caused the kernel to fail, padded with NULs.
#[cfg(target_os = "none")]
#[used]
#[no_mangle]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: we only reach this from `die_impl`, with the kernel entry points
    // serialized, so there's no concurrent access to the flag.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive failure. Panicking again would only make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution of this function gets past the flag above.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Halts the system, recording `msg` and the caller's location.
#[track_caller]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(Location::caller(), &msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(site: &Location<'_>, msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{}:{}: {msg}", site.file(), site.line()).ok();

    #[cfg(all(feature = "klog-semihosting", target_arch = "arm"))]
    cortex_m_semihosting::hprintln!(
        "kernel died at {}:{}: {}",
        site.file(),
        site.line(),
        msg
    );

    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(site: &Location<'_>, msg: &dyn Display) -> ! {
    panic!("kernel died at {}:{}: {msg}", site.file(), site.line())
}

#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    match info.location() {
        Some(site) => die_impl(site, &info.message()),
        None => die(info.message()),
    }
}
