// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for interacting with memory the kernel doesn't own outright: heap
//! regions, and the task stacks carved from them.

use abi::UsageError;
use zerocopy::{FromBytes, IntoBytes, KnownLayout};

/// A span of address space.
///
/// A `Region` handed to the kernel by a task is only an _allegation_ that the
/// memory is usable. The kernel checks it against the regions it manages (see
/// `Region::covers`) before touching it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    base: usize,
    size: usize,
}

impl Region {
    pub const EMPTY: Self = Self { base: 0, size: 0 };

    /// Constructs a `Region` from untrusted numbers.
    ///
    /// This will only succeed if the region is non-empty and would not touch
    /// the top of the address space.
    pub fn from_raw(base: usize, size: usize) -> Result<Self, UsageError> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(UsageError::InvalidStack);
        }
        Ok(Self { base, size })
    }

    /// Describes a chunk of memory the caller is handing over for good.
    pub fn from_static(memory: &'static mut [u8]) -> Self {
        Self {
            base: memory.as_mut_ptr() as usize,
            size: memory.len(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address one past the end.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Checks whether `other` lies entirely within `self`.
    pub fn covers(&self, other: &Region) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// Checks whether a `T` at `addr` would be aligned and lie entirely within
    /// this region.
    pub fn holds<T>(&self, addr: usize) -> bool {
        addr % core::mem::align_of::<T>() == 0
            && addr >= self.base
            && addr
                .checked_add(core::mem::size_of::<T>())
                .is_some_and(|end| end <= self.end())
    }

    /// Produces a view of the `T` at `addr`, or `None` if it wouldn't be
    /// aligned or wouldn't fit in this region.
    ///
    /// # Safety
    ///
    /// The region must be real, writable memory, and nothing else may access
    /// the bytes at `addr` for the life of the returned reference.
    pub unsafe fn view_mut<'a, T>(&self, addr: usize) -> Option<&'a mut T>
    where
        T: FromBytes + IntoBytes + KnownLayout,
    {
        if !self.holds::<T>(addr) {
            return None;
        }
        // Safety: the range is within this region, which our caller promises
        // is exclusively ours for 'a.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(
                addr as *mut u8,
                core::mem::size_of::<T>(),
            )
        };
        T::mut_from_bytes(bytes).ok()
    }
}
