// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two heaps: kernel and user.
//!
//! Each heap is a buddy pool behind a kernel lock. Allocation happens in task
//! context, never in a trap, so taking the lock is an ordinary `Acquire` trap
//! that may block; the `LockGate` trait is how a heap gets at those traps
//! without caring whether it's a task on target or a test on the host.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use abi::{LockId, ResponseCode, Sysnum};

use crate::buddy::{BuddyPool, HEADER_SIZE};
use crate::cell::InstallOnce;
use crate::config::STACK_SIZE;
use crate::fail::die;
use crate::umem::Region;

/// Usable bytes of a task stack. Each stack fills one `STACK_SIZE` block,
/// less the pool's header at its front.
pub const TASK_STACK_BYTES: usize = STACK_SIZE - HEADER_SIZE;

/// Something that can take and give back a kernel lock on behalf of the
/// running task.
pub trait LockGate {
    fn acquire(&self, lock: LockId) -> Result<(), ResponseCode>;
    fn release(&self, lock: LockId) -> Result<(), ResponseCode>;
}

/// The gate tasks use: the lock traps themselves.
#[derive(Copy, Clone, Debug, Default)]
pub struct TrapGate;

impl TrapGate {
    fn call(nr: Sysnum, lock: LockId) -> Result<(), ResponseCode> {
        let [status, ..] = crate::arch::trap(nr, &[usize::from(lock.0), 0, 0, 0, 0, 0, 0]);
        match ResponseCode::try_from(status as u32) {
            Ok(rc) if rc.is_success() => Ok(()),
            Ok(rc) => Err(rc),
            Err(_) => die(format_args!("bad status {status:#x} from {nr:?}")),
        }
    }
}

impl LockGate for TrapGate {
    fn acquire(&self, lock: LockId) -> Result<(), ResponseCode> {
        Self::call(Sysnum::Acquire, lock)
    }

    fn release(&self, lock: LockId) -> Result<(), ResponseCode> {
        Self::call(Sysnum::Release, lock)
    }
}

/// A buddy pool and the lock that guards it.
pub struct Heap {
    guard: LockId,
    pool: UnsafeCell<BuddyPool>,
}

// Safety: the pool is only reached through `with_pool`, which holds `guard`
// for the duration.
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(guard: LockId, pool: BuddyPool) -> Self {
        Self {
            guard,
            pool: UnsafeCell::new(pool),
        }
    }

    pub fn guard(&self) -> LockId {
        self.guard
    }

    /// Memory this heap hands out.
    pub fn region(&self) -> Region {
        // Safety: the region is fixed at construction; reading it can't race
        // with anything a lock holder does.
        unsafe { (*self.pool.get()).region() }
    }

    /// Runs `f` on the pool with the guard held.
    pub fn with_pool<R>(
        &self,
        gate: &impl LockGate,
        f: impl FnOnce(&mut BuddyPool) -> R,
    ) -> Result<R, ResponseCode> {
        gate.acquire(self.guard)?;
        // Safety: we hold the guard, so nobody else is in here.
        let r = f(unsafe { &mut *self.pool.get() });
        if let Err(rc) = gate.release(self.guard) {
            die(format_args!("heap guard {:?} release failed: {rc:?}", self.guard));
        }
        Ok(r)
    }

    /// Allocates at least `size` bytes, or `None` if the pool can't fit it.
    pub fn allocate(&self, gate: &impl LockGate, size: usize) -> Option<NonNull<u8>> {
        self.with_pool(gate, |p| p.allocate(size)).ok().flatten()
    }

    /// Gives back a block from `allocate`. Anything else is fatal.
    pub fn free(&self, gate: &impl LockGate, ptr: NonNull<u8>) -> Result<(), ResponseCode> {
        self.with_pool(gate, |p| p.free(ptr))
    }
}

pub struct Heaps {
    pub kernel: Heap,
    pub user: Heap,
}

static HEAPS: InstallOnce<Heaps> = InstallOnce::new();

/// Makes the heaps available to tasks. Boot-time only.
pub fn install(heaps: Heaps) -> &'static Heaps {
    HEAPS.install(heaps)
}

pub fn heaps() -> &'static Heaps {
    match HEAPS.get() {
        Some(h) => h,
        None => die("heaps used before boot"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::test_memory::TestMemory;
    use crate::buddy::Orders;
    use core::cell::{Cell, RefCell};

    /// Records lock traffic and refuses to double-acquire.
    #[derive(Default)]
    struct Gate {
        held: Cell<bool>,
        log: RefCell<Vec<(bool, LockId)>>,
    }

    impl LockGate for Gate {
        fn acquire(&self, lock: LockId) -> Result<(), ResponseCode> {
            assert!(!self.held.replace(true));
            self.log.borrow_mut().push((true, lock));
            Ok(())
        }

        fn release(&self, lock: LockId) -> Result<(), ResponseCode> {
            if !self.held.replace(false) {
                return Err(ResponseCode::NotOwner);
            }
            self.log.borrow_mut().push((false, lock));
            Ok(())
        }
    }

    struct Refusing;

    impl LockGate for Refusing {
        fn acquire(&self, _: LockId) -> Result<(), ResponseCode> {
            Err(ResponseCode::HeldLockTableFull)
        }
        fn release(&self, _: LockId) -> Result<(), ResponseCode> {
            unreachable!()
        }
    }

    const ORDERS: Orders = Orders { min: 5, max: 12 };

    #[test]
    fn every_pool_touch_is_bracketed_by_the_guard() {
        let mem = TestMemory::aligned(12);
        let heap = Heap::new(LockId(3), mem.pool(ORDERS));
        let gate = Gate::default();

        let p = heap.allocate(&gate, 100).unwrap();
        assert!(heap.region().contains(p.as_ptr() as usize));
        heap.free(&gate, p).unwrap();
        assert!(!gate.held.get());
        assert_eq!(
            *gate.log.borrow(),
            vec![
                (true, LockId(3)),
                (false, LockId(3)),
                (true, LockId(3)),
                (false, LockId(3)),
            ]
        );
        assert_eq!(heap.with_pool(&gate, |p| p.outstanding()), Ok(0));
    }

    #[test]
    fn lock_failure_leaves_pool_alone() {
        let mem = TestMemory::aligned(12);
        let heap = Heap::new(LockId(0), mem.pool(ORDERS));
        assert_eq!(heap.allocate(&Refusing, 64), None);
        assert_eq!(
            heap.with_pool(&Refusing, |_| ()),
            Err(ResponseCode::HeldLockTableFull)
        );
    }

    #[test]
    fn oversized_request_fails() {
        let mem = TestMemory::aligned(12);
        let heap = Heap::new(LockId(0), mem.pool(ORDERS));
        assert_eq!(heap.allocate(&Gate::default(), 1 << 12), None);
    }
}
