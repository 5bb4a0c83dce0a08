// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level user interface.
//!
//! This is intended to provide a more ergonomic interface than the raw
//! traps: heap allocation, task creation that manages its own stack, and
//! locks that release themselves.

use core::ptr::NonNull;

use abi::{LockId, LockKind, Priority, ResponseCode, TaskId};
use kern::heap::{heaps, Heap, LockGate, TrapGate, TASK_STACK_BYTES};

use crate::{sys_create_lock, sys_end_task, sys_register_task};

/// Allocates at least `size` bytes from the user heap.
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    heaps().user.allocate(&TrapGate, size)
}

/// Gives back memory from `alloc`. Anything else is fatal.
pub fn free(ptr: NonNull<u8>) {
    if heaps().user.free(&TrapGate, ptr).is_err() {
        sys_end_task();
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// The user heap has no room for a stack.
    NoMemory,
    /// The kernel turned the task down.
    Refused(ResponseCode),
}

/// Starts a task at `entry` on a fresh stack from the user heap. A nonzero
/// `period` makes it periodic: it first runs after `period` ticks, and again
/// every `period` ticks after its entry function returns.
pub fn create_task(
    entry: fn(),
    priority: Priority,
    period: u32,
) -> Result<TaskId, CreateError> {
    create_task_in(&heaps().user, &TrapGate, TASK_STACK_BYTES, |base| {
        sys_register_task(entry as usize, base, TASK_STACK_BYTES, priority, period)
    })
}

/// Allocates a stack from `heap`, hands it to `register`, and takes the stack
/// back if that fails.
fn create_task_in(
    heap: &Heap,
    gate: &impl LockGate,
    stack_size: usize,
    register: impl FnOnce(usize) -> Result<TaskId, ResponseCode>,
) -> Result<TaskId, CreateError> {
    let stack = heap
        .allocate(gate, stack_size)
        .ok_or(CreateError::NoMemory)?;
    register(stack.as_ptr() as usize).map_err(|rc| {
        if heap.free(gate, stack).is_err() {
            sys_end_task();
        }
        CreateError::Refused(rc)
    })
}

/// A kernel lock.
///
/// A `Semaphore` lock blocks its owner if the owner takes it again; a
/// `Mutex` counts nested acquisitions by its owner instead. Either way,
/// waiters get the lock in the order they asked for it.
#[derive(Debug)]
pub struct Lock<G: LockGate = TrapGate> {
    id: LockId,
    gate: G,
}

impl Lock {
    pub fn new(kind: LockKind) -> Result<Self, ResponseCode> {
        Ok(Self::from_parts(sys_create_lock(kind)?, TrapGate))
    }
}

impl<G: LockGate> Lock<G> {
    /// Wraps a lock that already exists, such as one of the heap guards.
    pub fn from_parts(id: LockId, gate: G) -> Self {
        Self { id, gate }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Takes the lock until the returned guard is dropped.
    pub fn lock(&self) -> Result<LockGuard<'_, G>, ResponseCode> {
        self.gate.acquire(self.id)?;
        Ok(LockGuard { lock: self })
    }
}

/// Holds a `Lock`, releasing it on drop.
#[must_use]
#[derive(Debug)]
pub struct LockGuard<'a, G: LockGate> {
    lock: &'a Lock<G>,
}

impl<G: LockGate> Drop for LockGuard<'_, G> {
    fn drop(&mut self) {
        // We hold it, so this can only fail if the kernel lost track, and
        // there's nothing sensible left to do.
        if self.lock.gate.release(self.lock.id).is_err() {
            sys_end_task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern::buddy::{BuddyPool, Orders};
    use kern::umem::Region;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::cell::RefCell;

    #[derive(Debug, Default)]
    struct Gate {
        log: RefCell<Vec<(bool, LockId)>>,
    }

    impl LockGate for Gate {
        fn acquire(&self, lock: LockId) -> Result<(), ResponseCode> {
            self.log.borrow_mut().push((true, lock));
            Ok(())
        }
        fn release(&self, lock: LockId) -> Result<(), ResponseCode> {
            self.log.borrow_mut().push((false, lock));
            Ok(())
        }
    }

    /// Heap memory aligned to its own size, as the pools want.
    struct Memory(*mut u8, Layout);

    impl Memory {
        fn new(order: u32) -> Self {
            let layout = Layout::from_size_align(1 << order, 1 << order).unwrap();
            let p = unsafe { alloc_zeroed(layout) };
            assert!(!p.is_null());
            Self(p, layout)
        }

        fn heap(&self, orders: Orders) -> Heap {
            let region = Region::from_raw(self.0 as usize, self.1.size()).unwrap();
            let pool = unsafe { BuddyPool::new(region, orders) }.unwrap();
            Heap::new(LockId(1), pool)
        }
    }

    impl Drop for Memory {
        fn drop(&mut self) {
            unsafe { dealloc(self.0, self.1) }
        }
    }

    const ORDERS: Orders = Orders { min: 5, max: 12 };

    #[test]
    fn guard_releases_on_drop() {
        let lock = Lock::from_parts(LockId(4), Gate::default());
        {
            let _g = lock.lock().unwrap();
            assert_eq!(*lock.gate.log.borrow(), vec![(true, LockId(4))]);
        }
        assert_eq!(
            *lock.gate.log.borrow(),
            vec![(true, LockId(4)), (false, LockId(4))]
        );
    }

    #[test]
    fn created_task_keeps_its_stack() {
        let mem = Memory::new(12);
        let heap = mem.heap(ORDERS);
        let gate = Gate::default();
        let mut seen = None;
        let id = create_task_in(&heap, &gate, 1024, |base| {
            seen = Some(base);
            Ok(TaskId(7))
        });
        assert_eq!(id, Ok(TaskId(7)));
        let base = seen.unwrap();
        assert!(heap.region().contains(base));
        assert_eq!(heap.with_pool(&gate, |p| p.outstanding()), Ok(1));
    }

    #[test]
    fn task_stack_fills_exactly_one_block() {
        let order = kern::config::STACK_SIZE.trailing_zeros() + 1;
        let mem = Memory::new(order);
        let heap = mem.heap(Orders { min: 5, max: order });
        let gate = Gate::default();
        let before = heap.with_pool(&gate, |p| p.free_bytes()).unwrap();
        let id = create_task_in(&heap, &gate, TASK_STACK_BYTES, |_| Ok(TaskId(1)));
        assert_eq!(id, Ok(TaskId(1)));
        let after = heap.with_pool(&gate, |p| p.free_bytes()).unwrap();
        assert_eq!(before - after, kern::config::STACK_SIZE);
    }

    #[test]
    fn refused_task_gives_its_stack_back() {
        let mem = Memory::new(12);
        let heap = mem.heap(ORDERS);
        let gate = Gate::default();
        let id = create_task_in(&heap, &gate, 1024, |_| {
            Err(ResponseCode::TaskTableFull)
        });
        assert_eq!(id, Err(CreateError::Refused(ResponseCode::TaskTableFull)));
        assert_eq!(heap.with_pool(&gate, |p| p.outstanding()), Ok(0));
    }

    #[test]
    fn no_memory_means_no_registration() {
        let mem = Memory::new(12);
        let heap = mem.heap(ORDERS);
        let id = create_task_in(&heap, &Gate::default(), 1 << 12, |_| {
            panic!("registered without a stack")
        });
        assert_eq!(id, Err(CreateError::NoMemory));
    }
}
