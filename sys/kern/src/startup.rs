// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The kernel is one `Kernel` value, built here from the two heap regions the
//! board hands over, and then installed into a static that the exception
//! handlers reach through `with_kernel`. Nothing else in the kernel is a
//! mutable static.

use core::ptr::NonNull;

use abi::{LockKind, Priority, Sysnum, TaskFlags};

use crate::arch;
use crate::buddy::{BuddyPool, Orders};
use crate::cell::{Exclusive, InstallOnce};
use crate::config::{KERNEL_POOL_ORDERS, TICK_DIVISOR, USER_POOL_ORDERS};
use crate::fail::die;
use crate::heap::{self, Heap, Heaps, TrapGate, TASK_STACK_BYTES};
use crate::kernel::{HeapRegions, Kernel};
use crate::task::TaskDesc;
use crate::umem::Region;

/// The reaper runs just above idle.
pub const REAPER_PRIORITY: Priority = Priority(Priority::IDLE.0 - 1);

/// Ticks between reaper activations.
pub const REAPER_PERIOD: u32 = 16;

static KERNEL: InstallOnce<Exclusive<Kernel>> = InstallOnce::new();

/// The main kernel entry point.
///
/// We expect an application to provide its own `main`-equivalent function,
/// which does basic hardware setup and then calls this function with the
/// memory the kernel and tasks may allocate from, and the first task to run.
///
/// # Safety
///
/// This function has architecture-specific requirements for safe use -- on ARM,
/// for instance, it must be called from the main (interrupt) stack in
/// privileged mode.
///
/// This function may not be called reentrantly or from multiple cores.
pub unsafe fn start_kernel(
    kernel_heap: &'static mut [u8],
    user_heap: &'static mut [u8],
    init: fn(),
    init_priority: Priority,
) -> ! {
    let kernel_heap = Region::from_static(kernel_heap);
    let user_heap = Region::from_static(user_heap);
    // Safety: the regions came from `&'static mut`, so they're ours alone.
    let (kernel, heaps) = unsafe { boot(kernel_heap, user_heap, init as usize, init_priority) };

    heap::install(heaps);
    KERNEL.install(Exclusive::new(kernel));
    arch::start_first_task(TICK_DIVISOR)
}

/// Builds the kernel and its heaps: the two pools and their guard locks, the
/// idle task, the reaper, and the first task.
///
/// # Safety
///
/// Both regions must be memory nothing else uses, for good.
pub(crate) unsafe fn boot(
    kernel_heap: Region,
    user_heap: Region,
    init: usize,
    init_priority: Priority,
) -> (Kernel, Heaps) {
    // Safety: passed on from our caller.
    let mut kpool = unsafe { pool(kernel_heap, KERNEL_POOL_ORDERS) };
    let mut upool = unsafe { pool(user_heap, USER_POOL_ORDERS) };

    let mut kernel = Kernel::new(HeapRegions {
        kernel: kpool.region(),
        user: upool.region(),
    });
    let kernel_guard = guard_lock(&mut kernel);
    let user_guard = guard_lock(&mut kernel);

    let idle_stack = carve_stack(&mut kpool);
    kernel.install_idle(idle_main as usize, idle_stack);

    let kernel_tasks = [
        TaskDesc {
            entry: reaper_main as usize,
            stack: carve_stack(&mut kpool),
            priority: REAPER_PRIORITY,
            period: REAPER_PERIOD,
            flags: TaskFlags::KERNEL_STACK | TaskFlags::REAPER,
        },
        TaskDesc {
            entry: init,
            stack: carve_stack(&mut upool),
            priority: init_priority,
            period: 0,
            flags: TaskFlags::empty(),
        },
    ];
    for desc in kernel_tasks {
        if let Err(e) = kernel.create_task(desc) {
            die(format_args!("can't create boot task: {e:?}"));
        }
    }

    let heaps = Heaps {
        kernel: Heap::new(kernel_guard, kpool),
        user: Heap::new(user_guard, upool),
    };
    (kernel, heaps)
}

unsafe fn pool(region: Region, orders: Orders) -> BuddyPool {
    // Safety: passed on from our caller.
    match unsafe { BuddyPool::new(region, orders) } {
        Ok(p) => p,
        Err(e) => die(format_args!(
            "no pool of {orders:?} in {:#x}..{:#x}: {e:?}",
            region.base(),
            region.end()
        )),
    }
}

fn guard_lock(kernel: &mut Kernel) -> abi::LockId {
    match kernel.create_lock(LockKind::Semaphore) {
        Ok(id) => id,
        Err(rc) => die(format_args!("no heap guard lock: {rc:?}")),
    }
}

fn carve_stack(pool: &mut BuddyPool) -> Region {
    let Some(p) = pool.allocate(TASK_STACK_BYTES) else {
        die("no room for a boot stack");
    };
    match Region::from_raw(p.as_ptr() as usize, TASK_STACK_BYTES) {
        Ok(r) => r,
        Err(e) => die(format_args!("bad boot stack: {e:?}")),
    }
}

/// Runs `body` with the kernel.
///
/// Only the exception handlers call this, and they never nest, so a second
/// concurrent call means something has gone badly wrong and is fatal.
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    match KERNEL.get() {
        Some(k) => k.with(body),
        None => die("kernel entered before boot"),
    }
}

extern "C" fn idle_main() -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}

/// Each activation gives back the stack of every task ended since the last
/// one.
extern "C" fn reaper_main() {
    let heaps = heap::heaps();
    loop {
        let [base, size, flags] = arch::trap(Sysnum::Reap, &[0; 7]);
        if size == 0 {
            break;
        }
        let flags = TaskFlags::from_bits_truncate(flags as u32);
        let heap = if flags.contains(TaskFlags::KERNEL_STACK) {
            &heaps.kernel
        } else {
            &heaps.user
        };
        let Some(ptr) = NonNull::new(base as *mut u8) else {
            die("reaped a null stack");
        };
        if let Err(rc) = heap.free(&TrapGate, ptr) {
            die(format_args!("can't free stack at {base:#x}: {rc:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::test_memory::TestMemory;
    use crate::sched::test_support::entry_a;
    use crate::task::Queue;
    use crate::heap::LockGate;
    use abi::{LockId, ResponseCode, SchedState, TaskState};

    /// Boot-time pool access needs no locking.
    struct OpenGate;

    impl LockGate for OpenGate {
        fn acquire(&self, _: LockId) -> Result<(), ResponseCode> {
            Ok(())
        }
        fn release(&self, _: LockId) -> Result<(), ResponseCode> {
            Ok(())
        }
    }

    fn booted(kmem: &TestMemory, umem: &TestMemory) -> (Kernel, Heaps) {
        unsafe { boot(kmem.region(), umem.region(), entry_a as usize, Priority(3)) }
    }

    #[test]
    fn boot_builds_idle_reaper_and_init() {
        let kmem = TestMemory::aligned(KERNEL_POOL_ORDERS.max);
        let umem = TestMemory::aligned(USER_POOL_ORDERS.max);
        let (k, heaps) = booted(&kmem, &umem);

        assert_eq!(heaps.kernel.guard(), LockId(0));
        assert_eq!(heaps.user.guard(), LockId(1));
        assert_eq!(k.lock(LockId(0)).unwrap().kind(), LockKind::Semaphore);

        // Idle isn't counted.
        assert_eq!(k.total_tasks(), 2);
        assert!(!k.is_switching());

        let occupied: Vec<_> =
            k.tasks().iter().filter(|t| t.is_occupied()).collect();
        assert_eq!(occupied.len(), 3);
        assert!(occupied[0].is_idle());
        assert_eq!(occupied[0].entry(), idle_main as usize);

        let reaper = occupied[1];
        assert_eq!(reaper.priority(), REAPER_PRIORITY);
        assert_eq!(reaper.period(), REAPER_PERIOD);
        assert!(reaper.flags().contains(
            TaskFlags::KERNEL_STACK | TaskFlags::PERIODIC | TaskFlags::REAPER
        ));
        assert_eq!(reaper.queue(), Queue::Periodic);
        assert!(kmem.region().covers(&reaper.stack()));

        let init = occupied[2];
        assert_eq!(init.entry(), entry_a as usize);
        assert_eq!(init.queue(), Queue::Ready);
        assert_eq!(init.state(), TaskState::Healthy(SchedState::Ready));
        assert!(umem.region().covers(&init.stack()));
        assert_eq!(init.stack().size(), TASK_STACK_BYTES);
    }

    #[test]
    fn boot_stacks_come_out_of_the_pools() {
        let kmem = TestMemory::aligned(KERNEL_POOL_ORDERS.max);
        let umem = TestMemory::aligned(USER_POOL_ORDERS.max);
        let (k, heaps) = booted(&kmem, &umem);
        let gate = OpenGate;
        assert_eq!(heaps.kernel.with_pool(&gate, |p| p.outstanding()), Ok(2));
        assert_eq!(heaps.user.with_pool(&gate, |p| p.outstanding()), Ok(1));

        // Each stack takes one block of the configured stack size, no more.
        let init = k.tasks().iter().filter(|t| t.is_occupied()).last().unwrap();
        let ptr = NonNull::new(init.stack().base() as *mut u8).unwrap();
        let order = crate::config::STACK_SIZE.trailing_zeros();
        assert_eq!(heaps.user.with_pool(&gate, |p| p.block_order(ptr)), Ok(Some(order)));
    }

    #[test]
    #[should_panic(expected = "no pool of")]
    fn too_little_memory_is_fatal() {
        let kmem = TestMemory::aligned(KERNEL_POOL_ORDERS.max);
        let umem = TestMemory::aligned(USER_POOL_ORDERS.max);
        let tiny = Region::from_raw(kmem.region().base(), 64).unwrap();
        unsafe {
            boot(tiny, umem.region(), entry_a as usize, Priority(3));
        }
    }

    #[test]
    #[should_panic(expected = "kernel entered before boot")]
    fn kernel_entry_before_boot_is_fatal() {
        with_kernel(|_| ());
    }
}
