// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and tasks.
//!
//! Everything in here crosses the trap boundary in registers, so the types are
//! small, `Copy`, and have explicit conversions to and from `u32`.

#![no_std]

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Names a particular incarnation of a task.
///
/// A `TaskId` combines two fields, a task index (the slot in the kernel's task
/// table) and a generation number. The generation of a slot is bumped each time
/// the slot is reclaimed after its task ends, so a handle kept around after the
/// task ended names nothing and is rejected by the kernel.
///
/// The task index is in the lower `TaskId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Number of bits in a `TaskId` used to represent task index, rather than
    /// generation number.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `TaskId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TaskId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Fails for values wider than a `TaskId`, which can't name any task.
impl core::convert::TryFrom<u32> for TaskId {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        u16::try_from(x).map(Self).map_err(|_| ())
    }
}

impl From<TaskId> for u32 {
    fn from(id: TaskId) -> Self {
        u32::from(id.0)
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Hash)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << TaskId::INDEX_BITS >> TaskId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from 0. Numerically lower priorities
/// are more important, so Priority 0 is the most likely to be scheduled,
/// followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The least important priority, reserved for the idle task.
    pub const IDLE: Self = Self(u8::MAX);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Names a lock in the kernel's lock table.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct LockId(pub u16);

impl LockId {
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

impl From<LockId> for u32 {
    fn from(id: LockId) -> Self {
        u32::from(id.0)
    }
}

/// Flavors of lock the kernel can create.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum LockKind {
    /// Binary blocking lock. Its owner acquiring it again is a fault, since
    /// the owner would otherwise wait on itself forever.
    Semaphore = 0,
    /// Reentrant lock: the owner may acquire it repeatedly, and must release
    /// it as many times before anyone else can have it.
    Mutex = 1,
}

impl core::convert::TryFrom<u32> for LockKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Semaphore),
            1 => Ok(Self::Mutex),
            _ => Err(()),
        }
    }
}

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedState {
    /// Task is eligible to run and sits in the ready list.
    Ready,
    /// Task is the one executing (or the one that trapped into the kernel).
    Running,
    /// Task is waiting to be handed the given lock.
    Blocked(LockId),
    /// Periodic task between activations, counting down ticks.
    Sleeping,
}

/// A task's lifecycle state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Task is live, and its scheduling state is given.
    Healthy(SchedState),
    /// Task ended, voluntarily or by fault, and its memory awaits reclamation.
    Terminated {
        /// Fault that ended the task, or `None` if it ended itself.
        fault: Option<FaultInfo>,
    },
}

impl TaskState {
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            TaskState::Healthy(SchedState::Ready | SchedState::Sleeping)
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Healthy(SchedState::Ready)
    }
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// The task has violated memory access rules, either in hardware or by
    /// handing the kernel memory it cannot use.
    MemoryAccess {
        /// Problematic address, when the processor reports one.
        address: Option<u32>,
    },
    /// A task has overflowed its stack.
    StackOverflow { address: u32 },
    /// A task has induced a bus error.
    BusError { address: Option<u32> },
    /// Divide-by-zero.
    DivideByZero,
    /// Execution of an illegal instruction.
    IllegalInstruction,
    /// Other invalid operation, with an architecture-specific code (the
    /// Configurable Fault Status Register on ARMv7/8-M, zero on ARMv6-M).
    InvalidOperation(u32),
    /// Arguments passed to a trap were invalid.
    SyscallUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a task used a trap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// A stack handed to `RegisterTask` is misaligned, too small, wraps the
    /// address space, or lies outside the memory the kernel manages.
    InvalidStack,
    /// A lock kind outside `LockKind`.
    BadLockKind,
    /// The owner of a semaphore tried to acquire it again.
    DoubleAcquire,
    /// A task other than the reaper asked to reap ended tasks.
    NotReaper,
}

/// Enumeration of trap numbers.
///
/// The number travels in `r11` at the trap site; see the architecture support
/// in the kernel for the full register convention.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    EndTask = 1,
    RegisterTask = 2,
    TaskSwitch = 3,
    Acquire = 4,
    Release = 5,
    EndActivation = 6,
    CreateLock = 7,
    Reap = 8,
    CurrentTask = 9,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::EndTask),
            2 => Ok(Self::RegisterTask),
            3 => Ok(Self::TaskSwitch),
            4 => Ok(Self::Acquire),
            5 => Ok(Self::Release),
            6 => Ok(Self::EndActivation),
            7 => Ok(Self::CreateLock),
            8 => Ok(Self::Reap),
            9 => Ok(Self::CurrentTask),
            _ => Err(()),
        }
    }
}

/// Status returned in the first result register of a trap.
///
/// Success is zero. Failures are small negative numbers, sign-extended into the
/// 32-bit register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ResponseCode {
    Success = 0,
    /// The named task does not exist, or has ended since the handle was made.
    NoSuchTask = -1,
    /// The named task exists but is neither ready nor sleeping.
    NotRunnable = -2,
    /// No free slot in the task table.
    TaskTableFull = -3,
    /// The caller already holds as many locks as its table allows.
    HeldLockTableFull = -4,
    /// The named lock was never created.
    NoSuchLock = -5,
    /// Release of a lock the caller does not own.
    NotOwner = -6,
    /// No free slot in the lock table.
    LockTableFull = -7,
    /// Arguments that are well-formed but unusable, like a priority reserved
    /// for the idle task.
    BadArgument = -8,
}

impl ResponseCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<ResponseCode> for u32 {
    fn from(rc: ResponseCode) -> Self {
        rc as i32 as u32
    }
}

impl core::convert::TryFrom<u32> for ResponseCode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x as i32 {
            0 => Ok(Self::Success),
            -1 => Ok(Self::NoSuchTask),
            -2 => Ok(Self::NotRunnable),
            -3 => Ok(Self::TaskTableFull),
            -4 => Ok(Self::HeldLockTableFull),
            -5 => Ok(Self::NoSuchLock),
            -6 => Ok(Self::NotOwner),
            -7 => Ok(Self::LockTableFull),
            -8 => Ok(Self::BadArgument),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Flags describing how the kernel treats a task.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct TaskFlags: u32 {
        /// Task reactivates every `period` ticks instead of ending when its
        /// entry function returns.
        const PERIODIC = 1 << 0;
        /// Task's stack came from the kernel pool rather than the user pool.
        const KERNEL_STACK = 1 << 1;
        /// Task is the idle task: never queued, picked when nothing is ready.
        const IDLE = 1 << 2;
        /// Task is the reaper, the only one allowed to reclaim ended tasks.
        const REAPER = 1 << 3;
    }
}

/// Opaque handle onto a resource (device, stream) owned by the collaborator
/// subsystems. The kernel only stores and copies these.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ResourceHandle(pub u32);
