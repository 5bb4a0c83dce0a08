// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{
    FaultInfo, Generation, LockId, LockKind, Priority, ResourceHandle,
    SchedState, TaskFlags, TaskId, TaskState, UsageError,
};

use crate::config::{HELD_LOCKS_PER_TASK, RESOURCES_PER_TASK};
use crate::list::{Link, Linked};
use crate::umem::Region;

/// Which kernel collection a task currently sits on. A task is on at most one
/// of these at a time; running tasks, and the idle task, are on none.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Queue {
    None,
    Ready,
    Periodic,
    Waiting(LockId),
    Reclaim,
}

/// The standard streams a task inherits from whoever created it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Streams {
    pub stdin: Option<ResourceHandle>,
    pub stdout: Option<ResourceHandle>,
    pub stderr: Option<ResourceHandle>,
}

/// Internal representation of a task.
///
/// The fields of this struct are private to this module so that we can maintain
/// some task invariants. These mostly have to do with ensuring that the task
/// table and the scheduler's lists agree.
#[derive(Debug)]
pub struct Task {
    /// Linkage for whichever list `queue` names.
    link: Link,
    queue: Queue,
    /// Whether this slot describes a task at all.
    occupied: bool,
    /// Bumped when the slot is reclaimed, so handles to the previous
    /// occupant go stale.
    generation: Generation,
    /// Address of the saved context block on this task's stack.
    saved_sp: usize,
    stack: Region,
    entry: usize,
    priority: Priority,
    /// Ticks between activations, or 0 for a one-shot task.
    period: u32,
    /// Ticks left until the next release of a periodic task. This runs
    /// whatever the task is doing, so releases keep a fixed rate; zero while
    /// the task is busy means its next release is already due.
    remaining: u32,
    state: TaskState,
    flags: TaskFlags,
    pid: u32,
    resources: [Option<ResourceHandle>; RESOURCES_PER_TASK],
    streams: Streams,
    held: [Option<LockId>; HELD_LOCKS_PER_TASK],
    waiting_on: Option<LockId>,
}

impl Task {
    /// An unoccupied slot.
    pub const VACANT: Self = Self {
        link: Link::UNLINKED,
        queue: Queue::None,
        occupied: false,
        generation: Generation::ZERO,
        saved_sp: 0,
        stack: Region::EMPTY,
        entry: 0,
        priority: Priority::IDLE,
        period: 0,
        remaining: 0,
        state: TaskState::Terminated { fault: None },
        flags: TaskFlags::empty(),
        pid: 0,
        resources: [None; RESOURCES_PER_TASK],
        streams: Streams {
            stdin: None,
            stdout: None,
            stderr: None,
        },
        held: [None; HELD_LOCKS_PER_TASK],
        waiting_on: None,
    };

    /// Fills a vacant slot with a freshly created task. The slot keeps its
    /// generation. The caller still has to build the initial frame and put
    /// the task on a list.
    pub(crate) fn occupy(&mut self, desc: &TaskDesc, pid: u32, streams: Streams) {
        let generation = self.generation;
        *self = Self {
            occupied: true,
            generation,
            stack: desc.stack,
            entry: desc.entry,
            priority: desc.priority,
            period: desc.period,
            remaining: desc.period,
            state: TaskState::Healthy(SchedState::Ready),
            flags: desc.flags,
            pid,
            streams,
            ..Self::VACANT
        };
    }

    /// Returns the slot to the vacant state, advancing its generation.
    pub(crate) fn vacate(&mut self) {
        let generation = self.generation.next();
        *self = Self {
            generation,
            ..Self::VACANT
        };
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    /// Checks whether `id` names the current occupant of this slot.
    pub fn answers_to(&self, id: TaskId) -> bool {
        self.occupied && self.generation == id.generation()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn saved_sp(&self) -> usize {
        self.saved_sp
    }

    pub(crate) fn set_saved_sp(&mut self, sp: usize) {
        self.saved_sp = sp;
    }

    pub fn stack(&self) -> Region {
        self.stack
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Starts the countdown to the release after this one.
    pub(crate) fn rearm(&mut self) {
        self.remaining = self.period;
    }

    /// Counts one tick off the countdown, returning `true` on the tick it
    /// expires. An expired countdown stays at zero until rearmed.
    pub(crate) fn count_down(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.remaining == 0
    }

    /// Checks whether a release came due while the task was still busy.
    pub fn release_due(&self) -> bool {
        self.period != 0 && self.remaining == 0
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_healthy_state(&mut self, s: SchedState) {
        self.state = TaskState::Healthy(s);
    }

    pub(crate) fn set_terminated(&mut self, fault: Option<FaultInfo>) {
        self.state = TaskState::Terminated { fault };
    }

    pub fn is_healthy(&self, s: SchedState) -> bool {
        self.state == TaskState::Healthy(s)
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    pub(crate) fn set_queue(&mut self, q: Queue) {
        self.queue = q;
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(TaskFlags::IDLE)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn streams(&self) -> Streams {
        self.streams
    }

    pub fn set_streams(&mut self, streams: Streams) {
        self.streams = streams;
    }

    /// Records an open resource, returning its descriptor, or `None` if the
    /// table is full.
    pub fn open_resource(&mut self, handle: ResourceHandle) -> Option<usize> {
        let slot = self.resources.iter().position(Option::is_none)?;
        self.resources[slot] = Some(handle);
        Some(slot)
    }

    pub fn resource(&self, descriptor: usize) -> Option<ResourceHandle> {
        self.resources.get(descriptor).copied().flatten()
    }

    pub fn close_resource(&mut self, descriptor: usize) -> Option<ResourceHandle> {
        self.resources.get_mut(descriptor)?.take()
    }

    /// Locks this task owns, in no particular order.
    pub fn held_locks(&self) -> impl Iterator<Item = LockId> + '_ {
        self.held.iter().flatten().copied()
    }

    pub fn holds(&self, lock: LockId) -> bool {
        self.held.contains(&Some(lock))
    }

    pub fn held_table_full(&self) -> bool {
        !self.held.contains(&None)
    }

    /// Notes that this task now owns `lock`. Returns `false` if the table has
    /// no room.
    pub(crate) fn hold(&mut self, lock: LockId) -> bool {
        match self.held.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(lock);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unhold(&mut self, lock: LockId) {
        for slot in &mut self.held {
            if *slot == Some(lock) {
                *slot = None;
            }
        }
    }

    /// Empties the held-lock table, handing back what was in it.
    pub(crate) fn take_held(&mut self) -> [Option<LockId>; HELD_LOCKS_PER_TASK] {
        core::mem::replace(&mut self.held, [None; HELD_LOCKS_PER_TASK])
    }

    pub fn waiting_on(&self) -> Option<LockId> {
        self.waiting_on
    }

    pub(crate) fn set_waiting_on(&mut self, lock: Option<LockId>) {
        self.waiting_on = lock;
    }
}

impl Linked for Task {
    fn link(&self) -> &Link {
        &self.link
    }

    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// What it takes to create a task.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    pub entry: usize,
    pub stack: Region,
    pub priority: Priority,
    pub period: u32,
    pub flags: TaskFlags,
}

/// Interface that must be implemented by the `arch::SavedContext` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX` and `retX` functions, and the
/// rest of the trait (such as the argument proxy types) will just work. The
/// trap number doesn't live here: it arrives in a register of its own and is
/// handed straight to `syscalls::handle_trap`.
pub trait ArchState: Default {
    /// Reads syscall argument register 0.
    fn arg0(&self) -> usize;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> usize;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> usize;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> usize;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> usize;
    /// Reads syscall argument register 5.
    fn arg5(&self) -> usize;
    /// Reads syscall argument register 6.
    fn arg6(&self) -> usize;

    /// Writes syscall return argument 0.
    fn ret0(&mut self, _: usize);
    /// Writes syscall return argument 1.
    fn ret1(&mut self, _: usize);
    /// Writes syscall return argument 2.
    fn ret2(&mut self, _: usize);

    /// Writes a status into the first result register, sign-extended so
    /// that failures read back as negative numbers on the task side.
    fn set_status(&mut self, status: abi::ResponseCode) {
        self.ret0(status as i32 as isize as usize);
    }

    /// Interprets arguments as for the `RegisterTask` syscall and returns the
    /// results.
    fn as_register_task_args(&self) -> AsRegisterTaskArgs<&Self> {
        AsRegisterTaskArgs(self)
    }

    /// Interprets the first argument as a task handle. Values too wide to be
    /// one name no task.
    fn task_arg(&self) -> Result<TaskId, abi::ResponseCode> {
        u32::try_from(self.arg0())
            .ok()
            .and_then(|x| TaskId::try_from(x).ok())
            .ok_or(abi::ResponseCode::NoSuchTask)
    }

    /// Interprets the first argument as a lock handle. Values that can't be
    /// one are folded into an id no table ever hands out.
    fn lock_arg(&self) -> LockId {
        LockId(u16::try_from(self.arg0()).unwrap_or(u16::MAX))
    }

    /// Interprets the first argument as a lock kind.
    fn lock_kind_arg(&self) -> Result<LockKind, UsageError> {
        u32::try_from(self.arg0())
            .ok()
            .and_then(|k| LockKind::try_from(k).ok())
            .ok_or(UsageError::BadLockKind)
    }
}

/// Reference proxy for `RegisterTask` argument registers.
pub struct AsRegisterTaskArgs<T>(T);

impl<'a, T: ArchState> AsRegisterTaskArgs<&'a T> {
    /// Address of the task's entry function.
    pub fn entry(&self) -> usize {
        self.0.arg0()
    }

    /// Stack handed over by the caller, not yet checked against the heaps.
    pub fn stack(&self) -> Result<Region, UsageError> {
        Region::from_raw(self.0.arg1(), self.0.arg2())
    }

    /// Requested priority. Out-of-range values saturate to the idle priority,
    /// which `RegisterTask` refuses.
    pub fn priority(&self) -> Priority {
        Priority(u8::try_from(self.0.arg3()).unwrap_or(u8::MAX))
    }

    pub fn period(&self) -> u32 {
        u32::try_from(self.0.arg4()).unwrap_or(u32::MAX)
    }
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks, but this routine has not concluded which one
    /// should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch tasks, and we already know which one should run next.
    /// This is an optimization available in certain operations.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific task recommendations that *don't* agree get downgraded
            // to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(period: u32) -> TaskDesc {
        TaskDesc {
            entry: 0x1000,
            stack: Region::from_raw(0x2000, 0x400).unwrap(),
            priority: Priority(3),
            period,
            flags: TaskFlags::empty(),
        }
    }

    #[test]
    fn occupy_and_vacate_track_generation() {
        let mut t = Task::VACANT;
        t.occupy(&desc(0), 7, Streams::default());
        let id = TaskId::for_index_and_gen(0, t.generation());
        assert!(t.answers_to(id));
        assert_eq!(t.pid(), 7);
        assert!(t.is_healthy(SchedState::Ready));

        t.vacate();
        assert!(!t.is_occupied());
        assert!(!t.answers_to(id));

        t.occupy(&desc(0), 8, Streams::default());
        assert!(!t.answers_to(id));
        assert!(t.answers_to(TaskId::for_index_and_gen(0, t.generation())));
    }

    #[test]
    fn periodic_countdown_expires_once_per_period() {
        let mut t = Task::VACANT;
        t.occupy(&desc(3), 1, Streams::default());
        assert!(!t.count_down());
        assert!(!t.count_down());
        assert!(t.count_down());
        // Expired stays expired until the next release.
        assert!(!t.count_down());
        assert!(t.release_due());
        t.rearm();
        assert_eq!(t.remaining(), 3);
        assert!(!t.release_due());
    }

    #[test]
    fn held_table_is_bounded() {
        let mut t = Task::VACANT;
        for i in 0..HELD_LOCKS_PER_TASK {
            assert!(t.hold(LockId(i as u16)));
        }
        assert!(t.held_table_full());
        assert!(!t.hold(LockId(99)));
        t.unhold(LockId(0));
        assert!(!t.holds(LockId(0)));
        assert!(t.hold(LockId(99)));
        assert_eq!(t.take_held().iter().flatten().count(), HELD_LOCKS_PER_TASK);
        assert_eq!(t.held_locks().count(), 0);
    }

    #[test]
    fn resources_use_lowest_free_descriptor() {
        let mut t = Task::VACANT;
        assert_eq!(t.open_resource(ResourceHandle(10)), Some(0));
        assert_eq!(t.open_resource(ResourceHandle(11)), Some(1));
        assert_eq!(t.close_resource(0), Some(ResourceHandle(10)));
        assert_eq!(t.open_resource(ResourceHandle(12)), Some(0));
        assert_eq!(t.resource(1), Some(ResourceHandle(11)));
        assert_eq!(t.resource(RESOURCES_PER_TASK), None);
    }

    #[test]
    fn combine_prefers_specific_then_other() {
        use NextTask::*;
        assert_eq!(Same.combine(Same), Same);
        assert_eq!(Same.combine(Other), Other);
        assert_eq!(Other.combine(Specific(2)), Specific(2));
        assert_eq!(Specific(1).combine(Specific(2)), Other);
        assert_eq!(Specific(1).combine(Specific(1)), Specific(1));
    }
}
