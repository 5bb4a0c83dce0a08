// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locks.
//!
//! Two kinds live in the lock table: a binary `Semaphore`, and a reentrant
//! `Mutex` built on one. Blocking is unconditional (there's no timeout), and
//! release hands the lock straight to the longest-waiting task, so a releaser
//! that immediately tries again queues up behind everyone already waiting.
//!
//! A task that ends while holding locks gives them up the same way, as if it
//! had released each one.

use abi::{LockId, LockKind, ResponseCode, SchedState, UsageError};

use crate::config::LOCK_SLOTS;
use crate::err::UserError;
use crate::kernel::Kernel;
use crate::klog::Event;
use crate::list::{Linked, List};
use crate::task::{NextTask, Queue};

/// Result of asking a lock for ownership.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Acquired {
    /// The caller now owns the lock.
    Now,
    /// The caller already owned this mutex, and is now `n` deep.
    Again(u32),
    /// The caller joined the back of the wait queue.
    Queued,
}

/// Result of letting go of a lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Released {
    /// Nobody was waiting; the lock is free.
    Freed,
    /// The mutex is still held, `n` deep.
    StillHeld(u32),
    /// Ownership passed to this waiting task.
    HandedTo(usize),
}

/// A binary lock with a FIFO queue of waiters.
#[derive(Copy, Clone, Debug, Default)]
pub struct Semaphore {
    owner: Option<usize>,
    waiters: List,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            owner: None,
            waiters: List::new(),
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn waiters<'a, T: Linked>(
        &self,
        tasks: &'a [T],
    ) -> impl Iterator<Item = usize> + 'a {
        self.waiters.iter(tasks)
    }

    /// Takes the lock, or queues `caller` for it. The owner must not call
    /// this; it would be waiting on itself.
    pub fn acquire<T: Linked>(
        &mut self,
        tasks: &mut [T],
        caller: usize,
    ) -> Acquired {
        crate::uassert!(self.owner != Some(caller));
        if self.owner.is_none() {
            self.owner = Some(caller);
            Acquired::Now
        } else {
            self.waiters.push_back(tasks, caller);
            Acquired::Queued
        }
    }

    pub fn release<T: Linked>(
        &mut self,
        tasks: &mut [T],
        caller: usize,
    ) -> Result<Released, ResponseCode> {
        if self.owner != Some(caller) {
            return Err(ResponseCode::NotOwner);
        }
        Ok(self.hand_off(tasks))
    }

    fn hand_off<T: Linked>(&mut self, tasks: &mut [T]) -> Released {
        self.owner = self.waiters.pop_front(tasks);
        match self.owner {
            Some(next) => Released::HandedTo(next),
            None => Released::Freed,
        }
    }

    /// Takes `task` out of the wait queue.
    pub fn withdraw<T: Linked>(&mut self, tasks: &mut [T], task: usize) {
        self.waiters.remove(tasks, task);
    }
}

/// A lock its owner can take again without blocking. It has to be released
/// as many times as it was acquired.
#[derive(Copy, Clone, Debug, Default)]
pub struct Mutex {
    sem: Semaphore,
    depth: u32,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(),
            depth: 0,
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.sem.owner()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn acquire<T: Linked>(
        &mut self,
        tasks: &mut [T],
        caller: usize,
    ) -> Acquired {
        if self.sem.owner() == Some(caller) {
            self.depth = self.depth.saturating_add(1);
            return Acquired::Again(self.depth);
        }
        let r = self.sem.acquire(tasks, caller);
        if r == Acquired::Now {
            self.depth = 1;
        }
        r
    }

    pub fn release<T: Linked>(
        &mut self,
        tasks: &mut [T],
        caller: usize,
    ) -> Result<Released, ResponseCode> {
        if self.sem.owner() != Some(caller) {
            return Err(ResponseCode::NotOwner);
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(Released::StillHeld(self.depth));
        }
        Ok(self.hand_off(tasks))
    }

    fn hand_off<T: Linked>(&mut self, tasks: &mut [T]) -> Released {
        let r = self.sem.hand_off(tasks);
        self.depth = u32::from(matches!(r, Released::HandedTo(_)));
        r
    }
}

#[derive(Copy, Clone, Debug)]
pub enum Lock {
    Semaphore(Semaphore),
    Mutex(Mutex),
}

impl Lock {
    pub fn new(kind: LockKind) -> Self {
        match kind {
            LockKind::Semaphore => Lock::Semaphore(Semaphore::new()),
            LockKind::Mutex => Lock::Mutex(Mutex::new()),
        }
    }

    pub fn kind(&self) -> LockKind {
        match self {
            Lock::Semaphore(_) => LockKind::Semaphore,
            Lock::Mutex(_) => LockKind::Mutex,
        }
    }

    pub fn owner(&self) -> Option<usize> {
        match self {
            Lock::Semaphore(s) => s.owner(),
            Lock::Mutex(m) => m.owner(),
        }
    }

    fn queue(&mut self) -> &mut Semaphore {
        match self {
            Lock::Semaphore(s) => s,
            Lock::Mutex(m) => &mut m.sem,
        }
    }

    pub fn waiters<'a, T: Linked>(
        &self,
        tasks: &'a [T],
    ) -> impl Iterator<Item = usize> + 'a {
        match self {
            Lock::Semaphore(s) => s.waiters(tasks),
            Lock::Mutex(m) => m.sem.waiters(tasks),
        }
    }

    pub fn acquire<T: Linked>(
        &mut self,
        tasks: &mut [T],
        caller: usize,
    ) -> Acquired {
        match self {
            Lock::Semaphore(s) => s.acquire(tasks, caller),
            Lock::Mutex(m) => m.acquire(tasks, caller),
        }
    }

    pub fn release<T: Linked>(
        &mut self,
        tasks: &mut [T],
        caller: usize,
    ) -> Result<Released, ResponseCode> {
        match self {
            Lock::Semaphore(s) => s.release(tasks, caller),
            Lock::Mutex(m) => m.release(tasks, caller),
        }
    }

    /// Lets go of the lock however deeply it's held, as when its owner ends.
    pub fn abandon<T: Linked>(&mut self, tasks: &mut [T]) -> Released {
        match self {
            Lock::Semaphore(s) => s.hand_off(tasks),
            Lock::Mutex(m) => m.hand_off(tasks),
        }
    }

    pub fn withdraw<T: Linked>(&mut self, tasks: &mut [T], task: usize) {
        self.queue().withdraw(tasks, task)
    }
}

/// Fixed-capacity home of every lock in the system. Locks are never
/// destroyed.
pub struct LockTable {
    slots: [Option<Lock>; LOCK_SLOTS],
}

impl LockTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; LOCK_SLOTS],
        }
    }

    pub fn create(&mut self, kind: LockKind) -> Result<LockId, ResponseCode> {
        let i = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ResponseCode::LockTableFull)?;
        self.slots[i] = Some(Lock::new(kind));
        // LOCK_SLOTS is checked to fit a LockId at build time.
        Ok(LockId(i as u16))
    }

    pub fn get(&self, id: LockId) -> Result<&Lock, ResponseCode> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(ResponseCode::NoSuchLock)
    }

    pub fn get_mut(&mut self, id: LockId) -> Result<&mut Lock, ResponseCode> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(ResponseCode::NoSuchLock)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn create_lock(&mut self, kind: LockKind) -> Result<LockId, ResponseCode> {
        self.locks.create(kind)
    }

    pub fn lock(&self, id: LockId) -> Result<&Lock, ResponseCode> {
        self.locks.get(id)
    }

    /// Takes `id` for `caller`, or blocks it until the lock is handed over.
    /// A semaphore's owner asking for it again is faulted rather than left
    /// waiting on itself.
    ///
    /// `caller` must be the running task.
    pub fn acquire(
        &mut self,
        caller: usize,
        id: LockId,
    ) -> Result<NextTask, UserError> {
        let lock = self.locks.get_mut(id)?;
        let owned = lock.owner() == Some(caller);
        if owned && lock.kind() == LockKind::Semaphore {
            return Err(UsageError::DoubleAcquire.into());
        }
        if !owned && self.tasks[caller].held_table_full() {
            return Err(ResponseCode::HeldLockTableFull.into());
        }
        match lock.acquire(&mut self.tasks, caller) {
            Acquired::Now => {
                // Room was checked above.
                self.tasks[caller].hold(id);
                Ok(NextTask::Same)
            }
            Acquired::Again(_) => Ok(NextTask::Same),
            Acquired::Queued => {
                let task = &mut self.tasks[caller];
                task.set_healthy_state(SchedState::Blocked(id));
                task.set_queue(Queue::Waiting(id));
                task.set_waiting_on(Some(id));
                crate::klog!(self.trace, Event::LockBlocked { task: caller, lock: id });
                Ok(NextTask::Other)
            }
        }
    }

    /// Lets go of `id` on behalf of `caller`, passing it to the first waiter
    /// if there is one.
    pub fn release(
        &mut self,
        caller: usize,
        id: LockId,
    ) -> Result<NextTask, UserError> {
        let released =
            self.locks.get_mut(id)?.release(&mut self.tasks, caller)?;
        Ok(match released {
            Released::StillHeld(_) => NextTask::Same,
            Released::Freed => {
                self.tasks[caller].unhold(id);
                NextTask::Same
            }
            Released::HandedTo(next) => {
                self.tasks[caller].unhold(id);
                self.grant(id, next);
                let p = self.tasks[next].priority();
                if p.is_more_important_than(self.tasks[caller].priority()) {
                    NextTask::Other
                } else {
                    NextTask::Same
                }
            }
        })
    }

    /// Makes `task`, just popped off `id`'s wait queue, the lock's owner.
    fn grant(&mut self, id: LockId, task: usize) {
        let t = &mut self.tasks[task];
        t.set_waiting_on(None);
        t.set_queue(Queue::None);
        if !t.hold(id) {
            // Waiters are refused before queueing when their table is full,
            // and nothing fills it while they wait.
            crate::fail::die(format_args!("task {task} can't record lock {id:?}"));
        }
        self.make_ready(task);
        crate::klog!(self.trace, Event::LockHandOff { lock: id, to: task });
    }

    /// Gives up every lock `task` holds, handing each to its next waiter.
    pub(crate) fn abandon_locks(&mut self, task: usize) -> NextTask {
        let mut next = NextTask::Same;
        for id in self.tasks[task].take_held().into_iter().flatten() {
            let Ok(lock) = self.locks.get_mut(id) else {
                continue;
            };
            crate::klog!(self.trace, Event::LockAbandoned { lock: id, by: task });
            if let Released::HandedTo(n) = lock.abandon(&mut self.tasks) {
                self.grant(id, n);
                next = NextTask::Other;
            }
        }
        next
    }

    /// Takes a blocked `task` off the wait queue of `id`.
    pub(crate) fn withdraw_waiter(&mut self, task: usize, id: LockId) {
        if let Ok(lock) = self.locks.get_mut(id) {
            lock.withdraw(&mut self.tasks, task);
        }
        self.tasks[task].set_waiting_on(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use proptest::prelude::*;

    fn table<const N: usize>() -> [Task; N] {
        [Task::VACANT; N]
    }

    #[test]
    fn semaphore_hands_off_in_arrival_order() {
        let mut tasks = table::<4>();
        let mut s = Semaphore::new();
        assert_eq!(s.acquire(&mut tasks, 0), Acquired::Now);
        assert_eq!(s.acquire(&mut tasks, 1), Acquired::Queued);
        assert_eq!(s.acquire(&mut tasks, 2), Acquired::Queued);

        assert_eq!(s.release(&mut tasks, 0), Ok(Released::HandedTo(1)));
        // Original owner comes back around and waits its turn.
        assert_eq!(s.acquire(&mut tasks, 0), Acquired::Queued);
        assert_eq!(s.release(&mut tasks, 1), Ok(Released::HandedTo(2)));
        assert_eq!(s.release(&mut tasks, 2), Ok(Released::HandedTo(0)));
        assert_eq!(s.release(&mut tasks, 0), Ok(Released::Freed));
        assert_eq!(s.owner(), None);
    }

    #[test]
    fn only_owner_may_release() {
        let mut tasks = table::<2>();
        let mut s = Semaphore::new();
        assert_eq!(s.release(&mut tasks, 0), Err(ResponseCode::NotOwner));
        let _ = s.acquire(&mut tasks, 0);
        assert_eq!(s.release(&mut tasks, 1), Err(ResponseCode::NotOwner));
        assert_eq!(s.owner(), Some(0));
    }

    #[test]
    fn mutex_needs_one_release_per_acquire() {
        let mut tasks = table::<2>();
        let mut m = Mutex::new();
        const N: u32 = 5;
        assert_eq!(m.acquire(&mut tasks, 0), Acquired::Now);
        for depth in 2..=N {
            assert_eq!(m.acquire(&mut tasks, 0), Acquired::Again(depth));
        }
        assert_eq!(m.acquire(&mut tasks, 1), Acquired::Queued);
        for depth in (1..N).rev() {
            assert_eq!(m.release(&mut tasks, 0), Ok(Released::StillHeld(depth)));
            assert_eq!(m.owner(), Some(0));
        }
        assert_eq!(m.release(&mut tasks, 0), Ok(Released::HandedTo(1)));
        assert_eq!(m.owner(), Some(1));
        assert_eq!(m.depth(), 1);
    }

    #[test]
    fn abandon_drops_whole_depth() {
        let mut tasks = table::<2>();
        let mut l = Lock::new(LockKind::Mutex);
        let _ = l.acquire(&mut tasks, 0);
        let _ = l.acquire(&mut tasks, 0);
        assert_eq!(l.abandon(&mut tasks), Released::Freed);
        assert_eq!(l.owner(), None);
        assert_eq!(l.acquire(&mut tasks, 1), Acquired::Now);
    }

    #[test]
    fn withdrawn_waiter_is_skipped() {
        let mut tasks = table::<3>();
        let mut l = Lock::new(LockKind::Semaphore);
        let _ = l.acquire(&mut tasks, 0);
        let _ = l.acquire(&mut tasks, 1);
        let _ = l.acquire(&mut tasks, 2);
        l.withdraw(&mut tasks, 1);
        assert_eq!(l.release(&mut tasks, 0), Ok(Released::HandedTo(2)));
    }

    #[test]
    fn table_fills_up_and_rejects_strangers() {
        let mut t = LockTable::new();
        for _ in 0..LOCK_SLOTS {
            t.create(LockKind::Semaphore).unwrap();
        }
        assert_eq!(t.create(LockKind::Mutex), Err(ResponseCode::LockTableFull));
        assert!(t.get(LockId(LOCK_SLOTS as u16)).is_err());
        assert_eq!(t.get(LockId(0)).unwrap().kind(), LockKind::Semaphore);
    }

    proptest! {
        /// Whatever order tasks show up in, they get the lock in that order,
        /// and there's only ever one owner.
        #[test]
        fn contention_is_fifo(arrivals in prop::sample::subsequence((1..8usize).collect::<Vec<_>>(), 0..7).prop_shuffle()) {
            let mut tasks = table::<8>();
            let mut l = Lock::new(LockKind::Mutex);
            prop_assert_eq!(l.acquire(&mut tasks, 0), Acquired::Now);
            for &t in &arrivals {
                prop_assert_eq!(l.acquire(&mut tasks, t), Acquired::Queued);
            }
            let mut holder = 0;
            for &t in &arrivals {
                prop_assert_eq!(l.release(&mut tasks, holder), Ok(Released::HandedTo(t)));
                prop_assert_eq!(l.owner(), Some(t));
                holder = t;
            }
            prop_assert_eq!(l.release(&mut tasks, holder), Ok(Released::Freed));
        }
    }
}
