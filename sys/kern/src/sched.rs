// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling.
//!
//! The ready list is kept sorted, most important task first; a task joining
//! it goes behind every task of equal or greater importance, which gives
//! round-robin order within a priority. Dispatch takes the head. Sleeping
//! periodic tasks sit on their own list. Every live periodic task counts
//! down a tick at a time, asleep or not, so it's released on a fixed grid.

use abi::{
    FaultInfo, ResponseCode, SchedState, TaskFlags, TaskId, TaskState, UsageError,
};

use crate::arch;
use crate::err::UserError;
use crate::fail::die;
use crate::kernel::Kernel;
use crate::klog::Event;
use crate::list::Linked;
use crate::task::{NextTask, Queue, TaskDesc};
use crate::umem::Region;

/// Smallest stack a task may be created with: room for the initial frame
/// and a bit of actual use.
pub const MIN_STACK: usize = 256;

/// A task whose memory can now be returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reaped {
    /// The task as it was known while alive.
    pub task: TaskId,
    pub stack: Region,
    pub flags: TaskFlags,
}

impl Kernel {
    /// Creates a task from `desc`, whose stack must come from one of the
    /// heap regions and share no memory with any other task's.
    ///
    /// The new task inherits the streams of the current task, if any, and
    /// is linked per its period. It first runs when dispatch picks it, or
    /// at the end of its first period.
    pub fn create_task(&mut self, desc: TaskDesc) -> Result<TaskId, UserError> {
        self.check_stack(&desc)?;
        if desc.priority == abi::Priority::IDLE {
            return Err(ResponseCode::BadArgument.into());
        }
        let i = self
            .tasks
            .iter()
            .position(|t| !t.is_occupied())
            .ok_or(ResponseCode::TaskTableFull)?;

        let mut flags = desc.flags - TaskFlags::IDLE;
        flags.set(TaskFlags::PERIODIC, desc.period != 0);
        let desc = TaskDesc { flags, ..desc };
        let streams = self
            .current
            .map(|c| self.tasks[c].streams())
            .unwrap_or_default();
        let pid = self.take_pid();

        let task = &mut self.tasks[i];
        task.occupy(&desc, pid, streams);
        arch::initialize_frame(task);
        self.live += 1;
        if desc.period == 0 {
            self.make_ready(i);
        } else {
            self.sleep(i);
        }
        crate::klog!(self.trace, Event::TaskCreated { task: i, pid });
        Ok(self.task_id(i))
    }

    fn check_stack(&self, desc: &TaskDesc) -> Result<(), UsageError> {
        let stack = desc.stack;
        let pool = if desc.flags.contains(TaskFlags::KERNEL_STACK) {
            self.heaps.kernel
        } else {
            self.heaps.user
        };
        let overlaps = self.tasks.iter().any(|t| {
            t.is_occupied()
                && stack.base() < t.stack().end()
                && t.stack().base() < stack.end()
        });
        if stack.size() < MIN_STACK || !pool.covers(&stack) || overlaps {
            return Err(UsageError::InvalidStack);
        }
        Ok(())
    }

    /// Advances time by one tick. Each live periodic task counts down; one
    /// that's asleep when its count runs out is released and rearmed, and one
    /// that's still busy is released as soon as its activation ends. Time
    /// slicing means there's always a dispatch afterwards.
    pub fn tick(&mut self) -> NextTask {
        self.ticks += 1;
        for i in 0..self.tasks.len() {
            let t = &mut self.tasks[i];
            let live = t.is_occupied() && matches!(t.state(), TaskState::Healthy(_));
            if !live || !t.flags().contains(TaskFlags::PERIODIC) || !t.count_down() {
                continue;
            }
            if t.queue() == Queue::Periodic {
                self.release_periodic(i);
            }
        }
        if self.switching {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Starts a new activation of the sleeping periodic `task`.
    fn release_periodic(&mut self, task: usize) {
        self.periodic.remove(&mut self.tasks, task);
        self.tasks[task].rearm();
        self.make_ready(task);
        crate::klog!(self.trace, Event::PeriodicWake { task });
    }

    /// Puts `task` at the back of its priority band in the ready list.
    pub(crate) fn make_ready(&mut self, task: usize) {
        let p = self.tasks[task].priority();
        let ahead_of = self
            .ready
            .iter(&self.tasks)
            .find(|&j| p.is_more_important_than(self.tasks[j].priority()));
        match ahead_of {
            Some(j) => self.ready.insert_before(&mut self.tasks, j, task),
            None => self.ready.push_back(&mut self.tasks, task),
        }
        let t = &mut self.tasks[task];
        t.set_healthy_state(SchedState::Ready);
        t.set_queue(Queue::Ready);
    }

    /// Starts `task`'s wait for its next release. The countdown is left as
    /// it is.
    fn sleep(&mut self, task: usize) {
        self.periodic.push_back(&mut self.tasks, task);
        let t = &mut self.tasks[task];
        t.set_healthy_state(SchedState::Sleeping);
        t.set_queue(Queue::Periodic);
    }

    /// Takes `task` off whichever list it's on.
    fn unqueue(&mut self, task: usize) {
        match self.tasks[task].queue() {
            Queue::None => {}
            Queue::Ready => self.ready.remove(&mut self.tasks, task),
            Queue::Periodic => self.periodic.remove(&mut self.tasks, task),
            Queue::Waiting(lock) => self.withdraw_waiter(task, lock),
            Queue::Reclaim => self.reclaim.remove(&mut self.tasks, task),
        }
        self.tasks[task].set_queue(Queue::None);
    }

    /// Acts on a scheduling hint, returning the index of the task to run
    /// next, or `None` if nothing can run (only possible with no idle task).
    pub fn dispatch(&mut self, hint: NextTask) -> Option<usize> {
        match hint {
            NextTask::Same
                if self
                    .current
                    .is_some_and(|c| self.tasks[c].is_healthy(SchedState::Running)) =>
            {
                self.current
            }
            NextTask::Specific(next) => {
                self.requeue_current();
                self.unqueue(next);
                Some(self.run(next))
            }
            _ => {
                self.requeue_current();
                match self.ready.pop_front(&mut self.tasks).or(self.idle) {
                    Some(next) => {
                        self.tasks[next].set_queue(Queue::None);
                        Some(self.run(next))
                    }
                    None => {
                        self.current = None;
                        crate::klog!(self.trace, Event::Idle);
                        None
                    }
                }
            }
        }
    }

    /// A running task that's being switched away from goes back in line.
    fn requeue_current(&mut self) {
        let Some(c) = self.current else { return };
        let t = &mut self.tasks[c];
        if !t.is_healthy(SchedState::Running) {
            return;
        }
        if t.is_idle() {
            t.set_healthy_state(SchedState::Ready);
        } else {
            self.make_ready(c);
        }
    }

    fn run(&mut self, next: usize) -> usize {
        self.tasks[next].set_healthy_state(SchedState::Running);
        if self.current != Some(next) {
            crate::klog!(self.trace, Event::Dispatch { task: next });
            crate::profiling::context_switch(next);
        }
        self.current = Some(next);
        next
    }

    /// Switches directly to `target`, which must be ready or sleeping. The
    /// caller stays ready.
    pub fn task_switch(
        &mut self,
        caller: usize,
        target: TaskId,
    ) -> Result<NextTask, UserError> {
        let i = target.index();
        let t = self
            .tasks
            .get(i)
            .filter(|t| t.answers_to(target) && !t.is_idle())
            .ok_or(ResponseCode::NoSuchTask)?;
        if i == caller || !t.state().is_runnable() {
            return Err(ResponseCode::NotRunnable.into());
        }
        Ok(NextTask::Specific(i))
    }

    /// Ends `task`, releasing every lock it holds and parking it for
    /// reclamation.
    pub fn end_task(&mut self, task: usize, fault: Option<FaultInfo>) -> NextTask {
        if self.tasks[task].is_idle() {
            die(format_args!("idle task ended ({fault:?})"));
        }
        if self.tasks[task].queue() == Queue::Reclaim {
            die(format_args!("task {task} ended twice"));
        }
        self.unqueue(task);
        let handed_off = self.abandon_locks(task);
        self.tasks[task].set_terminated(fault);
        self.reclaim.push_back(&mut self.tasks, task);
        self.tasks[task].set_queue(Queue::Reclaim);
        crate::uassert!(self.live > 0);
        self.live -= 1;

        match fault {
            None => crate::klog!(self.trace, Event::TaskEnded { task }),
            Some(fault) => {
                crate::klog!(self.trace, Event::TaskFaulted { task, fault })
            }
        }

        if self.current == Some(task) {
            NextTask::Other
        } else {
            handed_off
        }
    }

    /// Called when `task`'s entry function returns. A periodic task is reset
    /// to start over from its entry point at its next release, which may
    /// already have come; any other task ends.
    pub fn end_activation(&mut self, task: usize) -> NextTask {
        if !self.tasks[task].flags().contains(TaskFlags::PERIODIC) {
            return self.end_task(task, None);
        }
        arch::initialize_frame(&mut self.tasks[task]);
        self.unqueue(task);
        self.sleep(task);
        if self.tasks[task].release_due() {
            self.release_periodic(task);
        }
        crate::klog!(self.trace, Event::ActivationEnded { task });
        NextTask::Other
    }

    /// Frees the slot of the oldest ended task, returning what's needed to
    /// give its memory back.
    pub fn reap(&mut self) -> Option<Reaped> {
        let i = self.reclaim.pop_front(&mut self.tasks)?;
        let task = self.task_id(i);
        let t = &mut self.tasks[i];
        let reaped = Reaped {
            task,
            stack: t.stack(),
            flags: t.flags(),
        };
        t.vacate();
        crate::klog!(self.trace, Event::Reaped { task: i });
        Some(reaped)
    }

    /// Handles the trap that ends the boot sequence: from here on traps are
    /// requests from tasks, and the dispatch that follows starts the first
    /// one.
    pub(crate) fn begin_switching(&mut self) -> NextTask {
        if self.switching {
            die("scheduler started twice");
        }
        self.switching = true;
        self.current = None;
        crate::klog!(self.trace, Event::Bootstrap);
        NextTask::Other
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use abi::Priority;

    #[test]
    fn ready_list_orders_by_priority_then_arrival() {
        let mut rig = Rig::new();
        let a = rig.spawn(3, 0);
        let b = rig.spawn(1, 0);
        let c = rig.spawn(3, 0);
        let d = rig.spawn(1, 0);
        let order: Vec<_> = rig.kernel.ready_tasks().collect();
        assert_eq!(order, vec![b, d, a, c]);
        rig.kernel.check_invariants();
    }

    #[test]
    fn equal_priorities_round_robin() {
        let mut rig = Rig::with_idle();
        let a = rig.spawn(2, 0);
        let b = rig.spawn(2, 0);
        assert_eq!(rig.start(), Some(a));
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(b));
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(a));
        assert_eq!(rig.kernel.dispatch(NextTask::Same), Some(a));
        rig.kernel.check_invariants();
    }

    #[test]
    fn idle_runs_only_when_nothing_is_ready() {
        let mut rig = Rig::with_idle();
        let idle = rig.kernel.idle.unwrap();
        assert_eq!(rig.start(), Some(idle));
        let a = rig.spawn(4, 0);
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(a));
        let _ = rig.kernel.end_task(a, None);
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(idle));
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(idle));
        rig.kernel.check_invariants();
    }

    #[test]
    fn no_idle_and_nothing_ready_dispatches_nothing() {
        let mut rig = Rig::new();
        assert_eq!(rig.start(), None);
        assert_eq!(rig.kernel.current(), None);
    }

    #[test]
    fn periodic_wakes_after_exactly_its_period() {
        let mut rig = Rig::with_idle();
        let periodic = rig.spawn(1, 100);
        let oneshot = rig.spawn(2, 0);
        assert!(rig.kernel.task(periodic).is_healthy(SchedState::Sleeping));

        // The one-shot task is what the first dispatch picks.
        assert_eq!(rig.start(), Some(oneshot));

        for _ in 0..99 {
            let _ = rig.kernel.tick();
        }
        assert!(rig.kernel.task(periodic).is_healthy(SchedState::Sleeping));
        let hint = rig.kernel.tick();
        assert!(rig.kernel.task(periodic).is_healthy(SchedState::Ready));
        let wakes = rig
            .kernel
            .trace()
            .count(|e| matches!(e, Event::PeriodicWake { task } if *task == periodic));
        assert_eq!(wakes, 1);
        assert_eq!(rig.kernel.dispatch(hint), Some(periodic));

        // Ending the activation puts it back to sleep for another period.
        let hint = rig.kernel.end_activation(periodic);
        assert_eq!(rig.kernel.dispatch(hint), Some(oneshot));
        assert_eq!(rig.kernel.task(periodic).remaining(), 100);
        assert_eq!(rig.kernel.ticks(), 100);
        rig.kernel.check_invariants();
    }

    /// Ticks until `task` is next released, giving up after `limit`.
    fn ticks_until_ready(rig: &mut Rig, task: usize, limit: u32) -> Option<u64> {
        for _ in 0..limit {
            let _ = rig.kernel.tick();
            if rig.kernel.task(task).is_healthy(SchedState::Ready) {
                return Some(rig.kernel.ticks());
            }
        }
        None
    }

    #[test]
    fn periodic_releases_keep_a_fixed_rate() {
        let mut rig = Rig::with_idle();
        let p = rig.spawn(1, 10);
        rig.start();

        assert_eq!(ticks_until_ready(&mut rig, p, 20), Some(10));
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(p));

        // An activation that runs for half its period doesn't push the next
        // release back.
        for _ in 0..5 {
            let _ = rig.kernel.tick();
        }
        let hint = rig.kernel.end_activation(p);
        let _ = rig.kernel.dispatch(hint);
        assert!(rig.kernel.task(p).is_healthy(SchedState::Sleeping));
        assert_eq!(ticks_until_ready(&mut rig, p, 20), Some(20));
        rig.kernel.check_invariants();
    }

    #[test]
    fn overrunning_activation_is_released_again_at_once() {
        let mut rig = Rig::with_idle();
        let p = rig.spawn(1, 4);
        rig.start();

        assert_eq!(ticks_until_ready(&mut rig, p, 10), Some(4));
        assert_eq!(rig.kernel.dispatch(NextTask::Other), Some(p));
        for _ in 0..6 {
            let _ = rig.kernel.tick();
        }
        assert!(rig.kernel.task(p).release_due());

        let hint = rig.kernel.end_activation(p);
        assert!(rig.kernel.task(p).is_healthy(SchedState::Ready));
        assert_eq!(rig.kernel.task(p).remaining(), 4);
        assert_eq!(rig.kernel.dispatch(hint), Some(p));
        rig.kernel.check_invariants();
    }

    #[test]
    fn total_tasks_tracks_creations_and_ends() {
        let mut rig = Rig::with_idle();
        assert_eq!(rig.kernel.total_tasks(), 0);
        let a = rig.spawn(1, 0);
        let b = rig.spawn(1, 10);
        let c = rig.spawn(2, 0);
        assert_eq!(rig.kernel.total_tasks(), 3);
        let _ = rig.kernel.end_task(b, None);
        assert_eq!(rig.kernel.total_tasks(), 2);
        let _ = rig.kernel.end_task(a, Some(FaultInfo::DivideByZero));
        let _ = rig.kernel.end_task(c, None);
        assert_eq!(rig.kernel.total_tasks(), 0);
        rig.kernel.check_invariants();
    }

    #[test]
    fn reaping_frees_slot_and_stales_handle() {
        let mut rig = Rig::with_idle();
        let a = rig.spawn(1, 0);
        let id = rig.kernel.task_id(a);
        let stack = rig.kernel.task(a).stack();
        let _ = rig.kernel.end_task(a, None);
        let reaped = rig.kernel.reap().unwrap();
        assert_eq!(reaped.task, id);
        assert_eq!(reaped.stack, stack);
        assert_eq!(rig.kernel.reap(), None);

        let b = rig.spawn(1, 0);
        assert_eq!(b, a);
        assert_ne!(rig.kernel.task_id(b), id);
        assert_eq!(
            rig.kernel.task_switch(b, id),
            Err(ResponseCode::NoSuchTask.into())
        );
    }

    #[test]
    fn task_switch_statuses() {
        let mut rig = Rig::with_idle();
        let a = rig.spawn(1, 0);
        let b = rig.spawn(5, 0);
        let sleeper = rig.spawn(5, 50);
        let gone = rig.spawn(5, 0);
        assert_eq!(rig.start(), Some(a));

        let gone_id = rig.kernel.task_id(gone);
        let _ = rig.kernel.end_task(gone, None);
        assert_eq!(
            rig.kernel.task_switch(a, gone_id),
            Err(ResponseCode::NotRunnable.into())
        );
        assert_eq!(
            rig.kernel.task_switch(a, TaskId::for_index_and_gen(1000, abi::Generation::ZERO)),
            Err(ResponseCode::NoSuchTask.into())
        );
        let self_id = rig.kernel.task_id(a);
        assert_eq!(
            rig.kernel.task_switch(a, self_id),
            Err(ResponseCode::NotRunnable.into())
        );

        // Sleeping counts as runnable; it gets pulled out early.
        let hint = rig.kernel.task_switch(a, rig.kernel.task_id(sleeper)).unwrap();
        assert_eq!(hint, NextTask::Specific(sleeper));
        assert_eq!(rig.kernel.dispatch(hint), Some(sleeper));
        assert!(rig.kernel.task(a).is_healthy(SchedState::Ready));
        rig.kernel.check_invariants();

        // A less important ready task can be switched to as well.
        let hint = rig.kernel.task_switch(sleeper, rig.kernel.task_id(b)).unwrap();
        assert_eq!(rig.kernel.dispatch(hint), Some(b));
        rig.kernel.check_invariants();
    }

    #[test]
    fn stacks_are_vetted() {
        let mut rig = Rig::new();
        let good = rig.stack();
        let desc = |stack| TaskDesc {
            entry: entry_a as usize,
            stack,
            priority: Priority(1),
            period: 0,
            flags: TaskFlags::empty(),
        };
        let outside = Region::from_raw(0x10, 1024).unwrap();
        let err = Err(UserError::from(UsageError::InvalidStack));
        assert_eq!(rig.kernel.create_task(desc(outside)), err);
        let tiny = Region::from_raw(good.base(), MIN_STACK - 1).unwrap();
        assert_eq!(rig.kernel.create_task(desc(tiny)), err);

        rig.kernel.create_task(desc(good)).unwrap();
        let overlapping = Region::from_raw(good.base() + 64, 512).unwrap();
        assert_eq!(rig.kernel.create_task(desc(overlapping)), err);

        // Kernel stacks must come from the kernel heap.
        let mut kdesc = desc(rig.stack());
        kdesc.flags = TaskFlags::KERNEL_STACK;
        assert_eq!(rig.kernel.create_task(kdesc), err);
    }

    #[test]
    fn idle_priority_and_full_table_are_refused() {
        let mut rig = Rig::new();
        let stack = rig.stack();
        let r = rig.kernel.create_task(TaskDesc {
            entry: entry_a as usize,
            stack,
            priority: Priority::IDLE,
            period: 0,
            flags: TaskFlags::empty(),
        });
        assert_eq!(r, Err(ResponseCode::BadArgument.into()));

        for _ in 0..crate::config::TASK_SLOTS {
            let _ = rig.spawn(3, 0);
        }
        let stack = rig.stack();
        let r = rig.kernel.create_task(TaskDesc {
            entry: entry_a as usize,
            stack,
            priority: Priority(3),
            period: 0,
            flags: TaskFlags::empty(),
        });
        assert_eq!(r, Err(ResponseCode::TaskTableFull.into()));
    }

    #[test]
    fn children_inherit_streams() {
        let mut rig = Rig::with_idle();
        let parent = rig.spawn(1, 0);
        let streams = crate::task::Streams {
            stdin: Some(abi::ResourceHandle(1)),
            stdout: Some(abi::ResourceHandle(2)),
            stderr: None,
        };
        rig.kernel.tasks[parent].set_streams(streams);
        assert_eq!(rig.start(), Some(parent));
        let child = rig.spawn(1, 0);
        assert_eq!(rig.kernel.task(child).streams(), streams);
        assert_ne!(rig.kernel.task(child).pid(), rig.kernel.task(parent).pid());
    }

    #[test]
    #[should_panic(expected = "idle task ended")]
    fn ending_idle_is_fatal() {
        let mut rig = Rig::with_idle();
        let idle = rig.kernel.idle.unwrap();
        let _ = rig.kernel.end_task(idle, None);
    }
}
