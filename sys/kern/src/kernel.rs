// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel context.
//!
//! Everything the kernel mutates at run time (the task table, the scheduler's
//! lists, the lock table, the trace) lives in one `Kernel`, built once at
//! startup and handed by `&mut` to whichever entry point is running. The
//! operations on it are spread over `sched`, `sync` and `syscalls`.

use abi::{Priority, TaskFlags, TaskId};

use crate::arch;
use crate::config::{TASK_SLOTS, TRACE_DEPTH};
use crate::fail::die;
use crate::klog::Trace;
use crate::list::List;
use crate::sync::LockTable;
use crate::task::{NextTask, Task, TaskDesc};
use crate::umem::Region;

/// Memory the kernel lets task stacks come from.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapRegions {
    pub kernel: Region,
    pub user: Region,
}

pub struct Kernel {
    pub(crate) tasks: [Task; TASK_SLOTS],
    /// Runnable tasks, most important first, arrival order within a priority.
    pub(crate) ready: List,
    /// Periodic tasks between activations.
    pub(crate) periodic: List,
    /// Ended tasks whose stacks haven't been given back yet.
    pub(crate) reclaim: List,
    pub(crate) current: Option<usize>,
    pub(crate) idle: Option<usize>,
    /// Set by the first trap; until then traps are the boot sequence handing
    /// over control.
    pub(crate) switching: bool,
    pub(crate) live: usize,
    pub(crate) next_pid: u32,
    pub(crate) ticks: u64,
    pub(crate) locks: LockTable,
    pub(crate) heaps: HeapRegions,
    pub(crate) trace: Trace<TRACE_DEPTH>,
}

impl Kernel {
    pub fn new(heaps: HeapRegions) -> Self {
        Self {
            tasks: [Task::VACANT; TASK_SLOTS],
            ready: List::new(),
            periodic: List::new(),
            reclaim: List::new(),
            current: None,
            idle: None,
            switching: false,
            live: 0,
            next_pid: 1,
            ticks: 0,
            locks: LockTable::new(),
            heaps,
            trace: Trace::new(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    /// Names the task in slot `index` as of now.
    pub fn task_id(&self, index: usize) -> TaskId {
        TaskId::for_index_and_gen(index, self.tasks[index].generation())
    }

    /// Index of the task that is running, or that trapped into the kernel.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Number of tasks created and not yet ended. The idle task doesn't
    /// count.
    pub fn total_tasks(&self) -> usize {
        self.live
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_switching(&self) -> bool {
        self.switching
    }

    pub fn trace(&self) -> &Trace<TRACE_DEPTH> {
        &self.trace
    }

    pub fn heaps(&self) -> HeapRegions {
        self.heaps
    }

    /// Ready tasks in the order they'd be dispatched.
    pub fn ready_tasks(&self) -> impl Iterator<Item = usize> + '_ {
        self.ready.iter(&self.tasks)
    }

    /// Installs the task that runs when nothing else can. It sits on no list
    /// and is never counted among the live tasks.
    pub fn install_idle(&mut self, entry: usize, stack: Region) -> TaskId {
        if self.idle.is_some() {
            die("idle task installed twice");
        }
        let desc = TaskDesc {
            entry,
            stack,
            priority: Priority::IDLE,
            period: 0,
            flags: TaskFlags::IDLE | TaskFlags::KERNEL_STACK,
        };
        let Some(i) = self.tasks.iter().position(|t| !t.is_occupied()) else {
            die("no slot for the idle task");
        };
        let pid = self.take_pid();
        self.tasks[i].occupy(&desc, pid, Default::default());
        arch::initialize_frame(&mut self.tasks[i]);
        self.idle = Some(i);
        self.task_id(i)
    }

    pub(crate) fn take_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1).max(1);
        pid
    }

    /// First half of a context switch: records `saved_sp` as where the
    /// current task's context went, lets `f` act on the kernel, and
    /// returns the saved stack pointer of the task to restore.
    ///
    /// A saved stack pointer that doesn't leave room for a whole context
    /// inside the task's stack means the context is corrupt, and is fatal.
    pub fn switch_away(
        &mut self,
        saved_sp: usize,
        f: impl FnOnce(&mut Self) -> NextTask,
    ) -> usize {
        if self.switching {
            if let Some(c) = self.current {
                let task = &mut self.tasks[c];
                if !task.stack().holds::<arch::SavedContext>(saved_sp) {
                    die(format_args!(
                        "task {c} context at {saved_sp:#x} outside its stack"
                    ));
                }
                task.set_saved_sp(saved_sp);
            }
        }
        let hint = f(self);
        self.next_context(hint)
    }

    /// Like `switch_away`, for when the current task has faulted and its
    /// context wasn't saved.
    pub fn fault_away(&mut self, fault: abi::FaultInfo) -> usize {
        let Some(c) = self.current else {
            die(format_args!("fault with no current task: {fault:?}"));
        };
        let hint = self.end_task(c, Some(fault));
        self.next_context(hint)
    }

    fn next_context(&mut self, hint: NextTask) -> usize {
        match self.dispatch(hint) {
            Some(next) => self.tasks[next].saved_sp(),
            None => die("nothing to run and no idle task"),
        }
    }

    /// Checks the structural invariants tying the task table to the lists.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        use crate::task::Queue;
        use abi::SchedState;
        let mut running = 0;
        for (i, t) in self.tasks.iter().enumerate() {
            if !t.is_occupied() {
                continue;
            }
            if t.is_healthy(SchedState::Running) {
                running += 1;
                assert_eq!(self.current, Some(i));
            }
            match t.queue() {
                Queue::Ready => {
                    assert!(self.ready.iter(&self.tasks).any(|j| j == i));
                    assert!(t.is_healthy(SchedState::Ready));
                }
                Queue::Periodic => {
                    assert!(self.periodic.iter(&self.tasks).any(|j| j == i));
                    assert!(t.is_healthy(SchedState::Sleeping));
                }
                Queue::Waiting(l) => {
                    assert!(t.is_healthy(SchedState::Blocked(l)));
                    assert_eq!(t.waiting_on(), Some(l));
                }
                Queue::Reclaim => assert!(!t.state().is_runnable()),
                Queue::None => assert!(
                    t.is_idle() || t.is_healthy(SchedState::Running)
                ),
            }
        }
        assert!(running <= 1);
        let listed = self.ready.len() + self.periodic.len();
        let blocked = self
            .tasks
            .iter()
            .filter(|t| matches!(t.queue(), Queue::Waiting(_)))
            .count();
        assert_eq!(listed + blocked + running, self.live + self.idle_running());
    }

    #[cfg(test)]
    fn idle_running(&self) -> usize {
        usize::from(
            self.idle
                .is_some_and(|i| self.tasks[i].is_healthy(abi::SchedState::Running)),
        )
    }
}
