//! Threads, the run queue, and the round-robin scheduler that drives them.
//!
//! This is a logical simulation of the scheduling model in §4.5: there is
//! no real CPU context to save or restore, so `schedule()` here is the
//! bookkeeping core of the source's `schedule()` — queue rotation, dead-list
//! reaping, state transitions — without the architecture-specific register
//! save/restore or address-space switch, which belong to a real executor
//! layered on top of this crate.

pub mod scheduler;
pub mod tcb;
pub mod wait;

use crate::error::{KernelError, KernelResult};
use crate::types::{Pid, Tid};
use scheduler::{RoundRobinScheduler, Scheduler};
use std::collections::BTreeMap;
use tcb::{Entry, ThreadControlBlock, ThreadState};
use wait::WaitQueue;

/// Ticks a thread may run before `sched_tick` preempts it, matching the
/// source's default time slice.
pub const DEFAULT_TIME_SLICE: u32 = 10;

pub struct ThreadManager {
    threads: BTreeMap<Tid, ThreadControlBlock>,
    scheduler: Box<dyn Scheduler>,
    current: Option<Tid>,
    next_tid: u64,
    idle_tid: Tid,
    dead_list: Vec<Tid>,
    ticks: u32,
    time_slice: u32,
}

impl ThreadManager {
    /// `kernel_pid` owns the idle thread, which always exists and is the
    /// thread scheduled when the run queue is empty.
    pub fn new(kernel_pid: Pid) -> Self {
        let idle_tid = Tid::new(1).unwrap();
        let mut idle_tcb = ThreadControlBlock::new(idle_tid, kernel_pid, Entry::Kernel { label: "idle" });
        idle_tcb.is_idle = true;
        idle_tcb.state = ThreadState::Running;

        let mut threads = BTreeMap::new();
        threads.insert(idle_tid, idle_tcb);

        Self {
            threads,
            scheduler: Box::new(RoundRobinScheduler::new()),
            current: Some(idle_tid),
            next_tid: 2,
            idle_tid,
            dead_list: Vec::new(),
            ticks: 0,
            time_slice: DEFAULT_TIME_SLICE,
        }
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    pub fn get(&self, tid: Tid) -> Option<&ThreadControlBlock> {
        self.threads.get(&tid)
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid::new(self.next_tid).expect("next_tid is never 0");
        self.next_tid += 1;
        tid
    }

    /// `thread_create(proc, entry, arg)`: allocate a thread, READY, enqueued
    /// on the run queue. `entry` carries the trampoline/user-entry
    /// distinction described in §4.5.
    pub fn create_thread(&mut self, owner: Pid, entry: Entry) -> Tid {
        let tid = self.alloc_tid();
        let tcb = ThreadControlBlock::new(tid, owner, entry);
        self.threads.insert(tid, tcb);
        self.scheduler.enqueue(tid);
        tid
    }

    /// Core of `schedule()`: reap the dead list, pick the next thread (run
    /// queue head, else idle), demote a still-RUNNING current thread back
    /// to READY and requeue it, and mark the winner RUNNING. Returns the
    /// newly-current thread.
    pub fn schedule(&mut self) -> Tid {
        self.reap_dead();

        if let Some(current) = self.current {
            let is_idle = self.threads.get(&current).map(|t| t.is_idle).unwrap_or(false);
            if let Some(tcb) = self.threads.get_mut(&current) {
                if tcb.state == ThreadState::Running && !is_idle {
                    tcb.state = ThreadState::Ready;
                    self.scheduler.enqueue(current);
                }
            }
        }

        let next = self.scheduler.schedule().unwrap_or(self.idle_tid);
        if let Some(tcb) = self.threads.get_mut(&next) {
            tcb.state = ThreadState::Running;
        }
        self.current = Some(next);
        self.ticks = 0;
        next
    }

    /// `sched_yield()`: voluntary reschedule from kernel context.
    pub fn yield_current(&mut self) -> Tid {
        self.schedule()
    }

    /// `sched_tick(from_usermode)`. Preemption only ever considers ticks
    /// that arrived while executing user code; kernel code is never
    /// preempted mid-critical-section. Returns `true` if a reschedule
    /// occurred.
    pub fn sched_tick(&mut self, from_usermode: bool) -> bool {
        if !from_usermode {
            return false;
        }
        self.ticks += 1;
        if let Some(current) = self.current {
            if let Some(tcb) = self.threads.get_mut(&current) {
                tcb.ticks_run += 1;
            }
        }
        if self.ticks >= self.time_slice {
            self.schedule();
            true
        } else {
            false
        }
    }

    /// `sched_exit()`: mark current DEAD and link it into the dead list.
    /// The caller must still invoke `schedule()`; a DEAD thread is never
    /// reaped until a successor has taken over (`schedule` reaps only
    /// threads other than the one it is about to hand off from).
    pub fn exit_current(&mut self, exit_code: i32) {
        if let Some(current) = self.current {
            if let Some(tcb) = self.threads.get_mut(&current) {
                tcb.state = ThreadState::Dead { exit_code };
            }
            self.dead_list.push(current);
        }
    }

    fn reap_dead(&mut self) {
        let current = self.current;
        let mut keep = Vec::new();
        for tid in self.dead_list.drain(..) {
            if Some(tid) == current {
                keep.push(tid);
                continue;
            }
            self.threads.remove(&tid);
        }
        self.dead_list = keep;
    }

    pub fn exit_code_of(&self, tid: Tid) -> Option<i32> {
        match self.threads.get(&tid)?.state {
            ThreadState::Dead { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    /// `thread_sleep(wq)`: mark the current thread BLOCKED and enqueue it on
    /// `wq`. Returns the thread that was put to sleep; the caller must then
    /// call `schedule()` to hand off the CPU.
    pub fn thread_sleep(&mut self, wq: &mut WaitQueue) -> KernelResult<Tid> {
        let current = self.current.ok_or(KernelError::InvalidArgument)?;
        if let Some(tcb) = self.threads.get_mut(&current) {
            tcb.state = ThreadState::Blocked;
        }
        wq.enqueue(current);
        Ok(current)
    }

    /// `thread_wake_one(wq)`: dequeue FIFO, mark READY, add to the run
    /// queue.
    pub fn thread_wake_one(&mut self, wq: &mut WaitQueue) -> Option<Tid> {
        let tid = wq.wake_one()?;
        if let Some(tcb) = self.threads.get_mut(&tid) {
            tcb.state = ThreadState::Ready;
        }
        self.scheduler.enqueue(tid);
        Some(tid)
    }

    /// `thread_wake_all(wq)`.
    pub fn thread_wake_all(&mut self, wq: &mut WaitQueue) -> Vec<Tid> {
        let woken = wq.wake_all();
        for tid in &woken {
            if let Some(tcb) = self.threads.get_mut(tid) {
                tcb.state = ThreadState::Ready;
            }
            self.scheduler.enqueue(*tid);
        }
        woken
    }

    /// Terminate every thread owned by `pid`, used by process destruction.
    pub fn terminate_owned_by(&mut self, pid: Pid) {
        let owned: Vec<Tid> = self
            .threads
            .iter()
            .filter(|(_, tcb)| tcb.owner == pid)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in owned {
            self.scheduler.dequeue(tid);
            if Some(tid) == self.current {
                self.exit_current(-1);
            } else {
                self.threads.remove(&tid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_pid() -> Pid {
        Pid::new(0)
    }

    #[test]
    fn idle_runs_when_queue_empty() {
        let mut tm = ThreadManager::new(kernel_pid());
        let idle = tm.idle_tid;
        assert_eq!(tm.schedule(), idle);
    }

    #[test]
    fn round_robin_alternates_every_slice() {
        let mut tm = ThreadManager::new(kernel_pid());
        let a = tm.create_thread(kernel_pid(), Entry::Kernel { label: "a" });
        let b = tm.create_thread(kernel_pid(), Entry::Kernel { label: "b" });
        assert_eq!(tm.schedule(), a);
        for _ in 0..DEFAULT_TIME_SLICE - 1 {
            assert!(!tm.sched_tick(true));
        }
        assert!(tm.sched_tick(true));
        assert_eq!(tm.current(), Some(b));
    }

    #[test]
    fn kernel_mode_ticks_never_preempt() {
        let mut tm = ThreadManager::new(kernel_pid());
        let a = tm.create_thread(kernel_pid(), Entry::Kernel { label: "a" });
        tm.create_thread(kernel_pid(), Entry::Kernel { label: "b" });
        assert_eq!(tm.schedule(), a);
        for _ in 0..1000 {
            assert!(!tm.sched_tick(false));
        }
        assert_eq!(tm.current(), Some(a));
    }

    #[test]
    fn wait_wake_roundtrip() {
        let mut tm = ThreadManager::new(kernel_pid());
        let t1 = tm.create_thread(kernel_pid(), Entry::Kernel { label: "t1" });
        tm.schedule();
        assert_eq!(tm.current(), Some(t1));

        let mut wq = WaitQueue::new();
        tm.thread_sleep(&mut wq).unwrap();
        assert_eq!(tm.get(t1).unwrap().state, ThreadState::Blocked);
        assert!(wq.contains(t1));

        assert_eq!(tm.thread_wake_one(&mut wq), Some(t1));
        assert_eq!(tm.get(t1).unwrap().state, ThreadState::Ready);
        assert!(!wq.contains(t1));
    }

    #[test]
    fn exit_then_schedule_reaps_previous_thread() {
        let mut tm = ThreadManager::new(kernel_pid());
        let a = tm.create_thread(kernel_pid(), Entry::Kernel { label: "a" });
        tm.schedule();
        assert_eq!(tm.current(), Some(a));
        tm.exit_current(7);
        assert_eq!(tm.exit_code_of(a), Some(7));
        tm.schedule();
        assert!(tm.get(a).is_none());
    }
}
