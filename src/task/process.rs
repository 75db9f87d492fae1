//! Tasks: an address space plus a group of threads
//!
//! ## Lifecycle
//!
//! ```text
//! Waiting --(main thread attached)--> Running <--(suspend/resume)--> Blocked
//!    \                                   |                              |
//!     `-----------(kill)---------------> Died <------(kill)------------'
//! ```
//!
//! A task dies when its main thread exits or when it is killed. Its other
//! threads are not torn down on the spot: each CPU reaps them the next time
//! its scan reaches them, and the deferred reaper releases their stacks.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use spin::Mutex;

use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::{AddressSpace, Platform};
use crate::scheduler::SchedulerOps;

use super::thread::Thread;
use super::types::{Pid, PriorityClass, Ring, TaskState, Tid};

/// Highest and lowest nice values accepted by `set_nice`
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

#[derive(Default)]
struct ThreadGroup {
    /// Threads that have not exited
    live: Vec<Arc<Thread>>,
    /// Exited threads whose stacks the reaper has not released yet
    exited: Vec<Arc<Thread>>,
    main: Option<Tid>,
}

pub struct Task {
    pid: Pid,
    name: Mutex<String>,
    ring: Ring,
    state: AtomicU8,
    address_space: AddressSpace,
    /// Kernel tasks borrow the kernel address space and never destroy it
    owns_address_space: bool,
    nice: AtomicI32,
    exit_code: AtomicI32,
    next_tid: AtomicU32,
    threads: Mutex<ThreadGroup>,
    platform: Arc<dyn Platform>,
}

impl Task {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        pid: Pid,
        name: &str,
        ring: Ring,
    ) -> KernResult<Arc<Task>> {
        let (address_space, owns_address_space) = match ring {
            Ring::Kernel => (platform.kernel_address_space(), false),
            Ring::User => match platform.create_address_space() {
                Some(space) => (space, true),
                None => {
                    crate::kwarn!("task {} ({}): no memory for address space", pid, name);
                    return Err(KernError::with_detail(ErrorKind::NoMemory, "address space"));
                }
            },
        };

        Ok(Arc::new(Task {
            pid,
            name: Mutex::new(String::from(name)),
            ring,
            state: AtomicU8::new(TaskState::Waiting as u8),
            address_space,
            owns_address_space,
            nice: AtomicI32::new(0),
            exit_code: AtomicI32::new(0),
            next_tid: AtomicU32::new(1),
            threads: Mutex::new(ThreadGroup::default()),
            platform,
        }))
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    #[inline]
    pub fn ring(&self) -> Ring {
        self.ring
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_atomic(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn address_space(&self) -> AddressSpace {
        self.address_space
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    #[inline]
    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::Relaxed)
    }

    /// Clamped to `NICE_MIN..=NICE_MAX`. Takes effect at the next priority
    /// recalculation or usage decay.
    pub fn set_nice(&self, nice: i32) {
        self.nice.store(nice.clamp(NICE_MIN, NICE_MAX), Ordering::Relaxed);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.state() == TaskState::Died
    }

    /// Move Waiting -> Running. The kernel task is started at boot and
    /// therefore never gets a main thread.
    pub(crate) fn start(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Waiting as u8,
            TaskState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stop scheduling every thread of the task until `resume`.
    pub fn suspend(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Blocked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn resume(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Blocked as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the task dead. Returns false if it already was; the first exit
    /// code wins.
    pub fn pronounce_dead(&self, exit_code: i32) -> bool {
        let prev = self.state.swap(TaskState::Died as u8, Ordering::AcqRel);
        if prev == TaskState::Died as u8 {
            return false;
        }
        self.exit_code.store(exit_code, Ordering::Release);
        crate::kinfo!("task {} ({}) died, exit code {}", self.pid, self.name(), exit_code);
        true
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Create a thread in this task and enroll it with the scheduler.
    ///
    /// The first thread attached to a waiting task becomes its main thread
    /// and moves the task to Running.
    pub fn attach_thread(
        self: &Arc<Self>,
        sched: &dyn SchedulerOps,
        entry: usize,
        class: PriorityClass,
        stack_pages: usize,
        args: &[usize],
    ) -> KernResult<Arc<Thread>> {
        let thread = self.create_thread(entry, class, stack_pages, args, true)?;
        self.enroll(sched, thread)
    }

    /// Create the permanent idle thread for one CPU. It belongs to this task
    /// but never becomes its main thread and is not enrolled here; the CPU
    /// scheduler adopts it on activation.
    pub(crate) fn spawn_idle_thread(self: &Arc<Self>, entry: usize) -> KernResult<Arc<Thread>> {
        self.create_thread(entry, PriorityClass::Idle, 0, &[], false)
    }

    fn create_thread(
        self: &Arc<Self>,
        entry: usize,
        class: PriorityClass,
        stack_pages: usize,
        args: &[usize],
        may_be_main: bool,
    ) -> KernResult<Arc<Thread>> {
        if self.is_dead() {
            return Err(KernError::with_detail(ErrorKind::InvalidArgument, "task has died"));
        }

        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let thread = Thread::create(self, tid, entry, class, stack_pages, args)?;

        let mut group = self.threads.lock();
        if may_be_main && group.main.is_none() && self.state() == TaskState::Waiting {
            group.main = Some(tid);
            self.start();
        }
        group.live.push(thread.clone());
        Ok(thread)
    }

    fn enroll(&self, sched: &dyn SchedulerOps, thread: Arc<Thread>) -> KernResult<Arc<Thread>> {
        if let Err(err) = sched.add_thread(&thread) {
            crate::kwarn!(
                "task {}: enrolling thread {} failed: {}",
                self.pid,
                thread.tid(),
                err
            );
            self.discard_thread(&thread);
            return Err(err);
        }
        Ok(thread)
    }

    /// Forget a thread that never got enrolled and give its stacks back.
    pub(crate) fn discard_thread(&self, thread: &Arc<Thread>) {
        let mut group = self.threads.lock();
        group.live.retain(|t| !Arc::ptr_eq(t, thread));
        if group.main == Some(thread.tid()) {
            group.main = None;
            let _ = self.state.compare_exchange(
                TaskState::Running as u8,
                TaskState::Waiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        drop(group);
        thread.release_stacks();
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        let group = self.threads.lock();
        let main = group.main?;
        group
            .live
            .iter()
            .chain(group.exited.iter())
            .find(|t| t.tid() == main)
            .cloned()
    }

    pub fn is_main_thread(&self, thread: &Thread) -> bool {
        self.threads.lock().main == Some(thread.tid())
    }

    /// Live or exited-but-unreaped thread by id
    pub fn thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        let group = self.threads.lock();
        group
            .live
            .iter()
            .chain(group.exited.iter())
            .find(|t| t.tid() == tid)
            .cloned()
    }

    pub fn live_threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().live.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().live.len()
    }

    /// Move a thread from the live list to the exited list.
    pub(crate) fn mark_thread_exit(&self, thread: &Arc<Thread>) {
        thread.mark_exited();
        let mut group = self.threads.lock();
        if let Some(pos) = group.live.iter().position(|t| Arc::ptr_eq(t, thread)) {
            let thread = group.live.swap_remove(pos);
            group.exited.push(thread);
        }
    }

    /// Take the exited threads that no CPU still hosts or executes.
    ///
    /// Threads a CPU reaped during its scan are flagged exited but still sit
    /// on the live list (the scan runs in interrupt context and never takes
    /// this lock), so both lists are searched.
    pub(crate) fn take_reapable(&self) -> Vec<Arc<Thread>> {
        let mut group = self.threads.lock();
        let ThreadGroup { live, exited, .. } = &mut *group;
        let mut reapable = Vec::new();
        for list in [live, exited] {
            let mut i = 0;
            while i < list.len() {
                let t = &list[i];
                if t.has_exited() && !t.is_enrolled() && t.running_on().is_none() {
                    reapable.push(list.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        reapable
    }

    /// Exited threads still waiting for their CPU to switch away
    pub(crate) fn has_exited_threads(&self) -> bool {
        let group = self.threads.lock();
        !group.exited.is_empty() || group.live.iter().any(|t| t.has_exited())
    }

    /// Dead and nothing left to reap
    pub(crate) fn is_drained(&self) -> bool {
        let group = self.threads.lock();
        self.is_dead() && group.live.is_empty() && group.exited.is_empty()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.owns_address_space {
            self.platform.destroy_address_space(self.address_space);
        }
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("ring", &self.ring)
            .finish()
    }
}
