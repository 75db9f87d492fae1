//! Kernel scheduling context
//!
//! Created once at boot and shared (`Arc<Kernel>`) by the interrupt vectors
//! and every subsystem that needs to schedule, sleep or defer work. Holds
//! the scheduler, the wait directory, the per-CPU work queues and the task
//! table, plus the collaborators they were built with.
//!
//! ## Boot Sequence
//!
//! ```rust,ignore
//! let kernel = Kernel::boot(platform, SchedConfig::from_cmdline(cmdline))?;
//! kernel.install_vectors();
//! kernel.activate_all_cores()?;   // or activate_core(cpu) from each AP
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::SchedConfig;
use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::{
    CpuId, InterruptGuard, InterruptHandler, Platform, ResumeToken, IPI_MAILBOX, IPI_RESCHEDULE,
    TIMER_VECTOR,
};
#[cfg(feature = "smp")]
use crate::scheduler::Coordinator;
#[cfg(not(feature = "smp"))]
use crate::scheduler::UniScheduler;
use crate::scheduler::SchedulerOps;
use crate::sync::WaitDirectory;
use crate::task::{Pid, PriorityClass, Ring, Task, TaskTable, Thread, Tid, KERNEL_PID};
use crate::workqueue::{WorkCallback, WorkQueue};

pub struct Kernel {
    platform: Arc<dyn Platform>,
    config: SchedConfig,
    scheduler: Arc<dyn SchedulerOps>,
    waits: WaitDirectory,
    /// Indexed by CPU id
    work_queues: Vec<Option<WorkQueue>>,
    tasks: TaskTable,
    kernel_task: Arc<Task>,
    /// Exited threads or dead tasks are waiting for the reaper
    reap_pending: AtomicBool,
}

impl Kernel {
    /// Build the scheduling context for every CPU the platform reports.
    pub fn boot(platform: Arc<dyn Platform>, config: SchedConfig) -> KernResult<Arc<Kernel>> {
        #[cfg(feature = "smp")]
        let scheduler: Arc<dyn SchedulerOps> = Arc::new(Coordinator::new(platform.clone(), config));
        #[cfg(not(feature = "smp"))]
        let scheduler: Arc<dyn SchedulerOps> = Arc::new(UniScheduler::new(platform.clone(), config));

        Self::with_scheduler(platform, config, scheduler)
    }

    /// Build the context around an existing scheduler.
    pub fn with_scheduler(
        platform: Arc<dyn Platform>,
        config: SchedConfig,
        scheduler: Arc<dyn SchedulerOps>,
    ) -> KernResult<Arc<Kernel>> {
        let cpus = platform.cpu_ids();
        let slots = cpus.iter().max().map_or(0, |&max| max as usize + 1);
        let mut work_queues: Vec<Option<WorkQueue>> = Vec::with_capacity(slots);
        work_queues.resize_with(slots, || None);
        for &cpu in &cpus {
            work_queues[cpu as usize] = Some(WorkQueue::new(
                cpu,
                config.workqueue_initial,
                config.workqueue_growth,
            ));
        }

        let tasks = TaskTable::new();
        let kernel_task = tasks.create_kernel_task(platform.clone())?;

        crate::kinfo!(
            "Scheduler core up: {} CPU(s), decay {}us, saturation {}",
            cpus.len(),
            config.decay_interval_us,
            config.usage_saturation
        );

        Ok(Arc::new(Kernel {
            platform,
            config,
            scheduler,
            waits: WaitDirectory::new(),
            work_queues,
            tasks,
            kernel_task,
            reap_pending: AtomicBool::new(false),
        }))
    }

    /// Route the timer and scheduler IPIs to this context.
    pub fn install_vectors(self: &Arc<Self>) {
        let handler: Arc<dyn InterruptHandler> = self.clone();
        for vector in [TIMER_VECTOR, IPI_RESCHEDULE, IPI_MAILBOX] {
            self.platform.register_handler(vector, handler.clone());
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    #[inline]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    #[inline]
    pub fn scheduler(&self) -> &dyn SchedulerOps {
        &*self.scheduler
    }

    #[inline]
    pub fn waits(&self) -> &WaitDirectory {
        &self.waits
    }

    #[inline]
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    #[inline]
    pub fn kernel_task(&self) -> &Arc<Task> {
        &self.kernel_task
    }

    pub fn work_queue(&self, cpu: CpuId) -> Option<&WorkQueue> {
        self.work_queues.get(cpu as usize).and_then(Option::as_ref)
    }

    pub fn task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.get(pid)
    }

    /// Thread executing on the calling CPU
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.scheduler.current_thread()
    }

    // ========================================================================
    // CPUs
    // ========================================================================

    /// Create `cpu`'s permanent idle thread and start scheduling there.
    pub fn activate_core(&self, cpu: CpuId) -> KernResult<Arc<Thread>> {
        let idle = self
            .kernel_task
            .spawn_idle_thread(self.platform.idle_entry())?;
        if let Err(err) = self.scheduler.activate_core(cpu, idle.clone()) {
            self.kernel_task.discard_thread(&idle);
            return Err(err);
        }
        Ok(idle)
    }

    pub fn activate_all_cores(&self) -> KernResult<()> {
        for cpu in self.platform.cpu_ids() {
            self.activate_core(cpu)?;
        }
        Ok(())
    }

    /// Timer entry for `cpu`
    pub fn schedule_on_core(&self, token: ResumeToken, cpu: CpuId) -> ResumeToken {
        self.scheduler.schedule(cpu, token)
    }

    // ========================================================================
    // Tasks and threads
    // ========================================================================

    pub fn create_task(&self, name: &str, ring: Ring) -> KernResult<Arc<Task>> {
        self.tasks.create(self.platform.clone(), name, ring)
    }

    /// Create a thread in `task` and enroll it.
    pub fn attach_thread(
        &self,
        task: &Arc<Task>,
        entry: usize,
        class: PriorityClass,
        stack_pages: usize,
        args: &[usize],
    ) -> KernResult<Arc<Thread>> {
        task.attach_thread(&*self.scheduler, entry, class, stack_pages, args)
    }

    /// Terminate `thread`. The main thread takes its whole task down.
    pub fn exit_thread(&self, thread: &Arc<Thread>, exit_code: i32) {
        let sched = &*self.scheduler;
        let task = thread.task().clone();
        if task.is_main_thread(thread) {
            task.pronounce_dead(exit_code);
        }

        self.waits.forget(sched, thread);
        let blocked = self.retry_full(|| sched.block(thread));
        let removed = self.retry_full(|| sched.remove_thread(thread));
        if let Err(err) = blocked.and(removed) {
            // Already unenrolled by a CPU that found its task dead.
            crate::kdebug!("exit of thread {}:{}: {}", task.pid(), thread.tid(), err);
        }
        task.mark_thread_exit(thread);
        self.waits.wakeup(sched, thread.join_channel());
        self.reap_pending.store(true, Ordering::Release);

        let cpu = sched.current_cpu();
        if thread.running_on() == Some(cpu) {
            sched.reschedule(cpu);
        }
    }

    /// Sleep `caller` until thread `tid` of the same task exits. Returns
    /// false without sleeping if it already has.
    pub fn join_thread(&self, caller: &Arc<Thread>, tid: Tid) -> KernResult<bool> {
        let Some(target) = caller.task().thread(tid) else {
            return Err(KernError::with_detail(ErrorKind::InvalidArgument, "unknown tid"));
        };
        if Arc::ptr_eq(&target, caller) {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "thread cannot join itself",
            ));
        }

        let sched = &*self.scheduler;
        let slept = self.waits.wait_thread_if(sched, caller, target.join_channel(), || {
            !target.has_exited()
        })?;
        if slept {
            let cpu = sched.current_cpu();
            if caller.running_on() == Some(cpu) {
                sched.reschedule(cpu);
            }
        }
        Ok(slept)
    }

    /// Give up the rest of the time slice of the CPU running `thread`.
    pub fn yield_thread(&self, thread: &Thread) {
        let cpu = thread
            .running_on()
            .or_else(|| thread.sched_handle().map(|h| h.core()));
        if let Some(cpu) = cpu {
            self.scheduler.reschedule(cpu);
        }
    }

    /// Mark task `pid` dead. Its threads are reaped as the CPUs hosting them
    /// come across them.
    pub fn kill_task(&self, pid: Pid, exit_code: i32) -> KernResult<()> {
        if pid == KERNEL_PID {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "refusing to kill the kernel task",
            ));
        }
        let Some(task) = self.tasks.get(pid) else {
            return Err(KernError::with_detail(ErrorKind::InvalidArgument, "unknown pid"));
        };
        if !task.pronounce_dead(exit_code) {
            return Ok(());
        }

        self.reap_pending.store(true, Ordering::Release);
        for thread in task.live_threads() {
            if let Some(cpu) = thread.running_on() {
                self.scheduler.reschedule(cpu);
            }
        }
        Ok(())
    }

    /// Release everything exited threads and dead tasks still hold. Returns
    /// the number of threads whose stacks were released.
    pub fn reap(&self) -> usize {
        let sched = &*self.scheduler;
        let mut released = 0;
        let mut unfinished = false;

        for task in self.tasks.snapshot() {
            for thread in task.take_reapable() {
                self.waits.forget(sched, &thread);
                thread.release_stacks();
                self.waits.wakeup(sched, thread.join_channel());
                released += 1;
            }

            if task.is_dead() {
                if task.is_drained() {
                    self.tasks.remove(task.pid());
                    crate::kdebug!("task {} ({}) removed", task.pid(), task.name());
                } else {
                    unfinished = true;
                }
            } else if task.has_exited_threads() {
                unfinished = true;
            }
        }

        if unfinished {
            self.reap_pending.store(true, Ordering::Release);
        }
        if released > 0 {
            crate::kdebug!("reaper released {} thread(s)", released);
        }
        released
    }

    pub fn reap_pending(&self) -> bool {
        self.reap_pending.load(Ordering::Acquire)
    }

    // ========================================================================
    // Deferred work
    // ========================================================================

    /// Queue deferred work on the calling CPU. Safe from interrupt handlers.
    pub fn push_work(&self, callback: WorkCallback, context: usize) -> KernResult<()> {
        let _irq = InterruptGuard::new(&*self.platform);
        let cpu = self.platform.current_cpu();
        let Some(queue) = self.work_queue(cpu) else {
            return Err(KernError::with_detail(ErrorKind::NoSuchCore, "no work queue"));
        };
        queue.push_entry(callback, context)
    }

    /// Run the deferred work queued on `cpu`, then the reaper if anything
    /// exited. Returns the number of work entries run.
    pub fn run_deferred(&self, cpu: CpuId) -> usize {
        let Some(queue) = self.work_queue(cpu) else {
            return 0;
        };
        let local = cpu == self.platform.current_cpu();

        let list = {
            let _irq = InterruptGuard::new(&*self.platform);
            if local {
                queue.pop_all()
            } else {
                queue.pop_all_remote()
            }
        };
        let ran = list.run();
        {
            let _irq = InterruptGuard::new(&*self.platform);
            if local {
                queue.refurbish_list(list);
            } else {
                queue.refurbish_list_remote(list);
            }
        }

        if self.reap_pending.swap(false, Ordering::AcqRel) {
            self.reap();
        }
        ran
    }

    /// Retry `op` while the target CPU's mailbox is full.
    fn retry_full<F>(&self, mut op: F) -> KernResult<()>
    where
        F: FnMut() -> KernResult<()>,
    {
        loop {
            match op() {
                Err(err) if err.is(ErrorKind::MailboxFull) => self.platform.pause(),
                other => return other,
            }
        }
    }
}

impl InterruptHandler for Kernel {
    fn handle_interrupt(&self, vector: u8, cpu: CpuId, token: ResumeToken) -> ResumeToken {
        match vector {
            TIMER_VECTOR | IPI_RESCHEDULE => self.scheduler.schedule(cpu, token),
            IPI_MAILBOX => self.scheduler.handle_mailbox(cpu, token),
            _ => {
                crate::kwarn!("CPU {}: unexpected vector {:#x}", cpu, vector);
                token
            }
        }
    }
}
