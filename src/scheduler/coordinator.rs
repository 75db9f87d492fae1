//! SMP coordinator: one `CoreScheduler` per online CPU
//!
//! Routes every thread operation to the CPU hosting the thread. When that
//! is the calling CPU the command is applied in place with interrupts off;
//! otherwise it is posted to the owner's mailbox and the owner is kicked
//! with `IPI_MAILBOX`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::SchedConfig;
use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::{CpuId, InterruptGuard, Platform, ResumeToken, IPI_MAILBOX, IPI_RESCHEDULE};
use crate::task::Thread;

use super::mailbox::{Command, CommandKind};
use super::percpu::{CoreScheduler, RunQueueSnapshot};
use super::stats::CoreStatsSnapshot;
use super::types::SchedInfo;
use super::SchedulerOps;

pub struct Coordinator {
    platform: Arc<dyn Platform>,
    /// Indexed by CPU id; holes for ids the platform did not report
    cores: Vec<Option<CoreScheduler>>,
    online: usize,
}

impl Coordinator {
    /// One scheduler per CPU the platform reports. No CPUs is fatal.
    pub fn new(platform: Arc<dyn Platform>, config: SchedConfig) -> Self {
        let ids = platform.cpu_ids();
        let Some(&max_id) = ids.iter().max() else {
            crate::kpanic!("scheduler coordinator created with zero CPUs");
        };

        let mut cores: Vec<Option<CoreScheduler>> = Vec::with_capacity(max_id as usize + 1);
        cores.resize_with(max_id as usize + 1, || None);
        for &cpu in &ids {
            cores[cpu as usize] = Some(CoreScheduler::new(cpu, platform.clone(), config));
        }

        crate::kinfo!("SMP scheduler: {} CPU(s)", ids.len());
        Self {
            platform,
            cores,
            online: ids.len(),
        }
    }

    pub fn core(&self, cpu: CpuId) -> Option<&CoreScheduler> {
        self.cores.get(cpu as usize).and_then(Option::as_ref)
    }

    pub fn cores(&self) -> impl Iterator<Item = &CoreScheduler> {
        self.cores.iter().filter_map(Option::as_ref)
    }

    #[inline]
    pub fn cpu_count(&self) -> usize {
        self.online
    }

    fn core_or_err(&self, cpu: CpuId) -> KernResult<&CoreScheduler> {
        self.core(cpu)
            .ok_or(KernError::with_detail(ErrorKind::NoSuchCore, "unknown CPU"))
    }

    /// Deliver a command to `cpu`: in place on the calling CPU, through the
    /// mailbox otherwise.
    pub fn push_command(&self, cpu: CpuId, command: Command) -> KernResult<()> {
        let Some(core) = self.core(cpu) else {
            crate::kdebug!(
                "dropping {} command for unknown CPU {}",
                command.kind.as_str(),
                cpu
            );
            return Err(KernError::new(ErrorKind::NoSuchCore));
        };

        if cpu == self.platform.current_cpu() {
            core.apply_local(command);
            return Ok(());
        }

        // An interrupt on this CPU must not find the target mailbox locked
        // by the code it interrupted.
        let _irq = InterruptGuard::new(&*self.platform);
        core.post(command)?;
        self.platform.send_ipi(cpu, IPI_MAILBOX);
        Ok(())
    }

    /// Send a command to the CPU hosting `thread`.
    fn route(&self, kind: CommandKind, thread: &Arc<Thread>) -> KernResult<()> {
        let Some(handle) = thread.sched_handle() else {
            return Err(KernError::new(ErrorKind::NotEnrolled));
        };
        self.push_command(handle.core(), Command::new(kind, thread.clone()))
    }

    /// Enroll `thread` on `cpu` and keep it there.
    pub fn add_thread_to(&self, thread: &Arc<Thread>, cpu: CpuId) -> KernResult<()> {
        self.core_or_err(cpu)?;
        if thread.is_enrolled() {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "thread already enrolled",
            ));
        }
        thread.pin_to(cpu);
        self.push_command(cpu, Command::new(CommandKind::InsertThread, thread.clone()))
    }

    /// Timer tick on `cpu`. A CPU without a scheduler is a wiring bug.
    pub fn schedule_on_core(&self, token: ResumeToken, cpu: CpuId) -> ResumeToken {
        match self.core(cpu) {
            Some(core) => core.schedule(token),
            None => crate::kpanic!("schedule on CPU {} which has no scheduler", cpu),
        }
    }

    /// Re-run the decision on `cpu` only if a command asked for it.
    pub fn poke_core(&self, token: ResumeToken, cpu: CpuId) -> ResumeToken {
        match self.core(cpu) {
            Some(core) => core.poke(token),
            None => token,
        }
    }

    pub fn snapshot(&self, cpu: CpuId) -> Option<RunQueueSnapshot> {
        self.core(cpu).map(CoreScheduler::snapshot)
    }

    pub fn stats(&self, cpu: CpuId) -> Option<CoreStatsSnapshot> {
        self.core(cpu).map(CoreScheduler::stats)
    }

    /// Log one line of counters per CPU.
    pub fn dump_stats(&self) {
        crate::kinfo!("=== Scheduler Statistics ===");
        for core in self.cores() {
            let s = core.stats();
            crate::kinfo!(
                "CPU {}: ticks={} idle={} switches={} skipped={} forced={} resets={} reaped={} cmds={}/{}",
                core.cpu(),
                s.ticks,
                s.idle_ticks,
                s.context_switches,
                s.skipped_ticks,
                s.forced_down,
                s.fairness_resets,
                s.reaped,
                s.commands_applied,
                s.commands_dropped
            );
        }
    }
}

impl SchedulerOps for Coordinator {
    fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    fn activate_core(&self, cpu: CpuId, idle: Arc<Thread>) -> KernResult<()> {
        self.core_or_err(cpu)?.activate(idle)
    }

    fn schedule(&self, cpu: CpuId, token: ResumeToken) -> ResumeToken {
        self.schedule_on_core(token, cpu)
    }

    fn handle_mailbox(&self, cpu: CpuId, token: ResumeToken) -> ResumeToken {
        let Some(core) = self.core(cpu) else {
            crate::kwarn!("mailbox IPI on CPU {} which has no scheduler", cpu);
            return token;
        };
        if core.drain_mailbox() {
            core.schedule(token)
        } else {
            token
        }
    }

    /// Enroll on the pinned CPU if the thread has one, else on the caller's.
    fn add_thread(&self, thread: &Arc<Thread>) -> KernResult<()> {
        if thread.is_enrolled() {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "thread already enrolled",
            ));
        }
        let cpu = thread
            .pinned_cpu()
            .unwrap_or_else(|| self.platform.current_cpu());
        self.push_command(cpu, Command::new(CommandKind::InsertThread, thread.clone()))
    }

    fn remove_thread(&self, thread: &Arc<Thread>) -> KernResult<()> {
        self.route(CommandKind::RemoveThread, thread)
    }

    fn block(&self, thread: &Arc<Thread>) -> KernResult<()> {
        self.route(CommandKind::BlockThread, thread)
    }

    fn unblock(&self, thread: &Arc<Thread>) -> KernResult<()> {
        self.route(CommandKind::UnblockThread, thread)
    }

    fn active_thread(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.core(cpu)?.active_thread()
    }

    fn reschedule(&self, cpu: CpuId) {
        if let Some(core) = self.core(cpu) {
            core.request_reschedule();
            self.platform.send_ipi(cpu, IPI_RESCHEDULE);
        }
    }

    fn disable_core(&self, cpu: CpuId) -> bool {
        self.core(cpu).map_or(false, CoreScheduler::disable)
    }

    fn enable_core(&self, cpu: CpuId) {
        if let Some(core) = self.core(cpu) {
            core.enable();
        }
    }

    fn sched_info(&self, thread: &Thread) -> Option<SchedInfo> {
        let handle = thread.sched_handle()?;
        self.core(handle.core())?.sched_info(thread)
    }
}
