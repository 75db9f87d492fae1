//! Single-CPU scheduler
//!
//! Runs the same decision engine as the SMP coordinator on CPU 0, but every
//! command is applied in place: with one CPU there is nobody to post to.
//! Used for uniprocessor boot and by unit tests that do not care about
//! cross-CPU delivery.

use alloc::sync::Arc;

use crate::config::SchedConfig;
use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::{CpuId, Platform, ResumeToken, IPI_RESCHEDULE};
use crate::task::Thread;

use super::mailbox::{Command, CommandKind};
use super::percpu::CoreScheduler;
use super::types::SchedInfo;
use super::SchedulerOps;

/// The only CPU a `UniScheduler` knows
pub const UNI_CPU: CpuId = 0;

pub struct UniScheduler {
    platform: Arc<dyn Platform>,
    core: CoreScheduler,
}

impl UniScheduler {
    pub fn new(platform: Arc<dyn Platform>, config: SchedConfig) -> Self {
        let core = CoreScheduler::new(UNI_CPU, platform.clone(), config);
        Self { platform, core }
    }

    pub fn core(&self) -> &CoreScheduler {
        &self.core
    }

    fn apply(&self, kind: CommandKind, thread: &Arc<Thread>) -> KernResult<()> {
        if kind != CommandKind::InsertThread && !thread.is_enrolled() {
            return Err(KernError::new(ErrorKind::NotEnrolled));
        }
        self.core.apply_local(Command::new(kind, thread.clone()));
        Ok(())
    }

    fn check_cpu(cpu: CpuId) -> KernResult<()> {
        if cpu == UNI_CPU {
            Ok(())
        } else {
            Err(KernError::new(ErrorKind::NoSuchCore))
        }
    }
}

impl SchedulerOps for UniScheduler {
    fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    fn activate_core(&self, cpu: CpuId, idle: Arc<Thread>) -> KernResult<()> {
        Self::check_cpu(cpu)?;
        self.core.activate(idle)
    }

    fn schedule(&self, cpu: CpuId, token: ResumeToken) -> ResumeToken {
        if cpu != UNI_CPU {
            crate::kpanic!("schedule on CPU {} under a uniprocessor scheduler", cpu);
        }
        self.core.schedule(token)
    }

    fn handle_mailbox(&self, _cpu: CpuId, token: ResumeToken) -> ResumeToken {
        self.core.poke(token)
    }

    fn add_thread(&self, thread: &Arc<Thread>) -> KernResult<()> {
        if thread.is_enrolled() {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "thread already enrolled",
            ));
        }
        self.apply(CommandKind::InsertThread, thread)
    }

    fn remove_thread(&self, thread: &Arc<Thread>) -> KernResult<()> {
        self.apply(CommandKind::RemoveThread, thread)
    }

    fn block(&self, thread: &Arc<Thread>) -> KernResult<()> {
        self.apply(CommandKind::BlockThread, thread)
    }

    fn unblock(&self, thread: &Arc<Thread>) -> KernResult<()> {
        self.apply(CommandKind::UnblockThread, thread)
    }

    fn active_thread(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        if cpu != UNI_CPU {
            return None;
        }
        self.core.active_thread()
    }

    fn reschedule(&self, cpu: CpuId) {
        if cpu == UNI_CPU {
            self.core.request_reschedule();
            self.platform.send_ipi(UNI_CPU, IPI_RESCHEDULE);
        }
    }

    fn disable_core(&self, cpu: CpuId) -> bool {
        cpu == UNI_CPU && self.core.disable()
    }

    fn enable_core(&self, cpu: CpuId) {
        if cpu == UNI_CPU {
            self.core.enable();
        }
    }

    fn sched_info(&self, thread: &Thread) -> Option<SchedInfo> {
        self.core.sched_info(thread)
    }

    fn current_cpu(&self) -> CpuId {
        UNI_CPU
    }
}
