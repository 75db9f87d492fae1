//! SMP Scheduler
//!
//! Every CPU runs its own decision engine over its own run queues; there is
//! no global scheduling lock. Operations on a thread hosted by another CPU
//! travel through that CPU's command mailbox and are applied by the owner.
//!
//! ## Module Organization
//!
//! - `types`: scheduling entries, core phases, inspection records
//! - `arena`: generation-checked per-CPU storage of scheduling entries
//! - `runqueue`: intrusive per-class run queues
//! - `mailbox`: bounded cross-CPU command queue
//! - `percpu`: the per-CPU decision engine
//! - `coordinator`: routes operations to the owning CPU (SMP)
//! - `uniprocessor`: one CPU, every operation applied in place
//! - `stats`: per-CPU counters
//!
//! ## Usage
//!
//! ```rust,ignore
//! let sched = Arc::new(Coordinator::new(platform.clone(), config));
//! sched.activate_core(cpu, idle_thread)?;
//! sched.add_thread(&thread)?;
//! // timer vector:
//! let next = sched.schedule_on_core(token, cpu);
//! ```

mod arena;
mod coordinator;
mod mailbox;
mod percpu;
mod runqueue;
mod stats;
mod types;
mod uniprocessor;

use alloc::sync::Arc;

use crate::error::KernResult;
use crate::platform::{CpuId, Platform, ResumeToken};
use crate::task::Thread;

pub use arena::{SchedArena, SchedHandle};
pub use coordinator::Coordinator;
pub use mailbox::{Command, CommandKind, Mailbox};
pub use percpu::{CoreScheduler, RunQueueSnapshot};
pub use runqueue::{ClassQueue, RunQueues};
pub use stats::{CoreStats, CoreStatsSnapshot};
pub use types::{CorePhase, SchedInfo, SchedulingData};
pub use uniprocessor::UniScheduler;

/// What the rest of the kernel needs from a scheduler.
///
/// Thread-level operations are addressed by thread; the implementation
/// finds the CPU hosting it. They fail with `NotEnrolled` for a thread no
/// CPU hosts and with `MailboxFull` when the owning CPU has too much
/// pending, in which case the caller retries.
pub trait SchedulerOps: Send + Sync {
    fn platform(&self) -> &dyn Platform;

    /// Give `cpu` its permanent idle thread and start scheduling there.
    fn activate_core(&self, cpu: CpuId, idle: Arc<Thread>) -> KernResult<()>;

    /// Timer tick on `cpu`: returns the token to resume.
    fn schedule(&self, cpu: CpuId, token: ResumeToken) -> ResumeToken;

    /// Mailbox IPI on `cpu`: apply pending commands, rescheduling if one of
    /// them asked for it.
    fn handle_mailbox(&self, cpu: CpuId, token: ResumeToken) -> ResumeToken;

    fn add_thread(&self, thread: &Arc<Thread>) -> KernResult<()>;
    fn remove_thread(&self, thread: &Arc<Thread>) -> KernResult<()>;

    /// Increment the thread's block count. Blocked threads are not picked.
    fn block(&self, thread: &Arc<Thread>) -> KernResult<()>;
    fn unblock(&self, thread: &Arc<Thread>) -> KernResult<()>;

    fn active_thread(&self, cpu: CpuId) -> Option<Arc<Thread>>;

    /// Ask `cpu` to take a decision as soon as possible.
    fn reschedule(&self, cpu: CpuId);

    /// Stop decisions on `cpu`; returns whether it was enabled.
    fn disable_core(&self, cpu: CpuId) -> bool;
    fn enable_core(&self, cpu: CpuId);

    fn sched_info(&self, thread: &Thread) -> Option<SchedInfo>;

    fn current_cpu(&self) -> CpuId {
        self.platform().current_cpu()
    }

    /// Thread executing on the calling CPU
    fn current_thread(&self) -> Option<Arc<Thread>> {
        self.active_thread(self.current_cpu())
    }
}
