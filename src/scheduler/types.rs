//! Scheduler type definitions

use alloc::sync::Arc;

use crate::platform::CpuId;
use crate::task::{PriorityClass, Thread};

use super::arena::SchedHandle;

/// Activation phase of one CPU's scheduler
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePhase {
    /// Constructed, no idle thread yet; ticks pass straight through
    Idle = 0,
    /// Idle thread adopted, first decision not made yet
    Activated = 1,
    /// Making decisions on every tick
    Scheduling = 2,
}

impl CorePhase {
    pub fn from_atomic(val: u8) -> Self {
        match val {
            0 => CorePhase::Idle,
            1 => CorePhase::Activated,
            _ => CorePhase::Scheduling,
        }
    }
}

/// Intrusive run queue links
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    pub prev: Option<SchedHandle>,
    pub next: Option<SchedHandle>,
}

/// Per-thread bookkeeping owned by the hosting CPU's arena
pub struct SchedulingData {
    pub thread: Arc<Thread>,
    /// Ticks consumed since the last decay
    pub usage: u32,
    /// `usage / 4 + nice`, refreshed every fifth usage tick
    pub priority: i32,
    pub class: PriorityClass,
    /// Set when the thread was added with an explicit CPU
    pub pinned_core: Option<CpuId>,
    /// CPU whose arena hosts this entry
    pub running_core: CpuId,
    /// Outstanding block requests; eligible only at zero
    pub blocks: u32,
    /// Usage saturated; skipped until decay or the idle-class reset
    pub forced_down: bool,
    /// Just unblocked; wins the next scan of its class
    pub needs_wakeup: bool,
    pub(crate) link: Link,
}

impl SchedulingData {
    pub fn new(thread: Arc<Thread>, core: CpuId) -> Self {
        let class = thread.class();
        let pinned_core = thread.pinned_cpu();
        Self {
            thread,
            usage: 0,
            priority: 0,
            class,
            pinned_core,
            running_core: core,
            blocks: 0,
            forced_down: false,
            needs_wakeup: false,
            link: Link::default(),
        }
    }

    pub fn info(&self) -> SchedInfo {
        SchedInfo {
            core: self.running_core,
            class: self.class,
            usage: self.usage,
            priority: self.priority,
            blocks: self.blocks,
            forced_down: self.forced_down,
            needs_wakeup: self.needs_wakeup,
            pinned: self.pinned_core.is_some(),
        }
    }
}

/// Copy of a thread's scheduling data, for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedInfo {
    pub core: CpuId,
    pub class: PriorityClass,
    pub usage: u32,
    pub priority: i32,
    pub blocks: u32,
    pub forced_down: bool,
    pub needs_wakeup: bool,
    pub pinned: bool,
}
