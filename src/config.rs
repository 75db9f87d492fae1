//! Scheduler tunables
//!
//! Defaults match the values the scheduler was tuned with; every knob can be
//! overridden from the kernel command line (`sched.decay_us=250000` etc.).

/// Decay all usage counters roughly every 500ms
pub const DEFAULT_DECAY_INTERVAL_US: u64 = 500_000;

/// Usage at which a thread is forced down for the rest of the round
pub const DEFAULT_USAGE_SATURATION: u32 = 50;

/// Pending commands a CPU's mailbox accepts before pushing back
pub const DEFAULT_MAILBOX_SLOTS: usize = 64;

/// Entries preallocated per CPU work queue
pub const DEFAULT_WORKQUEUE_INITIAL: usize = 50;

/// Entries added when an exhausted work queue is drained
pub const DEFAULT_WORKQUEUE_GROWTH: usize = 10;

/// Busy-spin attempts before a mutex falls back to waiting
pub const DEFAULT_MUTEX_SPIN: usize = 10_000;

/// Kernel stack pages for kernel-ring threads: clamp(requested, MIN, MAX)
pub const KERNEL_STACK_PAGES_MIN: usize = 12;
pub const KERNEL_STACK_PAGES_MAX: usize = 32;

/// User stack pages for user-ring threads
pub const USER_STACK_PAGES_MIN: usize = 24;
pub const USER_STACK_PAGES_MAX: usize = 64;

/// Kernel stack pages backing a user-ring thread's trap frames
pub const USER_KERNEL_STACK_PAGES: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedConfig {
    pub decay_interval_us: u64,
    pub usage_saturation: u32,
    pub mailbox_slots: usize,
    pub workqueue_initial: usize,
    pub workqueue_growth: usize,
    pub mutex_spin: usize,
}

impl SchedConfig {
    pub const fn new() -> Self {
        Self {
            decay_interval_us: DEFAULT_DECAY_INTERVAL_US,
            usage_saturation: DEFAULT_USAGE_SATURATION,
            mailbox_slots: DEFAULT_MAILBOX_SLOTS,
            workqueue_initial: DEFAULT_WORKQUEUE_INITIAL,
            workqueue_growth: DEFAULT_WORKQUEUE_GROWTH,
            mutex_spin: DEFAULT_MUTEX_SPIN,
        }
    }

    /// Defaults overridden by whatever `sched.*` / `workqueue.*` options the
    /// command line carries. Malformed or zero values are ignored.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::new();
        config.apply_cmdline(cmdline);
        config
    }

    pub fn apply_cmdline(&mut self, cmdline: &str) {
        for arg in cmdline.split_whitespace() {
            if let Some(value) = arg.strip_prefix("sched.decay_us=") {
                if let Some(v) = parse_nonzero(value) {
                    self.decay_interval_us = v as u64;
                    crate::kinfo!("Sched config: decay interval {}us", v);
                }
            } else if let Some(value) = arg.strip_prefix("sched.saturation=") {
                if let Some(v) = parse_nonzero(value) {
                    self.usage_saturation = v.min(u32::MAX as usize) as u32;
                    crate::kinfo!("Sched config: usage saturation {}", v);
                }
            } else if let Some(value) = arg.strip_prefix("sched.mailbox=") {
                if let Some(v) = parse_nonzero(value) {
                    self.mailbox_slots = v;
                    crate::kinfo!("Sched config: {} mailbox slots", v);
                }
            } else if let Some(value) = arg.strip_prefix("sched.spin=") {
                if let Some(v) = parse_nonzero(value) {
                    self.mutex_spin = v;
                    crate::kinfo!("Sched config: mutex spin bound {}", v);
                }
            } else if let Some(value) = arg.strip_prefix("workqueue.pool=") {
                if let Some(v) = parse_nonzero(value) {
                    self.workqueue_initial = v;
                    crate::kinfo!("Sched config: work queue pool {}", v);
                }
            } else if let Some(value) = arg.strip_prefix("workqueue.grow=") {
                if let Some(v) = parse_nonzero(value) {
                    self.workqueue_growth = v;
                    crate::kinfo!("Sched config: work queue growth {}", v);
                }
            }
        }
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_nonzero(value: &str) -> Option<usize> {
    match value.parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(v) => Some(v),
    }
}
