//! Per-CPU scheduler statistics

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters bumped by one CPU's scheduler. Read from anywhere.
#[derive(Default)]
pub struct CoreStats {
    ticks: AtomicU64,
    idle_ticks: AtomicU64,
    context_switches: AtomicU64,
    skipped_ticks: AtomicU64,
    forced_down: AtomicU64,
    fairness_resets: AtomicU64,
    decays: AtomicU64,
    reaped: AtomicU64,
    commands_applied: AtomicU64,
    commands_dropped: AtomicU64,
}

/// Point-in-time copy of `CoreStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStatsSnapshot {
    /// Scheduling passes that made a decision
    pub ticks: u64,
    /// Passes that picked the idle thread
    pub idle_ticks: u64,
    pub context_switches: u64,
    /// Passes abandoned because the run queue lock was busy
    pub skipped_ticks: u64,
    /// Threads forced down after saturating their usage
    pub forced_down: u64,
    /// Forced-down flags cleared when the scan reached the idle class
    pub fairness_resets: u64,
    pub decays: u64,
    /// Threads of dead tasks unenrolled by the scan
    pub reaped: u64,
    pub commands_applied: u64,
    /// Commands for threads this CPU no longer hosts
    pub commands_dropped: u64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CoreStats {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            forced_down: AtomicU64::new(0),
            fairness_resets: AtomicU64::new(0),
            decays: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
            commands_applied: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
        }
    }

    bump! {
        record_tick => ticks,
        record_idle_tick => idle_ticks,
        record_switch => context_switches,
        record_skipped_tick => skipped_ticks,
        record_forced_down => forced_down,
        record_fairness_reset => fairness_resets,
        record_decay => decays,
        record_reaped => reaped,
        record_command => commands_applied,
        record_dropped_command => commands_dropped,
    }

    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            forced_down: self.forced_down.load(Ordering::Relaxed),
            fairness_resets: self.fairness_resets.load(Ordering::Relaxed),
            decays: self.decays.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
        }
    }
}
