//! Per-CPU scheduling decision engine
//!
//! Each CPU owns one `CoreScheduler`: an arena of scheduling entries, one
//! run queue per priority class, the active and idle threads, and a command
//! mailbox other CPUs post into.
//!
//! ## Decision
//!
//! On every timer tick the previous thread is charged one unit of usage.
//! Reaching the saturation threshold forces it down for the rest of the
//! round. Classes are scanned Kernel, High, Normal, Idle; within a class the
//! first eligible entry wins, unless an entry was just unblocked, and the
//! winner is rotated to the back of its class. Reaching the Idle class while
//! anything is forced down ends the round and clears every forced-down flag.
//! Usage decays for everyone at a fixed interval.
//!
//! ## Lock Hierarchy
//!
//! 1. Core state (`state`), always taken with interrupts disabled
//! 2. Mailbox, a leaf held only for a push or a single pop; the drain pops
//!    with the core state held
//!
//! The tick path only ever `try_lock`s the core state: if another CPU is
//! inspecting it, the current thread simply keeps running for one more tick.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::Mutex;

use crate::config::SchedConfig;
use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::{CpuId, InterruptGuard, Platform, ResumeRecord, ResumeToken};
use crate::task::{PriorityClass, TaskState, Thread};

use super::arena::{SchedArena, SchedHandle};
use super::mailbox::{Command, CommandKind, Mailbox};
use super::runqueue::RunQueues;
use super::stats::{CoreStats, CoreStatsSnapshot};
use super::types::{CorePhase, SchedInfo, SchedulingData};

// ============================================================================
// Core state
// ============================================================================

struct CoreState {
    arena: SchedArena,
    queues: RunQueues,
    /// Thread the CPU is executing. Kept after its entry is removed until
    /// the next decision switches away from it.
    active: Option<Arc<Thread>>,
    active_handle: Option<SchedHandle>,
    idle: Option<SchedHandle>,
    idle_thread: Option<Arc<Thread>>,
    /// No decision made yet; the token handed to the first tick belongs to
    /// boot code, not to any thread
    first_run: bool,
    has_forced_down: bool,
    since_decay_us: u64,
}

impl CoreState {
    fn new(cpu: CpuId) -> Self {
        Self {
            arena: SchedArena::new(cpu),
            queues: RunQueues::new(),
            active: None,
            active_handle: None,
            idle: None,
            idle_thread: None,
            first_run: true,
            has_forced_down: false,
            since_decay_us: 0,
        }
    }

    /// Handle of `thread` if this CPU hosts it
    fn hosted(&self, thread: &Thread) -> Option<SchedHandle> {
        let handle = thread.sched_handle()?;
        let data = self.arena.get(handle)?;
        if core::ptr::eq(Arc::as_ptr(&data.thread), thread) {
            Some(handle)
        } else {
            None
        }
    }

    fn is_eligible(data: &SchedulingData) -> bool {
        data.blocks == 0 && !data.forced_down && data.thread.task().state() == TaskState::Running
    }
}

/// Class membership and active thread of one CPU, for inspection
#[derive(Debug, Clone)]
pub struct RunQueueSnapshot {
    pub cpu: CpuId,
    pub phase: CorePhase,
    pub active: Option<Arc<Thread>>,
    /// Queue contents in scan order, one list per class
    pub classes: [Vec<Arc<Thread>>; PriorityClass::COUNT],
}

// ============================================================================
// CoreScheduler
// ============================================================================

pub struct CoreScheduler {
    cpu: CpuId,
    platform: Arc<dyn Platform>,
    config: SchedConfig,
    state: Mutex<CoreState>,
    mailbox: Mailbox,
    enabled: AtomicBool,
    needs_reschedule: AtomicBool,
    phase: AtomicU8,
    stats: CoreStats,
}

impl CoreScheduler {
    pub fn new(cpu: CpuId, platform: Arc<dyn Platform>, config: SchedConfig) -> Self {
        Self {
            cpu,
            platform,
            config,
            state: Mutex::new(CoreState::new(cpu)),
            mailbox: Mailbox::new(config.mailbox_slots),
            enabled: AtomicBool::new(true),
            needs_reschedule: AtomicBool::new(false),
            phase: AtomicU8::new(CorePhase::Idle as u8),
            stats: CoreStats::new(),
        }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[inline]
    pub fn phase(&self) -> CorePhase {
        CorePhase::from_atomic(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn stats(&self) -> CoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Adopt the permanent idle thread and start taking decisions.
    pub fn activate(&self, idle: Arc<Thread>) -> KernResult<()> {
        let _irq = InterruptGuard::new(&*self.platform);
        let mut st = self.state.lock();
        if self.phase() != CorePhase::Idle {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "CPU already activated",
            ));
        }
        if idle.is_enrolled() {
            return Err(KernError::with_detail(
                ErrorKind::InvalidArgument,
                "idle thread already enrolled",
            ));
        }

        let st = &mut *st;
        let handle = st.arena.insert(SchedulingData::new(idle.clone(), self.cpu));
        st.queues
            .class_mut(PriorityClass::Idle)
            .push_back(&mut st.arena, handle);
        idle.set_sched_handle(Some(handle));
        idle.set_running_on(Some(self.cpu));

        st.idle = Some(handle);
        st.idle_thread = Some(idle.clone());
        st.active = Some(idle);
        st.active_handle = Some(handle);
        st.first_run = true;
        self.phase.store(CorePhase::Activated as u8, Ordering::Release);

        crate::kinfo!("CPU {}: scheduler activated", self.cpu);
        Ok(())
    }

    // ========================================================================
    // Decision path
    // ========================================================================

    /// Timer-tick entry: pick the thread to resume and return its token.
    ///
    /// Never fails. A CPU that was never activated, is disabled, or whose
    /// state is momentarily locked elsewhere keeps running what it ran.
    pub fn schedule(&self, token: ResumeToken) -> ResumeToken {
        if self.phase() == CorePhase::Idle {
            return token;
        }
        let Some(mut guard) = self.state.try_lock() else {
            self.stats.record_skipped_tick();
            return token;
        };
        let st = &mut *guard;

        if !st.first_run {
            if let Some(active) = &st.active {
                active.save_token(token);
            }
        }
        if !self.is_enabled() {
            return token;
        }

        self.drain_locked(st);
        self.stats.record_tick();
        self.charge_previous(st);
        self.account_time(st);

        let next = match self.pick_next(st).or(st.idle) {
            Some(next) => next,
            None => return token,
        };
        let Some(data) = st.arena.get_mut(next) else {
            return token;
        };
        data.needs_wakeup = false;
        let thread = data.thread.clone();

        self.switch_to(st, next, thread)
    }

    /// Re-run the decision only if a drained command asked for it.
    pub fn poke(&self, token: ResumeToken) -> ResumeToken {
        if self.needs_reschedule.load(Ordering::Acquire) {
            self.schedule(token)
        } else {
            token
        }
    }

    fn switch_to(&self, st: &mut CoreState, next: SchedHandle, thread: Arc<Thread>) -> ResumeToken {
        let switched = match &st.active {
            Some(prev) => !Arc::ptr_eq(prev, &thread),
            None => true,
        };
        if switched {
            if let Some(prev) = &st.active {
                prev.set_running_on(None);
            }
            self.stats.record_switch();
        }
        thread.set_running_on(Some(self.cpu));
        if Some(next) == st.idle {
            self.stats.record_idle_tick();
        }

        self.platform.write_resume_record(
            self.cpu,
            ResumeRecord {
                address_space: thread.task().address_space(),
                kernel_stack_top: thread.kernel_stack().top(),
            },
        );

        let token = thread.saved_token();
        st.active = Some(thread);
        st.active_handle = Some(next);
        st.first_run = false;
        self.needs_reschedule.store(false, Ordering::Release);
        self.phase.store(CorePhase::Scheduling as u8, Ordering::Release);
        token
    }

    /// Charge the previous thread one tick, reaping it if its task died and
    /// forcing it down once it saturates.
    fn charge_previous(&self, st: &mut CoreState) {
        let Some(handle) = st.active_handle else {
            return;
        };
        if Some(handle) == st.idle {
            return;
        }
        let saturation = self.config.usage_saturation;
        let Some(data) = st.arena.get_mut(handle) else {
            return;
        };

        if data.thread.task().state() == TaskState::Died {
            self.reap_locked(st, handle);
            return;
        }

        data.usage = data.usage.saturating_add(1);
        if data.usage % 5 == 0 {
            data.priority = (data.usage / 4) as i32 + data.thread.task().nice();
        }
        if data.usage >= saturation && !data.forced_down {
            data.forced_down = true;
            st.has_forced_down = true;
            self.stats.record_forced_down();
            crate::ktrace!(
                "CPU {}: thread {}:{} forced down at usage {}",
                self.cpu,
                data.thread.task().pid(),
                data.thread.tid(),
                data.usage
            );
        }
    }

    fn account_time(&self, st: &mut CoreState) {
        st.since_decay_us = st
            .since_decay_us
            .saturating_add(self.platform.micros_per_tick());
        if st.since_decay_us < self.config.decay_interval_us {
            return;
        }
        st.since_decay_us = 0;

        let saturation = self.config.usage_saturation;
        let mut any_forced = false;
        for data in st.arena.iter_mut() {
            let nice = data.thread.task().nice() as i64;
            data.usage = ((data.usage as i64 + nice).max(0) / 3) as u32;
            if data.forced_down && data.usage < saturation {
                data.forced_down = false;
            }
            any_forced |= data.forced_down;
        }
        st.has_forced_down = any_forced;
        self.stats.record_decay();
    }

    fn clear_forced_down(&self, st: &mut CoreState) {
        for data in st.arena.iter_mut() {
            data.forced_down = false;
        }
        st.has_forced_down = false;
        self.stats.record_fairness_reset();
    }

    fn pick_next(&self, st: &mut CoreState) -> Option<SchedHandle> {
        for class in PriorityClass::ALL {
            if class == PriorityClass::Idle && st.has_forced_down {
                self.clear_forced_down(st);
            }

            let mut chosen = None;
            let mut cursor = st.queues.class(class).head();
            while let Some(handle) = cursor {
                let Some(data) = st.arena.get(handle) else {
                    break;
                };
                cursor = data.link.next;
                if Some(handle) == st.idle {
                    continue;
                }

                if CoreState::is_eligible(data) {
                    if data.needs_wakeup {
                        chosen = Some(handle);
                        break;
                    }
                    if chosen.is_none() {
                        chosen = Some(handle);
                    }
                } else if data.thread.task().state() == TaskState::Died {
                    self.reap_locked(st, handle);
                }
            }

            if let Some(handle) = chosen {
                st.queues
                    .class_mut(class)
                    .rotate_to_back(&mut st.arena, handle);
                return Some(handle);
            }
        }
        None
    }

    /// Unenroll a thread whose task died. The deferred reaper releases its
    /// stacks once no CPU runs on them.
    fn reap_locked(&self, st: &mut CoreState, handle: SchedHandle) {
        let Some(data) = self.unlink_locked(st, handle) else {
            return;
        };
        data.thread.mark_exited();
        self.stats.record_reaped();
        crate::kdebug!(
            "CPU {}: reaped thread {}:{} of dead task",
            self.cpu,
            data.thread.task().pid(),
            data.thread.tid()
        );
    }

    fn unlink_locked(&self, st: &mut CoreState, handle: SchedHandle) -> Option<SchedulingData> {
        let class = st.arena.get(handle)?.class;
        st.queues.class_mut(class).unlink(&mut st.arena, handle);
        let data = st.arena.remove(handle)?;
        data.thread.set_sched_handle(None);
        if st.active_handle == Some(handle) {
            st.active_handle = None;
            self.needs_reschedule.store(true, Ordering::Release);
        }
        Some(data)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Apply a command on the owning CPU right away.
    pub fn apply_local(&self, command: Command) {
        let _irq = InterruptGuard::new(&*self.platform);
        let mut st = self.state.lock();
        self.apply(&mut st, command);
    }

    /// Queue a command for the owning CPU. The caller sends the IPI.
    pub fn post(&self, command: Command) -> KernResult<()> {
        self.mailbox.push(command)
    }

    /// Apply every pending command. Returns whether one of them asked for a
    /// reschedule.
    pub fn drain_mailbox(&self) -> bool {
        if self.mailbox.is_empty() {
            return self.needs_reschedule.load(Ordering::Acquire);
        }
        let _irq = InterruptGuard::new(&*self.platform);
        let mut st = self.state.lock();
        self.drain_locked(&mut st);
        self.needs_reschedule.load(Ordering::Acquire)
    }

    fn drain_locked(&self, st: &mut CoreState) {
        while let Some(command) = self.mailbox.pop() {
            self.apply(st, command);
        }
    }

    fn apply(&self, st: &mut CoreState, command: Command) {
        let Command { kind, thread } = command;
        crate::ktrace!(
            "CPU {}: {} thread {}:{}",
            self.cpu,
            kind.as_str(),
            thread.task().pid(),
            thread.tid()
        );

        if kind == CommandKind::InsertThread {
            self.insert_locked(st, thread);
            return;
        }

        let Some(handle) = st.hosted(&thread) else {
            self.stats.record_dropped_command();
            crate::kdebug!(
                "CPU {}: dropping {} for thread {}:{}, not hosted here",
                self.cpu,
                kind.as_str(),
                thread.task().pid(),
                thread.tid()
            );
            return;
        };
        self.stats.record_command();

        match kind {
            CommandKind::InsertThread => {}
            CommandKind::RemoveThread => {
                if Some(handle) == st.idle {
                    crate::kwarn!("CPU {}: refusing to remove the idle thread", self.cpu);
                    return;
                }
                self.unlink_locked(st, handle);
            }
            CommandKind::BlockThread => {
                let is_active = st.active_handle == Some(handle);
                if let Some(data) = st.arena.get_mut(handle) {
                    data.blocks = data.blocks.saturating_add(1);
                }
                if is_active {
                    self.needs_reschedule.store(true, Ordering::Release);
                }
            }
            CommandKind::UnblockThread => {
                let Some(data) = st.arena.get_mut(handle) else {
                    return;
                };
                if data.blocks == 0 {
                    crate::kwarn!(
                        "CPU {}: unblock of thread {}:{} that is not blocked",
                        self.cpu,
                        thread.task().pid(),
                        thread.tid()
                    );
                    return;
                }
                data.blocks -= 1;
                if data.blocks == 0 {
                    data.forced_down = false;
                    data.needs_wakeup = true;
                    self.needs_reschedule.store(true, Ordering::Release);
                }
            }
        }
    }

    fn insert_locked(&self, st: &mut CoreState, thread: Arc<Thread>) {
        if thread.is_enrolled() || thread.has_exited() {
            self.stats.record_dropped_command();
            crate::kdebug!(
                "CPU {}: dropping insert of thread {}:{}, enrolled or exited",
                self.cpu,
                thread.task().pid(),
                thread.tid()
            );
            return;
        }
        self.stats.record_command();

        let class = thread.class();
        let handle = st.arena.insert(SchedulingData::new(thread.clone(), self.cpu));
        st.queues.class_mut(class).push_back(&mut st.arena, handle);
        thread.set_sched_handle(Some(handle));
    }

    // ========================================================================
    // Control and inspection
    // ========================================================================

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Stop taking decisions. Returns whether the CPU was enabled before.
    pub fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn needs_reschedule(&self) -> bool {
        self.needs_reschedule.load(Ordering::Acquire)
    }

    pub fn request_reschedule(&self) {
        self.needs_reschedule.store(true, Ordering::Release);
    }

    pub fn active_thread(&self) -> Option<Arc<Thread>> {
        let _irq = InterruptGuard::new(&*self.platform);
        self.state.lock().active.clone()
    }

    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        let _irq = InterruptGuard::new(&*self.platform);
        self.state.lock().idle_thread.clone()
    }

    /// Scheduling data of a thread this CPU hosts
    pub fn sched_info(&self, thread: &Thread) -> Option<SchedInfo> {
        let _irq = InterruptGuard::new(&*self.platform);
        let st = self.state.lock();
        let handle = st.hosted(thread)?;
        st.arena.get(handle).map(SchedulingData::info)
    }

    /// Enrolled threads, idle thread included
    pub fn thread_count(&self) -> usize {
        let _irq = InterruptGuard::new(&*self.platform);
        self.state.lock().arena.len()
    }

    pub fn snapshot(&self) -> RunQueueSnapshot {
        let _irq = InterruptGuard::new(&*self.platform);
        let st = self.state.lock();
        let mut classes: [Vec<Arc<Thread>>; PriorityClass::COUNT] = Default::default();
        for class in PriorityClass::ALL {
            let mut cursor = st.queues.class(class).head();
            while let Some(handle) = cursor {
                let Some(data) = st.arena.get(handle) else {
                    break;
                };
                classes[class.index()].push(data.thread.clone());
                cursor = data.link.next;
            }
        }
        RunQueueSnapshot {
            cpu: self.cpu,
            phase: self.phase(),
            active: st.active.clone(),
            classes,
        }
    }
}
