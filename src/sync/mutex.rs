//! Spin-then-block kernel mutex
//!
//! `lock` spins for a bounded number of attempts and then, in `Simple`
//! mode, sleeps on the mutex's own wait channel until an `unlock` wakes it.
//! The other modes never sleep:
//!
//! - `NoScheduler` stops scheduling decisions on the locking CPU for the
//!   critical section and turns them back on for that same CPU on unlock.
//! - `NoInterrupts` disables interrupts and restores the previous state on
//!   unlock.
//!
//! The mutex guards no data of its own; it serializes a critical section.
//! Dropping it while held is a kernel bug.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::kernel::Kernel;
use crate::platform::CpuId;

use super::waitqueue::WaitChannel;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Simple = 0,
    NoScheduler = 1,
    NoInterrupts = 2,
}

impl LockMode {
    fn from_atomic(val: u8) -> Self {
        match val {
            1 => LockMode::NoScheduler,
            2 => LockMode::NoInterrupts,
            _ => LockMode::Simple,
        }
    }
}

pub struct Mutex {
    owned: AtomicBool,
    // The fields below are written only by the owner, before `owned` is
    // released, and read back by the owner in `unlock`.
    mode: AtomicU8,
    /// Interrupt flag or scheduler state to restore on unlock
    was_enabled: AtomicBool,
    /// CPU whose scheduler a `NoScheduler` lock disabled
    disabled_cpu: AtomicU32,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            owned: AtomicBool::new(false),
            mode: AtomicU8::new(LockMode::Simple as u8),
            was_enabled: AtomicBool::new(false),
            disabled_cpu: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> LockMode {
        LockMode::from_atomic(self.mode.load(Ordering::Relaxed))
    }

    /// Channel contended lockers sleep on
    pub fn channel(&self) -> WaitChannel {
        WaitChannel::of(self)
    }

    fn acquire(&self) -> bool {
        self.owned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// One attempt. On failure nothing the mode touched stays changed.
    pub fn try_lock(&self, kernel: &Kernel, mode: LockMode) -> bool {
        match mode {
            LockMode::Simple => {
                if !self.acquire() {
                    return false;
                }
            }
            LockMode::NoInterrupts => {
                let platform = kernel.platform();
                let was_enabled = platform.disable_interrupts();
                if !self.acquire() {
                    platform.restore_interrupts(was_enabled);
                    return false;
                }
                self.was_enabled.store(was_enabled, Ordering::Relaxed);
            }
            LockMode::NoScheduler => {
                let sched = kernel.scheduler();
                let cpu = sched.current_cpu();
                let was_enabled = sched.disable_core(cpu);
                if !self.acquire() {
                    if was_enabled {
                        sched.enable_core(cpu);
                    }
                    return false;
                }
                self.was_enabled.store(was_enabled, Ordering::Relaxed);
                self.disabled_cpu.store(cpu as u32, Ordering::Relaxed);
            }
        }
        self.mode.store(mode as u8, Ordering::Relaxed);
        true
    }

    /// Acquire, spinning first and sleeping in `Simple` mode once the spin
    /// budget is used up.
    pub fn lock(&self, kernel: &Kernel, mode: LockMode) {
        let spin = kernel.config().mutex_spin;
        let platform = kernel.platform();
        loop {
            for _ in 0..spin {
                if self.try_lock(kernel, mode) {
                    return;
                }
                platform.pause();
            }

            if mode == LockMode::Simple {
                let sched = kernel.scheduler();
                if let Err(err) = kernel
                    .waits()
                    .wait_if(sched, self.channel(), || self.is_locked())
                {
                    // No thread to put to sleep (early boot, idle context):
                    // keep spinning.
                    crate::ktrace!("mutex {:#x}: cannot sleep: {}", self.channel().as_raw(), err);
                }
            }
        }
    }

    /// Acquire and get a guard that unlocks on drop.
    pub fn lock_guard<'a>(&'a self, kernel: &'a Kernel, mode: LockMode) -> MutexGuard<'a> {
        self.lock(kernel, mode);
        MutexGuard { mutex: self, kernel }
    }

    pub fn unlock(&self, kernel: &Kernel) {
        if !self.is_locked() {
            crate::kwarn!("mutex {:#x}: unlock while not locked", self.channel().as_raw());
            return;
        }
        let mode = self.mode();
        let was_enabled = self.was_enabled.load(Ordering::Relaxed);
        let cpu = self.disabled_cpu.load(Ordering::Relaxed) as CpuId;

        self.owned.store(false, Ordering::Release);

        match mode {
            LockMode::Simple => {}
            LockMode::NoScheduler => {
                if was_enabled {
                    kernel.scheduler().enable_core(cpu);
                }
            }
            LockMode::NoInterrupts => kernel.platform().restore_interrupts(was_enabled),
        }

        kernel.waits().wakeup_one(kernel.scheduler(), self.channel());
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let addr = self.channel().as_raw();
        if *self.owned.get_mut() {
            crate::kpanic!("mutex {:#x} dropped while locked", addr);
        }
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    kernel: &'a Kernel,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.kernel);
    }
}
