//! Wait directory: channel-keyed sleeping
//!
//! A channel is any address-sized key, usually the address of the object a
//! thread waits for. Waiting registers the thread under its channel and
//! blocks it; waking removes threads from the channel and unblocks them.
//!
//! ## Usage Example
//!
//! ```ignore
//! // Thread A: sleep until the buffer fills
//! kernel.waits().wait_if(sched, WaitChannel::of(&buffer), || buffer.is_empty())?;
//!
//! // Thread B: signal
//! kernel.waits().wakeup(sched, WaitChannel::of(&buffer));
//! ```
//!
//! ## Lock Ordering
//!
//! The directory lock is taken with interrupts disabled and is never held
//! while a scheduler command is issued: a waiter is blocked between two
//! checks of its condition under the lock, and woken threads are unblocked
//! after it has been released. A waker that changes the condition before
//! the second check makes the waiter back out; one that runs after it finds
//! the waiter registered. Either way no wakeup is lost.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::num::NonZeroUsize;

use spin::Mutex;

use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::InterruptGuard;
use crate::scheduler::SchedulerOps;
use crate::task::Thread;

/// Opaque key threads wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitChannel(NonZeroUsize);

impl WaitChannel {
    /// Channel keyed by the address of `object`
    pub fn of<T: ?Sized>(object: &T) -> Self {
        let addr = object as *const T as *const () as usize;
        Self(NonZeroUsize::new(addr).unwrap_or(NonZeroUsize::MIN))
    }

    /// Channel from a raw key; 0 is not a channel.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(key) => Some(Self(key)),
            None => None,
        }
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0.get()
    }
}

pub struct WaitDirectory {
    channels: Mutex<BTreeMap<WaitChannel, VecDeque<Arc<Thread>>>>,
}

impl WaitDirectory {
    pub const fn new() -> Self {
        Self {
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sleep on `channel` until woken.
    ///
    /// The caller is the thread active on the current CPU.
    pub fn wait(&self, sched: &dyn SchedulerOps, channel: WaitChannel) -> KernResult<()> {
        self.wait_if(sched, channel, || true).map(|_| ())
    }

    /// Sleep on `channel` if `condition` still holds under the directory
    /// lock. Returns whether the caller slept.
    pub fn wait_if<F>(&self, sched: &dyn SchedulerOps, channel: WaitChannel, condition: F) -> KernResult<bool>
    where
        F: FnMut() -> bool,
    {
        let cpu = sched.current_cpu();
        let Some(thread) = sched.active_thread(cpu) else {
            return Err(KernError::with_detail(
                ErrorKind::ResourcesMissing,
                "no active thread on this CPU",
            ));
        };

        if !self.register(sched, &thread, channel, condition)? {
            return Ok(false);
        }

        sched.reschedule(cpu);
        // Blocked threads are not picked again, so on real hardware this
        // loop is never entered; it only matters if the switch is delayed.
        while thread.waiting_on() == Some(channel) {
            sched.platform().pause();
        }
        Ok(true)
    }

    /// Register and block `thread` without switching away from it. Used
    /// for threads other than the caller, such as a joining thread.
    pub fn wait_thread(&self, sched: &dyn SchedulerOps, thread: &Arc<Thread>, channel: WaitChannel) -> KernResult<()> {
        self.register(sched, thread, channel, || true).map(|_| ())
    }

    /// `wait_thread` that only registers while `condition` holds.
    pub fn wait_thread_if<F>(
        &self,
        sched: &dyn SchedulerOps,
        thread: &Arc<Thread>,
        channel: WaitChannel,
        condition: F,
    ) -> KernResult<bool>
    where
        F: FnMut() -> bool,
    {
        self.register(sched, thread, channel, condition)
    }

    fn register<F>(
        &self,
        sched: &dyn SchedulerOps,
        thread: &Arc<Thread>,
        channel: WaitChannel,
        mut condition: F,
    ) -> KernResult<bool>
    where
        F: FnMut() -> bool,
    {
        // A thread blocked on its own CPU must not be switched away before it
        // is registered: interrupts stay off from the block to the insert.
        let mut irq = InterruptGuard::new(sched.platform());
        {
            let _channels = self.channels.lock();
            check_registrable(thread)?;
            if !condition() {
                return Ok(false);
            }
        }

        // Only another CPU's mailbox can be full. Wait for it to drain with
        // interrupts on and the directory unlocked.
        loop {
            match sched.block(thread) {
                Ok(()) => break,
                Err(err) if err.is(ErrorKind::MailboxFull) => {
                    drop(irq);
                    sched.platform().pause();
                    irq = InterruptGuard::new(sched.platform());
                }
                Err(err) => return Err(err),
            }
        }

        let mut channels = self.channels.lock();
        // Recheck: a waker may have run between the first check and the block
        let still_waits = check_registrable(thread).map(|()| condition());
        if !matches!(still_waits, Ok(true)) {
            drop(channels);
            drop(irq);
            unblock(sched, thread);
            return still_waits;
        }

        channels.entry(channel).or_default().push_back(thread.clone());
        thread.set_waiting_on(Some(channel));
        drop(channels);
        drop(irq);
        Ok(true)
    }

    /// Wake every thread waiting on `channel`. Returns how many.
    pub fn wakeup(&self, sched: &dyn SchedulerOps, channel: WaitChannel) -> usize {
        let waiters = {
            let _irq = InterruptGuard::new(sched.platform());
            let Some(waiters) = self.channels.lock().remove(&channel) else {
                return 0;
            };
            for thread in &waiters {
                thread.set_waiting_on(None);
            }
            waiters
        };

        let count = waiters.len();
        for thread in &waiters {
            unblock(sched, thread);
        }
        crate::ktrace!("wakeup {:#x}: {} thread(s)", channel.as_raw(), count);
        count
    }

    /// Wake the longest waiting thread on `channel`.
    pub fn wakeup_one(&self, sched: &dyn SchedulerOps, channel: WaitChannel) -> bool {
        let thread = {
            let _irq = InterruptGuard::new(sched.platform());
            let mut channels = self.channels.lock();
            let Some(queue) = channels.get_mut(&channel) else {
                return false;
            };
            let thread = queue.pop_front();
            if queue.is_empty() {
                channels.remove(&channel);
            }
            let Some(thread) = thread else {
                return false;
            };
            thread.set_waiting_on(None);
            thread
        };

        unblock(sched, &thread);
        true
    }

    /// Drop `thread` from whatever channel it waits on, without unblocking
    /// it. Returns whether it was registered.
    pub fn forget(&self, sched: &dyn SchedulerOps, thread: &Thread) -> bool {
        let _irq = InterruptGuard::new(sched.platform());
        let mut channels = self.channels.lock();
        let Some(channel) = thread.waiting_on() else {
            return false;
        };
        thread.set_waiting_on(None);

        let Some(queue) = channels.get_mut(&channel) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|t| !core::ptr::eq(Arc::as_ptr(t), thread));
        let removed = queue.len() != before;
        if queue.is_empty() {
            channels.remove(&channel);
        }
        removed
    }

    /// Threads currently waiting on `channel`
    pub fn waiters(&self, channel: WaitChannel) -> usize {
        self.channels.lock().get(&channel).map_or(0, VecDeque::len)
    }

    /// Channels with at least one waiter
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for WaitDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn check_registrable(thread: &Thread) -> KernResult<()> {
    if thread.waiting_on().is_some() {
        return Err(KernError::with_detail(
            ErrorKind::InvalidArgument,
            "thread already waits on a channel",
        ));
    }
    Ok(())
}

/// Unblock a woken thread, retrying while its CPU's mailbox is full. A
/// thread that was unenrolled meanwhile (its task died) is left alone.
fn unblock(sched: &dyn SchedulerOps, thread: &Arc<Thread>) {
    loop {
        match sched.unblock(thread) {
            Ok(()) => return,
            Err(err) if err.is(ErrorKind::MailboxFull) => sched.platform().pause(),
            Err(err) => {
                crate::kdebug!(
                    "wakeup: thread {}:{} not unblocked: {}",
                    thread.task().pid(),
                    thread.tid(),
                    err
                );
                return;
            }
        }
    }
}
