//! Threads: the schedulable unit
//!
//! A thread owns its stacks, its saved resume token and a handful of flags
//! shared between the scheduler, the wait directory and the reaper. The
//! thread itself never decides anything; whoever holds the relevant lock
//! flips the flags.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::config::{
    KERNEL_STACK_PAGES_MAX, KERNEL_STACK_PAGES_MIN, USER_KERNEL_STACK_PAGES, USER_STACK_PAGES_MAX,
    USER_STACK_PAGES_MIN,
};
use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::{AddressSpace, CpuId, FrameSetup, Platform, ResumeToken, StackRegion};
use crate::scheduler::SchedHandle;
use crate::sync::WaitChannel;

use super::process::Task;
use super::types::{PriorityClass, Ring, Tid};

/// Marker for "not on any CPU" in the `u32` CPU slots
const NO_CPU: u32 = u32::MAX;

/// Pages a new thread gets for its stacks, from the requested count.
///
/// Kernel-ring threads get one kernel stack clamped to 12..=32 pages.
/// User-ring threads get a user stack clamped to 24..=64 pages plus a
/// single-page kernel stack for trap frames.
pub fn stack_layout(ring: Ring, requested: usize) -> (usize, Option<usize>) {
    match ring {
        Ring::Kernel => (
            requested.clamp(KERNEL_STACK_PAGES_MIN, KERNEL_STACK_PAGES_MAX),
            None,
        ),
        Ring::User => (
            USER_KERNEL_STACK_PAGES,
            Some(requested.clamp(USER_STACK_PAGES_MIN, USER_STACK_PAGES_MAX)),
        ),
    }
}

/// Backing object for a thread's join channel. Never read; only its address
/// matters.
struct JoinToken {
    _anchor: u8,
}

pub struct Thread {
    tid: Tid,
    task: Arc<Task>,
    entry: usize,
    args: Vec<usize>,
    class: PriorityClass,
    kernel_stack: StackRegion,
    user_stack: Option<StackRegion>,
    /// Where the thread resumes; rewritten on every preemption
    saved_token: AtomicUsize,
    join_token: JoinToken,
    /// Packed arena handle on the hosting CPU, 0 while not enrolled.
    /// Read from interrupt context, so never behind a lock.
    sched: AtomicU64,
    /// CPU requested by `add_thread_to`
    pinned: AtomicU32,
    /// CPU currently executing the thread
    running_on: AtomicU32,
    /// Raw channel key while registered in the wait directory, 0 otherwise
    waiting_on: AtomicUsize,
    exited: AtomicBool,
    stacks_released: AtomicBool,
}

impl Thread {
    /// Allocate and map the stacks, then lay out the first trap frame.
    /// Nothing is enrolled anywhere yet; on error every page taken so far
    /// has been given back.
    pub(crate) fn create(
        task: &Arc<Task>,
        tid: Tid,
        entry: usize,
        class: PriorityClass,
        stack_pages: usize,
        args: &[usize],
    ) -> KernResult<Arc<Thread>> {
        let platform = task.platform();
        let space = task.address_space();
        let (kernel_pages, user_pages) = stack_layout(task.ring(), stack_pages);

        // Kernel stacks always live in the kernel's address space.
        let kernel_space = platform.kernel_address_space();
        let kernel_stack = alloc_stack(platform, kernel_space, kernel_pages)?;
        let user_stack = match user_pages {
            Some(pages) => match alloc_stack(platform, space, pages) {
                Ok(region) => Some(region),
                Err(err) => {
                    free_stack(platform, kernel_space, kernel_stack);
                    return Err(err);
                }
            },
            None => None,
        };

        let token = platform.build_initial_frame(&FrameSetup {
            entry,
            args,
            kernel_stack,
            user_stack,
        });

        crate::ktrace!(
            "thread {}:{} created, entry {:#x}, {} kernel pages, class {}",
            task.pid(),
            tid,
            entry,
            kernel_stack.pages,
            class.as_str()
        );

        Ok(Arc::new(Thread {
            tid,
            task: task.clone(),
            entry,
            args: args.to_vec(),
            class,
            kernel_stack,
            user_stack,
            saved_token: AtomicUsize::new(token),
            join_token: JoinToken { _anchor: 0 },
            sched: AtomicU64::new(0),
            pinned: AtomicU32::new(NO_CPU),
            running_on: AtomicU32::new(NO_CPU),
            waiting_on: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
            stacks_released: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn args(&self) -> &[usize] {
        &self.args
    }

    #[inline]
    pub fn class(&self) -> PriorityClass {
        self.class
    }

    pub fn kernel_stack(&self) -> StackRegion {
        self.kernel_stack
    }

    pub fn user_stack(&self) -> Option<StackRegion> {
        self.user_stack
    }

    #[inline]
    pub fn saved_token(&self) -> ResumeToken {
        self.saved_token.load(Ordering::Acquire)
    }

    #[inline]
    pub fn save_token(&self, token: ResumeToken) {
        self.saved_token.store(token, Ordering::Release);
    }

    /// Channel signalled when this thread exits
    pub fn join_channel(&self) -> WaitChannel {
        WaitChannel::of(&self.join_token)
    }

    pub fn sched_handle(&self) -> Option<SchedHandle> {
        SchedHandle::from_raw(self.sched.load(Ordering::Acquire))
    }

    /// Only called by the hosting CPU's scheduler with its state locked.
    pub(crate) fn set_sched_handle(&self, handle: Option<SchedHandle>) {
        let raw = handle.map_or(0, SchedHandle::into_raw);
        self.sched.store(raw, Ordering::Release);
    }

    pub fn is_enrolled(&self) -> bool {
        self.sched_handle().is_some()
    }

    pub fn pinned_cpu(&self) -> Option<CpuId> {
        cpu_from_raw(self.pinned.load(Ordering::Acquire))
    }

    pub(crate) fn pin_to(&self, cpu: CpuId) {
        self.pinned.store(cpu as u32, Ordering::Release);
    }

    /// CPU currently executing this thread
    pub fn running_on(&self) -> Option<CpuId> {
        cpu_from_raw(self.running_on.load(Ordering::Acquire))
    }

    pub(crate) fn set_running_on(&self, cpu: Option<CpuId>) {
        let raw = cpu.map_or(NO_CPU, |c| c as u32);
        self.running_on.store(raw, Ordering::Release);
    }

    /// Channel this thread is registered on, if any
    pub fn waiting_on(&self) -> Option<WaitChannel> {
        WaitChannel::from_raw(self.waiting_on.load(Ordering::Acquire))
    }

    /// Only called with the wait directory lock held.
    pub(crate) fn set_waiting_on(&self, channel: Option<WaitChannel>) {
        let raw = channel.map_or(0, |c| c.as_raw());
        self.waiting_on.store(raw, Ordering::Release);
    }

    #[inline]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub fn stacks_released(&self) -> bool {
        self.stacks_released.load(Ordering::Acquire)
    }

    /// Give the stacks back to the memory collaborator. Idempotent.
    ///
    /// Releasing the stack a CPU is executing on is unrecoverable.
    pub(crate) fn release_stacks(&self) {
        if let Some(cpu) = self.running_on() {
            crate::kpanic!(
                "releasing stacks of thread {}:{} while it runs on CPU {}",
                self.task.pid(),
                self.tid,
                cpu
            );
        }
        if self.stacks_released.swap(true, Ordering::AcqRel) {
            return;
        }

        let platform = self.task.platform();
        if let Some(stack) = self.user_stack {
            free_stack(platform, self.task.address_space(), stack);
        }
        free_stack(platform, platform.kernel_address_space(), self.kernel_stack);
        crate::ktrace!("thread {}:{} stacks released", self.task.pid(), self.tid);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("pid", &self.task.pid())
            .field("tid", &self.tid)
            .field("class", &self.class)
            .field("running_on", &self.running_on())
            .field("exited", &self.has_exited())
            .finish()
    }
}

fn cpu_from_raw(raw: u32) -> Option<CpuId> {
    if raw == NO_CPU {
        None
    } else {
        Some(raw as CpuId)
    }
}

fn alloc_stack(platform: &dyn Platform, space: AddressSpace, pages: usize) -> KernResult<StackRegion> {
    let Some(phys) = platform.alloc_pages(pages) else {
        crate::kwarn!("thread stack: no memory for {} pages", pages);
        return Err(KernError::with_detail(ErrorKind::NoMemory, "stack pages"));
    };
    match platform.map_pages(space, phys, pages) {
        Some(base) => Ok(StackRegion { phys, base, pages }),
        None => {
            platform.free_pages(phys, pages);
            crate::kwarn!("thread stack: mapping {} pages failed", pages);
            Err(KernError::with_detail(ErrorKind::NoMemory, "stack mapping"))
        }
    }
}

fn free_stack(platform: &dyn Platform, space: AddressSpace, stack: StackRegion) {
    platform.unmap_pages(space, stack.base, stack.pages);
    platform.free_pages(stack.phys, stack.pages);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_stack_clamp() {
        assert_eq!(stack_layout(Ring::Kernel, 0), (12, None));
        assert_eq!(stack_layout(Ring::Kernel, 16), (16, None));
        assert_eq!(stack_layout(Ring::Kernel, 100), (32, None));
    }

    #[test]
    fn test_user_stack_clamp() {
        assert_eq!(stack_layout(Ring::User, 1), (1, Some(24)));
        assert_eq!(stack_layout(Ring::User, 40), (1, Some(40)));
        assert_eq!(stack_layout(Ring::User, 1000), (1, Some(64)));
    }
}
