//! Per-CPU deferred work queue
//!
//! Interrupt handlers push `(callback, context)` entries; the CPU's deferred
//! work runner later detaches the whole list and runs it outside interrupt
//! context. Entries come from a preallocated free list, so pushing never
//! allocates and may fail with `WorkQueueExhausted`. The pool only grows in
//! `pop_all`, which must not be called from interrupt context.
//!
//! The plain methods are for the owning CPU and are called with interrupts
//! disabled there. The `_remote` variants are for other CPUs draining or
//! replenishing this queue.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{ErrorKind, KernError, KernResult};
use crate::platform::CpuId;

pub type WorkCallback = fn(usize);

struct Node {
    callback: WorkCallback,
    context: usize,
    next: Option<Box<Node>>,
}

fn noop(_: usize) {}

/// Singly linked chain of nodes
struct Chain {
    head: Option<Box<Node>>,
    len: usize,
}

impl Chain {
    const fn empty() -> Self {
        Self { head: None, len: 0 }
    }

    fn with_capacity(count: usize) -> Self {
        let mut chain = Self::empty();
        for _ in 0..count {
            chain.push(Box::new(Node {
                callback: noop,
                context: 0,
                next: None,
            }));
        }
        chain
    }

    fn push(&mut self, mut node: Box<Node>) {
        node.next = self.head.take();
        self.head = Some(node);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Box<Node>> {
        let mut node = self.head.take()?;
        self.head = node.next.take();
        self.len -= 1;
        Some(node)
    }

    /// Move every node of `other` onto this chain.
    fn absorb(&mut self, mut other: Chain) {
        while let Some(node) = other.pop() {
            self.push(node);
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // Iterative, a long chain would overflow the stack recursively.
        let mut cursor = self.head.take();
        while let Some(mut node) = cursor {
            cursor = node.next.take();
        }
    }
}

/// One deferred call
#[derive(Debug, Clone, Copy)]
pub struct WorkEntry {
    pub callback: WorkCallback,
    pub context: usize,
}

impl WorkEntry {
    pub fn run(&self) {
        (self.callback)(self.context)
    }
}

/// Work detached by `pop_all`, newest entry first. Hand it back with
/// `refurbish_list` once processed.
pub struct WorkList {
    chain: Chain,
}

impl WorkList {
    #[inline]
    pub fn len(&self) -> usize {
        self.chain.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chain.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = WorkEntry> + '_ {
        let mut cursor = self.chain.head.as_deref();
        core::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.next.as_deref();
            Some(WorkEntry {
                callback: node.callback,
                context: node.context,
            })
        })
    }

    /// Run every entry, newest first. Returns how many ran.
    pub fn run(&self) -> usize {
        let mut count = 0;
        for entry in self.iter() {
            entry.run();
            count += 1;
        }
        count
    }
}

struct Lists {
    free: Chain,
    work: Chain,
    exhausted: bool,
}

pub struct WorkQueue {
    cpu: CpuId,
    lists: Mutex<Lists>,
    growth: usize,
    capacity: AtomicU64,
    rejected: AtomicU64,
}

impl WorkQueue {
    pub fn new(cpu: CpuId, initial: usize, growth: usize) -> Self {
        Self {
            cpu,
            lists: Mutex::new(Lists {
                free: Chain::with_capacity(initial),
                work: Chain::empty(),
                exhausted: false,
            }),
            growth,
            capacity: AtomicU64::new(initial as u64),
            rejected: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Queue a call. Never allocates; with no free entry left the work list
    /// stays untouched and the queue remembers to grow on the next drain.
    pub fn push_entry(&self, callback: WorkCallback, context: usize) -> KernResult<()> {
        let mut lists = self.lists.lock();
        let Some(mut node) = lists.free.pop() else {
            lists.exhausted = true;
            drop(lists);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(KernError::new(ErrorKind::WorkQueueExhausted));
        };
        node.callback = callback;
        node.context = context;
        lists.work.push(node);
        Ok(())
    }

    /// Detach all queued work, growing the free list first if a push failed
    /// since the last drain. Not for interrupt context.
    pub fn pop_all(&self) -> WorkList {
        let mut lists = self.lists.lock();
        let work = core::mem::replace(&mut lists.work, Chain::empty());
        if lists.exhausted {
            lists.exhausted = false;
            lists.free.absorb(Chain::with_capacity(self.growth));
            self.capacity
                .fetch_add(self.growth as u64, Ordering::Relaxed);
            crate::kdebug!(
                "CPU {}: work queue grown by {} entries",
                self.cpu,
                self.growth
            );
        }
        WorkList { chain: work }
    }

    /// Detach all queued work of another CPU's queue. Does not grow the
    /// pool; the owner does that on its next local drain.
    pub fn pop_all_remote(&self) -> WorkList {
        let mut lists = self.lists.lock();
        let work = core::mem::replace(&mut lists.work, Chain::empty());
        WorkList { chain: work }
    }

    /// Return processed entries to the free list.
    pub fn refurbish_list(&self, list: WorkList) {
        self.lists.lock().free.absorb(list.chain);
    }

    pub fn refurbish_list_remote(&self, list: WorkList) {
        let mut lists = self.lists.lock();
        lists.free.absorb(list.chain);
    }

    /// Entries queued and not yet detached
    pub fn pending(&self) -> usize {
        self.lists.lock().work.len
    }

    /// Entries available to `push_entry`
    pub fn free(&self) -> usize {
        self.lists.lock().free.len
    }

    /// Entries ever allocated
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) as usize
    }

    pub fn is_exhausted(&self) -> bool {
        self.lists.lock().exhausted
    }

    /// Pushes refused for lack of entries
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
