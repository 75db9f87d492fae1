//! Cross-CPU command mailbox
//!
//! Any CPU may post a command; only the owning CPU drains it, one command
//! at a time, from its mailbox IPI or at the top of a scheduling pass. The
//! mailbox is bounded: once `capacity` commands are pending, `push` hands
//! `MailboxFull` back and the sender retries.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{ErrorKind, KernError, KernResult};
use crate::task::Thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    InsertThread,
    RemoveThread,
    BlockThread,
    UnblockThread,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::InsertThread => "insert",
            CommandKind::RemoveThread => "remove",
            CommandKind::BlockThread => "block",
            CommandKind::UnblockThread => "unblock",
        }
    }
}

/// A request for the CPU hosting `thread`
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub thread: Arc<Thread>,
}

impl Command {
    pub fn new(kind: CommandKind, thread: Arc<Thread>) -> Self {
        Self { kind, thread }
    }
}

pub struct Mailbox {
    pending: Mutex<VecDeque<Command>>,
    capacity: usize,
    /// Pushes refused because the mailbox was full
    rejected: AtomicU64,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            rejected: AtomicU64::new(0),
        }
    }

    /// Queue a command behind everything already pending.
    pub fn push(&self, command: Command) -> KernResult<()> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            drop(pending);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(KernError::new(ErrorKind::MailboxFull));
        }
        pending.push_back(command);
        Ok(())
    }

    /// Oldest pending command. The lock is held only for the pop.
    pub fn pop(&self) -> Option<Command> {
        self.pending.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
