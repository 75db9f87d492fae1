//! Kernel result type for the scheduler subsystem
//!
//! Every fallible operation returns a tagged result: a failure kind plus an
//! optional static diagnostic. Resource exhaustion is always handed back to
//! the caller; internal consistency violations never come through here, they
//! go through `kpanic!`.

use core::fmt;

/// Failure kinds reported by scheduler-side operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stack pages or an address space could not be allocated
    NoMemory,
    /// The per-CPU work queue has no free entries left
    WorkQueueExhausted,
    /// The target CPU's command mailbox is full; retry later
    MailboxFull,
    /// Bad argument (unknown tid, thread already waiting, ...)
    InvalidArgument,
    /// The calling context lacks something the operation needs
    /// (no active thread on this CPU, subsystem not activated)
    ResourcesMissing,
    /// The thread is not enrolled in any scheduler
    NotEnrolled,
    /// The CPU id does not map to a scheduler instance
    NoSuchCore,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoMemory => "out of memory",
            ErrorKind::WorkQueueExhausted => "work queue exhausted",
            ErrorKind::MailboxFull => "command mailbox full",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::ResourcesMissing => "resources missing",
            ErrorKind::NotEnrolled => "thread not enrolled",
            ErrorKind::NoSuchCore => "no such core",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernError {
    pub kind: ErrorKind,
    pub detail: Option<&'static str>,
}

impl KernError {
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub const fn with_detail(kind: ErrorKind, detail: &'static str) -> Self {
        Self {
            kind,
            detail: Some(detail),
        }
    }

    #[inline]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<ErrorKind> for KernError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for KernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind.as_str(), detail),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

pub type KernResult<T> = Result<T, KernError>;
