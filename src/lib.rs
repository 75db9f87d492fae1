//! NexaOS SMP scheduler core
//!
//! The scheduling and synchronization heart of the kernel:
//!
//! - `task`: tasks (address space + thread group) and threads
//! - `scheduler`: per-CPU decision engines, the cross-core command mailbox
//!   and the coordinator that routes operations to the owning CPU
//! - `sync`: the channel-keyed wait directory and the spin-then-block mutex
//! - `workqueue`: interrupt-safe per-CPU deferred work
//! - `kernel`: the context value created at boot and threaded through the
//!   interrupt vectors and every subsystem that needs scheduling
//!
//! Everything the scheduler needs from the rest of the kernel (pages,
//! address spaces, IPIs, the per-CPU resume record, CPU topology) is reached
//! through the traits in `platform`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod logger;
pub mod platform;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod workqueue;

pub use config::SchedConfig;
pub use error::{ErrorKind, KernError, KernResult};
pub use kernel::Kernel;
pub use platform::{CpuId, Platform, ResumeRecord, ResumeToken};

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

/// Report an internal consistency violation and stop.
///
/// The message is logged at PANIC level before unwinding into the kernel's
/// panic handler, which halts the machine.
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        let loc = core::panic::Location::caller();
        $crate::klog!(
            $crate::logger::LogLevel::PANIC,
            "------------[ cut here ]------------"
        );
        $crate::logger::log(
            $crate::logger::LogLevel::PANIC,
            format_args!("Kernel panic - not syncing: {}", format_args!($($arg)*)),
        );
        $crate::klog!(
            $crate::logger::LogLevel::PANIC,
            "Call Trace: <panic> at {file}:{line}:{column}",
            file = loc.file(),
            line = loc.line(),
            column = loc.column(),
        );
        panic!("Kernel panic - not syncing: {}", format_args!($($arg)*))
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
