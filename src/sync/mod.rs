//! Synchronization primitives built on the scheduler
//!
//! - `waitqueue`: the channel-keyed wait directory
//! - `mutex`: spin-then-block mutex with scheduler/interrupt modes

mod mutex;
mod waitqueue;

pub use mutex::{LockMode, Mutex, MutexGuard};
pub use waitqueue::{WaitChannel, WaitDirectory};
