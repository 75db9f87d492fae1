//! Task and thread model
//!
//! ## Module Organization
//!
//! - `types`: identifiers, task states, rings and priority classes
//! - `process`: the task object (address space, thread group, lifecycle)
//! - `thread`: the schedulable unit and its stacks
//! - `table`: pid lookup

mod process;
mod table;
mod thread;
mod types;

pub use process::{Task, NICE_MAX, NICE_MIN};
pub use table::{TaskTable, KERNEL_PID};
pub use thread::{stack_layout, Thread};
pub use types::{Pid, PriorityClass, Ring, TaskState, Tid};
