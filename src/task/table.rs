//! Task table: pid -> task

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::KernResult;
use crate::platform::Platform;

use super::process::Task;
use super::types::{Pid, Ring};

/// Pid of the kernel task created at boot
pub const KERNEL_PID: Pid = 0;

pub struct TaskTable {
    tasks: Mutex<BTreeMap<Pid, Arc<Task>>>,
    next_pid: AtomicU64,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            next_pid: AtomicU64::new(KERNEL_PID + 1),
        }
    }

    /// Create the kernel task. Its threads share the kernel address space
    /// and it is Running from the start.
    pub(crate) fn create_kernel_task(&self, platform: Arc<dyn Platform>) -> KernResult<Arc<Task>> {
        let task = Task::new(platform, KERNEL_PID, "kernel_task", Ring::Kernel)?;
        task.start();
        self.tasks.lock().insert(KERNEL_PID, task.clone());
        Ok(task)
    }

    pub fn create(&self, platform: Arc<dyn Platform>, name: &str, ring: Ring) -> KernResult<Arc<Task>> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(platform, pid, name, ring)?;
        self.tasks.lock().insert(pid, task.clone());
        crate::kdebug!("task {} ({}) created", pid, name);
        Ok(task)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }

    pub(crate) fn remove(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().remove(&pid)
    }

    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
