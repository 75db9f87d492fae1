//! Task and thread type definitions

/// Task (process) identifier
pub type Pid = u64;

/// Thread identifier, unique within its task
pub type Tid = u32;

/// Task lifecycle state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, no main thread yet
    Waiting = 0,
    /// Threads are eligible for scheduling
    Running = 1,
    /// Suspended as a whole; threads stay enrolled but are skipped
    Blocked = 2,
    /// Main thread exited or the task was killed; threads are reaped lazily
    Died = 3,
}

impl TaskState {
    pub fn from_atomic(val: u8) -> Self {
        match val {
            0 => TaskState::Waiting,
            1 => TaskState::Running,
            2 => TaskState::Blocked,
            _ => TaskState::Died,
        }
    }
}

/// Privilege ring a task's threads execute in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    Kernel,
    User,
}

/// Coarse scheduling tier. Classes are scanned in declaration order; a
/// lower class only runs when nothing above it is eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    Kernel = 0,
    High = 1,
    Normal = 2,
    Idle = 3,
}

impl PriorityClass {
    pub const COUNT: usize = 4;

    /// Scan order, highest first
    pub const ALL: [PriorityClass; Self::COUNT] = [
        PriorityClass::Kernel,
        PriorityClass::High,
        PriorityClass::Normal,
        PriorityClass::Idle,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PriorityClass::Kernel => "kernel",
            PriorityClass::High => "high",
            PriorityClass::Normal => "normal",
            PriorityClass::Idle => "idle",
        }
    }
}
