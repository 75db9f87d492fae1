//! Collaborator interfaces
//!
//! The scheduler does not touch page tables, the LAPIC or the trap frame
//! layout itself. The kernel hands it a `Platform` at boot; host tests hand
//! it a mock.
//!
//! ## Collaborators
//!
//! - `MemoryOps`: physical pages, mappings and address spaces
//! - `InterruptOps`: vector registration, IPIs, the per-CPU resume record,
//!   the interrupt flag and the initial trap frame of a new thread
//! - `CpuOps`: topology (which CPUs exist, which one is executing) and
//!   pause/halt hints

use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::{PhysAddr, VirtAddr};

/// Logical CPU index (0 = BSP)
pub type CpuId = u16;

/// Opaque value the interrupt layer hands in on entry and resumes from on
/// exit. On x86_64 this is the saved kernel stack pointer.
pub type ResumeToken = usize;

/// Local timer vector
pub const TIMER_VECTOR: u8 = 0x20;

/// IPI vector for reschedule requests
pub const IPI_RESCHEDULE: u8 = 0xF0;

/// IPI vector telling a CPU to drain its command mailbox
pub const IPI_MAILBOX: u8 = 0xF2;

/// Size of one page handed out by the memory collaborator
pub const PAGE_SIZE: usize = 4096;

/// Handle of an address space (physical address of its top-level table)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    pub root: PhysAddr,
}

impl AddressSpace {
    pub const fn new(root: PhysAddr) -> Self {
        Self { root }
    }
}

/// Per-CPU scratch structure consulted on return from interrupt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeRecord {
    /// Address space to activate before resuming
    pub address_space: AddressSpace,
    /// Kernel stack top to install for the next ring transition
    pub kernel_stack_top: VirtAddr,
}

/// A mapped stack: `pages` pages of physical memory at `phys`, visible at
/// `base` in the owning task's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackRegion {
    pub phys: PhysAddr,
    pub base: VirtAddr,
    pub pages: usize,
}

impl StackRegion {
    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// One past the highest usable byte; stacks grow down from here.
    pub fn top(&self) -> VirtAddr {
        self.base + self.size() as u64
    }
}

/// Everything the interrupt layer needs to lay out the first trap frame of
/// a new thread.
#[derive(Clone, Copy, Debug)]
pub struct FrameSetup<'a> {
    pub entry: usize,
    pub args: &'a [usize],
    pub kernel_stack: StackRegion,
    /// Present for user-ring threads
    pub user_stack: Option<StackRegion>,
}

pub trait MemoryOps {
    fn alloc_pages(&self, count: usize) -> Option<PhysAddr>;
    fn free_pages(&self, base: PhysAddr, count: usize);
    fn map_pages(&self, space: AddressSpace, phys: PhysAddr, count: usize) -> Option<VirtAddr>;
    fn unmap_pages(&self, space: AddressSpace, virt: VirtAddr, count: usize);
    fn create_address_space(&self) -> Option<AddressSpace>;
    fn destroy_address_space(&self, space: AddressSpace);
    fn kernel_address_space(&self) -> AddressSpace;
}

/// Entry point the interrupt layer calls for a registered vector.
///
/// Returns the token to resume from, which may belong to another thread.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, vector: u8, cpu: CpuId, token: ResumeToken) -> ResumeToken;
}

pub trait InterruptOps {
    fn register_handler(&self, vector: u8, handler: Arc<dyn InterruptHandler>);
    fn send_ipi(&self, target: CpuId, vector: u8);
    fn write_resume_record(&self, cpu: CpuId, record: ResumeRecord);
    /// Disable interrupts on the executing CPU, returning whether they were
    /// enabled before.
    fn disable_interrupts(&self) -> bool;
    fn restore_interrupts(&self, was_enabled: bool);
    fn build_initial_frame(&self, setup: &FrameSetup<'_>) -> ResumeToken;
    fn micros_per_tick(&self) -> u64;
}

pub trait CpuOps {
    /// Ids of every CPU that is online and will run a scheduler
    fn cpu_ids(&self) -> Vec<CpuId>;
    fn current_cpu(&self) -> CpuId;
    fn pause(&self);
    fn halt(&self);
    /// Entry point of the permanent per-CPU idle thread
    fn idle_entry(&self) -> usize;
}

pub trait Platform: MemoryOps + InterruptOps + CpuOps + Send + Sync {}

impl<T: MemoryOps + InterruptOps + CpuOps + Send + Sync> Platform for T {}

/// Interrupts stay disabled on the executing CPU while this is alive.
pub struct InterruptGuard<'a> {
    platform: &'a dyn Platform,
    was_enabled: bool,
}

impl<'a> InterruptGuard<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        let was_enabled = platform.disable_interrupts();
        Self {
            platform,
            was_enabled,
        }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.was_enabled);
    }
}
