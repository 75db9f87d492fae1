//! Mock platform for host tests
//!
//! Stands in for the kernel's memory, interrupt and CPU collaborators so the
//! scheduler code runs unchanged on the host.
//!
//! # Simulated CPUs
//!
//! Every std thread plays one CPU. `set_current_cpu` picks which; the
//! interrupt flag is tracked per std thread as well. IPIs are only logged,
//! tests deliver them by calling the scheduler themselves.
//!
//! # Usage
//!
//! ```rust,ignore
//! let vm = mock::boot(2);
//! let t = vm.spawn(PriorityClass::Normal);
//! assert!(Arc::ptr_eq(&vm.tick(0), &t));
//! ```

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use x86_64::{PhysAddr, VirtAddr};

use nexa_sched::platform::{
    AddressSpace, CpuId, CpuOps, FrameSetup, InterruptHandler, InterruptOps, MemoryOps, Platform,
    ResumeRecord, ResumeToken, PAGE_SIZE,
};
use nexa_sched::scheduler::Coordinator;
use nexa_sched::task::{PriorityClass, Ring, Task, Thread};
use nexa_sched::{Kernel, SchedConfig};

/// Entry address the mock hands out for idle threads
pub const IDLE_ENTRY: usize = 0x1d1e_0000;

/// Entry address tests give their own threads
pub const THREAD_ENTRY: usize = 0x4000_0000;

/// Initial token sits this far below the kernel stack top
pub const FRAME_SIZE: usize = 0x100;

const KERNEL_SPACE_ROOT: u64 = 0x1000;

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Make the calling std thread act as `cpu`.
pub fn set_current_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

pub fn current_cpu() -> CpuId {
    CURRENT_CPU.with(Cell::get)
}

/// Interrupt flag of the calling std thread's CPU
pub fn interrupts_enabled() -> bool {
    IRQ_ENABLED.with(Cell::get)
}

// ============================================================================
// MockPlatform
// ============================================================================

pub struct MockPlatform {
    cpus: Vec<CpuId>,
    micros_per_tick: AtomicU64,

    next_phys: AtomicU64,
    next_virt: AtomicU64,
    next_space: AtomicU64,
    /// Page allocations that fail before allocation works again
    fail_allocs: AtomicUsize,
    /// Allocations to let through before `fail_allocs` kicks in
    fail_after: AtomicUsize,
    live_pages: AtomicI64,
    mapped_pages: AtomicI64,
    live_spaces: AtomicI64,

    ipis: Mutex<Vec<(CpuId, u8)>>,
    resume_records: Mutex<HashMap<CpuId, ResumeRecord>>,
    handlers: Mutex<HashMap<u8, Arc<dyn InterruptHandler>>>,
    pauses: AtomicU64,
    irq_disables: AtomicU64,
}

impl MockPlatform {
    pub fn new(cpus: u16) -> Arc<Self> {
        Self::with_cpu_ids((0..cpus).collect())
    }

    /// Platform reporting exactly `ids` as online
    pub fn with_cpu_ids(ids: Vec<CpuId>) -> Arc<Self> {
        Arc::new(Self {
            cpus: ids,
            micros_per_tick: AtomicU64::new(1_000),
            next_phys: AtomicU64::new(0x10_0000),
            next_virt: AtomicU64::new(0xffff_8000_0000_0000),
            next_space: AtomicU64::new(0x20_0000),
            fail_allocs: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(0),
            live_pages: AtomicI64::new(0),
            mapped_pages: AtomicI64::new(0),
            live_spaces: AtomicI64::new(0),
            ipis: Mutex::new(Vec::new()),
            resume_records: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            pauses: AtomicU64::new(0),
            irq_disables: AtomicU64::new(0),
        })
    }

    pub fn set_micros_per_tick(&self, micros: u64) {
        self.micros_per_tick.store(micros, Ordering::Relaxed);
    }

    /// Fail the next `count` page allocations.
    pub fn fail_next_allocs(&self, count: usize) {
        self.fail_allocs_after(0, count);
    }

    /// Let `ok` page allocations succeed, then fail `count`.
    pub fn fail_allocs_after(&self, ok: usize, count: usize) {
        self.fail_after.store(ok, Ordering::SeqCst);
        self.fail_allocs.store(count, Ordering::SeqCst);
    }

    /// Pages allocated and not freed
    pub fn live_pages(&self) -> i64 {
        self.live_pages.load(Ordering::SeqCst)
    }

    pub fn mapped_pages(&self) -> i64 {
        self.mapped_pages.load(Ordering::SeqCst)
    }

    /// User address spaces created and not destroyed
    pub fn live_spaces(&self) -> i64 {
        self.live_spaces.load(Ordering::SeqCst)
    }

    pub fn ipis_to(&self, cpu: CpuId, vector: u8) -> usize {
        self.ipis
            .lock()
            .unwrap()
            .iter()
            .filter(|&&(target, v)| target == cpu && v == vector)
            .count()
    }

    pub fn ipi_count(&self) -> usize {
        self.ipis.lock().unwrap().len()
    }

    pub fn clear_ipis(&self) {
        self.ipis.lock().unwrap().clear();
    }

    pub fn resume_record(&self, cpu: CpuId) -> Option<ResumeRecord> {
        self.resume_records.lock().unwrap().get(&cpu).copied()
    }

    pub fn has_handler(&self, vector: u8) -> bool {
        self.handlers.lock().unwrap().contains_key(&vector)
    }

    /// Raise `vector` on `cpu` as if the interrupt layer took it.
    pub fn raise(&self, vector: u8, cpu: CpuId, token: ResumeToken) -> Option<ResumeToken> {
        let handler = self.handlers.lock().unwrap().get(&vector).cloned()?;
        Some(handler.handle_interrupt(vector, cpu, token))
    }

    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Calls to `disable_interrupts` on any CPU
    pub fn interrupt_disables(&self) -> u64 {
        self.irq_disables.load(Ordering::Relaxed)
    }

    fn take_failure(&self) -> bool {
        if self
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.fail_allocs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl MemoryOps for MockPlatform {
    fn alloc_pages(&self, count: usize) -> Option<PhysAddr> {
        if self.take_failure() {
            return None;
        }
        let base = self
            .next_phys
            .fetch_add((count * PAGE_SIZE) as u64, Ordering::SeqCst);
        self.live_pages.fetch_add(count as i64, Ordering::SeqCst);
        Some(PhysAddr::new(base))
    }

    fn free_pages(&self, _base: PhysAddr, count: usize) {
        self.live_pages.fetch_sub(count as i64, Ordering::SeqCst);
    }

    fn map_pages(&self, _space: AddressSpace, _phys: PhysAddr, count: usize) -> Option<VirtAddr> {
        // One guard page between mappings
        let base = self
            .next_virt
            .fetch_add(((count + 1) * PAGE_SIZE) as u64, Ordering::SeqCst);
        self.mapped_pages.fetch_add(count as i64, Ordering::SeqCst);
        Some(VirtAddr::new(base))
    }

    fn unmap_pages(&self, _space: AddressSpace, _virt: VirtAddr, count: usize) {
        self.mapped_pages.fetch_sub(count as i64, Ordering::SeqCst);
    }

    fn create_address_space(&self) -> Option<AddressSpace> {
        let root = self.next_space.fetch_add(PAGE_SIZE as u64, Ordering::SeqCst);
        self.live_spaces.fetch_add(1, Ordering::SeqCst);
        Some(AddressSpace::new(PhysAddr::new(root)))
    }

    fn destroy_address_space(&self, _space: AddressSpace) {
        self.live_spaces.fetch_sub(1, Ordering::SeqCst);
    }

    fn kernel_address_space(&self) -> AddressSpace {
        AddressSpace::new(PhysAddr::new(KERNEL_SPACE_ROOT))
    }
}

impl InterruptOps for MockPlatform {
    fn register_handler(&self, vector: u8, handler: Arc<dyn InterruptHandler>) {
        self.handlers.lock().unwrap().insert(vector, handler);
    }

    fn send_ipi(&self, target: CpuId, vector: u8) {
        self.ipis.lock().unwrap().push((target, vector));
    }

    fn write_resume_record(&self, cpu: CpuId, record: ResumeRecord) {
        self.resume_records.lock().unwrap().insert(cpu, record);
    }

    fn disable_interrupts(&self) -> bool {
        self.irq_disables.fetch_add(1, Ordering::Relaxed);
        IRQ_ENABLED.with(|f| f.replace(false))
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        IRQ_ENABLED.with(|f| f.set(was_enabled));
    }

    fn build_initial_frame(&self, setup: &FrameSetup<'_>) -> ResumeToken {
        setup.kernel_stack.top().as_u64() as usize - FRAME_SIZE
    }

    fn micros_per_tick(&self) -> u64 {
        self.micros_per_tick.load(Ordering::Relaxed)
    }
}

impl CpuOps for MockPlatform {
    fn cpu_ids(&self) -> Vec<CpuId> {
        self.cpus.clone()
    }

    fn current_cpu(&self) -> CpuId {
        current_cpu()
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
        nexa_sched::arch::cpu_relax();
    }

    fn halt(&self) {
        std::thread::yield_now();
    }

    fn idle_entry(&self) -> usize {
        IDLE_ENTRY
    }
}

// ============================================================================
// Booted machine
// ============================================================================

/// A kernel context over a `Coordinator`, every CPU activated
pub struct Machine {
    pub platform: Arc<MockPlatform>,
    pub coordinator: Arc<Coordinator>,
    pub kernel: Arc<Kernel>,
}

pub fn boot(cpus: u16) -> Machine {
    boot_with(cpus, SchedConfig::default())
}

pub fn boot_with(cpus: u16, config: SchedConfig) -> Machine {
    let machine = build(MockPlatform::new(cpus), config);
    machine
        .kernel
        .activate_all_cores()
        .expect("activating cores");
    machine
}

/// Kernel context without activating any CPU
pub fn build(platform: Arc<MockPlatform>, config: SchedConfig) -> Machine {
    let dyn_platform: Arc<dyn Platform> = platform.clone();
    let coordinator = Arc::new(Coordinator::new(dyn_platform.clone(), config));
    let kernel = Kernel::with_scheduler(dyn_platform, config, coordinator.clone())
        .expect("kernel context");
    kernel.install_vectors();
    Machine {
        platform,
        coordinator,
        kernel,
    }
}

impl Machine {
    /// New kernel-ring task with one thread of `class`, enrolled on the
    /// calling CPU.
    pub fn spawn(&self, class: PriorityClass) -> Arc<Thread> {
        let task = self.task("worker", Ring::Kernel);
        self.attach(&task, class)
    }

    pub fn task(&self, name: &str, ring: Ring) -> Arc<Task> {
        self.kernel.create_task(name, ring).expect("create task")
    }

    pub fn attach(&self, task: &Arc<Task>, class: PriorityClass) -> Arc<Thread> {
        self.kernel
            .attach_thread(task, THREAD_ENTRY, class, 16, &[])
            .expect("attach thread")
    }

    pub fn active(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.coordinator.core(cpu).and_then(|core| core.active_thread())
    }

    pub fn idle(&self, cpu: CpuId) -> Arc<Thread> {
        self.coordinator
            .core(cpu)
            .and_then(|core| core.idle_thread())
            .expect("activated CPU has an idle thread")
    }

    /// One timer tick on `cpu`, interrupting whatever runs there. Returns
    /// the thread the CPU resumes.
    pub fn tick(&self, cpu: CpuId) -> Arc<Thread> {
        let token = self
            .active(cpu)
            .map_or(0xdead_0000, |thread| thread.saved_token());
        let next = self.kernel.schedule_on_core(token, cpu);
        let active = self.active(cpu).expect("active thread after a tick");
        assert_eq!(active.saved_token(), next, "resumed token belongs to the active thread");
        active
    }

    pub fn ticks(&self, cpu: CpuId, count: usize) -> Vec<Arc<Thread>> {
        (0..count).map(|_| self.tick(cpu)).collect()
    }
}
