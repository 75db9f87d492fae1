//! Per-class run queues
//!
//! One doubly linked list per priority class, threaded through the `link`
//! field of the arena entries. Insertion, removal and rotation are O(1);
//! nothing here allocates, so it is safe to touch from the timer path.

use crate::task::PriorityClass;

use super::arena::{SchedArena, SchedHandle};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassQueue {
    head: Option<SchedHandle>,
    tail: Option<SchedHandle>,
    len: usize,
}

impl ClassQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn head(&self) -> Option<SchedHandle> {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, arena: &mut SchedArena, handle: SchedHandle) {
        let old_tail = self.tail;
        let Some(data) = arena.get_mut(handle) else {
            return;
        };
        data.link.prev = old_tail;
        data.link.next = None;

        match old_tail.and_then(|t| arena.get_mut(t)) {
            Some(tail) => tail.link.next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
    }

    /// Unlink `handle`. Stale handles and entries heading no list are
    /// ignored; otherwise the caller guarantees it is on this queue.
    pub fn unlink(&mut self, arena: &mut SchedArena, handle: SchedHandle) {
        let Some(data) = arena.get_mut(handle) else {
            return;
        };
        if data.link.prev.is_none() && self.head != Some(handle) {
            return;
        }
        let link = core::mem::take(&mut data.link);

        match link.prev.and_then(|p| arena.get_mut(p)) {
            Some(prev) => prev.link.next = link.next,
            None => self.head = link.next,
        }
        match link.next.and_then(|n| arena.get_mut(n)) {
            Some(next) => next.link.prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len = self.len.saturating_sub(1);
    }

    /// Move `handle` behind every other entry of its class.
    pub fn rotate_to_back(&mut self, arena: &mut SchedArena, handle: SchedHandle) {
        if self.tail == Some(handle) {
            return;
        }
        self.unlink(arena, handle);
        self.push_back(arena, handle);
    }
}

/// Class queues of one CPU, indexed by `PriorityClass::index`
pub struct RunQueues {
    classes: [ClassQueue; PriorityClass::COUNT],
}

impl RunQueues {
    pub const fn new() -> Self {
        Self {
            classes: [ClassQueue::new(); PriorityClass::COUNT],
        }
    }

    #[inline]
    pub fn class(&self, class: PriorityClass) -> &ClassQueue {
        &self.classes[class.index()]
    }

    #[inline]
    pub fn class_mut(&mut self, class: PriorityClass) -> &mut ClassQueue {
        &mut self.classes[class.index()]
    }

    pub fn total(&self) -> usize {
        self.classes.iter().map(ClassQueue::len).sum()
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use x86_64::{PhysAddr, VirtAddr};

    use crate::platform::{
        AddressSpace, CpuId, CpuOps, FrameSetup, InterruptHandler, InterruptOps, MemoryOps,
        Platform, ResumeRecord, ResumeToken,
    };
    use crate::scheduler::types::Link;
    use crate::scheduler::SchedulingData;
    use crate::task::{Ring, Task};

    /// Hands out the same pages every time; only thread creation needs it
    struct NullPlatform;

    impl MemoryOps for NullPlatform {
        fn alloc_pages(&self, _count: usize) -> Option<PhysAddr> {
            Some(PhysAddr::new(0x10_0000))
        }
        fn free_pages(&self, _base: PhysAddr, _count: usize) {}
        fn map_pages(&self, _space: AddressSpace, _phys: PhysAddr, _count: usize) -> Option<VirtAddr> {
            Some(VirtAddr::new(0xffff_8000_0000_0000))
        }
        fn unmap_pages(&self, _space: AddressSpace, _virt: VirtAddr, _count: usize) {}
        fn create_address_space(&self) -> Option<AddressSpace> {
            None
        }
        fn destroy_address_space(&self, _space: AddressSpace) {}
        fn kernel_address_space(&self) -> AddressSpace {
            AddressSpace::new(PhysAddr::new(0x1000))
        }
    }

    impl InterruptOps for NullPlatform {
        fn register_handler(&self, _vector: u8, _handler: Arc<dyn InterruptHandler>) {}
        fn send_ipi(&self, _target: CpuId, _vector: u8) {}
        fn write_resume_record(&self, _cpu: CpuId, _record: ResumeRecord) {}
        fn disable_interrupts(&self) -> bool {
            false
        }
        fn restore_interrupts(&self, _was_enabled: bool) {}
        fn build_initial_frame(&self, _setup: &FrameSetup<'_>) -> ResumeToken {
            0
        }
        fn micros_per_tick(&self) -> u64 {
            1_000
        }
    }

    impl CpuOps for NullPlatform {
        fn cpu_ids(&self) -> Vec<CpuId> {
            alloc::vec![0]
        }
        fn current_cpu(&self) -> CpuId {
            0
        }
        fn pause(&self) {}
        fn halt(&self) {}
        fn idle_entry(&self) -> usize {
            0
        }
    }

    /// Arena holding `count` entries, none of them queued yet
    fn entries(count: usize) -> (SchedArena, Vec<SchedHandle>) {
        let platform: Arc<dyn Platform> = Arc::new(NullPlatform);
        let task = Task::new(platform, 1, "runqueue", Ring::Kernel).unwrap();
        let mut arena = SchedArena::new(0);
        let handles = (0..count)
            .map(|_| {
                let thread = task.spawn_idle_thread(0).unwrap();
                arena.insert(SchedulingData::new(thread, 0))
            })
            .collect();
        (arena, handles)
    }

    fn queued(handles: &[SchedHandle], arena: &mut SchedArena) -> ClassQueue {
        let mut queue = ClassQueue::new();
        for &handle in handles {
            queue.push_back(arena, handle);
        }
        queue
    }

    /// Walk the queue front to back, checking both link directions.
    fn order(queue: &ClassQueue, arena: &SchedArena) -> Vec<SchedHandle> {
        let mut seen: Vec<SchedHandle> = Vec::new();
        let mut cursor = queue.head();
        while let Some(handle) = cursor {
            let link = arena.get(handle).unwrap().link;
            assert_eq!(link.prev, seen.last().copied());
            seen.push(handle);
            cursor = link.next;
        }
        assert_eq!(seen.len(), queue.len());
        assert_eq!(queue.tail, seen.last().copied());
        seen
    }

    // =========================================================================
    // Unlink
    // =========================================================================

    #[test]
    fn test_unlink_head() {
        let (mut arena, h) = entries(3);
        let mut queue = queued(&h, &mut arena);
        queue.unlink(&mut arena, h[0]);
        assert_eq!(order(&queue, &arena), [h[1], h[2]]);
        assert_eq!(arena.get(h[0]).unwrap().link, Link::default());
    }

    #[test]
    fn test_unlink_tail() {
        let (mut arena, h) = entries(3);
        let mut queue = queued(&h, &mut arena);
        queue.unlink(&mut arena, h[2]);
        assert_eq!(order(&queue, &arena), [h[0], h[1]]);

        queue.push_back(&mut arena, h[2]);
        assert_eq!(order(&queue, &arena), [h[0], h[1], h[2]]);
    }

    #[test]
    fn test_unlink_middle() {
        let (mut arena, h) = entries(3);
        let mut queue = queued(&h, &mut arena);
        queue.unlink(&mut arena, h[1]);
        assert_eq!(order(&queue, &arena), [h[0], h[2]]);
    }

    #[test]
    fn test_unlink_only_entry() {
        let (mut arena, h) = entries(1);
        let mut queue = queued(&h, &mut arena);
        queue.unlink(&mut arena, h[0]);
        assert!(queue.is_empty());
        assert_eq!(queue.head(), None);
        assert_eq!(queue.tail, None);

        queue.push_back(&mut arena, h[0]);
        assert_eq!(order(&queue, &arena), [h[0]]);
    }

    #[test]
    fn test_unlink_stale_handle_is_ignored() {
        let (mut arena, h) = entries(3);
        let mut queue = queued(&h, &mut arena);
        queue.unlink(&mut arena, h[1]);
        arena.remove(h[1]).unwrap();

        queue.unlink(&mut arena, h[1]);
        assert_eq!(order(&queue, &arena), [h[0], h[2]]);
    }

    #[test]
    fn test_unlink_twice_is_ignored() {
        let (mut arena, h) = entries(3);
        let mut queue = queued(&h, &mut arena);
        queue.unlink(&mut arena, h[0]);
        queue.unlink(&mut arena, h[0]);
        assert_eq!(order(&queue, &arena), [h[1], h[2]]);
    }

    // =========================================================================
    // Rotation
    // =========================================================================

    #[test]
    fn test_rotate_head_to_back() {
        let (mut arena, h) = entries(3);
        let mut queue = queued(&h, &mut arena);
        queue.rotate_to_back(&mut arena, h[0]);
        assert_eq!(order(&queue, &arena), [h[1], h[2], h[0]]);
        queue.rotate_to_back(&mut arena, h[2]);
        assert_eq!(order(&queue, &arena), [h[1], h[0], h[2]]);
    }

    #[test]
    fn test_rotate_single_entry() {
        let (mut arena, h) = entries(1);
        let mut queue = queued(&h, &mut arena);
        queue.rotate_to_back(&mut arena, h[0]);
        assert_eq!(order(&queue, &arena), [h[0]]);
    }

    #[test]
    fn test_run_queues_total() {
        let (mut arena, h) = entries(3);
        let mut queues = RunQueues::new();
        queues.class_mut(PriorityClass::High).push_back(&mut arena, h[0]);
        queues.class_mut(PriorityClass::Normal).push_back(&mut arena, h[1]);
        queues.class_mut(PriorityClass::Normal).push_back(&mut arena, h[2]);
        assert_eq!(queues.total(), 3);
        assert_eq!(queues.class(PriorityClass::Normal).len(), 2);
        assert!(queues.class(PriorityClass::Kernel).is_empty());
    }
}
