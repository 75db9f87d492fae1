//! Deferred work queue tests

mod mock;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use nexa_sched::platform::InterruptOps;
    use nexa_sched::workqueue::WorkQueue;
    use nexa_sched::{ErrorKind, SchedConfig};

    use crate::mock;

    fn noop(_: usize) {}

    // =========================================================================
    // Queue
    // =========================================================================

    #[test]
    fn test_pop_all_newest_first() {
        let queue = WorkQueue::new(0, 8, 4);
        for ctx in 1..=3 {
            queue.push_entry(noop, ctx).unwrap();
        }
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.free(), 5);

        let list = queue.pop_all();
        let contexts: Vec<usize> = list.iter().map(|e| e.context).collect();
        assert_eq!(contexts, vec![3, 2, 1]);
        assert_eq!(queue.pending(), 0);

        queue.refurbish_list(list);
        assert_eq!(queue.free(), 8);
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    fn test_run_invokes_callbacks_in_list_order() {
        static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(ctx: usize) {
            ORDER.lock().unwrap().push(ctx);
        }

        let queue = WorkQueue::new(0, 4, 1);
        queue.push_entry(record, 10).unwrap();
        queue.push_entry(record, 20).unwrap();
        let list = queue.pop_all();
        assert_eq!(list.run(), 2);
        assert_eq!(*ORDER.lock().unwrap(), vec![20, 10]);
        queue.refurbish_list(list);
    }

    #[test]
    fn test_exhausted_push_leaves_list_intact() {
        let queue = WorkQueue::new(1, 3, 5);
        for ctx in 0..3 {
            queue.push_entry(noop, ctx).unwrap();
        }

        let err = queue.push_entry(noop, 99).unwrap_err();
        assert!(err.is(ErrorKind::WorkQueueExhausted));
        assert!(queue.is_exhausted());
        assert_eq!(queue.rejected(), 1);
        assert_eq!(queue.pending(), 3);

        let list = queue.pop_all();
        let contexts: Vec<usize> = list.iter().map(|e| e.context).collect();
        assert_eq!(contexts, vec![2, 1, 0]);

        // The local drain grew the pool
        assert!(!queue.is_exhausted());
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.free(), 5);
        queue.refurbish_list(list);
        assert_eq!(queue.free(), 8);
    }

    #[test]
    fn test_remote_drain_never_grows() {
        let queue = WorkQueue::new(1, 1, 5);
        queue.push_entry(noop, 1).unwrap();
        assert!(queue.push_entry(noop, 2).is_err());

        let list = queue.pop_all_remote();
        assert_eq!(list.len(), 1);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.is_exhausted());
        queue.refurbish_list_remote(list);
        assert_eq!(queue.free(), 1);

        // The owner grows it on its next drain
        let list = queue.pop_all();
        assert!(list.is_empty());
        assert_eq!(queue.capacity(), 6);
        queue.refurbish_list(list);
        assert_eq!(queue.free(), 6);
    }

    #[test]
    fn test_empty_pool_still_reports_exhaustion() {
        let queue = WorkQueue::new(2, 0, 2);
        assert!(queue.push_entry(noop, 0).is_err());
        let list = queue.pop_all();
        queue.refurbish_list(list);
        queue.push_entry(noop, 0).unwrap();
        queue.push_entry(noop, 1).unwrap();
        assert!(queue.push_entry(noop, 2).is_err());
    }

    // =========================================================================
    // Kernel deferred work
    // =========================================================================

    #[test]
    fn test_run_deferred_on_local_cpu() {
        static SUM: AtomicUsize = AtomicUsize::new(0);
        fn add(ctx: usize) {
            SUM.fetch_add(ctx, Ordering::SeqCst);
        }

        let vm = mock::boot(2);
        vm.kernel.push_work(add, 5).unwrap();
        vm.kernel.push_work(add, 7).unwrap();
        assert_eq!(vm.kernel.work_queue(0).unwrap().pending(), 2);
        assert_eq!(vm.kernel.work_queue(1).unwrap().pending(), 0);

        assert_eq!(vm.kernel.run_deferred(0), 2);
        assert_eq!(SUM.load(Ordering::SeqCst), 12);
        assert_eq!(vm.kernel.run_deferred(0), 0);
        assert!(mock::interrupts_enabled());
    }

    #[test]
    fn test_run_deferred_for_another_cpu() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn hit(_: usize) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let config = SchedConfig {
            workqueue_initial: 1,
            ..SchedConfig::default()
        };
        let vm = mock::boot_with(2, config);
        mock::set_current_cpu(1);
        vm.kernel.push_work(hit, 0).unwrap();
        assert!(vm.kernel.push_work(hit, 0).is_err());
        mock::set_current_cpu(0);

        assert_eq!(vm.kernel.run_deferred(1), 1);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        // Drained remotely, so not grown yet
        assert_eq!(vm.kernel.work_queue(1).unwrap().capacity(), 1);
    }

    #[test]
    fn test_push_work_runs_with_interrupts_off() {
        let vm = mock::boot(1);

        let disables = vm.platform.interrupt_disables();
        vm.kernel.push_work(noop, 1).unwrap();
        assert_eq!(vm.platform.interrupt_disables(), disables + 1);
        assert!(mock::interrupts_enabled());

        // From an interrupt handler the flag stays off afterwards
        let was_enabled = vm.kernel.platform().disable_interrupts();
        vm.kernel.push_work(noop, 2).unwrap();
        assert!(!mock::interrupts_enabled());
        vm.kernel.platform().restore_interrupts(was_enabled);

        assert_eq!(vm.kernel.work_queue(0).unwrap().pending(), 2);
    }

    #[test]
    fn test_push_work_without_queue() {
        let vm = mock::boot(1);
        mock::set_current_cpu(4);
        let err = vm.kernel.push_work(noop, 0).unwrap_err();
        mock::set_current_cpu(0);
        assert!(err.is(ErrorKind::NoSuchCore));
        assert_eq!(vm.kernel.run_deferred(4), 0);
    }
}
