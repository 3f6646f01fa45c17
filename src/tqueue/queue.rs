use super::inner::QueueCore;
use super::{TQueue, TQueueStrategy, TaskStrategy};
use crate::error::Result;
use crate::task::{TKey, Task};

/// Plain bounded task queue.
pub struct GfSpTQueue {
    core: QueueCore,
}

impl GfSpTQueue {
    pub fn new(name: &str, cap: usize) -> Self {
        Self {
            core: QueueCore::new(name, cap),
        }
    }
}

impl TQueue for GfSpTQueue {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn top(&self) -> Option<Task> {
        self.core.top(None, false)
    }

    fn pop(&self) -> Option<Task> {
        self.core.top(None, true)
    }

    fn pop_by_key(&self, key: &TKey) -> Option<Task> {
        self.core.pop_by_key(key)
    }

    fn has(&self, key: &TKey) -> bool {
        self.core.has(key)
    }

    fn push(&self, task: Task) -> Result<()> {
        self.core.push(task)
    }

    fn len(&self) -> usize {
        self.core.len()
    }

    fn cap(&self) -> usize {
        self.core.cap()
    }

    fn scan_task(&self, f: &mut dyn FnMut(&Task)) {
        self.core.scan(f)
    }
}

impl TQueueStrategy for GfSpTQueue {
    fn set_filter_task_strategy(&self, filter: TaskStrategy) {
        self.core.set_filter(filter)
    }

    fn set_retire_task_strategy(&self, retire: TaskStrategy) {
        self.core.set_retire(retire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::task::{GcMeta, TaskKind};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn gc_task(create_time: i64) -> Task {
        Task::new(TaskKind::GcMeta(GcMeta::default())).with_create_time(create_time)
    }

    #[test]
    fn test_push_and_pop_fifo() {
        let queue = GfSpTQueue::new("test", 10);
        queue.push(gc_task(3)).unwrap();
        queue.push(gc_task(1)).unwrap();
        queue.push(gc_task(2)).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.top().unwrap().create_time(), 3);
        assert_eq!(queue.len(), 3);
        let order: Vec<i64> = std::iter::from_fn(|| queue.pop())
            .map(|t| t.create_time())
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert!(queue.is_empty());
        assert!(queue.top().is_none());
    }

    #[test]
    fn test_priority_breaks_create_time_ties() {
        let queue = GfSpTQueue::new("test", 10);
        let low = Task::new(TaskKind::GcMeta(GcMeta { current_idx: 1, delete_count: 0 }))
            .with_create_time(5)
            .with_priority(10);
        let high = Task::new(TaskKind::GcObject(Default::default()))
            .with_create_time(5)
            .with_priority(200);
        queue.push(low).unwrap();
        queue.push(high).unwrap();
        assert_eq!(queue.pop().unwrap().priority(), 200);
        assert_eq!(queue.pop().unwrap().priority(), 10);
    }

    #[test]
    fn test_priority_does_not_overtake_older_create_time() {
        let queue = GfSpTQueue::new("test", 10);
        let first = Task::new(TaskKind::GcMeta(GcMeta { current_idx: 1, delete_count: 0 }))
            .with_create_time(5)
            .with_priority(10);
        let later = Task::new(TaskKind::GcObject(Default::default()))
            .with_create_time(6)
            .with_priority(200);
        queue.push(first).unwrap();
        queue.push(later).unwrap();
        assert_eq!(queue.pop().unwrap().priority(), 10);
        assert_eq!(queue.pop().unwrap().priority(), 200);
    }

    #[test]
    fn test_push_repeated_task() {
        let queue = GfSpTQueue::new("test", 10);
        queue.push(gc_task(1)).unwrap();
        assert_matches!(queue.push(gc_task(1)), Err(Error::RepeatedTask(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_full_queue_without_retire() {
        let queue = GfSpTQueue::new("test", 2);
        queue.push(gc_task(1)).unwrap();
        queue.push(gc_task(2)).unwrap();
        assert_matches!(queue.push(gc_task(3)), Err(Error::ExceedQueue { cap: 2, .. }));
    }

    #[test]
    fn test_push_full_queue_retires() {
        let queue = GfSpTQueue::new("test", 2);
        queue.set_retire_task_strategy(Arc::new(|t: &Task| t.create_time() < 2));
        queue.push(gc_task(1)).unwrap();
        queue.push(gc_task(2)).unwrap();
        queue.push(gc_task(3)).unwrap();
        assert_eq!(queue.len(), 2);
        assert!(!queue.has(&gc_task(1).key()));
        assert!(queue.has(&gc_task(3).key()));
    }

    #[test]
    fn test_has_evicts_retired_task() {
        let now = Arc::new(AtomicU64::new(0));
        let queue = GfSpTQueue::new("test", 10);
        let clock = now.clone();
        queue.set_retire_task_strategy(Arc::new(move |t: &Task| {
            (t.create_time() as u64) < clock.load(Ordering::SeqCst)
        }));
        queue.push(gc_task(5)).unwrap();
        assert!(queue.has(&gc_task(5).key()));
        now.store(6, Ordering::SeqCst);
        assert!(!queue.has(&gc_task(5).key()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_filter_skips_tasks() {
        let queue = GfSpTQueue::new("test", 10);
        queue.set_filter_task_strategy(Arc::new(|t: &Task| t.create_time() % 2 == 0));
        queue.push(gc_task(1)).unwrap();
        queue.push(gc_task(2)).unwrap();
        assert_eq!(queue.pop().unwrap().create_time(), 2);
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_by_key_keeps_order() {
        let queue = GfSpTQueue::new("test", 10);
        for t in 1..=3 {
            queue.push(gc_task(t)).unwrap();
        }
        let popped = queue.pop_by_key(&gc_task(2).key()).unwrap();
        assert_eq!(popped.create_time(), 2);
        assert!(queue.pop_by_key(&gc_task(2).key()).is_none());
        let mut seen = Vec::new();
        queue.scan_task(&mut |t| seen.push(t.create_time()));
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn test_concurrent_push() {
        let queue = Arc::new(GfSpTQueue::new("test", 1000));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = queue.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        q.push(gc_task(i * 100 + j)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.len(), 400);
    }
}
