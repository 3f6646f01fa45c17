use super::inner::QueueCore;
use super::{TQueue, TQueueStrategy, TQueueWithLimit, TaskStrategy};
use crate::error::Result;
use crate::rcmgr::Limit;
use crate::task::{TKey, Task};

/// Task queue that can pop by available resources.
pub struct GfSpTQueueWithLimit {
    core: QueueCore,
}

impl GfSpTQueueWithLimit {
    pub fn new(name: &str, cap: usize) -> Self {
        Self {
            core: QueueCore::new(name, cap),
        }
    }
}

impl TQueue for GfSpTQueueWithLimit {
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

impl TQueueWithLimit for GfSpTQueueWithLimit {
    fn top_by_limit(&self, limit: &Limit) -> Option<Task> {
        self.core.top(Some(limit), false)
    }

    fn pop_by_limit(&self, limit: &Limit) -> Option<Task> {
        self.core.top(Some(limit), true)
    }
}

impl TQueueStrategy for GfSpTQueueWithLimit {
    fn set_filter_task_strategy(&self, filter: TaskStrategy) {
        self.core.set_filter(filter)
    }

    fn set_retire_task_strategy(&self, retire: TaskStrategy) {
        self.core.set_retire(retire)
    }
}
