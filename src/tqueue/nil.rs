use super::{TQueue, TQueueStrategy, TQueueWithLimit, TaskStrategy};
use crate::error::Result;
use crate::rcmgr::Limit;
use crate::task::{TKey, Task};

/// Stand-in for an unconfigured queue: holds nothing, accepts every push.
#[derive(Debug, Default, Clone, Copy)]
pub struct NilQueue;

impl TQueue for NilQueue {
    fn name(&self) -> &str {
        ""
    }

    fn top(&self) -> Option<Task> {
        None
    }

    fn pop(&self) -> Option<Task> {
        None
    }

    fn pop_by_key(&self, _key: &TKey) -> Option<Task> {
        None
    }

    fn has(&self, _key: &TKey) -> bool {
        false
    }

    fn push(&self, _task: Task) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        0
    }

    fn cap(&self) -> usize {
        0
    }

    fn scan_task(&self, _f: &mut dyn FnMut(&Task)) {}
}

impl TQueueWithLimit for NilQueue {
    fn top_by_limit(&self, _limit: &Limit) -> Option<Task> {
        None
    }

    fn pop_by_limit(&self, _limit: &Limit) -> Option<Task> {
        None
    }
}

impl TQueueStrategy for NilQueue {
    fn set_filter_task_strategy(&self, _filter: TaskStrategy) {}

    fn set_retire_task_strategy(&self, _retire: TaskStrategy) {}
}
