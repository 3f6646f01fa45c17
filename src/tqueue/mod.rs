//! Task Queues
//!
//! Named, bounded, keyed in-memory queues with strategy hooks.
//!
//! # Shapes
//!
//! - [`TQueue`]: `top`, `pop`, `pop_by_key`, `has`, `push`, `len`, `cap`, `scan_task`
//! - [`TQueueWithLimit`]: additionally `top_by_limit` / `pop_by_limit`, which
//!   only return tasks whose estimated footprint fits under the given limit
//!
//! # Strategies
//!
//! - filter: `top*`/`pop*` skip tasks for which the filter returns false
//! - retire: tasks for which it returns true are evicted when the queue is
//!   full, and dropped whenever a scan or lookup meets them
//!
//! # Ordering
//!
//! `top*` returns the eligible task with the earliest create time; equal
//! create times go to the higher priority, then to insertion order.

mod inner;
mod nil;
mod queue;
mod queue_limit;

pub use nil::NilQueue;
pub use queue::GfSpTQueue;
pub use queue_limit::GfSpTQueueWithLimit;

use std::sync::Arc;

use crate::error::Result;
use crate::rcmgr::Limit;
use crate::task::{TKey, Task};

/// Predicate used as a filter or retire strategy.
pub type TaskStrategy = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

pub trait TQueue: Send + Sync {
    fn name(&self) -> &str;

    /// The next task to serve, without removing it.
    fn top(&self) -> Option<Task>;

    /// Removes and returns the next task to serve.
    fn pop(&self) -> Option<Task>;

    /// Removes the task with `key`, keeping the order of the rest.
    fn pop_by_key(&self, key: &TKey) -> Option<Task>;

    fn has(&self, key: &TKey) -> bool;

    /// Appends a task. Fails with `RepeatedTask` on a duplicate key and with
    /// `ExceedQueue` when the queue is full and nothing could be retired.
    fn push(&self, task: Task) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cap(&self) -> usize;

    /// Calls `f` on every task in insertion order.
    fn scan_task(&self, f: &mut dyn FnMut(&Task));
}

pub trait TQueueWithLimit: TQueue {
    fn top_by_limit(&self, limit: &Limit) -> Option<Task>;
    fn pop_by_limit(&self, limit: &Limit) -> Option<Task>;
}

pub trait TQueueStrategy {
    fn set_filter_task_strategy(&self, filter: TaskStrategy);
    fn set_retire_task_strategy(&self, retire: TaskStrategy);
}

pub trait TQueueOnStrategy: TQueue + TQueueStrategy {}
impl<T: TQueue + TQueueStrategy> TQueueOnStrategy for T {}

pub trait TQueueOnStrategyWithLimit: TQueueWithLimit + TQueueStrategy {}
impl<T: TQueueWithLimit + TQueueStrategy> TQueueOnStrategyWithLimit for T {}

// =============================================================================
// Factories
// =============================================================================

pub type NewTQueue = Arc<dyn Fn(&str, usize) -> Arc<dyn TQueue> + Send + Sync>;
pub type NewTQueueWithLimit = Arc<dyn Fn(&str, usize) -> Arc<dyn TQueueWithLimit> + Send + Sync>;
pub type NewTQueueOnStrategy = Arc<dyn Fn(&str, usize) -> Arc<dyn TQueueOnStrategy> + Send + Sync>;
pub type NewTQueueOnStrategyWithLimit =
    Arc<dyn Fn(&str, usize) -> Arc<dyn TQueueOnStrategyWithLimit> + Send + Sync>;

pub fn default_queue_factory() -> NewTQueue {
    Arc::new(|name: &str, cap: usize| Arc::new(GfSpTQueue::new(name, cap)) as Arc<dyn TQueue>)
}

pub fn default_queue_with_limit_factory() -> NewTQueueWithLimit {
    Arc::new(|name: &str, cap: usize| Arc::new(GfSpTQueueWithLimit::new(name, cap)) as Arc<dyn TQueueWithLimit>)
}

pub fn default_strategy_queue_factory() -> NewTQueueOnStrategy {
    Arc::new(|name: &str, cap: usize| Arc::new(GfSpTQueue::new(name, cap)) as Arc<dyn TQueueOnStrategy>)
}

pub fn default_strategy_queue_with_limit_factory() -> NewTQueueOnStrategyWithLimit {
    Arc::new(|name: &str, cap: usize| {
        Arc::new(GfSpTQueueWithLimit::new(name, cap)) as Arc<dyn TQueueOnStrategyWithLimit>
    })
}

/// All tasks whose key contains `sub`.
pub fn scan_tqueue_by_sub_key<Q: TQueue + ?Sized>(queue: &Q, sub: &str) -> Vec<Task> {
    let mut found = Vec::new();
    queue.scan_task(&mut |task| {
        if task.key().contains(sub) {
            found.push(task.clone());
        }
    });
    found
}
