//! Task Reporter Adapters
//!
//! Implements the `TaskReporter` port with various backends.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::ports::TaskReporter;
use crate::error::Result;
use crate::task::{Task, TaskType};

/// Logging-based task reporter.
///
/// Writes each reported task to the tracing system. Used when the node runs
/// without a manager.
#[derive(Debug, Clone, Default)]
pub struct LoggingTaskReporter {
    info_level: bool,
}

impl LoggingTaskReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

#[async_trait]
impl TaskReporter for LoggingTaskReporter {
    async fn report_task(&self, task: &Task) -> Result<()> {
        if self.info_level {
            info!(task = %task.info(), "task reported");
        } else {
            debug!(task = %task.info(), "task reported");
        }
        Ok(())
    }
}

/// In-memory task collector for testing.
#[derive(Debug, Default)]
pub struct InMemoryTaskReporter {
    tasks: parking_lot::RwLock<Vec<Task>>,
}

impl InMemoryTaskReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn tasks_of_type(&self, task_type: TaskType) -> Vec<Task> {
        self.tasks
            .read()
            .iter()
            .filter(|t| t.task_type() == task_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskReporter for InMemoryTaskReporter {
    async fn report_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().push(task.clone());
        Ok(())
    }
}
