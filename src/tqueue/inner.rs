use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::TaskStrategy;
use crate::error::{Error, Result};
use crate::metrics;
use crate::rcmgr::Limit;
use crate::task::{TKey, Task};

struct State {
    /// Tasks by insertion sequence.
    tasks: BTreeMap<u64, Task>,
    index: HashMap<TKey, u64>,
    next_seq: u64,
    filter: Option<TaskStrategy>,
    retire: Option<TaskStrategy>,
}

/// Storage and locking shared by both queue shapes.
pub(super) struct QueueCore {
    name: String,
    cap: usize,
    state: Mutex<State>,
}

impl QueueCore {
    pub(super) fn new(name: &str, cap: usize) -> Self {
        metrics::set_queue_cap(name, cap);
        metrics::set_queue_size(name, 0);
        Self {
            name: name.to_string(),
            cap,
            state: Mutex::new(State {
                tasks: BTreeMap::new(),
                index: HashMap::new(),
                next_seq: 0,
                filter: None,
                retire: None,
            }),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn cap(&self) -> usize {
        self.cap
    }

    pub(super) fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub(super) fn has(&self, key: &TKey) -> bool {
        let mut state = self.state.lock();
        let Some(seq) = state.index.get(key).copied() else {
            return false;
        };
        let retired = match (&state.retire, state.tasks.get(&seq)) {
            (Some(retire), Some(task)) => retire(task),
            _ => false,
        };
        if retired {
            self.remove(&mut state, seq);
            return false;
        }
        true
    }

    pub(super) fn push(&self, task: Task) -> Result<()> {
        let mut state = self.state.lock();
        let key = task.key();
        if state.index.contains_key(&key) {
            warn!(queue = %self.name, task = %key, "push repeated task");
            return Err(Error::RepeatedTask(key.to_string()));
        }
        if state.tasks.len() >= self.cap {
            let retired: Vec<u64> = match &state.retire {
                Some(retire) => state
                    .tasks
                    .iter()
                    .filter(|&(_, t)| retire(t))
                    .map(|(seq, _)| *seq)
                    .collect(),
                None => Vec::new(),
            };
            if retired.is_empty() {
                warn!(queue = %self.name, cap = self.cap, len = state.tasks.len(), "queue exceed");
                return Err(Error::ExceedQueue {
                    queue: self.name.clone(),
                    cap: self.cap,
                });
            }
            for seq in retired {
                self.remove(&mut state, seq);
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.index.insert(key, seq);
        state.tasks.insert(seq, task);
        metrics::set_queue_size(&self.name, state.tasks.len());
        Ok(())
    }

    /// Selects the oldest inserted task, dropping retired tasks met on the
    /// way. A later task overtakes it only when both carry the same create
    /// time and the later one has a higher priority. With `limit`, tasks whose
    /// estimate does not fit are skipped.
    pub(super) fn top(&self, limit: Option<&Limit>, pop: bool) -> Option<Task> {
        let mut state = self.state.lock();
        let mut retired = Vec::new();
        let mut best: Option<(u64, i64, u8)> = None;
        for (seq, task) in &state.tasks {
            if state.retire.as_ref().is_some_and(|r| r(task)) {
                retired.push(*seq);
                continue;
            }
            if state.filter.as_ref().is_some_and(|f| !f(task)) {
                continue;
            }
            if let Some(limit) = limit {
                if !limit.not_less(&task.estimate_limit()) {
                    continue;
                }
            }
            let better = match best {
                None => true,
                Some((_, create_time, priority)) => {
                    task.create_time() == create_time && task.priority() > priority
                }
            };
            if better {
                best = Some((*seq, task.create_time(), task.priority()));
            }
        }
        for seq in retired {
            self.remove(&mut state, seq);
        }
        let (seq, _, _) = best?;
        if pop {
            self.remove(&mut state, seq)
        } else {
            state.tasks.get(&seq).cloned()
        }
    }

    pub(super) fn pop_by_key(&self, key: &TKey) -> Option<Task> {
        let mut state = self.state.lock();
        let seq = state.index.get(key).copied()?;
        self.remove(&mut state, seq)
    }

    pub(super) fn scan(&self, f: &mut dyn FnMut(&Task)) {
        let state = self.state.lock();
        for task in state.tasks.values() {
            f(task);
        }
    }

    pub(super) fn set_filter(&self, filter: TaskStrategy) {
        self.state.lock().filter = Some(filter);
    }

    pub(super) fn set_retire(&self, retire: TaskStrategy) {
        self.state.lock().retire = Some(retire);
    }

    fn remove(&self, state: &mut State, seq: u64) -> Option<Task> {
        let task = state.tasks.remove(&seq)?;
        state.index.remove(&task.key());
        metrics::set_queue_size(&self.name, state.tasks.len());
        metrics::observe_task_in_queue(
            &self.name,
            chrono::Utc::now().timestamp() - task.create_time(),
        );
        debug!(queue = %self.name, task = %task.key(), "task left queue");
        Some(task)
    }
}
