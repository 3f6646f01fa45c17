use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::domain::ports::Consensus;
use crate::error::{Error, Result};
use crate::lifecycle::Service;
use crate::spdb::{SpDb, TaskState, UploadObjectMeta};
use crate::task::{ObjectInfo, ReplicatePiece, SealObject, StorageParams, Task, TaskKind};
use crate::tqueue::{NewTQueue, TQueue};
use crate::upload::UploadStateMachine;
use crate::worker::PeriodicWorker;

pub const REPLICATE_QUEUE_NAME: &str = "upload-replicate";
pub const SEAL_QUEUE_NAME: &str = "upload-seal";

const UPLOAD_SCANNER_NAME: &str = "upload-scanner";

/// Reloads unfinished uploads and queues their replicate and seal tasks.
pub struct UploadScanner {
    pass: ScanPass,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub replicate: usize,
    pub seal: usize,
    pub failed: usize,
}

/// Everything one scan needs; cloned into the periodic worker.
#[derive(Clone)]
struct ScanPass {
    config: UploadConfig,
    db: Arc<dyn SpDb>,
    consensus: Arc<dyn Consensus>,
    uploads: UploadStateMachine,
    replicate_queue: Arc<dyn TQueue>,
    seal_queue: Arc<dyn TQueue>,
}

impl UploadScanner {
    pub fn new(
        config: UploadConfig,
        db: Arc<dyn SpDb>,
        consensus: Arc<dyn Consensus>,
        queue_factory: &NewTQueue,
    ) -> Self {
        let replicate_queue = queue_factory(REPLICATE_QUEUE_NAME, config.scan_batch.max(1));
        let seal_queue = queue_factory(SEAL_QUEUE_NAME, config.scan_batch.max(1));
        Self {
            pass: ScanPass {
                config,
                uploads: UploadStateMachine::new(db.clone()),
                db,
                consensus,
                replicate_queue,
                seal_queue,
            },
            worker: Mutex::new(None),
        }
    }

    pub fn replicate_queue(&self) -> &Arc<dyn TQueue> {
        &self.pass.replicate_queue
    }

    pub fn seal_queue(&self) -> &Arc<dyn TQueue> {
        &self.pass.seal_queue
    }

    /// One pass over the progress table. Timed-out rows are failed first;
    /// rows whose task is already queued are skipped.
    pub async fn scan_once(&self) -> Result<ScanOutcome> {
        self.pass.run().await
    }
}

impl ScanPass {
    async fn run(&self) -> Result<ScanOutcome> {
        let params = self.consensus.query_storage_params().await?;
        let mut outcome = ScanOutcome {
            failed: self.fail_timed_out(params).await?,
            ..Default::default()
        };

        let to_replicate = self
            .db
            .get_upload_metas_to_replicate(self.config.scan_batch, self.config.replicate_timeout_secs)
            .await?;
        for meta in &to_replicate {
            if enqueue(self.replicate_queue.as_ref(), replicate_task(meta, params))? {
                outcome.replicate += 1;
            }
        }

        let to_seal = self
            .db
            .get_upload_metas_to_seal(self.config.scan_batch, self.config.seal_timeout_secs)
            .await?;
        for meta in &to_seal {
            if enqueue(self.seal_queue.as_ref(), seal_task(meta, params))? {
                outcome.seal += 1;
            }
        }
        debug!(
            replicate = outcome.replicate,
            seal = outcome.seal,
            failed = outcome.failed,
            "upload scan done"
        );
        Ok(outcome)
    }

    /// Moves rows stuck in replication or sealing past their timeout to
    /// `Failed` and drops their queued tasks.
    async fn fail_timed_out(&self, params: StorageParams) -> Result<usize> {
        let mut failed = 0;
        let stages = [
            (
                [TaskState::Uploaded, TaskState::Replicating],
                self.config.replicate_timeout_secs,
                "replicate timeout",
            ),
            (
                [TaskState::Replicated, TaskState::Sealing],
                self.config.seal_timeout_secs,
                "seal timeout",
            ),
        ];
        for (states, timeout_secs, description) in stages {
            let stale = self
                .db
                .get_timed_out_upload_metas(&states, self.config.scan_batch, timeout_secs)
                .await?;
            for meta in &stale {
                match self.uploads.fail(meta.object_id, description).await {
                    Ok(_) => {
                        self.replicate_queue
                            .pop_by_key(&replicate_task(meta, params).key());
                        self.seal_queue.pop_by_key(&seal_task(meta, params).key());
                        info!(
                            object_id = meta.object_id,
                            state = %meta.task_state,
                            description,
                            "upload timed out"
                        );
                        failed += 1;
                    }
                    Err(e) => warn!(
                        object_id = meta.object_id,
                        error = %e,
                        "failed to mark timed-out upload"
                    ),
                }
            }
        }
        Ok(failed)
    }
}

/// Queues `task` unless it is already queued. A full queue ends the pass
/// quietly; the next pass picks the row up again.
fn enqueue(queue: &dyn TQueue, task: Task) -> Result<bool> {
    if queue.has(&task.key()) {
        return Ok(false);
    }
    match queue.push(task) {
        Ok(()) => Ok(true),
        Err(Error::ExceedQueue { .. }) | Err(Error::RepeatedTask(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// The progress row only knows the object id. Executors resolve the bucket,
/// name and payload size from chain before acting on the task.
fn object_of(meta: &UploadObjectMeta) -> ObjectInfo {
    ObjectInfo {
        id: meta.object_id,
        ..Default::default()
    }
}

fn replicate_task(meta: &UploadObjectMeta, params: StorageParams) -> Task {
    Task::new(TaskKind::Replicate(ReplicatePiece {
        object: object_of(meta),
        params,
        global_virtual_group_id: meta.global_virtual_group_id,
        secondary_endpoints: meta.secondary_endpoints.clone(),
        secondary_signatures: meta.secondary_signatures.clone(),
        sealed: false,
    }))
}

fn seal_task(meta: &UploadObjectMeta, params: StorageParams) -> Task {
    Task::new(TaskKind::Seal(SealObject {
        object: object_of(meta),
        params,
        global_virtual_group_id: meta.global_virtual_group_id,
        secondary_endpoints: meta.secondary_endpoints.clone(),
        secondary_signatures: meta.secondary_signatures.clone(),
    }))
}

#[async_trait]
impl Service for UploadScanner {
    fn name(&self) -> &str {
        UPLOAD_SCANNER_NAME
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let pass = self.pass.clone();
        let interval = self.pass.config.scan_interval();
        let worker = PeriodicWorker::new(
            UPLOAD_SCANNER_NAME,
            cancel,
            interval.max(Duration::from_millis(100)),
            Arc::new(move || {
                let pass = pass.clone();
                async move { pass.run().await.map(|_| ()) }.boxed()
            }),
        );
        *self.worker.lock() = Some(worker.spawn());
        info!(?interval, "upload scanner started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "upload scanner aborted");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticConsensus;
    use crate::clock::ManualClock;
    use crate::spdb::SqliteSpDb;
    use crate::task::TaskType;
    use crate::tqueue::default_queue_factory;

    async fn seeded_db(clock: Arc<ManualClock>) -> Arc<SqliteSpDb> {
        let db = SqliteSpDb::connect("sqlite::memory:", 1)
            .await
            .unwrap()
            .with_clock(clock);
        for (id, state) in [
            (1, TaskState::Uploaded),
            (2, TaskState::Replicating),
            (3, TaskState::Replicated),
            (4, TaskState::Sealing),
            (5, TaskState::Sealed),
        ] {
            db.insert_upload_progress(id).await.unwrap();
            let mut meta = db.get_upload_meta(id).await.unwrap();
            meta.task_state = state;
            meta.secondary_signatures = vec![vec![id as u8]];
            db.update_upload_progress(&meta).await.unwrap();
        }
        Arc::new(db)
    }

    fn scanner(db: Arc<SqliteSpDb>) -> UploadScanner {
        UploadScanner::new(
            UploadConfig::default(),
            db,
            Arc::new(StaticConsensus::new(1)),
            &default_queue_factory(),
        )
    }

    #[tokio::test]
    async fn test_scan_queues_replicate_and_seal() {
        let clock = Arc::new(ManualClock::new(10_000));
        let scanner = scanner(seeded_db(clock).await);

        let outcome = scanner.scan_once().await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome {
                replicate: 2,
                seal: 2,
                failed: 0
            }
        );
        assert_eq!(scanner.replicate_queue().len(), 2);
        let top = scanner.seal_queue().top().unwrap();
        assert_eq!(top.task_type(), TaskType::Seal);

        let again = scanner.scan_once().await.unwrap();
        assert_eq!(again, ScanOutcome::default());
    }

    #[tokio::test]
    async fn test_timed_out_rows_fail() {
        let clock = Arc::new(ManualClock::new(10_000));
        let db = seeded_db(clock.clone()).await;
        let scanner = scanner(db.clone());
        assert_eq!(scanner.scan_once().await.unwrap().replicate, 2);

        clock.advance_secs(601);
        let outcome = scanner.scan_once().await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome {
                replicate: 0,
                seal: 0,
                failed: 4
            }
        );
        assert!(scanner.replicate_queue().is_empty());
        assert!(scanner.seal_queue().is_empty());
        for id in 1..=4 {
            let (state, description) = db.get_upload_state(id).await.unwrap();
            assert_eq!(state, TaskState::Failed);
            assert!(description.ends_with("timeout"));
        }
        assert_eq!(db.get_upload_state(5).await.unwrap().0, TaskState::Sealed);

        assert_eq!(scanner.scan_once().await.unwrap(), ScanOutcome::default());
    }

    #[tokio::test]
    async fn test_rows_within_timeout_stay_live() {
        let clock = Arc::new(ManualClock::new(10_000));
        let db = seeded_db(clock.clone()).await;
        let scanner = scanner(db.clone());
        clock.advance_secs(600);
        assert_eq!(scanner.scan_once().await.unwrap().failed, 0);
        assert_eq!(db.get_upload_state(2).await.unwrap().0, TaskState::Replicating);
    }

    #[tokio::test]
    async fn test_queued_tasks_carry_object_id() {
        let clock = Arc::new(ManualClock::new(10_000));
        let scanner = scanner(seeded_db(clock).await);
        scanner.scan_once().await.unwrap();
        let mut ids = Vec::new();
        scanner.replicate_queue().scan_task(&mut |t| {
            if let TaskKind::Replicate(r) = t.kind() {
                ids.push(r.object.id);
            }
        });
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_service_scans_until_cancelled() {
        let clock = Arc::new(ManualClock::new(10_000));
        let scanner = scanner(seeded_db(clock).await);
        let cancel = CancellationToken::new();
        scanner.start(cancel.clone()).await.unwrap();
        for _ in 0..100 {
            if scanner.seal_queue().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scanner.replicate_queue().len(), 2);
        assert_eq!(scanner.seal_queue().len(), 2);
        cancel.cancel();
        scanner.stop().await.unwrap();
    }
}
