//! Approval Controller
//!
//! Signs create-bucket, create-object and migrate-bucket approvals and keeps
//! every signed approval queued until its expiry height passes.
//!
//! ```text
//! pre_*  ──► Admitted ──► handle_* ──► Signed ──► Queued ──┬──► Served
//!                                                          └──► Expired (GC)
//! ```
//!
//! Bucket and migrate approvals share the bucket queue; object approvals
//! have their own. Both queues retire a task once the chain moves past its
//! expired height, so a full queue makes room by dropping stale approvals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::ChainHeight;
use crate::config::ApprovalConfig;
use crate::domain::ports::{BucketCounter, Consensus, Signer};
use crate::error::{Error, Result};
use crate::lifecycle::Service;
use crate::metrics;
use crate::rcmgr::{ResourceManager, ResourceScope};
use crate::task::{TKey, Task, TaskKind};
use crate::tqueue::{scan_tqueue_by_sub_key, NewTQueueOnStrategy, TQueueOnStrategy, TaskStrategy};
use crate::worker::PeriodicWorker;

pub const APPROVER_SERVICE_NAME: &str = "approver";

const BUCKET_QUEUE_NAME: &str = "approver-bucket";
const OBJECT_QUEUE_NAME: &str = "approver-object";

/// True once the chain moved past the approval's expiry height.
pub fn approval_expired(task: &Task, current_height: u64) -> bool {
    task.expired_height()
        .is_some_and(|expired| expired < current_height)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalKind {
    CreateBucket,
    CreateObject,
    MigrateBucket,
}

impl ApprovalKind {
    fn label(&self) -> &'static str {
        match self {
            ApprovalKind::CreateBucket => "create_bucket",
            ApprovalKind::CreateObject => "create_object",
            ApprovalKind::MigrateBucket => "migrate_bucket",
        }
    }

    fn of(task: &Task) -> Option<Self> {
        match task.kind() {
            TaskKind::CreateBucketApproval(_) => Some(ApprovalKind::CreateBucket),
            TaskKind::CreateObjectApproval(_) => Some(ApprovalKind::CreateObject),
            TaskKind::MigrateBucketApproval(_) => Some(ApprovalKind::MigrateBucket),
            _ => None,
        }
    }
}

/// Collaborators the approver is built from.
pub struct ApproverDeps {
    pub consensus: Arc<dyn Consensus>,
    pub signer: Arc<dyn Signer>,
    pub bucket_counter: Arc<dyn BucketCounter>,
    pub height: Arc<ChainHeight>,
    pub queue_factory: NewTQueueOnStrategy,
    pub rcmgr: Arc<dyn ResourceManager>,
}

pub struct Approver {
    config: ApprovalConfig,
    height_poll_interval: Duration,
    bucket_queue: Arc<dyn TQueueOnStrategy>,
    object_queue: Arc<dyn TQueueOnStrategy>,
    consensus: Arc<dyn Consensus>,
    signer: Arc<dyn Signer>,
    bucket_counter: Arc<dyn BucketCounter>,
    height: Arc<ChainHeight>,
    scope: ResourceScope,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Approver {
    pub fn new(
        config: ApprovalConfig,
        height_poll_interval: Duration,
        deps: ApproverDeps,
    ) -> Result<Self> {
        let bucket_queue = (deps.queue_factory)(BUCKET_QUEUE_NAME, config.bucket_approval_parallel);
        let object_queue = (deps.queue_factory)(OBJECT_QUEUE_NAME, config.object_approval_parallel);
        let retire = {
            let height = deps.height.clone();
            let strategy: TaskStrategy = Arc::new(move |t: &Task| approval_expired(t, height.get()));
            strategy
        };
        bucket_queue.set_retire_task_strategy(retire.clone());
        object_queue.set_retire_task_strategy(retire);
        let scope = deps.rcmgr.open_service(APPROVER_SERVICE_NAME)?;

        Ok(Self {
            config,
            height_poll_interval,
            bucket_queue,
            object_queue,
            consensus: deps.consensus,
            signer: deps.signer,
            bucket_counter: deps.bucket_counter,
            height: deps.height,
            scope,
            workers: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Admission
    // =========================================================================

    pub async fn pre_create_bucket_approval(&self, task: &mut Task) -> Result<()> {
        let result = self.admit_create_bucket(task).await;
        record_admission(task, ApprovalKind::CreateBucket, &result);
        result
    }

    async fn admit_create_bucket(&self, task: &Task) -> Result<()> {
        let creator = match task.kind() {
            TaskKind::CreateBucketApproval(t) => match &t.msg {
                Some(msg) => msg.creator.clone(),
                None => return Err(Error::DanglingPointer("create bucket msg".into())),
            },
            _ => return Err(Error::DanglingPointer("create bucket approval task".into())),
        };
        let owned = self.bucket_counter.user_buckets_count(&creator).await?;
        if owned >= self.config.account_bucket_number {
            return Err(Error::ExceedBucketNumber {
                account: creator,
                owned,
                limit: self.config.account_bucket_number,
            });
        }
        if self.bucket_queue.has(&task.key()) {
            return Err(Error::RepeatedTask(task.key().to_string()));
        }
        Ok(())
    }

    pub async fn pre_create_object_approval(&self, task: &mut Task) -> Result<()> {
        let result = self.admit(task, ApprovalKind::CreateObject);
        record_admission(task, ApprovalKind::CreateObject, &result);
        result
    }

    pub async fn pre_migrate_bucket_approval(&self, task: &mut Task) -> Result<()> {
        let result = self.admit(task, ApprovalKind::MigrateBucket);
        record_admission(task, ApprovalKind::MigrateBucket, &result);
        result
    }

    fn admit(&self, task: &Task, kind: ApprovalKind) -> Result<()> {
        if ApprovalKind::of(task) != Some(kind) || task.expired_height().is_none() {
            return Err(Error::DanglingPointer(format!("{} msg", kind.label())));
        }
        if self.queue(kind).has(&task.key()) {
            return Err(Error::RepeatedTask(task.key().to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Handling
    // =========================================================================

    /// Signs the approval and queues it. Returns whether the request is
    /// allowed; on failure the error is also recorded on the task.
    pub async fn handle_create_bucket_approval_task(&self, task: &mut Task) -> Result<bool> {
        self.handle(task, ApprovalKind::CreateBucket).await
    }

    pub async fn handle_create_object_approval_task(&self, task: &mut Task) -> Result<bool> {
        self.handle(task, ApprovalKind::CreateObject).await
    }

    pub async fn handle_migrate_bucket_approval_task(&self, task: &mut Task) -> Result<bool> {
        self.handle(task, ApprovalKind::MigrateBucket).await
    }

    #[instrument(skip(self, task), fields(task = %task.key(), kind = kind.label()))]
    async fn handle(&self, task: &mut Task, kind: ApprovalKind) -> Result<bool> {
        let result = self.sign_and_queue(task, kind).await;
        task.set_error(result.as_ref().err());
        match &result {
            Ok(()) => {
                metrics::inc_approval(kind.label(), "approved");
                info!(expired_height = ?task.expired_height(), "approval signed");
            }
            Err(e) => {
                metrics::inc_approval(kind.label(), &e.kind().to_string());
                warn!(error = %e, "approval failed");
            }
        }
        result.map(|()| true)
    }

    async fn sign_and_queue(&self, task: &mut Task, kind: ApprovalKind) -> Result<()> {
        if ApprovalKind::of(task) != Some(kind) || task.expired_height().is_none() {
            return Err(Error::DanglingPointer(format!("{} msg", kind.label())));
        }
        let queue = self.queue(kind);
        let key = task.key();
        if let Some(queued) = find_task(queue.as_ref(), &key) {
            debug!("approval already signed, reusing queued one");
            *task.kind_mut() = queued.kind().clone();
            return Ok(());
        }

        let span = self.scope.begin_span()?;
        span.reserve_resources(&task.estimate_limit().to_scope_stat())?;

        let current = self.consensus.current_height().await?;
        self.height.observe(current);
        task.set_expired_height(current.saturating_add(self.timeout_height(kind)));

        let sig = self.sign(task).await.map_err(|e| match e {
            Error::Signer(_) => e,
            other => Error::Signer(other.to_string()),
        })?;
        if let Some(approval) = task.approval_mut() {
            approval.sig = sig;
        }
        queue.push(task.clone())
    }

    async fn sign(&self, task: &Task) -> Result<Vec<u8>> {
        match task.kind() {
            TaskKind::CreateBucketApproval(t) => match &t.msg {
                Some(msg) => self.signer.sign_create_bucket_approval(msg).await,
                None => Err(Error::DanglingPointer("create bucket msg".into())),
            },
            TaskKind::CreateObjectApproval(t) => match &t.msg {
                Some(msg) => self.signer.sign_create_object_approval(msg).await,
                None => Err(Error::DanglingPointer("create object msg".into())),
            },
            TaskKind::MigrateBucketApproval(t) => match &t.msg {
                Some(msg) => self.signer.sign_migrate_bucket_approval(msg).await,
                None => Err(Error::DanglingPointer("migrate bucket msg".into())),
            },
            _ => Err(Error::DanglingPointer("approval task".into())),
        }
    }

    fn queue(&self, kind: ApprovalKind) -> &Arc<dyn TQueueOnStrategy> {
        match kind {
            ApprovalKind::CreateObject => &self.object_queue,
            ApprovalKind::CreateBucket | ApprovalKind::MigrateBucket => &self.bucket_queue,
        }
    }

    fn timeout_height(&self, kind: ApprovalKind) -> u64 {
        match kind {
            ApprovalKind::CreateObject => self.config.object_approval_timeout_height,
            ApprovalKind::CreateBucket | ApprovalKind::MigrateBucket => {
                self.config.bucket_approval_timeout_height
            }
        }
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Retire strategy of both approval queues.
    pub fn gc_approval_queue(&self, task: &Task) -> bool {
        approval_expired(task, self.height.get())
    }

    /// Drops every expired approval from both queues and returns how many
    /// were dropped.
    pub fn gc_expired(&self) -> usize {
        sweep_expired(
            &[self.bucket_queue.clone(), self.object_queue.clone()],
            self.height.get(),
        )
    }

    /// Refreshes the cached chain height from consensus.
    pub async fn refresh_height(&self) -> Result<u64> {
        refresh_height(self.consensus.as_ref(), &self.height).await
    }

    /// Queued approvals of both queues whose key contains `sub_key`.
    pub fn query_tasks(&self, sub_key: &str) -> Vec<Task> {
        let mut tasks = scan_tqueue_by_sub_key(self.bucket_queue.as_ref(), sub_key);
        tasks.extend(scan_tqueue_by_sub_key(self.object_queue.as_ref(), sub_key));
        tasks
    }

    pub fn bucket_queue(&self) -> &Arc<dyn TQueueOnStrategy> {
        &self.bucket_queue
    }

    pub fn object_queue(&self) -> &Arc<dyn TQueueOnStrategy> {
        &self.object_queue
    }
}

fn find_task<Q: TQueueOnStrategy + ?Sized>(queue: &Q, key: &TKey) -> Option<Task> {
    if !queue.has(key) {
        return None;
    }
    let mut found = None;
    queue.scan_task(&mut |t: &Task| {
        if found.is_none() && &t.key() == key {
            found = Some(t.clone());
        }
    });
    found
}

fn sweep_expired(queues: &[Arc<dyn TQueueOnStrategy>], current_height: u64) -> usize {
    let mut dropped = 0;
    for queue in queues {
        let mut expired = Vec::new();
        queue.scan_task(&mut |t: &Task| {
            if approval_expired(t, current_height) {
                expired.push(t.key());
            }
        });
        for key in expired {
            if queue.pop_by_key(&key).is_some() {
                debug!(queue = queue.name(), task = %key, "approval expired");
                dropped += 1;
            }
        }
    }
    dropped
}

async fn refresh_height(consensus: &dyn Consensus, height: &ChainHeight) -> Result<u64> {
    let current = consensus.current_height().await?;
    height.observe(current);
    Ok(height.get())
}

fn record_admission(task: &mut Task, kind: ApprovalKind, result: &Result<()>) {
    if let Err(e) = result {
        task.set_error(Some(e));
        metrics::inc_approval(kind.label(), &e.kind().to_string());
        debug!(task = %task.key(), error = %e, "approval refused at admission");
    }
}

#[async_trait]
impl Service for Approver {
    fn name(&self) -> &str {
        APPROVER_SERVICE_NAME
    }

    /// Loads the current height, then spawns the height poller and the
    /// expiry sweeper.
    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.refresh_height().await?;

        let poller = {
            let consensus = self.consensus.clone();
            let height = self.height.clone();
            PeriodicWorker::new(
                "approver-height",
                cancel.clone(),
                self.height_poll_interval,
                Arc::new(move || {
                    let consensus = consensus.clone();
                    let height = height.clone();
                    async move {
                        refresh_height(consensus.as_ref(), &height).await?;
                        Ok(())
                    }
                    .boxed()
                }),
            )
        };
        let sweeper = {
            let queues = [self.bucket_queue.clone(), self.object_queue.clone()];
            let height = self.height.clone();
            PeriodicWorker::new(
                "approver-gc",
                cancel,
                self.config.gc_interval(),
                Arc::new(move || {
                    let dropped = sweep_expired(&queues, height.get());
                    if dropped > 0 {
                        info!(dropped, "expired approvals dropped");
                    }
                    futures::future::ready(Ok(())).boxed()
                }),
            )
        };

        let mut workers = self.workers.lock();
        workers.push(poller.spawn());
        workers.push(sweeper.spawn());
        info!(height = self.height.get(), "approver started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "approver worker aborted");
            }
        }
        self.scope.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{DigestSigner, StaticConsensus};
    use crate::domain::ports::BucketInfo;
    use crate::rcmgr::NullResourceManager;
    use crate::task::{ApprovalMsg, MsgCreateBucket, MsgCreateObject, MsgMigrateBucket};
    use crate::tqueue::default_strategy_queue_factory;
    use assert_matches::assert_matches;

    struct Fixture {
        chain: Arc<StaticConsensus>,
        height: Arc<ChainHeight>,
        approver: Approver,
    }

    fn fixture(config: ApprovalConfig, height: u64) -> Fixture {
        let chain = Arc::new(StaticConsensus::new(height));
        let chain_height = Arc::new(ChainHeight::new(height));
        let approver = Approver::new(
            config,
            Duration::from_secs(1),
            ApproverDeps {
                consensus: chain.clone(),
                signer: Arc::new(DigestSigner::new("test")),
                bucket_counter: chain.clone(),
                height: chain_height.clone(),
                queue_factory: default_strategy_queue_factory(),
                rcmgr: Arc::new(NullResourceManager),
            },
        )
        .unwrap();
        Fixture {
            chain,
            height: chain_height,
            approver,
        }
    }

    fn bucket_msg(creator: &str, bucket: &str) -> MsgCreateBucket {
        MsgCreateBucket {
            creator: creator.into(),
            bucket_name: bucket.into(),
            ..Default::default()
        }
    }

    fn object_msg(bucket: &str, object: &str) -> MsgCreateObject {
        MsgCreateObject {
            creator: "0xuser".into(),
            bucket_name: bucket.into(),
            object_name: object.into(),
            payload_size: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bucket_number_limit_refuses_before_queue() {
        let f = fixture(
            ApprovalConfig {
                account_bucket_number: 3,
                ..Default::default()
            },
            10,
        );
        for name in ["a", "b", "c"] {
            f.chain.insert_bucket(BucketInfo {
                bucket_name: name.into(),
                owner: "0xuser".into(),
                ..Default::default()
            });
        }
        let mut task = Task::create_bucket_approval(Some(bucket_msg("0xuser", "d")));
        let err = f.approver.pre_create_bucket_approval(&mut task).await.unwrap_err();
        assert_matches!(err, Error::ExceedBucketNumber { owned: 3, limit: 3, .. });
        assert_eq!(
            task.error().map(|e| e.kind),
            Some(crate::error::ErrorKind::ExceedBucketNumber)
        );
        assert!(f.approver.bucket_queue().is_empty());

        let mut other = Task::create_bucket_approval(Some(bucket_msg("0xother", "d")));
        f.approver.pre_create_bucket_approval(&mut other).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_bucket_signs_and_queues() {
        let f = fixture(ApprovalConfig::default(), 50);
        let mut task = Task::create_bucket_approval(Some(bucket_msg("0xuser", "photos")));
        f.approver.pre_create_bucket_approval(&mut task).await.unwrap();
        assert!(f.approver.handle_create_bucket_approval_task(&mut task).await.unwrap());

        assert_eq!(task.expired_height(), Some(60));
        assert!(task.error().is_none());
        let TaskKind::CreateBucketApproval(t) = task.kind() else {
            panic!("unexpected task kind");
        };
        let msg = t.msg.as_ref().unwrap();
        let expected = DigestSigner::new("test")
            .sign_create_bucket_approval(msg)
            .await
            .unwrap();
        assert_eq!(msg.approval().sig, expected);
        assert!(f.approver.bucket_queue().has(&task.key()));

        let mut again = Task::create_bucket_approval(Some(bucket_msg("0xuser", "photos")));
        assert_matches!(
            f.approver.pre_create_bucket_approval(&mut again).await,
            Err(Error::RepeatedTask(_))
        );
    }

    #[tokio::test]
    async fn test_repeated_handle_reuses_queued_signature() {
        let f = fixture(ApprovalConfig::default(), 50);
        let mut first = Task::create_object_approval(Some(object_msg("b", "o")));
        f.approver.handle_create_object_approval_task(&mut first).await.unwrap();

        f.chain.set_height(55);
        let mut second = Task::create_object_approval(Some(object_msg("b", "o")));
        assert!(f.approver.handle_create_object_approval_task(&mut second).await.unwrap());
        assert_eq!(second.expired_height(), Some(60));
        assert_eq!(first.kind(), second.kind());
        assert_eq!(f.approver.object_queue().len(), 1);
        assert!(f.approver.bucket_queue().is_empty());
    }

    #[tokio::test]
    async fn test_nil_message_is_dangling() {
        let f = fixture(ApprovalConfig::default(), 1);
        let mut bucket = Task::create_bucket_approval(None);
        assert_matches!(
            f.approver.pre_create_bucket_approval(&mut bucket).await,
            Err(Error::DanglingPointer(_))
        );
        let mut object = Task::create_object_approval(None);
        assert_matches!(
            f.approver.pre_create_object_approval(&mut object).await,
            Err(Error::DanglingPointer(_))
        );
        let mut migrate = Task::migrate_bucket_approval(None);
        assert_matches!(
            f.approver.handle_migrate_bucket_approval_task(&mut migrate).await,
            Err(Error::DanglingPointer(_))
        );
        assert!(migrate.error().is_some());
    }

    #[tokio::test]
    async fn test_consensus_failure_is_recorded() {
        let f = fixture(ApprovalConfig::default(), 1);
        f.chain.set_unavailable(true);
        let mut task = Task::migrate_bucket_approval(Some(MsgMigrateBucket {
            operator: "0xop".into(),
            bucket_name: "b".into(),
            dst_primary_sp_id: 2,
            ..Default::default()
        }));
        assert_matches!(
            f.approver.handle_migrate_bucket_approval_task(&mut task).await,
            Err(Error::Consensus(_))
        );
        assert_eq!(
            task.error().map(|e| e.kind),
            Some(crate::error::ErrorKind::Consensus)
        );
        assert!(f.approver.bucket_queue().is_empty());
    }

    #[test]
    fn test_gc_by_height() {
        let f = fixture(ApprovalConfig::default(), 1);
        let mut task = Task::create_bucket_approval(Some(bucket_msg("0xuser", "b")));
        task.set_expired_height(100);

        f.height.set(99);
        assert!(!f.approver.gc_approval_queue(&task));
        f.height.set(100);
        assert!(!f.approver.gc_approval_queue(&task));
        f.height.set(101);
        assert!(f.approver.gc_approval_queue(&task));
    }

    #[test]
    fn test_gc_sweep_drops_expired_only() {
        let f = fixture(ApprovalConfig::default(), 1);
        for (bucket, expiry) in [("old", 100), ("new", 200)] {
            let mut task = Task::create_bucket_approval(Some(bucket_msg("0xuser", bucket)));
            task.set_expired_height(expiry);
            f.approver.bucket_queue().push(task).unwrap();
        }
        f.height.set(150);
        assert_eq!(f.approver.gc_expired(), 1);
        assert_eq!(f.approver.query_tasks("bucket:new").len(), 1);
        assert!(f.approver.query_tasks("bucket:old").is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_retires_expired_approval() {
        let f = fixture(
            ApprovalConfig {
                bucket_approval_parallel: 1,
                ..Default::default()
            },
            10,
        );
        let mut first = Task::create_bucket_approval(Some(bucket_msg("0xuser", "one")));
        f.approver.handle_create_bucket_approval_task(&mut first).await.unwrap();

        let mut second = Task::create_bucket_approval(Some(bucket_msg("0xuser", "two")));
        assert_matches!(
            f.approver.handle_create_bucket_approval_task(&mut second).await,
            Err(Error::ExceedQueue { cap: 1, .. })
        );

        f.chain.set_height(21);
        let mut third = Task::create_bucket_approval(Some(bucket_msg("0xuser", "three")));
        assert!(f.approver.handle_create_bucket_approval_task(&mut third).await.unwrap());
        assert_eq!(third.expired_height(), Some(31));
        assert!(f.approver.query_tasks("bucket:one").is_empty());
        assert_eq!(f.approver.query_tasks("0xuser").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_workers_follow_chain() {
        let f = fixture(
            ApprovalConfig {
                gc_interval_secs: 1,
                ..Default::default()
            },
            10,
        );
        let mut task = Task::create_object_approval(Some(object_msg("b", "o")));
        f.approver.handle_create_object_approval_task(&mut task).await.unwrap();

        let cancel = CancellationToken::new();
        f.approver.start(cancel.clone()).await.unwrap();
        f.chain.set_height(25);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(f.height.get(), 25);
        assert!(f.approver.object_queue().is_empty());
        cancel.cancel();
        f.approver.stop().await.unwrap();
    }
}
