//! Base application
//!
//! Wires collaborators into the approver, receiver and upload services.
//! Every collaborator comes from [`Customize`] when set there and otherwise
//! from its built-in default.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::adapters::{
    DigestSigner, InMemoryPieceStore, LocalFsPieceStore, LoggingTaskReporter, StaticConsensus,
};
use crate::approver::{Approver, ApproverDeps};
use crate::clock::ChainHeight;
use crate::config::{Customize, GfSpConfig};
use crate::domain::ports::{BucketCounter, Consensus, PieceStore, Signer, TaskReporter};
use crate::error::Result;
use crate::lifecycle::ServiceLifecycle;
use crate::piece::{DefaultPieceOp, PieceOp};
use crate::rcmgr::{GfSpResourceManager, Limiter, NullResourceManager, ResourceManager};
use crate::receiver::{Receiver, ReceiverDeps};
use crate::spdb::{year_month_of, BucketQuota, BucketTraffic, ReadRecord, SpDb, SqliteSpDb};
use crate::task::Task;
use crate::tqueue::{
    default_queue_factory, default_queue_with_limit_factory, default_strategy_queue_factory,
    default_strategy_queue_with_limit_factory, NewTQueue, NewTQueueOnStrategy,
    NewTQueueOnStrategyWithLimit, NewTQueueWithLimit,
};
use crate::upload::{UploadScanner, UploadStateMachine};

/// Queue constructors shared by every module of the node.
#[derive(Clone)]
pub struct QueueFactories {
    pub queue: NewTQueue,
    pub queue_with_limit: NewTQueueWithLimit,
    pub strategy_queue: NewTQueueOnStrategy,
    pub strategy_queue_with_limit: NewTQueueOnStrategyWithLimit,
}

pub struct GfSpBaseApp {
    config: GfSpConfig,
    db: Arc<dyn SpDb>,
    piece_store: Arc<dyn PieceStore>,
    piece_op: Arc<dyn PieceOp>,
    rcmgr: Arc<dyn ResourceManager>,
    consensus: Arc<dyn Consensus>,
    signer: Arc<dyn Signer>,
    queues: QueueFactories,
    height: Arc<ChainHeight>,
    approver: Arc<Approver>,
    receiver: Arc<Receiver>,
    uploads: UploadStateMachine,
    scanner: Arc<UploadScanner>,
}

impl GfSpBaseApp {
    /// Builds the node from `config`, preferring collaborators set in
    /// `customize`.
    pub async fn build(config: GfSpConfig, customize: Customize) -> Result<Self> {
        config.validate()?;
        let Customize {
            db,
            piece_store,
            piece_op,
            resource_manager,
            limiter,
            consensus,
            queue_factory,
            queue_with_limit_factory,
            strategy_queue_factory,
            strategy_queue_with_limit_factory,
            signer,
            bucket_counter,
            task_reporter,
        } = customize;

        let db: Arc<dyn SpDb> = match db {
            Some(db) => db,
            None => Arc::new(SqliteSpDb::connect(&config.db.url, config.db.max_connections).await?),
        };
        let piece_store: Arc<dyn PieceStore> = match (piece_store, &config.piece_store.root) {
            (Some(store), _) => store,
            (None, Some(root)) => Arc::new(LocalFsPieceStore::open(root).await?),
            (None, None) => Arc::new(InMemoryPieceStore::new()),
        };
        let piece_op = piece_op.unwrap_or_else(|| Arc::new(DefaultPieceOp));
        let rcmgr: Arc<dyn ResourceManager> = match resource_manager {
            Some(rcmgr) => rcmgr,
            None if config.rcmgr.disable => Arc::new(NullResourceManager),
            None => {
                let limiter: Arc<dyn Limiter> =
                    limiter.unwrap_or_else(|| Arc::new(config.rcmgr.limits.clone()));
                Arc::new(GfSpResourceManager::new(limiter))
            }
        };

        let static_chain = Arc::new(StaticConsensus::new(config.chain.static_height));
        let consensus: Arc<dyn Consensus> = consensus.unwrap_or_else(|| static_chain.clone());
        let bucket_counter: Arc<dyn BucketCounter> =
            bucket_counter.unwrap_or_else(|| static_chain.clone());
        let signer: Arc<dyn Signer> = signer
            .unwrap_or_else(|| Arc::new(DigestSigner::new(config.app.signer_key.as_bytes())));
        let reporter: Arc<dyn TaskReporter> =
            task_reporter.unwrap_or_else(|| Arc::new(LoggingTaskReporter::new()));

        let queues = QueueFactories {
            queue: queue_factory.unwrap_or_else(default_queue_factory),
            queue_with_limit: queue_with_limit_factory.unwrap_or_else(default_queue_with_limit_factory),
            strategy_queue: strategy_queue_factory.unwrap_or_else(default_strategy_queue_factory),
            strategy_queue_with_limit: strategy_queue_with_limit_factory
                .unwrap_or_else(default_strategy_queue_with_limit_factory),
        };

        let height = Arc::new(ChainHeight::new(config.chain.static_height));
        let approver = Arc::new(Approver::new(
            config.approval.clone(),
            config.chain.height_poll_interval(),
            ApproverDeps {
                consensus: consensus.clone(),
                signer: signer.clone(),
                bucket_counter,
                height: height.clone(),
                queue_factory: queues.strategy_queue.clone(),
                rcmgr: rcmgr.clone(),
            },
        )?);
        let receiver = Arc::new(Receiver::new(
            config.receive.receive_parallel,
            ReceiverDeps {
                db: db.clone(),
                piece_store: piece_store.clone(),
                piece_op: piece_op.clone(),
                signer: signer.clone(),
                reporter,
                queue_factory: queues.queue.clone(),
                rcmgr: rcmgr.clone(),
            },
        )?);
        let uploads = UploadStateMachine::new(db.clone());
        let scanner = Arc::new(UploadScanner::new(
            config.upload.clone(),
            db.clone(),
            consensus.clone(),
            &queues.queue,
        ));

        info!(operator = %config.app.operator_address, "base app built");
        Ok(Self {
            config,
            db,
            piece_store,
            piece_op,
            rcmgr,
            consensus,
            signer,
            queues,
            height,
            approver,
            receiver,
            uploads,
            scanner,
        })
    }

    /// Life-cycle manager with every service of the node registered.
    pub fn lifecycle(&self) -> ServiceLifecycle {
        let mut lifecycle = ServiceLifecycle::new(self.config.shutdown_timeout());
        lifecycle
            .register(self.approver.clone())
            .register(self.receiver.clone())
            .register(self.scanner.clone());
        lifecycle
    }

    /// Admits a read against the bucket's monthly quota and records it.
    ///
    /// The bucket's charged quota comes from chain; the free quota is the
    /// one this SP grants per bucket.
    #[instrument(skip(self, record), fields(bucket = %record.bucket_name, size = record.read_size))]
    pub async fn check_read_quota(&self, record: &ReadRecord) -> Result<()> {
        let quota = self.bucket_quota(&record.bucket_name).await?;
        self.db.check_quota_and_add_read_record(record, &quota).await
    }

    /// This month's traffic row of a bucket, created on first access.
    pub async fn bucket_traffic(&self, record: &ReadRecord) -> Result<BucketTraffic> {
        let quota = self.bucket_quota(&record.bucket_name).await?;
        self.db.init_bucket_traffic(record, &quota).await?;
        let month = year_month_of(record.read_timestamp_us)?;
        self.db.get_bucket_traffic(record.bucket_id, &month).await
    }

    async fn bucket_quota(&self, bucket_name: &str) -> Result<BucketQuota> {
        let bucket = self.consensus.query_bucket_info(bucket_name).await?;
        let free = self
            .consensus
            .query_sp_free_quota(&self.config.app.operator_address)
            .await?;
        Ok(BucketQuota {
            free_quota_size: free,
            charged_quota_size: bucket.charged_read_quota,
        })
    }

    /// Queued tasks of every module whose key contains `sub_key`.
    pub fn query_tasks(&self, sub_key: &str) -> Vec<Task> {
        let mut tasks = self.approver.query_tasks(sub_key);
        tasks.extend(self.receiver.query_tasks(sub_key));
        tasks
    }

    pub fn config(&self) -> &GfSpConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<dyn SpDb> {
        &self.db
    }

    pub fn piece_store(&self) -> &Arc<dyn PieceStore> {
        &self.piece_store
    }

    pub fn piece_op(&self) -> &Arc<dyn PieceOp> {
        &self.piece_op
    }

    pub fn resource_manager(&self) -> &Arc<dyn ResourceManager> {
        &self.rcmgr
    }

    pub fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    pub fn queues(&self) -> &QueueFactories {
        &self.queues
    }

    pub fn chain_height(&self) -> &Arc<ChainHeight> {
        &self.height
    }

    pub fn approver(&self) -> &Arc<Approver> {
        &self.approver
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    pub fn uploads(&self) -> &UploadStateMachine {
        &self.uploads
    }

    pub fn upload_scanner(&self) -> &Arc<UploadScanner> {
        &self.scanner
    }
}
