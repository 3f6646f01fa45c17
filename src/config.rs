//! Node configuration
//!
//! [`GfSpConfig`] is the TOML document the binary loads. Every section has
//! defaults, so an empty file yields a working single-node setup.
//! [`Customize`] carries programmatic overrides of collaborators that the
//! config file cannot express.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::{BucketCounter, Consensus, PieceStore, Signer, TaskReporter};
use crate::error::{Error, Result};
use crate::piece::PieceOp;
use crate::rcmgr::{GfSpLimiter, Limiter, ResourceManager};
use crate::spdb::SpDb;
use crate::tqueue::{NewTQueue, NewTQueueOnStrategy, NewTQueueOnStrategyWithLimit, NewTQueueWithLimit};

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Operator address of this SP on chain
    pub operator_address: String,
    pub grpc_address: String,
    /// Key the development signer derives signatures from
    pub signer_key: String,
    pub shutdown_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            operator_address: "0x0000000000000000000000000000000000000000".to_string(),
            grpc_address: "127.0.0.1:9333".to_string(),
            signer_key: "gfsp-dev".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://gfsp.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub bucket_approval_timeout_height: u64,
    pub object_approval_timeout_height: u64,
    /// Capacity of the create/migrate bucket approval queue
    pub bucket_approval_parallel: usize,
    /// Capacity of the create object approval queue
    pub object_approval_parallel: usize,
    /// Max buckets an account may own before bucket approvals are refused
    pub account_bucket_number: u64,
    pub gc_interval_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            bucket_approval_timeout_height: 10,
            object_approval_timeout_height: 10,
            bucket_approval_parallel: 1024,
            object_approval_parallel: 1024,
            account_bucket_number: 100,
            gc_interval_secs: 3,
        }
    }
}

impl ApprovalConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Capacity of the in-flight receive queue
    pub receive_parallel: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            receive_parallel: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub replicate_timeout_secs: i64,
    pub seal_timeout_secs: i64,
    pub scan_interval_secs: u64,
    pub scan_batch: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            replicate_timeout_secs: 600,
            seal_timeout_secs: 600,
            scan_interval_secs: 10,
            scan_batch: 100,
        }
    }
}

impl UploadConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RcmgrConfig {
    /// Admit every reservation
    pub disable: bool,
    pub limits: GfSpLimiter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub height_poll_interval_secs: u64,
    /// Starting height of the built-in static chain
    pub static_height: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            height_poll_interval_secs: 3,
            static_height: 1,
        }
    }
}

impl ChainConfig {
    pub fn height_poll_interval(&self) -> Duration {
        Duration::from_secs(self.height_poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PieceStoreConfig {
    /// Directory for pieces; pieces stay in memory when unset
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub disable: bool,
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            disable: false,
            listen_address: "127.0.0.1:24367".to_string(),
        }
    }
}

// =============================================================================
// GfSpConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GfSpConfig {
    pub app: AppConfig,
    pub db: DbConfig,
    pub approval: ApprovalConfig,
    pub receive: ReceiveConfig,
    pub upload: UploadConfig,
    pub rcmgr: RcmgrConfig,
    pub chain: ChainConfig,
    pub piece_store: PieceStoreConfig,
    pub metrics: MetricsConfig,
}

impl GfSpConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Rejects values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.approval.bucket_approval_parallel == 0 || self.approval.object_approval_parallel == 0
        {
            return Err(Error::Config("approval parallel must be positive".into()));
        }
        if self.receive.receive_parallel == 0 {
            return Err(Error::Config("receive_parallel must be positive".into()));
        }
        if self.approval.bucket_approval_timeout_height == 0
            || self.approval.object_approval_timeout_height == 0
        {
            return Err(Error::Config("approval timeout height must be positive".into()));
        }
        if self.upload.replicate_timeout_secs <= 0 || self.upload.seal_timeout_secs <= 0 {
            return Err(Error::Config("upload timeouts must be positive".into()));
        }
        if self.db.url.is_empty() {
            return Err(Error::Config("db.url is empty".into()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.app.shutdown_timeout_secs)
    }
}

// =============================================================================
// Customize
// =============================================================================

/// Collaborator overrides applied when the base app is built. Each option
/// may be set once; unset options fall back to the built-in defaults.
#[derive(Clone, Default)]
pub struct Customize {
    pub(crate) db: Option<Arc<dyn SpDb>>,
    pub(crate) piece_store: Option<Arc<dyn PieceStore>>,
    pub(crate) piece_op: Option<Arc<dyn PieceOp>>,
    pub(crate) resource_manager: Option<Arc<dyn ResourceManager>>,
    pub(crate) limiter: Option<Arc<dyn Limiter>>,
    pub(crate) consensus: Option<Arc<dyn Consensus>>,
    pub(crate) queue_factory: Option<NewTQueue>,
    pub(crate) queue_with_limit_factory: Option<NewTQueueWithLimit>,
    pub(crate) strategy_queue_factory: Option<NewTQueueOnStrategy>,
    pub(crate) strategy_queue_with_limit_factory: Option<NewTQueueOnStrategyWithLimit>,
    pub(crate) signer: Option<Arc<dyn Signer>>,
    pub(crate) bucket_counter: Option<Arc<dyn BucketCounter>>,
    pub(crate) task_reporter: Option<Arc<dyn TaskReporter>>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, what: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::Config(format!("repeated set {}", what)));
    }
    *slot = Some(value);
    Ok(())
}

impl Customize {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_db(&mut self, db: Arc<dyn SpDb>) -> Result<&mut Self> {
        set_once(&mut self.db, db, "db")?;
        Ok(self)
    }

    pub fn set_piece_store(&mut self, store: Arc<dyn PieceStore>) -> Result<&mut Self> {
        set_once(&mut self.piece_store, store, "piece store")?;
        Ok(self)
    }

    pub fn set_piece_op(&mut self, op: Arc<dyn PieceOp>) -> Result<&mut Self> {
        set_once(&mut self.piece_op, op, "piece op")?;
        Ok(self)
    }

    pub fn set_resource_manager(&mut self, rcmgr: Arc<dyn ResourceManager>) -> Result<&mut Self> {
        set_once(&mut self.resource_manager, rcmgr, "resource manager")?;
        Ok(self)
    }

    pub fn set_limiter(&mut self, limiter: Arc<dyn Limiter>) -> Result<&mut Self> {
        set_once(&mut self.limiter, limiter, "limiter")?;
        Ok(self)
    }

    pub fn set_consensus(&mut self, consensus: Arc<dyn Consensus>) -> Result<&mut Self> {
        set_once(&mut self.consensus, consensus, "consensus")?;
        Ok(self)
    }

    pub fn set_queue_factory(&mut self, factory: NewTQueue) -> Result<&mut Self> {
        set_once(&mut self.queue_factory, factory, "queue factory")?;
        Ok(self)
    }

    pub fn set_queue_with_limit_factory(&mut self, factory: NewTQueueWithLimit) -> Result<&mut Self> {
        set_once(&mut self.queue_with_limit_factory, factory, "queue with limit factory")?;
        Ok(self)
    }

    pub fn set_strategy_queue_factory(&mut self, factory: NewTQueueOnStrategy) -> Result<&mut Self> {
        set_once(&mut self.strategy_queue_factory, factory, "strategy queue factory")?;
        Ok(self)
    }

    pub fn set_strategy_queue_with_limit_factory(
        &mut self,
        factory: NewTQueueOnStrategyWithLimit,
    ) -> Result<&mut Self> {
        set_once(
            &mut self.strategy_queue_with_limit_factory,
            factory,
            "strategy queue with limit factory",
        )?;
        Ok(self)
    }

    pub fn set_signer(&mut self, signer: Arc<dyn Signer>) -> Result<&mut Self> {
        set_once(&mut self.signer, signer, "signer")?;
        Ok(self)
    }

    pub fn set_bucket_counter(&mut self, counter: Arc<dyn BucketCounter>) -> Result<&mut Self> {
        set_once(&mut self.bucket_counter, counter, "bucket counter")?;
        Ok(self)
    }

    pub fn set_task_reporter(&mut self, reporter: Arc<dyn TaskReporter>) -> Result<&mut Self> {
        set_once(&mut self.task_reporter, reporter, "task reporter")?;
        Ok(self)
    }
}

impl fmt::Debug for Customize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Customize")
            .field("db", &self.db.is_some())
            .field("piece_store", &self.piece_store.is_some())
            .field("piece_op", &self.piece_op.is_some())
            .field("resource_manager", &self.resource_manager.is_some())
            .field("limiter", &self.limiter.is_some())
            .field("consensus", &self.consensus.is_some())
            .field("queue_factory", &self.queue_factory.is_some())
            .field("queue_with_limit_factory", &self.queue_with_limit_factory.is_some())
            .field("strategy_queue_factory", &self.strategy_queue_factory.is_some())
            .field(
                "strategy_queue_with_limit_factory",
                &self.strategy_queue_with_limit_factory.is_some(),
            )
            .field("signer", &self.signer.is_some())
            .field("bucket_counter", &self.bucket_counter.is_some())
            .field("task_reporter", &self.task_reporter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryPieceStore, StaticConsensus};
    use crate::rcmgr::NullResourceManager;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = GfSpConfig::from_toml_str("").unwrap();
        assert_eq!(config, GfSpConfig::default());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_sections() {
        let config = GfSpConfig::from_toml_str(
            r#"
            [approval]
            account_bucket_number = 3

            [db]
            url = "sqlite::memory:"

            [rcmgr.limits.system]
            memory = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.approval.account_bucket_number, 3);
        assert_eq!(config.approval.bucket_approval_timeout_height, 10);
        assert_eq!(config.db.url, "sqlite::memory:");
        assert_eq!(config.rcmgr.limits.system.memory, 1024);
        assert_eq!(config.rcmgr.limits.system.tasks_total, i64::MAX);
    }

    #[test]
    fn test_validation_rejects_zero_parallel() {
        assert_matches!(
            GfSpConfig::from_toml_str("[receive]\nreceive_parallel = 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(GfSpConfig::from_toml_str("[app\n"), Err(Error::Toml(_)));
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = GfSpConfig::default().to_toml_string().unwrap();
        assert_eq!(GfSpConfig::from_toml_str(&text).unwrap(), GfSpConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[upload]\nscan_batch = 7").unwrap();
        let config = GfSpConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.upload.scan_batch, 7);
        assert_matches!(
            GfSpConfig::load_from_file("/nonexistent/gfsp.toml"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_customize_rejects_repeated_set() {
        let mut customize = Customize::new();
        customize
            .set_piece_store(Arc::new(InMemoryPieceStore::new()))
            .unwrap()
            .set_consensus(Arc::new(StaticConsensus::new(1)))
            .unwrap();
        let err = customize
            .set_piece_store(Arc::new(InMemoryPieceStore::new()))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "configuration error: repeated set piece store");

        customize.set_resource_manager(Arc::new(NullResourceManager)).unwrap();
        assert!(customize.set_resource_manager(Arc::new(NullResourceManager)).is_err());
        assert!(format!("{:?}", customize).contains("piece_store: true"));
    }
}
