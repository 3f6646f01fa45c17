//! Domain Ports
//!
//! Abstractions over the collaborators the orchestration core consumes but
//! does not own. Adapters in [`crate::adapters`] implement them for
//! development and tests; production nodes plug in chain, signer and storage
//! clients.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Orchestration Core                        │
//! │   Approver │ Receiver │ Upload State Machine │ Quota Gate    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Ports (Traits)                          │
//! │  PieceStore │ Signer │ Consensus │ BucketCounter │ Reporter  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::{MsgCreateBucket, MsgCreateObject, MsgMigrateBucket, ObjectInfo, StorageParams, Task};

// =============================================================================
// Value Objects
// =============================================================================

/// Storage provider as registered on chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpInfo {
    pub id: u32,
    pub operator_address: String,
    pub endpoint: String,
    pub status: SpStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpStatus {
    #[default]
    InService,
    InJailed,
    GracefulExiting,
    InMaintenance,
}

/// Bucket metadata as recorded on chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketInfo {
    pub id: u64,
    pub bucket_name: String,
    pub owner: String,
    pub charged_read_quota: u64,
    pub global_virtual_group_family_id: u32,
}

/// Prices an SP advertises, in wei per byte per second.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpStoragePrice {
    pub sp_id: u32,
    pub read_price: String,
    pub store_price: String,
    pub free_read_quota: u64,
}

// =============================================================================
// Ports
// =============================================================================

/// Key-addressable piece storage. `put_piece` is idempotent, last write wins.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Reads `limit` bytes from `offset`; a zero limit reads to the end.
    async fn get_piece(&self, key: &str, offset: i64, limit: i64) -> Result<Bytes>;

    async fn put_piece(&self, key: &str, data: Bytes) -> Result<()>;

    async fn delete_piece(&self, key: &str) -> Result<()>;
}

/// Signs on behalf of the SP operator.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign_create_bucket_approval(&self, msg: &MsgCreateBucket) -> Result<Vec<u8>>;

    async fn sign_create_object_approval(&self, msg: &MsgCreateObject) -> Result<Vec<u8>>;

    async fn sign_migrate_bucket_approval(&self, msg: &MsgMigrateBucket) -> Result<Vec<u8>>;

    /// Returns `(signature, integrity)`, where `integrity` is the hash of the
    /// concatenated checksum list.
    async fn sign_integrity_hash(
        &self,
        object_id: u64,
        checksums: &[Vec<u8>],
    ) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Read access to the consensus chain. Every method may fail with `Consensus`.
#[async_trait]
pub trait Consensus: Send + Sync {
    async fn current_height(&self) -> Result<u64>;

    async fn query_sp(&self, operator_address: &str) -> Result<SpInfo>;

    async fn query_bucket_info(&self, bucket_name: &str) -> Result<BucketInfo>;

    async fn query_object_info(&self, bucket_name: &str, object_name: &str) -> Result<ObjectInfo>;

    async fn query_storage_params(&self) -> Result<StorageParams>;

    async fn query_sp_free_quota(&self, operator_address: &str) -> Result<u64>;

    async fn query_sp_price(&self, operator_address: &str) -> Result<SpStoragePrice>;
}

/// Counts buckets an account owns, as indexed by the metadata service.
#[async_trait]
pub trait BucketCounter: Send + Sync {
    async fn user_buckets_count(&self, account: &str) -> Result<u64>;
}

/// Receives finished or failed tasks back at the manager.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report_task(&self, task: &Task) -> Result<()>;
}
