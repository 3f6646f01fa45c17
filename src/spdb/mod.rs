//! SP database
//!
//! Durable state of the orchestration core: the integrity store (staging
//! piece checksums and committed integrity commitments), the monthly read
//! quota ledger and upload progress rows.
//!
//! [`SpDb`] is the seam the receive pipeline, the upload state machine and
//! the quota gate consume; [`SqliteSpDb`] implements it with sqlx.

mod schema;
mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use schema::SCHEMA;
pub use sqlite::SqliteSpDb;

// =============================================================================
// Entities
// =============================================================================

/// Committed integrity commitment of one replica of an object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntegrityMeta {
    pub object_id: u64,
    pub redundancy_index: i32,
    pub integrity_checksum: Vec<u8>,
    pub piece_checksum_list: Vec<Vec<u8>>,
    pub signature: Vec<u8>,
}

/// Quota caps of a bucket as read from chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketQuota {
    pub free_quota_size: u64,
    pub charged_quota_size: u64,
}

/// Read consumption of a bucket in one calendar month.
///
/// `read_consumed_size` counts every byte read, free and charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTraffic {
    pub bucket_id: u64,
    pub year_month: String,
    pub bucket_name: String,
    pub read_consumed_size: u64,
    pub free_quota_consumed_size: u64,
    pub free_quota_size: u64,
    pub charged_quota_size: u64,
    pub modified_time: DateTime<Utc>,
}

impl BucketTraffic {
    pub fn free_quota_remain(&self) -> u64 {
        self.free_quota_size
            .saturating_sub(self.free_quota_consumed_size)
    }

    pub fn charged_quota_consumed(&self) -> u64 {
        self.read_consumed_size
            .saturating_sub(self.free_quota_consumed_size)
    }

    pub fn charged_quota_remain(&self) -> u64 {
        self.charged_quota_size
            .saturating_sub(self.charged_quota_consumed())
    }

    /// Bytes that can still be read this month.
    pub fn remaining(&self) -> u64 {
        self.free_quota_remain()
            .saturating_add(self.charged_quota_remain())
    }

    /// Charges `read_size` against the row, free quota first.
    ///
    /// Leaves the row untouched and fails with `QuotaExceeded` if the read
    /// does not fit in what is left.
    pub fn consume(&mut self, read_size: u64) -> Result<()> {
        let remaining = self.remaining();
        if read_size > remaining {
            return Err(Error::QuotaExceeded {
                bucket_id: self.bucket_id,
                requested: read_size,
                remaining,
            });
        }
        let from_free = read_size.min(self.free_quota_remain());
        self.free_quota_consumed_size += from_free;
        self.read_consumed_size += read_size;
        Ok(())
    }
}

/// Append-only ledger entry of one admitted read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadRecord {
    pub bucket_id: u64,
    pub object_id: u64,
    pub user_address: String,
    pub bucket_name: String,
    pub object_name: String,
    pub read_size: u64,
    pub read_timestamp_us: i64,
}

/// Upload lifecycle of an object on the primary SP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskState {
    #[default]
    Init,
    Uploading,
    Uploaded,
    Replicating,
    Replicated,
    Sealing,
    Sealed,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Init,
        TaskState::Uploading,
        TaskState::Uploaded,
        TaskState::Replicating,
        TaskState::Replicated,
        TaskState::Sealing,
        TaskState::Sealed,
        TaskState::Failed,
    ];

    pub fn as_i32(&self) -> i32 {
        match self {
            TaskState::Init => 0,
            TaskState::Uploading => 1,
            TaskState::Uploaded => 2,
            TaskState::Replicating => 3,
            TaskState::Replicated => 4,
            TaskState::Sealing => 5,
            TaskState::Sealed => 6,
            TaskState::Failed => 7,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_i32() == v)
            .ok_or_else(|| Error::db(format!("unknown task state {}", v)))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Sealed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Init => "init",
            TaskState::Uploading => "uploading",
            TaskState::Uploaded => "uploaded",
            TaskState::Replicating => "replicating",
            TaskState::Replicated => "replicated",
            TaskState::Sealing => "sealing",
            TaskState::Sealed => "sealed",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Upload progress row of one object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadObjectMeta {
    pub object_id: u64,
    pub task_state: TaskState,
    pub global_virtual_group_id: u32,
    pub secondary_endpoints: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
    pub error_description: String,
    pub create_timestamp_second: i64,
    pub update_timestamp_second: i64,
}

/// `YYYY-MM` of a read timestamp in microseconds.
pub fn year_month_of(timestamp_us: i64) -> Result<String> {
    DateTime::<Utc>::from_timestamp_micros(timestamp_us)
        .map(|t| t.format("%Y-%m").to_string())
        .ok_or_else(|| Error::db(format!("invalid read timestamp {}", timestamp_us)))
}

/// Hex-encodes each entry and joins them with commas.
pub fn join_hex(items: &[Vec<u8>]) -> String {
    items.iter().map(hex::encode).collect::<Vec<_>>().join(",")
}

/// Inverse of [`join_hex`]; an empty string is an empty list.
pub fn split_hex(joined: &str) -> Result<Vec<Vec<u8>>> {
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    joined
        .split(',')
        .map(|s| hex::decode(s).map_err(Error::from))
        .collect()
}

// =============================================================================
// Store
// =============================================================================

#[async_trait]
pub trait SpDb: Send + Sync {
    // --- integrity store ---

    /// Stages one piece checksum; a second write for the same piece fails
    /// with `Duplicate`.
    async fn set_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_idx: u32,
        checksum: &[u8],
    ) -> Result<()>;

    async fn get_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_idx: u32,
    ) -> Result<Vec<u8>>;

    /// Staged checksums of pieces `0..piece_count`, ordered by piece index.
    /// Missing pieces are skipped, so the list may be shorter than asked.
    async fn get_all_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_count: u32,
    ) -> Result<Vec<Vec<u8>>>;

    async fn delete_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_idx: u32,
    ) -> Result<()>;

    async fn delete_all_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_count: u32,
    ) -> Result<()>;

    /// Upserts the committed row keyed by object and redundancy index.
    async fn set_object_integrity(&self, meta: &IntegrityMeta) -> Result<()>;

    async fn get_object_integrity(&self, object_id: u64, redundancy_idx: i32)
        -> Result<IntegrityMeta>;

    async fn delete_object_integrity(&self, object_id: u64, redundancy_idx: i32) -> Result<()>;

    // --- quota ledger ---

    /// Admits a read against the bucket's monthly quota and appends its
    /// record in one transaction. Nothing is written when the quota check
    /// fails.
    async fn check_quota_and_add_read_record(
        &self,
        record: &ReadRecord,
        quota: &BucketQuota,
    ) -> Result<()>;

    /// Creates the month row of the record's bucket if absent.
    async fn init_bucket_traffic(&self, record: &ReadRecord, quota: &BucketQuota) -> Result<()>;

    async fn get_bucket_traffic(&self, bucket_id: u64, year_month: &str) -> Result<BucketTraffic>;

    /// Read records of a bucket with `start_us <= ts < end_us`, oldest first.
    async fn get_bucket_read_records(
        &self,
        bucket_id: u64,
        start_us: i64,
        end_us: i64,
        limit: usize,
    ) -> Result<Vec<ReadRecord>>;

    async fn get_object_read_records(
        &self,
        object_id: u64,
        start_us: i64,
        end_us: i64,
        limit: usize,
    ) -> Result<Vec<ReadRecord>>;

    // --- upload progress ---

    async fn insert_upload_progress(&self, object_id: u64) -> Result<()>;

    /// Overwrites state, group, secondaries and error of an existing row and
    /// refreshes its update time.
    async fn update_upload_progress(&self, meta: &UploadObjectMeta) -> Result<()>;

    async fn get_upload_state(&self, object_id: u64) -> Result<(TaskState, String)>;

    async fn get_upload_meta(&self, object_id: u64) -> Result<UploadObjectMeta>;

    /// Rows in `Uploaded` or `Replicating` touched within the last
    /// `timeout_secs`, most recent first.
    async fn get_upload_metas_to_replicate(
        &self,
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>>;

    /// Rows in `Replicated` or `Sealing` touched within the last
    /// `timeout_secs`, with secondary signatures decoded.
    async fn get_upload_metas_to_seal(
        &self,
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>>;

    /// Rows in one of `states` not touched within the last `timeout_secs`,
    /// oldest first.
    async fn get_timed_out_upload_metas(
        &self,
        states: &[TaskState],
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>>;

    async fn delete_upload_progress(&self, object_id: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn traffic(free: u64, charged: u64, free_used: u64, read: u64) -> BucketTraffic {
        BucketTraffic {
            bucket_id: 1,
            year_month: "2024-05".into(),
            bucket_name: "b".into(),
            read_consumed_size: read,
            free_quota_consumed_size: free_used,
            free_quota_size: free,
            charged_quota_size: charged,
            modified_time: Utc::now(),
        }
    }

    #[test]
    fn test_consume_after_free_quota_exhausted() {
        let mut row = traffic(100, 50, 100, 140);
        assert_eq!(row.remaining(), 10);
        assert_matches!(
            row.clone().consume(11),
            Err(Error::QuotaExceeded {
                requested: 11,
                remaining: 10,
                ..
            })
        );
        row.consume(10).unwrap();
        assert_eq!(row.read_consumed_size, 150);
        assert_eq!(row.free_quota_consumed_size, 100);
    }

    #[test]
    fn test_consume_spills_from_free_to_charged() {
        let mut row = traffic(100, 50, 90, 90);
        row.consume(30).unwrap();
        assert_eq!(row.free_quota_consumed_size, 100);
        assert_eq!(row.read_consumed_size, 120);
        assert_eq!(row.charged_quota_consumed(), 20);
        assert_eq!(row.remaining(), 30);
    }

    #[test]
    fn test_year_month() {
        // 2024-05-10T00:00:00Z
        assert_eq!(year_month_of(1_715_299_200_000_000).unwrap(), "2024-05");
        assert_eq!(year_month_of(0).unwrap(), "1970-01");
    }

    #[test]
    fn test_hex_list_round_trip() {
        let list = vec![vec![0xab, 0xcd], vec![], vec![1]];
        let joined = join_hex(&list);
        assert_eq!(joined, "abcd,,01");
        assert_eq!(split_hex(&joined).unwrap(), list);
        assert!(split_hex("").unwrap().is_empty());
        assert_matches!(split_hex("zz"), Err(Error::Hex(_)));
    }

    #[test]
    fn test_task_state_codes() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::from_i32(state.as_i32()).unwrap(), state);
        }
        assert!(TaskState::from_i32(99).is_err());
        assert!(TaskState::Sealed.is_terminal());
        assert!(!TaskState::Sealing.is_terminal());
    }

    proptest! {
        #[test]
        fn prop_consume_never_exceeds_caps(
            free in 0u64..1_000,
            charged in 0u64..1_000,
            reads in proptest::collection::vec(0u64..300, 0..20),
        ) {
            let mut row = traffic(free, charged, 0, 0);
            for read in reads {
                let before = row.clone();
                if row.consume(read).is_err() {
                    prop_assert_eq!(&row, &before);
                }
                prop_assert!(row.read_consumed_size <= free + charged);
                prop_assert!(row.free_quota_consumed_size <= free);
            }
        }
    }
}
