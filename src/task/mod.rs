//! Tasks
//!
//! A [`Task`] is common bookkeeping ([`TaskMeta`]) plus a typed payload
//! ([`TaskKind`]). Every task has a key, a priority, a create time, a retry
//! counter, an optional error and an append-only log.

pub mod key;
pub mod types;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, TaskError};
use crate::rcmgr::Limit;
pub use key::TKey;
pub use types::{
    Approval, ApprovalMsg, MsgCreateBucket, MsgCreateObject, MsgMigrateBucket, ObjectInfo,
    RedundancyType, StorageParams,
};

// =============================================================================
// Priority
// =============================================================================

pub type TPriority = u8;

/// Never scheduled.
pub const UNSCHEDULING_PRIORITY: TPriority = 0;
pub const MAX_TASK_PRIORITY: TPriority = 255;
/// Tasks at or above this priority are high priority.
pub const DEFAULT_LARGER_TASK_PRIORITY: TPriority = 170;
/// Tasks below this priority are low priority.
pub const DEFAULT_SMALLER_PRIORITY: TPriority = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityLevel {
    Low,
    Medium,
    High,
}

impl PriorityLevel {
    pub fn of(priority: TPriority) -> Self {
        if priority >= DEFAULT_LARGER_TASK_PRIORITY {
            PriorityLevel::High
        } else if priority >= DEFAULT_SMALLER_PRIORITY {
            PriorityLevel::Medium
        } else {
            PriorityLevel::Low
        }
    }
}

// =============================================================================
// Task Type
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    CreateBucketApproval,
    CreateObjectApproval,
    MigrateBucketApproval,
    Upload,
    Replicate,
    Receive,
    Seal,
    GcObject,
    GcZombiePiece,
    GcMeta,
    RecoverPiece,
    ChallengePiece,
}

impl TaskType {
    pub fn default_priority(&self) -> TPriority {
        match self {
            TaskType::CreateBucketApproval
            | TaskType::CreateObjectApproval
            | TaskType::MigrateBucketApproval
            | TaskType::Upload => MAX_TASK_PRIORITY,
            TaskType::Replicate | TaskType::Receive | TaskType::Seal => {
                DEFAULT_LARGER_TASK_PRIORITY
            }
            TaskType::ChallengePiece | TaskType::RecoverPiece => DEFAULT_SMALLER_PRIORITY,
            TaskType::GcObject | TaskType::GcZombiePiece | TaskType::GcMeta => 16,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::CreateBucketApproval => "CreateBucketApprovalTask",
            TaskType::CreateObjectApproval => "CreateObjectApprovalTask",
            TaskType::MigrateBucketApproval => "MigrateBucketApprovalTask",
            TaskType::Upload => "UploadObjectTask",
            TaskType::Replicate => "ReplicatePieceTask",
            TaskType::Receive => "ReceivePieceTask",
            TaskType::Seal => "SealObjectTask",
            TaskType::GcObject => "GCObjectTask",
            TaskType::GcZombiePiece => "GCZombiePieceTask",
            TaskType::GcMeta => "GCMetaTask",
            TaskType::RecoverPiece => "RecoverPieceTask",
            TaskType::ChallengePiece => "ChallengePieceTask",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBucketApproval {
    pub msg: Option<MsgCreateBucket>,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateObjectApproval {
    pub msg: Option<MsgCreateObject>,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateBucketApproval {
    pub msg: Option<MsgMigrateBucket>,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadObject {
    pub object: ObjectInfo,
    pub params: StorageParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatePiece {
    pub object: ObjectInfo,
    pub params: StorageParams,
    pub global_virtual_group_id: u32,
    pub secondary_endpoints: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReceivePiece {
    pub object: Option<ObjectInfo>,
    pub params: Option<StorageParams>,
    pub segment_idx: u32,
    /// Index of the secondary replica this piece belongs to.
    pub redundancy_idx: i32,
    pub piece_size: i64,
    pub piece_checksum: Vec<u8>,
    pub global_virtual_group_id: u32,
    pub signature: Vec<u8>,
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealObject {
    pub object: ObjectInfo,
    pub params: StorageParams,
    pub global_virtual_group_id: u32,
    pub secondary_endpoints: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GcObject {
    pub start_block: u64,
    pub end_block: u64,
    pub current_block: u64,
    pub last_deleted_object_id: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GcZombiePiece {
    pub start_object_id: u64,
    pub end_object_id: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GcMeta {
    pub current_idx: u64,
    pub delete_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverPiece {
    pub object: ObjectInfo,
    pub params: StorageParams,
    pub segment_idx: u32,
    /// Negative for a primary-held segment.
    pub ec_idx: i32,
    pub piece_size: u64,
    pub recovered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengePiece {
    pub object: ObjectInfo,
    pub params: StorageParams,
    pub user_address: String,
    pub segment_idx: u32,
    pub redundancy_idx: i32,
    pub integrity_hash: Vec<u8>,
    pub piece_hashes: Vec<Vec<u8>>,
    pub piece_data_size: i64,
}

/// Typed payload of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    CreateBucketApproval(CreateBucketApproval),
    CreateObjectApproval(CreateObjectApproval),
    MigrateBucketApproval(MigrateBucketApproval),
    Upload(UploadObject),
    Replicate(ReplicatePiece),
    Receive(ReceivePiece),
    Seal(SealObject),
    GcObject(GcObject),
    GcZombiePiece(GcZombiePiece),
    GcMeta(GcMeta),
    RecoverPiece(RecoverPiece),
    ChallengePiece(ChallengePiece),
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::CreateBucketApproval(_) => TaskType::CreateBucketApproval,
            TaskKind::CreateObjectApproval(_) => TaskType::CreateObjectApproval,
            TaskKind::MigrateBucketApproval(_) => TaskType::MigrateBucketApproval,
            TaskKind::Upload(_) => TaskType::Upload,
            TaskKind::Replicate(_) => TaskType::Replicate,
            TaskKind::Receive(_) => TaskType::Receive,
            TaskKind::Seal(_) => TaskType::Seal,
            TaskKind::GcObject(_) => TaskType::GcObject,
            TaskKind::GcZombiePiece(_) => TaskType::GcZombiePiece,
            TaskKind::GcMeta(_) => TaskType::GcMeta,
            TaskKind::RecoverPiece(_) => TaskType::RecoverPiece,
            TaskKind::ChallengePiece(_) => TaskType::ChallengePiece,
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Bookkeeping shared by every task type. Times are unix seconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskMeta {
    pub create_time: i64,
    pub update_time: i64,
    pub timeout: i64,
    pub priority: TPriority,
    pub retry: i64,
    pub max_retry: i64,
    /// Address of the module currently executing the task.
    pub address: String,
    pub user_address: String,
    pub error: Option<TaskError>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    meta: TaskMeta,
    kind: TaskKind,
}

impl Task {
    /// Creates a task at its type's default priority, stamped with the current time.
    pub fn new(kind: TaskKind) -> Self {
        let now = chrono::Utc::now().timestamp();
        let priority = kind.task_type().default_priority();
        Self {
            meta: TaskMeta {
                create_time: now,
                update_time: now,
                priority,
                ..Default::default()
            },
            kind,
        }
    }

    pub fn create_bucket_approval(msg: Option<MsgCreateBucket>) -> Self {
        let fingerprint = msg.as_ref().map(|m| m.fingerprint()).unwrap_or_default();
        Self::new(TaskKind::CreateBucketApproval(CreateBucketApproval {
            msg,
            fingerprint,
        }))
    }

    pub fn create_object_approval(msg: Option<MsgCreateObject>) -> Self {
        let fingerprint = msg.as_ref().map(|m| m.fingerprint()).unwrap_or_default();
        Self::new(TaskKind::CreateObjectApproval(CreateObjectApproval {
            msg,
            fingerprint,
        }))
    }

    pub fn migrate_bucket_approval(msg: Option<MsgMigrateBucket>) -> Self {
        let fingerprint = msg.as_ref().map(|m| m.fingerprint()).unwrap_or_default();
        Self::new(TaskKind::MigrateBucketApproval(MigrateBucketApproval {
            msg,
            fingerprint,
        }))
    }

    pub fn receive_piece(piece: ReceivePiece) -> Self {
        Self::new(TaskKind::Receive(piece))
    }

    pub fn with_priority(mut self, priority: TPriority) -> Self {
        self.meta.priority = priority;
        self
    }

    pub fn with_create_time(mut self, time: i64) -> Self {
        self.meta.create_time = time;
        self.meta.update_time = time;
        self
    }

    pub fn with_timeout(mut self, timeout: i64) -> Self {
        self.meta.timeout = timeout;
        self
    }

    pub fn with_max_retry(mut self, max_retry: i64) -> Self {
        self.meta.max_retry = max_retry;
        self
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut TaskKind {
        &mut self.kind
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    pub fn key(&self) -> TKey {
        match &self.kind {
            TaskKind::CreateBucketApproval(t) => {
                let (bucket, account) = t
                    .msg
                    .as_ref()
                    .map(|m| (m.bucket_name.as_str(), m.creator.as_str()))
                    .unwrap_or_default();
                key::create_bucket_approval_key(bucket, account, &t.fingerprint)
            }
            TaskKind::CreateObjectApproval(t) => {
                let (bucket, object, account) = t
                    .msg
                    .as_ref()
                    .map(|m| {
                        (
                            m.bucket_name.as_str(),
                            m.object_name.as_str(),
                            m.creator.as_str(),
                        )
                    })
                    .unwrap_or_default();
                key::create_object_approval_key(bucket, object, account, &t.fingerprint)
            }
            TaskKind::MigrateBucketApproval(t) => {
                let bucket = t.msg.as_ref().map(|m| m.bucket_name.as_str()).unwrap_or("");
                key::migrate_bucket_approval_key(bucket, &t.fingerprint)
            }
            TaskKind::Upload(t) => {
                key::upload_object_key(&t.object.bucket_name, &t.object.object_name, t.object.id)
            }
            TaskKind::Replicate(t) => {
                key::replicate_piece_key(&t.object.bucket_name, &t.object.object_name, t.object.id)
            }
            TaskKind::Seal(t) => {
                key::seal_object_key(&t.object.bucket_name, &t.object.object_name, t.object.id)
            }
            TaskKind::Receive(t) => {
                let default = ObjectInfo::default();
                let o = t.object.as_ref().unwrap_or(&default);
                key::receive_piece_key(
                    &o.bucket_name,
                    &o.object_name,
                    o.id,
                    t.segment_idx,
                    t.redundancy_idx,
                )
            }
            TaskKind::GcObject(t) => {
                key::gc_object_key(t.start_block, t.end_block, self.meta.create_time)
            }
            TaskKind::GcZombiePiece(_) => key::gc_zombie_piece_key(self.meta.create_time),
            TaskKind::GcMeta(_) => key::gc_meta_key(self.meta.create_time),
            TaskKind::RecoverPiece(t) => key::recover_piece_key(
                &t.object.bucket_name,
                &t.object.object_name,
                t.object.id,
                t.segment_idx,
                t.ec_idx,
                self.meta.create_time,
            ),
            TaskKind::ChallengePiece(t) => key::challenge_piece_key(
                &t.object.bucket_name,
                &t.object.object_name,
                t.object.id,
                t.segment_idx,
                t.redundancy_idx,
                &t.user_address,
            ),
        }
    }

    /// One-line description used in logs.
    pub fn info(&self) -> String {
        format!(
            "key[{}], type[{}], priority[{}], limit[{}], create[{}], update[{}], timeout[{}], retry[{}/{}], error[{}]",
            self.key(),
            self.task_type(),
            self.meta.priority,
            self.estimate_limit(),
            self.meta.create_time,
            self.meta.update_time,
            self.meta.timeout,
            self.meta.retry,
            self.meta.max_retry,
            self.meta
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default()
        )
    }

    pub fn priority(&self) -> TPriority {
        self.meta.priority
    }

    pub fn set_priority(&mut self, priority: TPriority) {
        self.meta.priority = priority;
    }

    pub fn create_time(&self) -> i64 {
        self.meta.create_time
    }

    pub fn update_time(&self) -> i64 {
        self.meta.update_time
    }

    pub fn set_update_time(&mut self, time: i64) {
        self.meta.update_time = time;
    }

    pub fn timeout(&self) -> i64 {
        self.meta.timeout
    }

    /// True once `now` is past `update_time + timeout`.
    pub fn expired(&self, now: i64) -> bool {
        self.meta.update_time.saturating_add(self.meta.timeout) < now
    }

    pub fn retry(&self) -> i64 {
        self.meta.retry
    }

    pub fn inc_retry(&mut self) {
        self.meta.retry += 1;
    }

    pub fn exceed_retry(&self) -> bool {
        self.meta.retry > self.meta.max_retry
    }

    pub fn address(&self) -> &str {
        &self.meta.address
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.meta.address = address.into();
    }

    pub fn user_address(&self) -> &str {
        &self.meta.user_address
    }

    pub fn set_user_address(&mut self, address: impl Into<String>) {
        self.meta.user_address = address.into();
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.meta.error.as_ref()
    }

    /// Records `err` on the task; `None` clears it.
    pub fn set_error(&mut self, err: Option<&Error>) {
        self.meta.error = err.map(TaskError::from);
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        self.meta.logs.push(line.into());
    }

    pub fn logs(&self) -> &[String] {
        &self.meta.logs
    }

    /// Height at which an approval stops being valid.
    pub fn expired_height(&self) -> Option<u64> {
        match &self.kind {
            TaskKind::CreateBucketApproval(t) => t.msg.as_ref().map(|m| m.approval().expired_height),
            TaskKind::CreateObjectApproval(t) => t.msg.as_ref().map(|m| m.approval().expired_height),
            TaskKind::MigrateBucketApproval(t) => {
                t.msg.as_ref().map(|m| m.approval().expired_height)
            }
            _ => None,
        }
    }

    pub fn set_expired_height(&mut self, height: u64) {
        if let Some(approval) = self.approval_mut() {
            approval.expired_height = height;
        }
    }

    /// The approval blob of an approval task with a message.
    pub fn approval_mut(&mut self) -> Option<&mut Approval> {
        match &mut self.kind {
            TaskKind::CreateBucketApproval(t) => t.msg.as_mut().map(|m| m.approval_mut()),
            TaskKind::CreateObjectApproval(t) => t.msg.as_mut().map(|m| m.approval_mut()),
            TaskKind::MigrateBucketApproval(t) => t.msg.as_mut().map(|m| m.approval_mut()),
            _ => None,
        }
    }

    /// Resources the task needs while it executes.
    pub fn estimate_limit(&self) -> Limit {
        let mut limit = Limit {
            memory: self.estimate_memory(),
            ..Default::default()
        };
        limit.add(&Limit::for_priority(self.meta.priority));
        limit
    }

    fn estimate_memory(&self) -> i64 {
        match &self.kind {
            TaskKind::Upload(t) => {
                crate::piece::max_segment_piece_size(t.object.payload_size, t.params.max_segment_size)
                    .saturating_mul(2)
            }
            TaskKind::Replicate(t) => {
                let small = t.object.payload_size < t.params.max_payload_size;
                match t.object.redundancy_type {
                    RedundancyType::Replica if small => to_i64(t.object.payload_size),
                    RedundancyType::Replica => to_i64(t.params.max_segment_size),
                    RedundancyType::ErasureCode => {
                        let base = if small {
                            t.params.max_segment_size
                        } else {
                            t.object.payload_size
                        };
                        let data = u128::from(t.params.redundant_data_chunk_num.max(1));
                        let total = u128::from(t.params.total_chunk_num());
                        let size = (u128::from(base) * total).div_ceil(data);
                        i64::try_from(size).unwrap_or(i64::MAX)
                    }
                }
            }
            TaskKind::Receive(t) => t.piece_size,
            TaskKind::RecoverPiece(t) => to_i64(t.params.max_segment_size),
            TaskKind::ChallengePiece(t) => t.piece_data_size,
            _ => 0,
        }
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: u64, payload: u64) -> ObjectInfo {
        ObjectInfo {
            id,
            bucket_name: "bucket".into(),
            object_name: "object".into(),
            payload_size: payload,
            ..Default::default()
        }
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(PriorityLevel::of(0), PriorityLevel::Low);
        assert_eq!(PriorityLevel::of(84), PriorityLevel::Low);
        assert_eq!(PriorityLevel::of(85), PriorityLevel::Medium);
        assert_eq!(PriorityLevel::of(169), PriorityLevel::Medium);
        assert_eq!(PriorityLevel::of(170), PriorityLevel::High);
        assert_eq!(PriorityLevel::of(255), PriorityLevel::High);
    }

    #[test]
    fn test_approval_key_is_stable_after_signing() {
        let msg = MsgCreateBucket {
            creator: "0xabc".into(),
            bucket_name: "photos".into(),
            ..Default::default()
        };
        let mut task = Task::create_bucket_approval(Some(msg));
        let before = task.key();
        task.set_expired_height(100);
        if let Some(approval) = task.approval_mut() {
            approval.sig = vec![1];
        }
        assert_eq!(before, task.key());
        assert_eq!(task.expired_height(), Some(100));
        assert!(before.contains("bucket:photos"));
    }

    #[test]
    fn test_nil_message_approval() {
        let mut task = Task::create_object_approval(None);
        assert_eq!(task.expired_height(), None);
        task.set_expired_height(5);
        assert_eq!(task.expired_height(), None);
    }

    #[test]
    fn test_error_and_logs() {
        let mut task = Task::receive_piece(ReceivePiece::default());
        task.set_error(Some(&Error::PieceStore("down".into())));
        assert_eq!(
            task.error().map(|e| e.kind),
            Some(crate::error::ErrorKind::PieceStore)
        );
        assert!(task.info().contains("down"));
        task.set_error(None);
        assert!(task.error().is_none());
        task.append_log("received");
        assert_eq!(task.logs(), &["received".to_string()]);
    }

    #[test]
    fn test_retry_and_expiry() {
        let mut task = Task::receive_piece(ReceivePiece::default())
            .with_create_time(100)
            .with_timeout(10)
            .with_max_retry(1);
        assert!(!task.expired(110));
        assert!(task.expired(111));
        task.inc_retry();
        assert!(!task.exceed_retry());
        task.inc_retry();
        assert!(task.exceed_retry());
    }

    #[test]
    fn test_estimate_limit() {
        let upload = Task::new(TaskKind::Upload(UploadObject {
            object: object(1, 100),
            params: StorageParams {
                max_segment_size: 16,
                ..Default::default()
            },
        }));
        let limit = upload.estimate_limit();
        assert_eq!(limit.memory, 32);
        assert_eq!(limit.tasks_high, 1);
        assert_eq!(limit.tasks_total, 1);

        let receive = Task::receive_piece(ReceivePiece {
            piece_size: 7,
            ..Default::default()
        });
        assert_eq!(receive.estimate_limit().memory, 7);

        let replicate = Task::new(TaskKind::Replicate(ReplicatePiece {
            object: object(1, 10),
            params: StorageParams {
                max_segment_size: 16,
                redundant_data_chunk_num: 4,
                redundant_parity_chunk_num: 2,
                max_payload_size: 1024,
            },
            global_virtual_group_id: 1,
            secondary_endpoints: vec![],
            secondary_signatures: vec![],
            sealed: false,
        }));
        assert_eq!(replicate.estimate_limit().memory, 24);
    }

    #[test]
    fn test_gc_keys_use_create_time() {
        let task = Task::new(TaskKind::GcMeta(GcMeta::default())).with_create_time(9);
        assert_eq!(task.key().as_str(), "GCMeta-time9");
        assert_eq!(PriorityLevel::of(task.priority()), PriorityLevel::Low);
    }
}
