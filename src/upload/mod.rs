//! Upload State Machine
//!
//! Per-object upload progress on the primary SP, persisted as
//! `upload_object_progress` rows.
//!
//! ```text
//! Init ─► Uploading ─► Uploaded ─► Replicating ─► Replicated ─► Sealing ─► Sealed
//!   └──────────┴───────────┴────────────┴─────────────┴───────────┴──► Failed
//! ```
//!
//! [`UploadScanner`] periodically reloads rows that still need replication
//! or sealing and queues the matching tasks for executors. Rows left
//! untouched past their timeout are moved to `Failed`.

mod scanner;

pub use scanner::{ScanOutcome, UploadScanner, REPLICATE_QUEUE_NAME, SEAL_QUEUE_NAME};

use std::fmt;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::spdb::{SpDb, TaskState, UploadObjectMeta};

/// Something that happened to an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    FirstByteReceived,
    PayloadAccepted,
    ReplicateDispatched { global_virtual_group_id: u32 },
    ReplicasSigned {
        secondary_endpoints: Vec<String>,
        secondary_signatures: Vec<Vec<u8>>,
    },
    SealSubmitted,
    SealConfirmed,
    Failed { description: String },
}

impl UploadEvent {
    pub fn failed(description: impl Into<String>) -> Self {
        UploadEvent::Failed {
            description: description.into(),
        }
    }
}

impl fmt::Display for UploadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadEvent::FirstByteReceived => "first_byte_received",
            UploadEvent::PayloadAccepted => "payload_accepted",
            UploadEvent::ReplicateDispatched { .. } => "replicate_dispatched",
            UploadEvent::ReplicasSigned { .. } => "replicas_signed",
            UploadEvent::SealSubmitted => "seal_submitted",
            UploadEvent::SealConfirmed => "seal_confirmed",
            UploadEvent::Failed { .. } => "failed",
        };
        f.write_str(name)
    }
}

/// State reached from `from` on `event`. `Failed` is reachable from every
/// non-terminal state; terminal states accept nothing.
pub fn next_state(from: TaskState, event: &UploadEvent) -> Result<TaskState> {
    let to = match (from, event) {
        (s, _) if s.is_terminal() => None,
        (_, UploadEvent::Failed { .. }) => Some(TaskState::Failed),
        (TaskState::Init, UploadEvent::FirstByteReceived) => Some(TaskState::Uploading),
        (TaskState::Uploading, UploadEvent::PayloadAccepted) => Some(TaskState::Uploaded),
        (TaskState::Uploaded, UploadEvent::ReplicateDispatched { .. }) => {
            Some(TaskState::Replicating)
        }
        (TaskState::Replicating, UploadEvent::ReplicasSigned { .. }) => Some(TaskState::Replicated),
        (TaskState::Replicated, UploadEvent::SealSubmitted) => Some(TaskState::Sealing),
        (TaskState::Sealing, UploadEvent::SealConfirmed) => Some(TaskState::Sealed),
        _ => None,
    };
    to.ok_or_else(|| Error::Internal(format!("no upload transition from {} on {}", from, event)))
}

/// Drives upload progress rows through [`next_state`].
#[derive(Clone)]
pub struct UploadStateMachine {
    db: Arc<dyn SpDb>,
}

impl UploadStateMachine {
    pub fn new(db: Arc<dyn SpDb>) -> Self {
        Self { db }
    }

    /// Creates the `Init` row of a new upload.
    pub async fn begin(&self, object_id: u64) -> Result<()> {
        self.db.insert_upload_progress(object_id).await?;
        info!(object_id, "upload progress created");
        Ok(())
    }

    /// Applies `event` to the object's row and returns the new state.
    #[instrument(skip(self, event), fields(event = %event))]
    pub async fn apply(&self, object_id: u64, event: UploadEvent) -> Result<TaskState> {
        let mut meta = self.db.get_upload_meta(object_id).await?;
        let to = match next_state(meta.task_state, &event) {
            Ok(to) => to,
            Err(e) => {
                warn!(error = %e, "rejected upload transition");
                return Err(e);
            }
        };

        match event {
            UploadEvent::ReplicateDispatched {
                global_virtual_group_id,
            } => meta.global_virtual_group_id = global_virtual_group_id,
            UploadEvent::ReplicasSigned {
                secondary_endpoints,
                secondary_signatures,
            } => {
                meta.secondary_endpoints = secondary_endpoints;
                meta.secondary_signatures = secondary_signatures;
            }
            UploadEvent::Failed { description } => meta.error_description = description,
            _ => {}
        }
        let from = meta.task_state;
        meta.task_state = to;
        self.db.update_upload_progress(&meta).await?;
        info!(from = %from, to = %to, "upload state changed");
        Ok(to)
    }

    pub async fn fail(&self, object_id: u64, description: impl Into<String>) -> Result<TaskState> {
        self.apply(object_id, UploadEvent::failed(description)).await
    }

    pub async fn state(&self, object_id: u64) -> Result<(TaskState, String)> {
        self.db.get_upload_state(object_id).await
    }

    pub async fn meta(&self, object_id: u64) -> Result<UploadObjectMeta> {
        self.db.get_upload_meta(object_id).await
    }

    /// Drops the row of a sealed or abandoned upload.
    pub async fn finish(&self, object_id: u64) -> Result<()> {
        self.db.delete_upload_progress(object_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spdb::SqliteSpDb;
    use assert_matches::assert_matches;

    #[test]
    fn test_happy_path_transitions() {
        let events = [
            UploadEvent::FirstByteReceived,
            UploadEvent::PayloadAccepted,
            UploadEvent::ReplicateDispatched {
                global_virtual_group_id: 1,
            },
            UploadEvent::ReplicasSigned {
                secondary_endpoints: vec![],
                secondary_signatures: vec![],
            },
            UploadEvent::SealSubmitted,
            UploadEvent::SealConfirmed,
        ];
        let mut state = TaskState::Init;
        for event in &events {
            state = next_state(state, event).unwrap();
        }
        assert_eq!(state, TaskState::Sealed);
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for state in TaskState::ALL {
            let next = next_state(state, &UploadEvent::failed("timeout"));
            if state.is_terminal() {
                assert!(next.is_err());
            } else {
                assert_eq!(next.unwrap(), TaskState::Failed);
            }
        }
    }

    #[test]
    fn test_out_of_order_event_is_rejected() {
        assert_matches!(
            next_state(TaskState::Init, &UploadEvent::SealConfirmed),
            Err(Error::Internal(_))
        );
        assert!(next_state(TaskState::Uploaded, &UploadEvent::PayloadAccepted).is_err());
    }

    #[tokio::test]
    async fn test_apply_persists_state_and_payload() {
        let db = Arc::new(SqliteSpDb::connect("sqlite::memory:", 1).await.unwrap());
        let machine = UploadStateMachine::new(db);
        machine.begin(9).await.unwrap();
        machine.apply(9, UploadEvent::FirstByteReceived).await.unwrap();
        machine.apply(9, UploadEvent::PayloadAccepted).await.unwrap();
        machine
            .apply(
                9,
                UploadEvent::ReplicateDispatched {
                    global_virtual_group_id: 4,
                },
            )
            .await
            .unwrap();
        let state = machine
            .apply(
                9,
                UploadEvent::ReplicasSigned {
                    secondary_endpoints: vec!["sp1".into(), "sp2".into()],
                    secondary_signatures: vec![vec![1], vec![2]],
                },
            )
            .await
            .unwrap();
        assert_eq!(state, TaskState::Replicated);

        let meta = machine.meta(9).await.unwrap();
        assert_eq!(meta.global_virtual_group_id, 4);
        assert_eq!(meta.secondary_endpoints, vec!["sp1", "sp2"]);
        assert_eq!(meta.secondary_signatures, vec![vec![1], vec![2]]);

        assert_eq!(machine.fail(9, "seal rejected").await.unwrap(), TaskState::Failed);
        assert_eq!(
            machine.state(9).await.unwrap(),
            (TaskState::Failed, "seal rejected".to_string())
        );
        assert!(machine.apply(9, UploadEvent::SealSubmitted).await.is_err());

        machine.finish(9).await.unwrap();
        assert_matches!(machine.state(9).await, Err(Error::NotFound(_)));
    }
}
