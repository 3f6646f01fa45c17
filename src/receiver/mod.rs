//! Receive Pipeline
//!
//! Secondary-side handling of pieces replicated by a primary SP. Each piece
//! is verified, its checksum staged and its bytes stored; once every piece
//! of a replica arrived, the staged checksums are committed as the replica's
//! integrity record and signed.
//!
//! A receive task occupies the receive queue only while its handler runs,
//! so the queue serializes concurrent deliveries of the same piece.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::ports::{PieceStore, Signer, TaskReporter};
use crate::error::{Error, Result};
use crate::lifecycle::Service;
use crate::metrics;
use crate::piece::PieceOp;
use crate::rcmgr::{ResourceManager, ResourceScope};
use crate::spdb::{IntegrityMeta, SpDb};
use crate::task::{ObjectInfo, ReceivePiece, RedundancyType, StorageParams, TKey, Task, TaskKind};
use crate::tqueue::{scan_tqueue_by_sub_key, NewTQueue, TQueue};

pub const RECEIVER_SERVICE_NAME: &str = "receiver";

const RECEIVE_QUEUE_NAME: &str = "receiver-piece";

pub struct ReceiverDeps {
    pub db: Arc<dyn SpDb>,
    pub piece_store: Arc<dyn PieceStore>,
    pub piece_op: Arc<dyn PieceOp>,
    pub signer: Arc<dyn Signer>,
    pub reporter: Arc<dyn TaskReporter>,
    pub queue_factory: NewTQueue,
    pub rcmgr: Arc<dyn ResourceManager>,
}

pub struct Receiver {
    queue: Arc<dyn TQueue>,
    scope: ResourceScope,
    db: Arc<dyn SpDb>,
    piece_store: Arc<dyn PieceStore>,
    piece_op: Arc<dyn PieceOp>,
    signer: Arc<dyn Signer>,
    reporter: Arc<dyn TaskReporter>,
}

/// Removes the task from the receive queue when the handler returns.
struct QueueSlot<'a> {
    queue: &'a dyn TQueue,
    key: TKey,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queue.pop_by_key(&self.key);
    }
}

fn receive_parts(task: &Task) -> Result<(&ReceivePiece, &ObjectInfo)> {
    match task.kind() {
        TaskKind::Receive(piece) => match &piece.object {
            Some(object) => Ok((piece, object)),
            None => Err(Error::DanglingPointer("receive task object".into())),
        },
        _ => Err(Error::DanglingPointer("receive task".into())),
    }
}

pub fn piece_checksum(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

impl Receiver {
    pub fn new(receive_parallel: usize, deps: ReceiverDeps) -> Result<Self> {
        let scope = deps.rcmgr.open_service(RECEIVER_SERVICE_NAME)?;
        Ok(Self {
            queue: (deps.queue_factory)(RECEIVE_QUEUE_NAME, receive_parallel),
            scope,
            db: deps.db,
            piece_store: deps.piece_store,
            piece_op: deps.piece_op,
            signer: deps.signer,
            reporter: deps.reporter,
        })
    }

    /// Verifies and stores one piece of a replica.
    #[instrument(skip_all, fields(task = %task.key(), size = data.len()))]
    pub async fn handle_receive_piece_task(&self, task: &mut Task, data: Bytes) -> Result<()> {
        let result = self.receive_piece(task, data).await;
        task.set_error(result.as_ref().err());
        match &result {
            Ok(()) => {
                metrics::inc_receive("piece", "ok");
                debug!("piece received");
            }
            Err(e) => {
                metrics::inc_receive("piece", &e.kind().to_string());
                warn!(error = %e, "failed to receive piece");
            }
        }
        result
    }

    async fn receive_piece(&self, task: &Task, data: Bytes) -> Result<()> {
        let (piece, object) = receive_parts(task)?;
        let key = task.key();
        if self.queue.has(&key) {
            return Err(Error::RepeatedTask(key.to_string()));
        }
        let span = self.scope.begin_span()?;
        span.reserve_resources(&task.estimate_limit().to_scope_stat())?;
        self.queue.push(task.clone())?;
        let _slot = QueueSlot {
            queue: self.queue.as_ref(),
            key,
        };

        let piece_key = self.piece_key(piece, object)?;
        if piece_checksum(&data) != piece.piece_checksum {
            return Err(Error::InvalidDataChecksum { key: piece_key });
        }
        self.stage_checksum(piece, object).await?;
        self.piece_store
            .put_piece(&piece_key, data)
            .await
            .map_err(|e| match e {
                Error::PieceStore(_) => e,
                other => Error::PieceStore(other.to_string()),
            })
    }

    /// A checksum already staged by an earlier delivery of the same piece is
    /// accepted when it matches, so a delivery whose store write failed can
    /// be retried.
    async fn stage_checksum(&self, piece: &ReceivePiece, object: &ObjectInfo) -> Result<()> {
        let staged = self
            .db
            .set_replicate_piece_checksum(
                object.id,
                piece.redundancy_idx,
                piece.segment_idx,
                &piece.piece_checksum,
            )
            .await;
        match staged {
            Ok(()) => Ok(()),
            Err(Error::Duplicate(_)) => {
                let existing = self
                    .db
                    .get_replicate_piece_checksum(object.id, piece.redundancy_idx, piece.segment_idx)
                    .await
                    .map_err(|e| Error::GfSpDb(format!("failed to load staged checksum: {}", e)))?;
                if existing == piece.piece_checksum {
                    debug!("piece checksum already staged");
                    Ok(())
                } else {
                    Err(Error::GfSpDb(format!(
                        "piece checksum of segment {} already staged with a different value",
                        piece.segment_idx
                    )))
                }
            }
            Err(e) => Err(Error::GfSpDb(format!("failed to stage piece checksum: {}", e))),
        }
    }

    fn piece_key(&self, piece: &ReceivePiece, object: &ObjectInfo) -> Result<String> {
        match object.redundancy_type {
            RedundancyType::ErasureCode => {
                let redundancy_idx = u32::try_from(piece.redundancy_idx).map_err(|_| {
                    Error::InvalidKeyFormat(format!(
                        "negative redundancy index {}",
                        piece.redundancy_idx
                    ))
                })?;
                Ok(self
                    .piece_op
                    .ec_piece_key(object.id, piece.segment_idx, redundancy_idx, object.version))
            }
            RedundancyType::Replica => Ok(self
                .piece_op
                .segment_piece_key(object.id, piece.segment_idx, object.version)),
        }
    }

    /// Commits the staged checksums of a replica once all of them arrived.
    /// Returns `(integrity, signature)`.
    #[instrument(skip_all, fields(task = %task.key()))]
    pub async fn handle_done_receive_piece_task(&self, task: &mut Task) -> Result<(Vec<u8>, Vec<u8>)> {
        let result = self.done_receive(task).await;
        match &result {
            Ok(_) => {
                task.set_error(None);
                metrics::inc_receive("done", "ok");
                if let Err(e) = self.reporter.report_task(task).await {
                    warn!(error = %e, "failed to report receive task");
                }
                info!("replica integrity committed");
            }
            Err(e) => {
                task.set_error(Some(e));
                metrics::inc_receive("done", &e.kind().to_string());
                warn!(error = %e, "failed to finish receive task");
            }
        }
        result
    }

    async fn done_receive(&self, task: &Task) -> Result<(Vec<u8>, Vec<u8>)> {
        let (piece, object) = receive_parts(task)?;
        let params: StorageParams = piece
            .params
            .ok_or_else(|| Error::DanglingPointer("receive task storage params".into()))?;
        let key = task.key();
        let span = self.scope.begin_span()?;
        span.reserve_resources(&task.estimate_limit().to_scope_stat())?;
        self.queue.push(task.clone())?;
        let _slot = QueueSlot {
            queue: self.queue.as_ref(),
            key,
        };

        let segment_count = self
            .piece_op
            .segment_piece_count(object.payload_size, params.max_segment_size);
        let checksums = self
            .db
            .get_all_replicate_piece_checksum(object.id, piece.redundancy_idx, segment_count)
            .await
            .map_err(|e| Error::GfSpDb(format!("failed to load piece checksums: {}", e)))?;
        if checksums.len() != segment_count as usize {
            return Err(Error::UnfinishedTask {
                expected: segment_count,
                actual: checksums.len(),
            });
        }

        let (signature, integrity) = self
            .signer
            .sign_integrity_hash(object.id, &checksums)
            .await
            .map_err(|e| match e {
                Error::Signer(_) => e,
                other => Error::Signer(other.to_string()),
            })?;
        let meta = IntegrityMeta {
            object_id: object.id,
            redundancy_index: piece.redundancy_idx,
            integrity_checksum: integrity.clone(),
            piece_checksum_list: checksums,
            signature: signature.clone(),
        };
        self.db
            .set_object_integrity(&meta)
            .await
            .map_err(|e| Error::GfSpDb(format!("failed to write integrity meta: {}", e)))?;
        if let Err(e) = self
            .db
            .delete_all_replicate_piece_checksum(object.id, piece.redundancy_idx, segment_count)
            .await
        {
            warn!(error = %e, "failed to clear staged checksums");
        }
        Ok((integrity, signature))
    }

    /// In-flight receive tasks whose key contains `sub_key`.
    pub fn query_tasks(&self, sub_key: &str) -> Vec<Task> {
        scan_tqueue_by_sub_key(self.queue.as_ref(), sub_key)
    }

    pub fn queue(&self) -> &Arc<dyn TQueue> {
        &self.queue
    }
}

#[async_trait]
impl Service for Receiver {
    fn name(&self) -> &str {
        RECEIVER_SERVICE_NAME
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        info!(cap = self.queue.cap(), "receiver ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.queue.is_empty() {
            warn!(in_flight = self.queue.len(), "receiver stopping with tasks in flight");
        }
        self.scope.release();
        Ok(())
    }
}
