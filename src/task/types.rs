//! Chain-side value types carried by tasks

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// How an object's payload is spread across secondary SPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RedundancyType {
    #[default]
    ErasureCode,
    Replica,
}

/// Object metadata as recorded on chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: u64,
    pub bucket_name: String,
    pub object_name: String,
    pub owner: String,
    pub payload_size: u64,
    /// Integrity roots: primary first, then one per secondary.
    pub checksums: Vec<Vec<u8>>,
    pub redundancy_type: RedundancyType,
    pub version: i64,
}

/// Versioned storage parameters of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageParams {
    pub max_segment_size: u64,
    pub redundant_data_chunk_num: u32,
    pub redundant_parity_chunk_num: u32,
    pub max_payload_size: u64,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            max_segment_size: 16 * 1024 * 1024,
            redundant_data_chunk_num: 4,
            redundant_parity_chunk_num: 2,
            max_payload_size: 64 * 1024 * 1024 * 1024,
        }
    }
}

impl StorageParams {
    pub fn segment_count(&self, payload_size: u64) -> u32 {
        crate::piece::segment_piece_count(payload_size, self.max_segment_size)
    }

    pub fn total_chunk_num(&self) -> u32 {
        self.redundant_data_chunk_num + self.redundant_parity_chunk_num
    }
}

/// Height-bounded approval installed on a message by the primary SP.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Approval {
    pub expired_height: u64,
    pub global_virtual_group_family_id: u32,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgCreateBucket {
    pub creator: String,
    pub bucket_name: String,
    pub payment_address: String,
    pub primary_sp_address: String,
    pub charged_read_quota: u64,
    pub primary_sp_approval: Approval,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgCreateObject {
    pub creator: String,
    pub bucket_name: String,
    pub object_name: String,
    pub payload_size: u64,
    pub content_type: String,
    pub expect_checksums: Vec<Vec<u8>>,
    pub redundancy_type: RedundancyType,
    pub primary_sp_approval: Approval,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgMigrateBucket {
    pub operator: String,
    pub bucket_name: String,
    pub dst_primary_sp_id: u32,
    pub dst_primary_sp_approval: Approval,
}

/// Bytes a signer signs for an approval message: its JSON form with the
/// approval signature cleared.
pub trait ApprovalMsg: Serialize + Clone {
    fn approval(&self) -> &Approval;
    fn approval_mut(&mut self) -> &mut Approval;

    fn sign_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.approval_mut().sig.clear();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Stable digest of the message, taken before any approval is installed.
    fn fingerprint(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        *unsigned.approval_mut() = Approval::default();
        let bytes = serde_json::to_vec(&unsigned).unwrap_or_default();
        Sha256::digest(&bytes).to_vec()
    }
}

impl ApprovalMsg for MsgCreateBucket {
    fn approval(&self) -> &Approval {
        &self.primary_sp_approval
    }

    fn approval_mut(&mut self) -> &mut Approval {
        &mut self.primary_sp_approval
    }
}

impl ApprovalMsg for MsgCreateObject {
    fn approval(&self) -> &Approval {
        &self.primary_sp_approval
    }

    fn approval_mut(&mut self) -> &mut Approval {
        &mut self.primary_sp_approval
    }
}

impl ApprovalMsg for MsgMigrateBucket {
    fn approval(&self) -> &Approval {
        &self.dst_primary_sp_approval
    }

    fn approval_mut(&mut self) -> &mut Approval {
        &mut self.dst_primary_sp_approval
    }
}
