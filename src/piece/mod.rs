//! Piece Addressing
//!
//! Maps `(object, segment, replica, version)` to stable storage keys and
//! computes segment and EC piece sizes. Everything here is pure.
//!
//! The [`PieceOp`] trait exists so a node can swap key layout at build time;
//! [`DefaultPieceOp`] is the layout deployed peers understand.

pub mod key;
pub mod size;

pub use key::{
    challenge_piece_key, ec_piece_key, parse_challenge_idx, parse_ec_piece_key_idx,
    parse_segment_idx, segment_piece_key,
};
pub use size::{ec_piece_size, max_segment_piece_size, segment_piece_count, segment_piece_size};

use crate::error::Result;

/// Key layout and sizing used by the receive and upload paths.
pub trait PieceOp: Send + Sync {
    fn segment_piece_key(&self, object_id: u64, segment_idx: u32, version: i64) -> String {
        key::segment_piece_key(object_id, segment_idx, version)
    }

    fn ec_piece_key(
        &self,
        object_id: u64,
        segment_idx: u32,
        redundancy_idx: u32,
        version: i64,
    ) -> String {
        key::ec_piece_key(object_id, segment_idx, redundancy_idx, version)
    }

    fn challenge_piece_key(
        &self,
        object_id: u64,
        segment_idx: u32,
        redundancy_idx: i32,
        version: i64,
    ) -> String {
        key::challenge_piece_key(object_id, segment_idx, redundancy_idx, version)
    }

    fn max_segment_piece_size(&self, payload_size: u64, max_segment_size: u64) -> i64 {
        size::max_segment_piece_size(payload_size, max_segment_size)
    }

    fn segment_piece_size(&self, payload_size: u64, segment_idx: u32, max_segment_size: u64) -> i64 {
        size::segment_piece_size(payload_size, segment_idx, max_segment_size)
    }

    fn ec_piece_size(
        &self,
        payload_size: u64,
        segment_idx: u32,
        max_segment_size: u64,
        data_chunk_num: u32,
    ) -> i64 {
        size::ec_piece_size(payload_size, segment_idx, max_segment_size, data_chunk_num)
    }

    fn segment_piece_count(&self, payload_size: u64, max_segment_size: u64) -> u32 {
        size::segment_piece_count(payload_size, max_segment_size)
    }

    fn parse_segment_idx(&self, key: &str) -> Result<u32> {
        key::parse_segment_idx(key)
    }

    fn parse_ec_piece_key_idx(&self, key: &str) -> Result<(u32, i32)> {
        key::parse_ec_piece_key_idx(key)
    }

    fn parse_challenge_idx(&self, key: &str) -> Result<(u32, i32)> {
        key::parse_challenge_idx(key)
    }
}

/// Key layout compatible with deployed peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPieceOp;

impl PieceOp for DefaultPieceOp {}
