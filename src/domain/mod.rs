//! Domain Layer
//!
//! Ports the orchestration core depends on. Concrete implementations live in
//! [`crate::adapters`] or are supplied by the embedding node.
//!
//! # Usage
//!
//! ```ignore
//! use gfsp_core::domain::ports::{Consensus, PieceStore};
//!
//! async fn store<P: PieceStore + ?Sized>(store: &P, key: &str, data: Bytes) -> Result<()> {
//!     store.put_piece(key, data).await
//! }
//! ```

pub mod ports;

pub use ports::{
    BucketCounter, BucketInfo, Consensus, PieceStore, Signer, SpInfo, SpStatus, SpStoragePrice,
    TaskReporter,
};
