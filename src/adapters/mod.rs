//! Infrastructure Adapters
//!
//! Development and test implementations of the ports in
//! [`crate::domain::ports`]. Production nodes replace the chain, signer and
//! storage adapters with real clients through [`crate::config::Customize`].
//!
//! | Port            | Adapters                                   |
//! |-----------------|--------------------------------------------|
//! | `Consensus`     | [`StaticConsensus`]                        |
//! | `BucketCounter` | [`StaticConsensus`]                        |
//! | `PieceStore`    | [`InMemoryPieceStore`], [`LocalFsPieceStore`] |
//! | `Signer`        | [`DigestSigner`]                           |
//! | `TaskReporter`  | [`LoggingTaskReporter`], [`InMemoryTaskReporter`] |
//!
//! # Usage
//!
//! ```ignore
//! use gfsp_core::adapters::{InMemoryPieceStore, StaticConsensus};
//! use gfsp_core::domain::ports::Consensus;
//!
//! let chain = StaticConsensus::new(100);
//! let height = chain.current_height().await?;
//! ```

mod consensus;
mod piece_store;
mod signer;
mod task_reporter;

pub use consensus::StaticConsensus;
pub use piece_store::{InMemoryPieceStore, LocalFsPieceStore};
pub use signer::{integrity_hash, DigestSigner};
pub use task_reporter::{InMemoryTaskReporter, LoggingTaskReporter};
