//! Greenfield SP Task Orchestration Core
//!
//! Task scheduling, admission and bookkeeping for a storage provider node of
//! a decentralized object-storage network. The crate issues signed approvals
//! for bucket and object creation, receives replicated pieces from primary
//! SPs, tracks upload progress and enforces monthly read quotas.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! requests ─▶│   Approver   │   │   Receiver   │   │ UploadScanner│
//!            └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!                   │ tqueue / rcmgr   │                  │
//!                   ▼                  ▼                  ▼
//!              Consensus/Signer    PieceStore + SpDb     SpDb
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Default collaborator implementations
//! - [`app`] - Base application wiring services together
//! - [`approver`] - Create/migrate approvals with height expiry
//! - [`config`] - TOML configuration and the `Customize` override bag
//! - [`domain`] - Ports for external collaborators
//! - [`error`] - Error types
//! - [`lifecycle`] - Service start/stop with signal handling
//! - [`metrics`] - Prometheus counters and gauges
//! - [`piece`] - Piece keys and sizes
//! - [`rcmgr`] - Resource scopes and limits
//! - [`receiver`] - Secondary-side piece receive pipeline
//! - [`spdb`] - Integrity store, quota ledger and upload progress
//! - [`task`] - Task variants and keys
//! - [`tqueue`] - Bounded task queues
//! - [`upload`] - Upload state machine and scanner

pub mod adapters;
pub mod app;
pub mod approver;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod piece;
pub mod rcmgr;
pub mod receiver;
pub mod spdb;
pub mod task;
pub mod tqueue;
pub mod upload;
pub mod worker;

pub use app::GfSpBaseApp;
pub use config::{Customize, GfSpConfig};
pub use error::{Error, Result};
