//! Synchronization engine for the cirrus client
//!
//! This crate provides the engine that keeps a local directory of files
//! consistent with a multi-tenant cloud file store:
//! - Directory delta computation against the server file index
//! - Download engine with atomic content groups and master-version
//!   invalidation
//! - Upload engine with a staged queue and a two-phase done-uploads commit
//! - Conflict mediation between pending local operations and incoming
//!   server state
//! - The sync orchestrator driving the whole state machine to quiescence
//! - An offline consistency checker and repair tool

pub mod config;
pub mod conflict;
pub mod consistency;
pub mod directory;
pub mod download;
pub mod errors;
pub mod events;
pub mod manager;
pub mod server;
pub mod upload;

pub use config::SyncConfig;
pub use conflict::{
    ConflictManager, ConflictType, ContentConflict, ContentDecision, ContentResolution,
    DeletionConflict, DeletionOutcome, DeletionResolution, SyncConflict,
};
pub use consistency::{ConsistencyChecker, ConsistencyReport, RepairStats};
pub use directory::{Directory, IndexDelta};
pub use download::{DownloadCheckOutcome, DownloadEngine, DownloadStep};
pub use errors::{Result, SyncError};
pub use events::{DownloadedItem, EventMask, SyncDelegate, SyncEvent, SyncStats};
pub use manager::SyncManager;
pub use server::{
    DeletionRequest, DoneUploadsResult, DownloadFileResult, DownloadRequest, DownloadedFile,
    FileIndex, FileInfo, ServerApi, UploadOutcome, UploadRequest,
};
pub use upload::{UploadAttributes, UploadEngine, UploadStep};
