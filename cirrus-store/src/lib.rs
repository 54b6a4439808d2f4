//! Transactional local record store for the cirrus sync engine
//!
//! Holds the authoritative local mirror of server file metadata plus every
//! pending download/upload tracker, and survives process restarts: trackers
//! left mid-transfer by a crash are reset on open.

pub mod errors;
pub mod records;
pub mod schema;
pub mod store;

pub use errors::{Result, StoreError};
pub use records::{
    DirectoryEntry, DownloadContentGroup, DownloadFileTracker, DownloadKind, DownloadStatus,
    GoneReason, GroupStatus, QueueState, SharingEntry, UploadFileTracker, UploadKind, UploadQueue,
    UploadStatus,
};
pub use store::{AsyncRecordStore, NewDownload, NewUpload, RecordStore};
