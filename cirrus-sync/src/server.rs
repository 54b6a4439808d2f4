//! Server request/response contract
//!
//! The network transport is an external collaborator; the engine only sees
//! this trait. A master-version mismatch is an in-band outcome on every
//! state-changing call, never an `Err`: the caller must discard in-flight
//! work and re-absorb server state.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cirrus_store::GoneReason;

use crate::errors::Result;

/// One file's metadata as reported by the server index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    pub file_version: i64,
    pub app_meta_data_version: Option<i64>,
    pub deleted: bool,
    pub gone: Option<GoneReason>,
    pub mime_type: Option<String>,
    pub cloud_storage_type: Option<String>,
}

/// Response to an index check for one sharing group
#[derive(Debug, Clone)]
pub struct FileIndex {
    pub files: Vec<FileInfo>,
    pub master_version: i64,
    pub sharing_group_name: Option<String>,
}

/// Parameters of a single file or app-metadata transfer
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub file_uuid: Uuid,
    pub file_version: i64,
    pub sharing_group_uuid: Uuid,
    pub master_version: i64,
    pub app_meta_data_version: Option<i64>,
}

/// The artifact of a successful transfer
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    /// Where the transport placed the downloaded bytes
    pub local_path: Option<PathBuf>,
    pub app_meta_data: Option<String>,
    pub checksum: Option<String>,
    /// The server detected the cloud contents changed underneath it
    pub contents_changed: bool,
    /// File vanished server-side mid-download; terminal but not an error
    pub gone: Option<GoneReason>,
}

#[derive(Debug, Clone)]
pub enum DownloadFileResult {
    Success(Box<DownloadedFile>),
    MasterVersionUpdate(i64),
}

/// Parameters of a content or app-metadata upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    pub file_version: i64,
    pub master_version: i64,
    pub mime_type: Option<String>,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
    pub local_path: Option<PathBuf>,
    pub checksum: Option<String>,
    /// This upload must also clear a server-side deleted flag
    pub undelete: bool,
}

/// Parameters of an upload-deletion
#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub file_uuid: Uuid,
    pub file_version: i64,
    pub sharing_group_uuid: Uuid,
    pub master_version: i64,
}

#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Success,
    MasterVersionUpdate(i64),
}

#[derive(Debug, Clone)]
pub enum DoneUploadsResult {
    Committed { num_transferred: u32 },
    MasterVersionUpdate(i64),
}

/// The networking collaborator, per sharing group
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Current file index plus server master version
    async fn index(&self, sharing_group: Uuid) -> Result<FileIndex>;

    /// Transfer one file (or its app metadata) under the given master
    /// version
    async fn download_file(&self, request: DownloadRequest) -> Result<DownloadFileResult>;

    async fn upload_file(&self, request: UploadRequest) -> Result<UploadOutcome>;

    async fn upload_app_meta_data(&self, request: UploadRequest) -> Result<UploadOutcome>;

    async fn upload_deletion(&self, request: DeletionRequest) -> Result<UploadOutcome>;

    /// Finalize the staged batch against the master version
    async fn done_uploads(
        &self,
        sharing_group: Uuid,
        master_version: i64,
    ) -> Result<DoneUploadsResult>;
}
