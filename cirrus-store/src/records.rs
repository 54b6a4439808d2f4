//! Record types held by the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal server-side state for a file that is permanently
/// removed or inaccessible, distinct from a normal delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoneReason {
    /// The underlying cloud storage object was removed or renamed
    FileRemovedOrRenamed,
    /// The owning user account was removed
    UserRemoved,
    /// Cloud storage credentials expired or were revoked
    AuthTokenExpiredOrRevoked,
}

impl GoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoneReason::FileRemovedOrRenamed => "fileRemovedOrRenamed",
            GoneReason::UserRemoved => "userRemoved",
            GoneReason::AuthTokenExpiredOrRevoked => "authTokenExpiredOrRevoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fileRemovedOrRenamed" => Some(GoneReason::FileRemovedOrRenamed),
            "userRemoved" => Some(GoneReason::UserRemoved),
            "authTokenExpiredOrRevoked" => Some(GoneReason::AuthTokenExpiredOrRevoked),
            _ => None,
        }
    }
}

/// Authoritative local mirror of one server file's metadata.
///
/// Every file known to the server index has exactly one entry. An entry is
/// created on first encounter with a server file or on first local upload,
/// and is never physically deleted outside explicit repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub file_uuid: Uuid,
    /// Immutable once set for a given file
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    /// Monotonic per file; `None` until the first confirmed download or
    /// upload commit
    pub file_version: Option<i64>,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: Option<String>,
    pub cloud_storage_type: Option<String>,
    pub deleted_locally: bool,
    pub deleted_on_server: bool,
    pub gone: Option<GoneReason>,
    /// When set, the next index check classifies this file as a content
    /// download regardless of version comparison
    pub force_download: bool,
    pub updated_at: DateTime<Utc>,
}

impl DirectoryEntry {
    pub fn new(file_uuid: Uuid, sharing_group_uuid: Uuid) -> Self {
        Self {
            file_uuid,
            file_group_uuid: None,
            sharing_group_uuid,
            file_version: None,
            app_meta_data: None,
            app_meta_data_version: None,
            mime_type: None,
            cloud_storage_type: None,
            deleted_locally: false,
            deleted_on_server: false,
            gone: None,
            force_download: false,
            updated_at: Utc::now(),
        }
    }
}

/// What a download tracker is fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadKind {
    File,
    AppMetaData,
    Deletion,
}

impl DownloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadKind::File => "file",
            DownloadKind::AppMetaData => "appMetaData",
            DownloadKind::Deletion => "deletion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(DownloadKind::File),
            "appMetaData" => Some(DownloadKind::AppMetaData),
            "deletion" => Some(DownloadKind::Deletion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    NotStarted,
    Downloading,
    Downloaded,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::NotStarted => "notStarted",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notStarted" => Some(DownloadStatus::NotStarted),
            "downloading" => Some(DownloadStatus::Downloading),
            "downloaded" => Some(DownloadStatus::Downloaded),
            _ => None,
        }
    }
}

/// An in-flight or queued download unit for one file.
///
/// Created in bulk when an index check reveals pending work, removed when the
/// owning content group completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFileTracker {
    pub id: i64,
    pub file_uuid: Uuid,
    pub file_version: i64,
    pub sharing_group_uuid: Uuid,
    /// Owning content group key: the file group UUID, or the file UUID for
    /// ungrouped files
    pub group_key: Uuid,
    pub kind: DownloadKind,
    pub status: DownloadStatus,
    pub gone: Option<GoneReason>,
    pub contents_changed_on_server: bool,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: Option<String>,
    pub cloud_storage_type: Option<String>,
    /// Location of the downloaded artifact, set on success
    pub local_path: Option<String>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DownloadFileTracker {
    /// Terminal means downloaded, or gone (the file vanished server-side,
    /// which is expected and not an error)
    pub fn is_terminal(&self) -> bool {
        self.status == DownloadStatus::Downloaded || self.gone.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    NotStarted,
    Downloading,
    Downloaded,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::NotStarted => "notStarted",
            GroupStatus::Downloading => "downloading",
            GroupStatus::Downloaded => "downloaded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notStarted" => Some(GroupStatus::NotStarted),
            "downloading" => Some(GroupStatus::Downloading),
            "downloaded" => Some(GroupStatus::Downloaded),
            _ => None,
        }
    }
}

/// Unit of atomicity for multi-file downloads sharing a file group UUID.
///
/// A group is surfaced to the consumer, and its trackers removed, only when
/// all of its trackers are terminal. Partial group completion is never
/// visible externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadContentGroup {
    pub group_key: Uuid,
    pub sharing_group_uuid: Uuid,
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadKind {
    File,
    AppMetaData,
    Deletion,
    SharingGroup,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::File => "file",
            UploadKind::AppMetaData => "appMetaData",
            UploadKind::Deletion => "deletion",
            UploadKind::SharingGroup => "sharingGroup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(UploadKind::File),
            "appMetaData" => Some(UploadKind::AppMetaData),
            "deletion" => Some(UploadKind::Deletion),
            "sharingGroup" => Some(UploadKind::SharingGroup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    NotStarted,
    Uploading,
    Uploaded,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::NotStarted => "notStarted",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notStarted" => Some(UploadStatus::NotStarted),
            "uploading" => Some(UploadStatus::Uploading),
            "uploaded" => Some(UploadStatus::Uploaded),
            _ => None,
        }
    }
}

/// A queued local mutation: content upload, app-metadata-only upload, or
/// deletion.
///
/// The row id doubles as the insertion-order age used for undeletion
/// tie-breaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileTracker {
    pub id: i64,
    pub queue_id: i64,
    pub file_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    pub kind: UploadKind,
    pub status: UploadStatus,
    /// Provisionally assigned at staging for content uploads; left
    /// unresolved for deletions until commit time
    pub file_version: Option<i64>,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: Option<String>,
    pub local_path: Option<String>,
    pub checksum: Option<String>,
    /// Set by conflict resolution: this upload must also clear a
    /// server-side deleted flag
    pub upload_undeletion: bool,
    pub created_at: DateTime<Utc>,
}

impl UploadFileTracker {
    /// Insertion-order age; lower is older
    pub fn age(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    /// Currently being appended to by the client API
    PendingSync,
    /// Handed to the commit path; processed FIFO, oldest first
    Synced,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::PendingSync => "pendingSync",
            QueueState::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pendingSync" => Some(QueueState::PendingSync),
            "synced" => Some(QueueState::Synced),
            _ => None,
        }
    }
}

/// An ordered batch of upload trackers corresponding to one sync-cycle
/// commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadQueue {
    pub id: i64,
    pub state: QueueState,
    pub created_at: DateTime<Utc>,
}

/// Local mirror of a sharing group's server state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingEntry {
    pub sharing_group_uuid: Uuid,
    pub name: Option<String>,
    /// Per-sharing-group optimistic-concurrency token. The client presents
    /// this value on every index check and state-changing call.
    pub master_version: i64,
    pub deleted_on_server: bool,
    pub removed_from_group: bool,
    pub sync_needed: bool,
    pub updated_at: DateTime<Utc>,
}

impl SharingEntry {
    pub fn new(sharing_group_uuid: Uuid) -> Self {
        Self {
            sharing_group_uuid,
            name: None,
            master_version: 0,
            deleted_on_server: false,
            removed_from_group: false,
            sync_needed: false,
            updated_at: Utc::now(),
        }
    }
}
