//! Delegate surface: lifecycle events and conflict resolution callbacks

use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use cirrus_store::{DownloadKind, GoneReason};

use crate::conflict::{ContentConflict, DeletionConflict};

/// Opt-in mask controlling which events are delivered to the delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const SYNC_STARTED: EventMask = EventMask(1 << 0);
    pub const SYNC_DONE: EventMask = EventMask(1 << 1);
    pub const GROUP_DOWNLOAD_COMPLETE: EventMask = EventMask(1 << 2);
    pub const GROUP_DOWNLOAD_GONE: EventMask = EventMask(1 << 3);
    pub const DOWNLOAD_DELETIONS_COMPLETE: EventMask = EventMask(1 << 4);
    pub const FILE_UPLOAD_COMPLETE: EventMask = EventMask(1 << 5);
    pub const UPLOAD_DELETION_COMPLETE: EventMask = EventMask(1 << 6);
    pub const UPLOADS_COMPLETED: EventMask = EventMask(1 << 7);

    pub const ALL: EventMask = EventMask(u32::MAX);

    /// Group-level and lifecycle events; per-file counters stay opt-in
    pub const DEFAULT: EventMask = EventMask(
        Self::SYNC_STARTED.0
            | Self::SYNC_DONE.0
            | Self::GROUP_DOWNLOAD_COMPLETE.0
            | Self::GROUP_DOWNLOAD_GONE.0
            | Self::DOWNLOAD_DELETIONS_COMPLETE.0,
    );

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

/// One completed download as surfaced to the consumer
#[derive(Debug, Clone)]
pub struct DownloadedItem {
    pub file_uuid: Uuid,
    pub file_version: i64,
    pub kind: DownloadKind,
    pub local_path: Option<PathBuf>,
    pub app_meta_data: Option<String>,
    pub gone: Option<GoneReason>,
}

/// Counters for one completed sync cycle
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub files_downloaded: usize,
    pub app_meta_data_downloaded: usize,
    pub download_deletions_applied: usize,
    pub files_uploaded: usize,
    pub upload_deletions: usize,
    pub upload_batches_committed: usize,
    pub conflicts_resolved: usize,
    pub master_version_resets: usize,
}

/// Lifecycle and progress events, delivered per the configured mask
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted,
    SyncDone { stats: SyncStats },
    /// A content group finished downloading; delivered before the directory
    /// is updated, so a crash in between duplicates the notification rather
    /// than losing it
    GroupDownloadComplete { items: Vec<DownloadedItem> },
    /// The group's files were removed server-side mid-download
    GroupDownloadGone { items: Vec<DownloadedItem> },
    DownloadDeletionsComplete { file_uuids: Vec<Uuid> },
    FileUploadComplete { file_uuid: Uuid },
    UploadDeletionComplete { file_uuid: Uuid },
    UploadsCompleted { num_transferred: u32 },
}

impl SyncEvent {
    /// The mask bit governing delivery of this event
    pub fn mask(&self) -> EventMask {
        match self {
            SyncEvent::SyncStarted => EventMask::SYNC_STARTED,
            SyncEvent::SyncDone { .. } => EventMask::SYNC_DONE,
            SyncEvent::GroupDownloadComplete { .. } => EventMask::GROUP_DOWNLOAD_COMPLETE,
            SyncEvent::GroupDownloadGone { .. } => EventMask::GROUP_DOWNLOAD_GONE,
            SyncEvent::DownloadDeletionsComplete { .. } => EventMask::DOWNLOAD_DELETIONS_COMPLETE,
            SyncEvent::FileUploadComplete { .. } => EventMask::FILE_UPLOAD_COMPLETE,
            SyncEvent::UploadDeletionComplete { .. } => EventMask::UPLOAD_DELETION_COMPLETE,
            SyncEvent::UploadsCompleted { .. } => EventMask::UPLOADS_COMPLETED,
        }
    }
}

/// The application-side collaborator.
///
/// Conflict callbacks must call `resolve` on every handle before returning;
/// a handle left unresolved is treated as accepting the server side
/// (downloads take priority) and logged as a warning.
#[async_trait]
pub trait SyncDelegate: Send + Sync {
    /// Receive a lifecycle event. Delivery is already filtered by the
    /// configured mask.
    fn event(&self, event: SyncEvent) {
        let _ = event;
    }

    /// A content download collides with pending local operations on the
    /// same file
    async fn resolve_content_download_conflict(&self, conflict: Arc<ContentConflict>) {
        let _ = conflict;
    }

    /// A batch of download-deletions collides with pending content uploads
    async fn resolve_download_deletion_conflicts(&self, conflicts: Vec<Arc<DeletionConflict>>) {
        let _ = conflicts;
    }
}
