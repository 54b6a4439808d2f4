//! Local mirror of server file metadata
//!
//! Computes the delta between a server file index and local state, and
//! applies post-download and post-deletion updates. All functions run inside
//! a caller-held store lock; classification itself mutates nothing beyond
//! the one-time migration backfills.

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use cirrus_store::{
    DirectoryEntry, DownloadFileTracker, DownloadKind, RecordStore,
};

use crate::errors::{Result, SyncError};
use crate::server::FileInfo;

/// Classification of one index check: what needs downloading
#[derive(Debug, Clone, Default)]
pub struct IndexDelta {
    /// Content downloads, including download-and-undelete cases
    pub downloads: Vec<FileInfo>,
    /// Server-side deletions to absorb
    pub deletions: Vec<FileInfo>,
    /// App-metadata-only downloads (file version already current)
    pub app_meta_data: Vec<FileInfo>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.deletions.is_empty() && self.app_meta_data.is_empty()
    }
}

pub struct Directory;

impl Directory {
    /// Compare the server index against local entries and classify pending
    /// work.
    ///
    /// Running this twice with the same index and no intervening downloads
    /// yields the same classification: the only side effects are one-time
    /// migration backfills and tombstone creation for files already deleted
    /// server-side.
    pub fn check_file_index(store: &mut RecordStore, index: &[FileInfo]) -> Result<IndexDelta> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        for info in index {
            // Multiple versions of one file in a single index are
            // unsupported; encountering them is a programming-invariant
            // violation, not recoverable state
            if !seen.insert(info.file_uuid) {
                return Err(SyncError::Invariant(format!(
                    "server index lists {} more than once",
                    info.file_uuid
                )));
            }
        }

        let mut delta = IndexDelta::default();
        for info in index {
            let existing = store.entry(&info.file_uuid)?;
            match existing {
                None => {
                    if info.deleted {
                        // Never seen locally and already deleted upstream:
                        // record the tombstone, nothing to do or report
                        let mut entry =
                            DirectoryEntry::new(info.file_uuid, info.sharing_group_uuid);
                        entry.file_group_uuid = info.file_group_uuid;
                        entry.file_version = Some(info.file_version);
                        entry.mime_type = info.mime_type.clone();
                        entry.cloud_storage_type = info.cloud_storage_type.clone();
                        entry.deleted_locally = true;
                        entry.deleted_on_server = true;
                        store.upsert_entry(&entry)?;
                        debug!(file_uuid = %info.file_uuid, "Created tombstone entry");
                    } else {
                        delta.downloads.push(info.clone());
                    }
                }
                Some(mut entry) => {
                    Self::migrate_entry(store, &mut entry, info)?;

                    if entry.deleted_locally {
                        if !info.deleted {
                            // Restored upstream: download and undelete
                            delta.downloads.push(info.clone());
                        }
                    } else if info.deleted {
                        // Already absorbed (a kept local upload won a prior
                        // deletion conflict): do not re-trigger
                        if !entry.deleted_on_server {
                            delta.deletions.push(info.clone());
                        }
                    } else if entry.force_download {
                        delta.downloads.push(info.clone());
                    } else if entry.file_version != Some(info.file_version) {
                        delta.downloads.push(info.clone());
                    } else if entry.app_meta_data_version != info.app_meta_data_version
                        && info.app_meta_data_version.is_some()
                    {
                        delta.app_meta_data.push(info.clone());
                    }
                }
            }
        }
        Ok(delta)
    }

    /// Unconditional migration backfills for fields older clients never
    /// stored
    fn migrate_entry(
        store: &mut RecordStore,
        entry: &mut DirectoryEntry,
        info: &FileInfo,
    ) -> Result<()> {
        let mut changed = false;

        if entry.file_group_uuid.is_none() && info.file_group_uuid.is_some() {
            entry.file_group_uuid = info.file_group_uuid;
            changed = true;
        }

        if entry.mime_type.is_none() && info.mime_type.is_some() {
            entry.mime_type = info.mime_type.clone();
            changed = true;
        }

        if entry.cloud_storage_type.is_none() {
            match &info.cloud_storage_type {
                Some(storage) => {
                    entry.cloud_storage_type = Some(storage.clone());
                    changed = true;
                }
                None => {
                    return Err(SyncError::DataIntegrity(format!(
                        "server omitted cloud storage type needed to migrate {}",
                        info.file_uuid
                    )));
                }
            }
        }

        if changed {
            store.upsert_entry(entry)?;
        }
        Ok(())
    }

    /// Apply a content group's confirmed downloads to the directory.
    ///
    /// Called only after the whole group completed and conflicts were
    /// resolved, and after the consumer was informed.
    pub fn update_after_downloading(
        store: &mut RecordStore,
        trackers: &[DownloadFileTracker],
    ) -> Result<()> {
        for tracker in trackers {
            if tracker.kind == DownloadKind::Deletion {
                continue;
            }

            let mut entry = match store.entry(&tracker.file_uuid)? {
                Some(entry) => entry,
                None => DirectoryEntry::new(tracker.file_uuid, tracker.sharing_group_uuid),
            };

            if let Some(reason) = tracker.gone {
                entry.gone = Some(reason);
                store.upsert_entry(&entry)?;
                continue;
            }

            if entry.file_group_uuid.is_none() && tracker.group_key != tracker.file_uuid {
                entry.file_group_uuid = Some(tracker.group_key);
            }

            if tracker.kind == DownloadKind::File {
                entry.file_version = Some(tracker.file_version);
                entry.gone = None;
            }

            if entry.deleted_locally {
                // This download represents an undelete
                entry.deleted_locally = false;
                entry.deleted_on_server = false;
            }

            match (&entry.mime_type, &tracker.mime_type) {
                (Some(local), Some(incoming)) if local != incoming => {
                    // Reportable client error, not fatal
                    warn!(
                        file_uuid = %tracker.file_uuid,
                        local = %local,
                        incoming = %incoming,
                        "Mime type changed across download"
                    );
                    entry.mime_type = Some(incoming.clone());
                }
                (None, Some(incoming)) => entry.mime_type = Some(incoming.clone()),
                _ => {}
            }

            if entry.cloud_storage_type.is_none() {
                entry.cloud_storage_type = tracker.cloud_storage_type.clone();
            }

            // Null app metadata means "not intended to change"
            if tracker.app_meta_data.is_some() {
                entry.app_meta_data = tracker.app_meta_data.clone();
                entry.app_meta_data_version = tracker.app_meta_data_version;
            }

            entry.force_download = false;
            store.upsert_entry(&entry)?;
        }
        Ok(())
    }

    /// Record the server version of a download discarded by conflict
    /// resolution (local operations won).
    ///
    /// Local content is untouched; only the version bookkeeping advances, so
    /// the next index check does not re-trigger the same download while the
    /// kept local upload is still queued.
    pub fn note_discarded_download(
        store: &mut RecordStore,
        tracker: &DownloadFileTracker,
    ) -> Result<()> {
        if let Some(mut entry) = store.entry(&tracker.file_uuid)? {
            match tracker.kind {
                DownloadKind::File => entry.file_version = Some(tracker.file_version),
                DownloadKind::AppMetaData => {
                    entry.app_meta_data_version = tracker.app_meta_data_version
                }
                DownloadKind::Deletion => {}
            }
            store.upsert_entry(&entry)?;
        }
        Ok(())
    }

    /// Absorb confirmed download-deletions, and mark entries for files whose
    /// local uploads won instead.
    ///
    /// Kept files get `deleted_on_server` without `deleted_locally`, so the
    /// next index check does not re-trigger the deletion.
    pub fn update_after_download_deleting_files(
        store: &mut RecordStore,
        confirmed: &[Uuid],
        kept_undeletions: &[Uuid],
    ) -> Result<()> {
        for file_uuid in confirmed {
            if let Some(mut entry) = store.entry(file_uuid)? {
                entry.deleted_locally = true;
                entry.deleted_on_server = true;
                store.upsert_entry(&entry)?;
            }
        }

        for file_uuid in kept_undeletions {
            if let Some(mut entry) = store.entry(file_uuid)? {
                entry.deleted_on_server = true;
                store.upsert_entry(&entry)?;
            }
        }
        Ok(())
    }
}
