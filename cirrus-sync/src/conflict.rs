//! Conflict detection and mediation
//!
//! Downloads take priority over uploads: every conflict is "the server wants
//! to push X, the client has a pending local operation on the same file".
//! The engine classifies the collision, hands resolve-once handles to the
//! external policy, and applies the chosen resolution transactionally before
//! anything is surfaced to the consumer.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use cirrus_store::{AsyncRecordStore, DownloadFileTracker, UploadFileTracker, UploadKind};

use crate::errors::{Result, SyncError};
use crate::events::SyncDelegate;

/// How a pending local operation collides with incoming server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// Pending content upload(s) only
    FileUpload,
    /// Pending upload-deletion(s) only
    UploadDeletion,
    /// Both content upload(s) and upload-deletion(s)
    BothFileUploadAndDeletion,
}

/// Resolution choices for a content-download conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentResolution {
    /// Drop the local operations, accept the download
    DeleteConflictingClientOperations,
    /// Keep the local operations, discard the download
    KeepConflictingClientOperations,
    /// Drop the local operations and disregard the download too.
    /// The source semantics here are a fallthrough; treated as "drop local,
    /// then reject the download" pending product clarification.
    UseNeitherClientNorDownload,
}

/// Resolution choices for a download-deletion conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionResolution {
    /// Drop the local content uploads; the deletion proceeds
    AcceptDownloadDeletion,
    /// Keep the content uploads; the oldest becomes an upload-undeletion
    RejectDownloadDeletion,
}

/// A resolve-once conflict handle given to the external policy.
///
/// Resolving twice is a programming error and fails.
#[derive(Debug)]
pub struct SyncConflict<R> {
    pub file_uuid: Uuid,
    pub conflict_type: ConflictType,
    resolution: Mutex<Option<R>>,
}

impl<R: Copy> SyncConflict<R> {
    fn new(file_uuid: Uuid, conflict_type: ConflictType) -> Self {
        Self {
            file_uuid,
            conflict_type,
            resolution: Mutex::new(None),
        }
    }

    pub fn resolve(&self, resolution: R) -> Result<()> {
        let mut slot = self.resolution.lock().expect("conflict lock poisoned");
        if slot.is_some() {
            return Err(SyncError::Invariant(format!(
                "conflict for {} resolved twice",
                self.file_uuid
            )));
        }
        *slot = Some(resolution);
        Ok(())
    }

    pub fn resolution(&self) -> Option<R> {
        *self.resolution.lock().expect("conflict lock poisoned")
    }
}

pub type ContentConflict = SyncConflict<ContentResolution>;
pub type DeletionConflict = SyncConflict<DeletionResolution>;

/// Whether a downloaded file should be applied to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDecision {
    ApplyDownload,
    DiscardDownload,
}

/// Outcome of a batch of download-deletion conflicts
#[derive(Debug, Clone, Default)]
pub struct DeletionOutcome {
    /// Deletions to apply locally
    pub confirmed: Vec<Uuid>,
    /// Files whose local uploads won; their entries are marked
    /// deleted-on-server without deleting locally
    pub kept_undeletions: Vec<Uuid>,
    /// How many collisions were routed through the policy
    pub conflicts_resolved: usize,
}

fn is_content_upload(u: &UploadFileTracker) -> bool {
    matches!(u.kind, UploadKind::File | UploadKind::AppMetaData)
}

fn is_upload_deletion(u: &UploadFileTracker) -> bool {
    u.kind == UploadKind::Deletion
}

/// Mediates between pending local operations and incoming server state.
///
/// Never owns records: reads and mutates them transactionally, then hands
/// control back.
pub struct ConflictManager {
    store: AsyncRecordStore,
    delegate: Arc<dyn SyncDelegate>,
}

impl ConflictManager {
    pub fn new(store: AsyncRecordStore, delegate: Arc<dyn SyncDelegate>) -> Self {
        Self { store, delegate }
    }

    /// Adjudicate a single downloaded file against pending local uploads.
    ///
    /// With no pending operations the download proceeds immediately; no
    /// policy callback fires.
    pub async fn handle_file_download_conflict(
        &self,
        tracker: &DownloadFileTracker,
    ) -> Result<(ContentDecision, bool)> {
        let file_uuid = tracker.file_uuid;
        let pending = self
            .store
            .inspect(|s| -> Result<Vec<UploadFileTracker>> { Ok(s.uploads_for_file(&file_uuid)?) })
            .await?;

        let uploads: Vec<&UploadFileTracker> =
            pending.iter().filter(|u| is_content_upload(u)).collect();
        let deletions: Vec<&UploadFileTracker> =
            pending.iter().filter(|u| is_upload_deletion(u)).collect();

        let conflict_type = match (!uploads.is_empty(), !deletions.is_empty()) {
            (false, false) => return Ok((ContentDecision::ApplyDownload, false)),
            (true, true) => ConflictType::BothFileUploadAndDeletion,
            (false, true) => ConflictType::UploadDeletion,
            (true, false) => ConflictType::FileUpload,
        };

        debug!(%file_uuid, ?conflict_type, "Content download conflict");
        let conflict = Arc::new(ContentConflict::new(file_uuid, conflict_type));
        self.delegate
            .resolve_content_download_conflict(Arc::clone(&conflict))
            .await;

        let resolution = conflict.resolution().unwrap_or_else(|| {
            warn!(%file_uuid, "Content conflict left unresolved; accepting download");
            ContentResolution::DeleteConflictingClientOperations
        });

        let conflicting_ids: Vec<i64> = pending.iter().map(|u| u.id).collect();
        let decision = match resolution {
            ContentResolution::DeleteConflictingClientOperations => {
                self.remove_uploads(&conflicting_ids).await?;
                ContentDecision::ApplyDownload
            }
            ContentResolution::KeepConflictingClientOperations => ContentDecision::DiscardDownload,
            ContentResolution::UseNeitherClientNorDownload => {
                self.remove_uploads(&conflicting_ids).await?;
                ContentDecision::DiscardDownload
            }
        };
        Ok((decision, true))
    }

    /// Adjudicate a batch of download-deletions against pending local
    /// uploads.
    ///
    /// Deletions matched by a pending local upload-deletion are auto-resolved
    /// (both sides agree) with no policy callback. Deletions matched by
    /// pending content uploads go to the policy as one batch; a kept upload
    /// marks the oldest conflicting tracker as an upload-undeletion so a
    /// later commit restores the file.
    pub async fn handle_download_deletion_conflicts(
        &self,
        deletions: &[DownloadFileTracker],
    ) -> Result<DeletionOutcome> {
        let mut outcome = DeletionOutcome::default();
        let mut contested: Vec<(Uuid, Vec<UploadFileTracker>)> = Vec::new();

        let deletion_uuids: Vec<Uuid> = deletions.iter().map(|d| d.file_uuid).collect();
        let auto = self
            .store
            .perform(|s| -> Result<Vec<Uuid>> {
                let mut auto_confirmed = Vec::new();
                for file_uuid in &deletion_uuids {
                    let pending = s.uploads_for_file(file_uuid)?;
                    let local_deletions: Vec<i64> = pending
                        .iter()
                        .filter(|u| is_upload_deletion(u))
                        .map(|u| u.id)
                        .collect();

                    if !local_deletions.is_empty() {
                        // Both sides agree to delete; drop the local
                        // operation and confirm silently
                        for id in local_deletions {
                            s.remove_upload(id)?;
                        }
                        auto_confirmed.push(*file_uuid);
                        continue;
                    }

                    let content: Vec<UploadFileTracker> =
                        pending.into_iter().filter(is_content_upload).collect();
                    if content.is_empty() {
                        auto_confirmed.push(*file_uuid);
                    } else {
                        contested.push((*file_uuid, content));
                    }
                }
                Ok(auto_confirmed)
            })
            .await?;
        outcome.confirmed = auto;

        if contested.is_empty() {
            return Ok(outcome);
        }

        let handles: Vec<Arc<DeletionConflict>> = contested
            .iter()
            .map(|(uuid, _)| Arc::new(DeletionConflict::new(*uuid, ConflictType::FileUpload)))
            .collect();

        debug!(count = handles.len(), "Download-deletion conflicts");
        self.delegate
            .resolve_download_deletion_conflicts(handles.clone())
            .await;

        for (handle, (file_uuid, uploads)) in handles.iter().zip(contested.into_iter()) {
            outcome.conflicts_resolved += 1;
            let resolution = handle.resolution().unwrap_or_else(|| {
                warn!(%file_uuid, "Deletion conflict left unresolved; accepting deletion");
                DeletionResolution::AcceptDownloadDeletion
            });

            match resolution {
                DeletionResolution::AcceptDownloadDeletion => {
                    let ids: Vec<i64> = uploads.iter().map(|u| u.id).collect();
                    self.remove_uploads(&ids).await?;
                    outcome.confirmed.push(file_uuid);
                }
                DeletionResolution::RejectDownloadDeletion => {
                    // Tie-break by insertion age: the oldest queued tracker
                    // carries the undeletion; later trackers in the chain
                    // stay plain uploads
                    let oldest = uploads
                        .iter()
                        .min_by_key(|u| u.age())
                        .expect("contested uploads are non-empty");
                    let oldest_id = oldest.id;
                    self.store
                        .perform(move |s| -> Result<()> {
                            Ok(s.set_upload_undeletion(oldest_id)?)
                        })
                        .await?;
                    outcome.kept_undeletions.push(file_uuid);
                }
            }
        }

        Ok(outcome)
    }

    async fn remove_uploads(&self, ids: &[i64]) -> Result<()> {
        let ids = ids.to_vec();
        self.store
            .perform(move |s| -> Result<()> {
                for id in ids {
                    s.remove_upload(id)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}
