//! Upload engine
//!
//! Staging is synchronous and local: client calls append trackers to the
//! pending-sync queue with no network access. Commit is a two-phase
//! protocol per sharing group: trackers upload one at a time, then a final
//! done-uploads call finalizes the batch against the master version. The
//! directory mutates only after the server accepts the batch, never
//! optimistically before.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use cirrus_store::{
    AsyncRecordStore, DirectoryEntry, NewUpload, RecordStore, SharingEntry, UploadFileTracker,
    UploadKind, UploadStatus,
};

use crate::errors::{Result, SyncError};
use crate::server::{DeletionRequest, DoneUploadsResult, ServerApi, UploadOutcome, UploadRequest};

/// Client-supplied attributes for staging an upload
#[derive(Debug, Clone)]
pub struct UploadAttributes {
    pub file_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    pub mime_type: Option<String>,
    pub app_meta_data: Option<String>,
    pub local_path: Option<PathBuf>,
    pub checksum: Option<String>,
}

/// Result of advancing the commit path by one step
#[derive(Debug, Clone)]
pub enum UploadStep {
    /// One tracker was accepted by the server (not yet finalized)
    Uploaded(UploadFileTracker),
    /// The head queue was finalized by done-uploads and removed
    QueueCommitted { num_transferred: u32 },
    /// The server's source of truth changed; the whole batch reverted and
    /// the caller must re-absorb server state before retrying
    MasterVersionReset,
    /// No synced queue remains
    NothingQueued,
}

pub struct UploadEngine {
    store: AsyncRecordStore,
    server: Arc<dyn ServerApi>,
}

impl UploadEngine {
    pub fn new(store: AsyncRecordStore, server: Arc<dyn ServerApi>) -> Self {
        Self { store, server }
    }

    // ---- staging (client API, no network) ----

    /// Stage a content upload. The version is provisional: the entry's
    /// current version plus one, or zero for a file the server has never
    /// seen.
    pub async fn queue_upload(&self, attrs: UploadAttributes) -> Result<i64> {
        self.store
            .perform(move |s| -> Result<i64> {
                let entry = s.entry(&attrs.file_uuid)?;
                if let Some(entry) = &entry {
                    if let (Some(local), Some(staged)) = (&entry.mime_type, &attrs.mime_type) {
                        if local != staged {
                            return Err(SyncError::DataIntegrity(format!(
                                "mime type for {} changed from {} to {}",
                                attrs.file_uuid, local, staged
                            )));
                        }
                    }
                }

                let version = entry
                    .as_ref()
                    .and_then(|e| e.file_version)
                    .map(|v| v + 1)
                    .unwrap_or(0);

                let id = s.append_upload(&NewUpload {
                    file_uuid: attrs.file_uuid,
                    file_group_uuid: attrs.file_group_uuid,
                    sharing_group_uuid: attrs.sharing_group_uuid,
                    kind: UploadKind::File,
                    file_version: Some(version),
                    app_meta_data: attrs.app_meta_data.clone(),
                    app_meta_data_version: attrs.app_meta_data.as_ref().map(|_| {
                        entry
                            .as_ref()
                            .and_then(|e| e.app_meta_data_version)
                            .map(|v| v + 1)
                            .unwrap_or(0)
                    }),
                    mime_type: attrs.mime_type.clone(),
                    local_path: attrs.local_path.as_ref().map(|p| p.display().to_string()),
                    checksum: attrs.checksum.clone(),
                })?;
                debug!(file_uuid = %attrs.file_uuid, version, "Staged upload");
                Ok(id)
            })
            .await
    }

    /// Stage an app-metadata-only upload
    pub async fn queue_app_meta_data_upload(&self, attrs: UploadAttributes) -> Result<i64> {
        if attrs.app_meta_data.is_none() {
            return Err(SyncError::DataIntegrity(
                "app metadata upload staged without app metadata".to_string(),
            ));
        }
        self.store
            .perform(move |s| -> Result<i64> {
                let entry = s.entry(&attrs.file_uuid)?.ok_or_else(|| {
                    SyncError::DataIntegrity(format!(
                        "app metadata upload for unknown file {}",
                        attrs.file_uuid
                    ))
                })?;

                let meta_version = entry
                    .app_meta_data_version
                    .map(|v| v + 1)
                    .unwrap_or(0);

                let id = s.append_upload(&NewUpload {
                    file_uuid: attrs.file_uuid,
                    file_group_uuid: entry.file_group_uuid,
                    sharing_group_uuid: attrs.sharing_group_uuid,
                    kind: UploadKind::AppMetaData,
                    file_version: entry.file_version,
                    app_meta_data: attrs.app_meta_data.clone(),
                    app_meta_data_version: Some(meta_version),
                    mime_type: entry.mime_type.clone(),
                    local_path: None,
                    checksum: None,
                })?;
                Ok(id)
            })
            .await
    }

    /// Stage a deletion. The version is deliberately left unresolved until
    /// the last possible moment: queued cycles ahead of this one can shift
    /// which version is actually being deleted.
    pub async fn queue_deletion(&self, file_uuid: Uuid, sharing_group: Uuid) -> Result<i64> {
        self.store
            .perform(move |s| -> Result<i64> {
                let entry = s.entry(&file_uuid)?.ok_or_else(|| {
                    SyncError::DataIntegrity(format!("deletion staged for unknown file {file_uuid}"))
                })?;
                if entry.deleted_locally {
                    return Err(SyncError::DataIntegrity(format!(
                        "deletion staged for already-deleted file {file_uuid}"
                    )));
                }

                let id = s.append_upload(&NewUpload {
                    file_uuid,
                    file_group_uuid: entry.file_group_uuid,
                    sharing_group_uuid: sharing_group,
                    kind: UploadKind::Deletion,
                    file_version: None,
                    app_meta_data: None,
                    app_meta_data_version: None,
                    mime_type: entry.mime_type.clone(),
                    local_path: None,
                    checksum: None,
                })?;
                debug!(%file_uuid, "Staged deletion");
                Ok(id)
            })
            .await
    }

    /// Stage a sharing-group rename; applied locally once the batch commits
    pub async fn queue_sharing_group_update(
        &self,
        sharing_group: Uuid,
        name: String,
    ) -> Result<i64> {
        self.store
            .perform(move |s| -> Result<i64> {
                let id = s.append_upload(&NewUpload {
                    file_uuid: Uuid::new_v4(),
                    file_group_uuid: None,
                    sharing_group_uuid: sharing_group,
                    kind: UploadKind::SharingGroup,
                    file_version: None,
                    app_meta_data: Some(name),
                    app_meta_data_version: None,
                    mime_type: None,
                    local_path: None,
                    checksum: None,
                })?;
                Ok(id)
            })
            .await
    }

    /// Hand everything staged so far to the commit path
    pub async fn promote_pending_queue(&self) -> Result<Option<i64>> {
        self.store
            .perform(|s| -> Result<Option<i64>> { Ok(s.promote_pending_queue()?) })
            .await
    }

    /// Whether a synced queue is waiting for commit
    pub async fn has_queued_batch(&self) -> Result<bool> {
        self.store
            .inspect(|s| -> Result<bool> { Ok(s.head_synced_queue()?.is_some()) })
            .await
    }

    // ---- commit path ----

    /// Advance the oldest synced queue by one step: upload the next
    /// tracker, or finalize the batch once every tracker is uploaded.
    pub async fn next(&self, sharing_group: Uuid) -> Result<UploadStep> {
        enum Phase {
            Nothing,
            Send(UploadFileTracker, i64),
            Finalize(i64, i64),
        }

        let phase = self
            .store
            .perform(move |s| -> Result<Phase> {
                let queue = match s.head_synced_queue()? {
                    Some(queue) => queue,
                    None => return Ok(Phase::Nothing),
                };
                let trackers = s.uploads_in_queue(queue.id)?;
                if let Some(stray) = trackers
                    .iter()
                    .find(|t| t.sharing_group_uuid != sharing_group)
                {
                    return Err(SyncError::DataIntegrity(format!(
                        "queue {} mixes sharing groups: {} vs {}",
                        queue.id, stray.sharing_group_uuid, sharing_group
                    )));
                }
                if s.uploading_count()? > 0 {
                    return Err(SyncError::Invariant(
                        "an upload is already in flight".to_string(),
                    ));
                }

                let master_version = s.master_version(&sharing_group)?;
                match trackers
                    .into_iter()
                    .find(|t| t.status == UploadStatus::NotStarted)
                {
                    Some(mut tracker) => {
                        if tracker.kind == UploadKind::Deletion && tracker.file_version.is_none() {
                            // Late version binding: only now is the deleted
                            // version final
                            let entry = s.entry(&tracker.file_uuid)?.ok_or_else(|| {
                                SyncError::DataIntegrity(format!(
                                    "deletion of unknown file {}",
                                    tracker.file_uuid
                                ))
                            })?;
                            let version = entry.file_version.ok_or_else(|| {
                                SyncError::DataIntegrity(format!(
                                    "deletion of never-synced file {}",
                                    tracker.file_uuid
                                ))
                            })?;
                            s.set_upload_file_version(tracker.id, version)?;
                            tracker.file_version = Some(version);
                        }
                        s.set_upload_status(tracker.id, UploadStatus::Uploading)?;
                        Ok(Phase::Send(tracker, master_version))
                    }
                    None => Ok(Phase::Finalize(queue.id, master_version)),
                }
            })
            .await?;

        match phase {
            Phase::Nothing => Ok(UploadStep::NothingQueued),
            Phase::Send(tracker, master_version) => {
                self.send_tracker(sharing_group, tracker, master_version).await
            }
            Phase::Finalize(queue_id, master_version) => {
                self.finalize_queue(sharing_group, queue_id, master_version)
                    .await
            }
        }
    }

    async fn send_tracker(
        &self,
        sharing_group: Uuid,
        tracker: UploadFileTracker,
        master_version: i64,
    ) -> Result<UploadStep> {
        let outcome = match tracker.kind {
            UploadKind::File => {
                self.server
                    .upload_file(Self::upload_request(&tracker, master_version))
                    .await
            }
            UploadKind::AppMetaData => {
                self.server
                    .upload_app_meta_data(Self::upload_request(&tracker, master_version))
                    .await
            }
            UploadKind::Deletion => {
                self.server
                    .upload_deletion(DeletionRequest {
                        file_uuid: tracker.file_uuid,
                        file_version: tracker.file_version.expect("version bound at send time"),
                        sharing_group_uuid: sharing_group,
                        master_version,
                    })
                    .await
            }
            // Sharing-group operations carry no transfer of their own; they
            // ride the done-uploads commit
            UploadKind::SharingGroup => Ok(UploadOutcome::Success),
        };

        match outcome {
            Ok(UploadOutcome::Success) => {
                let tracker_id = tracker.id;
                let tracker = self
                    .store
                    .perform(move |s| -> Result<UploadFileTracker> {
                        s.set_upload_status(tracker_id, UploadStatus::Uploaded)?;
                        Ok(s.upload_tracker(tracker_id)?.expect("tracker just updated"))
                    })
                    .await?;
                debug!(file_uuid = %tracker.file_uuid, "Upload accepted");
                Ok(UploadStep::Uploaded(tracker))
            }
            Ok(UploadOutcome::MasterVersionUpdate(new_version)) => {
                self.reset_batch(sharing_group, new_version).await?;
                Ok(UploadStep::MasterVersionReset)
            }
            Err(err) => {
                let tracker_id = tracker.id;
                self.store
                    .perform(move |s| -> Result<()> {
                        s.set_upload_status(tracker_id, UploadStatus::NotStarted)?;
                        Ok(())
                    })
                    .await?;
                Err(err)
            }
        }
    }

    async fn finalize_queue(
        &self,
        sharing_group: Uuid,
        queue_id: i64,
        master_version: i64,
    ) -> Result<UploadStep> {
        match self
            .server
            .done_uploads(sharing_group, master_version)
            .await?
        {
            DoneUploadsResult::Committed { num_transferred } => {
                self.store
                    .perform(move |s| -> Result<()> {
                        let trackers = s.uploads_in_queue(queue_id)?;
                        Self::apply_committed_uploads(s, &trackers)?;
                        s.remove_queue(queue_id)?;
                        s.gc_upload_queues()?;
                        Ok(())
                    })
                    .await?;
                info!(num_transferred, "Upload batch committed");
                Ok(UploadStep::QueueCommitted { num_transferred })
            }
            DoneUploadsResult::MasterVersionUpdate(new_version) => {
                self.reset_batch(sharing_group, new_version).await?;
                Ok(UploadStep::MasterVersionReset)
            }
        }
    }

    /// Symmetric to the download case: the whole batch is invalidated, the
    /// caller must re-absorb server state before the client's view can be
    /// trusted again.
    async fn reset_batch(&self, sharing_group: Uuid, new_version: i64) -> Result<()> {
        self.store
            .perform(move |s| -> Result<()> {
                if let Some(queue) = s.head_synced_queue()? {
                    for tracker in s.uploads_in_queue(queue.id)? {
                        if tracker.status != UploadStatus::NotStarted {
                            s.set_upload_status(tracker.id, UploadStatus::NotStarted)?;
                        }
                    }
                }
                s.set_master_version(&sharing_group, new_version)?;
                Ok(())
            })
            .await?;
        warn!(new_version, "Master version changed; upload batch reverted");
        Ok(())
    }

    /// Apply server-accepted results back to the directory. Runs only after
    /// done-uploads confirms the batch.
    fn apply_committed_uploads(s: &mut RecordStore, trackers: &[UploadFileTracker]) -> Result<()> {
        for tracker in trackers {
            match tracker.kind {
                UploadKind::File => {
                    let mut entry = match s.entry(&tracker.file_uuid)? {
                        Some(entry) => entry,
                        None => {
                            let mut entry = DirectoryEntry::new(
                                tracker.file_uuid,
                                tracker.sharing_group_uuid,
                            );
                            entry.file_group_uuid = tracker.file_group_uuid;
                            entry
                        }
                    };
                    entry.file_version = tracker.file_version;
                    if entry.mime_type.is_none() {
                        entry.mime_type = tracker.mime_type.clone();
                    }
                    if tracker.app_meta_data.is_some() {
                        entry.app_meta_data = tracker.app_meta_data.clone();
                        entry.app_meta_data_version = tracker.app_meta_data_version;
                    }
                    if tracker.upload_undeletion {
                        entry.deleted_locally = false;
                        entry.deleted_on_server = false;
                    }
                    s.upsert_entry(&entry)?;
                }
                UploadKind::AppMetaData => {
                    if let Some(mut entry) = s.entry(&tracker.file_uuid)? {
                        entry.app_meta_data = tracker.app_meta_data.clone();
                        entry.app_meta_data_version = tracker.app_meta_data_version;
                        s.upsert_entry(&entry)?;
                    }
                }
                UploadKind::Deletion => {
                    if let Some(mut entry) = s.entry(&tracker.file_uuid)? {
                        entry.deleted_locally = true;
                        entry.deleted_on_server = true;
                        s.upsert_entry(&entry)?;
                    }
                }
                UploadKind::SharingGroup => {
                    let mut sharing = s
                        .sharing_entry(&tracker.sharing_group_uuid)?
                        .unwrap_or_else(|| SharingEntry::new(tracker.sharing_group_uuid));
                    sharing.name = tracker.app_meta_data.clone();
                    s.upsert_sharing_entry(&sharing)?;
                }
            }
        }
        Ok(())
    }

    fn upload_request(tracker: &UploadFileTracker, master_version: i64) -> UploadRequest {
        UploadRequest {
            file_uuid: tracker.file_uuid,
            file_group_uuid: tracker.file_group_uuid,
            sharing_group_uuid: tracker.sharing_group_uuid,
            file_version: tracker.file_version.unwrap_or(0),
            master_version,
            mime_type: tracker.mime_type.clone(),
            app_meta_data: tracker.app_meta_data.clone(),
            app_meta_data_version: tracker.app_meta_data_version,
            local_path: tracker.local_path.as_ref().map(PathBuf::from),
            checksum: tracker.checksum.clone(),
            undelete: tracker.upload_undeletion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{DownloadFileResult, DownloadRequest, FileIndex};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingServer {
        uploads: Mutex<Vec<Uuid>>,
        deletions: Mutex<Vec<(Uuid, i64)>>,
        done_results: Mutex<Vec<DoneUploadsResult>>,
        done_calls: Mutex<usize>,
    }

    #[async_trait]
    impl ServerApi for RecordingServer {
        async fn index(&self, _sharing_group: Uuid) -> Result<FileIndex> {
            Ok(FileIndex {
                files: vec![],
                master_version: 0,
                sharing_group_name: None,
            })
        }

        async fn download_file(&self, _request: DownloadRequest) -> Result<DownloadFileResult> {
            unreachable!("no downloads in upload tests")
        }

        async fn upload_file(&self, request: UploadRequest) -> Result<UploadOutcome> {
            self.uploads.lock().unwrap().push(request.file_uuid);
            Ok(UploadOutcome::Success)
        }

        async fn upload_app_meta_data(&self, request: UploadRequest) -> Result<UploadOutcome> {
            self.uploads.lock().unwrap().push(request.file_uuid);
            Ok(UploadOutcome::Success)
        }

        async fn upload_deletion(&self, request: DeletionRequest) -> Result<UploadOutcome> {
            self.deletions
                .lock()
                .unwrap()
                .push((request.file_uuid, request.file_version));
            Ok(UploadOutcome::Success)
        }

        async fn done_uploads(
            &self,
            _sharing_group: Uuid,
            _master_version: i64,
        ) -> Result<DoneUploadsResult> {
            *self.done_calls.lock().unwrap() += 1;
            let mut results = self.done_results.lock().unwrap();
            if results.is_empty() {
                Ok(DoneUploadsResult::Committed { num_transferred: 1 })
            } else {
                Ok(results.remove(0))
            }
        }
    }

    fn attrs(file_uuid: Uuid, sharing: Uuid) -> UploadAttributes {
        UploadAttributes {
            file_uuid,
            file_group_uuid: None,
            sharing_group_uuid: sharing,
            mime_type: Some("text/plain".to_string()),
            app_meta_data: None,
            local_path: Some(PathBuf::from("/tmp/upload")),
            checksum: None,
        }
    }

    async fn drain(engine: &UploadEngine, sharing: Uuid) -> Vec<UploadStep> {
        let mut steps = Vec::new();
        loop {
            let step = engine.next(sharing).await.unwrap();
            match step {
                UploadStep::NothingQueued => break,
                other => steps.push(other),
            }
        }
        steps
    }

    #[tokio::test]
    async fn test_first_upload_gets_version_zero() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        let engine = UploadEngine::new(store.clone(), server);
        let sharing = Uuid::new_v4();
        let file = Uuid::new_v4();

        let id = engine.queue_upload(attrs(file, sharing)).await.unwrap();
        let tracker = store
            .inspect(move |s| -> Result<UploadFileTracker> {
                Ok(s.upload_tracker(id)?.expect("staged"))
            })
            .await
            .unwrap();
        assert_eq!(tracker.file_version, Some(0));
        assert_eq!(tracker.status, UploadStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_commit_applies_directory_after_done_uploads() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        let engine = UploadEngine::new(store.clone(), server.clone());
        let sharing = Uuid::new_v4();
        let file = Uuid::new_v4();

        engine.queue_upload(attrs(file, sharing)).await.unwrap();
        engine.promote_pending_queue().await.unwrap();

        // First step sends, no directory mutation yet
        let step = engine.next(sharing).await.unwrap();
        assert!(matches!(step, UploadStep::Uploaded(_)));
        let entry = store
            .inspect(move |s| -> Result<Option<DirectoryEntry>> { Ok(s.entry(&file)?) })
            .await
            .unwrap();
        assert!(entry.is_none());

        // Finalize commits the batch and creates the entry
        let step = engine.next(sharing).await.unwrap();
        assert!(matches!(step, UploadStep::QueueCommitted { .. }));
        let entry = store
            .inspect(move |s| -> Result<Option<DirectoryEntry>> { Ok(s.entry(&file)?) })
            .await
            .unwrap()
            .expect("entry after commit");
        assert_eq!(entry.file_version, Some(0));

        // Queue is gone
        assert!(!engine.has_queued_batch().await.unwrap());
    }

    #[tokio::test]
    async fn test_deletion_version_resolved_at_commit() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        let engine = UploadEngine::new(store.clone(), server.clone());
        let sharing = Uuid::new_v4();
        let file = Uuid::new_v4();

        store
            .perform(move |s| -> Result<()> {
                let mut entry = DirectoryEntry::new(file, sharing);
                entry.file_version = Some(4);
                s.upsert_entry(&entry)?;
                Ok(())
            })
            .await
            .unwrap();

        let id = engine.queue_deletion(file, sharing).await.unwrap();
        let staged = store
            .inspect(move |s| -> Result<UploadFileTracker> {
                Ok(s.upload_tracker(id)?.expect("staged"))
            })
            .await
            .unwrap();
        assert_eq!(staged.file_version, None);

        engine.promote_pending_queue().await.unwrap();
        drain(&engine, sharing).await;

        // The version sent is the one current at commit time
        assert_eq!(*server.deletions.lock().unwrap(), vec![(file, 4)]);
        let entry = store
            .inspect(move |s| -> Result<Option<DirectoryEntry>> { Ok(s.entry(&file)?) })
            .await
            .unwrap()
            .unwrap();
        assert!(entry.deleted_locally);
        assert!(entry.deleted_on_server);
    }

    #[tokio::test]
    async fn test_queue_fifo_across_batches() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        let engine = UploadEngine::new(store.clone(), server.clone());
        let sharing = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        engine.queue_upload(attrs(first, sharing)).await.unwrap();
        engine.promote_pending_queue().await.unwrap();
        engine.queue_upload(attrs(second, sharing)).await.unwrap();
        engine.promote_pending_queue().await.unwrap();

        let steps = drain(&engine, sharing).await;
        // Two committed batches, each fully drained before the next began
        let committed = steps
            .iter()
            .filter(|s| matches!(s, UploadStep::QueueCommitted { .. }))
            .count();
        assert_eq!(committed, 2);
        assert_eq!(*server.done_calls.lock().unwrap(), 2);
        assert_eq!(*server.uploads.lock().unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_done_uploads_master_version_reset_reverts_batch() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        server
            .done_results
            .lock()
            .unwrap()
            .push(DoneUploadsResult::MasterVersionUpdate(5));
        let engine = UploadEngine::new(store.clone(), server.clone());
        let sharing = Uuid::new_v4();
        let file = Uuid::new_v4();

        engine.queue_upload(attrs(file, sharing)).await.unwrap();
        engine.promote_pending_queue().await.unwrap();

        let step = engine.next(sharing).await.unwrap();
        assert!(matches!(step, UploadStep::Uploaded(_)));
        let step = engine.next(sharing).await.unwrap();
        assert!(matches!(step, UploadStep::MasterVersionReset));

        // Batch reverted, master version absorbed, no directory mutation
        let (tracker_status, version, entry) = store
            .inspect(move |s| -> Result<(UploadStatus, i64, Option<DirectoryEntry>)> {
                let queue = s.head_synced_queue()?.expect("queue survives the reset");
                let tracker = s.uploads_in_queue(queue.id)?.remove(0);
                Ok((tracker.status, s.master_version(&sharing)?, s.entry(&file)?))
            })
            .await
            .unwrap();
        assert_eq!(tracker_status, UploadStatus::NotStarted);
        assert_eq!(version, 5);
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_mixed_sharing_groups_rejected() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        let engine = UploadEngine::new(store.clone(), server);
        let sharing_a = Uuid::new_v4();
        let sharing_b = Uuid::new_v4();

        engine
            .queue_upload(attrs(Uuid::new_v4(), sharing_a))
            .await
            .unwrap();
        engine
            .queue_upload(attrs(Uuid::new_v4(), sharing_b))
            .await
            .unwrap();
        engine.promote_pending_queue().await.unwrap();

        let result = engine.next(sharing_a).await;
        assert!(matches!(result, Err(SyncError::DataIntegrity(_))));
    }

    #[tokio::test]
    async fn test_committed_undeletion_clears_server_flag() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(RecordingServer::default());
        let engine = UploadEngine::new(store.clone(), server);
        let sharing = Uuid::new_v4();
        let file = Uuid::new_v4();

        store
            .perform(move |s| -> Result<()> {
                let mut entry = DirectoryEntry::new(file, sharing);
                entry.file_version = Some(1);
                entry.mime_type = Some("text/plain".to_string());
                entry.deleted_on_server = true;
                s.upsert_entry(&entry)?;
                Ok(())
            })
            .await
            .unwrap();

        let id = engine.queue_upload(attrs(file, sharing)).await.unwrap();
        store
            .perform(move |s| -> Result<()> {
                s.set_upload_undeletion(id)?;
                Ok(())
            })
            .await
            .unwrap();
        engine.promote_pending_queue().await.unwrap();
        drain(&engine, sharing).await;

        let entry = store
            .inspect(move |s| -> Result<Option<DirectoryEntry>> { Ok(s.entry(&file)?) })
            .await
            .unwrap()
            .unwrap();
        assert!(!entry.deleted_on_server);
        assert!(!entry.deleted_locally);
        assert_eq!(entry.file_version, Some(2));
    }
}
