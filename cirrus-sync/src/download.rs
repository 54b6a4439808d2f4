//! Download engine
//!
//! Server state always takes priority: the orchestrator drives this engine
//! to quiescence before any upload is committed. Transfers happen one
//! tracker at a time; a master-version mismatch invalidates the whole
//! outstanding batch, never a part of it.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use cirrus_store::{
    AsyncRecordStore, DownloadContentGroup, DownloadFileTracker, DownloadKind, DownloadStatus,
    GroupStatus, NewDownload, RecordStore, SharingEntry,
};

use crate::config::SyncConfig;
use crate::directory::Directory;
use crate::errors::{Result, SyncError};
use crate::server::{DownloadFileResult, DownloadRequest, ServerApi};

/// Result of an index check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadCheckOutcome {
    NoDownloadsOrDeletionsAvailable,
    DownloadsAvailable {
        files: usize,
        deletions: usize,
        app_meta_data: usize,
    },
}

/// Result of advancing one download
#[derive(Debug, Clone)]
pub enum DownloadStep {
    /// One tracker reached a terminal state
    Downloaded(DownloadFileTracker),
    /// The server's source of truth changed underneath us; every
    /// outstanding tracker was discarded and the caller must re-check
    MasterVersionReset,
    /// Nothing left to start in the current batch
    NothingQueued,
}

pub struct DownloadEngine {
    store: AsyncRecordStore,
    server: Arc<dyn ServerApi>,
    config: SyncConfig,
}

impl DownloadEngine {
    pub fn new(store: AsyncRecordStore, server: Arc<dyn ServerApi>, config: SyncConfig) -> Self {
        Self {
            store,
            server,
            config,
        }
    }

    /// Query the server index and bulk-create trackers for pending work.
    ///
    /// The returned master version is recorded locally in the same
    /// transaction scope as tracker creation.
    pub async fn check(&self, sharing_group: Uuid) -> Result<DownloadCheckOutcome> {
        let index = self.server.index(sharing_group).await?;

        self.store
            .perform(move |s| -> Result<DownloadCheckOutcome> {
                // Trackers from a previous incomplete cycle still drive the
                // current batch; do not re-create them
                let outstanding = s.pending_download_count(&sharing_group)?;
                if outstanding > 0 {
                    debug!(outstanding, "Index check with trackers outstanding");
                    return Ok(DownloadCheckOutcome::DownloadsAvailable {
                        files: outstanding,
                        deletions: 0,
                        app_meta_data: 0,
                    });
                }

                // Sharing-group bookkeeping from every index response
                let mut sharing = s
                    .sharing_entry(&sharing_group)?
                    .unwrap_or_else(|| SharingEntry::new(sharing_group));
                if index.master_version != sharing.master_version {
                    sharing.sync_needed = true;
                }
                if index.sharing_group_name.is_some() {
                    sharing.name = index.sharing_group_name.clone();
                }
                sharing.master_version = index.master_version;
                s.upsert_sharing_entry(&sharing)?;

                let delta = Directory::check_file_index(s, &index.files)?;
                if delta.is_empty() {
                    s.clear_downloads(&sharing_group)?;
                    return Ok(DownloadCheckOutcome::NoDownloadsOrDeletionsAvailable);
                }

                let mut batch = Vec::new();
                for info in &delta.downloads {
                    batch.push(Self::new_download(info, DownloadKind::File, sharing_group));
                }
                for info in &delta.app_meta_data {
                    batch.push(Self::new_download(
                        info,
                        DownloadKind::AppMetaData,
                        sharing_group,
                    ));
                }
                for info in &delta.deletions {
                    batch.push(Self::new_download(
                        info,
                        DownloadKind::Deletion,
                        sharing_group,
                    ));
                }
                s.insert_download_batch(&batch)?;

                info!(
                    files = delta.downloads.len(),
                    deletions = delta.deletions.len(),
                    app_meta_data = delta.app_meta_data.len(),
                    master_version = index.master_version,
                    "Downloads available"
                );
                Ok(DownloadCheckOutcome::DownloadsAvailable {
                    files: delta.downloads.len(),
                    deletions: delta.deletions.len(),
                    app_meta_data: delta.app_meta_data.len(),
                })
            })
            .await
    }

    fn new_download(
        info: &crate::server::FileInfo,
        kind: DownloadKind,
        sharing_group: Uuid,
    ) -> NewDownload {
        NewDownload {
            file_uuid: info.file_uuid,
            file_version: info.file_version,
            sharing_group_uuid: sharing_group,
            // Ungrouped files stand in for their own content group
            group_key: info.file_group_uuid.unwrap_or(info.file_uuid),
            kind,
            gone: info.gone,
            contents_changed: false,
            app_meta_data_version: info.app_meta_data_version,
            mime_type: info.mime_type.clone(),
            cloud_storage_type: info.cloud_storage_type.clone(),
        }
    }

    /// The trackers eligible this round: whole groups, oldest first, until
    /// the batch cap is met. Group atomicity takes priority over the cap,
    /// so one large group can exceed it.
    fn select_batch(
        store: &RecordStore,
        sharing_group: &Uuid,
        cap: usize,
    ) -> Result<Vec<DownloadFileTracker>> {
        let mut batch = Vec::new();
        for group in store.download_groups(sharing_group)? {
            let trackers = store.trackers_in_group(&group.group_key)?;
            if trackers.iter().all(|t| t.is_terminal()) {
                continue;
            }
            batch.extend(trackers);
            if batch.len() >= cap {
                break;
            }
        }
        Ok(batch)
    }

    /// Pull one not-started tracker and run its transfer.
    ///
    /// At most one tracker may be mid-transfer at any time; a second caller
    /// is a programming error, not a race to win.
    pub async fn next(&self, sharing_group: Uuid) -> Result<DownloadStep> {
        enum Picked {
            Nothing,
            Finished(DownloadFileTracker),
            Transfer(DownloadFileTracker, i64),
        }

        let cap = self.config.max_download_batch;
        let picked = self
            .store
            .perform(move |s| -> Result<Picked> {
                if s.downloading_count(&sharing_group)? > 0 {
                    return Err(SyncError::Invariant(
                        "a download is already in flight".to_string(),
                    ));
                }

                let batch = Self::select_batch(s, &sharing_group, cap)?;
                let next = batch
                    .into_iter()
                    .find(|t| t.status == DownloadStatus::NotStarted && t.gone.is_none());

                match next {
                    None => Ok(Picked::Nothing),
                    Some(tracker) if tracker.kind == DownloadKind::Deletion => {
                        // Nothing to transfer for a deletion: the index
                        // already told us everything
                        s.record_download_success(tracker.id, None, None, None, false, None)?;
                        let tracker = s
                            .download_tracker(tracker.id)?
                            .expect("tracker just updated");
                        Ok(Picked::Finished(tracker))
                    }
                    Some(tracker) => {
                        s.set_download_status(tracker.id, DownloadStatus::Downloading)?;
                        s.set_group_status(&tracker.group_key, GroupStatus::Downloading)?;
                        let master_version = s.master_version(&sharing_group)?;
                        Ok(Picked::Transfer(tracker, master_version))
                    }
                }
            })
            .await?;

        let (tracker, master_version) = match picked {
            Picked::Nothing => return Ok(DownloadStep::NothingQueued),
            Picked::Finished(tracker) => return Ok(DownloadStep::Downloaded(tracker)),
            Picked::Transfer(tracker, master_version) => (tracker, master_version),
        };

        let request = DownloadRequest {
            file_uuid: tracker.file_uuid,
            file_version: tracker.file_version,
            sharing_group_uuid: sharing_group,
            master_version,
            app_meta_data_version: tracker.app_meta_data_version,
        };

        match self.server.download_file(request).await {
            Ok(DownloadFileResult::Success(file)) => {
                let tracker_id = tracker.id;
                let tracker = self
                    .store
                    .perform(move |s| -> Result<DownloadFileTracker> {
                        s.record_download_success(
                            tracker_id,
                            file.local_path.as_deref().and_then(|p| p.to_str()),
                            file.app_meta_data.as_deref(),
                            file.checksum.as_deref(),
                            file.contents_changed,
                            file.gone,
                        )?;
                        Ok(s.download_tracker(tracker_id)?.expect("tracker just updated"))
                    })
                    .await?;
                debug!(file_uuid = %tracker.file_uuid, "Download complete");
                Ok(DownloadStep::Downloaded(tracker))
            }
            Ok(DownloadFileResult::MasterVersionUpdate(new_version)) => {
                // Optimistic concurrency retry: the whole batch is invalid,
                // partial progress is never retried piecemeal
                self.store
                    .perform(move |s| -> Result<()> {
                        s.clear_downloads(&sharing_group)?;
                        s.set_master_version(&sharing_group, new_version)?;
                        Ok(())
                    })
                    .await?;
                warn!(new_version, "Master version changed; download batch discarded");
                Ok(DownloadStep::MasterVersionReset)
            }
            Err(err) => {
                // Transient: revert for a later retry and surface the error
                let tracker_id = tracker.id;
                self.store
                    .perform(move |s| -> Result<()> {
                        s.set_download_status(tracker_id, DownloadStatus::NotStarted)?;
                        Ok(())
                    })
                    .await?;
                Err(err)
            }
        }
    }

    /// Groups whose every tracker is terminal, with their trackers
    pub async fn completed_groups(
        &self,
        sharing_group: Uuid,
    ) -> Result<Vec<(DownloadContentGroup, Vec<DownloadFileTracker>)>> {
        type Completed = Vec<(DownloadContentGroup, Vec<DownloadFileTracker>)>;
        self.store
            .inspect(move |s| -> Result<Completed> {
                let mut completed = Vec::new();
                for group in s.download_groups(&sharing_group)? {
                    let trackers = s.trackers_in_group(&group.group_key)?;
                    if !trackers.is_empty() && trackers.iter().all(|t| t.is_terminal()) {
                        completed.push((group, trackers));
                    }
                }
                Ok(completed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        DeletionRequest, DoneUploadsResult, DownloadedFile, FileIndex, FileInfo, UploadOutcome,
        UploadRequest,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted server: one canned index, configurable download outcomes
    struct ScriptedServer {
        index: Mutex<FileIndex>,
        download_results: Mutex<Vec<DownloadFileResult>>,
    }

    impl ScriptedServer {
        fn new(index: FileIndex) -> Self {
            Self {
                index: Mutex::new(index),
                download_results: Mutex::new(Vec::new()),
            }
        }

        fn push_download(&self, result: DownloadFileResult) {
            self.download_results.lock().unwrap().push(result);
        }
    }

    #[async_trait]
    impl ServerApi for ScriptedServer {
        async fn index(&self, _sharing_group: Uuid) -> Result<FileIndex> {
            Ok(self.index.lock().unwrap().clone())
        }

        async fn download_file(&self, _request: DownloadRequest) -> Result<DownloadFileResult> {
            let mut results = self.download_results.lock().unwrap();
            if results.is_empty() {
                Ok(DownloadFileResult::Success(Box::new(DownloadedFile {
                    local_path: None,
                    app_meta_data: None,
                    checksum: None,
                    contents_changed: false,
                    gone: None,
                })))
            } else {
                Ok(results.remove(0))
            }
        }

        async fn upload_file(&self, _request: UploadRequest) -> Result<UploadOutcome> {
            Ok(UploadOutcome::Success)
        }

        async fn upload_app_meta_data(&self, _request: UploadRequest) -> Result<UploadOutcome> {
            Ok(UploadOutcome::Success)
        }

        async fn upload_deletion(&self, _request: DeletionRequest) -> Result<UploadOutcome> {
            Ok(UploadOutcome::Success)
        }

        async fn done_uploads(
            &self,
            _sharing_group: Uuid,
            _master_version: i64,
        ) -> Result<DoneUploadsResult> {
            Ok(DoneUploadsResult::Committed { num_transferred: 0 })
        }
    }

    fn file_info(sharing: Uuid, group: Option<Uuid>) -> FileInfo {
        FileInfo {
            file_uuid: Uuid::new_v4(),
            file_group_uuid: group,
            sharing_group_uuid: sharing,
            file_version: 0,
            app_meta_data_version: None,
            deleted: false,
            gone: None,
            mime_type: Some("text/plain".to_string()),
            cloud_storage_type: Some("Google".to_string()),
        }
    }

    async fn engine_with(
        index: FileIndex,
    ) -> (DownloadEngine, AsyncRecordStore, Arc<ScriptedServer>) {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(ScriptedServer::new(index));
        let engine = DownloadEngine::new(
            store.clone(),
            server.clone() as Arc<dyn ServerApi>,
            SyncConfig::default(),
        );
        (engine, store, server)
    }

    #[tokio::test]
    async fn test_check_creates_trackers_and_records_master_version() {
        let sharing = Uuid::new_v4();
        let index = FileIndex {
            files: vec![file_info(sharing, None), file_info(sharing, None)],
            master_version: 12,
            sharing_group_name: Some("team".to_string()),
        };
        let (engine, store, _server) = engine_with(index).await;

        let outcome = engine.check(sharing).await.unwrap();
        assert_eq!(
            outcome,
            DownloadCheckOutcome::DownloadsAvailable {
                files: 2,
                deletions: 0,
                app_meta_data: 0
            }
        );

        let (version, groups) = store
            .inspect(|s| -> Result<(i64, Vec<DownloadContentGroup>)> {
                Ok((s.master_version(&sharing)?, s.download_groups(&sharing)?))
            })
            .await
            .unwrap();
        assert_eq!(version, 12);
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn test_check_empty_index_clears_state() {
        let sharing = Uuid::new_v4();
        let index = FileIndex {
            files: vec![],
            master_version: 0,
            sharing_group_name: None,
        };
        let (engine, _store, _server) = engine_with(index).await;

        let outcome = engine.check(sharing).await.unwrap();
        assert_eq!(outcome, DownloadCheckOutcome::NoDownloadsOrDeletionsAvailable);
    }

    #[tokio::test]
    async fn test_next_downloads_one_at_a_time() {
        let sharing = Uuid::new_v4();
        let index = FileIndex {
            files: vec![file_info(sharing, None)],
            master_version: 1,
            sharing_group_name: None,
        };
        let (engine, store, _server) = engine_with(index).await;
        engine.check(sharing).await.unwrap();

        let step = engine.next(sharing).await.unwrap();
        assert!(matches!(step, DownloadStep::Downloaded(_)));

        let completed = engine.completed_groups(sharing).await.unwrap();
        assert_eq!(completed.len(), 1);

        // Second-in-flight guard: force a tracker back to downloading
        store
            .perform(|s| -> Result<()> {
                let group_key = s.download_groups(&sharing)?[0].group_key;
                let tracker_id = s.trackers_in_group(&group_key)?[0].id;
                s.set_download_status(tracker_id, DownloadStatus::Downloading)?;
                Ok(())
            })
            .await
            .unwrap();
        let result = engine.next(sharing).await;
        assert!(matches!(result, Err(SyncError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_master_version_mismatch_discards_whole_batch() {
        let sharing = Uuid::new_v4();
        let index = FileIndex {
            files: vec![
                file_info(sharing, None),
                file_info(sharing, None),
                file_info(sharing, None),
            ],
            master_version: 1,
            sharing_group_name: None,
        };
        let (engine, store, server) = engine_with(index).await;
        engine.check(sharing).await.unwrap();

        server.push_download(DownloadFileResult::MasterVersionUpdate(9));
        let step = engine.next(sharing).await.unwrap();
        assert!(matches!(step, DownloadStep::MasterVersionReset));

        // Zero trackers survive, and the new master version is recorded
        let (pending, version) = store
            .inspect(|s| -> Result<(usize, i64)> {
                Ok((s.pending_download_count(&sharing)?, s.master_version(&sharing)?))
            })
            .await
            .unwrap();
        assert_eq!(pending, 0);
        assert_eq!(version, 9);
    }

    #[tokio::test]
    async fn test_whole_group_exceeds_batch_cap() {
        let sharing = Uuid::new_v4();
        let group = Uuid::new_v4();
        let files: Vec<FileInfo> = (0..12).map(|_| file_info(sharing, Some(group))).collect();
        let index = FileIndex {
            files,
            master_version: 1,
            sharing_group_name: None,
        };
        let (engine, store, _server) = engine_with(index).await;
        engine.check(sharing).await.unwrap();

        let batch = store
            .inspect(|s| DownloadEngine::select_batch(s, &sharing, 10))
            .await
            .unwrap();
        // Grouping atomicity beats the cap of 10
        assert_eq!(batch.len(), 12);
    }

    #[tokio::test]
    async fn test_transient_error_reverts_tracker() {
        struct FailingServer(ScriptedServer);

        #[async_trait]
        impl ServerApi for FailingServer {
            async fn index(&self, sharing_group: Uuid) -> Result<FileIndex> {
                self.0.index(sharing_group).await
            }
            async fn download_file(&self, _request: DownloadRequest) -> Result<DownloadFileResult> {
                Err(SyncError::Network("connection reset".to_string()))
            }
            async fn upload_file(&self, request: UploadRequest) -> Result<UploadOutcome> {
                self.0.upload_file(request).await
            }
            async fn upload_app_meta_data(&self, request: UploadRequest) -> Result<UploadOutcome> {
                self.0.upload_app_meta_data(request).await
            }
            async fn upload_deletion(&self, request: DeletionRequest) -> Result<UploadOutcome> {
                self.0.upload_deletion(request).await
            }
            async fn done_uploads(
                &self,
                sharing_group: Uuid,
                master_version: i64,
            ) -> Result<DoneUploadsResult> {
                self.0.done_uploads(sharing_group, master_version).await
            }
        }

        let sharing = Uuid::new_v4();
        let index = FileIndex {
            files: vec![file_info(sharing, None)],
            master_version: 1,
            sharing_group_name: None,
        };
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let server = Arc::new(FailingServer(ScriptedServer::new(index)));
        let engine = DownloadEngine::new(store.clone(), server, SyncConfig::default());

        engine.check(sharing).await.unwrap();
        let result = engine.next(sharing).await;
        assert!(matches!(result, Err(SyncError::Network(_))));

        // Tracker reverted for a later retry
        let batch = store
            .inspect(|s| DownloadEngine::select_batch(s, &sharing, 10))
            .await
            .unwrap();
        assert_eq!(batch[0].status, DownloadStatus::NotStarted);
    }
}
