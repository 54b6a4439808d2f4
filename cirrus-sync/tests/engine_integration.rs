//! Integration tests for the sync engines working against one shared store

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use cirrus_store::{AsyncRecordStore, RecordStore, UploadStatus};
use cirrus_sync::{
    ConflictManager, DeletionRequest, DoneUploadsResult, DownloadCheckOutcome, DownloadEngine,
    DownloadFileResult, DownloadRequest, DownloadStep, DownloadedFile, FileIndex, FileInfo,
    Result, ServerApi, SyncConfig, SyncDelegate, UploadEngine, UploadOutcome, UploadRequest,
};

struct StaticServer {
    index: Mutex<FileIndex>,
}

impl StaticServer {
    fn new(files: Vec<FileInfo>, master_version: i64) -> Arc<Self> {
        Arc::new(Self {
            index: Mutex::new(FileIndex {
                files,
                master_version,
                sharing_group_name: None,
            }),
        })
    }
}

#[async_trait]
impl ServerApi for StaticServer {
    async fn index(&self, _sharing_group: Uuid) -> Result<FileIndex> {
        Ok(self.index.lock().unwrap().clone())
    }

    async fn download_file(&self, _request: DownloadRequest) -> Result<DownloadFileResult> {
        Ok(DownloadFileResult::Success(Box::new(DownloadedFile {
            local_path: None,
            app_meta_data: None,
            checksum: None,
            contents_changed: false,
            gone: None,
        })))
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
        Ok(DoneUploadsResult::Committed { num_transferred: 1 })
    }
}

struct SilentDelegate;

#[async_trait]
impl SyncDelegate for SilentDelegate {}

fn file_info(sharing: Uuid) -> FileInfo {
    FileInfo {
        file_uuid: Uuid::new_v4(),
        file_group_uuid: None,
        sharing_group_uuid: sharing,
        file_version: 0,
        app_meta_data_version: None,
        deleted: false,
        gone: None,
        mime_type: Some("text/plain".to_string()),
        cloud_storage_type: Some("Google".to_string()),
    }
}

#[tokio::test]
async fn check_with_outstanding_trackers_does_not_duplicate() {
    let sharing = Uuid::new_v4();
    let server = StaticServer::new(vec![file_info(sharing), file_info(sharing)], 1);
    let store = AsyncRecordStore::open_in_memory().await.unwrap();
    let engine = DownloadEngine::new(store.clone(), server, SyncConfig::default());

    let first = engine.check(sharing).await.unwrap();
    assert!(matches!(
        first,
        DownloadCheckOutcome::DownloadsAvailable { files: 2, .. }
    ));

    // A second check while trackers are outstanding creates nothing new
    engine.check(sharing).await.unwrap();
    let groups = store
        .inspect(move |s: &RecordStore| -> Result<usize> {
            Ok(s.download_groups(&sharing)?.len())
        })
        .await
        .unwrap();
    assert_eq!(groups, 2);
}

#[tokio::test]
async fn matching_local_and_server_deletions_auto_resolve() {
    use chrono::Utc;
    use cirrus_store::{
        DirectoryEntry, DownloadFileTracker, DownloadKind, DownloadStatus,
    };

    let sharing = Uuid::new_v4();
    let f1 = Uuid::new_v4();
    let store = AsyncRecordStore::open_in_memory().await.unwrap();
    let server = StaticServer::new(vec![], 0);

    store
        .perform(move |s: &mut RecordStore| -> Result<()> {
            let mut entry = DirectoryEntry::new(f1, sharing);
            entry.file_version = Some(2);
            s.upsert_entry(&entry)?;
            Ok(())
        })
        .await
        .unwrap();

    let uploads = UploadEngine::new(store.clone(), server);
    uploads.queue_deletion(f1, sharing).await.unwrap();

    let conflicts = ConflictManager::new(store.clone(), Arc::new(SilentDelegate));
    let deletion = DownloadFileTracker {
        id: 1,
        file_uuid: f1,
        file_version: 2,
        sharing_group_uuid: sharing,
        group_key: f1,
        kind: DownloadKind::Deletion,
        status: DownloadStatus::Downloaded,
        gone: None,
        contents_changed_on_server: false,
        app_meta_data: None,
        app_meta_data_version: None,
        mime_type: None,
        cloud_storage_type: None,
        local_path: None,
        checksum: None,
        created_at: Utc::now(),
    };

    // Both sides agree: the local deletion tracker is silently dropped and
    // the download-deletion is confirmed without any policy callback
    let outcome = conflicts
        .handle_download_deletion_conflicts(&[deletion])
        .await
        .unwrap();
    assert_eq!(outcome.confirmed, vec![f1]);
    assert_eq!(outcome.conflicts_resolved, 0);

    let remaining = store
        .inspect(move |s: &RecordStore| -> Result<usize> {
            Ok(s.uploads_for_file(&f1)?.len())
        })
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn download_then_upload_round_trip_on_one_store() {
    let sharing = Uuid::new_v4();
    let info = file_info(sharing);
    let file = info.file_uuid;
    let server = StaticServer::new(vec![info], 1);
    let store = AsyncRecordStore::open_in_memory().await.unwrap();

    let downloads = DownloadEngine::new(store.clone(), server.clone(), SyncConfig::default());
    let uploads = UploadEngine::new(store.clone(), server);

    downloads.check(sharing).await.unwrap();
    let step = downloads.next(sharing).await.unwrap();
    let tracker = match step {
        DownloadStep::Downloaded(tracker) => tracker,
        other => panic!("expected a download, got {other:?}"),
    };

    store
        .perform(move |s: &mut RecordStore| -> Result<()> {
            cirrus_sync::Directory::update_after_downloading(s, &[tracker])?;
            Ok(())
        })
        .await
        .unwrap();

    // The freshly downloaded file can immediately stage a new version
    let id = uploads
        .queue_upload(cirrus_sync::UploadAttributes {
            file_uuid: file,
            file_group_uuid: None,
            sharing_group_uuid: sharing,
            mime_type: Some("text/plain".to_string()),
            app_meta_data: None,
            local_path: None,
            checksum: None,
        })
        .await
        .unwrap();

    let staged = store
        .inspect(move |s: &RecordStore| -> Result<Option<cirrus_store::UploadFileTracker>> {
            Ok(s.upload_tracker(id)?)
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(staged.file_version, Some(1));
    assert_eq!(staged.status, UploadStatus::NotStarted);
}
