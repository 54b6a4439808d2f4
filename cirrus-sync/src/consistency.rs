//! Offline consistency checking and repair
//!
//! Compares three views of the world: the server file index, the set of
//! file artifacts actually present locally, and the directory metadata.
//! `check` is a pure diagnostic; `repair` applies the bounded fixes that
//! are safe without re-running a sync cycle.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use cirrus_store::{AsyncRecordStore, DirectoryEntry};

use crate::errors::Result;
use crate::server::ServerApi;

/// Findings of one consistency pass
#[derive(Debug, Clone, Default)]
pub struct ConsistencyReport {
    /// Server files with no directory entry at all
    pub missing_entries: Vec<Uuid>,
    /// Directory entries for files the server index no longer lists
    pub stale_entries: Vec<Uuid>,
    /// Entries that claim a local file the caller's artifact set lacks
    pub missing_local_files: Vec<Uuid>,
    /// Entries whose version is ahead of the server's (should never happen)
    pub version_ahead: Vec<Uuid>,
    /// Entries behind the server's version (pending ordinary sync, not
    /// corruption)
    pub version_behind: Vec<Uuid>,
}

impl ConsistencyReport {
    /// Only genuinely inconsistent findings count; being behind the server
    /// is the normal pre-sync condition
    pub fn is_consistent(&self) -> bool {
        self.missing_entries.is_empty()
            && self.stale_entries.is_empty()
            && self.missing_local_files.is_empty()
            && self.version_ahead.is_empty()
    }
}

/// Counters for an applied repair
#[derive(Debug, Clone, Default)]
pub struct RepairStats {
    pub entries_created: usize,
    pub entries_removed: usize,
    pub trackers_reset: usize,
}

pub struct ConsistencyChecker {
    store: AsyncRecordStore,
    server: Arc<dyn ServerApi>,
}

impl ConsistencyChecker {
    pub fn new(store: AsyncRecordStore, server: Arc<dyn ServerApi>) -> Self {
        Self { store, server }
    }

    /// Diagnose divergence between server index, local artifacts, and
    /// directory metadata. `local_files` is the set of file UUIDs whose
    /// artifacts exist on disk.
    pub async fn check(
        &self,
        sharing_group: Uuid,
        local_files: &HashSet<Uuid>,
    ) -> Result<ConsistencyReport> {
        let index = self.server.index(sharing_group).await?;
        let entries = self
            .store
            .inspect(move |s| -> Result<Vec<DirectoryEntry>> { Ok(s.entries(&sharing_group)?) })
            .await?;

        let mut report = ConsistencyReport::default();
        let listed: HashSet<Uuid> = index.files.iter().map(|f| f.file_uuid).collect();

        for info in &index.files {
            match entries.iter().find(|e| e.file_uuid == info.file_uuid) {
                None => report.missing_entries.push(info.file_uuid),
                Some(entry) => {
                    match entry.file_version {
                        Some(local) if local > info.file_version => {
                            report.version_ahead.push(info.file_uuid)
                        }
                        Some(local) if local < info.file_version => {
                            report.version_behind.push(info.file_uuid)
                        }
                        _ => {}
                    }
                    if !info.deleted
                        && !entry.deleted_locally
                        && entry.gone.is_none()
                        && !local_files.contains(&info.file_uuid)
                    {
                        report.missing_local_files.push(info.file_uuid);
                    }
                }
            }
        }

        for entry in &entries {
            if !listed.contains(&entry.file_uuid) && !entry.deleted_locally {
                report.stale_entries.push(entry.file_uuid);
            }
        }

        if !report.is_consistent() {
            warn!(
                missing = report.missing_entries.len(),
                stale = report.stale_entries.len(),
                missing_local = report.missing_local_files.len(),
                ahead = report.version_ahead.len(),
                "Consistency check found divergence"
            );
        }
        Ok(report)
    }

    /// Apply bounded fixes for a report's findings:
    /// - create force-download entries for server files we have no record
    ///   of, so the next cycle fetches them;
    /// - remove entries for files the server no longer knows;
    /// - mark entries with missing local artifacts for forced re-download;
    /// - reset any tracker left mid-transfer.
    pub async fn repair(
        &self,
        sharing_group: Uuid,
        report: &ConsistencyReport,
    ) -> Result<RepairStats> {
        let index = self.server.index(sharing_group).await?;
        let missing: Vec<Uuid> = report.missing_entries.clone();
        let stale: Vec<Uuid> = report.stale_entries.clone();
        let refetch: Vec<Uuid> = report
            .missing_local_files
            .iter()
            .chain(report.version_ahead.iter())
            .copied()
            .collect();

        let stats = self
            .store
            .perform(move |s| -> Result<RepairStats> {
                let mut stats = RepairStats::default();

                for file_uuid in &missing {
                    let info = index.files.iter().find(|f| f.file_uuid == *file_uuid);
                    if let Some(info) = info {
                        let mut entry = DirectoryEntry::new(*file_uuid, sharing_group);
                        entry.file_group_uuid = info.file_group_uuid;
                        entry.mime_type = info.mime_type.clone();
                        entry.cloud_storage_type = info.cloud_storage_type.clone();
                        if info.deleted {
                            entry.deleted_locally = true;
                            entry.deleted_on_server = true;
                            entry.file_version = Some(info.file_version);
                        } else {
                            entry.force_download = true;
                        }
                        s.upsert_entry(&entry)?;
                        stats.entries_created += 1;
                    }
                }

                for file_uuid in &stale {
                    s.remove_entry(file_uuid)?;
                    stats.entries_removed += 1;
                }

                for file_uuid in &refetch {
                    if let Some(mut entry) = s.entry(file_uuid)? {
                        entry.force_download = true;
                        // Forget the local version so the index check
                        // re-classifies the file as a download
                        entry.file_version = None;
                        s.upsert_entry(&entry)?;
                    }
                }

                stats.trackers_reset = s.recover_interrupted()?;
                Ok(stats)
            })
            .await?;

        info!(
            created = stats.entries_created,
            removed = stats.entries_removed,
            reset = stats.trackers_reset,
            "Repair applied"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        DeletionRequest, DoneUploadsResult, DownloadFileResult, DownloadRequest, FileIndex,
        FileInfo, UploadOutcome, UploadRequest,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct IndexOnlyServer {
        index: Mutex<FileIndex>,
    }

    #[async_trait]
    impl ServerApi for IndexOnlyServer {
        async fn index(&self, _sharing_group: Uuid) -> Result<FileIndex> {
            Ok(self.index.lock().unwrap().clone())
        }
        async fn download_file(&self, _request: DownloadRequest) -> Result<DownloadFileResult> {
            unreachable!()
        }
        async fn upload_file(&self, _request: UploadRequest) -> Result<UploadOutcome> {
            unreachable!()
        }
        async fn upload_app_meta_data(&self, _request: UploadRequest) -> Result<UploadOutcome> {
            unreachable!()
        }
        async fn upload_deletion(&self, _request: DeletionRequest) -> Result<UploadOutcome> {
            unreachable!()
        }
        async fn done_uploads(
            &self,
            _sharing_group: Uuid,
            _master_version: i64,
        ) -> Result<DoneUploadsResult> {
            unreachable!()
        }
    }

    fn file_info(sharing: Uuid, version: i64) -> FileInfo {
        FileInfo {
            file_uuid: Uuid::new_v4(),
            file_group_uuid: None,
            sharing_group_uuid: sharing,
            file_version: version,
            app_meta_data_version: None,
            deleted: false,
            gone: None,
            mime_type: Some("text/plain".to_string()),
            cloud_storage_type: Some("Google".to_string()),
        }
    }

    #[tokio::test]
    async fn test_check_flags_missing_and_stale() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let sharing = Uuid::new_v4();
        let server_file = file_info(sharing, 0);
        let server = Arc::new(IndexOnlyServer {
            index: Mutex::new(FileIndex {
                files: vec![server_file.clone()],
                master_version: 1,
                sharing_group_name: None,
            }),
        });

        // A stale local entry the server does not list
        let stale_uuid = Uuid::new_v4();
        store
            .perform(move |s| -> Result<()> {
                let mut entry = DirectoryEntry::new(stale_uuid, sharing);
                entry.file_version = Some(0);
                s.upsert_entry(&entry)?;
                Ok(())
            })
            .await
            .unwrap();

        let checker = ConsistencyChecker::new(store.clone(), server.clone());
        let report = checker.check(sharing, &HashSet::new()).await.unwrap();
        assert_eq!(report.missing_entries, vec![server_file.file_uuid]);
        assert_eq!(report.stale_entries, vec![stale_uuid]);
        assert!(!report.is_consistent());

        // Repair converges the directory
        let stats = checker.repair(sharing, &report).await.unwrap();
        assert_eq!(stats.entries_created, 1);
        assert_eq!(stats.entries_removed, 1);

        let entry = store
            .inspect(move |s| -> Result<Option<DirectoryEntry>> {
                Ok(s.entry(&server_file.file_uuid)?)
            })
            .await
            .unwrap()
            .unwrap();
        assert!(entry.force_download);
    }

    #[tokio::test]
    async fn test_check_accepts_version_behind_as_consistent() {
        let store = AsyncRecordStore::open_in_memory().await.unwrap();
        let sharing = Uuid::new_v4();
        let info = file_info(sharing, 3);
        let file_uuid = info.file_uuid;
        let server = Arc::new(IndexOnlyServer {
            index: Mutex::new(FileIndex {
                files: vec![info],
                master_version: 1,
                sharing_group_name: None,
            }),
        });

        store
            .perform(move |s| -> Result<()> {
                let mut entry = DirectoryEntry::new(file_uuid, sharing);
                entry.file_version = Some(1);
                s.upsert_entry(&entry)?;
                Ok(())
            })
            .await
            .unwrap();

        let checker = ConsistencyChecker::new(store, server);
        let mut local = HashSet::new();
        local.insert(file_uuid);
        let report = checker.check(sharing, &local).await.unwrap();
        assert_eq!(report.version_behind, vec![file_uuid]);
        assert!(report.is_consistent());
    }
}
