//! Sync orchestration
//!
//! Drives the overall state machine per sharing group: check downloads, run
//! downloads, resolve conflicts, update the directory, then check and commit
//! uploads, looping until quiescent. Exactly one sync cycle is logically
//! active per process; concurrent `sync` calls coalesce into at most one
//! re-run after the current cycle finishes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cirrus_store::{
    AsyncRecordStore, DownloadFileTracker, DownloadKind, RecordStore, UploadKind,
};

use crate::config::SyncConfig;
use crate::conflict::{ConflictManager, ContentDecision, DeletionOutcome};
use crate::directory::Directory;
use crate::download::{DownloadCheckOutcome, DownloadEngine, DownloadStep};
use crate::errors::{Result, SyncError};
use crate::events::{DownloadedItem, SyncDelegate, SyncEvent, SyncStats};
use crate::server::ServerApi;
use crate::upload::{UploadEngine, UploadStep};

#[derive(Debug, Default)]
struct ControlFlags {
    sync_operating: bool,
    delayed_sync: bool,
    stop_requested: bool,
}

/// The explicit work loop replacing recursive continuation chains: each
/// iteration consumes one step and chooses the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    CheckDownloads,
    ProcessDownloads,
    CheckUploads,
    ProcessUploads,
    Done,
}

pub struct SyncManager {
    store: AsyncRecordStore,
    delegate: Arc<dyn SyncDelegate>,
    config: SyncConfig,
    downloads: DownloadEngine,
    uploads: UploadEngine,
    conflicts: ConflictManager,
    control: Mutex<ControlFlags>,
}

impl SyncManager {
    pub fn new(
        store: AsyncRecordStore,
        server: Arc<dyn ServerApi>,
        delegate: Arc<dyn SyncDelegate>,
        config: SyncConfig,
    ) -> Self {
        let downloads = DownloadEngine::new(store.clone(), Arc::clone(&server), config.clone());
        let uploads = UploadEngine::new(store.clone(), Arc::clone(&server));
        let conflicts = ConflictManager::new(store.clone(), Arc::clone(&delegate));
        Self {
            store,
            delegate,
            config,
            downloads,
            uploads,
            conflicts,
            control: Mutex::new(ControlFlags::default()),
        }
    }

    /// Access to the staging API
    pub fn uploads(&self) -> &UploadEngine {
        &self.uploads
    }

    /// Request that the running cycle stop at its next checkpoint. The flag
    /// is read-and-clear: once observed it resets itself, and in-flight
    /// network calls are not aborted, only the next step is skipped.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        control.stop_requested = true;
        debug!("Sync stop requested");
    }

    /// Run a sync cycle for the sharing group, coalescing with any cycle
    /// already in flight.
    pub async fn sync(&self, sharing_group: Uuid) -> Result<()> {
        {
            let mut control = self.control.lock().await;
            if control.sync_operating {
                // At most one re-run after the current cycle finishes
                control.delayed_sync = true;
                debug!("Sync already operating; coalesced");
                return Ok(());
            }
            control.sync_operating = true;
        }

        let mut outcome = self.run_guarded(sharing_group).await;
        loop {
            let rerun = {
                let mut control = self.control.lock().await;
                if outcome.is_ok() && control.delayed_sync {
                    control.delayed_sync = false;
                    true
                } else {
                    control.sync_operating = false;
                    control.delayed_sync = false;
                    false
                }
            };
            if !rerun {
                break;
            }
            outcome = self.run_guarded(sharing_group).await;
        }

        outcome.map(|_| ())
    }

    async fn run_guarded(&self, sharing_group: Uuid) -> Result<SyncStats> {
        self.emit(SyncEvent::SyncStarted);
        let result = self.run_cycle(sharing_group).await;
        match &result {
            Ok(stats) => {
                info!(?stats, "Sync cycle done");
                self.emit(SyncEvent::SyncDone {
                    stats: stats.clone(),
                });
            }
            Err(err) => warn!(%err, "Sync cycle failed"),
        }
        result
    }

    async fn run_cycle(&self, sharing_group: Uuid) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let mut resets: u32 = 0;
        let mut step = Step::CheckDownloads;

        while step != Step::Done {
            step = match step {
                Step::CheckDownloads => {
                    if self.take_stop_request().await {
                        break;
                    }
                    match self.downloads.check(sharing_group).await? {
                        DownloadCheckOutcome::NoDownloadsOrDeletionsAvailable => {
                            self.store
                                .perform(move |s| -> Result<()> {
                                    Ok(s.set_sync_needed(&sharing_group, false)?)
                                })
                                .await?;
                            Step::CheckUploads
                        }
                        DownloadCheckOutcome::DownloadsAvailable { .. } => Step::ProcessDownloads,
                    }
                }
                Step::ProcessDownloads => match self.downloads.next(sharing_group).await? {
                    DownloadStep::Downloaded(_) | DownloadStep::NothingQueued => {
                        self.settle_completed_groups(sharing_group, &mut stats)
                            .await?;
                        let pending = self
                            .store
                            .inspect(move |s| -> Result<usize> {
                                Ok(s.pending_download_count(&sharing_group)?)
                            })
                            .await?;
                        if pending == 0 {
                            // Batch drained; the server may have moved on
                            // meanwhile, so re-check before uploads run
                            Step::CheckDownloads
                        } else {
                            Step::ProcessDownloads
                        }
                    }
                    DownloadStep::MasterVersionReset => {
                        resets += 1;
                        stats.master_version_resets += 1;
                        if resets > self.config.max_master_version_retries {
                            return Err(SyncError::RetriesExhausted(resets));
                        }
                        Step::CheckDownloads
                    }
                },
                Step::CheckUploads => {
                    if self.take_stop_request().await {
                        break;
                    }
                    self.uploads.promote_pending_queue().await?;
                    if self.uploads.has_queued_batch().await? {
                        Step::ProcessUploads
                    } else {
                        self.store
                            .perform(|s| -> Result<()> {
                                s.gc_upload_queues()?;
                                Ok(())
                            })
                            .await?;
                        Step::Done
                    }
                }
                Step::ProcessUploads => match self.uploads.next(sharing_group).await? {
                    UploadStep::Uploaded(tracker) => {
                        match tracker.kind {
                            UploadKind::Deletion => {
                                stats.upload_deletions += 1;
                                self.emit(SyncEvent::UploadDeletionComplete {
                                    file_uuid: tracker.file_uuid,
                                });
                            }
                            _ => {
                                stats.files_uploaded += 1;
                                self.emit(SyncEvent::FileUploadComplete {
                                    file_uuid: tracker.file_uuid,
                                });
                            }
                        }
                        Step::ProcessUploads
                    }
                    UploadStep::QueueCommitted { num_transferred } => {
                        stats.upload_batches_committed += 1;
                        self.emit(SyncEvent::UploadsCompleted { num_transferred });
                        Step::CheckUploads
                    }
                    UploadStep::MasterVersionReset => {
                        resets += 1;
                        stats.master_version_resets += 1;
                        if resets > self.config.max_master_version_retries {
                            return Err(SyncError::RetriesExhausted(resets));
                        }
                        // Server state must be re-absorbed before the
                        // client's view can be trusted again
                        Step::CheckDownloads
                    }
                    UploadStep::NothingQueued => Step::CheckUploads,
                },
                Step::Done => Step::Done,
            };
        }

        Ok(stats)
    }

    /// Settle every fully-terminal content group: adjudicate conflicts,
    /// inform the consumer, then update the directory and remove the group.
    ///
    /// The consumer is informed before the directory mutates: a crash
    /// between the two risks a duplicate notification, never silent state
    /// loss.
    async fn settle_completed_groups(
        &self,
        sharing_group: Uuid,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let completed = self.downloads.completed_groups(sharing_group).await?;

        for (group, trackers) in completed {
            let deletions: Vec<DownloadFileTracker> = trackers
                .iter()
                .filter(|t| t.kind == DownloadKind::Deletion)
                .cloned()
                .collect();
            let contents: Vec<DownloadFileTracker> = trackers
                .into_iter()
                .filter(|t| t.kind != DownloadKind::Deletion)
                .collect();

            let mut applied = Vec::new();
            let mut discarded = Vec::new();
            let mut gone_items = Vec::new();
            for tracker in contents {
                if tracker.gone.is_some() {
                    gone_items.push(tracker);
                    continue;
                }
                let (decision, resolved) = self
                    .conflicts
                    .handle_file_download_conflict(&tracker)
                    .await?;
                if resolved {
                    stats.conflicts_resolved += 1;
                }
                match decision {
                    ContentDecision::ApplyDownload => applied.push(tracker),
                    ContentDecision::DiscardDownload => discarded.push(tracker),
                }
            }

            let deletion_outcome = if deletions.is_empty() {
                DeletionOutcome::default()
            } else {
                self.conflicts
                    .handle_download_deletion_conflicts(&deletions)
                    .await?
            };
            stats.conflicts_resolved += deletion_outcome.conflicts_resolved;

            // Inform the consumer first
            if !applied.is_empty() {
                self.emit(SyncEvent::GroupDownloadComplete {
                    items: applied.iter().map(Self::downloaded_item).collect(),
                });
            }
            if !gone_items.is_empty() {
                self.emit(SyncEvent::GroupDownloadGone {
                    items: gone_items.iter().map(Self::downloaded_item).collect(),
                });
            }
            if !deletion_outcome.confirmed.is_empty() {
                self.emit(SyncEvent::DownloadDeletionsComplete {
                    file_uuids: deletion_outcome.confirmed.clone(),
                });
            }

            for tracker in &applied {
                match tracker.kind {
                    DownloadKind::File => stats.files_downloaded += 1,
                    DownloadKind::AppMetaData => stats.app_meta_data_downloaded += 1,
                    DownloadKind::Deletion => {}
                }
            }
            stats.download_deletions_applied += deletion_outcome.confirmed.len();

            // Then update the directory and drop the group
            let group_key = group.group_key;
            self.store
                .perform(move |s: &mut RecordStore| -> Result<()> {
                    let mut to_apply = applied;
                    to_apply.extend(gone_items);
                    Directory::update_after_downloading(s, &to_apply)?;
                    for tracker in &discarded {
                        Directory::note_discarded_download(s, tracker)?;
                    }
                    Directory::update_after_download_deleting_files(
                        s,
                        &deletion_outcome.confirmed,
                        &deletion_outcome.kept_undeletions,
                    )?;
                    s.remove_download_group(&group_key)?;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    fn downloaded_item(tracker: &DownloadFileTracker) -> DownloadedItem {
        DownloadedItem {
            file_uuid: tracker.file_uuid,
            file_version: tracker.file_version,
            kind: tracker.kind,
            local_path: tracker.local_path.as_ref().map(PathBuf::from),
            app_meta_data: tracker.app_meta_data.clone(),
            gone: tracker.gone,
        }
    }

    fn emit(&self, event: SyncEvent) {
        if self.config.event_mask.contains(event.mask()) {
            self.delegate.event(event);
        }
    }

    /// Read-and-clear stop checkpoint
    async fn take_stop_request(&self) -> bool {
        let mut control = self.control.lock().await;
        if control.stop_requested {
            control.stop_requested = false;
            info!("Sync stopping at checkpoint");
            true
        } else {
            false
        }
    }
}
