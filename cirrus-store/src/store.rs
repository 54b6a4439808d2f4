//! Persistent record store
//!
//! All sync records live in a single sqlite database. `RecordStore` owns the
//! connection and exposes typed accessors; `AsyncRecordStore` wraps it for
//! use across async tasks. The async wrapper's write lock is the process-wide
//! serialization point: every read-modify-write sequence the engines run
//! executes inside one `perform` block, and multi-statement mutations
//! additionally commit inside a sqlite transaction.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Result, StoreError};
use crate::records::*;
use crate::schema::{SCHEMA, SCHEMA_VERSION};

fn text_err(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognized value: {value}").into(),
    )
}

fn read_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_opt_uuid(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    match s {
        Some(s) => read_uuid(idx, s).map(Some),
        None => Ok(None),
    }
}

fn read_time(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn read_gone(idx: usize, s: Option<String>) -> rusqlite::Result<Option<GoneReason>> {
    match s {
        Some(s) => GoneReason::parse(&s).map(Some).ok_or_else(|| text_err(idx, &s)),
        None => Ok(None),
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<DirectoryEntry> {
    Ok(DirectoryEntry {
        file_uuid: read_uuid(0, row.get(0)?)?,
        file_group_uuid: read_opt_uuid(1, row.get(1)?)?,
        sharing_group_uuid: read_uuid(2, row.get(2)?)?,
        file_version: row.get(3)?,
        app_meta_data: row.get(4)?,
        app_meta_data_version: row.get(5)?,
        mime_type: row.get(6)?,
        cloud_storage_type: row.get(7)?,
        deleted_locally: row.get(8)?,
        deleted_on_server: row.get(9)?,
        gone: read_gone(10, row.get(10)?)?,
        force_download: row.get(11)?,
        updated_at: read_time(row.get(12)?),
    })
}

const ENTRY_COLUMNS: &str = "file_uuid, file_group_uuid, sharing_group_uuid, file_version, \
     app_meta_data, app_meta_data_version, mime_type, cloud_storage_type, \
     deleted_locally, deleted_on_server, gone, force_download, updated_at";

fn dft_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadFileTracker> {
    let kind_s: String = row.get(5)?;
    let status_s: String = row.get(6)?;
    Ok(DownloadFileTracker {
        id: row.get(0)?,
        file_uuid: read_uuid(1, row.get(1)?)?,
        file_version: row.get(2)?,
        sharing_group_uuid: read_uuid(3, row.get(3)?)?,
        group_key: read_uuid(4, row.get(4)?)?,
        kind: DownloadKind::parse(&kind_s).ok_or_else(|| text_err(5, &kind_s))?,
        status: DownloadStatus::parse(&status_s).ok_or_else(|| text_err(6, &status_s))?,
        gone: read_gone(7, row.get(7)?)?,
        contents_changed_on_server: row.get(8)?,
        app_meta_data: row.get(9)?,
        app_meta_data_version: row.get(10)?,
        mime_type: row.get(11)?,
        cloud_storage_type: row.get(12)?,
        local_path: row.get(13)?,
        checksum: row.get(14)?,
        created_at: read_time(row.get(15)?),
    })
}

const DFT_COLUMNS: &str = "id, file_uuid, file_version, sharing_group_uuid, group_key, kind, \
     status, gone, contents_changed, app_meta_data, app_meta_data_version, \
     mime_type, cloud_storage_type, local_path, checksum, created_at";

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadContentGroup> {
    let status_s: String = row.get(2)?;
    Ok(DownloadContentGroup {
        group_key: read_uuid(0, row.get(0)?)?,
        sharing_group_uuid: read_uuid(1, row.get(1)?)?,
        status: GroupStatus::parse(&status_s).ok_or_else(|| text_err(2, &status_s))?,
        created_at: read_time(row.get(3)?),
    })
}

fn uft_from_row(row: &Row<'_>) -> rusqlite::Result<UploadFileTracker> {
    let kind_s: String = row.get(5)?;
    let status_s: String = row.get(6)?;
    Ok(UploadFileTracker {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        file_uuid: read_uuid(2, row.get(2)?)?,
        file_group_uuid: read_opt_uuid(3, row.get(3)?)?,
        sharing_group_uuid: read_uuid(4, row.get(4)?)?,
        kind: UploadKind::parse(&kind_s).ok_or_else(|| text_err(5, &kind_s))?,
        status: UploadStatus::parse(&status_s).ok_or_else(|| text_err(6, &status_s))?,
        file_version: row.get(7)?,
        app_meta_data: row.get(8)?,
        app_meta_data_version: row.get(9)?,
        mime_type: row.get(10)?,
        local_path: row.get(11)?,
        checksum: row.get(12)?,
        upload_undeletion: row.get(13)?,
        created_at: read_time(row.get(14)?),
    })
}

const UFT_COLUMNS: &str = "id, queue_id, file_uuid, file_group_uuid, sharing_group_uuid, kind, \
     status, file_version, app_meta_data, app_meta_data_version, mime_type, \
     local_path, checksum, upload_undeletion, created_at";

fn queue_from_row(row: &Row<'_>) -> rusqlite::Result<UploadQueue> {
    let state_s: String = row.get(1)?;
    Ok(UploadQueue {
        id: row.get(0)?,
        state: QueueState::parse(&state_s).ok_or_else(|| text_err(1, &state_s))?,
        created_at: read_time(row.get(2)?),
    })
}

fn sharing_from_row(row: &Row<'_>) -> rusqlite::Result<SharingEntry> {
    Ok(SharingEntry {
        sharing_group_uuid: read_uuid(0, row.get(0)?)?,
        name: row.get(1)?,
        master_version: row.get(2)?,
        deleted_on_server: row.get(3)?,
        removed_from_group: row.get(4)?,
        sync_needed: row.get(5)?,
        updated_at: read_time(row.get(6)?),
    })
}

/// A download tracker about to be inserted by an index check
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub file_uuid: Uuid,
    pub file_version: i64,
    pub sharing_group_uuid: Uuid,
    pub group_key: Uuid,
    pub kind: DownloadKind,
    pub gone: Option<GoneReason>,
    pub contents_changed: bool,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: Option<String>,
    pub cloud_storage_type: Option<String>,
}

/// An upload tracker about to be staged by the client API
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_uuid: Uuid,
    pub file_group_uuid: Option<Uuid>,
    pub sharing_group_uuid: Uuid,
    pub kind: UploadKind,
    pub file_version: Option<i64>,
    pub app_meta_data: Option<String>,
    pub app_meta_data_version: Option<i64>,
    pub mime_type: Option<String>,
    pub local_path: Option<String>,
    pub checksum: Option<String>,
}

/// Record store backed by sqlite
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    /// Open or create a record store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&mut self) -> Result<()> {
        let version: Option<u32> = self
            .conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        match version {
            None => {
                info!("Initializing new record store schema");
                self.conn.execute_batch(SCHEMA)?;
                self.conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    actual: v,
                });
            }
        }
        Ok(())
    }

    /// Crash-recovery sweep: any tracker left mid-transfer by a previous
    /// process is reset so the next cycle retries it.
    pub fn recover_interrupted(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let downloads = tx.execute(
            "UPDATE download_trackers SET status = ?1 WHERE status = ?2",
            params![DownloadStatus::NotStarted.as_str(), DownloadStatus::Downloading.as_str()],
        )?;
        let uploads = tx.execute(
            "UPDATE upload_trackers SET status = ?1 WHERE status = ?2",
            params![UploadStatus::NotStarted.as_str(), UploadStatus::Uploading.as_str()],
        )?;
        tx.commit()?;

        let total = downloads + uploads;
        if total > 0 {
            info!(downloads, uploads, "Reset interrupted trackers after restart");
        }
        Ok(total)
    }

    // ---- directory entries ----

    pub fn upsert_entry(&mut self, entry: &DirectoryEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO directory_entries
                (file_uuid, file_group_uuid, sharing_group_uuid, file_version,
                 app_meta_data, app_meta_data_version, mime_type, cloud_storage_type,
                 deleted_locally, deleted_on_server, gone, force_download, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(file_uuid) DO UPDATE SET
                file_group_uuid = excluded.file_group_uuid,
                sharing_group_uuid = excluded.sharing_group_uuid,
                file_version = excluded.file_version,
                app_meta_data = excluded.app_meta_data,
                app_meta_data_version = excluded.app_meta_data_version,
                mime_type = excluded.mime_type,
                cloud_storage_type = excluded.cloud_storage_type,
                deleted_locally = excluded.deleted_locally,
                deleted_on_server = excluded.deleted_on_server,
                gone = excluded.gone,
                force_download = excluded.force_download,
                updated_at = excluded.updated_at
            "#,
            params![
                entry.file_uuid.to_string(),
                entry.file_group_uuid.map(|u| u.to_string()),
                entry.sharing_group_uuid.to_string(),
                entry.file_version,
                entry.app_meta_data,
                entry.app_meta_data_version,
                entry.mime_type,
                entry.cloud_storage_type,
                entry.deleted_locally,
                entry.deleted_on_server,
                entry.gone.map(|g| g.as_str()),
                entry.force_download,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn entry(&self, file_uuid: &Uuid) -> Result<Option<DirectoryEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM directory_entries WHERE file_uuid = ?1");
        let result = self
            .conn
            .query_row(&sql, params![file_uuid.to_string()], entry_from_row)
            .optional()?;
        Ok(result)
    }

    pub fn entries(&self, sharing_group: &Uuid) -> Result<Vec<DirectoryEntry>> {
        let sql =
            format!("SELECT {ENTRY_COLUMNS} FROM directory_entries WHERE sharing_group_uuid = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![sharing_group.to_string()], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Physical removal; used only by explicit repair
    pub fn remove_entry(&mut self, file_uuid: &Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM directory_entries WHERE file_uuid = ?1",
            params![file_uuid.to_string()],
        )?;
        Ok(())
    }

    // ---- download trackers and groups ----

    /// Bulk tracker creation for one index check. Groups are created as
    /// needed and the whole batch commits atomically.
    pub fn insert_download_batch(&mut self, downloads: &[NewDownload]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for d in downloads {
            tx.execute(
                "INSERT OR IGNORE INTO download_groups (group_key, sharing_group_uuid, status, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    d.group_key.to_string(),
                    d.sharing_group_uuid.to_string(),
                    GroupStatus::NotStarted.as_str(),
                    now,
                ],
            )?;
            tx.execute(
                r#"
                INSERT INTO download_trackers
                    (file_uuid, file_version, sharing_group_uuid, group_key, kind, status,
                     gone, contents_changed, app_meta_data_version, mime_type,
                     cloud_storage_type, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    d.file_uuid.to_string(),
                    d.file_version,
                    d.sharing_group_uuid.to_string(),
                    d.group_key.to_string(),
                    d.kind.as_str(),
                    DownloadStatus::NotStarted.as_str(),
                    d.gone.map(|g| g.as_str()),
                    d.contents_changed,
                    d.app_meta_data_version,
                    d.mime_type,
                    d.cloud_storage_type,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        debug!(count = downloads.len(), "Inserted download batch");
        Ok(downloads.len())
    }

    /// Content groups for a sharing group, oldest first
    pub fn download_groups(&self, sharing_group: &Uuid) -> Result<Vec<DownloadContentGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_key, sharing_group_uuid, status, created_at
             FROM download_groups WHERE sharing_group_uuid = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![sharing_group.to_string()], group_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn trackers_in_group(&self, group_key: &Uuid) -> Result<Vec<DownloadFileTracker>> {
        let sql =
            format!("SELECT {DFT_COLUMNS} FROM download_trackers WHERE group_key = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![group_key.to_string()], dft_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn download_tracker(&self, id: i64) -> Result<Option<DownloadFileTracker>> {
        let sql = format!("SELECT {DFT_COLUMNS} FROM download_trackers WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id], dft_from_row).optional()?)
    }

    pub fn downloading_count(&self, sharing_group: &Uuid) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM download_trackers
             WHERE sharing_group_uuid = ?1 AND status = ?2",
            params![sharing_group.to_string(), DownloadStatus::Downloading.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Trackers not yet terminal for a sharing group
    pub fn pending_download_count(&self, sharing_group: &Uuid) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM download_trackers
             WHERE sharing_group_uuid = ?1 AND status != ?2 AND gone IS NULL",
            params![sharing_group.to_string(), DownloadStatus::Downloaded.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn set_download_status(&mut self, id: i64, status: DownloadStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE download_trackers SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Record the artifact of a successful transfer and mark the tracker
    /// terminal
    #[allow(clippy::too_many_arguments)]
    pub fn record_download_success(
        &mut self,
        id: i64,
        local_path: Option<&str>,
        app_meta_data: Option<&str>,
        checksum: Option<&str>,
        contents_changed: bool,
        gone: Option<GoneReason>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE download_trackers
             SET status = ?1, local_path = ?2, app_meta_data = ?3, checksum = ?4,
                 contents_changed = ?5, gone = ?6
             WHERE id = ?7",
            params![
                DownloadStatus::Downloaded.as_str(),
                local_path,
                app_meta_data,
                checksum,
                contents_changed,
                gone.map(|g| g.as_str()),
                id,
            ],
        )?;
        Ok(())
    }

    /// Master-version invalidation: discard every outstanding tracker and
    /// group for the sharing group in one transaction.
    pub fn clear_downloads(&mut self, sharing_group: &Uuid) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM download_trackers WHERE sharing_group_uuid = ?1",
            params![sharing_group.to_string()],
        )?;
        tx.execute(
            "DELETE FROM download_groups WHERE sharing_group_uuid = ?1",
            params![sharing_group.to_string()],
        )?;
        tx.commit()?;
        if removed > 0 {
            warn!(removed, %sharing_group, "Discarded outstanding downloads");
        }
        Ok(removed)
    }

    /// Cascade-remove a completed group and its trackers
    pub fn remove_download_group(&mut self, group_key: &Uuid) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM download_trackers WHERE group_key = ?1",
            params![group_key.to_string()],
        )?;
        tx.execute(
            "DELETE FROM download_groups WHERE group_key = ?1",
            params![group_key.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_group_status(&mut self, group_key: &Uuid, status: GroupStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE download_groups SET status = ?1 WHERE group_key = ?2",
            params![status.as_str(), group_key.to_string()],
        )?;
        Ok(())
    }

    // ---- upload queues and trackers ----

    /// Id of the queue the client API is currently appending to; created on
    /// first use.
    pub fn pending_queue_id(&mut self) -> Result<i64> {
        let existing: Option<i64> = self.conn.query_row(
            "SELECT pending_queue_id FROM sync_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO upload_queues (state, created_at) VALUES (?1, ?2)",
            params![QueueState::PendingSync.as_str(), Utc::now().to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sync_state SET pending_queue_id = ?1 WHERE id = 1",
            params![id],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Append a staged upload to the pending-sync queue
    pub fn append_upload(&mut self, upload: &NewUpload) -> Result<i64> {
        let queue_id = self.pending_queue_id()?;
        self.conn.execute(
            r#"
            INSERT INTO upload_trackers
                (queue_id, file_uuid, file_group_uuid, sharing_group_uuid, kind, status,
                 file_version, app_meta_data, app_meta_data_version, mime_type,
                 local_path, checksum, upload_undeletion, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13)
            "#,
            params![
                queue_id,
                upload.file_uuid.to_string(),
                upload.file_group_uuid.map(|u| u.to_string()),
                upload.sharing_group_uuid.to_string(),
                upload.kind.as_str(),
                UploadStatus::NotStarted.as_str(),
                upload.file_version,
                upload.app_meta_data,
                upload.app_meta_data_version,
                upload.mime_type,
                upload.local_path,
                upload.checksum,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn upload_tracker(&self, id: i64) -> Result<Option<UploadFileTracker>> {
        let sql = format!("SELECT {UFT_COLUMNS} FROM upload_trackers WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id], uft_from_row).optional()?)
    }

    /// Every queued upload for one file across all queues, oldest first.
    /// This is the conflict domain for incoming downloads.
    pub fn uploads_for_file(&self, file_uuid: &Uuid) -> Result<Vec<UploadFileTracker>> {
        let sql =
            format!("SELECT {UFT_COLUMNS} FROM upload_trackers WHERE file_uuid = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![file_uuid.to_string()], uft_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn uploads_in_queue(&self, queue_id: i64) -> Result<Vec<UploadFileTracker>> {
        let sql =
            format!("SELECT {UFT_COLUMNS} FROM upload_trackers WHERE queue_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![queue_id], uft_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Hand the pending queue to the commit path. Returns the promoted queue
    /// id, or `None` when nothing was staged.
    pub fn promote_pending_queue(&mut self) -> Result<Option<i64>> {
        let queue_id = self.pending_queue_id()?;
        let staged: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM upload_trackers WHERE queue_id = ?1",
            params![queue_id],
            |row| row.get(0),
        )?;
        if staged == 0 {
            return Ok(None);
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE upload_queues SET state = ?1 WHERE id = ?2",
            params![QueueState::Synced.as_str(), queue_id],
        )?;
        tx.execute(
            "INSERT INTO upload_queues (state, created_at) VALUES (?1, ?2)",
            params![QueueState::PendingSync.as_str(), Utc::now().to_rfc3339()],
        )?;
        let fresh = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sync_state SET pending_queue_id = ?1 WHERE id = 1",
            params![fresh],
        )?;
        tx.commit()?;

        debug!(queue_id, staged, "Promoted pending queue for commit");
        Ok(Some(queue_id))
    }

    /// Oldest synced queue: the next batch the commit path must drain
    pub fn head_synced_queue(&self) -> Result<Option<UploadQueue>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, state, created_at FROM upload_queues
                 WHERE state = ?1 ORDER BY id LIMIT 1",
                params![QueueState::Synced.as_str()],
                queue_from_row,
            )
            .optional()?)
    }

    pub fn set_upload_status(&mut self, id: i64, status: UploadStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE upload_trackers SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn set_upload_file_version(&mut self, id: i64, version: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE upload_trackers SET file_version = ?1 WHERE id = ?2",
            params![version, id],
        )?;
        Ok(())
    }

    pub fn set_upload_undeletion(&mut self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE upload_trackers SET upload_undeletion = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn remove_upload(&mut self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM upload_trackers WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn uploading_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM upload_trackers WHERE status = ?1",
            params![UploadStatus::Uploading.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Cascade-remove a committed queue and its trackers
    pub fn remove_queue(&mut self, queue_id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM upload_trackers WHERE queue_id = ?1",
            params![queue_id],
        )?;
        tx.execute("DELETE FROM upload_queues WHERE id = ?1", params![queue_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Cleanup after a committed batch: drop trackers erroneously left in
    /// uploaded status inside synced queues, then drop synced queues with no
    /// trackers left. Crash-induced orphans end up here.
    pub fn gc_upload_queues(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let orphans = tx.execute(
            "DELETE FROM upload_trackers WHERE status = ?1 AND queue_id IN
                 (SELECT id FROM upload_queues WHERE state = ?2)",
            params![UploadStatus::Uploaded.as_str(), QueueState::Synced.as_str()],
        )?;
        let queues = tx.execute(
            "DELETE FROM upload_queues WHERE state = ?1 AND id NOT IN
                 (SELECT DISTINCT queue_id FROM upload_trackers)",
            params![QueueState::Synced.as_str()],
        )?;
        tx.commit()?;

        if orphans > 0 || queues > 0 {
            debug!(orphans, queues, "Upload queue garbage collection");
        }
        Ok(orphans + queues)
    }

    // ---- sharing entries ----

    pub fn upsert_sharing_entry(&mut self, entry: &SharingEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sharing_entries
                (sharing_group_uuid, name, master_version, deleted_on_server,
                 removed_from_group, sync_needed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(sharing_group_uuid) DO UPDATE SET
                name = excluded.name,
                master_version = excluded.master_version,
                deleted_on_server = excluded.deleted_on_server,
                removed_from_group = excluded.removed_from_group,
                sync_needed = excluded.sync_needed,
                updated_at = excluded.updated_at
            "#,
            params![
                entry.sharing_group_uuid.to_string(),
                entry.name,
                entry.master_version,
                entry.deleted_on_server,
                entry.removed_from_group,
                entry.sync_needed,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn sharing_entry(&self, sharing_group: &Uuid) -> Result<Option<SharingEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT sharing_group_uuid, name, master_version, deleted_on_server,
                        removed_from_group, sync_needed, updated_at
                 FROM sharing_entries WHERE sharing_group_uuid = ?1",
                params![sharing_group.to_string()],
                sharing_from_row,
            )
            .optional()?)
    }

    pub fn sharing_entries(&self) -> Result<Vec<SharingEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT sharing_group_uuid, name, master_version, deleted_on_server,
                    removed_from_group, sync_needed, updated_at
             FROM sharing_entries ORDER BY sharing_group_uuid",
        )?;
        let rows = stmt.query_map([], sharing_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Client-believed master version for a sharing group; 0 before the
    /// first index response
    pub fn master_version(&self, sharing_group: &Uuid) -> Result<i64> {
        let v: Option<i64> = self
            .conn
            .query_row(
                "SELECT master_version FROM sharing_entries WHERE sharing_group_uuid = ?1",
                params![sharing_group.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0))
    }

    pub fn set_master_version(&mut self, sharing_group: &Uuid, version: i64) -> Result<()> {
        let mut entry = self
            .sharing_entry(sharing_group)?
            .unwrap_or_else(|| SharingEntry::new(*sharing_group));
        entry.master_version = version;
        self.upsert_sharing_entry(&entry)
    }

    pub fn set_sync_needed(&mut self, sharing_group: &Uuid, needed: bool) -> Result<()> {
        let mut entry = self
            .sharing_entry(sharing_group)?
            .unwrap_or_else(|| SharingEntry::new(*sharing_group));
        entry.sync_needed = needed;
        self.upsert_sharing_entry(&entry)
    }
}

/// Async-safe wrapper around [`RecordStore`].
///
/// The write lock serializes every read-modify-write sequence the engines
/// run: a `perform` block has exclusive access for its whole duration.
#[derive(Clone)]
pub struct AsyncRecordStore {
    inner: Arc<RwLock<RecordStore>>,
}

impl AsyncRecordStore {
    pub fn new(store: RecordStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Open or create a store, running the crash-recovery sweep
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = RecordStore::open(path)?;
        store.recover_interrupted()?;
        Ok(Self::new(store))
    }

    /// In-memory store (for testing)
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(RecordStore::open_in_memory()?))
    }

    /// Run a read-modify-write sequence with exclusive access. Generic over
    /// the error type so callers can fail with their own error from inside
    /// the lock.
    pub async fn perform<T, E>(
        &self,
        f: impl FnOnce(&mut RecordStore) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let mut store = self.inner.write().await;
        f(&mut store)
    }

    /// Run a read-only sequence under the shared lock
    pub async fn inspect<T, E>(
        &self,
        f: impl FnOnce(&RecordStore) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let store = self.inner.read().await;
        f(&store)
    }
}
