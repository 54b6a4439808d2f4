/// Database schema version
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the record store
pub const SCHEMA: &str = r#"
-- Enable WAL mode for better concurrency
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- Local mirror of server file metadata, one row per file UUID
CREATE TABLE IF NOT EXISTS directory_entries (
    file_uuid TEXT PRIMARY KEY,
    file_group_uuid TEXT,
    sharing_group_uuid TEXT NOT NULL,
    file_version INTEGER,
    app_meta_data TEXT,
    app_meta_data_version INTEGER,
    mime_type TEXT,
    cloud_storage_type TEXT,
    deleted_locally INTEGER NOT NULL DEFAULT 0,
    deleted_on_server INTEGER NOT NULL DEFAULT 0,
    gone TEXT,
    force_download INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_sharing_group
    ON directory_entries(sharing_group_uuid);
CREATE INDEX IF NOT EXISTS idx_entries_file_group
    ON directory_entries(file_group_uuid);

-- Download content groups: the atomicity unit for grouped downloads
CREATE TABLE IF NOT EXISTS download_groups (
    group_key TEXT PRIMARY KEY,
    sharing_group_uuid TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Download trackers, bulk-created by index checks
CREATE TABLE IF NOT EXISTS download_trackers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_uuid TEXT NOT NULL,
    file_version INTEGER NOT NULL,
    sharing_group_uuid TEXT NOT NULL,
    group_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    gone TEXT,
    contents_changed INTEGER NOT NULL DEFAULT 0,
    app_meta_data TEXT,
    app_meta_data_version INTEGER,
    mime_type TEXT,
    cloud_storage_type TEXT,
    local_path TEXT,
    checksum TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (group_key) REFERENCES download_groups(group_key)
);

CREATE INDEX IF NOT EXISTS idx_dft_group ON download_trackers(group_key);
CREATE INDEX IF NOT EXISTS idx_dft_status ON download_trackers(status);
CREATE INDEX IF NOT EXISTS idx_dft_file ON download_trackers(file_uuid);

-- Upload queues: one pendingSync queue plus the synced FIFO set
CREATE TABLE IF NOT EXISTS upload_queues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Upload trackers; row id doubles as insertion-order age
CREATE TABLE IF NOT EXISTS upload_trackers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id INTEGER NOT NULL,
    file_uuid TEXT NOT NULL,
    file_group_uuid TEXT,
    sharing_group_uuid TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    file_version INTEGER,
    app_meta_data TEXT,
    app_meta_data_version INTEGER,
    mime_type TEXT,
    local_path TEXT,
    checksum TEXT,
    upload_undeletion INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (queue_id) REFERENCES upload_queues(id)
);

CREATE INDEX IF NOT EXISTS idx_uft_queue ON upload_trackers(queue_id);
CREATE INDEX IF NOT EXISTS idx_uft_file ON upload_trackers(file_uuid);
CREATE INDEX IF NOT EXISTS idx_uft_status ON upload_trackers(status);

-- Local mirror of sharing group server state
CREATE TABLE IF NOT EXISTS sharing_entries (
    sharing_group_uuid TEXT PRIMARY KEY,
    name TEXT,
    master_version INTEGER NOT NULL DEFAULT 0,
    deleted_on_server INTEGER NOT NULL DEFAULT 0,
    removed_from_group INTEGER NOT NULL DEFAULT 0,
    sync_needed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- Singleton row holding cross-cycle process state
CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pending_queue_id INTEGER,
    FOREIGN KEY (pending_queue_id) REFERENCES upload_queues(id)
);

INSERT OR IGNORE INTO sync_state (id, pending_queue_id) VALUES (1, NULL);
"#;
