use crate::events::EventMask;

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum trackers in one download batch. Whole content groups are
    /// always started together, so a single large group may exceed this.
    pub max_download_batch: usize,
    /// How many whole-batch invalidations (master version resets) one sync
    /// cycle tolerates before giving up
    pub max_master_version_retries: u32,
    /// Which lifecycle events the delegate wants delivered
    pub event_mask: EventMask,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_download_batch: 10,
            max_master_version_retries: 5,
            event_mask: EventMask::DEFAULT,
        }
    }
}
