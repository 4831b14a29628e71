//! FFI-safe types with UniFFI derives.
//!
//! These types mirror the crate's types with dates flattened to
//! `YYYY-MM-DD` strings. Conversion is done at the FFI boundary.

use chrono::NaiveDate;

use crate::cache::CacheEvent;
use crate::coordinator::RequestOutcome;
use crate::types::{CachedStats, SyncOutcome, SyncProgress, SyncStatus};

fn date_string(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// Sync progress for FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiSyncProgress {
    pub status: SyncStatus,
    pub completed: u32,
    pub total: u32,
    pub message: Option<String>,
}

impl From<SyncProgress> for FfiSyncProgress {
    fn from(p: SyncProgress) -> Self {
        Self {
            status: p.status,
            completed: p.completed,
            total: p.total,
            message: p.message,
        }
    }
}

impl From<&SyncProgress> for FfiSyncProgress {
    fn from(p: &SyncProgress) -> Self {
        p.clone().into()
    }
}

/// Cache summary for the settings screen
#[derive(Debug, Clone, Default, PartialEq, uniffi::Record)]
pub struct FfiCachedStats {
    pub total_activities: u32,
    /// `YYYY-MM-DD`
    pub oldest_date: Option<String>,
    /// `YYYY-MM-DD`
    pub newest_date: Option<String>,
    /// RFC 3339
    pub last_sync_date: Option<String>,
    pub is_provisional: bool,
    pub last_sync_incomplete: bool,
}

impl From<CachedStats> for FfiCachedStats {
    fn from(s: CachedStats) -> Self {
        Self {
            total_activities: s.total_activities,
            oldest_date: date_string(s.oldest_date),
            newest_date: date_string(s.newest_date),
            last_sync_date: s.last_sync_date,
            is_provisional: s.is_provisional,
            last_sync_incomplete: s.last_sync_incomplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Enum)]
pub enum FfiSyncOutcome {
    Complete {
        synced: u32,
        failed: u32,
    },
    Incomplete {
        synced: u32,
        failed: u32,
        reason: String,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl From<SyncOutcome> for FfiSyncOutcome {
    fn from(o: SyncOutcome) -> Self {
        match o {
            SyncOutcome::Complete { synced, failed } => Self::Complete { synced, failed },
            SyncOutcome::Incomplete {
                synced,
                failed,
                reason,
            } => Self::Incomplete {
                synced,
                failed,
                reason,
            },
            SyncOutcome::Failed { reason } => Self::Failed { reason },
            SyncOutcome::Cancelled => Self::Cancelled,
        }
    }
}

/// What a sync request did. `token` identifies this request for `cancel_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiRequestOutcome {
    Started { token: u64 },
    Coalesced { token: u64 },
    NotNeeded,
}

impl From<RequestOutcome> for FfiRequestOutcome {
    fn from(o: RequestOutcome) -> Self {
        match o {
            RequestOutcome::Started(token) => Self::Started { token },
            RequestOutcome::Coalesced(token) => Self::Coalesced { token },
            RequestOutcome::NotNeeded => Self::NotNeeded,
        }
    }
}

/// Committed change to the bounds cache.
#[derive(Debug, Clone, PartialEq, uniffi::Enum)]
pub enum FfiCacheEvent {
    Upserted {
        activity_ids: Vec<String>,
    },
    Removed {
        activity_ids: Vec<String>,
    },
    RangeChanged {
        oldest_date: Option<String>,
        newest_date: Option<String>,
    },
    Cleared,
}

impl From<&CacheEvent> for FfiCacheEvent {
    fn from(e: &CacheEvent) -> Self {
        match e {
            CacheEvent::Upserted { activity_ids } => Self::Upserted {
                activity_ids: activity_ids.clone(),
            },
            CacheEvent::Removed { activity_ids } => Self::Removed {
                activity_ids: activity_ids.clone(),
            },
            CacheEvent::RangeChanged(range) => Self::RangeChanged {
                oldest_date: date_string(range.oldest_synced_date),
                newest_date: date_string(range.newest_synced_date),
            },
            CacheEvent::Cleared => Self::Cleared,
        }
    }
}
