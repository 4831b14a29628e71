//! Core data types shared by the cache, coordinator and FFI layer.
//!
//! Dates are calendar days (`NaiveDate`); the FFI layer converts them to
//! `YYYY-MM-DD` strings.

use chrono::{Days, NaiveDate};
use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

// ============================================================================
// Geometry
// ============================================================================

/// Axis-aligned lat/lng rectangle enclosing a GPS trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from `(lat, lng)` points.
    pub fn from_points(points: &[(f64, f64)]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for &(lat, lng) in points {
            min_lat = min_lat.min(lat);
            max_lat = max_lat.max(lat);
            min_lng = min_lng.min(lng);
            max_lng = max_lng.max(lng);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Bounds with corners swapped back into order when a caller passed
    /// them reversed. Returns None for non-finite input.
    pub fn normalized(&self) -> Option<Self> {
        let all = [self.min_lat, self.max_lat, self.min_lng, self.max_lng];
        if !all.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Self {
            min_lat: self.min_lat.min(self.max_lat),
            max_lat: self.min_lat.max(self.max_lat),
            min_lng: self.min_lng.min(self.max_lng),
            max_lng: self.min_lng.max(self.max_lng),
        })
    }

    /// Whether two rectangles share any area or edge.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }
}

// ============================================================================
// Cache records
// ============================================================================

/// Cached summary of one GPS-synced activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBoundsRecord {
    pub activity_id: String,
    pub bounds: Bounds,
    pub sport_type: String,
    pub distance_meters: f64,
    pub start_date: NaiveDate,
}

/// The globally synced date window.
///
/// Both ends are `None` until the first sync completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRange {
    pub oldest_synced_date: Option<NaiveDate>,
    pub newest_synced_date: Option<NaiveDate>,
}

impl SyncRange {
    pub fn new(oldest: NaiveDate, newest: NaiveDate) -> Self {
        Self {
            oldest_synced_date: Some(oldest.min(newest)),
            newest_synced_date: Some(oldest.max(newest)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.oldest_synced_date.is_none() || self.newest_synced_date.is_none()
    }

    /// Both-or-neither and ordered.
    pub fn is_valid(&self) -> bool {
        match (self.oldest_synced_date, self.newest_synced_date) {
            (Some(oldest), Some(newest)) => oldest <= newest,
            (None, None) => true,
            _ => false,
        }
    }

    /// Union with the span `[oldest, newest]` when the two touch or overlap.
    ///
    /// A span separated from the current window by a gap is not merged: the
    /// window must stay a single interval of fully synced days.
    pub fn widened(&self, oldest: NaiveDate, newest: NaiveDate) -> SyncRange {
        let span = SyncRange::new(oldest, newest);
        let (Some(cur_oldest), Some(cur_newest)) = (self.oldest_synced_date, self.newest_synced_date)
        else {
            return span;
        };
        let (span_oldest, span_newest) = (oldest.min(newest), oldest.max(newest));

        let touches = span_newest.checked_add_days(Days::new(1)).unwrap_or(span_newest) >= cur_oldest
            && span_oldest <= cur_newest.checked_add_days(Days::new(1)).unwrap_or(cur_newest);
        if !touches {
            return *self;
        }
        SyncRange::new(cur_oldest.min(span_oldest), cur_newest.max(span_newest))
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, uniffi::Enum)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Computing,
}

/// Shared progress value shown by sync banners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub completed: u32,
    pub total: u32,
    pub message: Option<String>,
}

impl SyncProgress {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn syncing(completed: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Syncing,
            completed: completed.min(total),
            total,
            message: Some(message.into()),
        }
    }

    pub fn computing(completed: u32, total: u32) -> Self {
        Self {
            status: SyncStatus::Computing,
            completed: completed.min(total),
            total,
            message: Some("Updating routes".to_string()),
        }
    }

    /// Idle again, keeping the final tally of the run that just ended.
    pub fn finished(completed: u32, total: u32, message: Option<String>) -> Self {
        Self {
            status: SyncStatus::Idle,
            completed: completed.min(total),
            total,
            message,
        }
    }
}

/// How the last sync run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncOutcome {
    /// Every targeted activity was attempted; `failed` were skipped
    Complete { synced: u32, failed: u32 },
    /// Stopped early after an engine write failure; earlier batches kept
    Incomplete {
        synced: u32,
        failed: u32,
        reason: String,
    },
    /// Nothing could be synced (e.g. remote listing unreachable)
    Failed { reason: String },
    /// Superseded by abort or reset
    Cancelled,
}

impl SyncOutcome {
    /// Drives the "last sync incomplete" indicator.
    pub fn is_incomplete(&self) -> bool {
        match self {
            SyncOutcome::Complete { failed, .. } => *failed > 0,
            SyncOutcome::Incomplete { .. } | SyncOutcome::Failed { .. } => true,
            SyncOutcome::Cancelled => false,
        }
    }
}

// ============================================================================
// Requests and remote data
// ============================================================================

/// A UI request to have `[oldest, newest]` synced; `newest` is always today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRangeRequest {
    pub oldest: NaiveDate,
    pub newest: NaiveDate,
}

impl DateRangeRequest {
    /// Build an expansion request ending today.
    pub fn expansion(oldest: NaiveDate, today: NaiveDate) -> Result<Self> {
        if oldest > today {
            return Err(SyncError::invalid(
                "oldest",
                format!("{} is after today ({})", oldest, today),
            ));
        }
        Ok(Self {
            oldest,
            newest: today,
        })
    }

    /// The rolling default window ending today.
    pub fn default_window(today: NaiveDate, days: u32) -> Self {
        Self {
            oldest: today
                .checked_sub_days(Days::new(days as u64))
                .unwrap_or(NaiveDate::MIN),
            newest: today,
        }
    }
}

/// One entry of the remote activity listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub id: String,
    pub start_date: NaiveDate,
    pub sport_type: String,
    pub distance_meters: Option<f64>,
}

/// Raw GPS stream for one activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsStream {
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
    pub elevations: Option<Vec<f64>>,
}

impl GpsStream {
    /// Paired `(lat, lng)` points, dropping non-finite or out-of-range samples.
    pub fn valid_points(&self) -> Vec<(f64, f64)> {
        self.latitudes
            .iter()
            .zip(self.longitudes.iter())
            .filter(|&(&lat, &lng)| {
                lat.is_finite()
                    && lng.is_finite()
                    && (-90.0..=90.0).contains(&lat)
                    && (-180.0..=180.0).contains(&lng)
            })
            .map(|(&lat, &lng)| (lat, lng))
            .collect()
    }
}

/// Great-circle length of a trace in meters.
pub fn track_distance_meters(points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|w| {
            Haversine::distance(
                Point::new(w[0].1, w[0].0),
                Point::new(w[1].1, w[1].0),
            )
        })
        .sum()
}

/// Summary served to the cache-management screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStats {
    pub total_activities: u32,
    pub oldest_date: Option<NaiveDate>,
    pub newest_date: Option<NaiveDate>,
    /// RFC 3339 timestamp of the last committed sync
    pub last_sync_date: Option<String>,
    /// True while the range is the default window shown after a reset
    pub is_provisional: bool,
    pub last_sync_incomplete: bool,
}
