//! # Persistent Activity Store
//!
//! SQLite-backed store that receives GPS tracks from the sync coordinator.
//!
//! ## Memory Tiers
//!
//! 1. **Always loaded** (~80KB for 1000 activities):
//!    - Activity IDs, sport types, bounds, distance
//!    - In-memory R-tree spatial index
//!
//! 2. **On-demand** (0 memory baseline):
//!    - Full GPS tracks, MessagePack-encoded
//!
//! Derived groupings (routes, sections) are computed elsewhere; this store
//! only tracks whether they need recomputing after new data arrives.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info};
use once_cell::sync::Lazy;
use rstar::{AABB, RTree, RTreeObject};
use rusqlite::{Connection, params};

use crate::types::{Bounds, track_distance_meters};
use crate::{Result, SyncError, elapsed_ms, migrations};

// ============================================================================
// Types
// ============================================================================

/// Lightweight activity metadata kept always in memory.
#[derive(Debug, Clone)]
pub struct ActivityMetadata {
    pub id: String,
    pub sport_type: String,
    pub bounds: Bounds,
    pub distance_meters: f64,
}

/// Bounds wrapper for R-tree spatial indexing.
#[derive(Debug, Clone)]
pub struct ActivityBoundsEntry {
    pub activity_id: String,
    pub bounds: Bounds,
}

impl RTreeObject for ActivityBoundsEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

/// Statistics for the persistent store.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct PersistentEngineStats {
    pub activity_count: u32,
    pub total_points: u32,
    pub groups_dirty: bool,
    pub sections_dirty: bool,
}

// ============================================================================
// Persistent Activity Store
// ============================================================================

/// Activity store with SQLite persistence and an in-memory spatial index.
pub struct PersistentActivityStore {
    /// Database connection
    db: Connection,

    /// Tier 1: Always in memory
    activity_metadata: HashMap<String, ActivityMetadata>,

    /// In-memory R-tree for fast viewport queries
    spatial_index: RTree<ActivityBoundsEntry>,

    /// Dirty tracking for derived groupings
    groups_dirty: bool,
    sections_dirty: bool,
}

impl PersistentActivityStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Create a new store with the given database path.
    pub fn new(db_path: &str) -> Result<Self> {
        let mut db = Connection::open(db_path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        // Per connection; track rows cascade with their activity
        db.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(&mut db)?;

        Ok(Self {
            db,
            activity_metadata: HashMap::new(),
            spatial_index: RTree::new(),
            groups_dirty: false,
            sections_dirty: false,
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    /// Load all metadata from the database.
    pub fn load(&mut self) -> Result<()> {
        self.activity_metadata.clear();

        let mut stmt = self.db.prepare(
            "SELECT id, sport_type, min_lat, max_lat, min_lng, max_lng, distance_meters FROM activities",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ActivityMetadata {
                    id: row.get(0)?,
                    sport_type: row.get(1)?,
                    bounds: Bounds {
                        min_lat: row.get(2)?,
                        max_lat: row.get(3)?,
                        min_lng: row.get(4)?,
                        max_lng: row.get(5)?,
                    },
                    distance_meters: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for metadata in rows {
            self.activity_metadata.insert(metadata.id.clone(), metadata);
        }
        self.rebuild_spatial_index();
        info!(
            "[PersistentStore] Loaded {} activities",
            self.activity_metadata.len()
        );
        Ok(())
    }

    // ========================================================================
    // Activity Management
    // ========================================================================

    /// Add one activity with its `(lat, lng)` points.
    pub fn add_activity(
        &mut self,
        id: String,
        points: Vec<(f64, f64)>,
        sport_type: String,
    ) -> Result<()> {
        self.add_activities(vec![(id, points, sport_type)])
    }

    /// Add several activities in one transaction; either all land or none.
    pub fn add_activities(&mut self, activities: Vec<(String, Vec<(f64, f64)>, String)>) -> Result<()> {
        let start = Instant::now();
        let mut staged = Vec::with_capacity(activities.len());

        let tx = self.db.transaction()?;
        for (id, points, sport_type) in activities {
            let bounds = Bounds::from_points(&points).ok_or_else(|| SyncError::EngineWrite {
                message: format!("activity {} has no GPS points", id),
            })?;
            let distance_meters = track_distance_meters(&points);
            let track: Vec<[f64; 2]> = points.iter().map(|&(lat, lng)| [lat, lng]).collect();
            let track_data = rmp_serde::to_vec(&track).map_err(|e| SyncError::EngineWrite {
                message: format!("failed to encode track {}: {}", id, e),
            })?;

            tx.execute(
                "INSERT OR REPLACE INTO activities (id, sport_type, min_lat, max_lat, min_lng, max_lng, distance_meters)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    sport_type,
                    bounds.min_lat,
                    bounds.max_lat,
                    bounds.min_lng,
                    bounds.max_lng,
                    distance_meters
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO gps_tracks (activity_id, track_data, point_count)
                 VALUES (?, ?, ?)",
                params![id, track_data, track.len() as i64],
            )?;

            staged.push(ActivityMetadata {
                id,
                sport_type,
                bounds,
                distance_meters,
            });
        }
        tx.commit()?;

        let count = staged.len();
        for metadata in staged {
            self.activity_metadata.insert(metadata.id.clone(), metadata);
        }
        self.rebuild_spatial_index();
        self.groups_dirty = true;
        self.sections_dirty = true;

        debug!(
            "[PersistentStore] Stored {} activities ({} ms)",
            count,
            elapsed_ms(start)
        );
        Ok(())
    }

    /// Remove an activity (cascade deletes its track).
    pub fn remove_activity(&mut self, id: &str) -> Result<()> {
        self.db
            .execute("DELETE FROM activities WHERE id = ?", params![id])?;
        if self.activity_metadata.remove(id).is_some() {
            self.rebuild_spatial_index();
            self.groups_dirty = true;
            self.sections_dirty = true;
        }
        Ok(())
    }

    /// Clear all data.
    pub fn clear(&mut self) -> Result<()> {
        self.db.execute_batch(
            "DELETE FROM gps_tracks;
             DELETE FROM activities;",
        )?;

        self.activity_metadata.clear();
        self.spatial_index = RTree::new();
        self.groups_dirty = false;
        self.sections_dirty = false;

        Ok(())
    }

    /// Remove activities stored longer ago than the retention period.
    ///
    /// `retention_days == 0` keeps everything. Returns the number deleted.
    pub fn cleanup_old_activities(&mut self, retention_days: u32) -> Result<u32> {
        if retention_days == 0 {
            info!("[PersistentStore] Cleanup skipped: retention period is 0 (keep all)");
            return Ok(0);
        }

        let cutoff_seconds = retention_days as i64 * 24 * 60 * 60;
        let deleted = self.db.execute(
            "DELETE FROM activities WHERE created_at < (strftime('%s', 'now') - ?)",
            params![cutoff_seconds],
        )?;

        if deleted > 0 {
            self.load()?;
            self.groups_dirty = true;
            self.sections_dirty = true;
            info!(
                "[PersistentStore] Cleaned up {} activities older than {} days",
                deleted, retention_days
            );
        }

        Ok(deleted as u32)
    }

    /// Force re-computation of route groups and sections on next access.
    ///
    /// Called after historical activities are added (cache expansion) so
    /// groupings improve with the new data.
    pub fn mark_for_recomputation(&mut self) {
        if !self.groups_dirty || !self.sections_dirty {
            self.groups_dirty = true;
            self.sections_dirty = true;
            info!("[PersistentStore] Marked for re-computation (cache expanded)");
        }
    }

    fn rebuild_spatial_index(&mut self) {
        let entries: Vec<ActivityBoundsEntry> = self
            .activity_metadata
            .values()
            .map(|m| ActivityBoundsEntry {
                activity_id: m.id.clone(),
                bounds: m.bounds,
            })
            .collect();
        self.spatial_index = RTree::bulk_load(entries);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn activity_count(&self) -> usize {
        self.activity_metadata.len()
    }

    pub fn has_activity(&self, id: &str) -> bool {
        self.activity_metadata.contains_key(id)
    }

    /// Query activities whose bounds intersect a viewport.
    pub fn query_viewport(&self, bounds: &Bounds) -> Vec<String> {
        let search_bounds = AABB::from_corners(
            [bounds.min_lng, bounds.min_lat],
            [bounds.max_lng, bounds.max_lat],
        );

        self.spatial_index
            .locate_in_envelope_intersecting(&search_bounds)
            .map(|b| b.activity_id.clone())
            .collect()
    }

    /// Get all activity bounds info as JSON for map display.
    /// Returns array of { id, bounds, sportType, distance }.
    pub fn get_all_activity_bounds_json(&self) -> Result<String> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct BoundsInfo<'a> {
            id: &'a str,
            bounds: [[f64; 2]; 2], // [[minLat, minLng], [maxLat, maxLng]]
            sport_type: &'a str,
            distance: f64,
        }

        let infos: Vec<BoundsInfo<'_>> = self
            .activity_metadata
            .values()
            .map(|m| BoundsInfo {
                id: &m.id,
                bounds: [
                    [m.bounds.min_lat, m.bounds.min_lng],
                    [m.bounds.max_lat, m.bounds.max_lng],
                ],
                sport_type: &m.sport_type,
                distance: m.distance_meters,
            })
            .collect();

        Ok(serde_json::to_string(&infos)?)
    }

    /// Load a stored GPS track as `(lat, lng)` points.
    pub fn get_gps_track(&self, id: &str) -> Option<Vec<(f64, f64)>> {
        let blob: Vec<u8> = self
            .db
            .query_row(
                "SELECT track_data FROM gps_tracks WHERE activity_id = ?",
                params![id],
                |row| row.get(0),
            )
            .ok()?;
        let track: Vec<[f64; 2]> = rmp_serde::from_slice(&blob).ok()?;
        Some(track.into_iter().map(|p| (p[0], p[1])).collect())
    }

    /// Get store statistics.
    pub fn stats(&self) -> PersistentEngineStats {
        let total_points: i64 = self
            .db
            .query_row("SELECT COALESCE(SUM(point_count), 0) FROM gps_tracks", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        PersistentEngineStats {
            activity_count: self.activity_metadata.len() as u32,
            total_points: total_points as u32,
            groups_dirty: self.groups_dirty,
            sections_dirty: self.sections_dirty,
        }
    }
}

// ============================================================================
// Global Singleton for FFI
// ============================================================================

/// Global persistent store instance.
///
/// This singleton allows FFI calls to access a shared store without passing
/// state back and forth across the FFI boundary. `None` until initialized.
pub static PERSISTENT_ENGINE: Lazy<Mutex<Option<PersistentActivityStore>>> =
    Lazy::new(|| Mutex::new(None));

/// Run `f` against the global store. Returns None if not initialized.
pub fn with_persistent_engine<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut PersistentActivityStore) -> R,
{
    let mut guard = PERSISTENT_ENGINE.lock().ok()?;
    guard.as_mut().map(f)
}

// ============================================================================
// Tests
// ============================================================================
