//! Engine write/read contract.
//!
//! The coordinator talks to the activity engine only through
//! [`ActivityEngine`]. Every call is fallible: the engine may not be
//! initialized yet, and malformed input is rejected here before it reaches
//! the store.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::persistence::{PERSISTENT_ENGINE, PersistentActivityStore};
use crate::types::Bounds;
use crate::{Result, SyncError};

/// Longest accepted activity id.
pub const MAX_ID_LEN: usize = 128;
/// Longest accepted sport type name.
pub const MAX_SPORT_TYPE_LEN: usize = 64;

/// Synchronous, fallible interface to the activity engine.
pub trait ActivityEngine: Send + Sync {
    /// Ingest activities from a flat `[lat, lng, lat, lng, ...]` buffer.
    ///
    /// `offsets[i]` is the index of the first point of activity `i`; the
    /// last activity runs to the end of the buffer.
    fn add_activities(
        &self,
        ids: &[String],
        coords: &[f64],
        offsets: &[u32],
        sport_types: &[String],
    ) -> Result<()>;

    fn activity_count(&self) -> Result<u32>;

    fn query_viewport(&self, bounds: &Bounds) -> Result<Vec<String>>;

    fn remove_activities(&self, ids: &[String]) -> Result<()>;

    /// Drop activities stored more than `retention_days` ago. This knows
    /// nothing of the bounds cache; synced data goes through
    /// `SyncCoordinator::apply_retention` instead. Returns how many were deleted.
    fn cleanup_old_activities(&self, retention_days: u32) -> Result<u32>;

    /// `[{id, bounds: [[minLat, minLng], [maxLat, maxLng]], sportType, distance}]`
    fn all_activity_bounds_json(&self) -> Result<String>;

    /// Ask the engine to recompute derived groupings after new data.
    fn recompute(&self) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

// ============================================================================
// Input validation
// ============================================================================

/// Reject ids the engine must never see.
pub fn validate_activity_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SyncError::invalid("activity_id", "must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(SyncError::invalid(
            "activity_id",
            format!(
                "'{}...' exceeds {} characters",
                id.chars().take(16).collect::<String>(),
                MAX_ID_LEN
            ),
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')))
    {
        return Err(SyncError::invalid(
            "activity_id",
            format!("'{}' contains illegal character {:?}", id, c),
        ));
    }
    Ok(())
}

pub fn validate_sport_type(sport_type: &str) -> Result<()> {
    if sport_type.is_empty() || sport_type.len() > MAX_SPORT_TYPE_LEN {
        return Err(SyncError::invalid(
            "sport_type",
            format!("length must be 1..={}", MAX_SPORT_TYPE_LEN),
        ));
    }
    if sport_type.chars().any(char::is_control) {
        return Err(SyncError::invalid("sport_type", "contains control characters"));
    }
    Ok(())
}

/// Split a flat coordinate buffer into per-activity point lists, validating
/// every id, name, offset and coordinate on the way.
pub fn unpack_activities(
    ids: &[String],
    coords: &[f64],
    offsets: &[u32],
    sport_types: &[String],
) -> Result<Vec<(String, Vec<(f64, f64)>, String)>> {
    if ids.len() != offsets.len() || ids.len() != sport_types.len() {
        return Err(SyncError::invalid(
            "offsets",
            format!(
                "{} ids, {} offsets and {} sport types must match",
                ids.len(),
                offsets.len(),
                sport_types.len()
            ),
        ));
    }
    if coords.len() % 2 != 0 {
        return Err(SyncError::invalid("coords", "buffer length must be even"));
    }
    if let Some(&first) = offsets.first() {
        if first != 0 {
            return Err(SyncError::invalid("offsets", "first offset must be 0"));
        }
    }

    let point_count = coords.len() / 2;
    let mut activities = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        validate_activity_id(id)?;
        validate_sport_type(&sport_types[i])?;

        let start = offsets[i] as usize;
        let end = offsets
            .get(i + 1)
            .map(|&o| o as usize)
            .unwrap_or(point_count);
        if start > end || end > point_count {
            return Err(SyncError::invalid(
                "offsets",
                format!("activity {} has range {}..{} of {} points", id, start, end, point_count),
            ));
        }
        if end - start < 2 {
            return Err(SyncError::invalid(
                "coords",
                format!("activity {} needs at least 2 points", id),
            ));
        }

        let mut points = Vec::with_capacity(end - start);
        for j in start..end {
            let (lat, lng) = (coords[j * 2], coords[j * 2 + 1]);
            if !lat.is_finite()
                || !lng.is_finite()
                || !(-90.0..=90.0).contains(&lat)
                || !(-180.0..=180.0).contains(&lng)
            {
                return Err(SyncError::invalid(
                    "coords",
                    format!("activity {} has invalid point ({}, {})", id, lat, lng),
                ));
            }
            points.push((lat, lng));
        }
        activities.push((id.clone(), points, sport_types[i].clone()));
    }
    Ok(activities)
}

/// Flat coordinate buffers for one `add_activities` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityBatch {
    pub ids: Vec<String>,
    pub coords: Vec<f64>,
    pub offsets: Vec<u32>,
    pub sport_types: Vec<String>,
}

impl ActivityBatch {
    pub fn push(&mut self, id: &str, points: &[(f64, f64)], sport_type: &str) {
        self.ids.push(id.to_string());
        self.offsets.push((self.coords.len() / 2) as u32);
        for &(lat, lng) in points {
            self.coords.push(lat);
            self.coords.push(lng);
        }
        self.sport_types.push(sport_type.to_string());
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn write_to(&self, engine: &dyn ActivityEngine) -> Result<()> {
        engine.add_activities(&self.ids, &self.coords, &self.offsets, &self.sport_types)
    }
}

// ============================================================================
// Engine handle over the persistent store
// ============================================================================

type Slot = Arc<Mutex<Option<PersistentActivityStore>>>;

#[derive(Clone)]
enum EngineSlot {
    /// The process-wide `PERSISTENT_ENGINE`
    Global,
    /// A private slot (tests, tools)
    Local(Slot),
}

/// [`ActivityEngine`] backed by a [`PersistentActivityStore`] slot.
#[derive(Clone)]
pub struct EngineHandle {
    slot: EngineSlot,
}

impl EngineHandle {
    /// Handle onto the global engine singleton.
    pub fn global() -> Self {
        Self {
            slot: EngineSlot::Global,
        }
    }

    /// Handle onto a private, not yet initialized slot.
    pub fn detached() -> Self {
        Self {
            slot: EngineSlot::Local(Arc::new(Mutex::new(None))),
        }
    }

    /// Handle onto a private slot holding `store`.
    pub fn with_store(store: PersistentActivityStore) -> Self {
        Self {
            slot: EngineSlot::Local(Arc::new(Mutex::new(Some(store)))),
        }
    }

    /// Open the store at `db_path`, load it, and install it in this slot.
    pub fn initialize(&self, db_path: &str) -> Result<()> {
        let mut store = PersistentActivityStore::new(db_path)?;
        store.load()?;
        let count = store.activity_count();
        self.with_slot(|slot| *slot = Some(store))?;
        info!("[Engine] Initialized with {} activities at {}", count, db_path);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.with_slot(|slot| slot.is_some()).unwrap_or(false)
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut Option<PersistentActivityStore>) -> R) -> Result<R> {
        let guard = match &self.slot {
            EngineSlot::Global => PERSISTENT_ENGINE.lock(),
            EngineSlot::Local(slot) => slot.lock(),
        };
        let mut guard = guard.map_err(|_| {
            warn!("[Engine] Store lock poisoned");
            SyncError::Runtime {
                message: "engine lock poisoned".to_string(),
            }
        })?;
        Ok(f(&mut guard))
    }

    fn with_store_mut<R>(
        &self,
        f: impl FnOnce(&mut PersistentActivityStore) -> Result<R>,
    ) -> Result<R> {
        self.with_slot(|slot| match slot.as_mut() {
            Some(store) => f(store),
            None => Err(SyncError::EngineNotInitialized),
        })?
    }
}

impl ActivityEngine for EngineHandle {
    fn add_activities(
        &self,
        ids: &[String],
        coords: &[f64],
        offsets: &[u32],
        sport_types: &[String],
    ) -> Result<()> {
        let activities = unpack_activities(ids, coords, offsets, sport_types)?;
        if activities.is_empty() {
            return Ok(());
        }
        self.with_store_mut(|store| store.add_activities(activities))
    }

    fn activity_count(&self) -> Result<u32> {
        self.with_store_mut(|store| Ok(store.activity_count() as u32))
    }

    fn query_viewport(&self, bounds: &Bounds) -> Result<Vec<String>> {
        self.with_store_mut(|store| Ok(store.query_viewport(bounds)))
    }

    fn remove_activities(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            validate_activity_id(id)?;
        }
        self.with_store_mut(|store| {
            for id in ids {
                store.remove_activity(id)?;
            }
            Ok(())
        })
    }

    fn cleanup_old_activities(&self, retention_days: u32) -> Result<u32> {
        self.with_store_mut(|store| store.cleanup_old_activities(retention_days))
    }

    fn all_activity_bounds_json(&self) -> Result<String> {
        self.with_store_mut(|store| store.get_all_activity_bounds_json())
    }

    fn recompute(&self) -> Result<()> {
        self.with_store_mut(|store| {
            store.mark_for_recomputation();
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        self.with_store_mut(|store| store.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn two_activity_batch() -> ActivityBatch {
        let mut batch = ActivityBatch::default();
        batch.push("i100", &[(51.50, -0.12), (51.51, -0.13)], "Ride");
        batch.push("i101", &[(48.85, 2.35), (48.86, 2.36), (48.87, 2.37)], "Run");
        batch
    }

    #[test]
    fn test_batch_layout() {
        let batch = two_activity_batch();
        assert_eq!(batch.offsets, vec![0, 2]);
        assert_eq!(batch.coords.len(), 10);
        let unpacked =
            unpack_activities(&batch.ids, &batch.coords, &batch.offsets, &batch.sport_types)
                .unwrap();
        assert_eq!(unpacked[1].1.len(), 3);
        assert_eq!(unpacked[1].2, "Run");
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!(validate_activity_id("").unwrap_err().is_validation());
        assert!(validate_activity_id("i1; DROP TABLE").unwrap_err().is_validation());
        assert!(validate_activity_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(validate_activity_id("i12345").is_ok());
    }

    #[test]
    fn test_rejects_mismatched_buffers() {
        let batch = two_activity_batch();
        let err = unpack_activities(&batch.ids, &batch.coords, &[0], &batch.sport_types)
            .unwrap_err();
        assert!(err.is_validation());

        let err = unpack_activities(&batch.ids, &batch.coords[..9], &batch.offsets, &batch.sport_types)
            .unwrap_err();
        assert!(err.is_validation());

        let err = unpack_activities(&batch.ids, &batch.coords, &[0, 9], &batch.sport_types)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        let err = unpack_activities(
            &ids(&["i1"]),
            &[91.0, 0.0, 51.0, 0.0],
            &[0],
            &ids(&["Ride"]),
        )
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_uninitialized_engine_errors() {
        let engine = EngineHandle::detached();
        assert!(!engine.is_initialized());
        assert!(matches!(
            engine.activity_count(),
            Err(SyncError::EngineNotInitialized)
        ));
        // Validation runs before the slot is consulted
        assert!(engine
            .add_activities(&ids(&[""]), &[0.0, 0.0, 1.0, 1.0], &[0], &ids(&["Ride"]))
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_handle_round_trip() {
        let engine = EngineHandle::with_store(PersistentActivityStore::in_memory().unwrap());
        two_activity_batch().write_to(&engine).unwrap();
        assert_eq!(engine.activity_count().unwrap(), 2);

        let hits = engine
            .query_viewport(&Bounds {
                min_lat: 51.0,
                max_lat: 52.0,
                min_lng: -1.0,
                max_lng: 0.0,
            })
            .unwrap();
        assert_eq!(hits, vec!["i100".to_string()]);

        engine.remove_activities(&ids(&["i100"])).unwrap();
        assert_eq!(engine.activity_count().unwrap(), 1);
        engine.clear().unwrap();
        assert_eq!(engine.activity_count().unwrap(), 0);
    }
}
