//! # Bounds Cache Store
//!
//! Durable mapping from activity id to its bounding box, sport type,
//! distance and start date, plus the persisted synced date range.
//!
//! Everything is kept in memory (~100 bytes per activity) and written
//! through to SQLite. Every mutation is announced on a change bus so map
//! and timeline views re-render without polling.
//!
//! Only the sync coordinator mutates the store; everyone else reads.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use log::{debug, info};
use rusqlite::{Connection, Transaction, params};

use crate::publisher::{Broadcaster, Subscription};
use crate::types::{ActivityBoundsRecord, Bounds, SyncRange};
use crate::{Result, SyncError, migrations};

/// Change notification emitted after a mutation has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Upserted { activity_ids: Vec<String> },
    Removed { activity_ids: Vec<String> },
    RangeChanged(SyncRange),
    Cleared,
}

/// Change notifications held back until the writer has released its locks.
#[must_use = "deferred events are only delivered through BoundsCacheStore::announce"]
#[derive(Debug, Default)]
pub(crate) struct DeferredEvents(Vec<CacheEvent>);

struct CacheInner {
    db: Connection,
    records: HashMap<String, ActivityBoundsRecord>,
    range: SyncRange,
    last_synced_at: Option<String>,
}

/// SQLite-backed bounds cache with an in-memory mirror.
pub struct BoundsCacheStore {
    inner: Mutex<CacheInner>,
    changes: Broadcaster<CacheEvent>,
}

impl BoundsCacheStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the cache at `db_path` and load it into memory.
    pub fn open(db_path: &str) -> Result<Self> {
        let mut db = Connection::open(db_path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        migrations::migrate(&mut db)?;

        let records = load_records(&db)?;
        let (range, last_synced_at) = load_range(&db)?;
        info!(
            "[BoundsCache] Opened {} with {} activities, range {:?}..{:?}",
            db_path,
            records.len(),
            range.oldest_synced_date,
            range.newest_synced_date
        );

        Ok(Self {
            inner: Mutex::new(CacheInner {
                db,
                records,
                range,
                last_synced_at,
            }),
            changes: Broadcaster::new(),
        })
    }

    /// Create an in-memory cache (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Listen for committed changes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.changes.subscribe(listener)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, activity_id: &str) -> Option<ActivityBoundsRecord> {
        self.lock().records.get(activity_id).cloned()
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.lock().records.contains_key(activity_id)
    }

    /// All records, oldest first.
    pub fn list_all(&self) -> Vec<ActivityBoundsRecord> {
        let mut records: Vec<ActivityBoundsRecord> = self.lock().records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.start_date
                .cmp(&b.start_date)
                .then_with(|| a.activity_id.cmp(&b.activity_id))
        });
        records
    }

    /// Records whose start date falls in `[oldest, newest]`.
    pub fn list_between(&self, oldest: NaiveDate, newest: NaiveDate) -> Vec<ActivityBoundsRecord> {
        let mut records: Vec<ActivityBoundsRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| r.start_date >= oldest && r.start_date <= newest)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.start_date.cmp(&b.start_date));
        records
    }

    /// Records whose bounds intersect `viewport`.
    pub fn list_intersecting(&self, viewport: &Bounds) -> Vec<ActivityBoundsRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| r.bounds.intersects(viewport))
            .cloned()
            .collect()
    }

    pub fn known_ids(&self) -> HashSet<String> {
        self.lock().records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn read_range(&self) -> SyncRange {
        self.lock().range
    }

    /// RFC 3339 timestamp of the last range commit.
    pub fn last_synced_at(&self) -> Option<String> {
        self.lock().last_synced_at.clone()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert or replace records. Returns how many were written.
    pub fn upsert(&self, records: Vec<ActivityBoundsRecord>) -> Result<usize> {
        let count = records.len();
        self.commit_batch(records, None)?;
        Ok(count)
    }

    /// Replace the synced range without touching records.
    pub fn write_range(&self, range: SyncRange) -> Result<()> {
        self.commit_batch(Vec::new(), Some(range))
    }

    /// Upsert `records` and, if given, write `range` in one transaction.
    ///
    /// Readers see either the old records and range or both new ones.
    pub fn commit_batch(
        &self,
        records: Vec<ActivityBoundsRecord>,
        range: Option<SyncRange>,
    ) -> Result<()> {
        let mut events = DeferredEvents::default();
        let result = self.commit_batch_deferred(records, range, &mut events);
        self.announce(events);
        result
    }

    /// Remove records by id. Returns how many existed.
    pub fn remove(&self, activity_ids: &[String]) -> Result<usize> {
        let mut events = DeferredEvents::default();
        let result = self.remove_deferred(activity_ids, &mut events);
        self.announce(events);
        result
    }

    /// Drop records that started before `cutoff` and move the range's
    /// oldest end up to the cutoff, in one transaction.
    pub fn remove_older_than(&self, cutoff: NaiveDate) -> Result<usize> {
        let mut events = DeferredEvents::default();
        let result = self.remove_older_than_deferred(cutoff, &mut events);
        self.announce(events);
        result
    }

    /// Remove every record and null the range atomically.
    pub fn clear(&self) -> Result<()> {
        let mut events = DeferredEvents::default();
        let result = self.clear_deferred(&mut events);
        self.announce(events);
        result
    }

    /// Deliver events collected by the `*_deferred` writes.
    pub(crate) fn announce(&self, events: DeferredEvents) {
        for event in events.0 {
            self.changes.publish(&event);
        }
    }

    // ========================================================================
    // Deferred writes
    //
    // Same transactions as above, but change notifications are queued in
    // `events` instead of delivered. Callers holding their own locks use
    // these and announce once unlocked, so listeners may call back in.
    // ========================================================================

    pub(crate) fn commit_batch_deferred(
        &self,
        records: Vec<ActivityBoundsRecord>,
        range: Option<SyncRange>,
        events: &mut DeferredEvents,
    ) -> Result<()> {
        if let Some(range) = &range {
            if !range.is_valid() {
                return Err(SyncError::invalid(
                    "range",
                    format!(
                        "{:?}..{:?} is not an ordered pair",
                        range.oldest_synced_date, range.newest_synced_date
                    ),
                ));
            }
        }
        if records.is_empty() && range.is_none() {
            return Ok(());
        }

        let ids: Vec<String> = records.iter().map(|r| r.activity_id.clone()).collect();
        let range_changed = {
            let mut inner = self.lock();
            let timestamp = range.map(|_| chrono::Utc::now().to_rfc3339());

            let tx = inner.db.transaction()?;
            for record in &records {
                store_record(&tx, record)?;
            }
            if let Some(range) = &range {
                store_range(&tx, range, timestamp.as_deref())?;
            }
            tx.commit()?;

            for record in records {
                inner.records.insert(record.activity_id.clone(), record);
            }
            match range {
                Some(range) => {
                    let changed = inner.range != range;
                    inner.range = range;
                    inner.last_synced_at = timestamp;
                    changed.then_some(range)
                }
                None => None,
            }
        };

        debug!(
            "[BoundsCache] Committed {} records (range changed: {})",
            ids.len(),
            range_changed.is_some()
        );
        if !ids.is_empty() {
            events.0.push(CacheEvent::Upserted { activity_ids: ids });
        }
        if let Some(range) = range_changed {
            events.0.push(CacheEvent::RangeChanged(range));
        }
        Ok(())
    }

    pub(crate) fn remove_deferred(
        &self,
        activity_ids: &[String],
        events: &mut DeferredEvents,
    ) -> Result<usize> {
        let removed: Vec<String> = {
            let mut inner = self.lock();
            let tx = inner.db.transaction()?;
            for id in activity_ids {
                tx.execute(
                    "DELETE FROM activity_bounds WHERE activity_id = ?",
                    params![id],
                )?;
            }
            tx.commit()?;
            activity_ids
                .iter()
                .filter(|id| inner.records.remove(id.as_str()).is_some())
                .cloned()
                .collect()
        };

        let count = removed.len();
        if count > 0 {
            info!("[BoundsCache] Removed {} activities", count);
            events.0.push(CacheEvent::Removed {
                activity_ids: removed,
            });
        }
        Ok(count)
    }

    pub(crate) fn remove_older_than_deferred(
        &self,
        cutoff: NaiveDate,
        events: &mut DeferredEvents,
    ) -> Result<usize> {
        let (removed, new_range) = {
            let mut inner = self.lock();
            let removed: Vec<String> = inner
                .records
                .values()
                .filter(|r| r.start_date < cutoff)
                .map(|r| r.activity_id.clone())
                .collect();

            let new_range = match (inner.range.oldest_synced_date, inner.range.newest_synced_date) {
                (Some(oldest), Some(newest)) if oldest < cutoff => {
                    if cutoff > newest {
                        SyncRange::default()
                    } else {
                        SyncRange::new(cutoff, newest)
                    }
                }
                _ => inner.range,
            };

            let last_synced_at = inner.last_synced_at.clone();
            let tx = inner.db.transaction()?;
            tx.execute(
                "DELETE FROM activity_bounds WHERE start_date < ?",
                params![cutoff],
            )?;
            store_range(&tx, &new_range, last_synced_at.as_deref())?;
            tx.commit()?;

            for id in &removed {
                inner.records.remove(id);
            }
            let changed = inner.range != new_range;
            inner.range = new_range;
            (removed, changed.then_some(new_range))
        };

        let count = removed.len();
        if count > 0 {
            info!(
                "[BoundsCache] Retention removed {} activities before {}",
                count, cutoff
            );
            events.0.push(CacheEvent::Removed {
                activity_ids: removed,
            });
        }
        if let Some(range) = new_range {
            events.0.push(CacheEvent::RangeChanged(range));
        }
        Ok(count)
    }

    pub(crate) fn clear_deferred(&self, events: &mut DeferredEvents) -> Result<()> {
        {
            let mut inner = self.lock();
            let tx = inner.db.transaction()?;
            tx.execute("DELETE FROM activity_bounds", [])?;
            store_range(&tx, &SyncRange::default(), None)?;
            tx.commit()?;

            inner.records.clear();
            inner.range = SyncRange::default();
            inner.last_synced_at = None;
        }
        info!("[BoundsCache] Cleared");
        events.0.push(CacheEvent::Cleared);
        Ok(())
    }
}

// ============================================================================
// Database Storage
// ============================================================================

fn load_records(db: &Connection) -> Result<HashMap<String, ActivityBoundsRecord>> {
    let mut stmt = db.prepare(
        "SELECT activity_id, min_lat, max_lat, min_lng, max_lng, sport_type, distance_meters, start_date
         FROM activity_bounds",
    )?;
    let records = stmt
        .query_map([], |row| {
            Ok(ActivityBoundsRecord {
                activity_id: row.get(0)?,
                bounds: Bounds {
                    min_lat: row.get(1)?,
                    max_lat: row.get(2)?,
                    min_lng: row.get(3)?,
                    max_lng: row.get(4)?,
                },
                sport_type: row.get(5)?,
                distance_meters: row.get(6)?,
                start_date: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records
        .into_iter()
        .map(|r| (r.activity_id.clone(), r))
        .collect())
}

fn load_range(db: &Connection) -> Result<(SyncRange, Option<String>)> {
    let row = db.query_row(
        "SELECT oldest_synced_date, newest_synced_date, last_synced_at FROM sync_range WHERE id = 1",
        [],
        |row| {
            Ok((
                SyncRange {
                    oldest_synced_date: row.get(0)?,
                    newest_synced_date: row.get(1)?,
                },
                row.get::<_, Option<String>>(2)?,
            ))
        },
    )?;
    Ok(row)
}

fn store_record(tx: &Transaction<'_>, record: &ActivityBoundsRecord) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO activity_bounds
            (activity_id, min_lat, max_lat, min_lng, max_lng, sport_type, distance_meters, start_date)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.activity_id,
            record.bounds.min_lat,
            record.bounds.max_lat,
            record.bounds.min_lng,
            record.bounds.max_lng,
            record.sport_type,
            record.distance_meters,
            record.start_date,
        ],
    )?;
    Ok(())
}

fn store_range(db: &Connection, range: &SyncRange, last_synced_at: Option<&str>) -> Result<()> {
    db.execute(
        "UPDATE sync_range SET oldest_synced_date = ?, newest_synced_date = ?, last_synced_at = ?
         WHERE id = 1",
        params![range.oldest_synced_date, range.newest_synced_date, last_synced_at],
    )?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(id: &str, date: &str) -> ActivityBoundsRecord {
        ActivityBoundsRecord {
            activity_id: id.to_string(),
            bounds: Bounds {
                min_lat: 51.5,
                max_lat: 51.6,
                min_lng: -0.2,
                max_lng: -0.1,
            },
            sport_type: "Ride".to_string(),
            distance_meters: 12_000.0,
            start_date: d(date),
        }
    }

    #[test]
    fn test_upsert_get_list() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        cache
            .upsert(vec![record("b", "2024-02-01"), record("a", "2024-01-01")])
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap().start_date, d("2024-01-01"));
        let ids: Vec<String> = cache.list_all().into_iter().map(|r| r.activity_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(cache.read_range().is_empty());
    }

    #[test]
    fn test_commit_batch_writes_records_and_range() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        let range = SyncRange::new(d("2024-01-01"), d("2024-01-31"));
        cache
            .commit_batch(vec![record("a", "2024-01-05")], Some(range))
            .unwrap();

        assert_eq!(cache.read_range(), range);
        assert!(cache.contains("a"));
        assert!(cache.last_synced_at().is_some());
    }

    #[test]
    fn test_invalid_range_is_rejected_without_side_effects() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        let bad = SyncRange {
            oldest_synced_date: Some(d("2024-02-01")),
            newest_synced_date: Some(d("2024-01-01")),
        };
        assert!(cache.commit_batch(vec![record("a", "2024-01-05")], Some(bad)).is_err());
        assert!(cache.is_empty());
        assert!(cache.write_range(bad).is_err());
    }

    #[test]
    fn test_clear_empties_records_and_range() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        cache
            .commit_batch(
                vec![record("a", "2024-01-05")],
                Some(SyncRange::new(d("2024-01-01"), d("2024-01-31"))),
            )
            .unwrap();
        cache.clear().unwrap();

        assert!(cache.is_empty());
        assert!(cache.read_range().is_empty());
        assert!(cache.last_synced_at().is_none());
    }

    #[test]
    fn test_remove_reports_existing_only() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        cache.upsert(vec![record("a", "2024-01-05")]).unwrap();
        let removed = cache
            .remove(&["a".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_older_than_trims_range() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        cache
            .commit_batch(
                vec![record("old", "2023-06-01"), record("new", "2024-03-01")],
                Some(SyncRange::new(d("2023-01-01"), d("2024-04-01"))),
            )
            .unwrap();

        let removed = cache.remove_older_than(d("2024-01-01")).unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.contains("old"));
        assert_eq!(
            cache.read_range(),
            SyncRange::new(d("2024-01-01"), d("2024-04-01"))
        );
    }

    #[test]
    fn test_mutations_notify_subscribers() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let events = events.clone();
            cache.subscribe(move |e| events.lock().unwrap().push(e.clone()))
        };

        let range = SyncRange::new(d("2024-01-01"), d("2024-01-31"));
        cache
            .commit_batch(vec![record("a", "2024-01-05")], Some(range))
            .unwrap();
        cache.clear().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                CacheEvent::Upserted {
                    activity_ids: vec!["a".to_string()]
                },
                CacheEvent::RangeChanged(range),
                CacheEvent::Cleared,
            ]
        );
    }

    #[test]
    fn test_deferred_events_wait_for_announce() {
        let cache = BoundsCacheStore::in_memory().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let events = events.clone();
            cache.subscribe(move |e| events.lock().unwrap().push(e.clone()))
        };

        let mut pending = DeferredEvents::default();
        cache
            .commit_batch_deferred(vec![record("a", "2024-01-05")], None, &mut pending)
            .unwrap();
        cache
            .remove_deferred(&["a".to_string()], &mut pending)
            .unwrap();
        assert!(events.lock().unwrap().is_empty());
        assert!(!cache.contains("a"));

        cache.announce(pending);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                CacheEvent::Upserted {
                    activity_ids: vec!["a".to_string()]
                },
                CacheEvent::Removed {
                    activity_ids: vec!["a".to_string()]
                },
            ]
        );
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        let range = SyncRange::new(d("2024-01-01"), d("2024-01-31"));

        {
            let cache = BoundsCacheStore::open(path).unwrap();
            cache
                .commit_batch(vec![record("a", "2024-01-05")], Some(range))
                .unwrap();
        }

        let cache = BoundsCacheStore::open(path).unwrap();
        assert_eq!(cache.read_range(), range);
        assert_eq!(cache.get("a"), Some(record("a", "2024-01-05")));
    }
}
