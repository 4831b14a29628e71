//! Shared fakes for the sync integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Days, NaiveDate};
use veloq_sync::{
    ActivityEngine, ActivityGateway, ActivitySummary, Bounds, BoundsCacheStore, Clock,
    EngineHandle, GpsStream, PersistentActivityStore, Result, SyncConfig, SyncCoordinator,
    SyncError,
};

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn today() -> NaiveDate {
    d("2024-03-01")
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `count` activities, `i{n}` starting 2024-01-01 and every 5 days after.
pub fn sample_activities(count: usize) -> Vec<ActivitySummary> {
    (0..count)
        .map(|i| ActivitySummary {
            id: format!("i{}", i),
            start_date: d("2024-01-01")
                .checked_add_days(Days::new(i as u64 * 5))
                .unwrap(),
            sport_type: if i % 2 == 0 { "Ride" } else { "Run" }.to_string(),
            distance_meters: None,
        })
        .collect()
}

fn track_for(index: usize) -> Vec<(f64, f64)> {
    let lat = 45.0 + index as f64 * 0.01;
    vec![(lat, 6.0), (lat + 0.004, 6.003), (lat + 0.008, 6.0)]
}

// ============================================================================
// Gateway
// ============================================================================

pub struct FakeGateway {
    activities: Mutex<Vec<ActivitySummary>>,
    tracks: HashMap<String, Vec<(f64, f64)>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    list_fails: AtomicBool,
    fetch_delay: Duration,
    pub list_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
}

impl FakeGateway {
    pub fn new(activities: Vec<ActivitySummary>) -> Self {
        let tracks = activities
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), track_for(i)))
            .collect();
        Self {
            activities: Mutex::new(activities),
            tracks,
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            list_fails: AtomicBool::new(false),
            fetch_delay: Duration::ZERO,
            list_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
        }
    }

    /// Every stream fetch sleeps this long first.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn fail_fetch(&self, ids: &[&str]) {
        let mut failing = self.failing.lock().unwrap();
        failing.clear();
        failing.extend(ids.iter().map(|s| s.to_string()));
    }

    /// Fetches of these ids never resolve.
    pub fn hang_fetch(&self, ids: &[&str]) {
        self.hanging
            .lock()
            .unwrap()
            .extend(ids.iter().map(|s| s.to_string()));
    }

    pub fn set_list_fails(&self, fails: bool) {
        self.list_fails.store(fails, Ordering::SeqCst);
    }

    /// Simulate a remote deletion.
    pub fn delete_remote(&self, id: &str) {
        self.activities.lock().unwrap().retain(|a| a.id != id);
    }

    pub fn fetches(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn listings(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl ActivityGateway for FakeGateway {
    fn list_activities(
        &self,
        oldest: NaiveDate,
        newest: NaiveDate,
    ) -> impl Future<Output = Result<Vec<ActivitySummary>>> + Send {
        async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.list_fails.load(Ordering::SeqCst) {
                return Err(SyncError::Http {
                    message: "connection refused".to_string(),
                    status_code: None,
                });
            }
            let listed = self
                .activities
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.start_date >= oldest && a.start_date <= newest)
                .cloned()
                .collect();
            Ok(listed)
        }
    }

    fn fetch_gps_stream(&self, activity_id: &str) -> impl Future<Output = Result<GpsStream>> + Send {
        let id = activity_id.to_string();
        async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fetch_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.fetch_delay).await;
            }

            let hangs = self.hanging.lock().unwrap().contains(&id);
            if hangs {
                std::future::pending::<()>().await;
            }
            let fails = self.failing.lock().unwrap().contains(&id);
            if fails {
                return Err(SyncError::Http {
                    message: format!("stream for {} unavailable", id),
                    status_code: Some(503),
                });
            }

            let track = self.tracks.get(&id).cloned().unwrap_or_default();
            Ok(GpsStream {
                latitudes: track.iter().map(|p| p.0).collect(),
                longitudes: track.iter().map(|p| p.1).collect(),
                elevations: None,
            })
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Persistent store with write-failure injection and call counting.
pub struct TestEngine {
    inner: EngineHandle,
    /// Any `add_activities` call containing this id fails
    poison: Mutex<Option<String>>,
    /// This many upcoming `add_activities` calls fail regardless of content
    fail_next: AtomicU32,
    on_recompute: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    pub add_calls: AtomicU32,
    pub recompute_calls: AtomicU32,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::wrapping(EngineHandle::with_store(
            PersistentActivityStore::in_memory().unwrap(),
        ))
    }

    /// An engine whose store was never initialized.
    pub fn uninitialized() -> Self {
        Self::wrapping(EngineHandle::detached())
    }

    fn wrapping(inner: EngineHandle) -> Self {
        Self {
            inner,
            poison: Mutex::new(None),
            fail_next: AtomicU32::new(0),
            on_recompute: Mutex::new(None),
            add_calls: AtomicU32::new(0),
            recompute_calls: AtomicU32::new(0),
        }
    }

    pub fn poison(&self, id: Option<&str>) {
        *self.poison.lock().unwrap() = id.map(str::to_string);
    }

    pub fn fail_next(&self, calls: u32) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn on_recompute(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_recompute.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn count(&self) -> u32 {
        self.inner.activity_count().unwrap_or(0)
    }
}

impl ActivityEngine for TestEngine {
    fn add_activities(
        &self,
        ids: &[String],
        coords: &[f64],
        offsets: &[u32],
        sport_types: &[String],
    ) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let transient = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(SyncError::EngineWrite {
                message: "database is locked".to_string(),
            });
        }
        let poisoned = self.poison.lock().unwrap().clone();
        if let Some(poison) = poisoned {
            if ids.contains(&poison) {
                return Err(SyncError::EngineWrite {
                    message: format!("disk full while writing {}", poison),
                });
            }
        }
        self.inner.add_activities(ids, coords, offsets, sport_types)
    }

    fn activity_count(&self) -> Result<u32> {
        self.inner.activity_count()
    }

    fn query_viewport(&self, bounds: &Bounds) -> Result<Vec<String>> {
        self.inner.query_viewport(bounds)
    }

    fn remove_activities(&self, ids: &[String]) -> Result<()> {
        self.inner.remove_activities(ids)
    }

    fn cleanup_old_activities(&self, retention_days: u32) -> Result<u32> {
        self.inner.cleanup_old_activities(retention_days)
    }

    fn all_activity_bounds_json(&self) -> Result<String> {
        self.inner.all_activity_bounds_json()
    }

    fn recompute(&self) -> Result<()> {
        self.recompute_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_recompute.lock().unwrap().as_ref() {
            hook();
        }
        self.inner.recompute()
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }
}

// ============================================================================
// Clock and harness
// ============================================================================

pub struct TestClock(Mutex<NaiveDate>);

impl TestClock {
    pub fn new(today: NaiveDate) -> Self {
        Self(Mutex::new(today))
    }

    pub fn set(&self, today: NaiveDate) {
        *self.0.lock().unwrap() = today;
    }
}

impl Clock for TestClock {
    fn today(&self) -> NaiveDate {
        *self.0.lock().unwrap()
    }
}

pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub engine: Arc<TestEngine>,
    pub cache: Arc<BoundsCacheStore>,
    pub clock: Arc<TestClock>,
    pub coordinator: Arc<SyncCoordinator<FakeGateway>>,
}

pub fn small_batches() -> SyncConfig {
    SyncConfig {
        batch_size: 2,
        ..SyncConfig::default()
    }
}

pub fn harness(gateway: FakeGateway, engine: TestEngine, config: SyncConfig) -> Harness {
    init_logger();
    let gateway = Arc::new(gateway);
    let engine = Arc::new(engine);
    let cache = Arc::new(BoundsCacheStore::in_memory().unwrap());
    let clock = Arc::new(TestClock::new(today()));
    let coordinator = Arc::new(SyncCoordinator::with_clock(
        gateway.clone(),
        engine.clone(),
        cache.clone(),
        config,
        clock.clone(),
    ));
    Harness {
        gateway,
        engine,
        cache,
        clock,
        coordinator,
    }
}
