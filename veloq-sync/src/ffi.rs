//! FFI bindings for mobile platforms (iOS/Android).
//!
//! This module provides the UniFFI bindings that expose the sync coordinator
//! to Kotlin and Swift. Sync runs are spawned on a crate-owned tokio runtime
//! and never block the calling thread.
//!
//! Read functions called from render paths return empty defaults when
//! `sync_init` has not run yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::NaiveDate;
use log::{debug, info, warn};
use once_cell::sync::{Lazy, OnceCell};
use tokio::runtime::Runtime;

use crate::cache::BoundsCacheStore;
use crate::config::SyncConfig;
use crate::coordinator::{RequestOutcome, SyncCoordinator};
use crate::engine::{ActivityEngine, EngineHandle};
use crate::ffi_types::{
    FfiCacheEvent, FfiCachedStats, FfiRequestOutcome, FfiSyncOutcome, FfiSyncProgress,
};
use crate::http::{IntervalsGateway, auth_header_from_api_key};
use crate::persistence::{PersistentEngineStats, with_persistent_engine};
use crate::publisher::Subscription;
use crate::types::Bounds;
use crate::{SyncError, elapsed_ms, init_logging};

type Coordinator = SyncCoordinator<IntervalsGateway>;

// ============================================================================
// Callback Interfaces
// ============================================================================

/// Callback interface for receiving sync progress.
/// Implement this in Kotlin/Swift; one listener per mounted banner.
#[uniffi::export(callback_interface)]
pub trait SyncProgressListener: Send + Sync {
    fn on_progress(&self, progress: FfiSyncProgress);
}

/// Callback interface for bounds cache changes (map and timeline views).
#[uniffi::export(callback_interface)]
pub trait CacheChangeListener: Send + Sync {
    fn on_cache_changed(&self, event: FfiCacheEvent);
}

// ============================================================================
// Global state
// ============================================================================

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

static SYNC_COORDINATOR: Lazy<Mutex<Option<Arc<Coordinator>>>> = Lazy::new(|| Mutex::new(None));

/// Live progress subscriptions keyed by listener id. Removing an entry
/// drops its handle, which unsubscribes.
static PROGRESS_SUBSCRIPTIONS: Lazy<Mutex<HashMap<u64, Subscription>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static CACHE_SUBSCRIPTIONS: Lazy<Mutex<HashMap<u64, Subscription>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn runtime() -> Result<&'static Runtime, SyncError> {
    RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("veloq-sync")
            .enable_all()
            .build()
            .map_err(|e| SyncError::Runtime {
                message: format!("Failed to create runtime: {}", e),
            })
    })
}

fn coordinator() -> Option<Arc<Coordinator>> {
    lock(&SYNC_COORDINATOR).clone()
}

fn require_coordinator() -> Result<Arc<Coordinator>, SyncError> {
    coordinator().ok_or(SyncError::EngineNotInitialized)
}

/// Drive a freshly started run in the background.
fn spawn_run(
    coordinator: Arc<Coordinator>,
    outcome: RequestOutcome,
) -> Result<FfiRequestOutcome, SyncError> {
    if let RequestOutcome::Started(generation) = outcome {
        runtime()?.spawn(async move {
            coordinator.run(generation).await;
        });
    }
    Ok(outcome.into())
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, SyncError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| SyncError::invalid(field, format!("'{}': {}", value, e)))
}

// ============================================================================
// Setup
// ============================================================================

/// Initialize the engine, the bounds cache and the coordinator.
/// Call once at app startup (and again after login with the new header).
///
/// `config_json` may override any `SyncConfig` field.
#[uniffi::export]
pub fn sync_init(
    db_path: String,
    auth_header: String,
    config_json: Option<String>,
) -> Result<(), SyncError> {
    init_logging();
    let start = Instant::now();
    info!("[RUST: sync_init] Initializing with db: {}", db_path);

    let config = match config_json {
        Some(json) => SyncConfig::from_json(&json)?,
        None => SyncConfig::default(),
    };
    runtime()?;

    let engine = EngineHandle::global();
    engine.initialize(&db_path)?;
    let cache = Arc::new(BoundsCacheStore::open(&db_path)?);
    let gateway = Arc::new(IntervalsGateway::with_auth_header(
        auth_header,
        &config.api_base_url,
    )?);

    let coordinator = Arc::new(SyncCoordinator::new(
        gateway,
        Arc::new(engine),
        cache,
        config,
    ));
    if let Some(previous) = lock(&SYNC_COORDINATOR).replace(coordinator) {
        previous.abort_current();
    }
    // Handles belonged to the previous coordinator's publisher and cache
    lock(&PROGRESS_SUBSCRIPTIONS).clear();
    lock(&CACHE_SUBSCRIPTIONS).clear();

    info!("[RUST: sync_init] Ready ({} ms)", elapsed_ms(start));
    Ok(())
}

/// Whether `sync_init` has completed.
#[uniffi::export]
pub fn sync_is_initialized() -> bool {
    coordinator().is_some()
}

/// Build a Basic auth header from an intervals.icu API key.
#[uniffi::export]
pub fn create_auth_header(api_key: String) -> String {
    auth_header_from_api_key(&api_key)
}

// ============================================================================
// Sync requests
// ============================================================================

/// Ask for `[oldest, today]` to be synced (`oldest` as `YYYY-MM-DD`).
/// Returns immediately; progress arrives through listeners or polling.
#[uniffi::export]
pub fn request_date_range_expansion(oldest: String) -> Result<FfiRequestOutcome, SyncError> {
    init_logging();
    let oldest = parse_date("oldest", &oldest)?;
    let coordinator = require_coordinator()?;
    let outcome = coordinator.request_expansion(oldest)?;
    info!(
        "[RUST: request_date_range_expansion] {} -> {:?}",
        oldest, outcome
    );
    spawn_run(coordinator, outcome)
}

/// Sync the default rolling window (after login or on app start).
#[uniffi::export]
pub fn sync_default_window() -> Result<FfiRequestOutcome, SyncError> {
    let coordinator = require_coordinator()?;
    let outcome = coordinator.request_default_window();
    spawn_run(coordinator, outcome)
}

/// Clear the cache and engine, then start syncing the default window.
///
/// The reset itself happens before this returns, so `get_cached_stats`
/// reports the provisional window straight away.
#[uniffi::export]
pub fn reset_and_resync() -> Result<FfiRequestOutcome, SyncError> {
    init_logging();
    let coordinator = require_coordinator()?;
    coordinator.reset()?;
    let outcome = coordinator.request_default_window();
    info!("[RUST: reset_and_resync] {:?}", outcome);
    spawn_run(coordinator, outcome)
}

/// Withdraw the request identified by `token` (e.g. its screen was torn
/// down). A run shared with other requests keeps going until the last of
/// them is withdrawn.
#[uniffi::export]
pub fn cancel_sync(token: u64) -> bool {
    coordinator().is_some_and(|c| c.abort(token))
}

/// Remove activities older than `retention_days` from the engine and cache.
/// `0` keeps everything.
#[uniffi::export]
pub fn apply_retention(retention_days: u32) -> Result<u32, SyncError> {
    let removed = require_coordinator()?.apply_retention(retention_days)?;
    Ok(removed as u32)
}

/// Remove activities from the engine and the cache.
#[uniffi::export]
pub fn remove_synced_activities(activity_ids: Vec<String>) -> Result<u32, SyncError> {
    let removed = require_coordinator()?.remove_activities(&activity_ids)?;
    Ok(removed as u32)
}

// ============================================================================
// Progress
// ============================================================================

/// Register a progress listener. It is called right away with the current
/// progress. Returns the id to pass to `unsubscribe_from_progress`.
#[uniffi::export]
pub fn subscribe_to_progress(
    listener: Box<dyn SyncProgressListener>,
) -> Result<u64, SyncError> {
    let coordinator = require_coordinator()?;
    let listener: Arc<dyn SyncProgressListener> = Arc::from(listener);
    let subscription =
        coordinator.subscribe_to_progress(move |progress| listener.on_progress(progress.into()));
    let id = subscription.id();
    lock(&PROGRESS_SUBSCRIPTIONS).insert(id, subscription);
    debug!("[RUST: subscribe_to_progress] Listener {} added", id);
    Ok(id)
}

#[uniffi::export]
pub fn unsubscribe_from_progress(subscription_id: u64) -> bool {
    lock(&PROGRESS_SUBSCRIPTIONS)
        .remove(&subscription_id)
        .is_some()
}

/// Register a listener for committed bounds cache changes.
#[uniffi::export]
pub fn subscribe_to_cache_changes(
    listener: Box<dyn CacheChangeListener>,
) -> Result<u64, SyncError> {
    let coordinator = require_coordinator()?;
    let listener: Arc<dyn CacheChangeListener> = Arc::from(listener);
    let subscription = coordinator
        .cache()
        .subscribe(move |event| listener.on_cache_changed(event.into()));
    let id = subscription.id();
    lock(&CACHE_SUBSCRIPTIONS).insert(id, subscription);
    Ok(id)
}

#[uniffi::export]
pub fn unsubscribe_from_cache_changes(subscription_id: u64) -> bool {
    lock(&CACHE_SUBSCRIPTIONS).remove(&subscription_id).is_some()
}

/// Poll the current progress (for runtimes without cross-thread callbacks).
#[uniffi::export]
pub fn get_sync_progress() -> FfiSyncProgress {
    coordinator()
        .map(|c| c.progress())
        .unwrap_or_default()
        .into()
}

#[uniffi::export]
pub fn get_cached_stats() -> FfiCachedStats {
    coordinator()
        .map(|c| c.cached_stats().into())
        .unwrap_or_default()
}

/// How the last run ended, for the "last sync incomplete" indicator.
#[uniffi::export]
pub fn last_sync_outcome() -> Option<FfiSyncOutcome> {
    coordinator()?.last_outcome().map(Into::into)
}

// ============================================================================
// Viewport and engine passthroughs
// ============================================================================

/// Activity ids whose bounds intersect the viewport. Never fails.
#[uniffi::export]
pub fn query_viewport(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Vec<String> {
    match coordinator() {
        Some(c) => c.viewport().query(min_lat, max_lat, min_lng, max_lng),
        None => {
            debug!("[RUST: query_viewport] Not initialized, returning empty");
            Vec::new()
        }
    }
}

/// Viewport restricted to one sport type. Never fails.
#[uniffi::export]
pub fn query_viewport_by_sport(
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
    sport_type: String,
) -> Vec<String> {
    coordinator()
        .map(|c| {
            c.viewport()
                .query_sport(min_lat, max_lat, min_lng, max_lng, &sport_type)
        })
        .unwrap_or_default()
}

/// Viewport answered from the bounds cache alone, usable while the engine
/// is still loading. Never fails.
#[uniffi::export]
pub fn query_viewport_cached(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Vec<String> {
    let viewport = Bounds {
        min_lat,
        max_lat,
        min_lng,
        max_lng,
    };
    coordinator()
        .map(|c| c.viewport().query_cached(&viewport))
        .unwrap_or_default()
}

#[uniffi::export]
pub fn engine_get_activity_count() -> u32 {
    EngineHandle::global().activity_count().unwrap_or(0)
}

#[uniffi::export]
pub fn engine_is_initialized() -> bool {
    EngineHandle::global().is_initialized()
}

/// Remove activities from the engine and the bounds cache together.
/// A no-op before `sync_init`, when neither is loaded.
#[uniffi::export]
pub fn engine_remove_activities(activity_ids: Vec<String>) -> Result<(), SyncError> {
    info!(
        "[RUST: engine_remove_activities] Removing {} activities",
        activity_ids.len()
    );
    match coordinator() {
        Some(c) => c.remove_activities(&activity_ids).map(|_| ()),
        None => Ok(()),
    }
}

/// Retention sweep over the engine and the bounds cache; see
/// `apply_retention`. Returns 0 when nothing could be removed.
#[uniffi::export]
pub fn engine_cleanup_old_activities(retention_days: u32) -> u32 {
    let Some(coordinator) = coordinator() else {
        return 0;
    };
    match coordinator.apply_retention(retention_days) {
        Ok(removed) => removed as u32,
        Err(e) => {
            warn!("[RUST: engine_cleanup_old_activities] {}", e);
            0
        }
    }
}

/// Stored GPS track as a flat `[lat, lng, lat, lng, ...]` buffer; empty if
/// the activity is unknown or the engine is not loaded.
#[uniffi::export]
pub fn engine_get_gps_track(activity_id: String) -> Vec<f64> {
    with_persistent_engine(|e| e.get_gps_track(&activity_id))
        .flatten()
        .map(|track| track.into_iter().flat_map(|(lat, lng)| [lat, lng]).collect())
        .unwrap_or_default()
}

/// Get all activity bounds info as JSON for map display.
#[uniffi::export]
pub fn engine_get_all_activity_bounds_json() -> String {
    EngineHandle::global()
        .all_activity_bounds_json()
        .unwrap_or_else(|_| "[]".to_string())
}

/// Engine query of a single rectangle without the cache (debug screens).
#[uniffi::export]
pub fn engine_query_viewport(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Vec<String> {
    let Some(bounds) = (Bounds {
        min_lat,
        max_lat,
        min_lng,
        max_lng,
    })
    .normalized() else {
        return Vec::new();
    };
    EngineHandle::global()
        .query_viewport(&bounds)
        .unwrap_or_default()
}

#[uniffi::export]
pub fn engine_get_stats() -> Option<PersistentEngineStats> {
    with_persistent_engine(|e| e.stats())
}
