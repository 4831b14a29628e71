//! Veloq Sync - GPS activity synchronization and bounds cache
//!
//! This crate provides:
//! - A single-flight sync coordinator that fetches missing GPS streams
//! - SQLite-backed bounds cache with the persisted synced date range
//! - Shared, subscribable sync progress
//! - HTTP client for the intervals.icu API
//! - UniFFI bindings for iOS/Android

use std::time::Instant;

pub mod error;
pub use error::{Result, SyncError};

pub mod config;
pub use config::SyncConfig;

pub mod types;
pub use types::{
    ActivityBoundsRecord, ActivitySummary, Bounds, CachedStats, DateRangeRequest, GpsStream,
    SyncOutcome, SyncProgress, SyncRange, SyncStatus,
};

// Observable values and change notification
pub mod publisher;
pub use publisher::{Broadcaster, ProgressPublisher, Subscription};

// Schema migrations for the shared database file
pub mod migrations;

// Bounds cache store (synced range + per-activity bounds)
pub mod cache;
pub use cache::{BoundsCacheStore, CacheEvent};

// Persistent activity store that receives GPS tracks
pub mod persistence;
pub use persistence::{
    PERSISTENT_ENGINE, PersistentActivityStore, PersistentEngineStats, with_persistent_engine,
};

// Engine write/read contract
pub mod engine;
pub use engine::{ActivityEngine, EngineHandle};

// Remote fetch gateway contract and the intervals.icu implementation
pub mod gateway;
pub use gateway::ActivityGateway;

pub mod http;
pub use http::{IntervalsGateway, auth_header_from_api_key};

// Viewport queries for map components (never fail)
pub mod viewport;
pub use viewport::ViewportQueryProxy;

// The sync state machine
pub mod coordinator;
pub use coordinator::{Clock, RequestOutcome, SyncCoordinator, SystemClock};

// FFI bindings for mobile platforms
pub mod ffi;
pub mod ffi_types;

uniffi::setup_scaffolding!();

/// Helper to calculate elapsed milliseconds from an Instant
#[inline]
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("veloq-sync"),
    );
}

/// Initialize logging for iOS (unified logging)
#[cfg(target_os = "ios")]
pub(crate) fn init_logging() {
    use log::LevelFilter;
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = oslog::OsLogger::new("com.veloq.sync")
            .level_filter(LevelFilter::Debug)
            .init();
    });
}

#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub(crate) fn init_logging() {
    // No-op on desktop; tests install env_logger themselves
}
