//! Viewport queries for map components.
//!
//! Called from render paths, so nothing here returns an error: an
//! uninitialized engine or a failed query yields an empty list.

use std::sync::Arc;

use log::{debug, warn};

use crate::cache::BoundsCacheStore;
use crate::engine::ActivityEngine;
use crate::types::Bounds;

/// Stateless wrapper around the engine's spatial query.
#[derive(Clone)]
pub struct ViewportQueryProxy {
    engine: Arc<dyn ActivityEngine>,
    cache: Arc<BoundsCacheStore>,
}

impl ViewportQueryProxy {
    pub fn new(engine: Arc<dyn ActivityEngine>, cache: Arc<BoundsCacheStore>) -> Self {
        Self { engine, cache }
    }

    /// Activity ids whose bounds intersect the viewport.
    pub fn query(&self, min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Vec<String> {
        let viewport = Bounds {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        };
        let Some(viewport) = viewport.normalized() else {
            debug!("[Viewport] Ignoring non-finite viewport {:?}", viewport);
            return Vec::new();
        };

        match self.engine.query_viewport(&viewport) {
            Ok(mut ids) => {
                ids.sort();
                ids
            }
            Err(e) => {
                warn!("[Viewport] Query failed, returning empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Like [`query`](Self::query), restricted to one sport type using the
    /// cached records.
    pub fn query_sport(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
        sport_type: &str,
    ) -> Vec<String> {
        self.query(min_lat, max_lat, min_lng, max_lng)
            .into_iter()
            .filter(|id| {
                self.cache
                    .get(id)
                    .is_some_and(|record| record.sport_type == sport_type)
            })
            .collect()
    }

    /// Viewport answered from the bounds cache alone, for when the engine is
    /// still loading.
    pub fn query_cached(&self, viewport: &Bounds) -> Vec<String> {
        let Some(viewport) = viewport.normalized() else {
            return Vec::new();
        };
        self.cache
            .list_intersecting(&viewport)
            .into_iter()
            .map(|record| record.activity_id)
            .collect()
    }
}
