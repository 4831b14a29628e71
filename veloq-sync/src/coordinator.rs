//! # Sync Coordinator
//!
//! Single-flight state machine that brings the bounds cache and the activity
//! engine up to date for a requested date window.
//!
//! ```text
//! Idle --request--> Syncing --all batches written--> Computing --recompute--> Idle
//!   ^                  |  ^                              |
//!   |                  |  +------ target widened --------+
//!   +--abort / reset---+
//! ```
//!
//! Every run owns a generation number. Superseding a run (`reset`, or
//! `abort` by its last interested caller) bumps the generation; a run whose
//! captured generation is no longer current discards whatever it was doing
//! at its next checkpoint and writes nothing.
//!
//! Each request gets its own token. The starter's token is the run's
//! generation; coalesced requests get fresh tokens attached to the same run.
//! Aborting one token detaches only that caller.
//!
//! Writes to the engine and the cache happen under the state lock after a
//! generation check, so a superseded run can never write after a reset.
//! Cache change events are delivered only after the state lock is released.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{Days, Local, NaiveDate};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use crate::cache::{BoundsCacheStore, DeferredEvents};
use crate::config::SyncConfig;
use crate::engine::{ActivityBatch, ActivityEngine, validate_activity_id, validate_sport_type};
use crate::gateway::ActivityGateway;
use crate::publisher::{ProgressPublisher, Subscription};
use crate::types::{
    ActivityBoundsRecord, ActivitySummary, Bounds, CachedStats, DateRangeRequest, GpsStream,
    SyncOutcome, SyncProgress, SyncRange, SyncStatus, track_distance_meters,
};
use crate::viewport::ViewportQueryProxy;
use crate::{Result, SyncError, elapsed_ms};

/// Source of "today" for window arithmetic.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Result of submitting a date range request.
///
/// The token identifies this request for [`SyncCoordinator::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new run was started; the caller drives it with [`SyncCoordinator::run`]
    Started(u64),
    /// Folded into the run already in flight
    Coalesced(u64),
    /// The cache already covers the request
    NotNeeded,
}

impl RequestOutcome {
    pub fn token(&self) -> Option<u64> {
        match self {
            RequestOutcome::Started(g) | RequestOutcome::Coalesced(g) => Some(*g),
            RequestOutcome::NotNeeded => None,
        }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    phase: SyncStatus,
    /// Run allowed to write
    generation: u64,
    /// Last id handed out; generations and request tokens share the sequence
    last_issued: u64,
    /// Tokens of the requests still waiting on the current run
    tokens: HashSet<u64>,
    /// Oldest day the in-flight run must cover
    target: Option<NaiveDate>,
    /// Set by `reset` until the next run commits
    expansion_lock: bool,
    last_outcome: Option<SyncOutcome>,
}

impl SyncState {
    fn issue(&mut self) -> u64 {
        self.last_issued += 1;
        self.last_issued
    }

    /// Invalidate the current run and go back to Idle.
    fn supersede(&mut self) -> u64 {
        self.generation = self.issue();
        self.phase = SyncStatus::Idle;
        self.target = None;
        self.tokens.clear();
        self.generation
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    synced: u32,
    failed: u32,
    total: u32,
}

enum PassResult {
    Done,
    Stale,
    ListingFailed(String),
    /// `synced_through` is the last day fully covered before the failed batch
    WriteFailed {
        reason: String,
        synced_through: Option<NaiveDate>,
    },
}

enum BatchResult {
    Committed { synced: u32, failed: u32 },
    WriteFailed { failed: u32, reason: String },
    Stale,
}

/// Whether `request` asks for anything the synced range does not cover.
fn needs_sync(range: &SyncRange, request: &DateRangeRequest, today: NaiveDate) -> bool {
    match (range.oldest_synced_date, range.newest_synced_date) {
        (Some(oldest), Some(newest)) => request.oldest < oldest || newest < today,
        _ => true,
    }
}

/// Owns the single in-flight sync and the authoritative synced range.
pub struct SyncCoordinator<G: ActivityGateway> {
    gateway: Arc<G>,
    engine: Arc<dyn ActivityEngine>,
    cache: Arc<BoundsCacheStore>,
    progress: Arc<ProgressPublisher>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<SyncState>,
}

impl<G: ActivityGateway> SyncCoordinator<G> {
    pub fn new(
        gateway: Arc<G>,
        engine: Arc<dyn ActivityEngine>,
        cache: Arc<BoundsCacheStore>,
        config: SyncConfig,
    ) -> Self {
        Self::with_clock(gateway, engine, cache, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        gateway: Arc<G>,
        engine: Arc<dyn ActivityEngine>,
        cache: Arc<BoundsCacheStore>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            engine,
            cache,
            progress: Arc::new(ProgressPublisher::new()),
            config: config.sanitized(),
            clock,
            state: Mutex::new(SyncState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_state().generation == generation
    }

    // ========================================================================
    // Read side
    // ========================================================================

    pub fn cache(&self) -> &Arc<BoundsCacheStore> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<dyn ActivityEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn viewport(&self) -> ViewportQueryProxy {
        ViewportQueryProxy::new(self.engine.clone(), self.cache.clone())
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress.get()
    }

    /// Listen to progress; the listener sees the current value immediately.
    pub fn subscribe_to_progress<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(listener)
    }

    pub fn status(&self) -> SyncStatus {
        self.lock_state().phase
    }

    pub fn last_outcome(&self) -> Option<SyncOutcome> {
        self.lock_state().last_outcome.clone()
    }

    pub fn is_expansion_locked(&self) -> bool {
        self.lock_state().expansion_lock
    }

    /// Summary for the cache-management screen.
    ///
    /// Right after a reset, and until the following run commits, the range
    /// reported is the default window rather than whatever is on disk.
    pub fn cached_stats(&self) -> CachedStats {
        let state = self.lock_state();
        let total_activities = self.cache.len() as u32;

        if state.expansion_lock {
            let window = DateRangeRequest::default_window(
                self.clock.today(),
                self.config.default_window_days,
            );
            return CachedStats {
                total_activities,
                oldest_date: Some(window.oldest),
                newest_date: Some(window.newest),
                last_sync_date: None,
                is_provisional: true,
                last_sync_incomplete: false,
            };
        }

        let range = self.cache.read_range();
        CachedStats {
            total_activities,
            oldest_date: range.oldest_synced_date,
            newest_date: range.newest_synced_date,
            last_sync_date: self.cache.last_synced_at(),
            is_provisional: false,
            last_sync_incomplete: state
                .last_outcome
                .as_ref()
                .is_some_and(SyncOutcome::is_incomplete),
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Start a run for `request`, fold it into the one in flight, or decide
    /// nothing is needed. One atomic check-and-set under the state lock.
    pub fn request_range(&self, request: DateRangeRequest) -> RequestOutcome {
        let today = self.clock.today();
        let mut state = self.lock_state();

        if state.phase != SyncStatus::Idle {
            let generation = state.generation;
            match state.target {
                Some(target) if request.oldest < target => {
                    state.target = Some(request.oldest);
                    info!(
                        "[SyncCoordinator] Run {} target widened {} -> {}",
                        generation, target, request.oldest
                    );
                }
                Some(_) => {}
                None => state.target = Some(request.oldest),
            }
            let token = state.issue();
            state.tokens.insert(token);
            return RequestOutcome::Coalesced(token);
        }

        let range = self.cache.read_range();
        if !needs_sync(&range, &request, today) {
            debug!(
                "[SyncCoordinator] {}..{} already synced ({:?}..{:?})",
                request.oldest, request.newest, range.oldest_synced_date, range.newest_synced_date
            );
            return RequestOutcome::NotNeeded;
        }

        // Refresh from the last synced day so the new span joins the old one
        let target = match range.newest_synced_date {
            Some(newest) => request.oldest.min(newest),
            None => request.oldest,
        };

        state.generation = state.issue();
        state.tokens = HashSet::from([state.generation]);
        state.phase = SyncStatus::Syncing;
        state.target = Some(target);
        info!(
            "[SyncCoordinator] Run {} started for {}..{}",
            state.generation, target, today
        );
        RequestOutcome::Started(state.generation)
    }

    /// Validate `oldest` and request `[oldest, today]`.
    pub fn request_expansion(&self, oldest: NaiveDate) -> Result<RequestOutcome> {
        let request = DateRangeRequest::expansion(oldest, self.clock.today())?;
        Ok(self.request_range(request))
    }

    /// Request the rolling default window ending today.
    pub fn request_default_window(&self) -> RequestOutcome {
        self.request_range(DateRangeRequest::default_window(
            self.clock.today(),
            self.config.default_window_days,
        ))
    }

    /// Request `[oldest, today]` and, if that started a run, drive it to the end.
    pub async fn expand(&self, oldest: NaiveDate) -> Result<RequestOutcome> {
        let outcome = self.request_expansion(oldest)?;
        if let RequestOutcome::Started(generation) = outcome {
            self.run(generation).await;
        }
        Ok(outcome)
    }

    // ========================================================================
    // The run
    // ========================================================================

    /// Drive run `generation` until it finishes or is superseded.
    pub async fn run(&self, generation: u64) -> SyncOutcome {
        let start = Instant::now();
        let today = self.clock.today();
        let mut tally = Tally::default();
        // Oldest day this run has listed and fetched through to today
        let mut fetched_from: Option<NaiveDate> = None;
        let mut stop: Option<String> = None;
        let mut partial: Option<(NaiveDate, NaiveDate)> = None;

        self.publish_syncing(generation, &tally);

        'run: loop {
            // Syncing: one pass per widening of the target
            loop {
                let target = {
                    let state = self.lock_state();
                    match (state.generation == generation, state.target) {
                        (true, Some(target)) => target,
                        _ => return self.discard(generation),
                    }
                };

                if fetched_from.is_none_or(|from| target < from) {
                    let newest = match fetched_from {
                        Some(from) => from.pred_opt().unwrap_or(from),
                        None => today,
                    };
                    match self.sync_pass(generation, target, newest, &mut tally).await {
                        PassResult::Done => fetched_from = Some(target),
                        PassResult::Stale => return self.discard(generation),
                        PassResult::ListingFailed(reason)
                            if fetched_from.is_none() && tally.synced == 0 =>
                        {
                            return self.finish(
                                generation,
                                SyncOutcome::Failed { reason },
                                &tally,
                                start,
                            );
                        }
                        PassResult::ListingFailed(reason) => {
                            stop = Some(reason);
                            break;
                        }
                        PassResult::WriteFailed {
                            reason,
                            synced_through,
                        } => {
                            partial = synced_through.map(|end| (target, end));
                            stop = Some(reason);
                            break;
                        }
                    }
                }

                let state = self.lock_state();
                if state.generation != generation {
                    drop(state);
                    return self.discard(generation);
                }
                if state.target == Some(target) {
                    break;
                }
            }

            // Computing
            {
                let mut state = self.lock_state();
                if state.generation != generation {
                    drop(state);
                    return self.discard(generation);
                }
                state.phase = SyncStatus::Computing;
            }
            self.progress.publish(
                generation,
                SyncProgress::computing(tally.synced, tally.total),
            );
            if tally.synced > 0 {
                let recompute_start = Instant::now();
                match self.engine.recompute() {
                    Ok(()) => debug!(
                        "[SyncCoordinator] Recompute requested ({} ms)",
                        elapsed_ms(recompute_start)
                    ),
                    Err(e) => warn!("[SyncCoordinator] Recompute failed: {}", e),
                }
            }

            // Commit the range, unless a request widened the target meanwhile
            let mut state = self.lock_state();
            if state.generation != generation {
                drop(state);
                return self.discard(generation);
            }
            if stop.is_none() && state.target != fetched_from {
                state.phase = SyncStatus::Syncing;
                drop(state);
                self.publish_syncing(generation, &tally);
                continue 'run;
            }

            let existing = self.cache.read_range();
            let mut range = existing;
            if let Some(from) = fetched_from {
                range = range.widened(from, today);
            }
            if let Some((oldest, newest)) = partial {
                range = range.widened(oldest, newest);
            }

            let mut events = DeferredEvents::default();
            let mut outcome = match stop.take() {
                Some(reason) => SyncOutcome::Incomplete {
                    synced: tally.synced,
                    failed: tally.failed,
                    reason,
                },
                None => SyncOutcome::Complete {
                    synced: tally.synced,
                    failed: tally.failed,
                },
            };
            if !range.is_empty() {
                if let Err(e) =
                    self.cache
                        .commit_batch_deferred(Vec::new(), Some(range), &mut events)
                {
                    error!("[SyncCoordinator] Failed to commit synced range: {}", e);
                    outcome = SyncOutcome::Incomplete {
                        synced: tally.synced,
                        failed: tally.failed,
                        reason: e.to_string(),
                    };
                }
            }
            if range != existing {
                info!(
                    "[SyncCoordinator] Synced range {:?}..{:?} -> {:?}..{:?}",
                    existing.oldest_synced_date,
                    existing.newest_synced_date,
                    range.oldest_synced_date,
                    range.newest_synced_date
                );
            }
            drop(state);
            self.cache.announce(events);

            return self.finish(generation, outcome, &tally, start);
        }
    }

    /// List `[oldest, newest]`, then fetch and commit the missing activities
    /// in ascending date order.
    async fn sync_pass(
        &self,
        generation: u64,
        oldest: NaiveDate,
        newest: NaiveDate,
        tally: &mut Tally,
    ) -> PassResult {
        let listing = match self.gateway.list_activities(oldest, newest).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(
                    "[SyncCoordinator] Listing {}..{} failed: {}",
                    oldest, newest, e
                );
                return PassResult::ListingFailed(e.to_string());
            }
        };

        let mut pruned = DeferredEvents::default();
        let pending = {
            let state = self.lock_state();
            if state.generation != generation {
                return PassResult::Stale;
            }
            if self.config.prune_deleted {
                self.prune_missing(&listing, oldest, newest, &mut pruned);
            }

            let known = self.cache.known_ids();
            let mut seen = HashSet::new();
            let mut pending: Vec<ActivitySummary> = listing
                .into_iter()
                .filter(|a| a.start_date >= oldest && a.start_date <= newest)
                .filter(|a| !known.contains(&a.id) && seen.insert(a.id.clone()))
                .collect();
            pending.sort_by(|a, b| {
                a.start_date
                    .cmp(&b.start_date)
                    .then_with(|| a.id.cmp(&b.id))
            });
            pending
        };
        self.cache.announce(pruned);

        info!(
            "[SyncCoordinator] Pass {}..{}: {} activities to fetch",
            oldest,
            newest,
            pending.len()
        );
        tally.total += pending.len() as u32;
        self.publish_syncing(generation, tally);

        for chunk in pending.chunks(self.config.batch_size) {
            match self.sync_batch(generation, chunk).await {
                BatchResult::Committed { synced, failed } => {
                    tally.synced += synced;
                    tally.failed += failed;
                    self.publish_syncing(generation, tally);
                }
                BatchResult::Stale => return PassResult::Stale,
                BatchResult::WriteFailed { failed, reason } => {
                    tally.failed += failed;
                    let synced_through = chunk
                        .first()
                        .and_then(|a| a.start_date.pred_opt())
                        .filter(|day| *day >= oldest);
                    return PassResult::WriteFailed {
                        reason,
                        synced_through,
                    };
                }
            }
        }
        PassResult::Done
    }

    async fn fetch_streams(&self, chunk: &[ActivitySummary]) -> Vec<Result<GpsStream>> {
        let ids: Vec<String> = chunk.iter().map(|summary| summary.id.clone()).collect();
        stream::iter(ids)
            .map(|id| {
                let gateway = self.gateway.clone();
                async move { gateway.fetch_gps_stream(&id).await }
            })
            .buffered(self.config.max_concurrency)
            .collect()
            .await
    }

    /// Fetch one batch and write it to the engine and the cache.
    async fn sync_batch(&self, generation: u64, chunk: &[ActivitySummary]) -> BatchResult {
        let batch_start = Instant::now();
        let fetched =
            match tokio::time::timeout(self.config.batch_timeout(), self.fetch_streams(chunk))
                .await
            {
                Ok(fetched) => fetched,
                Err(_) => {
                    let timeout = SyncError::Timeout {
                        operation: format!("GPS fetch for a batch of {}", chunk.len()),
                        seconds: self.config.batch_timeout_secs,
                    };
                    warn!("[SyncCoordinator] {}", timeout);
                    if !self.is_current(generation) {
                        return BatchResult::Stale;
                    }
                    return BatchResult::Committed {
                        synced: 0,
                        failed: chunk.len() as u32,
                    };
                }
            };

        let mut batch = ActivityBatch::default();
        let mut records = Vec::with_capacity(chunk.len());
        let mut failed = 0u32;
        for (summary, result) in chunk.iter().zip(fetched) {
            let stream = match result {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("[SyncCoordinator] Skipping {}: {}", summary.id, e);
                    failed += 1;
                    continue;
                }
            };
            let points = stream.valid_points();
            let valid = points.len() >= 2
                && validate_activity_id(&summary.id).is_ok()
                && validate_sport_type(&summary.sport_type).is_ok();
            let Some(bounds) = Bounds::from_points(&points).filter(|_| valid) else {
                warn!(
                    "[SyncCoordinator] Skipping {}: unusable GPS stream ({} points)",
                    summary.id,
                    points.len()
                );
                failed += 1;
                continue;
            };

            batch.push(&summary.id, &points, &summary.sport_type);
            records.push(ActivityBoundsRecord {
                activity_id: summary.id.clone(),
                bounds,
                sport_type: summary.sport_type.clone(),
                distance_meters: summary
                    .distance_meters
                    .unwrap_or_else(|| track_distance_meters(&points)),
                start_date: summary.start_date,
            });
        }

        let mut events = DeferredEvents::default();
        let state = self.lock_state();
        if state.generation != generation {
            return BatchResult::Stale;
        }
        let written = if batch.is_empty() {
            Ok(())
        } else {
            self.write_with_retry(&batch)
                .and_then(|()| self.cache.commit_batch_deferred(records, None, &mut events))
        };
        drop(state);
        self.cache.announce(events);

        if let Err(e) = written {
            error!(
                "[SyncCoordinator] Batch of {} not written: {}",
                batch.len(),
                e
            );
            return BatchResult::WriteFailed {
                failed: chunk.len() as u32,
                reason: e.to_string(),
            };
        }

        debug!(
            "[SyncCoordinator] Batch: {} written, {} skipped ({} ms)",
            batch.len(),
            failed,
            elapsed_ms(batch_start)
        );
        BatchResult::Committed {
            synced: batch.len() as u32,
            failed,
        }
    }

    fn write_with_retry(&self, batch: &ActivityBatch) -> Result<()> {
        let mut attempt = 0;
        loop {
            match batch.write_to(self.engine.as_ref()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.engine_write_retries && !e.is_validation() => {
                    attempt += 1;
                    warn!(
                        "[SyncCoordinator] Engine write failed ({}), retry {}",
                        e, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop cached activities inside `[oldest, newest]` that the remote
    /// listing no longer reports. Caller holds the state lock.
    fn prune_missing(
        &self,
        listing: &[ActivitySummary],
        oldest: NaiveDate,
        newest: NaiveDate,
        events: &mut DeferredEvents,
    ) {
        let listed: HashSet<&str> = listing.iter().map(|a| a.id.as_str()).collect();
        let missing: Vec<String> = self
            .cache
            .list_between(oldest, newest)
            .into_iter()
            .filter(|r| !listed.contains(r.activity_id.as_str()))
            .map(|r| r.activity_id)
            .collect();
        if missing.is_empty() {
            return;
        }

        info!(
            "[SyncCoordinator] Pruning {} activities deleted remotely",
            missing.len()
        );
        if let Err(e) = self.engine.remove_activities(&missing) {
            warn!("[SyncCoordinator] Engine prune failed: {}", e);
        }
        if let Err(e) = self.cache.remove_deferred(&missing, events) {
            warn!("[SyncCoordinator] Cache prune failed: {}", e);
        }
    }

    fn publish_syncing(&self, generation: u64, tally: &Tally) {
        self.progress.publish(
            generation,
            SyncProgress::syncing(
                tally.synced,
                tally.total,
                format!("Syncing GPS data ({}/{})", tally.synced, tally.total),
            ),
        );
    }

    /// Terminal transition back to Idle for a run that is still current.
    fn finish(
        &self,
        generation: u64,
        outcome: SyncOutcome,
        tally: &Tally,
        start: Instant,
    ) -> SyncOutcome {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                drop(state);
                return self.discard(generation);
            }
            state.phase = SyncStatus::Idle;
            state.target = None;
            state.tokens.clear();
            if !matches!(outcome, SyncOutcome::Failed { .. }) {
                state.expansion_lock = false;
            }
            state.last_outcome = Some(outcome.clone());
        }

        let message = match &outcome {
            SyncOutcome::Complete { failed: 0, .. } => None,
            SyncOutcome::Complete { failed, .. } => Some(format!("{} activities failed", failed)),
            SyncOutcome::Incomplete { reason, .. } => Some(format!("Sync incomplete: {}", reason)),
            SyncOutcome::Failed { reason } => Some(format!("Sync failed: {}", reason)),
            SyncOutcome::Cancelled => None,
        };
        self.progress.publish(
            generation,
            SyncProgress::finished(tally.synced, tally.total, message),
        );

        info!(
            "[SyncCoordinator] Run {} finished: {:?} ({} ms)",
            generation,
            outcome,
            elapsed_ms(start)
        );
        outcome
    }

    fn discard(&self, generation: u64) -> SyncOutcome {
        info!(
            "[SyncCoordinator] Run {} superseded, discarding its results",
            generation
        );
        SyncOutcome::Cancelled
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Withdraw the request identified by `token` (component teardown).
    ///
    /// The run is cancelled only once no request is waiting on it; other
    /// callers sharing the run keep it going. A cancelled run leaves the
    /// range as it was, and batches already committed stay.
    /// Returns false if `token` is not attached to a live run.
    pub fn abort(&self, token: u64) -> bool {
        let (run, next) = {
            let mut state = self.lock_state();
            if state.phase == SyncStatus::Idle || !state.tokens.remove(&token) {
                return false;
            }
            if !state.tokens.is_empty() {
                debug!(
                    "[SyncCoordinator] Request {} detached from run {}, {} still waiting",
                    token,
                    state.generation,
                    state.tokens.len()
                );
                return true;
            }
            let run = state.generation;
            let next = state.supersede();
            state.last_outcome = Some(SyncOutcome::Cancelled);
            (run, next)
        };
        self.progress.reset(next);
        info!("[SyncCoordinator] Run {} aborted", run);
        true
    }

    /// Cancel whatever run is in flight, regardless of who is waiting on it.
    pub fn abort_current(&self) -> bool {
        let (run, next) = {
            let mut state = self.lock_state();
            if state.phase == SyncStatus::Idle {
                return false;
            }
            let run = state.generation;
            let next = state.supersede();
            state.last_outcome = Some(SyncOutcome::Cancelled);
            (run, next)
        };
        self.progress.reset(next);
        info!("[SyncCoordinator] Run {} aborted", run);
        true
    }

    /// Clear the cache and the engine and supersede any run. Does not start
    /// a new sync; stats stay provisional until the next run commits.
    pub fn reset(&self) -> Result<()> {
        let mut events = DeferredEvents::default();
        let (generation, cleared) = {
            let mut state = self.lock_state();
            let generation = state.supersede();
            state.expansion_lock = true;
            state.last_outcome = None;

            let cleared = self.cache.clear_deferred(&mut events);
            match self.engine.clear() {
                Ok(()) | Err(SyncError::EngineNotInitialized) => {}
                Err(e) => warn!("[SyncCoordinator] Engine clear failed: {}", e),
            }
            (generation, cleared)
        };
        self.cache.announce(events);
        self.progress.reset(generation);
        info!("[SyncCoordinator] Reset (generation {})", generation);
        cleared
    }

    /// Reset, then sync the default window.
    pub async fn reset_and_resync(&self) -> Result<RequestOutcome> {
        self.reset()?;
        let outcome = self.request_default_window();
        if let RequestOutcome::Started(generation) = outcome {
            self.run(generation).await;
        }
        Ok(outcome)
    }

    /// Drop activities that started more than `retention_days` ago from the
    /// engine and the cache, moving the synced range's oldest end forward.
    ///
    /// This is the one sanctioned way, besides `reset`, to narrow the range.
    /// `retention_days == 0` keeps everything.
    pub fn apply_retention(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let state = self.lock_state();
        if state.phase != SyncStatus::Idle {
            return Err(SyncError::Runtime {
                message: "cannot apply retention while a sync is running".to_string(),
            });
        }

        let cutoff = self
            .clock
            .today()
            .checked_sub_days(Days::new(retention_days as u64))
            .unwrap_or(NaiveDate::MIN);
        let expired: Vec<String> = self
            .cache
            .list_all()
            .into_iter()
            .filter(|r| r.start_date < cutoff)
            .map(|r| r.activity_id)
            .collect();
        if !expired.is_empty() {
            match self.engine.remove_activities(&expired) {
                Ok(()) | Err(SyncError::EngineNotInitialized) => {}
                Err(e) => return Err(e),
            }
        }
        let mut events = DeferredEvents::default();
        let removed = self.cache.remove_older_than_deferred(cutoff, &mut events)?;
        drop(state);
        self.cache.announce(events);

        info!(
            "[SyncCoordinator] Retention of {} days removed {} activities before {}",
            retention_days, removed, cutoff
        );
        Ok(removed)
    }

    /// Remove activities (e.g. deleted by the user) from the engine and cache.
    pub fn remove_activities(&self, activity_ids: &[String]) -> Result<usize> {
        for id in activity_ids {
            validate_activity_id(id)?;
        }
        let mut events = DeferredEvents::default();
        let removed = {
            let _state = self.lock_state();
            match self.engine.remove_activities(activity_ids) {
                Ok(()) | Err(SyncError::EngineNotInitialized) => {}
                Err(e) => return Err(e),
            }
            self.cache.remove_deferred(activity_ids, &mut events)?
        };
        self.cache.announce(events);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_needs_sync() {
        let today = d("2024-03-01");
        let request = DateRangeRequest {
            oldest: d("2024-01-01"),
            newest: today,
        };

        assert!(needs_sync(&SyncRange::default(), &request, today));
        assert!(!needs_sync(
            &SyncRange::new(d("2024-01-01"), today),
            &request,
            today
        ));
        // Earlier oldest requested
        assert!(needs_sync(
            &SyncRange::new(d("2024-02-01"), today),
            &request,
            today
        ));
        // Range ends before today
        assert!(needs_sync(
            &SyncRange::new(d("2023-01-01"), d("2024-02-28")),
            &request,
            today
        ));
    }

    #[test]
    fn test_request_outcome_token() {
        assert_eq!(RequestOutcome::Started(3).token(), Some(3));
        assert_eq!(RequestOutcome::Coalesced(4).token(), Some(4));
        assert_eq!(RequestOutcome::NotNeeded.token(), None);
    }

    #[test]
    fn test_tokens_share_one_increasing_sequence() {
        let mut state = SyncState::default();
        let first = state.issue();
        let second = state.issue();
        assert!(second > first);
        state.tokens.insert(second);

        let next = state.supersede();
        assert!(next > second);
        assert_eq!(state.generation, next);
        assert!(state.tokens.is_empty());
        assert_eq!(state.phase, SyncStatus::Idle);
    }
}
