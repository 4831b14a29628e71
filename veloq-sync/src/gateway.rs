//! Remote fetch gateway contract.

use std::future::Future;

use chrono::NaiveDate;

use crate::Result;
use crate::types::{ActivitySummary, GpsStream};

/// Source of activity listings and raw GPS streams.
///
/// Retry and backoff for transient failures belong to the implementation;
/// the coordinator treats any error as "this item failed, continue".
pub trait ActivityGateway: Send + Sync + 'static {
    /// Activities that started within `[oldest, newest]`, inclusive.
    fn list_activities(
        &self,
        oldest: NaiveDate,
        newest: NaiveDate,
    ) -> impl Future<Output = Result<Vec<ActivitySummary>>> + Send;

    /// GPS stream of one activity.
    fn fetch_gps_stream(&self, activity_id: &str) -> impl Future<Output = Result<GpsStream>> + Send;
}
