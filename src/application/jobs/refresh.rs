//! Cron-triggered full cache refresh.

use std::str::FromStr;
use std::sync::Arc;

use apalis::prelude::*;
use cron::Schedule;

use crate::cache::CacheRefresher;

/// Marker struct for the cron-triggered refresh.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct CacheRefreshJob;

impl From<chrono::DateTime<chrono::Utc>> for CacheRefreshJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct CacheRefreshContext {
    pub refresher: Arc<CacheRefresher>,
}

/// Rebuild every descriptor; lock contention across instances shows up as
/// skipped descriptors, never as failures.
pub async fn process_cache_refresh_job(
    _job: CacheRefreshJob,
    ctx: Data<CacheRefreshContext>,
) -> Result<(), apalis::prelude::Error> {
    ctx.refresher.refresh_all().await;
    Ok(())
}

/// Runs every 30 minutes: "0 0,30 * * * *"
pub fn cache_refresh_schedule() -> Schedule {
    Schedule::from_str("0 0,30 * * * *").expect("Invalid cron expression for cache refresh")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parses_correctly() {
        let schedule = cache_refresh_schedule();
        let upcoming: Vec<_> = schedule.upcoming(chrono::Utc).take(3).collect();
        assert_eq!(upcoming.len(), 3);
    }
}
