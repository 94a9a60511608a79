use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::application::repos::{DistributionRepo, QuestionResultsRepo, SessionsRepo};
use crate::cache::{CacheRefresher, RedisStore};

/// Shared context passed to job workers so they can reach persistence and
/// the cache.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub sessions: Arc<dyn SessionsRepo>,
    pub results: Arc<dyn QuestionResultsRepo>,
    pub distribution: Arc<dyn DistributionRepo>,
    pub store: RedisStore,
    pub refresher: Arc<CacheRefresher>,
    pub cache_ttl_seconds: u64,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
