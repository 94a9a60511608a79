use std::{
    future::{Future, IntoFuture},
    process,
    sync::Arc,
    time::Duration,
};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::CronStream;
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use quaderno::{
    application::{
        jobs::{
            CacheRefreshContext, JobWorkerContext, cache_refresh_schedule,
            process_cache_refresh_job, process_distribute_student_job,
            process_grade_submission_job, process_persist_session_update_job,
        },
        publish::PublishService,
        repos::{
            AssessmentsRepo, DistributionRepo, JobsRepo, PapersRepo, QuestionResultsRepo,
            SessionsRepo, StudentsRepo,
        },
        sessions::SessionCacheService,
    },
    cache::{CacheRefresher, EventKind, EventQueue, RedisStore, RefreshConfig, RefreshStrategy},
    config,
    domain::types::JobType,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, AppState},
        redis, telemetry,
    },
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_startup_error(&error);
        process::exit(1);
    }
}

fn report_startup_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "startup error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "startup error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (_cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    let (http_repositories, job_repositories) = init_repositories(&settings).await?;

    let connection = redis::connect(&settings.redis.url).await?;
    let store = RedisStore::new(connection);

    let events = Arc::new(EventQueue::new());
    let refresher = Arc::new(build_refresher(
        store.clone(),
        http_repositories.clone(),
        events.clone(),
        &settings.cache,
    ));

    let sessions_repo: Arc<dyn SessionsRepo> = http_repositories.clone();
    let results_repo: Arc<dyn QuestionResultsRepo> = http_repositories.clone();
    let jobs_repo: Arc<dyn JobsRepo> = http_repositories.clone();

    let session_service = Arc::new(SessionCacheService::new(
        store.clone(),
        sessions_repo,
        results_repo,
        jobs_repo.clone(),
        events.clone(),
        settings.cache.ttl_seconds,
    ));

    let assessments_repo: Arc<dyn AssessmentsRepo> = http_repositories.clone();
    let papers_repo: Arc<dyn PapersRepo> = http_repositories.clone();
    let distribution_repo: Arc<dyn DistributionRepo> = http_repositories.clone();

    let publish_service = Arc::new(PublishService::new(
        assessments_repo,
        papers_repo,
        distribution_repo,
        jobs_repo,
        refresher.clone(),
    ));

    // Startup warmup goes through the same queue as any other event so a
    // concurrent full refresh cannot race it.
    events.publish(EventKind::WarmupOnStartup);
    refresher.consume().await;

    let consume_handle = {
        let refresher = refresher.clone();
        let interval_duration = settings.cache.consume_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                refresher.consume().await;
            }
        })
    };

    let job_context = JobWorkerContext {
        sessions: job_repositories.clone(),
        results: job_repositories.clone(),
        distribution: job_repositories.clone(),
        store: store.clone(),
        refresher: refresher.clone(),
        cache_ttl_seconds: settings.cache.ttl_seconds,
    };
    let monitor_handle = spawn_job_monitor(
        job_repositories,
        job_context,
        refresher.clone(),
        &settings.jobs,
    );

    let state = AppState {
        sessions: session_service,
        publish: publish_service,
        store,
        db: http_repositories,
        events: events.clone(),
    };
    let result = serve_http(&settings, state).await;

    monitor_handle.abort();
    let _ = monitor_handle.await;
    consume_handle.abort();
    let _ = consume_handle.await;

    result
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<(Arc<PostgresRepositories>, Arc<PostgresRepositories>), InfraError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let http_pool =
        PostgresRepositories::connect(database_url, settings.database.http_max_connections.get())
            .await
            .map_err(|err| InfraError::database(err.to_string()))?;

    PostgresRepositories::run_migrations(&http_pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    let jobs_pool =
        PostgresRepositories::connect(database_url, settings.database.jobs_max_connections.get())
            .await
            .map_err(|err| InfraError::database(err.to_string()))?;

    // The queue broker owns its schema; push_job is unusable until this runs.
    PostgresStorage::setup(&jobs_pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    Ok((
        Arc::new(PostgresRepositories::new(http_pool)),
        Arc::new(PostgresRepositories::new(jobs_pool)),
    ))
}

fn build_refresher(
    store: RedisStore,
    repositories: Arc<PostgresRepositories>,
    events: Arc<EventQueue>,
    cache: &config::CacheSettings,
) -> CacheRefresher {
    let sessions: Arc<dyn SessionsRepo> = repositories.clone();
    let results: Arc<dyn QuestionResultsRepo> = repositories.clone();
    let papers: Arc<dyn PapersRepo> = repositories.clone();
    let students: Arc<dyn StudentsRepo> = repositories.clone();
    let assessments: Arc<dyn AssessmentsRepo> = repositories;

    CacheRefresher::new(
        store,
        sessions,
        results,
        papers,
        students,
        assessments,
        events,
        RefreshConfig {
            ttl_seconds: cache.ttl_seconds,
            lock_ttl_seconds: cache.lock_ttl_seconds,
            strategy: RefreshStrategy::from_incremental(cache.incremental_enabled),
            event_drain_batch: cache.event_drain_batch,
        },
    )
}

fn spawn_job_monitor(
    repositories: Arc<PostgresRepositories>,
    context: JobWorkerContext,
    refresher: Arc<CacheRefresher>,
    jobs: &config::JobsSettings,
) -> tokio::task::JoinHandle<()> {
    let grade_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::GradeSubmission.as_str()),
    );
    let distribute_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::DistributeStudent.as_str()),
    );
    let persist_storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::PersistSessionUpdate.as_str()),
    );

    let grade_concurrency = jobs.grade_concurrency.get() as usize;
    let distribute_concurrency = jobs.distribute_concurrency.get() as usize;
    let persist_concurrency = jobs.persist_concurrency.get() as usize;

    let grade_worker = WorkerBuilder::new("grade-submission-worker")
        .concurrency(grade_concurrency)
        .data(context.clone())
        .backend(grade_storage)
        .build_fn(process_grade_submission_job);
    let distribute_worker = WorkerBuilder::new("distribute-student-worker")
        .concurrency(distribute_concurrency)
        .data(context.clone())
        .backend(distribute_storage)
        .build_fn(process_distribute_student_job);
    let persist_worker = WorkerBuilder::new("persist-session-update-worker")
        .concurrency(persist_concurrency)
        .data(context.clone())
        .backend(persist_storage)
        .build_fn(process_persist_session_update_job);

    // Cron-driven full cache rebuild on the half hour.
    let refresh_ctx = CacheRefreshContext { refresher };
    let refresh_worker = WorkerBuilder::new("cache-refresh-worker")
        .data(refresh_ctx)
        .backend(CronStream::new(cache_refresh_schedule()))
        .build_fn(process_cache_refresh_job);

    let monitor = Monitor::new()
        .register(grade_worker)
        .register(distribute_worker)
        .register(persist_worker)
        .register(refresh_worker);

    tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    })
}

async fn serve_http(settings: &config::Settings, state: AppState) -> Result<(), InfraError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "quaderno::serve",
        addr = %settings.server.addr,
        "listening"
    );

    let draining = Arc::new(Notify::new());
    let signalled = draining.clone();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            wait_for_shutdown_signal().await;
            signalled.notify_one();
        },
    );

    drain_with_deadline(
        server.into_future(),
        draining,
        settings.server.graceful_shutdown,
    )
    .await
}

async fn wait_for_shutdown_signal() {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
    info!(target = "quaderno::serve", "shutdown signal received, draining");
}

/// Waits for the server to drain its in-flight connections, but no longer
/// than the configured deadline after the shutdown signal.
async fn drain_with_deadline<F>(
    server: F,
    draining: Arc<Notify>,
    deadline: Duration,
) -> Result<(), InfraError>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result.map_err(InfraError::from),
        () = async {
            draining.notified().await;
            tokio::time::sleep(deadline).await;
        } => {
            warn!(
                target = "quaderno::serve",
                "drain deadline passed, abandoning open connections"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drain_ends_when_the_server_finishes_first() {
        let draining = Arc::new(Notify::new());
        draining.notify_one();

        let server = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        };
        let result = drain_with_deadline(server, draining, Duration::from_secs(30)).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_at_the_deadline() {
        let draining = Arc::new(Notify::new());
        draining.notify_one();

        let server = async {
            std::future::pending::<()>().await;
            Ok(())
        };
        let result = drain_with_deadline(server, draining, Duration::from_secs(30)).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_surface_from_the_drain() {
        let draining = Arc::new(Notify::new());

        let server = async { Err(std::io::Error::other("bind lost")) };
        let result = drain_with_deadline(server, draining, Duration::from_secs(30)).await;
        assert!(result.is_err());
    }
}
