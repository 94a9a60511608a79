pub mod error;
pub mod extract;
pub mod handlers;
pub mod models;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::application::publish::PublishService;
use crate::application::sessions::SessionCacheService;
use crate::cache::events::EventQueue;
use crate::cache::store::RedisStore;
use crate::infra::db::PostgresRepositories;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionCacheService>,
    pub publish: Arc<PublishService>,
    pub store: RedisStore,
    pub db: Arc<PostgresRepositories>,
    pub events: Arc<EventQueue>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/question_result", post(handlers::submit_question_result))
        .route(
            "/session/{id}",
            get(handlers::get_session).patch(handlers::patch_session),
        )
        .route("/session/batch", post(handlers::get_sessions_batch))
        .route("/session/{id}/qresults", get(handlers::get_session_results))
        .route(
            "/session/{id}/recalculate",
            post(handlers::recalculate_session),
        )
        .route("/by-user/{user_id}", get(handlers::get_sessions_by_user))
        .route("/by-users", post(handlers::get_sessions_by_users))
        .route("/paper/{id}", get(handlers::get_paper))
        .route("/emails/pop", get(handlers::pop_student_email))
        .route(
            "/assessment/{id}/publish",
            post(handlers::publish_assessment),
        )
        .route("/assessment/{id}", delete(handlers::delete_assessment))
        .route("/cache/event", post(handlers::publish_cache_event))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
