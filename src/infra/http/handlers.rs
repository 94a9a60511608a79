//! HTTP handlers for the cache API.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::application::sessions::UserSessions;
use crate::cache::keys;

use super::AppState;
use super::error::{
    ApiError, cache_error_to_api, publish_error_to_api, repo_error_to_api, session_error_to_api,
};
use super::extract::ApiJson;
use super::models::*;

/// POST /question_result. Accepts an answer submission and hands it to the
/// grading queue; a 202 means the job is durable, not that it is graded.
pub async fn submit_question_result(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SubmitQuestionResultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.item.is_empty() {
        return Err(ApiError::bad_request(
            "submission carries no answer fields",
            None,
        ));
    }

    let job_id = state
        .sessions
        .submit_question_result(request.id, request.item)
        .await
        .map_err(repo_error_to_api)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitAcceptedResponse {
            id: request.id,
            job_id,
        }),
    ))
}

/// GET /session/{id}. Serves from the cache only; a missing hash is 404
/// regardless of what the data source holds.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SessionFieldsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let names = query.field_names();
    let fields = state
        .sessions
        .read_session_fields(id, names.as_deref())
        .await
        .map_err(cache_error_to_api)?;
    match fields {
        Some(fields) => Ok(Json(Value::Object(fields))),
        None => Err(ApiError::not_found("session not cached")),
    }
}

/// PATCH /session/{id}. Merges into the cached hash immediately and queues
/// the durable update.
pub async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<Map<String, Value>>,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("empty update body", None));
    }

    let updated = state
        .sessions
        .merge_session_fields(id, &body)
        .await
        .map_err(session_error_to_api)?;
    match updated {
        Some(updated) => Ok(Json(PatchSessionResponse { id, updated })),
        None => Err(ApiError::not_found("session not cached")),
    }
}

/// POST /session/batch. Unknown ids come back as null rather than failing
/// the whole batch.
pub async fn get_sessions_batch(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SessionBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.session_ids.is_empty() {
        return Err(ApiError::bad_request("session_ids must not be empty", None));
    }

    let sessions = state
        .sessions
        .read_sessions_batch(&request.session_ids)
        .await
        .map_err(cache_error_to_api)?;
    Ok(Json(sessions))
}

/// GET /session/{id}/qresults.
pub async fn get_session_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state
        .sessions
        .session_results(id)
        .await
        .map_err(cache_error_to_api)?;
    match results {
        Some(results) => Ok(Json(results)),
        None => Err(ApiError::not_found("no cached results for session")),
    }
}

/// GET /by-user/{user_id}. An unknown user is an empty index, not a 404.
pub async fn get_sessions_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .sessions
        .sessions_for_user(user_id)
        .await
        .map_err(cache_error_to_api)?;
    Ok(Json(sessions))
}

/// POST /by-users.
pub async fn get_sessions_by_users(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<UserBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.user_ids.is_empty() {
        return Err(ApiError::bad_request("user_ids must not be empty", None));
    }

    let mut out: HashMap<String, UserSessions> = HashMap::with_capacity(request.user_ids.len());
    for user_id in request.user_ids {
        let sessions = state
            .sessions
            .sessions_for_user(user_id)
            .await
            .map_err(cache_error_to_api)?;
        out.insert(user_id.to_string(), sessions);
    }
    Ok(Json(out))
}

/// GET /paper/{id}. A blob that no longer parses is dropped from the cache
/// and reported as a miss.
pub async fn get_paper(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let key = keys::item_key(keys::PAPER_BLOB_NS, &id.to_string());
    let Some(raw) = state.store.read_blob(&key).await.map_err(cache_error_to_api)? else {
        return Err(ApiError::not_found("paper not cached"));
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(blob) => Ok(Json(blob)),
        Err(err) => {
            warn!(
                target = "infra::http::get_paper",
                key,
                error = %err,
                "corrupt paper blob evicted"
            );
            if let Err(err) = state.store.delete_key(&key).await {
                warn!(
                    target = "infra::http::get_paper",
                    key,
                    error = %err,
                    "failed to evict corrupt blob"
                );
            }
            Err(ApiError::not_found("paper not cached"))
        }
    }
}

/// GET /emails/pop. Destructive read of the shared email worklist.
pub async fn pop_student_email(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let email = state
        .store
        .pop_list_head(keys::EMAIL_LIST_KEY)
        .await
        .map_err(cache_error_to_api)?;
    match email {
        Some(email) => Ok(Json(EmailPopResponse { email })),
        None => Err(ApiError::not_found("email list is empty")),
    }
}

/// POST /session/{id}/recalculate. Rescores every question result from
/// persisted answers and rewrites the aggregate.
pub async fn recalculate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let score = state
        .sessions
        .recalculate_session(id)
        .await
        .map_err(session_error_to_api)?;
    match score {
        Some(score) => Ok(Json(RecalculateResponse { id, score })),
        None => Err(ApiError::not_found("session not found")),
    }
}

/// POST /assessment/{id}/publish.
pub async fn publish_assessment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .publish
        .publish_assessment(id)
        .await
        .map_err(publish_error_to_api)?;
    Ok(Json(outcome))
}

/// DELETE /assessment/{id}.
pub async fn delete_assessment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .publish
        .delete_assessment(id)
        .await
        .map_err(repo_error_to_api)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("assessment not found"))
    }
}

/// POST /cache/event. Accepts a change notification from a writer that
/// bypasses this service; the refresher drains the queue on its next tick.
pub async fn publish_cache_event(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CacheEventRequest>,
) -> impl IntoResponse {
    state.events.publish(request.into());
    StatusCode::ACCEPTED
}

/// GET /healthz.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            warn!(target = "infra::http::healthz", error = %err, "database unreachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
