//! Session cache service.
//!
//! Read paths serve from Redis only (the hashes are the interop surface
//! shared with other cache readers); write paths merge into the cache
//! immediately and defer the durable write to the queue.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::store::{CacheError, RedisStore};
use crate::cache::{EventKind, EventQueue, codec, keys};
use crate::domain::entities::{SESSION_UPDATABLE_FIELDS, SubmittedAnswers};
use crate::domain::scoring::{self, AnswerSet};
use crate::domain::types::AssessmentKind;

use super::jobs::{enqueue_grade_submission_job, enqueue_persist_session_update_job};
use super::repos::{JobsRepo, QuestionResultsRepo, RepoError, SessionsRepo};

#[derive(Debug, Error)]
pub enum SessionServiceError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Parsed fields of one cached session hash.
pub type SessionFields = Map<String, Value>;

/// Reverse-index lookup result for one user.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UserSessions {
    pub practice_session_ids: Vec<String>,
    pub exam_session_ids: Vec<String>,
}

/// An update the data source would reject must never reach the cache or
/// the queue; unknown fields are a client error, not a retryable job.
fn validate_updatable_fields(body: &Map<String, Value>) -> Result<(), RepoError> {
    for name in body.keys() {
        if !SESSION_UPDATABLE_FIELDS.contains(&name.as_str()) {
            return Err(RepoError::invalid_input(format!(
                "field `{name}` is not updatable"
            )));
        }
    }
    Ok(())
}

pub struct SessionCacheService {
    store: RedisStore,
    sessions: Arc<dyn SessionsRepo>,
    results: Arc<dyn QuestionResultsRepo>,
    jobs: Arc<dyn JobsRepo>,
    events: Arc<EventQueue>,
    ttl_seconds: u64,
}

impl SessionCacheService {
    pub fn new(
        store: RedisStore,
        sessions: Arc<dyn SessionsRepo>,
        results: Arc<dyn QuestionResultsRepo>,
        jobs: Arc<dyn JobsRepo>,
        events: Arc<EventQueue>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            sessions,
            results,
            jobs,
            events,
            ttl_seconds,
        }
    }

    /// Which kind's info namespace holds this session, probing practice
    /// first. Only the cache is consulted; a miss in both is a miss.
    async fn probe_kind(&self, session_id: Uuid) -> Result<Option<AssessmentKind>, CacheError> {
        let id = session_id.to_string();
        for kind in [AssessmentKind::Practice, AssessmentKind::Exam] {
            let key = keys::item_key(keys::session_info_ns(kind), &id);
            if self.store.hash_exists(&key).await? {
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    /// Selected (or all) fields of one cached session, parsed back from
    /// their string encoding.
    pub async fn read_session_fields(
        &self,
        session_id: Uuid,
        fields: Option<&[String]>,
    ) -> Result<Option<SessionFields>, CacheError> {
        let Some(kind) = self.probe_kind(session_id).await? else {
            return Ok(None);
        };
        let key = keys::item_key(keys::session_info_ns(kind), &session_id.to_string());

        let mut parsed = Map::new();
        match fields {
            Some(names) => {
                let values = self.store.read_hash_fields(&key, names).await?;
                for (name, value) in names.iter().zip(values) {
                    if let Some(raw) = value {
                        parsed.insert(name.clone(), codec::parse_value(&raw));
                    }
                }
            }
            None => {
                for (name, raw) in self.store.read_hash(&key).await? {
                    parsed.insert(name, codec::parse_value(&raw));
                }
            }
        }

        if parsed.is_empty() {
            return Ok(None);
        }
        Ok(Some(parsed))
    }

    /// Batch variant: id to parsed-fields-or-null, read concurrently over
    /// the shared multiplexed connection.
    pub async fn read_sessions_batch(
        &self,
        session_ids: &[Uuid],
    ) -> Result<HashMap<String, Option<SessionFields>>, CacheError> {
        let reads = session_ids.iter().map(|session_id| async move {
            let fields = self.read_session_fields(*session_id, None).await?;
            Ok::<_, CacheError>((session_id.to_string(), fields))
        });
        Ok(future::try_join_all(reads).await?.into_iter().collect())
    }

    /// Merges a field map into the cached hash and enqueues the durable
    /// data-source update. Returns the merged field names, or `None` when
    /// the session is not cached.
    pub async fn merge_session_fields(
        &self,
        session_id: Uuid,
        body: &Map<String, Value>,
    ) -> Result<Option<Vec<String>>, SessionServiceError> {
        validate_updatable_fields(body)?;

        let Some(kind) = self.probe_kind(session_id).await? else {
            return Ok(None);
        };
        let key = keys::item_key(keys::session_info_ns(kind), &session_id.to_string());

        let fields: Vec<(String, String)> = body
            .iter()
            .map(|(name, value)| (name.clone(), codec::stringify_value(value)))
            .collect();
        self.store
            .merge_hash_fields(&key, &fields, self.ttl_seconds)
            .await?;

        enqueue_persist_session_update_job(self.jobs.as_ref(), session_id, body.clone()).await?;

        Ok(Some(fields.into_iter().map(|(name, _)| name).collect()))
    }

    /// All cached question-result hashes under one session, parsed.
    pub async fn session_results(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Vec<SessionFields>>, CacheError> {
        let id = session_id.to_string();
        for kind in [AssessmentKind::Practice, AssessmentKind::Exam] {
            let pattern =
                keys::children_pattern(keys::session_parent_ns(kind), &id, keys::QRESULT_NS);
            let child_keys = self.store.scan_keys(&pattern).await?;
            if child_keys.is_empty() {
                continue;
            }

            let hashes = self.store.read_hashes(&child_keys).await?;
            let parsed: Vec<SessionFields> = hashes
                .into_iter()
                .filter(|hash| !hash.is_empty())
                .map(|hash| {
                    hash.into_iter()
                        .map(|(name, raw)| (name, codec::parse_value(&raw)))
                        .collect()
                })
                .collect();
            if !parsed.is_empty() {
                return Ok(Some(parsed));
            }
        }
        Ok(None)
    }

    /// Reverse-index lookup: session ids owned by one platform user.
    pub async fn sessions_for_user(&self, user_id: Uuid) -> Result<UserSessions, CacheError> {
        let practice = self
            .store
            .set_members(&keys::index_key(keys::USER_PRACTICE_INDEX_PREFIX, user_id))
            .await?;
        let exam = self
            .store
            .set_members(&keys::index_key(keys::USER_EXAM_INDEX_PREFIX, user_id))
            .await?;
        Ok(UserSessions {
            practice_session_ids: practice,
            exam_session_ids: exam,
        })
    }

    /// Submission producer: best-effort cache write of the answer fields,
    /// then a durable grading job. Only the enqueue outcome decides the
    /// response; cache trouble is logged and ignored.
    pub async fn submit_question_result(
        &self,
        question_result_id: Uuid,
        item: SubmittedAnswers,
    ) -> Result<String, RepoError> {
        self.cache_submission_best_effort(question_result_id, &item)
            .await;
        let job_id =
            enqueue_grade_submission_job(self.jobs.as_ref(), question_result_id, item).await?;
        metrics::counter!("quaderno_submission_enqueued_total").increment(1);
        info!(
            target = "application::sessions::submit_question_result",
            question_result_id = %question_result_id,
            job_id,
            "submission enqueued"
        );
        Ok(job_id)
    }

    async fn cache_submission_best_effort(
        &self,
        question_result_id: Uuid,
        item: &SubmittedAnswers,
    ) {
        let link = match self.results.grading_view(question_result_id).await {
            Ok(Some(view)) => match self.sessions.session_link(view.session_id).await {
                Ok(Some(link)) => Some((view.session_id, link.assessment_kind)),
                _ => None,
            },
            _ => None,
        };
        let Some((session_id, kind)) = link else {
            warn!(
                target = "application::sessions::submit_question_result",
                question_result_id = %question_result_id,
                "session link unavailable, immediate cache write skipped"
            );
            return;
        };

        let mut fields = Map::new();
        if let Some(choice) = &item.submitted_choice {
            fields.insert("submitted_choice".to_string(), serde_json::json!(choice));
        }
        if let Some(choices) = &item.submitted_choices {
            fields.insert("submitted_choices".to_string(), choices.clone());
        }
        if let Some(flagged) = item.is_flagged {
            fields.insert("is_flagged".to_string(), serde_json::json!(flagged));
        }

        let key = keys::qresult_key(kind, session_id, question_result_id);
        if let Err(err) = self.store.write_child_hash(&key, &fields, self.ttl_seconds).await {
            warn!(
                target = "application::sessions::submit_question_result",
                key,
                error = %err,
                "immediate cache write failed, continuing to enqueue"
            );
        }
    }

    /// Re-scores every child question result from persisted answers and
    /// rewrites the session aggregate. The aggregate is always recomputed
    /// from scratch, never incrementally trusted.
    pub async fn recalculate_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<f64>, SessionServiceError> {
        let Some(link) = self.sessions.session_link(session_id).await? else {
            return Ok(None);
        };

        let results = self.results.list_for_session(session_id).await?;
        let mut total = 0.0;
        for record in &results {
            let correct = AnswerSet::parse(record.correct_choices.as_ref());
            let submitted = AnswerSet::parse(record.submitted_choices.as_ref());
            let score = scoring::score(
                record.question_kind,
                record.correct_choice.as_deref(),
                &correct,
                record.submitted_choice.as_deref(),
                &submitted,
                record.point_value,
                record.option_count,
            );
            self.results.set_score(record.id, score).await?;
            total += score;
        }
        let total = scoring::round2(total);
        self.sessions.set_session_score(session_id, total).await?;

        self.events.publish(EventKind::SessionsUpdated {
            kind: link.assessment_kind,
            session_ids: vec![session_id],
        });
        self.events.publish(EventKind::SessionResultsChanged {
            kind: link.assessment_kind,
            session_id,
        });

        info!(
            target = "application::sessions::recalculate_session",
            session_id = %session_id,
            total,
            results = results.len(),
            "session rescored"
        );
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn whitelisted_update_passes_validation() {
        let body = body(&[
            ("status", json!("done")),
            ("score", json!(12.5)),
            ("actual_end_time", json!("2026-08-30T10:00:00Z")),
        ]);
        assert!(validate_updatable_fields(&body).is_ok());
    }

    #[test]
    fn unknown_field_is_rejected_before_any_write() {
        let body = body(&[("status", json!("done")), ("nickname", json!("x"))]);
        match validate_updatable_fields(&body) {
            Err(RepoError::InvalidInput { message }) => {
                assert!(message.contains("nickname"), "message: {message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn every_whitelisted_name_is_accepted() {
        for name in SESSION_UPDATABLE_FIELDS.iter().copied() {
            let body = body(&[(name, json!(null))]);
            assert!(validate_updatable_fields(&body).is_ok(), "field {name}");
        }
    }
}
