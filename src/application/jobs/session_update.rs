//! Durable persistence of session field updates.
//!
//! The PATCH endpoint merges into the cache hash immediately and enqueues
//! this job so the data source catches up even across transient outages.
//! When an update moves a session to done, the aggregate score is recomputed
//! from the child question results rather than trusted incrementally.

use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::repos::{JobsRepo, QuestionResultsRepo, RepoError, SessionsRepo};
use crate::cache::{EventKind, EventQueue};
use crate::domain::scoring;
use crate::domain::types::{JobType, SessionStatus};

use super::{context::JobWorkerContext, job_failed, queue::enqueue_job};

const PERSIST_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistSessionUpdateJobPayload {
    pub session_id: Uuid,
    pub fields: Map<String, Value>,
}

pub async fn enqueue_persist_session_update_job<J: JobsRepo + ?Sized>(
    repo: &J,
    session_id: Uuid,
    fields: Map<String, Value>,
) -> Result<String, RepoError> {
    let payload = PersistSessionUpdateJobPayload { session_id, fields };
    enqueue_job(
        repo,
        JobType::PersistSessionUpdate,
        &payload,
        None,
        PERSIST_MAX_ATTEMPTS,
        0,
    )
    .await
}

pub async fn process_persist_session_update_job(
    payload: PersistSessionUpdateJobPayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;

    let affected = ctx
        .sessions
        .update_session_fields(payload.session_id, &payload.fields)
        .await
        .map_err(job_failed)?;

    if affected == 0 {
        // The session may have been deleted after the cache merge; the
        // cascade cleanup owns its cache entries now.
        warn!(
            target = "application::jobs::process_persist_session_update_job",
            session_id = %payload.session_id,
            "session row gone, update dropped"
        );
        return Ok(());
    }

    if sets_status_to_done(&payload.fields) {
        finalize_done_session(
            ctx.sessions.as_ref(),
            ctx.results.as_ref(),
            ctx.refresher.events(),
            payload.session_id,
        )
        .await
        .map_err(job_failed)?;
    }

    info!(
        target = "application::jobs::process_persist_session_update_job",
        session_id = %payload.session_id,
        fields = payload.fields.len(),
        "session update persisted"
    );
    Ok(())
}

fn sets_status_to_done(fields: &Map<String, Value>) -> bool {
    fields
        .get("status")
        .and_then(|value| serde_json::from_value::<SessionStatus>(value.clone()).ok())
        .is_some_and(|status| matches!(status, SessionStatus::Done))
}

/// Recomputes the session aggregate as the sum of its children's persisted
/// scores, never by trusting a running total. Ungraded children count as
/// zero; a later grading job republishes the aggregate through the cache
/// events.
async fn finalize_done_session(
    sessions: &dyn SessionsRepo,
    results: &dyn QuestionResultsRepo,
    events: &EventQueue,
    session_id: Uuid,
) -> Result<Option<f64>, RepoError> {
    let Some(link) = sessions.session_link(session_id).await? else {
        warn!(
            target = "application::jobs::finalize_done_session",
            session_id = %session_id,
            "session link gone before aggregate recompute"
        );
        return Ok(None);
    };

    let children = results.list_for_session(session_id).await?;
    let total = scoring::round2(
        children
            .iter()
            .map(|record| record.score.unwrap_or(0.0))
            .sum(),
    );
    sessions.set_session_score(session_id, total).await?;

    events.publish(EventKind::SessionsUpdated {
        kind: link.assessment_kind,
        session_ids: vec![session_id],
    });

    info!(
        target = "application::jobs::finalize_done_session",
        session_id = %session_id,
        total,
        children = children.len(),
        "aggregate recomputed on done transition"
    );
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::domain::entities::{
        GradingView, QuestionResultRecord, SessionInfo, SessionLink, SessionUserLink,
        SessionWithResults, SubmittedAnswers,
    };
    use crate::domain::types::{AssessmentKind, QuestionKind};

    #[derive(Default)]
    struct RecordingSessionsRepo {
        link: Option<SessionLink>,
        scores: Mutex<Vec<(Uuid, f64)>>,
    }

    #[async_trait]
    impl SessionsRepo for RecordingSessionsRepo {
        async fn list_session_infos(
            &self,
            _kind: AssessmentKind,
        ) -> Result<Vec<SessionInfo>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn session_infos_by_ids(
            &self,
            _kind: AssessmentKind,
            _ids: &[Uuid],
        ) -> Result<Vec<SessionInfo>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn session_link(&self, _session_id: Uuid) -> Result<Option<SessionLink>, RepoError> {
            Ok(self.link)
        }

        async fn session_user_link(
            &self,
            _session_id: Uuid,
        ) -> Result<Option<SessionUserLink>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn session_user_links(
            &self,
            _kind: AssessmentKind,
        ) -> Result<Vec<SessionUserLink>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn session_user_links_for_assessment(
            &self,
            _assessment_id: Uuid,
        ) -> Result<Vec<SessionUserLink>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn update_session_fields(
            &self,
            _id: Uuid,
            _fields: &Map<String, Value>,
        ) -> Result<u64, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn set_session_score(&self, id: Uuid, score: f64) -> Result<u64, RepoError> {
            self.scores.lock().unwrap().push((id, score));
            Ok(1)
        }
    }

    struct StaticResultsRepo {
        children: Vec<QuestionResultRecord>,
    }

    #[async_trait]
    impl QuestionResultsRepo for StaticResultsRepo {
        async fn apply_submission(
            &self,
            _id: Uuid,
            _answers: &SubmittedAnswers,
        ) -> Result<u64, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn grading_view(&self, _id: Uuid) -> Result<Option<GradingView>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn set_score(&self, _id: Uuid, _score: f64) -> Result<u64, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn list_for_session(
            &self,
            _session_id: Uuid,
        ) -> Result<Vec<QuestionResultRecord>, RepoError> {
            Ok(self.children.clone())
        }

        async fn sessions_with_results(
            &self,
            _kind: AssessmentKind,
        ) -> Result<Vec<SessionWithResults>, RepoError> {
            unreachable!("not used in these tests")
        }
    }

    fn child(session_id: Uuid, score: Option<f64>) -> QuestionResultRecord {
        QuestionResultRecord {
            id: Uuid::new_v4(),
            session_id,
            question_id: Uuid::new_v4(),
            question_kind: QuestionKind::SingleChoice,
            correct_choice: Some("a".into()),
            correct_choices: None,
            submitted_choice: Some("a".into()),
            submitted_choices: None,
            point_value: 5.0,
            option_count: None,
            score,
            is_flagged: false,
        }
    }

    #[test]
    fn only_a_done_status_triggers_the_recompute() {
        let done: Map<String, Value> = [("status".to_string(), json!("done"))].into_iter().collect();
        let submitted: Map<String, Value> = [("status".to_string(), json!("submitted"))]
            .into_iter()
            .collect();
        let no_status: Map<String, Value> = [("score".to_string(), json!(3.0))].into_iter().collect();

        assert!(sets_status_to_done(&done));
        assert!(!sets_status_to_done(&submitted));
        assert!(!sets_status_to_done(&no_status));
    }

    #[tokio::test]
    async fn done_transition_sums_child_scores_into_the_session() {
        let session_id = Uuid::new_v4();
        let sessions = RecordingSessionsRepo {
            link: Some(SessionLink {
                session_id,
                assessment_kind: AssessmentKind::Exam,
            }),
            scores: Mutex::new(Vec::new()),
        };
        let results = StaticResultsRepo {
            children: vec![
                child(session_id, Some(2.5)),
                child(session_id, Some(4.25)),
                child(session_id, None),
            ],
        };
        let events = EventQueue::new();

        let total = finalize_done_session(&sessions, &results, &events, session_id)
            .await
            .expect("recompute succeeds");

        assert_eq!(total, Some(6.75));
        assert_eq!(
            sessions.scores.lock().unwrap().as_slice(),
            &[(session_id, 6.75)]
        );
        let drained = events.drain(8);
        assert_eq!(drained.len(), 1);
        assert_eq!(
            drained[0].kind,
            EventKind::SessionsUpdated {
                kind: AssessmentKind::Exam,
                session_ids: vec![session_id],
            }
        );
    }

    #[tokio::test]
    async fn vanished_session_skips_the_recompute() {
        let sessions = RecordingSessionsRepo::default();
        let results = StaticResultsRepo { children: vec![] };
        let events = EventQueue::new();

        let total = finalize_done_session(&sessions, &results, &events, Uuid::new_v4())
            .await
            .expect("missing link is not an error");

        assert_eq!(total, None);
        assert!(sessions.scores.lock().unwrap().is_empty());
        assert!(events.is_empty());
    }
}
