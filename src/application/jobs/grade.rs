//! Durable grading of answer submissions.
//!
//! The producer writes a best-effort cache update and enqueues; the worker
//! persists the answers, runs the scoring engine on the persisted record,
//! persists the score, and propagates it into the nested cache.

use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::repos::{JobsRepo, QuestionResultsRepo, RepoError};
use crate::cache::keys;
use crate::domain::entities::SubmittedAnswers;
use crate::domain::scoring::{self, AnswerSet};
use crate::domain::types::JobType;

use super::{context::JobWorkerContext, job_failed, queue::enqueue_job};

const GRADE_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeSubmissionJobPayload {
    pub question_result_id: Uuid,
    pub item: SubmittedAnswers,
}

/// Enqueue a grading job for one submission event.
pub async fn enqueue_grade_submission_job<J: JobsRepo + ?Sized>(
    repo: &J,
    question_result_id: Uuid,
    item: SubmittedAnswers,
) -> Result<String, RepoError> {
    let payload = GradeSubmissionJobPayload {
        question_result_id,
        item,
    };
    enqueue_job(
        repo,
        JobType::GradeSubmission,
        &payload,
        None,
        GRADE_MAX_ATTEMPTS,
        0,
    )
    .await
}

/// Process one grading job.
///
/// Persistence failures propagate and trigger the queue's retry; a record
/// that vanished between the write and the re-read is a warning, since the
/// submission itself already landed.
pub async fn process_grade_submission_job(
    payload: GradeSubmissionJobPayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;
    let id = payload.question_result_id;

    let graded = grade_persisted_submission(ctx.results.as_ref(), id, &payload.item)
        .await
        .map_err(job_failed)?;
    let Some((session_id, score)) = graded else {
        warn!(
            target = "application::jobs::process_grade_submission_job",
            question_result_id = %id,
            "question result vanished before grading, job completes"
        );
        return Ok(());
    };

    metrics::counter!("quaderno_grading_completed_total").increment(1);

    propagate_score_to_cache(ctx, &payload, session_id, score).await;

    info!(
        target = "application::jobs::process_grade_submission_job",
        question_result_id = %id,
        score,
        "submission graded"
    );
    Ok(())
}

/// Persist the answers, re-read the record, score it, persist the score.
///
/// A zero-row submission write is an error so the queue retries it; a
/// record missing on the re-read returns `None` and the job completes.
async fn grade_persisted_submission(
    results: &dyn QuestionResultsRepo,
    id: Uuid,
    item: &SubmittedAnswers,
) -> Result<Option<(Uuid, f64)>, RepoError> {
    let affected = results.apply_submission(id, item).await?;
    if affected == 0 {
        return Err(RepoError::from_persistence(format!(
            "submission write for question result `{id}` affected no rows"
        )));
    }

    let Some(view) = results.grading_view(id).await? else {
        return Ok(None);
    };

    let correct = AnswerSet::parse(view.correct_choices.as_ref());
    let submitted = AnswerSet::parse(view.submitted_choices.as_ref());
    let score = scoring::score(
        view.question_kind,
        view.correct_choice.as_deref(),
        &correct,
        view.submitted_choice.as_deref(),
        &submitted,
        view.point_value,
        view.option_count,
    );

    results.set_score(id, score).await?;
    Ok(Some((view.session_id, score)))
}

/// Best-effort cache propagation; failure never fails the job.
async fn propagate_score_to_cache(
    ctx: &JobWorkerContext,
    payload: &GradeSubmissionJobPayload,
    session_id: Uuid,
    score: f64,
) {
    let id = payload.question_result_id;

    let kind = match ctx.sessions.session_link(session_id).await {
        Ok(Some(link)) => Some(link.assessment_kind),
        _ => None,
    };

    let Some(kind) = kind else {
        warn!(
            target = "application::jobs::process_grade_submission_job",
            question_result_id = %id,
            "session link unavailable, score not propagated to cache"
        );
        return;
    };

    let key = keys::qresult_key(kind, session_id, id);
    let mut fields = Map::new();
    fields.insert("score".to_string(), serde_json::json!(score));
    if let Some(choice) = &payload.item.submitted_choice {
        fields.insert("submitted_choice".to_string(), serde_json::json!(choice));
    }
    if let Some(choices) = &payload.item.submitted_choices {
        fields.insert("submitted_choices".to_string(), choices.clone());
    }

    if let Err(err) = ctx
        .store
        .write_child_hash(&key, &fields, ctx.cache_ttl_seconds)
        .await
    {
        warn!(
            target = "application::jobs::process_grade_submission_job",
            key,
            error = %err,
            "score cache propagation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::entities::{GradingView, QuestionResultRecord, SessionWithResults};
    use crate::domain::types::{AssessmentKind, QuestionKind};

    struct FakeResultsRepo {
        apply_affects: u64,
        view: Option<GradingView>,
        submissions: Mutex<Vec<(Uuid, SubmittedAnswers)>>,
        scores: Mutex<Vec<(Uuid, f64)>>,
    }

    impl FakeResultsRepo {
        fn new(apply_affects: u64, view: Option<GradingView>) -> Self {
            Self {
                apply_affects,
                view,
                submissions: Mutex::new(Vec::new()),
                scores: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QuestionResultsRepo for FakeResultsRepo {
        async fn apply_submission(
            &self,
            id: Uuid,
            answers: &SubmittedAnswers,
        ) -> Result<u64, RepoError> {
            self.submissions.lock().unwrap().push((id, answers.clone()));
            Ok(self.apply_affects)
        }

        async fn grading_view(&self, _id: Uuid) -> Result<Option<GradingView>, RepoError> {
            Ok(self.view.clone())
        }

        async fn set_score(&self, id: Uuid, score: f64) -> Result<u64, RepoError> {
            self.scores.lock().unwrap().push((id, score));
            Ok(1)
        }

        async fn list_for_session(
            &self,
            _session_id: Uuid,
        ) -> Result<Vec<QuestionResultRecord>, RepoError> {
            unreachable!("not used in these tests")
        }

        async fn sessions_with_results(
            &self,
            _kind: AssessmentKind,
        ) -> Result<Vec<SessionWithResults>, RepoError> {
            unreachable!("not used in these tests")
        }
    }

    fn single_choice_view(id: Uuid, session_id: Uuid, submitted: &str) -> GradingView {
        GradingView {
            id,
            session_id,
            question_kind: QuestionKind::SingleChoice,
            correct_choice: Some("b".into()),
            correct_choices: None,
            submitted_choice: Some(submitted.into()),
            submitted_choices: None,
            point_value: 4.0,
            option_count: None,
        }
    }

    fn submission(choice: &str) -> SubmittedAnswers {
        SubmittedAnswers {
            submitted_choice: Some(choice.into()),
            submitted_choices: None,
            is_flagged: None,
        }
    }

    #[tokio::test]
    async fn correct_submission_persists_the_full_point_score() {
        let id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let repo = FakeResultsRepo::new(1, Some(single_choice_view(id, session_id, "b")));

        let graded = grade_persisted_submission(&repo, id, &submission("b"))
            .await
            .expect("grading succeeds");

        assert_eq!(graded, Some((session_id, 4.0)));
        assert_eq!(repo.submissions.lock().unwrap().len(), 1);
        assert_eq!(repo.scores.lock().unwrap().as_slice(), &[(id, 4.0)]);
    }

    #[tokio::test]
    async fn wrong_submission_persists_a_zero_score() {
        let id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let repo = FakeResultsRepo::new(1, Some(single_choice_view(id, session_id, "c")));

        let graded = grade_persisted_submission(&repo, id, &submission("c"))
            .await
            .expect("grading succeeds");

        assert_eq!(graded, Some((session_id, 0.0)));
        assert_eq!(repo.scores.lock().unwrap().as_slice(), &[(id, 0.0)]);
    }

    #[tokio::test]
    async fn vanished_record_completes_without_a_score_write() {
        let id = Uuid::new_v4();
        let repo = FakeResultsRepo::new(1, None);

        let graded = grade_persisted_submission(&repo, id, &submission("b"))
            .await
            .expect("a vanished record is not an error");

        assert_eq!(graded, None);
        assert!(repo.scores.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_rows_affected_errors_so_the_queue_retries() {
        let id = Uuid::new_v4();
        let repo = FakeResultsRepo::new(0, None);

        let result = grade_persisted_submission(&repo, id, &submission("b")).await;

        match result {
            Err(RepoError::Persistence(message)) => {
                assert!(message.contains("affected no rows"), "message: {message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(repo.scores.lock().unwrap().is_empty());
    }
}
