//! Persisted records mapped from the Postgres source of truth.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::types::{AssessmentKind, AssessmentStatus, QuestionKind, SessionStatus};

/// One student's answer to one question instance, child of a session.
///
/// `score` stays null until grading has run once; afterwards it is bounded by
/// `0 ≤ score ≤ point_value`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuestionResultRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question_id: Uuid,
    pub question_kind: QuestionKind,
    pub correct_choice: Option<String>,
    pub correct_choices: Option<Value>,
    pub submitted_choice: Option<String>,
    pub submitted_choices: Option<Value>,
    pub point_value: f64,
    pub option_count: Option<i32>,
    pub score: Option<f64>,
    pub is_flagged: bool,
}

/// The subset of a question result the grading worker needs: correct and
/// submitted answers as persisted, plus the point value.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GradingView {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question_kind: QuestionKind,
    pub correct_choice: Option<String>,
    pub correct_choices: Option<Value>,
    pub submitted_choice: Option<String>,
    pub submitted_choices: Option<Value>,
    pub point_value: f64,
    pub option_count: Option<i32>,
}

/// Answer fields carried by a submission; everything else on the row is
/// owned by distribution or by the grading worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmittedAnswers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_choices: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_flagged: Option<bool>,
}

impl SubmittedAnswers {
    pub fn is_empty(&self) -> bool {
        self.submitted_choice.is_none()
            && self.submitted_choices.is_none()
            && self.is_flagged.is_none()
    }
}

/// Session columns a field-map update may touch. Everything else on the
/// row is owned by distribution or grading and never patched directly.
pub const SESSION_UPDATABLE_FIELDS: &[&str] = &[
    "status",
    "score",
    "extra_time",
    "actual_start_time",
    "actual_end_time",
    "expected_end_time",
];

/// Minimal linkage row used to key a question result into the nested cache.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct SessionLink {
    pub session_id: Uuid,
    pub assessment_kind: AssessmentKind,
}

/// Session id plus its owning platform user, for the reverse indexes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionUserLink {
    pub session_id: Uuid,
    pub user_id: Option<Uuid>,
}

/// Student identity projected into session-info caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentInfo {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub full_name: String,
    pub email: Option<String>,
}

/// Joined session view cached as a flat hash; the nested `student` object
/// flattens to `student__*` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub assessment_id: Uuid,
    pub assessment_title: String,
    pub status: SessionStatus,
    pub score: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub actual_start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub actual_end_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expected_end_time: Option<OffsetDateTime>,
    pub extra_time: Option<i32>,
    pub student: StudentInfo,
}

/// Flat query row assembled into [`SessionInfo`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionInfoRow {
    pub id: Uuid,
    pub assessment_id: Uuid,
    pub assessment_title: String,
    pub status: SessionStatus,
    pub score: Option<f64>,
    pub actual_start_time: Option<OffsetDateTime>,
    pub actual_end_time: Option<OffsetDateTime>,
    pub expected_end_time: Option<OffsetDateTime>,
    pub extra_time: Option<i32>,
    pub student_id: Uuid,
    pub student_user_id: Option<Uuid>,
    pub student_full_name: String,
    pub student_email: Option<String>,
}

impl From<SessionInfoRow> for SessionInfo {
    fn from(row: SessionInfoRow) -> Self {
        Self {
            id: row.id,
            assessment_id: row.assessment_id,
            assessment_title: row.assessment_title,
            status: row.status,
            score: row.score,
            actual_start_time: row.actual_start_time,
            actual_end_time: row.actual_end_time,
            expected_end_time: row.expected_end_time,
            extra_time: row.extra_time,
            student: StudentInfo {
                id: row.student_id,
                user_id: row.student_user_id,
                full_name: row.student_full_name,
                email: row.student_email,
            },
        }
    }
}

/// A session and its question results, shaped for the nested child-hash
/// cache (parent id field `id`, child list field `question_results`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionWithResults {
    pub id: Uuid,
    pub question_results: Vec<QuestionResultRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssessmentRecord {
    pub id: Uuid,
    pub kind: AssessmentKind,
    pub paper_id: Uuid,
    pub title: String,
    pub status: AssessmentStatus,
}

/// A paper's opaque content document, cached whole as a JSON blob.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaperBlob {
    pub id: Uuid,
    pub content: Value,
}

/// One question of a distribution plan, already tagged with its section's
/// per-question point value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedQuestion {
    pub question_id: Uuid,
    pub question_kind: QuestionKind,
    pub correct_choice: Option<String>,
    pub correct_choices: Option<Value>,
    pub option_count: Option<i32>,
    pub point_value: f64,
}

/// Everything the fan-out needs for one assessment, loaded in one pass.
#[derive(Debug, Clone)]
pub struct DistributionPlan {
    pub assessment_id: Uuid,
    pub kind: AssessmentKind,
    pub section_count: usize,
    pub questions: Vec<PlannedQuestion>,
    pub student_ids: Vec<Uuid>,
}

/// Insert shape for question results created during distribution.
#[derive(Debug, Clone)]
pub struct NewQuestionResult {
    pub session_id: Uuid,
    pub question_id: Uuid,
    pub question_kind: QuestionKind,
    pub correct_choice: Option<String>,
    pub correct_choices: Option<Value>,
    pub option_count: Option<i32>,
    pub point_value: f64,
}

impl NewQuestionResult {
    pub fn from_plan(session_id: Uuid, question: &PlannedQuestion) -> Self {
        Self {
            session_id,
            question_id: question.question_id,
            question_kind: question.question_kind,
            correct_choice: question.correct_choice.clone(),
            correct_choices: question.correct_choices.clone(),
            option_count: question.option_count,
            point_value: question.point_value,
        }
    }
}
