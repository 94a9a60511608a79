//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{
    AssessmentRecord, DistributionPlan, GradingView, PaperBlob, PlannedQuestion,
    QuestionResultRecord, SessionInfo, SessionLink, SessionUserLink,
    SessionWithResults, SubmittedAnswers,
};
use crate::domain::types::{AssessmentKind, JobType};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Session reads and writes, including the joined info view the flat
/// hash caches are built from.
#[async_trait]
pub trait SessionsRepo: Send + Sync {
    async fn list_session_infos(&self, kind: AssessmentKind) -> Result<Vec<SessionInfo>, RepoError>;

    async fn session_infos_by_ids(
        &self,
        kind: AssessmentKind,
        ids: &[Uuid],
    ) -> Result<Vec<SessionInfo>, RepoError>;

    /// Which assessment kind a session belongs to.
    async fn session_link(&self, session_id: Uuid) -> Result<Option<SessionLink>, RepoError>;

    /// Owning platform user of one session.
    async fn session_user_link(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionUserLink>, RepoError>;

    /// All session-to-user links of one kind, for reverse-index rebuilds.
    async fn session_user_links(
        &self,
        kind: AssessmentKind,
    ) -> Result<Vec<SessionUserLink>, RepoError>;

    /// Session-to-user links under one assessment, for pre-delete capture.
    async fn session_user_links_for_assessment(
        &self,
        assessment_id: Uuid,
    ) -> Result<Vec<SessionUserLink>, RepoError>;

    /// Applies a field map to a session row; returns affected row count.
    async fn update_session_fields(
        &self,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<u64, RepoError>;

    async fn set_session_score(&self, id: Uuid, score: f64) -> Result<u64, RepoError>;
}

#[async_trait]
pub trait QuestionResultsRepo: Send + Sync {
    /// Persists submitted answer fields; returns affected row count.
    async fn apply_submission(
        &self,
        id: Uuid,
        answers: &SubmittedAnswers,
    ) -> Result<u64, RepoError>;

    async fn grading_view(&self, id: Uuid) -> Result<Option<GradingView>, RepoError>;

    async fn set_score(&self, id: Uuid, score: f64) -> Result<u64, RepoError>;

    async fn list_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<QuestionResultRecord>, RepoError>;

    /// Every session of one kind with its question results, for the nested
    /// cache rebuild.
    async fn sessions_with_results(
        &self,
        kind: AssessmentKind,
    ) -> Result<Vec<SessionWithResults>, RepoError>;
}

/// Paper content blobs and the relational plan used for distribution.
#[async_trait]
pub trait PapersRepo: Send + Sync {
    async fn list_paper_blobs(&self) -> Result<Vec<PaperBlob>, RepoError>;

    async fn paper_blobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<PaperBlob>, RepoError>;

    /// Sections flattened to questions plus the enrolled roster.
    async fn distribution_plan(
        &self,
        assessment_id: Uuid,
    ) -> Result<Option<DistributionPlan>, RepoError>;
}

#[async_trait]
pub trait StudentsRepo: Send + Sync {
    async fn list_student_emails(&self) -> Result<Vec<String>, RepoError>;
}

#[async_trait]
pub trait AssessmentsRepo: Send + Sync {
    async fn assessment(&self, id: Uuid) -> Result<Option<AssessmentRecord>, RepoError>;

    /// Publishes only when the persisted status is still draft; returns
    /// whether the guard passed.
    async fn mark_published(&self, id: Uuid) -> Result<bool, RepoError>;

    /// Deletes the assessment; sessions and question results go with it via
    /// the schema's cascades.
    async fn delete_assessment(&self, id: Uuid) -> Result<u64, RepoError>;
}

/// Per-student distribution writes.
#[async_trait]
pub trait DistributionRepo: Send + Sync {
    /// Creates one student's session and its question-result rows in a
    /// single transaction; returns the new session id.
    async fn distribute_student(
        &self,
        assessment_id: Uuid,
        student_id: Uuid,
        questions: &[PlannedQuestion],
    ) -> Result<Uuid, RepoError>;

    /// Synchronous fallback: distributes every listed student inside one
    /// transaction covering them all.
    async fn distribute_students(
        &self,
        assessment_id: Uuid,
        student_ids: &[Uuid],
        questions: &[PlannedQuestion],
    ) -> Result<Vec<Uuid>, RepoError>;
}

#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_type: JobType,
    pub payload: Value,
    pub run_at: OffsetDateTime,
    pub max_attempts: i32,
    pub priority: i32,
}

#[async_trait]
pub trait JobsRepo: Send + Sync {
    /// Enqueues a durable job, returning the broker-assigned id.
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError>;
}
