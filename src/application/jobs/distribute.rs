//! Per-student distribution of a published paper.
//!
//! One job per student keeps students independent; a failing student
//! retries alone instead of blocking the whole roster.

use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::application::repos::{JobsRepo, RepoError};
use crate::cache::EventKind;
use crate::domain::entities::PlannedQuestion;
use crate::domain::types::{AssessmentKind, JobType};

use super::{context::JobWorkerContext, job_failed, queue::enqueue_job};

const DISTRIBUTE_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeStudentJobPayload {
    pub assessment_id: Uuid,
    pub kind: AssessmentKind,
    pub student_id: Uuid,
    pub questions: Vec<PlannedQuestion>,
}

pub async fn enqueue_distribute_student_job<J: JobsRepo + ?Sized>(
    repo: &J,
    payload: &DistributeStudentJobPayload,
) -> Result<String, RepoError> {
    enqueue_job(
        repo,
        JobType::DistributeStudent,
        payload,
        None,
        DISTRIBUTE_MAX_ATTEMPTS,
        0,
    )
    .await
}

/// Create one student's session and question-result rows, then let the
/// incremental cache path pick the new session up.
pub async fn process_distribute_student_job(
    payload: DistributeStudentJobPayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;

    let session_id = ctx
        .distribution
        .distribute_student(payload.assessment_id, payload.student_id, &payload.questions)
        .await
        .map_err(job_failed)?;

    ctx.refresher.events().publish(EventKind::SessionsCreated {
        kind: payload.kind,
        session_ids: vec![session_id],
    });
    ctx.refresher
        .events()
        .publish(EventKind::SessionResultsChanged {
            kind: payload.kind,
            session_id,
        });

    info!(
        target = "application::jobs::process_distribute_student_job",
        assessment_id = %payload.assessment_id,
        student_id = %payload.student_id,
        session_id = %session_id,
        questions = payload.questions.len(),
        "student distributed"
    );
    Ok(())
}
