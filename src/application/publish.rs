//! Assessment publish fan-out and guarded deletion.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheRefresher, EventKind};
use crate::domain::entities::DistributionPlan;

use super::jobs::{DistributeStudentJobPayload, enqueue_distribute_student_job};
use super::repos::{AssessmentsRepo, DistributionRepo, JobsRepo, PapersRepo, RepoError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("assessment not found")]
    NotFound,
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// What a publish request ended up doing.
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub assessment_id: Uuid,
    pub distributed: bool,
    pub enqueued: usize,
    pub fallback: usize,
}

impl PublishOutcome {
    fn skipped(assessment_id: Uuid) -> Self {
        Self {
            assessment_id,
            distributed: false,
            enqueued: 0,
            fallback: 0,
        }
    }
}

/// A plan with no sections, no questions or no enrolled students must not
/// create any rows.
fn plan_is_empty(plan: &DistributionPlan) -> bool {
    plan.section_count == 0 || plan.questions.is_empty() || plan.student_ids.is_empty()
}

pub struct PublishService {
    assessments: Arc<dyn AssessmentsRepo>,
    papers: Arc<dyn PapersRepo>,
    distribution: Arc<dyn DistributionRepo>,
    jobs: Arc<dyn JobsRepo>,
    refresher: Arc<CacheRefresher>,
}

impl PublishService {
    pub fn new(
        assessments: Arc<dyn AssessmentsRepo>,
        papers: Arc<dyn PapersRepo>,
        distribution: Arc<dyn DistributionRepo>,
        jobs: Arc<dyn JobsRepo>,
        refresher: Arc<CacheRefresher>,
    ) -> Self {
        Self {
            assessments,
            papers,
            distribution,
            jobs,
            refresher,
        }
    }

    /// Flips a draft assessment to published and fans out one distribution
    /// job per enrolled student. A second publish of the same assessment is
    /// a no-op: the status guard fails and no sessions are created.
    pub async fn publish_assessment(
        &self,
        assessment_id: Uuid,
    ) -> Result<PublishOutcome, PublishError> {
        if self.assessments.assessment(assessment_id).await?.is_none() {
            return Err(PublishError::NotFound);
        }

        if !self.assessments.mark_published(assessment_id).await? {
            info!(
                target = "application::publish::publish_assessment",
                assessment_id = %assessment_id,
                "status was not draft, fan-out skipped"
            );
            return Ok(PublishOutcome::skipped(assessment_id));
        }

        let Some(plan) = self.papers.distribution_plan(assessment_id).await? else {
            warn!(
                target = "application::publish::publish_assessment",
                assessment_id = %assessment_id,
                "no distribution plan, nothing to fan out"
            );
            return Ok(PublishOutcome::skipped(assessment_id));
        };
        if plan_is_empty(&plan) {
            warn!(
                target = "application::publish::publish_assessment",
                assessment_id = %assessment_id,
                sections = plan.section_count,
                questions = plan.questions.len(),
                students = plan.student_ids.len(),
                "empty distribution plan, fan-out aborted"
            );
            return Ok(PublishOutcome::skipped(assessment_id));
        }

        let (enqueued, fallback) = self.fan_out(&plan).await?;
        info!(
            target = "application::publish::publish_assessment",
            assessment_id = %assessment_id,
            enqueued,
            fallback,
            "assessment published"
        );
        Ok(PublishOutcome {
            assessment_id,
            distributed: true,
            enqueued,
            fallback,
        })
    }

    /// One job per student; on the first enqueue failure the remaining
    /// students are distributed synchronously in a single transaction so a
    /// broken queue never leaves a partially distributed assessment.
    async fn fan_out(&self, plan: &DistributionPlan) -> Result<(usize, usize), RepoError> {
        let mut enqueued = 0usize;
        for (position, student_id) in plan.student_ids.iter().enumerate() {
            let payload = DistributeStudentJobPayload {
                assessment_id: plan.assessment_id,
                kind: plan.kind,
                student_id: *student_id,
                questions: plan.questions.clone(),
            };
            match enqueue_distribute_student_job(self.jobs.as_ref(), &payload).await {
                Ok(_) => enqueued += 1,
                Err(err) => {
                    error!(
                        target = "application::publish::fan_out",
                        assessment_id = %plan.assessment_id,
                        student_id = %student_id,
                        error = %err,
                        "enqueue failed, switching to synchronous distribution"
                    );
                    let remaining = &plan.student_ids[position..];
                    let session_ids = self
                        .distribution
                        .distribute_students(plan.assessment_id, remaining, &plan.questions)
                        .await?;
                    self.refresher.events().publish(EventKind::SessionsCreated {
                        kind: plan.kind,
                        session_ids: session_ids.clone(),
                    });
                    for session_id in &session_ids {
                        self.refresher
                            .events()
                            .publish(EventKind::SessionResultsChanged {
                                kind: plan.kind,
                                session_id: *session_id,
                            });
                    }
                    return Ok((enqueued, remaining.len()));
                }
            }
        }
        Ok((enqueued, 0))
    }

    /// Deletes an assessment with its cascading sessions and results,
    /// keeping the cache consistent through a capture taken before the rows
    /// disappear. Returns false when the assessment does not exist.
    pub async fn delete_assessment(&self, assessment_id: Uuid) -> Result<bool, RepoError> {
        if let Err(err) = self.refresher.prepare_assessment_delete(assessment_id).await {
            warn!(
                target = "application::publish::delete_assessment",
                assessment_id = %assessment_id,
                error = %err,
                "cascade capture failed, cache cleanup falls to the next full refresh"
            );
        }

        match self.assessments.delete_assessment(assessment_id).await {
            Ok(0) => {
                self.refresher.abort_assessment_delete(assessment_id);
                Ok(false)
            }
            Ok(deleted) => {
                if let Err(err) = self.refresher.complete_assessment_delete(assessment_id).await {
                    warn!(
                        target = "application::publish::delete_assessment",
                        assessment_id = %assessment_id,
                        error = %err,
                        "cascade cleanup failed, stale keys expire by ttl"
                    );
                }
                info!(
                    target = "application::publish::delete_assessment",
                    assessment_id = %assessment_id,
                    deleted,
                    "assessment deleted"
                );
                Ok(true)
            }
            Err(err) => {
                self.refresher.abort_assessment_delete(assessment_id);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::PlannedQuestion;
    use crate::domain::types::{AssessmentKind, QuestionKind};

    fn plan(sections: usize, questions: usize, students: usize) -> DistributionPlan {
        DistributionPlan {
            assessment_id: Uuid::new_v4(),
            kind: AssessmentKind::Exam,
            section_count: sections,
            questions: (0..questions)
                .map(|_| PlannedQuestion {
                    question_id: Uuid::new_v4(),
                    question_kind: QuestionKind::SingleChoice,
                    correct_choice: Some("a".into()),
                    correct_choices: None,
                    option_count: None,
                    point_value: 2.0,
                })
                .collect(),
            student_ids: (0..students).map(|_| Uuid::new_v4()).collect(),
        }
    }

    #[test]
    fn populated_plan_is_distributable() {
        assert!(!plan_is_empty(&plan(2, 10, 30)));
    }

    #[test]
    fn zero_students_aborts_fan_out() {
        assert!(plan_is_empty(&plan(2, 10, 0)));
    }

    #[test]
    fn zero_questions_aborts_fan_out() {
        assert!(plan_is_empty(&plan(2, 0, 30)));
    }

    #[test]
    fn zero_sections_aborts_fan_out() {
        assert!(plan_is_empty(&plan(0, 10, 30)));
    }
}
