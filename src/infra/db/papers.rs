use async_trait::async_trait;
use uuid::Uuid;

use crate::application::repos::{PapersRepo, RepoError};
use crate::domain::entities::{DistributionPlan, PaperBlob, PlannedQuestion};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct PlannedQuestionRow {
    question_id: Uuid,
    question_kind: crate::domain::types::QuestionKind,
    correct_choice: Option<String>,
    correct_choices: Option<serde_json::Value>,
    option_count: Option<i32>,
    point_value: f64,
}

impl From<PlannedQuestionRow> for PlannedQuestion {
    fn from(row: PlannedQuestionRow) -> Self {
        Self {
            question_id: row.question_id,
            question_kind: row.question_kind,
            correct_choice: row.correct_choice,
            correct_choices: row.correct_choices,
            option_count: row.option_count,
            point_value: row.point_value,
        }
    }
}

#[async_trait]
impl PapersRepo for PostgresRepositories {
    async fn list_paper_blobs(&self) -> Result<Vec<PaperBlob>, RepoError> {
        sqlx::query_as("SELECT id, content FROM papers")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn paper_blobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<PaperBlob>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as("SELECT id, content FROM papers WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn distribution_plan(
        &self,
        assessment_id: Uuid,
    ) -> Result<Option<DistributionPlan>, RepoError> {
        let assessment: Option<(Uuid, crate::domain::types::AssessmentKind)> = sqlx::query_as(
            "SELECT paper_id, kind FROM assessments WHERE id = $1",
        )
        .bind(assessment_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        let Some((paper_id, kind)) = assessment else {
            return Ok(None);
        };

        let section_count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM paper_sections WHERE paper_id = $1")
                .bind(paper_id)
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        let questions: Vec<PlannedQuestionRow> = sqlx::query_as(
            r#"
            SELECT q.id AS question_id,
                   q.kind AS question_kind,
                   q.correct_choice,
                   q.correct_choices,
                   q.option_count,
                   sec.point_value
              FROM paper_questions q
              JOIN paper_sections sec ON sec.id = q.section_id
             WHERE sec.paper_id = $1
             ORDER BY sec.position, q.position
            "#,
        )
        .bind(paper_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let student_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT student_id FROM enrollments WHERE assessment_id = $1 ORDER BY student_id",
        )
        .bind(assessment_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(Some(DistributionPlan {
            assessment_id,
            kind,
            section_count: section_count.max(0) as usize,
            questions: questions.into_iter().map(PlannedQuestion::from).collect(),
            student_ids,
        }))
    }
}
