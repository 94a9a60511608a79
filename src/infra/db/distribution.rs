use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::application::repos::{DistributionRepo, RepoError};
use crate::domain::entities::{NewQuestionResult, PlannedQuestion};
use crate::domain::types::SessionStatus;

use super::{PostgresRepositories, map_sqlx_error};

async fn insert_session_with_results(
    tx: &mut Transaction<'static, Postgres>,
    assessment_id: Uuid,
    student_id: Uuid,
    questions: &[PlannedQuestion],
) -> Result<Uuid, sqlx::Error> {
    let session_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO sessions (assessment_id, student_id, status)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(assessment_id)
    .bind(student_id)
    .bind(SessionStatus::Draft)
    .fetch_one(&mut **tx)
    .await?;

    if questions.is_empty() {
        return Ok(session_id);
    }

    let rows: Vec<NewQuestionResult> = questions
        .iter()
        .map(|question| NewQuestionResult::from_plan(session_id, question))
        .collect();

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO question_results \
         (session_id, question_id, question_kind, correct_choice, correct_choices, \
          option_count, point_value) ",
    );
    qb.push_values(rows, |mut row, result| {
        row.push_bind(result.session_id)
            .push_bind(result.question_id)
            .push_bind(result.question_kind)
            .push_bind(result.correct_choice)
            .push_bind(result.correct_choices)
            .push_bind(result.option_count)
            .push_bind(result.point_value);
    });
    qb.build().execute(&mut **tx).await?;

    Ok(session_id)
}

#[async_trait]
impl DistributionRepo for PostgresRepositories {
    async fn distribute_student(
        &self,
        assessment_id: Uuid,
        student_id: Uuid,
        questions: &[PlannedQuestion],
    ) -> Result<Uuid, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let session_id =
            insert_session_with_results(&mut tx, assessment_id, student_id, questions)
                .await
                .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(session_id)
    }

    async fn distribute_students(
        &self,
        assessment_id: Uuid,
        student_ids: &[Uuid],
        questions: &[PlannedQuestion],
    ) -> Result<Vec<Uuid>, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut session_ids = Vec::with_capacity(student_ids.len());
        for student_id in student_ids {
            let session_id =
                insert_session_with_results(&mut tx, assessment_id, *student_id, questions)
                    .await
                    .map_err(map_sqlx_error)?;
            session_ids.push(session_id);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(session_ids)
    }
}
