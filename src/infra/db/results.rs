use async_trait::async_trait;
use uuid::Uuid;

use crate::application::repos::{QuestionResultsRepo, RepoError};
use crate::domain::entities::{
    GradingView, QuestionResultRecord, SessionWithResults, SubmittedAnswers,
};
use crate::domain::types::AssessmentKind;

use super::{PostgresRepositories, map_sqlx_error};

const QUESTION_RESULT_COLUMNS: &str = r#"
    qr.id,
    qr.session_id,
    qr.question_id,
    qr.question_kind,
    qr.correct_choice,
    qr.correct_choices,
    qr.submitted_choice,
    qr.submitted_choices,
    qr.point_value,
    qr.option_count,
    qr.score,
    qr.is_flagged
"#;

#[async_trait]
impl QuestionResultsRepo for PostgresRepositories {
    async fn apply_submission(
        &self,
        id: Uuid,
        answers: &SubmittedAnswers,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE question_results
               SET submitted_choice = COALESCE($2, submitted_choice),
                   submitted_choices = COALESCE($3, submitted_choices),
                   is_flagged = COALESCE($4, is_flagged)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(answers.submitted_choice.as_deref())
        .bind(answers.submitted_choices.as_ref())
        .bind(answers.is_flagged)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn grading_view(&self, id: Uuid) -> Result<Option<GradingView>, RepoError> {
        sqlx::query_as(
            r#"
            SELECT id,
                   session_id,
                   question_kind,
                   correct_choice,
                   correct_choices,
                   submitted_choice,
                   submitted_choices,
                   point_value,
                   option_count
              FROM question_results
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn set_score(&self, id: Uuid, score: f64) -> Result<u64, RepoError> {
        let result = sqlx::query("UPDATE question_results SET score = $2 WHERE id = $1")
            .bind(id)
            .bind(score)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn list_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<QuestionResultRecord>, RepoError> {
        let sql = format!(
            "SELECT {QUESTION_RESULT_COLUMNS} FROM question_results qr \
             WHERE qr.session_id = $1 ORDER BY qr.id"
        );
        sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn sessions_with_results(
        &self,
        kind: AssessmentKind,
    ) -> Result<Vec<SessionWithResults>, RepoError> {
        let sql = format!(
            "SELECT {QUESTION_RESULT_COLUMNS} \
               FROM question_results qr \
               JOIN sessions s ON s.id = qr.session_id \
               JOIN assessments a ON a.id = s.assessment_id \
              WHERE a.kind = $1 \
              ORDER BY qr.session_id, qr.id"
        );
        let rows: Vec<QuestionResultRecord> = sqlx::query_as(&sql)
            .bind(kind)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        // Rows arrive ordered by session, so grouping is a single pass.
        let mut sessions: Vec<SessionWithResults> = Vec::new();
        for row in rows {
            match sessions.last_mut() {
                Some(current) if current.id == row.session_id => {
                    current.question_results.push(row);
                }
                _ => sessions.push(SessionWithResults {
                    id: row.session_id,
                    question_results: vec![row],
                }),
            }
        }
        Ok(sessions)
    }
}
