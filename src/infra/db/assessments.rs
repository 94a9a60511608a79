use async_trait::async_trait;
use uuid::Uuid;

use crate::application::repos::{AssessmentsRepo, RepoError};
use crate::domain::entities::AssessmentRecord;
use crate::domain::types::AssessmentStatus;

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl AssessmentsRepo for PostgresRepositories {
    async fn assessment(&self, id: Uuid) -> Result<Option<AssessmentRecord>, RepoError> {
        sqlx::query_as(
            r#"
            SELECT id,
                   kind,
                   paper_id,
                   title,
                   status
              FROM assessments
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn mark_published(&self, id: Uuid) -> Result<bool, RepoError> {
        // The status predicate is the republish guard; a row already
        // published updates nothing.
        let result = sqlx::query("UPDATE assessments SET status = $2 WHERE id = $1 AND status = $3")
            .bind(id)
            .bind(AssessmentStatus::Published)
            .bind(AssessmentStatus::Draft)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_assessment(&self, id: Uuid) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM assessments WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
