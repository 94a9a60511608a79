use async_trait::async_trait;

use crate::application::repos::{RepoError, StudentsRepo};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl StudentsRepo for PostgresRepositories {
    async fn list_student_emails(&self) -> Result<Vec<String>, RepoError> {
        sqlx::query_scalar(
            r#"
            SELECT email
              FROM students
             WHERE user_id IS NOT NULL
               AND email IS NOT NULL
             ORDER BY email
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }
}
