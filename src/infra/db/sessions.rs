use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Postgres, QueryBuilder};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::application::repos::{RepoError, SessionsRepo};
use crate::domain::entities::{SessionInfo, SessionInfoRow, SessionLink, SessionUserLink};
use crate::domain::types::{AssessmentKind, SessionStatus};

use super::{PostgresRepositories, map_sqlx_error};

const SESSION_INFO_SELECT: &str = r#"
    SELECT s.id,
           s.assessment_id,
           a.title AS assessment_title,
           s.status,
           s.score,
           s.actual_start_time,
           s.actual_end_time,
           s.expected_end_time,
           s.extra_time,
           st.id AS student_id,
           st.user_id AS student_user_id,
           st.full_name AS student_full_name,
           st.email AS student_email
      FROM sessions s
      JOIN assessments a ON a.id = s.assessment_id
      JOIN students st ON st.id = s.student_id
"#;

#[async_trait]
impl SessionsRepo for PostgresRepositories {
    async fn list_session_infos(
        &self,
        kind: AssessmentKind,
    ) -> Result<Vec<SessionInfo>, RepoError> {
        let sql = format!("{SESSION_INFO_SELECT} WHERE a.kind = $1");
        let rows: Vec<SessionInfoRow> = sqlx::query_as(&sql)
            .bind(kind)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(SessionInfo::from).collect())
    }

    async fn session_infos_by_ids(
        &self,
        kind: AssessmentKind,
        ids: &[Uuid],
    ) -> Result<Vec<SessionInfo>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{SESSION_INFO_SELECT} WHERE a.kind = $1 AND s.id = ANY($2)");
        let rows: Vec<SessionInfoRow> = sqlx::query_as(&sql)
            .bind(kind)
            .bind(ids)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(SessionInfo::from).collect())
    }

    async fn session_link(&self, session_id: Uuid) -> Result<Option<SessionLink>, RepoError> {
        sqlx::query_as(
            r#"
            SELECT s.id AS session_id,
                   a.kind AS assessment_kind
              FROM sessions s
              JOIN assessments a ON a.id = s.assessment_id
             WHERE s.id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn session_user_link(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionUserLink>, RepoError> {
        sqlx::query_as(
            r#"
            SELECT s.id AS session_id,
                   st.user_id
              FROM sessions s
              JOIN students st ON st.id = s.student_id
             WHERE s.id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn session_user_links(
        &self,
        kind: AssessmentKind,
    ) -> Result<Vec<SessionUserLink>, RepoError> {
        sqlx::query_as(
            r#"
            SELECT s.id AS session_id,
                   st.user_id
              FROM sessions s
              JOIN assessments a ON a.id = s.assessment_id
              JOIN students st ON st.id = s.student_id
             WHERE a.kind = $1
            "#,
        )
        .bind(kind)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn session_user_links_for_assessment(
        &self,
        assessment_id: Uuid,
    ) -> Result<Vec<SessionUserLink>, RepoError> {
        sqlx::query_as(
            r#"
            SELECT s.id AS session_id,
                   st.user_id
              FROM sessions s
              JOIN students st ON st.id = s.student_id
             WHERE s.assessment_id = $1
            "#,
        )
        .bind(assessment_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn update_session_fields(
        &self,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<u64, RepoError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE sessions SET ");
        let mut wrote_any = false;

        for (name, value) in fields {
            if wrote_any {
                qb.push(", ");
            }
            match name.as_str() {
                "status" => {
                    let status: SessionStatus = serde_json::from_value(value.clone())
                        .map_err(|err| RepoError::invalid_input(format!("status: {err}")))?;
                    qb.push("status = ");
                    qb.push_bind(status);
                }
                "score" => {
                    qb.push("score = ");
                    qb.push_bind(parse_optional_f64(name, value)?);
                }
                "extra_time" => {
                    qb.push("extra_time = ");
                    qb.push_bind(parse_optional_i32(name, value)?);
                }
                "actual_start_time" | "actual_end_time" | "expected_end_time" => {
                    qb.push(format!("{name} = "));
                    qb.push_bind(parse_optional_timestamp(name, value)?);
                }
                other => {
                    return Err(RepoError::invalid_input(format!(
                        "field `{other}` is not updatable"
                    )));
                }
            }
            wrote_any = true;
        }

        if !wrote_any {
            return Err(RepoError::invalid_input("no updatable fields provided"));
        }

        qb.push(" WHERE id = ");
        qb.push_bind(id);

        let result = qb
            .build()
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn set_session_score(&self, id: Uuid, score: f64) -> Result<u64, RepoError> {
        let result = sqlx::query("UPDATE sessions SET score = $2 WHERE id = $1")
            .bind(id)
            .bind(score)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

fn parse_optional_f64(name: &str, value: &Value) -> Result<Option<f64>, RepoError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(num) => num
            .as_f64()
            .map(Some)
            .ok_or_else(|| RepoError::invalid_input(format!("{name}: not a finite number"))),
        other => Err(RepoError::invalid_input(format!(
            "{name}: expected number, got {other}"
        ))),
    }
}

fn parse_optional_i32(name: &str, value: &Value) -> Result<Option<i32>, RepoError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(num) => num
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| RepoError::invalid_input(format!("{name}: out of range"))),
        other => Err(RepoError::invalid_input(format!(
            "{name}: expected integer, got {other}"
        ))),
    }
}

fn parse_optional_timestamp(name: &str, value: &Value) -> Result<Option<OffsetDateTime>, RepoError> {
    match value {
        Value::Null => Ok(None),
        Value::String(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .map(Some)
            .map_err(|err| RepoError::invalid_input(format!("{name}: {err}"))),
        other => Err(RepoError::invalid_input(format!(
            "{name}: expected RFC 3339 string, got {other}"
        ))),
    }
}
