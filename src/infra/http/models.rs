//! Request and response bodies for the cache API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::events::EventKind;
use crate::domain::entities::SubmittedAnswers;
use crate::domain::types::AssessmentKind;

#[derive(Debug, Deserialize)]
pub struct SubmitQuestionResultRequest {
    pub id: Uuid,
    pub item: SubmittedAnswers,
}

#[derive(Debug, Serialize)]
pub struct SubmitAcceptedResponse {
    pub id: Uuid,
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionFieldsQuery {
    /// Comma-separated field names; absent means the whole hash.
    pub fields: Option<String>,
}

impl SessionFieldsQuery {
    pub fn field_names(&self) -> Option<Vec<String>> {
        let raw = self.fields.as_deref()?;
        let names: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() { None } else { Some(names) }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionBatchRequest {
    pub session_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UserBatchRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PatchSessionResponse {
    pub id: Uuid,
    pub updated: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RecalculateResponse {
    pub id: Uuid,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct EmailPopResponse {
    pub email: String,
}

/// Change notification from an external data-source writer.
///
/// Anything that mutates sessions, papers, or the roster without going
/// through this service posts one of these so the cache converges before
/// the next full rebuild.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEventRequest {
    SessionsDeleted {
        kind: AssessmentKind,
        session_ids: Vec<Uuid>,
    },
    PapersUpserted {
        paper_ids: Vec<Uuid>,
    },
    PapersDeleted {
        paper_ids: Vec<Uuid>,
    },
    StudentsChanged,
}

impl From<CacheEventRequest> for EventKind {
    fn from(request: CacheEventRequest) -> Self {
        match request {
            CacheEventRequest::SessionsDeleted { kind, session_ids } => {
                EventKind::SessionsDeleted { kind, session_ids }
            }
            CacheEventRequest::PapersUpserted { paper_ids } => {
                EventKind::PapersUpserted { paper_ids }
            }
            CacheEventRequest::PapersDeleted { paper_ids } => EventKind::PapersDeleted { paper_ids },
            CacheEventRequest::StudentsChanged => EventKind::StudentsChanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_split_and_trimmed() {
        let query = SessionFieldsQuery {
            fields: Some("status, score ,,student__email".to_string()),
        };
        assert_eq!(
            query.field_names(),
            Some(vec![
                "status".to_string(),
                "score".to_string(),
                "student__email".to_string()
            ])
        );
    }

    #[test]
    fn empty_fields_means_whole_hash() {
        let query = SessionFieldsQuery {
            fields: Some(" , ".to_string()),
        };
        assert_eq!(query.field_names(), None);
        let query = SessionFieldsQuery { fields: None };
        assert_eq!(query.field_names(), None);
    }

    #[test]
    fn cache_event_request_maps_onto_event_kinds() {
        let id = Uuid::new_v4();
        let request: CacheEventRequest = serde_json::from_value(serde_json::json!({
            "event": "sessions_deleted",
            "kind": "exam",
            "session_ids": [id],
        }))
        .unwrap();
        assert_eq!(
            EventKind::from(request),
            EventKind::SessionsDeleted {
                kind: AssessmentKind::Exam,
                session_ids: vec![id],
            }
        );

        let request: CacheEventRequest =
            serde_json::from_value(serde_json::json!({ "event": "students_changed" })).unwrap();
        assert_eq!(EventKind::from(request), EventKind::StudentsChanged);
    }
}
