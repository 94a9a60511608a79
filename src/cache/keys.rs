//! Cache key formats.
//!
//! These key shapes are shared with external cache readers. Changing any of
//! them breaks interop, so all key construction goes through this module.

use uuid::Uuid;

use crate::domain::types::AssessmentKind;

/// Flat session-info hashes: `practice_session_info:{id}`.
pub const PRACTICE_SESSION_INFO_NS: &str = "practice_session_info";
/// Flat session-info hashes: `exam_session_info:{id}`.
pub const EXAM_SESSION_INFO_NS: &str = "exam_session_info";

/// Parent namespace for nested question-result hashes under practice sessions.
pub const PRACTICE_SESSION_NS: &str = "practice_session";
/// Parent namespace for nested question-result hashes under exam sessions.
pub const EXAM_SESSION_NS: &str = "exam_session";
/// Child namespace for question results.
pub const QRESULT_NS: &str = "qresult";

/// Whole-paper JSON blobs: `papers_full_data:{paper_id}`.
pub const PAPER_BLOB_NS: &str = "papers_full_data";

/// Reverse index sets, user id to owned practice session ids.
pub const USER_PRACTICE_INDEX_PREFIX: &str = "user_ps_index";
/// Reverse index sets, user id to owned exam session ids.
pub const USER_EXAM_INDEX_PREFIX: &str = "user_es_index";

/// Bounded list of student account emails, rebuilt atomically on refresh.
pub const EMAIL_LIST_KEY: &str = "student_user_email_list";

const LOCK_PREFIX: &str = "cache_lock";

pub fn item_key(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}

pub fn child_key(parent_ns: &str, parent_id: &str, child_ns: &str, child_id: &str) -> String {
    format!("{parent_ns}:{parent_id}:{child_ns}:{child_id}")
}

/// Pattern matching every child hash under one parent.
pub fn children_pattern(parent_ns: &str, parent_id: &str, child_ns: &str) -> String {
    format!("{parent_ns}:{parent_id}:{child_ns}:*")
}

/// Pattern matching every key in a namespace.
pub fn namespace_pattern(namespace: &str) -> String {
    format!("{namespace}:*")
}

pub fn index_key(prefix: &str, user_id: Uuid) -> String {
    format!("{prefix}:{user_id}")
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}:{name}")
}

pub fn session_info_ns(kind: AssessmentKind) -> &'static str {
    match kind {
        AssessmentKind::Practice => PRACTICE_SESSION_INFO_NS,
        AssessmentKind::Exam => EXAM_SESSION_INFO_NS,
    }
}

pub fn session_parent_ns(kind: AssessmentKind) -> &'static str {
    match kind {
        AssessmentKind::Practice => PRACTICE_SESSION_NS,
        AssessmentKind::Exam => EXAM_SESSION_NS,
    }
}

pub fn user_index_prefix(kind: AssessmentKind) -> &'static str {
    match kind {
        AssessmentKind::Practice => USER_PRACTICE_INDEX_PREFIX,
        AssessmentKind::Exam => USER_EXAM_INDEX_PREFIX,
    }
}

/// Key of one question-result child hash under its session.
pub fn qresult_key(kind: AssessmentKind, session_id: Uuid, question_result_id: Uuid) -> String {
    child_key(
        session_parent_ns(kind),
        &session_id.to_string(),
        QRESULT_NS,
        &question_result_id.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes_are_stable() {
        assert_eq!(item_key(PAPER_BLOB_NS, "42"), "papers_full_data:42");
        assert_eq!(
            child_key("practice_session", "s1", "qresult", "q1"),
            "practice_session:s1:qresult:q1"
        );
        assert_eq!(
            children_pattern("exam_session", "s1", "qresult"),
            "exam_session:s1:qresult:*"
        );
        assert_eq!(namespace_pattern("exam_session_info"), "exam_session_info:*");
        assert_eq!(lock_key("practice_session_info"), "cache_lock:practice_session_info");
    }

    #[test]
    fn kind_selects_namespaces() {
        assert_eq!(session_info_ns(AssessmentKind::Practice), "practice_session_info");
        assert_eq!(session_info_ns(AssessmentKind::Exam), "exam_session_info");
        assert_eq!(user_index_prefix(AssessmentKind::Practice), "user_ps_index");
        assert_eq!(user_index_prefix(AssessmentKind::Exam), "user_es_index");
    }

    #[test]
    fn qresult_key_embeds_both_ids() {
        let session = Uuid::nil();
        let result = Uuid::nil();
        assert_eq!(
            qresult_key(AssessmentKind::Exam, session, result),
            format!("exam_session:{session}:qresult:{result}")
        );
    }
}
