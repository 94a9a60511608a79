//! Shared domain enumerations aligned with persisted database enums.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "question_kind", rename_all = "snake_case")]
pub enum QuestionKind {
    SingleChoice,
    BinaryChoice,
    MultiChoice,
    FlexibleMultiChoice,
}

impl QuestionKind {
    /// True for kinds whose answers are sets of option identifiers.
    pub fn is_multi(self) -> bool {
        matches!(
            self,
            QuestionKind::MultiChoice | QuestionKind::FlexibleMultiChoice
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    InProgress,
    Submitted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "assessment_kind", rename_all = "snake_case")]
pub enum AssessmentKind {
    Practice,
    Exam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "assessment_status", rename_all = "snake_case")]
pub enum AssessmentStatus {
    Draft,
    Published,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    GradeSubmission,
    DistributeStudent,
    PersistSessionUpdate,
}

impl JobType {
    /// Queue/storage namespace passed to the apalis backend.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::GradeSubmission => "GradeSubmission",
            JobType::DistributeStudent => "DistributeStudent",
            JobType::PersistSessionUpdate => "PersistSessionUpdate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_kind_serializes_snake_case() {
        let json = serde_json::to_string(&QuestionKind::FlexibleMultiChoice).expect("serialize");
        assert_eq!(json, "\"flexible_multi_choice\"");
    }

    #[test]
    fn multi_kinds_are_multi() {
        assert!(QuestionKind::MultiChoice.is_multi());
        assert!(QuestionKind::FlexibleMultiChoice.is_multi());
        assert!(!QuestionKind::SingleChoice.is_multi());
        assert!(!QuestionKind::BinaryChoice.is_multi());
    }
}
