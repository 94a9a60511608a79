//! Scoring for answered questions.
//!
//! Single and binary choice questions are all-or-nothing. Multi choice
//! questions award partial credit per correctly selected option, but any
//! wrong pick zeroes the score outright.

use std::collections::BTreeSet;

use serde_json::Value;

use super::types::QuestionKind;

/// A set of selected option identifiers, order-irrelevant.
///
/// Sources store answer sets either as a native JSON array or as a
/// JSON-encoded string; absent or unparseable input collapses to empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSet(BTreeSet<String>);

impl AnswerSet {
    pub fn parse(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        match value {
            Value::Array(items) => Self(items.iter().map(scalar_to_string).collect()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(items)) => {
                    Self(items.iter().map(|i| scalar_to_string(i)).collect())
                }
                _ => Self::default(),
            },
            _ => Self::default(),
        }
    }

    pub fn from_iter<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(items.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    fn intersection_len(&self, other: &Self) -> usize {
        self.0.intersection(&other.0).count()
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Computes the score for one answered question.
///
/// The result is deterministic and bounded by `0.0 <= score <= point_value`,
/// rounded to two decimal places.
pub fn score(
    kind: QuestionKind,
    correct_choice: Option<&str>,
    correct_choices: &AnswerSet,
    submitted_choice: Option<&str>,
    submitted_choices: &AnswerSet,
    point_value: f64,
    option_count: Option<i32>,
) -> f64 {
    let raw = match kind {
        QuestionKind::SingleChoice | QuestionKind::BinaryChoice => {
            match (correct_choice, submitted_choice) {
                (Some(correct), Some(submitted)) if correct == submitted => point_value,
                _ => 0.0,
            }
        }
        QuestionKind::MultiChoice | QuestionKind::FlexibleMultiChoice => {
            score_multi(correct_choices, submitted_choices, point_value, option_count)
        }
    };
    round2(raw)
}

fn score_multi(
    correct: &AnswerSet,
    submitted: &AnswerSet,
    point_value: f64,
    option_count: Option<i32>,
) -> f64 {
    if submitted.is_empty() || !submitted.is_subset(correct) {
        return 0.0;
    }
    if submitted == correct {
        return point_value;
    }
    let divisor = match option_count {
        Some(n) if n > 0 => n as f64,
        _ => correct.len() as f64,
    };
    if divisor == 0.0 {
        return 0.0;
    }
    point_value / divisor * submitted.intersection_len(correct) as f64
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(items: &[&str]) -> AnswerSet {
        AnswerSet::from_iter(items.iter().copied())
    }

    #[test]
    fn single_choice_exact_match_scores_full() {
        let s = score(
            QuestionKind::SingleChoice,
            Some("b"),
            &AnswerSet::default(),
            Some("b"),
            &AnswerSet::default(),
            4.0,
            None,
        );
        assert_eq!(s, 4.0);
    }

    #[test]
    fn single_choice_mismatch_scores_zero() {
        let s = score(
            QuestionKind::SingleChoice,
            Some("b"),
            &AnswerSet::default(),
            Some("c"),
            &AnswerSet::default(),
            4.0,
            None,
        );
        assert_eq!(s, 0.0);
    }

    #[test]
    fn single_choice_missing_submission_scores_zero() {
        let s = score(
            QuestionKind::BinaryChoice,
            Some("true"),
            &AnswerSet::default(),
            None,
            &AnswerSet::default(),
            2.0,
            None,
        );
        assert_eq!(s, 0.0);
    }

    #[test]
    fn multi_choice_wrong_pick_zeroes_everything() {
        let s = score(
            QuestionKind::MultiChoice,
            None,
            &set(&["a", "b", "c"]),
            None,
            &set(&["a", "x"]),
            10.0,
            Some(3),
        );
        assert_eq!(s, 0.0);
    }

    #[test]
    fn multi_choice_exact_set_scores_full() {
        let s = score(
            QuestionKind::MultiChoice,
            None,
            &set(&["a", "b", "c"]),
            None,
            &set(&["c", "a", "b"]),
            10.0,
            Some(3),
        );
        assert_eq!(s, 10.0);
    }

    #[test]
    fn multi_choice_proper_subset_earns_partial_credit() {
        let s = score(
            QuestionKind::MultiChoice,
            None,
            &set(&["a", "b"]),
            None,
            &set(&["a"]),
            10.0,
            Some(2),
        );
        assert_eq!(s, 5.0);
    }

    #[test]
    fn option_count_defaults_to_correct_set_size() {
        let s = score(
            QuestionKind::FlexibleMultiChoice,
            None,
            &set(&["a", "b", "c", "d"]),
            None,
            &set(&["a", "b"]),
            10.0,
            None,
        );
        assert_eq!(s, 5.0);
    }

    #[test]
    fn zero_option_count_guard() {
        let s = score(
            QuestionKind::MultiChoice,
            None,
            &AnswerSet::default(),
            None,
            &AnswerSet::default(),
            10.0,
            Some(0),
        );
        assert_eq!(s, 0.0);
    }

    #[test]
    fn score_is_bounded_by_point_value() {
        for submitted in [set(&["a"]), set(&["a", "b"]), set(&["a", "b", "c"])] {
            let s = score(
                QuestionKind::MultiChoice,
                None,
                &set(&["a", "b", "c"]),
                None,
                &submitted,
                7.5,
                Some(3),
            );
            assert!((0.0..=7.5).contains(&s), "score {s} out of bounds");
        }
    }

    #[test]
    fn partial_credit_rounds_to_two_decimals() {
        let s = score(
            QuestionKind::MultiChoice,
            None,
            &set(&["a", "b", "c"]),
            None,
            &set(&["a"]),
            10.0,
            Some(3),
        );
        assert_eq!(s, 3.33);
    }

    #[test]
    fn answer_set_parses_native_arrays_and_json_strings() {
        assert_eq!(AnswerSet::parse(Some(&json!(["a", "b"]))), set(&["a", "b"]));
        assert_eq!(
            AnswerSet::parse(Some(&json!("[\"a\",\"b\"]"))),
            set(&["a", "b"])
        );
        assert_eq!(AnswerSet::parse(Some(&json!("not json"))), AnswerSet::default());
        assert_eq!(AnswerSet::parse(None), AnswerSet::default());
    }
}
