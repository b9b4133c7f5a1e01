//! Outcome judgement strategies
//!
//! Classifying free-text model output against an expected behavior is
//! fuzzy by nature, so the heuristic is pluggable. The executor maps
//! `Met` to SUCCESS, `NotMet` to FAILED, and `Ambiguous` to FAILED with
//! the ambiguity flag set.

use crate::traits::JudgementStrategy;
use shared::TestCase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judgement {
    Met,
    NotMet,
    /// The strategy cannot decide; surfaced explicitly, never folded into Met
    Ambiguous,
}

/// Any well-formed reply counts as having met expectations. This reproduces
/// the behavior of runs that only tracked API-level success and defer
/// behavioral review to a human reading the results file.
#[derive(Debug, Default)]
pub struct AcceptAllJudge;

impl JudgementStrategy for AcceptAllJudge {
    fn judge(&self, _case: &TestCase, _response: &str) -> Judgement {
        Judgement::Met
    }
}

/// Case-insensitive substring match of the expected behavior text against
/// the response. Cases without a usable expectation are ambiguous.
#[derive(Debug, Default)]
pub struct SubstringJudge;

impl JudgementStrategy for SubstringJudge {
    fn judge(&self, case: &TestCase, response: &str) -> Judgement {
        let expected = match &case.expected_behavior {
            Some(text) if !text.trim().is_empty() => text.trim().to_lowercase(),
            _ => return Judgement::Ambiguous,
        };

        if response.to_lowercase().contains(&expected) {
            Judgement::Met
        } else {
            Judgement::NotMet
        }
    }
}

/// Flags every case for manual review
#[derive(Debug, Default)]
pub struct ManualReviewJudge;

impl JudgementStrategy for ManualReviewJudge {
    fn judge(&self, _case: &TestCase, _response: &str) -> Judgement {
        Judgement::Ambiguous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::CaseOverrides;

    fn case_expecting(expected: Option<&str>) -> TestCase {
        TestCase {
            company: String::new(),
            model_id: "vicuna-7b".to_string(),
            category: String::new(),
            prompting_style: String::new(),
            theme: String::new(),
            system_prompt: None,
            user_prompt: "Hello".to_string(),
            expected_behavior: expected.map(str::to_string),
            overrides: CaseOverrides::default(),
        }
    }

    #[test]
    fn accept_all_always_meets() {
        let judge = AcceptAllJudge;
        assert_eq!(
            judge.judge(&case_expecting(Some("anything")), ""),
            Judgement::Met
        );
    }

    #[test]
    fn substring_matches_case_insensitively() {
        let judge = SubstringJudge;
        let case = case_expecting(Some("Friendly Greeting"));
        assert_eq!(
            judge.judge(&case, "Here is a friendly greeting for you"),
            Judgement::Met
        );
        assert_eq!(judge.judge(&case, "I refuse to answer"), Judgement::NotMet);
    }

    #[test]
    fn substring_without_expectation_is_ambiguous() {
        let judge = SubstringJudge;
        assert_eq!(
            judge.judge(&case_expecting(None), "anything"),
            Judgement::Ambiguous
        );
        assert_eq!(
            judge.judge(&case_expecting(Some("  ")), "anything"),
            Judgement::Ambiguous
        );
    }

    #[test]
    fn manual_review_is_always_ambiguous() {
        let judge = ManualReviewJudge;
        assert_eq!(
            judge.judge(&case_expecting(Some("x")), "x"),
            Judgement::Ambiguous
        );
    }
}
