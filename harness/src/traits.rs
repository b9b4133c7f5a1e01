//! Trait definitions with mockall annotations for testing
//!
//! These are the seams of the harness: process launching, test-case input,
//! results output, and outcome judgement. Each is mockable for unit tests
//! and swappable at the binary edge (real FastChat launcher vs. mock stack,
//! different judgement strategies).

use crate::core::judge::Judgement;
use crate::error::HarnessResult;
use shared::{Role, RunMetadata, TestCase, TestResult};
use tokio::process::Child;

/// Launches one backend role bound to an assigned port.
///
/// The supervisor owns port arbitration and readiness polling; a launcher
/// only turns (role, port, upstream port) into a running child process.
#[mockall::automock]
#[async_trait::async_trait]
pub trait RoleLauncher: Send + Sync {
    /// Spawn the process for `role` listening on `port`. WORKER and GATEWAY
    /// receive the controller's already-bound port as `upstream_port`.
    async fn launch(
        &self,
        role: Role,
        port: u16,
        upstream_port: Option<u16>,
    ) -> HarnessResult<Child>;
}

/// Supplies the ordered sequence of test cases.
///
/// A malformed record is attributed to its position and skipped; loading
/// fails only when no records at all could be parsed.
#[mockall::automock]
#[async_trait::async_trait]
pub trait TestCaseSource: Send + Sync {
    async fn load(&self) -> HarnessResult<Vec<TestCase>>;
}

/// Persists the ordered result sequence plus run-level metadata.
///
/// The sink must preserve the case/result correspondence; results arrive in
/// input order and are written as received.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ResultsSink: Send + Sync {
    async fn write(&self, metadata: &RunMetadata, results: &[TestResult]) -> HarnessResult<()>;
}

/// Decides whether a well-formed response satisfies a case's expected
/// behavior. Free-text comparison is inherently fuzzy, so the strategy is
/// pluggable; `Ambiguous` surfaces as FAILED with an explicit flag, never
/// as a silent success.
#[mockall::automock]
pub trait JudgementStrategy: Send + Sync {
    fn judge(&self, case: &TestCase, response: &str) -> Judgement;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::CaseOverrides;

    #[tokio::test]
    async fn mocked_case_source_serves_cases_through_the_seam() {
        let mut source = MockTestCaseSource::new();
        source.expect_load().times(1).returning(|| {
            Ok(vec![TestCase {
                company: String::new(),
                model_id: "vicuna-7b".to_string(),
                category: "chat".to_string(),
                prompting_style: String::new(),
                theme: String::new(),
                system_prompt: None,
                user_prompt: "Hello".to_string(),
                expected_behavior: None,
                overrides: CaseOverrides::default(),
            }])
        });

        let cases = source.load().await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].user_prompt, "Hello");
    }
}
