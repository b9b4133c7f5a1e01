//! Test executor: drives the ordered case sequence against the gateway
//!
//! One request per case, retried with capped exponential backoff on
//! transient failures. Per-case failure never aborts the batch; the output
//! always holds one result per input case, in input order, unless a
//! cancellation stops the run early (partial results are a valid outcome).

use crate::config::ExecutorConfig;
use crate::core::backoff::BackoffSchedule;
use crate::core::judge::Judgement;
use crate::core::payload::{build_chat_payload, parse_chat_reply, ChatReply};
use crate::error::{HarnessError, HarnessResult};
use crate::traits::JudgementStrategy;
use chrono::Utc;
use serde_json::Value;
use shared::{process_info, process_warn, EndpointHandle, ProcessId, TestCase, TestResult, TestStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct TestExecutor {
    config: ExecutorConfig,
    judge: Arc<dyn JudgementStrategy>,
    http: reqwest::Client,
}

impl TestExecutor {
    pub fn new(config: ExecutorConfig, judge: Arc<dyn JudgementStrategy>) -> Self {
        Self {
            config,
            judge,
            http: reqwest::Client::new(),
        }
    }

    /// Run every case in order. Cancellation stops new requests but
    /// returns the results accumulated so far.
    pub async fn run(
        &self,
        endpoint: &EndpointHandle,
        cases: &[TestCase],
        cancel: &CancellationToken,
    ) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(cases.len());

        for (index, case) in cases.iter().enumerate() {
            if cancel.is_cancelled() {
                process_warn!(
                    ProcessId::current(),
                    "🛑 Cancelled after {} of {} cases",
                    results.len(),
                    cases.len()
                );
                break;
            }

            let result = self.run_case(endpoint, index, case, cancel).await;
            let marker = match result.status {
                TestStatus::Success => "✅",
                TestStatus::Failed => "❌",
                TestStatus::Error => "💥",
            };
            process_info!(
                ProcessId::current(),
                "{} Case {}/{} [{}]: {:?} in {}ms ({} attempts)",
                marker,
                index + 1,
                cases.len(),
                case.category,
                result.status,
                result.latency_ms,
                result.attempts
            );
            results.push(result);

            if index + 1 < cases.len() && !self.config.pause_between_cases.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.pause_between_cases) => {}
                }
            }
        }

        results
    }

    async fn run_case(
        &self,
        endpoint: &EndpointHandle,
        index: usize,
        case: &TestCase,
        cancel: &CancellationToken,
    ) -> TestResult {
        // Canned responses bypass the network entirely; used for
        // deterministic self-tests of the result pipeline
        if let Some(canned) = &case.overrides.canned_response {
            return TestResult {
                case_index: index,
                status: TestStatus::Success,
                response_text: Some(canned.clone()),
                latency_ms: 0,
                attempts: 0,
                error_detail: None,
                timestamp: Utc::now(),
                response_chars: canned.chars().count(),
                truncated: false,
                ambiguous: false,
            };
        }

        let payload = build_chat_payload(case, &self.config);
        let url = endpoint.chat_completions_url();
        let backoff = BackoffSchedule::new(self.config.base_delay, self.config.max_delay);

        let mut attempts = 0u32;
        let mut last_latency = Duration::ZERO;
        let mut last_error: Option<HarnessError> = None;

        while attempts < self.config.max_attempts {
            attempts += 1;
            let attempt_started = Instant::now();
            let outcome = self.attempt(&url, &payload).await;
            last_latency = attempt_started.elapsed();

            match outcome {
                Ok(reply) => return self.classify(index, case, reply, attempts, last_latency),
                Err(e) => {
                    process_warn!(
                        ProcessId::current(),
                        "⚠️ Case {} attempt {}/{} failed: {}",
                        index,
                        attempts,
                        self.config.max_attempts,
                        e
                    );
                    let transient = e.is_transient();
                    last_error = Some(e);
                    // Permanent failures (a request we built wrong) do not
                    // improve on retry
                    if !transient {
                        break;
                    }
                    if attempts < self.config.max_attempts {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff.delay_after(attempts)) => {}
                        }
                    }
                }
            }
        }

        TestResult {
            case_index: index,
            status: TestStatus::Error,
            response_text: None,
            latency_ms: last_latency.as_millis() as u64,
            attempts,
            error_detail: last_error.map(|e| e.to_string()),
            timestamp: Utc::now(),
            response_chars: 0,
            truncated: false,
            ambiguous: false,
        }
    }

    /// One request/response cycle. Network failures, 5xx/429 statuses and
    /// malformed bodies are transient; other 4xx statuses are permanent.
    async fn attempt(&self, url: &str, payload: &Value) -> HarnessResult<ChatReply> {
        let response = self
            .http
            .post(url)
            .timeout(self.config.request_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| HarnessError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            let detail = format!("gateway returned {status}: {snippet}");
            return Err(
                if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
                    HarnessError::permanent(detail)
                } else {
                    HarnessError::transient(detail)
                },
            );
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| HarnessError::transient(format!("unreadable response body: {e}")))?;
        parse_chat_reply(&body)
    }

    fn classify(
        &self,
        index: usize,
        case: &TestCase,
        reply: ChatReply,
        attempts: u32,
        latency: Duration,
    ) -> TestResult {
        // Ambiguous is surfaced as FAILED with the flag set, never folded
        // into SUCCESS
        let (status, ambiguous) = match self.judge.judge(case, &reply.text) {
            Judgement::Met => (TestStatus::Success, false),
            Judgement::NotMet => (TestStatus::Failed, false),
            Judgement::Ambiguous => (TestStatus::Failed, true),
        };

        TestResult {
            case_index: index,
            status,
            response_chars: reply.text.chars().count(),
            truncated: reply.truncated(),
            response_text: Some(reply.text),
            latency_ms: latency.as_millis() as u64,
            attempts,
            error_detail: None,
            timestamp: Utc::now(),
            ambiguous,
        }
    }
}
