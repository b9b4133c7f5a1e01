//! Configuration for the stack supervisor and the test executor
//!
//! Defaults mirror the FastChat deployment this harness was built around:
//! controller on 21001, model worker on 21002, OpenAI-compatible gateway
//! on 8000.

use crate::error::{HarnessError, HarnessResult};
use shared::StackPorts;
use std::time::Duration;

/// Supervisor configuration for the three-stage backend chain
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Host every role binds to and is probed on
    pub host: String,

    /// Preferred ports per role; the supervisor reclaims or fails on conflict
    pub preferred_ports: StackPorts,

    /// How many ports past the preferred one to scan when scanning is allowed
    pub scan_range: u16,

    /// Scan forward instead of failing when a preferred port is held by a
    /// process we cannot attribute to this system. Off by default: silently
    /// rebinding hides conflicts the operator should know about.
    pub scan_on_conflict: bool,

    /// Interval between readiness probes during startup
    pub poll_interval: Duration,

    /// Upper bound on the readiness wait for each role
    pub readiness_timeout: Duration,

    /// Process-launch attempts per role (launch races are transient)
    pub launch_attempts: u32,

    /// Delay between launch attempts
    pub launch_retry_delay: Duration,

    /// Grace period between SIGTERM and SIGKILL during teardown/reclaim
    pub grace_period: Duration,

    /// Model served by the worker
    pub model_id: String,

    /// Environment variables forwarded opaquely to launched processes
    /// (accelerator visibility, cache directories)
    pub env_passthrough: Vec<String>,

    /// Command-line markers identifying this system's own processes; used
    /// to attribute stale port occupants before reclaiming them
    pub signature_markers: Vec<String>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            preferred_ports: StackPorts {
                controller: 21001,
                worker: 21002,
                gateway: 8000,
            },
            scan_range: 100,
            scan_on_conflict: false,
            poll_interval: Duration::from_millis(500),
            readiness_timeout: Duration::from_secs(30),
            launch_attempts: 2,
            launch_retry_delay: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            model_id: "lmsys/vicuna-7b-v1.5".to_string(),
            env_passthrough: vec![
                "CUDA_VISIBLE_DEVICES".to_string(),
                "HF_HOME".to_string(),
                "TRANSFORMERS_CACHE".to_string(),
            ],
            signature_markers: vec!["fastchat.serve".to_string(), "mockstack".to_string()],
        }
    }
}

impl StackConfig {
    /// Configure preferred ports (fluent API)
    pub fn with_ports(mut self, ports: StackPorts) -> Self {
        self.preferred_ports = ports;
        self
    }

    /// Configure readiness polling bounds (fluent API)
    pub fn with_readiness(mut self, poll_interval: Duration, readiness_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.readiness_timeout = readiness_timeout;
        self
    }

    /// Configure the served model (fluent API)
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Allow scanning past an unattributable conflict (fluent API)
    pub fn with_scan_on_conflict(mut self, allow: bool) -> Self {
        self.scan_on_conflict = allow;
        self
    }

    /// Configure the teardown grace period (fluent API)
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if !self.preferred_ports.are_distinct() {
            return Err(HarnessError::Config {
                field: "preferred_ports must be pairwise distinct".to_string(),
            });
        }
        if self.launch_attempts == 0 {
            return Err(HarnessError::Config {
                field: "launch_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Executor configuration: attempt budget, backoff schedule, payload defaults
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum attempts per case, including the first
    pub max_attempts: u32,

    /// Base inter-attempt delay; doubles per attempt
    pub base_delay: Duration,

    /// Cap on the inter-attempt delay
    pub max_delay: Duration,

    /// Per-attempt request timeout
    pub request_timeout: Duration,

    /// Default token ceiling sent with every request
    pub max_tokens: u32,

    /// Default sampling temperature
    pub temperature: f64,

    /// Pause between consecutive cases to avoid hammering the backend
    pub pause_between_cases: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(60),
            max_tokens: 1000,
            temperature: 0.7,
            pause_between_cases: Duration::from_secs(1),
        }
    }
}

impl ExecutorConfig {
    /// Configure the retry budget (fluent API)
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Configure the backoff schedule (fluent API)
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Configure the per-attempt timeout (fluent API)
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Configure the inter-case pause (fluent API)
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause_between_cases = pause;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_match_fastchat_layout() {
        let config = StackConfig::default();
        assert_eq!(config.preferred_ports.controller, 21001);
        assert_eq!(config.preferred_ports.worker, 21002);
        assert_eq!(config.preferred_ports.gateway, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn clashing_ports_fail_validation() {
        let config = StackConfig::default().with_ports(StackPorts {
            controller: 8000,
            worker: 8000,
            gateway: 8001,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn executor_attempts_never_below_one() {
        let config = ExecutorConfig::default().with_attempts(0);
        assert_eq!(config.max_attempts, 1);
    }
}
