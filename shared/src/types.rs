//! Core types used throughout the test harness

use crate::errors::{SharedError, SharedResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use url::Url;
use uuid::Uuid;

/// Global process ID singleton - set once at startup
static PROCESS_ID: OnceLock<ProcessId> = OnceLock::new();

/// Process identifier for any binary in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessId {
    /// The supervising harness process (singleton)
    Harness,
    /// A mock backend process standing in for one stack role
    Mock(Role),
}

impl ProcessId {
    /// Initialize the global process ID for the harness
    pub fn init_harness() -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Harness)
    }

    /// Initialize the global process ID for a mock backend role
    pub fn init_mock(role: Role) -> &'static ProcessId {
        PROCESS_ID.get_or_init(|| ProcessId::Mock(role))
    }

    /// Get the global process ID (must be initialized first)
    pub fn current() -> &'static ProcessId {
        PROCESS_ID.get().unwrap_or(&ProcessId::Harness)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Harness => write!(f, "harness"),
            ProcessId::Mock(role) => write!(f, "mock_{role}"),
        }
    }
}

/// The three fixed stages of the supervised backend chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Registry process that workers register with
    Controller,
    /// Model worker serving inference requests
    Worker,
    /// OpenAI-compatible HTTP gateway in front of the chain
    Gateway,
}

impl Role {
    /// Fixed dependency order: the controller must accept registrations
    /// before the worker starts, and the worker must be registered before
    /// the gateway is usable.
    pub const STARTUP_ORDER: [Role; 3] = [Role::Controller, Role::Worker, Role::Gateway];

    /// The role this one depends on, if any
    pub fn upstream(&self) -> Option<Role> {
        match self {
            Role::Controller => None,
            Role::Worker => Some(Role::Controller),
            Role::Gateway => Some(Role::Controller),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => write!(f, "controller"),
            Role::Worker => write!(f, "worker"),
            Role::Gateway => write!(f, "gateway"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "controller" => Ok(Role::Controller),
            "worker" => Ok(Role::Worker),
            "gateway" => Ok(Role::Gateway),
            _ => Err(format!("Unknown role: {s}")),
        }
    }
}

/// Lifecycle state of the supervised stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackState {
    Stopped,
    Starting,
    Ready,
    Degraded,
    Stopping,
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackState::Stopped => write!(f, "stopped"),
            StackState::Starting => write!(f, "starting"),
            StackState::Ready => write!(f, "ready"),
            StackState::Degraded => write!(f, "degraded"),
            StackState::Stopping => write!(f, "stopping"),
        }
    }
}

/// A port assigned to one stack role, with the owning PID once launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub role: Role,
    pub port: u16,
    pub pid: Option<u32>,
}

/// The three ports bound by a running stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackPorts {
    pub controller: u16,
    pub worker: u16,
    pub gateway: u16,
}

impl StackPorts {
    pub fn port_for(&self, role: Role) -> u16 {
        match role {
            Role::Controller => self.controller,
            Role::Worker => self.worker,
            Role::Gateway => self.gateway,
        }
    }

    /// Ports across the three roles must be pairwise distinct
    pub fn are_distinct(&self) -> bool {
        self.controller != self.worker
            && self.controller != self.gateway
            && self.worker != self.gateway
    }
}

/// Per-case overrides layered on top of the executor defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseOverrides {
    /// When set, the executor bypasses the network entirely and echoes
    /// this string back as a successful response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canned_response: Option<String>,

    /// Sampling parameters merged into the request payload; a key here
    /// wins over the executor default on collision
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub sampling: serde_json::Map<String, serde_json::Value>,
}

/// One structured test case, immutable once loaded.
///
/// Cases are identified by their position in the input sequence; the
/// harness preserves that order end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub company: String,
    pub model_id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub prompting_style: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_behavior: Option<String>,
    #[serde(default)]
    pub overrides: CaseOverrides,
}

/// Terminal classification of one executed case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Well-formed response received and judged to meet expectations
    Success,
    /// Well-formed response received but judged not to meet expectations
    Failed,
    /// No well-formed response after exhausting the attempt budget
    Error,
}

/// Outcome record for one test case, created exactly once, never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Back-reference to the case's position in the input sequence
    pub case_index: usize,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    /// Wall-clock time of the final attempt, in milliseconds
    pub latency_ms: u64,
    /// Attempts actually consumed (0 for a canned-response bypass)
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub response_chars: usize,
    /// Response was empty or hit a token/length ceiling
    pub truncated: bool,
    /// The judgement strategy could not decide; never folded into Success
    pub ambiguous: bool,
}

/// Capability object handed out once the stack reaches READY.
///
/// The executor reaches the running stack only through this handle and
/// never touches process or port state directly.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHandle {
    pub base_url: Url,
    pub readiness_token: Uuid,
}

impl EndpointHandle {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            readiness_token: Uuid::new_v4(),
        }
    }

    /// Build the handle for a gateway bound to `host:port`
    pub fn for_gateway(host: &str, port: u16) -> SharedResult<Self> {
        let input = format!("http://{host}:{port}/");
        let base_url =
            Url::parse(&input).map_err(|_| SharedError::InvalidUrl { input })?;
        Ok(Self::new(base_url))
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}v1/chat/completions", self.base_url)
    }

    pub fn models_url(&self) -> String {
        format!("{}v1/models", self.base_url)
    }
}

/// Run-level metadata handed to the results sink alongside the results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub model_id: String,
    pub ports: StackPorts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_order_is_controller_worker_gateway() {
        assert_eq!(
            Role::STARTUP_ORDER,
            [Role::Controller, Role::Worker, Role::Gateway]
        );
        assert_eq!(Role::Worker.upstream(), Some(Role::Controller));
        assert_eq!(Role::Controller.upstream(), None);
    }

    #[test]
    fn role_round_trips_through_display() {
        for role in Role::STARTUP_ORDER {
            let parsed: Role = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("registry".parse::<Role>().is_err());
    }

    #[test]
    fn stack_ports_distinctness() {
        let ports = StackPorts {
            controller: 21001,
            worker: 21002,
            gateway: 8000,
        };
        assert!(ports.are_distinct());
        assert_eq!(ports.port_for(Role::Gateway), 8000);

        let clash = StackPorts {
            controller: 8000,
            worker: 21002,
            gateway: 8000,
        };
        assert!(!clash.are_distinct());
    }

    #[test]
    fn endpoint_handle_urls() {
        let handle = EndpointHandle::new(Url::parse("http://127.0.0.1:8000/").unwrap());
        assert_eq!(
            handle.chat_completions_url(),
            "http://127.0.0.1:8000/v1/chat/completions"
        );
        assert_eq!(handle.models_url(), "http://127.0.0.1:8000/v1/models");
    }

    #[test]
    fn gateway_endpoint_from_host_and_port() {
        let handle = EndpointHandle::for_gateway("127.0.0.1", 8000).unwrap();
        assert_eq!(
            handle.chat_completions_url(),
            "http://127.0.0.1:8000/v1/chat/completions"
        );
        assert!(EndpointHandle::for_gateway("bad host", 8000).is_err());
    }

    #[test]
    fn test_case_deserializes_with_defaults() {
        let case: TestCase = serde_json::from_str(
            r#"{"model_id": "vicuna-7b", "user_prompt": "Hello"}"#,
        )
        .unwrap();
        assert_eq!(case.model_id, "vicuna-7b");
        assert!(case.system_prompt.is_none());
        assert!(case.overrides.canned_response.is_none());
        assert!(case.overrides.sampling.is_empty());
    }
}
