//! Role launcher implementations
//!
//! `FastChatLauncher` spawns the real backend chain (controller, model
//! worker, OpenAI-compatible gateway). `MockStackLauncher` spawns the
//! bundled `mockstack` binary instead, which serves the same HTTP surface
//! deterministically - used by the integration tests and `--mock` mode.
//!
//! Every launched command carries an explicit `--port` argument; the port
//! allocator relies on that to attribute stale processes to this system.

use crate::error::{HarnessError, HarnessResult};
use crate::traits::RoleLauncher;
use shared::{process_debug, ProcessId, Role};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Launches the real FastChat serving chain
pub struct FastChatLauncher {
    host: String,
    model_id: String,
    env_passthrough: Vec<String>,
    python: String,
}

impl FastChatLauncher {
    pub fn new(host: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            model_id: model_id.into(),
            env_passthrough: Vec::new(),
            python: "python".to_string(),
        }
    }

    /// Environment variables forwarded opaquely to every launched process
    /// (fluent API)
    pub fn with_env_passthrough(mut self, vars: Vec<String>) -> Self {
        self.env_passthrough = vars;
        self
    }

    /// Python interpreter to launch the serving modules with (fluent API)
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    fn command_for(&self, role: Role, port: u16, upstream_port: Option<u16>) -> HarnessResult<Command> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-m");

        match role {
            Role::Controller => {
                cmd.arg("fastchat.serve.controller")
                    .arg("--host")
                    .arg(&self.host)
                    .arg("--port")
                    .arg(port.to_string());
            }
            Role::Worker => {
                let controller_port = require_upstream(role, upstream_port)?;
                cmd.arg("fastchat.serve.model_worker")
                    .arg("--model-path")
                    .arg(&self.model_id)
                    .arg("--controller")
                    .arg(format!("http://{}:{}", self.host, controller_port))
                    .arg("--worker-address")
                    .arg(format!("http://{}:{}", self.host, port))
                    .arg("--host")
                    .arg(&self.host)
                    .arg("--port")
                    .arg(port.to_string());
            }
            Role::Gateway => {
                let controller_port = require_upstream(role, upstream_port)?;
                cmd.arg("fastchat.serve.openai_api_server")
                    .arg("--controller-address")
                    .arg(format!("http://{}:{}", self.host, controller_port))
                    .arg("--host")
                    .arg(&self.host)
                    .arg("--port")
                    .arg(port.to_string());
            }
        }

        for var in &self.env_passthrough {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }

        Ok(cmd)
    }
}

#[async_trait::async_trait]
impl RoleLauncher for FastChatLauncher {
    async fn launch(
        &self,
        role: Role,
        port: u16,
        upstream_port: Option<u16>,
    ) -> HarnessResult<Child> {
        let mut cmd = self.command_for(role, port, upstream_port)?;
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| HarnessError::Launch {
            role,
            message: format!("failed to spawn: {e}"),
        })?;

        process_debug!(
            ProcessId::current(),
            "🏭 Spawned {} (PID: {}) on port {}",
            role,
            child.id().unwrap_or(0),
            port
        );
        Ok(child)
    }
}

/// Launches the bundled `mockstack` binary for each role
pub struct MockStackLauncher {
    host: String,
    model_id: String,
    program: PathBuf,
    /// Delay before the mock worker registers with the controller
    register_delay_ms: u64,
    /// Number of initial completion requests the mock gateway fails with 500
    flaky_failures: u32,
}

impl MockStackLauncher {
    pub fn new(host: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            model_id: model_id.into(),
            program: sibling_binary("mockstack"),
            register_delay_ms: 0,
            flaky_failures: 0,
        }
    }

    /// Path of the mockstack binary (fluent API)
    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    /// Delay mock worker registration (fluent API)
    pub fn with_register_delay_ms(mut self, delay_ms: u64) -> Self {
        self.register_delay_ms = delay_ms;
        self
    }

    /// Make the mock gateway fail its first N completion calls (fluent API)
    pub fn with_flaky_failures(mut self, failures: u32) -> Self {
        self.flaky_failures = failures;
        self
    }
}

#[async_trait::async_trait]
impl RoleLauncher for MockStackLauncher {
    async fn launch(
        &self,
        role: Role,
        port: u16,
        upstream_port: Option<u16>,
    ) -> HarnessResult<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--role")
            .arg(role.to_string())
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--model")
            .arg(&self.model_id);

        match role {
            Role::Controller => {}
            Role::Worker => {
                let controller_port = require_upstream(role, upstream_port)?;
                cmd.arg("--controller-port").arg(controller_port.to_string());
                if self.register_delay_ms > 0 {
                    cmd.arg("--register-delay-ms")
                        .arg(self.register_delay_ms.to_string());
                }
            }
            Role::Gateway => {
                let controller_port = require_upstream(role, upstream_port)?;
                cmd.arg("--controller-port").arg(controller_port.to_string());
                if self.flaky_failures > 0 {
                    cmd.arg("--flaky").arg(self.flaky_failures.to_string());
                }
            }
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| HarnessError::Launch {
            role,
            message: format!("failed to spawn {}: {e}", self.program.display()),
        })?;

        process_debug!(
            ProcessId::current(),
            "🎭 Spawned mock {} (PID: {}) on port {}",
            role,
            child.id().unwrap_or(0),
            port
        );
        Ok(child)
    }
}

fn require_upstream(role: Role, upstream_port: Option<u16>) -> HarnessResult<u16> {
    upstream_port.ok_or_else(|| HarnessError::Launch {
        role,
        message: "upstream controller port is required".to_string(),
    })
}

/// Resolve a binary that lives next to the current executable
fn sibling_binary(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn worker_command_requires_controller_port() {
        let launcher = FastChatLauncher::new("127.0.0.1", "vicuna-7b");
        let err = launcher.command_for(Role::Worker, 21002, None).unwrap_err();
        assert_matches!(err, HarnessError::Launch { role: Role::Worker, .. });
    }

    #[test]
    fn controller_command_carries_port_argument() {
        let launcher = FastChatLauncher::new("127.0.0.1", "vicuna-7b");
        let cmd = launcher.command_for(Role::Controller, 21001, None).unwrap();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"fastchat.serve.controller".to_string()));
        assert!(args.contains(&"21001".to_string()));
    }

    #[tokio::test]
    async fn missing_mockstack_binary_is_a_launch_error() {
        let launcher = MockStackLauncher::new("127.0.0.1", "mock-model")
            .with_program(PathBuf::from("/nonexistent/mockstack"));
        let err = launcher
            .launch(Role::Controller, 21001, None)
            .await
            .unwrap_err();
        assert_matches!(err, HarnessError::Launch { role: Role::Controller, .. });
    }
}
