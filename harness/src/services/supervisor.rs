//! Stack supervisor: lifecycle of the three-stage backend chain
//!
//! Startup order is always CONTROLLER -> WORKER -> GATEWAY and shutdown is
//! the exact reverse, because downstream stages depend on upstream ones
//! staying alive through their own shutdown. Readiness is verified
//! transitively - a process can be alive yet not serviceable, so each role
//! is polled against its status endpoint and the worker must additionally
//! appear in the controller's registry before the gateway counts as ready.

use crate::config::StackConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::services::port_allocator::PortAllocator;
use crate::traits::RoleLauncher;
use shared::{
    process_debug, process_info, process_warn, EndpointHandle, PortBinding, ProcessId, Role,
    StackPorts, StackState,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Short timeout for individual readiness/health probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One launched role: its port binding and the owned child process
struct RoleProcess {
    binding: PortBinding,
    child: Child,
}

/// Explicit registry of launched processes, owned exclusively by one
/// supervisor instance. Entries are kept in launch order so teardown can
/// walk them in reverse.
#[derive(Default)]
struct ProcessRegistry {
    entries: Vec<RoleProcess>,
}

impl ProcessRegistry {
    fn insert(&mut self, entry: RoleProcess) {
        self.entries.push(entry);
    }

    fn drain_reversed(&mut self) -> Vec<RoleProcess> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }

    fn port_of(&self, role: Role) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.binding.role == role)
            .map(|e| e.binding.port)
    }
}

pub struct StackSupervisor {
    config: StackConfig,
    launcher: Arc<dyn RoleLauncher>,
    ports: PortAllocator,
    http: reqwest::Client,
    state: Mutex<StackState>,
    registry: Mutex<ProcessRegistry>,
}

impl StackSupervisor {
    pub fn new(config: StackConfig, launcher: Arc<dyn RoleLauncher>) -> Self {
        let ports = PortAllocator::new(
            config.host.clone(),
            config.signature_markers.clone(),
            config.grace_period,
        );
        Self {
            config,
            launcher,
            ports,
            http: reqwest::Client::new(),
            state: Mutex::new(StackState::Stopped),
            registry: Mutex::new(ProcessRegistry::default()),
        }
    }

    pub async fn state(&self) -> StackState {
        *self.state.lock().await
    }

    /// Ports of the currently tracked stack, once all three roles are up
    pub async fn ports(&self) -> Option<StackPorts> {
        let registry = self.registry.lock().await;
        Some(StackPorts {
            controller: registry.port_of(Role::Controller)?,
            worker: registry.port_of(Role::Worker)?,
            gateway: registry.port_of(Role::Gateway)?,
        })
    }

    /// Current port bindings with PIDs, in launch order
    pub async fn bindings(&self) -> Vec<PortBinding> {
        self.registry
            .lock()
            .await
            .entries
            .iter()
            .map(|e| e.binding)
            .collect()
    }

    /// Bring the whole chain up and return the gateway endpoint handle.
    ///
    /// Valid only from STOPPED or DEGRADED. Any failure tears down every
    /// process launched during this attempt - no partial stack is left
    /// running.
    pub async fn start(&self, cancel: &CancellationToken) -> HarnessResult<EndpointHandle> {
        self.config.validate()?;
        {
            let mut state = self.state.lock().await;
            match *state {
                StackState::Stopped | StackState::Degraded => *state = StackState::Starting,
                other => {
                    return Err(HarnessError::Config {
                        field: format!("start() is not valid from state {other}"),
                    });
                }
            }
        }

        // A restart from DEGRADED relaunches from scratch
        self.teardown_all().await;

        let mut assigned: HashMap<Role, u16> = HashMap::new();
        for role in Role::STARTUP_ORDER {
            if let Err(e) = self.bring_up_role(role, &mut assigned, cancel).await {
                process_warn!(
                    ProcessId::current(),
                    "⚠️ Startup failed at {}: {} - rolling back",
                    role,
                    e
                );
                self.teardown_all().await;
                *self.state.lock().await = StackState::Stopped;
                return Err(e);
            }
        }

        let ports = StackPorts {
            controller: assigned_port(&assigned, Role::Controller)?,
            worker: assigned_port(&assigned, Role::Worker)?,
            gateway: assigned_port(&assigned, Role::Gateway)?,
        };
        let handle = match EndpointHandle::for_gateway(&self.config.host, ports.gateway) {
            Ok(handle) => handle,
            Err(e) => {
                self.teardown_all().await;
                *self.state.lock().await = StackState::Stopped;
                return Err(e.into());
            }
        };

        *self.state.lock().await = StackState::Ready;
        process_info!(
            ProcessId::current(),
            "✅ Stack ready: controller={} worker={} gateway={}",
            ports.controller,
            ports.worker,
            ports.gateway
        );
        Ok(handle)
    }

    /// Non-blocking diagnostic: probes every role and reports the state
    /// without throwing. A failure flips READY to DEGRADED; the caller
    /// decides whether to restart.
    pub async fn health_check(&self) -> StackState {
        let current = *self.state.lock().await;
        if !matches!(current, StackState::Ready | StackState::Degraded) {
            return current;
        }

        let mut healthy = true;
        {
            let mut registry = self.registry.lock().await;
            if registry.entries.len() != Role::STARTUP_ORDER.len() {
                healthy = false;
            }
            for entry in registry.entries.iter_mut() {
                if !matches!(entry.child.try_wait(), Ok(None)) {
                    process_warn!(
                        ProcessId::current(),
                        "💀 {} process has exited",
                        entry.binding.role
                    );
                    healthy = false;
                }
            }
        }

        if healthy {
            if let Some(ports) = self.ports().await {
                for role in Role::STARTUP_ORDER {
                    let upstream = role.upstream().map(|r| ports.port_for(r));
                    if !self.probe_role(role, ports.port_for(role), upstream).await {
                        process_warn!(
                            ProcessId::current(),
                            "💔 {} failed its readiness probe",
                            role
                        );
                        healthy = false;
                        break;
                    }
                }
            } else {
                healthy = false;
            }
        }

        let mut state = self.state.lock().await;
        if !healthy && *state == StackState::Ready {
            *state = StackState::Degraded;
        }
        *state
    }

    /// Graceful teardown in reverse launch order. Idempotent: stopping an
    /// already-stopped stack is a no-op. Always reaches STOPPED, escalating
    /// to SIGKILL for any stage that ignores the grace period.
    pub async fn stop(&self) -> HarnessResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state == StackState::Stopped {
                return Ok(());
            }
            *state = StackState::Stopping;
        }

        self.teardown_all().await;
        *self.state.lock().await = StackState::Stopped;
        process_info!(ProcessId::current(), "🛑 Stack stopped");
        Ok(())
    }

    /// Recovery path for a degraded stack: relaunch everything. From READY
    /// this stops first; from DEGRADED or STOPPED it starts directly.
    pub async fn restart(&self, cancel: &CancellationToken) -> HarnessResult<EndpointHandle> {
        process_info!(ProcessId::current(), "🔄 Restarting stack");
        if self.state().await == StackState::Ready {
            self.stop().await?;
        }
        self.start(cancel).await
    }

    async fn bring_up_role(
        &self,
        role: Role,
        assigned: &mut HashMap<Role, u16>,
        cancel: &CancellationToken,
    ) -> HarnessResult<()> {
        let port = self.allocate_port(role, assigned).await?;
        let upstream = role.upstream().and_then(|r| assigned.get(&r).copied());

        let child = self.launch_with_retry(role, port, upstream, cancel).await?;
        let pid = child.id();
        self.registry.lock().await.insert(RoleProcess {
            binding: PortBinding { role, port, pid },
            child,
        });

        self.wait_ready(role, port, upstream, cancel).await?;
        assigned.insert(role, port);
        process_info!(ProcessId::current(), "🟢 {} ready on port {}", role, port);
        Ok(())
    }

    /// Assign a port for a role: prefer the configured port, reclaim it
    /// from an attributed stale occupant, and fail (or scan, when allowed)
    /// on an unattributable conflict. Ports handed to earlier roles during
    /// this startup attempt are off limits - they hold processes of the
    /// run in progress, not stale occupants.
    async fn allocate_port(
        &self,
        role: Role,
        assigned: &HashMap<Role, u16>,
    ) -> HarnessResult<u16> {
        let preferred = self.config.preferred_ports.port_for(role);
        let taken: Vec<u16> = assigned.values().copied().collect();

        if taken.contains(&preferred) {
            if self.config.scan_on_conflict {
                return self
                    .ports
                    .find_free_port_excluding(preferred, self.config.scan_range, &taken);
            }
            return Err(HarnessError::PortReclaim {
                port: preferred,
                reason: format!("port for {role} was already assigned to another role this run"),
            });
        }

        if self.ports.is_port_free(preferred) {
            return Ok(preferred);
        }

        if self.ports.owner_of(preferred).is_some() {
            if self.ports.reclaim(preferred).await? {
                return Ok(preferred);
            }
            return Err(HarnessError::PortReclaim {
                port: preferred,
                reason: "stale occupant survived termination".to_string(),
            });
        }

        if self.config.scan_on_conflict {
            process_warn!(
                ProcessId::current(),
                "⚠️ Port {} for {} is held by an unrelated process, scanning forward",
                preferred,
                role
            );
            return self
                .ports
                .find_free_port_excluding(preferred, self.config.scan_range, &taken);
        }

        Err(HarnessError::PortReclaim {
            port: preferred,
            reason: format!("port for {role} is occupied by a process not attributable to this system"),
        })
    }

    async fn launch_with_retry(
        &self,
        role: Role,
        port: u16,
        upstream: Option<u16>,
        cancel: &CancellationToken,
    ) -> HarnessResult<Child> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.launcher.launch(role, port, upstream).await {
                Ok(child) => return Ok(child),
                Err(e) if attempt < self.config.launch_attempts => {
                    process_warn!(
                        ProcessId::current(),
                        "⚠️ Launch attempt {} for {} failed: {}",
                        attempt,
                        role,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                        _ = tokio::time::sleep(self.config.launch_retry_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll a role's readiness probe until it answers or the bound expires.
    /// Cancellation aborts the wait immediately.
    async fn wait_ready(
        &self,
        role: Role,
        port: u16,
        upstream: Option<u16>,
        cancel: &CancellationToken,
    ) -> HarnessResult<()> {
        let deadline = Instant::now() + self.config.readiness_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }

            // A role that died during startup will never become ready
            if let Some(status) = self.exited_status(role).await {
                return Err(HarnessError::Launch {
                    role,
                    message: format!("exited during startup ({status})"),
                });
            }

            if self.probe_role(role, port, upstream).await {
                return Ok(());
            }

            if Instant::now() + self.config.poll_interval >= deadline {
                return Err(HarnessError::StartupTimeout {
                    role,
                    waited: self.config.readiness_timeout,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn exited_status(&self, role: Role) -> Option<String> {
        let mut registry = self.registry.lock().await;
        let entry = registry
            .entries
            .iter_mut()
            .find(|e| e.binding.role == role)?;
        match entry.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }

    /// Role-specific readiness: each role must answer its status query, and
    /// the worker and gateway additionally require the controller to report
    /// at least one registered worker.
    async fn probe_role(&self, role: Role, port: u16, upstream: Option<u16>) -> bool {
        let host = &self.config.host;
        match role {
            Role::Controller => {
                self.http_ok(true, &format!("http://{host}:{port}/list_models"))
                    .await
            }
            Role::Worker => {
                self.http_ok(true, &format!("http://{host}:{port}/worker_get_status"))
                    .await
                    && self.registered_with_controller(upstream).await
            }
            Role::Gateway => {
                self.http_ok(false, &format!("http://{host}:{port}/v1/models"))
                    .await
                    && self.registered_with_controller(upstream).await
            }
        }
    }

    async fn http_ok(&self, post: bool, url: &str) -> bool {
        let request = if post {
            self.http.post(url)
        } else {
            self.http.get(url)
        };
        matches!(
            request.timeout(PROBE_TIMEOUT).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    /// Ask the controller's registry whether any worker is registered
    async fn registered_with_controller(&self, controller_port: Option<u16>) -> bool {
        let Some(port) = controller_port else {
            return false;
        };
        let url = format!("http://{}:{}/list_models", self.config.host, port);
        match self.http.post(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body
                        .get("models")
                        .and_then(|m| m.as_array())
                        .map(|models| !models.is_empty())
                        .unwrap_or(false),
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    async fn teardown_all(&self) {
        let entries = self.registry.lock().await.drain_reversed();
        for mut entry in entries {
            self.stop_role(&mut entry).await;
        }
    }

    /// Graceful termination of one role: SIGTERM, bounded grace wait,
    /// SIGKILL escalation. Children are also spawned with kill_on_drop as a
    /// last resort if the supervisor itself goes away.
    async fn stop_role(&self, entry: &mut RoleProcess) {
        let role = entry.binding.role;

        #[cfg(unix)]
        if let Some(pid) = entry.child.id() {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(self.config.grace_period, entry.child.wait()).await {
            Ok(Ok(status)) => {
                process_debug!(ProcessId::current(), "🛑 {} exited ({})", role, status);
            }
            Ok(Err(e)) => {
                process_warn!(ProcessId::current(), "⚠️ Error reaping {}: {}", role, e);
            }
            Err(_) => {
                process_warn!(
                    ProcessId::current(),
                    "🔨 {} ignored SIGTERM, force killing",
                    role
                );
                let _ = entry.child.kill().await;
            }
        }
    }
}

fn assigned_port(assigned: &HashMap<Role, u16>, role: Role) -> HarnessResult<u16> {
    assigned
        .get(&role)
        .copied()
        .ok_or_else(|| HarnessError::Config {
            field: format!("no port assigned for {role}"),
        })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::traits::MockRoleLauncher;
    use assert_matches::assert_matches;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::process::Stdio;

    /// Distinct ports that are free at the time of the call
    fn free_ports(n: usize) -> Vec<u16> {
        let listeners: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    fn test_config(ports: &[u16]) -> StackConfig {
        StackConfig::default()
            .with_ports(StackPorts {
                controller: ports[0],
                worker: ports[1],
                gateway: ports[2],
            })
            .with_readiness(Duration::from_millis(100), Duration::from_secs(5))
            .with_grace_period(Duration::from_secs(2))
    }

    /// Stand-in child process; terminates cleanly on SIGTERM
    fn sleeper_child() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    async fn serve_role(role: Role, port: u16) {
        let app = match role {
            Role::Controller => Router::new().route(
                "/list_models",
                post(|| async { Json(serde_json::json!({ "models": ["mock-model"] })) }),
            ),
            Role::Worker => Router::new().route(
                "/worker_get_status",
                post(|| async { Json(serde_json::json!({ "model": "mock-model" })) }),
            ),
            Role::Gateway => Router::new().route(
                "/v1/models",
                get(|| async { Json(serde_json::json!({ "object": "list", "data": [] })) }),
            ),
        };
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        axum::serve(listener, app).await.unwrap();
    }

    /// Launcher whose "processes" answer their readiness probes via
    /// in-process servers
    fn ready_launcher() -> MockRoleLauncher {
        let mut mock = MockRoleLauncher::new();
        mock.expect_launch().returning(|role, port, _upstream| {
            tokio::spawn(serve_role(role, port));
            Ok(sleeper_child())
        });
        mock
    }

    #[tokio::test]
    async fn start_reaches_ready_on_preferred_ports() {
        let ports = free_ports(3);
        let supervisor = StackSupervisor::new(test_config(&ports), Arc::new(ready_launcher()));
        let cancel = CancellationToken::new();

        let handle = supervisor.start(&cancel).await.unwrap();
        assert_eq!(supervisor.state().await, StackState::Ready);

        let bound = supervisor.ports().await.unwrap();
        assert!(bound.are_distinct());
        assert_eq!(bound.controller, ports[0]);
        assert_eq!(bound.worker, ports[1]);
        assert_eq!(bound.gateway, ports[2]);
        assert!(handle
            .base_url
            .as_str()
            .contains(&ports[2].to_string()));

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state().await, StackState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let ports = free_ports(3);
        let supervisor = StackSupervisor::new(test_config(&ports), Arc::new(ready_launcher()));
        let cancel = CancellationToken::new();

        supervisor.start(&cancel).await.unwrap();
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state().await, StackState::Stopped);
    }

    #[tokio::test]
    async fn start_is_rejected_while_ready() {
        let ports = free_ports(3);
        let supervisor = StackSupervisor::new(test_config(&ports), Arc::new(ready_launcher()));
        let cancel = CancellationToken::new();

        supervisor.start(&cancel).await.unwrap();
        let err = supervisor.start(&cancel).await.unwrap_err();
        assert_matches!(err, HarnessError::Config { .. });

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unready_controller_times_out_and_rolls_back() {
        let ports = free_ports(3);
        let config =
            test_config(&ports).with_readiness(Duration::from_millis(50), Duration::from_millis(400));

        // Children launch fine but never answer their probes
        let mut mock = MockRoleLauncher::new();
        mock.expect_launch()
            .returning(|_role, _port, _upstream| Ok(sleeper_child()));

        let supervisor = StackSupervisor::new(config, Arc::new(mock));
        let cancel = CancellationToken::new();

        let err = supervisor.start(&cancel).await.unwrap_err();
        assert_matches!(err, HarnessError::StartupTimeout { role: Role::Controller, .. });
        assert_eq!(supervisor.state().await, StackState::Stopped);
        assert!(supervisor.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_start_and_tears_down() {
        let ports = free_ports(3);
        let mut mock = MockRoleLauncher::new();
        mock.expect_launch()
            .returning(|_role, _port, _upstream| Ok(sleeper_child()));

        let supervisor = StackSupervisor::new(test_config(&ports), Arc::new(mock));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = supervisor.start(&cancel).await.unwrap_err();
        assert_matches!(err, HarnessError::Cancelled);
        assert_eq!(supervisor.state().await, StackState::Stopped);
        assert!(supervisor.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn unattributed_occupant_fails_start_without_rebinding() {
        let ports = free_ports(3);
        // The test process itself squats on the controller's preferred port;
        // it carries no signature marker, so reclaim must refuse
        let _squatter = std::net::TcpListener::bind(("127.0.0.1", ports[0])).unwrap();

        let supervisor =
            StackSupervisor::new(test_config(&ports), Arc::new(MockRoleLauncher::new()));
        let cancel = CancellationToken::new();

        let err = supervisor.start(&cancel).await.unwrap_err();
        assert_matches!(err, HarnessError::PortReclaim { port, .. } if port == ports[0]);
        assert_eq!(supervisor.state().await, StackState::Stopped);
    }

    #[tokio::test]
    async fn health_check_outside_ready_reports_current_state() {
        let ports = free_ports(3);
        let supervisor =
            StackSupervisor::new(test_config(&ports), Arc::new(MockRoleLauncher::new()));
        assert_eq!(supervisor.health_check().await, StackState::Stopped);
    }
}
