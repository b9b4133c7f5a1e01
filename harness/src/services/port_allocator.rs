//! Port arbitration and stale-occupant reclaim
//!
//! Probing is done by attempting a TCP connect, the same check the rest of
//! the stack relies on: a port is free when nothing accepts on it. Owner
//! attribution never matches by process name alone; a process is only
//! considered ours when its command line carries both one of the configured
//! signature markers and the port it was launched with.

use crate::error::{HarnessError, HarnessResult};
use shared::{process_debug, process_warn, ProcessId};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// A live process positively attributed to this system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub cmdline: String,
}

pub struct PortAllocator {
    host: String,
    signature_markers: Vec<String>,
    grace_period: Duration,
}

impl PortAllocator {
    pub fn new(
        host: impl Into<String>,
        signature_markers: Vec<String>,
        grace_period: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            signature_markers,
            grace_period,
        }
    }

    fn probe_addr(&self, port: u16) -> Option<SocketAddr> {
        (self.host.as_str(), port)
            .to_socket_addrs()
            .ok()?
            .next()
    }

    /// Check whether a port is free on the configured host. An
    /// unresolvable host reports every port as busy rather than
    /// claiming free ports it never probed.
    pub fn is_port_free(&self, port: u16) -> bool {
        match self.probe_addr(port) {
            Some(addr) => TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_err(),
            None => false,
        }
    }

    /// Probe `preferred`, then scan forward up to `scan_range` ports for the
    /// first unbound one
    pub fn find_free_port(&self, preferred: u16, scan_range: u16) -> HarnessResult<u16> {
        self.find_free_port_excluding(preferred, scan_range, &[])
    }

    /// Like [`find_free_port`](Self::find_free_port), skipping ports the
    /// caller has already handed out during the current startup attempt
    pub fn find_free_port_excluding(
        &self,
        preferred: u16,
        scan_range: u16,
        excluded: &[u16],
    ) -> HarnessResult<u16> {
        for offset in 0..=scan_range {
            let Some(port) = preferred.checked_add(offset) else {
                break;
            };
            if excluded.contains(&port) {
                continue;
            }
            if self.is_port_free(port) {
                return Ok(port);
            }
        }
        Err(HarnessError::NoFreePort {
            start: preferred,
            scanned: scan_range,
        })
    }

    /// Find the process bound to `port`, but only if it can be positively
    /// attributed to this system: its command line must contain one of the
    /// signature markers AND the port it was launched with.
    pub fn owner_of(&self, port: u16) -> Option<PortOwner> {
        let mut system = System::new();
        // The default process refresh skips command lines; ask for them
        // explicitly or every process shows an empty cmd
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

        let own_pid = std::process::id();
        let port_value = port.to_string();

        for (pid, process) in system.processes() {
            if pid.as_u32() == own_pid {
                continue;
            }
            let cmd = process.cmd();
            if cmd.is_empty() {
                continue;
            }
            let signed = cmd.iter().any(|arg| {
                self.signature_markers
                    .iter()
                    .any(|marker| arg.contains(marker.as_str()))
            });
            // Exact token match: `--port 21001` must not claim port 2100
            let owns_port = cmd.iter().enumerate().any(|(i, arg)| {
                if let Some(value) = arg.strip_prefix("--port=") {
                    value == port_value
                } else if arg.as_str() == "--port" {
                    cmd.get(i + 1).map(String::as_str) == Some(port_value.as_str())
                } else {
                    false
                }
            });
            if signed && owns_port {
                return Some(PortOwner {
                    pid: pid.as_u32(),
                    cmdline: cmd.join(" "),
                });
            }
        }
        None
    }

    /// Clear a stale occupant left by a previous run of this system.
    ///
    /// Sends SIGTERM, waits up to the grace period, escalates to SIGKILL,
    /// and reports whether the port is free afterwards. A busy port whose
    /// occupant cannot be attributed to this system is never touched.
    pub async fn reclaim(&self, port: u16) -> HarnessResult<bool> {
        if self.is_port_free(port) {
            return Ok(true);
        }

        let Some(owner) = self.owner_of(port) else {
            return Err(HarnessError::PortReclaim {
                port,
                reason: "occupant cannot be attributed to this system".to_string(),
            });
        };

        process_warn!(
            ProcessId::current(),
            "♻️ Reclaiming port {} from stale process {} ({})",
            port,
            owner.pid,
            owner.cmdline
        );

        self.terminate_gracefully(port, owner.pid).await?;
        Ok(self.is_port_free(port))
    }

    /// SIGTERM first, bounded grace wait, then SIGKILL
    #[cfg(unix)]
    async fn terminate_gracefully(&self, port: u16, pid: u32) -> HarnessResult<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(pid as i32);

        match signal::kill(nix_pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(HarnessError::PortReclaim {
                    port,
                    reason: format!("failed to signal process {pid}: {e}"),
                });
            }
        }

        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < self.grace_period {
            if !process_exists(nix_pid) {
                process_debug!(
                    ProcessId::current(),
                    "✅ Stale process {} terminated gracefully",
                    pid
                );
                return Ok(());
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }

        process_warn!(
            ProcessId::current(),
            "🔨 Stale process {} ignored SIGTERM, escalating to SIGKILL",
            pid
        );
        let _ = signal::kill(nix_pid, Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(200)).await;

        if process_exists(nix_pid) {
            return Err(HarnessError::PortReclaim {
                port,
                reason: format!("process {pid} still alive after SIGKILL"),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn terminate_gracefully(&self, port: u16, _pid: u32) -> HarnessResult<()> {
        Err(HarnessError::PortReclaim {
            port,
            reason: "reclaim is not supported on this platform".to_string(),
        })
    }
}

#[cfg(unix)]
fn process_exists(pid: nix::unistd::Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::TcpListener;

    fn allocator() -> PortAllocator {
        PortAllocator::new(
            "127.0.0.1",
            vec!["mockstack".to_string()],
            Duration::from_secs(1),
        )
    }

    fn hold_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn detects_occupied_port() {
        let allocator = allocator();
        let (_listener, port) = hold_port();
        assert!(!allocator.is_port_free(port));
    }

    #[test]
    fn preferred_port_returned_when_free() {
        let allocator = allocator();
        // Bind ephemeral, remember the port, release it - most likely free
        let port = {
            let (_listener, port) = hold_port();
            port
        };
        assert_eq!(allocator.find_free_port(port, 10).unwrap(), port);
    }

    #[test]
    fn scans_past_occupied_preferred() {
        let allocator = allocator();
        let (_listener, port) = hold_port();
        let found = allocator.find_free_port(port, 20).unwrap();
        assert_ne!(found, port);
        assert!(found > port && found <= port + 20);
    }

    #[test]
    fn exhausted_scan_range_errors() {
        let allocator = allocator();
        let (_listener, port) = hold_port();
        let err = allocator.find_free_port(port, 0).unwrap_err();
        assert_matches!(err, HarnessError::NoFreePort { start, scanned: 0 } if start == port);
    }

    #[test]
    fn excluded_ports_are_skipped_during_the_scan() {
        let allocator = allocator();
        let port = {
            let (_listener, port) = hold_port();
            port
        };
        // The preferred port is free, but the caller already handed it out
        let found = allocator
            .find_free_port_excluding(port, 20, &[port, port + 1])
            .unwrap();
        assert!(found > port + 1);
    }

    /// A process whose command line carries a signature marker and the
    /// exact `--port` token is attributed; a numeric prefix of that port
    /// is not.
    #[cfg(unix)]
    #[test]
    fn attributes_by_marker_and_exact_port_token() {
        let allocator = allocator();
        let port = {
            let (_listener, port) = hold_port();
            port
        };
        let port_arg = port.to_string();

        // sh keeps its positional parameters in argv, so this decoy's
        // command line reads `sh -c "sleep 5" mockstack --port <port>`
        let mut decoy = std::process::Command::new("sh")
            .args(["-c", "sleep 5", "mockstack", "--port", &port_arg])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));

        let owner = allocator.owner_of(port).unwrap();
        assert_eq!(owner.pid, decoy.id());
        assert!(owner.cmdline.contains("mockstack"));

        let prefix = port / 10;
        assert_ne!(allocator.owner_of(prefix).map(|o| o.pid), Some(decoy.id()));

        decoy.kill().ok();
        decoy.wait().ok();
    }

    #[test]
    fn unrelated_occupant_is_not_attributed() {
        let allocator = allocator();
        let (_listener, port) = hold_port();
        // The test process holds the port but carries no signature marker
        assert_eq!(allocator.owner_of(port), None);
    }

    #[tokio::test]
    async fn reclaim_refuses_unattributed_occupant() {
        let allocator = allocator();
        let (_listener, port) = hold_port();
        let err = allocator.reclaim(port).await.unwrap_err();
        assert_matches!(err, HarnessError::PortReclaim { port: p, .. } if p == port);
    }

    #[tokio::test]
    async fn reclaim_of_free_port_is_trivially_true() {
        let allocator = allocator();
        let port = {
            let (_listener, port) = hold_port();
            port
        };
        assert!(allocator.reclaim(port).await.unwrap());
    }
}
