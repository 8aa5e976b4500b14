//! Remote listening-port discovery, negotiation, and process kill helpers
//!
//! Listener state comes from parsing `ss -ltnp` output on the device. Port
//! negotiation is inherently racy against processes outside our control;
//! every check re-reads the live socket table.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use el_core::error::RemoteError;
use el_core::remote::RemoteExec;
use el_core::shell::quote;
use tokio_util::sync::CancellationToken;

use crate::fsops::LogFn;

/// Pause between graceful and forceful kill signals
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Ports scanned above the desired one before giving up
pub(crate) const PORT_SCAN_LIMIT: u16 = 20;

/// Lines of the remote process log captured for diagnostics
const LOG_TAIL_LINES: u32 = 50;

const EXEC_TIMEOUT: Duration = Duration::from_secs(15);

static PROCESS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\(\("([^"]+)""#).expect("PROCESS_NAME is a valid pattern"));

static PROCESS_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid=(\d+)").expect("PROCESS_PID is a valid pattern"));

/// One listening socket on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListenerEntry {
    pub addr: String,
    pub port: u16,
    pub process: Option<String>,
    pub pid: Option<u32>,
}

impl ListenerEntry {
    pub fn is_loopback(&self) -> bool {
        self.addr.starts_with("127.") || self.addr == "::1" || self.addr == "[::1]"
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.addr.as_str(), "*" | "0.0.0.0" | "[::]" | "::")
    }
}

/// Parse `ss -ltnp` output. Header lines and anything unparsable are skipped;
/// process name/pid columns are optional (hidden for other users' sockets).
pub(crate) fn parse_listeners(output: &str) -> Vec<ListenerEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let state = match fields.next() {
            Some(s) => s,
            None => continue,
        };
        if state != "LISTEN" {
            continue;
        }
        // State Recv-Q Send-Q Local:Port Peer:Port [Process]
        let local = match fields.nth(2) {
            Some(l) => l,
            None => continue,
        };
        let Some((addr, port)) = local.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        let process = PROCESS_NAME
            .captures(line)
            .map(|c| c[1].to_string());
        let pid = PROCESS_PID
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok());
        entries.push(ListenerEntry {
            addr: addr.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            process,
            pid,
        });
    }
    entries
}

/// Read the device's full listening-socket table.
pub(crate) async fn all_listeners(
    remote: &dyn RemoteExec,
) -> Result<Vec<ListenerEntry>, RemoteError> {
    let out = remote
        .run("ss -ltnp 2>/dev/null", false, Some(EXEC_TIMEOUT))
        .await?;
    Ok(parse_listeners(&out.stdout))
}

/// Listeners currently bound to one port.
pub(crate) async fn listeners_on(
    remote: &dyn RemoteExec,
    port: u16,
) -> Result<Vec<ListenerEntry>, RemoteError> {
    Ok(all_listeners(remote)
        .await?
        .into_iter()
        .filter(|e| e.port == port)
        .collect())
}

/// Address the tunnel should forward to, given how the process bound itself.
/// Loopback and wildcard binds are reachable via the device's loopback; a
/// specific address is used verbatim.
pub(crate) fn forward_target(entries: &[ListenerEntry]) -> String {
    for entry in entries {
        if entry.is_loopback() || entry.is_wildcard() {
            return "127.0.0.1".to_string();
        }
    }
    entries
        .first()
        .map(|e| e.addr.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Kill one process: graceful signal, elevated retry on nonzero exit, then a
/// forceful signal after a short grace period if it is still alive.
pub(crate) async fn kill_process(remote: &dyn RemoteExec, pid: u32, log: LogFn<'_>) {
    let kill = format!("kill {}", pid);
    match remote.run(&kill, false, Some(EXEC_TIMEOUT)).await {
        Ok(out) if out.success() => {}
        _ => {
            let _ = remote.run(&kill, true, Some(EXEC_TIMEOUT)).await;
        }
    }

    tokio::time::sleep(KILL_GRACE).await;

    let alive = matches!(
        remote
            .run(&format!("kill -0 {}", pid), false, Some(EXEC_TIMEOUT))
            .await,
        Ok(out) if out.success()
    );
    if alive {
        let force = format!("kill -9 {}", pid);
        match remote.run(&force, false, Some(EXEC_TIMEOUT)).await {
            Ok(out) if out.success() => {}
            _ => {
                let _ = remote.run(&force, true, Some(EXEC_TIMEOUT)).await;
            }
        }
        log(&format!("process {} required a forceful kill", pid));
    }
}

/// Kill every listener on a port. Returns whether any pid was targeted.
pub(crate) async fn kill_listeners(remote: &dyn RemoteExec, port: u16, log: LogFn<'_>) -> bool {
    let entries = match listeners_on(remote, port).await {
        Ok(entries) => entries,
        Err(e) => {
            log(&format!("warn: could not inspect port {}: {}", port, e));
            return false;
        }
    };
    let pids: Vec<u32> = entries.iter().filter_map(|e| e.pid).collect();
    if pids.is_empty() {
        return false;
    }
    for pid in &pids {
        kill_process(remote, *pid, log).await;
    }
    true
}

/// Kill by pattern match on the command line; the slow-path fallback when
/// neither a pid nor a port is known.
pub(crate) async fn kill_by_pattern(remote: &dyn RemoteExec, pattern: &str, log: LogFn<'_>) {
    let command = format!("pkill -f {}", quote(pattern));
    match remote.run(&command, false, Some(EXEC_TIMEOUT)).await {
        Ok(out) if out.exit_code <= 1 => {}
        _ => {
            let _ = remote.run(&command, true, Some(EXEC_TIMEOUT)).await;
        }
    }
    log(&format!("stopped processes matching '{}'", pattern));
}

/// Negotiate a listening port for the workload.
///
/// The desired port is used if free; a busy port is reclaimed by killing its
/// listeners; failing that, the first free port strictly above the desired
/// one is chosen within a bounded scan. `None` means exhaustion.
pub(crate) async fn negotiate_port(
    remote: &dyn RemoteExec,
    desired: u16,
    log: LogFn<'_>,
) -> Option<u16> {
    match listeners_on(remote, desired).await {
        Ok(entries) if entries.is_empty() => return Some(desired),
        Ok(entries) => {
            log(&format!(
                "port {} is busy ({} listener(s)), trying to free it",
                desired,
                entries.len()
            ));
            kill_listeners(remote, desired, log).await;
            match listeners_on(remote, desired).await {
                Ok(entries) if entries.is_empty() => {
                    log(&format!("port {} reclaimed", desired));
                    return Some(desired);
                }
                Ok(_) => log(&format!("port {} could not be freed", desired)),
                Err(e) => {
                    log(&format!("warn: could not re-check port {}: {}", desired, e));
                    return None;
                }
            }
        }
        Err(e) => {
            log(&format!("warn: could not inspect port {}: {}", desired, e));
            return None;
        }
    }

    for offset in 1..=PORT_SCAN_LIMIT {
        let Some(candidate) = desired.checked_add(offset) else {
            break;
        };
        match listeners_on(remote, candidate).await {
            Ok(entries) if entries.is_empty() => {
                log(&format!("using fallback port {}", candidate));
                return Some(candidate);
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

/// Wait for the workload to start listening: on the negotiated port, or on
/// any port newly bound by a process matching `ident` or `pid`. Returns the
/// detected port.
pub(crate) async fn wait_for_listen(
    remote: &dyn RemoteExec,
    port: u16,
    ident: &str,
    pid: Option<u32>,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Ok(entries) = all_listeners(remote).await {
            if entries.iter().any(|e| e.port == port) {
                return Some(port);
            }
            if let Some(entry) = entries.iter().find(|e| {
                (pid.is_some() && e.pid == pid)
                    || e.process
                        .as_deref()
                        .is_some_and(|p| p == ident || (!p.is_empty() && ident.starts_with(p)))
            }) {
                return Some(entry.port);
            }
        }
        if tokio::time::Instant::now() + interval > deadline {
            return None;
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Owner pid of a port's first listener, for post-launch pid recovery.
pub(crate) async fn port_owner(remote: &dyn RemoteExec, port: u16) -> Option<u32> {
    listeners_on(remote, port)
        .await
        .ok()?
        .into_iter()
        .find_map(|e| e.pid)
}

/// Capture a tail of the workload's own log file into the run log.
pub(crate) async fn tail_log(remote: &dyn RemoteExec, remote_dir: &str, log: LogFn<'_>) {
    let command = format!(
        "tail -n {} {}/run.log 2>/dev/null",
        LOG_TAIL_LINES,
        quote(remote_dir)
    );
    match remote.run(&command, false, Some(EXEC_TIMEOUT)).await {
        Ok(out) if !out.stdout.trim().is_empty() => {
            log("--- remote log tail ---");
            for line in out.stdout.lines() {
                log(line);
            }
            log("--- end remote log tail ---");
        }
        _ => log("no remote log output captured"),
    }
}
