//! Run orchestrator: staging, port negotiation, launch, tunnel, health gate
//!
//! `STARTING -> RUNNING -> STOPPED`, with `ERROR` reachable from any step
//! before `RUNNING`. Script and service demos share one code path; they only
//! differ in staging and in the service kind's extra recovery options
//! (listen-port detection, direct-access fallback).

use std::sync::Arc;
use std::time::Duration;

use el_core::config::{DemoKind, DemoSpec, RunConfig};
use el_core::netutil::free_local_port;
use el_core::remote::{RemoteExec, Tunnel};
use el_core::shell::quote;
use el_core::types::{RunInfo, RunStatus};

use crate::fsops::{self, LogFn};
use crate::health;
use crate::ports;
use crate::registry::{RunSession, Session, SessionRegistry};

/// Fixed pause between polling iterations (tunnel retries, port waits)
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bounded number of tunnel establishment attempts
const TUNNEL_ATTEMPTS: u32 = 5;

const EXEC_TIMEOUT: Duration = Duration::from_secs(15);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How the staged workload is invoked
enum Launcher {
    Script {
        interpreter: String,
        payload: String,
    },
    Service {
        binary: String,
    },
}

/// Drive one run session end to end. Every failure before `RUNNING` tears
/// down whatever was started and ends in `ERROR`.
pub async fn run_demo(
    registry: &SessionRegistry,
    run: &Arc<RunSession>,
    session: &Arc<Session>,
    demo: &DemoSpec,
) {
    let log = |line: &str| registry.append_run_log(run, line);
    let remote = session.remote.as_ref();
    let cfg = &demo.run;

    let overrides = session.overrides_for(&demo.id);
    let remote_dir = demo
        .remote_dir(overrides.as_ref())
        .trim_end_matches('/')
        .to_string();
    if remote_dir.is_empty() {
        log("remote directory not configured");
        registry.set_run_status(run, RunStatus::Error, None);
        return;
    }

    run.set_process_ident(cfg.process_identifier());

    if let Err(e) = fsops::ensure_dir(remote, &session.username, &remote_dir, &log).await {
        log(&format!("could not prepare {}: {}", remote_dir, e));
        registry.set_run_status(run, RunStatus::Error, None);
        return;
    }

    // Stage the workload: upload the payload, or discover the installed binary.
    let launcher = match cfg.kind {
        DemoKind::Script => {
            stage_script_payload(remote, &session.username, &remote_dir, cfg, &log).await
        }
        DemoKind::Service => discover_service(remote, &session.username, cfg, &log).await,
    };
    let launcher = match launcher {
        Ok(launcher) => launcher,
        Err(message) => {
            log(&message);
            registry.set_run_status(run, RunStatus::Error, None);
            return;
        }
    };
    if run.cancel_token().is_cancelled() {
        return;
    }

    // Negotiate a listening port.
    let mut port = match ports::negotiate_port(remote, cfg.remote_port, &log).await {
        Some(port) => port,
        None => {
            log(&format!(
                "no usable port found near {} (scanned {} above it)",
                cfg.remote_port,
                ports::PORT_SCAN_LIMIT
            ));
            registry.set_run_status(run, RunStatus::Error, None);
            return;
        }
    };
    run.set_remote_port(port);

    // Launch detached, capturing the printed pid.
    let exec = build_exec(cfg, &remote_dir, &launcher, port);
    let command = launch_command(&remote_dir, &exec);
    log("starting remote workload...");
    let out = match remote.run(&command, false, Some(LAUNCH_TIMEOUT)).await {
        Ok(out) => out,
        Err(e) => {
            log(&format!("launch command failed: {}", e));
            registry.set_run_status(run, RunStatus::Error, None);
            return;
        }
    };
    if !out.success() {
        log(&format!("launch command error: {}", out.stderr.trim()));
        registry.set_run_status(run, RunStatus::Error, None);
        return;
    }
    let pid = parse_pid(&out.stdout);
    match pid {
        Some(pid) => {
            log(&format!("remote pid {}", pid));
            run.set_remote_pid(Some(pid));
        }
        // Service wrappers do not reliably echo a pid; only fatal if the
        // process also never starts listening.
        None => log("warn: could not parse pid from launch output"),
    }

    // Service kind: wait for the process to actually listen somewhere.
    if cfg.kind == DemoKind::Service {
        let ident = run.process_ident();
        match ports::wait_for_listen(
            remote,
            port,
            &ident,
            pid,
            cfg.startup_timeout,
            POLL_INTERVAL,
            run.cancel_token(),
        )
        .await
        {
            Some(detected) => {
                if detected != port {
                    log(&format!("service bound port {} instead of {}", detected, port));
                    port = detected;
                    run.set_remote_port(detected);
                }
            }
            None => {
                if run.cancel_token().is_cancelled() {
                    return;
                }
                log(&format!(
                    "service did not start listening within {:?}",
                    cfg.startup_timeout
                ));
                ports::tail_log(remote, &remote_dir, &log).await;
                kill_remote_process(run, remote, &log).await;
                registry.set_run_status(run, RunStatus::Error, None);
                return;
            }
        }
    }

    // Establish the forwarding tunnel with bounded retries.
    let scheme = cfg.health.scheme.clone();
    let mut tunnel: Option<(Box<dyn Tunnel>, u16)> = None;
    for attempt in 1..=TUNNEL_ATTEMPTS {
        if run.cancel_token().is_cancelled() {
            return;
        }
        let entries = match ports::listeners_on(remote, port).await {
            Ok(entries) => entries,
            Err(_) => Vec::new(),
        };
        if entries.is_empty() {
            log(&format!(
                "port {} not listening yet (attempt {}/{})",
                port, attempt, TUNNEL_ATTEMPTS
            ));
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        let target = ports::forward_target(&entries);
        let local_port = match free_local_port() {
            Ok(port) => port,
            Err(e) => {
                log(&format!("could not allocate a local port: {}", e));
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };
        match session.remote.open_tunnel(&target, port, local_port).await {
            Ok(started) => {
                tunnel = Some((started, local_port));
                break;
            }
            Err(e) => {
                log(&format!(
                    "tunnel attempt {}/{} failed: {}",
                    attempt, TUNNEL_ATTEMPTS, e
                ));
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    let Some((tunnel, local_port)) = tunnel else {
        // Last resort for services: the device may be reachable directly.
        if cfg.kind == DemoKind::Service {
            log("tunnel attempts exhausted, probing direct access");
            if health::probe_direct(&cfg.health, &session.host, port).await {
                let info = RunInfo {
                    remote_host: Some(session.host.clone()),
                    remote_port: Some(port),
                    remote_url: Some(format!("{}://{}:{}", scheme, session.host, port)),
                    scheme: Some(scheme.clone()),
                    ..Default::default()
                };
                log(&format!(
                    "workload reachable directly at {}://{}:{}",
                    scheme, session.host, port
                ));
                registry.set_run_status(run, RunStatus::Running, Some(info));
                return;
            }
        }
        log("could not establish a tunnel to the workload");
        kill_remote_process(run, remote, &log).await;
        registry.set_run_status(run, RunStatus::Error, None);
        return;
    };

    run.set_tunnel(tunnel, local_port);
    log(&format!("tunnel ready: {}://127.0.0.1:{}", scheme, local_port));

    // Health-gate before reporting RUNNING.
    if let Err(detail) = health::wait_healthy(
        &cfg.health,
        "127.0.0.1",
        local_port,
        run.cancel_token(),
    )
    .await
    {
        if run.cancel_token().is_cancelled() {
            return;
        }
        log(&format!("health check failed: {}", detail));
        ports::tail_log(remote, &remote_dir, &log).await;
        kill_remote_process(run, remote, &log).await;
        if let Some(tunnel) = run.take_tunnel() {
            tunnel.stop().await;
        }
        registry.set_run_status(run, RunStatus::Error, None);
        return;
    }

    // Opportunistic pid recovery so stop can use the fast path.
    if run.remote_pid().is_none() {
        match ports::port_owner(remote, port).await {
            Some(pid) => {
                log(&format!("recovered remote pid {}", pid));
                run.set_remote_pid(Some(pid));
            }
            None => log("warn: remote pid unknown; stop will fall back to port/pattern kill"),
        }
    }

    let info = RunInfo {
        remote_host: Some(session.host.clone()),
        remote_port: Some(port),
        remote_url: Some(format!("{}://{}:{}", scheme, session.host, port)),
        local_port: Some(local_port),
        local_url: Some(format!("{}://127.0.0.1:{}", scheme, local_port)),
        scheme: Some(scheme),
    };
    registry.set_run_status(run, RunStatus::Running, Some(info));
    log("workload is running");
}

/// Stop a run: tunnel down, remote process killed, record removed.
pub(crate) async fn stop_run(
    registry: &SessionRegistry,
    run: &Arc<RunSession>,
    session: &Arc<Session>,
) {
    let log = |line: &str| registry.append_run_log(run, line);

    if let Some(tunnel) = run.take_tunnel() {
        tunnel.stop().await;
    }
    kill_remote_process(run, session.remote.as_ref(), &log).await;
    run.clear_runtime();
    registry.set_run_status(run, RunStatus::Stopped, None);
    registry.remove_run_record(&run.id);
    tracing::info!("Run {} stopped", run.id);
}

/// Kill the workload: by pid when known, else by the negotiated port's
/// listeners, else by pattern match on the process identifier.
async fn kill_remote_process(run: &RunSession, remote: &dyn RemoteExec, log: LogFn<'_>) {
    if let Some(pid) = run.remote_pid() {
        ports::kill_process(remote, pid, log).await;
        return;
    }
    if let Some(port) = run.remote_port() {
        if ports::kill_listeners(remote, port, log).await {
            return;
        }
    }
    let ident = run.process_ident();
    if !ident.is_empty() {
        ports::kill_by_pattern(remote, &ident, log).await;
    }
}

/// Script kind: verify the install dir is writable, then upload the payload.
async fn stage_script_payload(
    remote: &dyn RemoteExec,
    username: &str,
    remote_dir: &str,
    cfg: &RunConfig,
    log: LogFn<'_>,
) -> Result<Launcher, String> {
    match remote
        .run(&format!("test -w {}", quote(remote_dir)), false, Some(EXEC_TIMEOUT))
        .await
    {
        Ok(out) if out.success() => {}
        Ok(_) => fsops::chown_tree(remote, username, remote_dir, log).await,
        Err(e) => log(&format!("warn: writability check failed: {}", e)),
    }

    let payload_path = cfg
        .payload
        .as_ref()
        .expect("script kind validated to carry a payload");
    let data = tokio::fs::read(payload_path)
        .await
        .map_err(|_| format!("missing local payload: {}", payload_path.display()))?;
    let file_name = payload_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("invalid payload path: {}", payload_path.display()))?;
    let remote_payload = format!("{}/{}", remote_dir, file_name);

    log(&format!("uploading payload -> {}", remote_payload));
    fsops::upload_file(remote, &data, &remote_payload, username, log)
        .await
        .map_err(|e| format!("payload upload failed: {}", e))?;

    let interpreter = remote_path(
        remote_dir,
        cfg.interpreter
            .as_ref()
            .expect("script kind validated to carry an interpreter"),
    );
    Ok(Launcher::Script {
        interpreter,
        payload: remote_payload,
    })
}

/// Service kind: probe well-known install locations, then fall back to a
/// `PATH` lookup.
async fn discover_service(
    remote: &dyn RemoteExec,
    username: &str,
    cfg: &RunConfig,
    log: LogFn<'_>,
) -> Result<Launcher, String> {
    let binary = cfg
        .binary
        .as_ref()
        .expect("service kind validated to carry a binary");

    let home = match remote
        .run("printf %s \"$HOME\"", false, Some(EXEC_TIMEOUT))
        .await
    {
        Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
            out.stdout.trim().to_string()
        }
        _ => format!("/home/{}", username),
    };

    let mut candidates: Vec<String> = cfg
        .candidate_paths
        .iter()
        .map(|dir| {
            let dir = dir
                .strip_prefix("~")
                .map(|rest| format!("{}{}", home, rest))
                .unwrap_or_else(|| dir.clone());
            format!("{}/{}", dir.trim_end_matches('/'), binary)
        })
        .collect();
    candidates.push(format!("{}/.local/bin/{}", home, binary));
    candidates.push(format!("/usr/local/bin/{}", binary));
    candidates.push(format!("/opt/{0}/{0}", binary));

    for candidate in &candidates {
        if let Ok(out) = remote
            .run(&format!("test -x {}", quote(candidate)), false, Some(EXEC_TIMEOUT))
            .await
        {
            if out.success() {
                log(&format!("found {} at {}", binary, candidate));
                return Ok(Launcher::Service {
                    binary: candidate.clone(),
                });
            }
        }
    }

    if let Ok(out) = remote
        .run(&format!("command -v {}", quote(binary)), false, Some(EXEC_TIMEOUT))
        .await
    {
        if out.success() {
            if let Some(path) = out.stdout.lines().next().map(str::trim) {
                if !path.is_empty() {
                    log(&format!("found {} on PATH at {}", binary, path));
                    return Ok(Launcher::Service {
                        binary: path.to_string(),
                    });
                }
            }
        }
    }

    Err(format!(
        "{} not found on device; demo is not deployed",
        binary
    ))
}

/// Resolve a configured path against the install dir unless it is absolute.
fn remote_path(remote_dir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", remote_dir, path)
    }
}

fn substitute_port(args: &[String], port: u16) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace("{port}", &port.to_string()))
        .collect()
}

/// Build the workload command line for the negotiated port.
fn build_exec(cfg: &RunConfig, remote_dir: &str, launcher: &Launcher, port: u16) -> String {
    let mut parts: Vec<String> = match launcher {
        Launcher::Script {
            interpreter,
            payload,
        } => {
            let camera = &cfg.camera;
            let mut parts = vec![
                quote(interpreter),
                quote(payload),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--camera".to_string(),
                quote(&camera.source),
                "--usb-index".to_string(),
                camera.usb_index.to_string(),
                "--width".to_string(),
                camera.width.to_string(),
                "--height".to_string(),
                camera.height.to_string(),
                "--flip".to_string(),
                camera.flip.to_string(),
            ];
            if let Some(model) = &cfg.model {
                parts.push("--model".to_string());
                parts.push(quote(&remote_path(remote_dir, model)));
            }
            parts
        }
        Launcher::Service { binary } => vec![quote(binary)],
    };
    parts.extend(substitute_port(&cfg.args, port).iter().map(|a| quote(a)));
    parts.join(" ")
}

/// Wrap the workload to run detached from the install dir, output redirected
/// to a remote log file, printing its pid.
fn launch_command(remote_dir: &str, exec: &str) -> String {
    format!(
        "cd {} && nohup {} > run.log 2>&1 & echo $!",
        quote(remote_dir),
        exec
    )
}

/// Pid printed by the launch wrapper; the last non-empty stdout line.
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .next_back()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use el_core::config::CameraConfig;

    fn script_cfg() -> RunConfig {
        toml::from_str::<DemoSpec>(
            r#"
id = "yolo"
name = "YOLO"
[deploy]
remote_dir = "/opt/yolo"
script = { path = "setup.sh" }
[run]
kind = "script"
payload = "payloads/stream_server.py"
interpreter = "yolo11/.venv/bin/python"
model = "yolo11/yolo11n.pt"
remote_port = 8090
"#,
        )
        .unwrap()
        .run
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("12345\n"), Some(12345));
        assert_eq!(parse_pid("starting...\n6789\n"), Some(6789));
        assert_eq!(parse_pid("no pid here\n"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("/opt/demo", "bin/python"), "/opt/demo/bin/python");
        assert_eq!(remote_path("/opt/demo", "/usr/bin/python"), "/usr/bin/python");
    }

    #[test]
    fn test_substitute_port() {
        let args = vec!["--listen".to_string(), "0.0.0.0:{port}".to_string()];
        assert_eq!(substitute_port(&args, 9001), vec!["--listen", "0.0.0.0:9001"]);
    }

    #[test]
    fn test_build_exec_script_kind() {
        let cfg = script_cfg();
        let launcher = Launcher::Script {
            interpreter: "/opt/yolo/yolo11/.venv/bin/python".to_string(),
            payload: "/opt/yolo/stream_server.py".to_string(),
        };
        let exec = build_exec(&cfg, "/opt/yolo", &launcher, 8092);
        assert!(exec.starts_with("/opt/yolo/yolo11/.venv/bin/python /opt/yolo/stream_server.py"));
        assert!(exec.contains("--host 127.0.0.1"));
        assert!(exec.contains("--port 8092"));
        assert!(exec.contains("--camera usb"));
        assert!(exec.contains("--model /opt/yolo/yolo11/yolo11n.pt"));
    }

    #[test]
    fn test_build_exec_service_kind() {
        let mut cfg = script_cfg();
        cfg.kind = DemoKind::Service;
        cfg.args = vec!["--port".to_string(), "{port}".to_string()];
        cfg.camera = CameraConfig::default();
        let launcher = Launcher::Service {
            binary: "/usr/local/bin/inference-server".to_string(),
        };
        let exec = build_exec(&cfg, "/opt/yolo", &launcher, 9005);
        assert_eq!(exec, "/usr/local/bin/inference-server --port 9005");
    }

    #[test]
    fn test_launch_command_is_detached() {
        let cmd = launch_command("/opt/yolo", "python server.py");
        assert_eq!(
            cmd,
            "cd /opt/yolo && nohup python server.py > run.log 2>&1 & echo $!"
        );
    }
}
