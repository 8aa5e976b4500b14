//! Deploy orchestrator: drives one deploy job end to end
//!
//! `PENDING -> UPLOADING -> RUNNING -> {DONE, FAILED, CANCELLED}`. Exit code
//! -1 marks internal failures, -2 marks cancellation; a script's own nonzero
//! exit code is preserved.

use std::sync::Arc;
use std::time::Duration;

use el_core::config::DemoSpec;
use el_core::logbuf::LineBuffer;
use el_core::remote::{ChannelEvent, RemoteExec};
use el_core::shell::quote;
use el_core::types::DeployStatus;

use crate::fetch;
use crate::fsops;
use crate::registry::{DeployJob, Session, SessionRegistry};

const CHMOD_TIMEOUT: Duration = Duration::from_secs(15);
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one deploy job against one session. Never panics the worker; every
/// failure is mapped onto the job's terminal status.
pub async fn run_deploy(
    registry: &SessionRegistry,
    job: &Arc<DeployJob>,
    session: &Arc<Session>,
    demo: &DemoSpec,
) {
    let log = |line: &str| registry.append_job_log(job, line);
    let overrides = session.overrides_for(&demo.id);
    let remote_dir = demo
        .remote_dir(overrides.as_ref())
        .trim_end_matches('/')
        .to_string();
    if remote_dir.is_empty() {
        log("remote directory not configured");
        registry.set_job_status(job, DeployStatus::Failed, Some(-1));
        return;
    }

    let script = match fetch::resolve_script_bytes(&demo.deploy.script).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log(&format!("install script unavailable: {}", e));
            registry.set_job_status(job, DeployStatus::Failed, Some(-1));
            return;
        }
    };
    let remote_script = format!("{}/{}", remote_dir, demo.deploy.remote_script_name);

    registry.set_job_status(job, DeployStatus::Uploading, None);
    let used_elevated = match stage_script(
        session.remote.as_ref(),
        &session.username,
        &remote_dir,
        &remote_script,
        &script,
        demo.deploy.run_as_sudo,
        &log,
    )
    .await
    {
        Ok(used_elevated) => used_elevated,
        Err(e) => {
            log(&format!("upload failed: {}", e));
            registry.set_job_status(job, DeployStatus::Failed, Some(-1));
            return;
        }
    };

    let command = install_command(&remote_dir, &demo.deploy.remote_script_name);
    registry.set_job_status(job, DeployStatus::Running, None);

    let mut channel = match session
        .remote
        .open_stream(&command, demo.deploy.run_as_sudo)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            log(&format!("could not start install script: {}", e));
            registry.set_job_status(job, DeployStatus::Failed, Some(-1));
            return;
        }
    };
    job.set_channel(channel.abort_handle());

    let mut out_buf = LineBuffer::new();
    let mut err_buf = LineBuffer::new();
    let mut exit_code: Option<i32> = None;

    loop {
        tokio::select! {
            _ = job.cancelled() => {
                log("deploy cancelled by user");
                channel.abort_handle().abort();
                registry.set_job_status(job, DeployStatus::Cancelled, Some(-2));
                return;
            }
            event = channel.next_event() => match event {
                Ok(ChannelEvent::Stdout(data)) => {
                    for line in out_buf.feed(&String::from_utf8_lossy(&data)) {
                        log(&line);
                    }
                }
                Ok(ChannelEvent::Stderr(data)) => {
                    for line in err_buf.feed(&String::from_utf8_lossy(&data)) {
                        log(&line);
                    }
                }
                Ok(ChannelEvent::Exit(code)) => exit_code = Some(code),
                Ok(ChannelEvent::Closed) => break,
                Err(e) => {
                    log(&format!("deploy stream error: {}", e));
                    break;
                }
            }
        }
    }

    if let Some(line) = out_buf.flush() {
        log(&line);
    }
    if let Some(line) = err_buf.flush() {
        log(&line);
    }

    // Cancellation always wins over whatever the stream ended with.
    if job.is_cancelled() {
        log("deploy cancelled by user");
        registry.set_job_status(job, DeployStatus::Cancelled, Some(-2));
        return;
    }

    match exit_code {
        Some(0) => {
            finalize_success(registry, job, session, demo, &remote_dir).await;
        }
        Some(code) => {
            registry.set_job_status(job, DeployStatus::Failed, Some(code));
        }
        None => {
            log("install script ended without an exit status");
            registry.set_job_status(job, DeployStatus::Failed, Some(-1));
        }
    }
}

/// Ensure the target directory, upload the script, and mark it executable.
/// Returns whether elevation was used for the upload.
async fn stage_script(
    remote: &dyn RemoteExec,
    username: &str,
    remote_dir: &str,
    remote_script: &str,
    script: &[u8],
    run_as_sudo: bool,
    log: fsops::LogFn<'_>,
) -> Result<bool, el_core::error::RemoteError> {
    fsops::ensure_dir(remote, username, remote_dir, log).await?;
    let used_elevated = fsops::upload_file(remote, script, remote_script, username, log).await?;

    let chmod = format!("chmod +x {}", quote(remote_script));
    let out = remote
        .run(&chmod, run_as_sudo || used_elevated, Some(CHMOD_TIMEOUT))
        .await?;
    if !out.success() {
        return Err(el_core::error::RemoteError::CommandFailed {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(used_elevated)
}

/// Login, non-interactive shell with strict-failure semantics, line-buffered
/// where the device has stdbuf.
fn install_command(remote_dir: &str, script_name: &str) -> String {
    let body = format!(
        "set -euo pipefail; cd {dir}; \
         if command -v stdbuf >/dev/null 2>&1; then stdbuf -oL -eL bash ./{script}; \
         else bash ./{script}; fi",
        dir = quote(remote_dir),
        script = quote(script_name)
    );
    format!("bash -lc {}", quote(&body))
}

async fn finalize_success(
    registry: &SessionRegistry,
    job: &Arc<DeployJob>,
    session: &Arc<Session>,
    demo: &DemoSpec,
    remote_dir: &str,
) {
    let log = |line: &str| registry.append_job_log(job, line);
    let remote = session.remote.as_ref();

    if demo.deploy.run_as_sudo {
        fsops::chown_tree(remote, &session.username, remote_dir, &log).await;
    }
    if let Some(marker) = &demo.deploy.marker_path {
        fsops::write_marker(
            remote,
            marker,
            demo.deploy.version.as_deref(),
            &session.username,
            &log,
        )
        .await;
    }
    session.mark_deployed(&demo.id);
    registry.set_job_status(job, DeployStatus::Done, Some(0));
    tracing::info!("Demo {} deployed on session {}", demo.id, session.id);
}

/// Fast "is it installed" probe: the configured install-check command, else
/// the marker file, else the session's own bookkeeping.
pub async fn check_installed(session: &Session, demo: &DemoSpec) -> bool {
    let command = match (&demo.deploy.install_check, &demo.deploy.marker_path) {
        (Some(check), _) => check.clone(),
        (None, Some(marker)) => format!("test -f {}", quote(marker)),
        (None, None) => return session.is_marked_deployed(&demo.id),
    };
    let installed = matches!(
        session.remote.run(&command, false, Some(CHECK_TIMEOUT)).await,
        Ok(out) if out.success()
    );
    if installed {
        session.mark_deployed(&demo.id);
    }
    installed
}
