//! Deploy orchestrator scenarios against the in-memory remote

mod common;

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use el_core::config::DemoSpec;
use el_core::remote::ChannelEvent;
use el_core::types::DeployStatus;

use common::{setup, wait_until, FakeRemote};

const WAIT: Duration = Duration::from_secs(5);

fn demo_spec(script_path: &Path, marker: Option<&str>, run_as_sudo: bool) -> DemoSpec {
    let marker_line = marker
        .map(|m| format!("marker_path = \"{}\"\n", m))
        .unwrap_or_default();
    toml::from_str(&format!(
        r#"
id = "yolo11"
name = "YOLO11 object detection"

[deploy]
remote_dir = "/opt/yolo"
script = {{ path = "{script}" }}
run_as_sudo = {sudo}
version = "1.2.0"
{marker}
[run]
kind = "script"
payload = "{script}"
interpreter = ".venv/bin/python"
"#,
        script = script_path.display(),
        sudo = run_as_sudo,
        marker = marker_line,
    ))
    .expect("valid demo spec")
}

fn script_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"#!/bin/bash\r\necho installing\r\n").unwrap();
    file
}

#[tokio::test]
async fn deploy_success_marks_demo_deployed() {
    let fake = FakeRemote::new();
    fake.with_state(|s| {
        s.stream_events.push_back(ChannelEvent::Stdout("installing deps\n".into()));
        s.stream_events.push_back(ChannelEvent::Exit(0));
    });
    let (registry, session_id) = setup(&fake).await;
    let script = script_file();
    let demo = demo_spec(script.path(), None, false);

    let job = registry.deploy_demo(&session_id, &demo).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Done, WAIT).await);

    assert_eq!(job.exit_code(), Some(0));
    let session = registry.session(&session_id).unwrap();
    assert!(session.is_marked_deployed("yolo11"));
    assert!(job.log_snapshot().iter().any(|l| l == "installing deps"));

    // Uploaded with CRLF normalized, executable bit set without elevation.
    let uploaded = fake.state.lock().unwrap().files["/opt/yolo/setup.sh"].clone();
    assert_eq!(uploaded, b"#!/bin/bash\necho installing\n");
    let chmod_elevated = fake
        .state
        .lock()
        .unwrap()
        .run_calls
        .iter()
        .find(|(cmd, _)| cmd.starts_with("chmod +x"))
        .map(|(_, elevated)| *elevated);
    assert_eq!(chmod_elevated, Some(false));
}

#[tokio::test]
async fn deploy_falls_back_to_privileged_write() {
    let fake = FakeRemote::new();
    fake.with_state(|s| {
        s.fail_put_file = true;
        s.stream_events.push_back(ChannelEvent::Exit(0));
    });
    let (registry, session_id) = setup(&fake).await;
    let script = script_file();
    let demo = demo_spec(script.path(), None, false);

    let job = registry.deploy_demo(&session_id, &demo).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Done, WAIT).await);

    assert!(job
        .log_snapshot()
        .iter()
        .any(|l| l.contains("falling back to privileged write")));
    let state = fake.state.lock().unwrap();
    assert!(state
        .elevated_writes
        .contains(&"/opt/yolo/setup.sh".to_string()));
    drop(state);
    // The permission step matches the elevated upload.
    let chmod_elevated = fake
        .state
        .lock()
        .unwrap()
        .run_calls
        .iter()
        .find(|(cmd, _)| cmd.starts_with("chmod +x"))
        .map(|(_, elevated)| *elevated);
    assert_eq!(chmod_elevated, Some(true));
}

#[tokio::test]
async fn deploy_preserves_script_exit_code() {
    let fake = FakeRemote::new();
    fake.with_state(|s| {
        s.stream_events.push_back(ChannelEvent::Stderr("pip failed\n".into()));
        s.stream_events.push_back(ChannelEvent::Exit(3));
    });
    let (registry, session_id) = setup(&fake).await;
    let script = script_file();
    let demo = demo_spec(script.path(), None, false);

    let job = registry.deploy_demo(&session_id, &demo).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Failed, WAIT).await);

    assert_eq!(job.exit_code(), Some(3));
    assert!(job.log_snapshot().iter().any(|l| l == "pip failed"));
    let session = registry.session(&session_id).unwrap();
    assert!(!session.is_marked_deployed("yolo11"));
}

#[tokio::test]
async fn deploy_cancel_mid_stream() {
    let fake = FakeRemote::new();
    fake.with_state(|s| {
        s.stream_events.push_back(ChannelEvent::Stdout("step 1\n".into()));
        s.stream_blocks = true;
    });
    let (registry, session_id) = setup(&fake).await;
    let script = script_file();
    let demo = demo_spec(script.path(), None, false);

    let job = registry.deploy_demo(&session_id, &demo).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Running, WAIT).await);

    registry.cancel_deploy_job(&job.id).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Cancelled, WAIT).await);

    assert_eq!(job.exit_code(), Some(-2));
    assert!(job
        .log_snapshot()
        .iter()
        .any(|l| l == "deploy cancelled by user"));
    // The force-close reached the remote channel.
    assert!(fake.stream_aborted());
}

#[tokio::test]
async fn second_deploy_job_evicts_first() {
    let fake = FakeRemote::new();
    let (registry, session_id) = setup(&fake).await;

    let first = registry.create_deploy_job(&session_id, "yolo11").unwrap();
    let second = registry.create_deploy_job(&session_id, "yolo11").unwrap();

    assert!(registry.get_deploy_job(&first.id).is_none());
    let active = registry.active_deploy_job(&session_id, "yolo11").unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(registry.deploy_job_count(), 1);
    // The evicted job was asked to stop.
    assert!(first.is_cancelled());
}

#[tokio::test]
async fn deploy_missing_script_fails_before_any_remote_call() {
    let fake = FakeRemote::new();
    let (registry, session_id) = setup(&fake).await;
    let demo = demo_spec(Path::new("/nonexistent/setup.sh"), None, false);

    let job = registry.deploy_demo(&session_id, &demo).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Failed, WAIT).await);

    assert_eq!(job.exit_code(), Some(-1));
    assert!(job
        .log_snapshot()
        .iter()
        .any(|l| l.contains("install script unavailable")));
    assert!(fake.state.lock().unwrap().run_calls.is_empty());
}

#[tokio::test]
async fn deploy_writes_marker_file() {
    let fake = FakeRemote::new();
    fake.with_state(|s| {
        s.stream_events.push_back(ChannelEvent::Exit(0));
    });
    let (registry, session_id) = setup(&fake).await;
    let script = script_file();
    let demo = demo_spec(script.path(), Some("/opt/yolo/.installed"), true);

    let job = registry.deploy_demo(&session_id, &demo).unwrap();
    assert!(wait_until(|| job.status() == DeployStatus::Done, WAIT).await);

    let state = fake.state.lock().unwrap();
    let marker = String::from_utf8(state.files["/opt/yolo/.installed"].clone()).unwrap();
    assert!(marker.starts_with("installed_at="));
    assert!(marker.contains("version=1.2.0"));
    drop(state);
    // run_as_sudo deploys hand ownership back after success.
    assert!(fake.ran("chown -R ops:ops /opt/yolo"));
}
