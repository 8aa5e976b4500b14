//! In-memory remote for orchestrator tests
//!
//! `FakeRemote` implements the capability traits against a scripted device
//! model: a socket table, an uploaded-file store, kill semantics with
//! optionally unkillable pids, and a fake tunnel that can serve a real HTTP
//! health endpoint on the forwarded local port.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use el_core::error::{ConnectionError, RemoteError, TunnelError};
use el_core::remote::{
    ChannelAbort, ChannelEvent, ConnectDescriptor, Credential, ExecOutput, RemoteChannel,
    RemoteExec, Tunnel,
};
use el_orchestrator::{Connect, SessionRegistry};

pub const LAUNCH_PID: u32 = 4242;

#[derive(Debug, Clone)]
pub struct FakeListener {
    pub addr: String,
    pub port: u16,
    pub name: String,
    pub pid: u32,
}

#[derive(Default)]
pub struct FakeState {
    /// Every `run` invocation as (command, elevated)
    pub run_calls: Vec<(String, bool)>,
    /// Uploaded files by remote path
    pub files: HashMap<String, Vec<u8>>,
    /// Paths written through the privileged fallback
    pub elevated_writes: Vec<String>,
    pub fail_put_file: bool,
    pub fail_mkdir_plain: bool,
    /// Current socket table
    pub listeners: Vec<FakeListener>,
    /// Pids that survive every kill signal
    pub unkillable: HashSet<u32>,
    /// Whether the launch wrapper echoes a pid
    pub echo_pid_on_launch: bool,
    /// Listeners inserted into the table as launch commands run, in order
    pub launch_listeners: VecDeque<FakeListener>,
    /// Events replayed by the next `open_stream`
    pub stream_events: VecDeque<ChannelEvent>,
    /// Keep the stream open after the scripted events until aborted
    pub stream_blocks: bool,
    /// Abort handle of the most recently opened stream
    pub stream_abort: Option<ChannelAbort>,
    /// Executable paths that exist on the device (for `test -x`)
    pub executables: HashSet<String>,
    /// Names resolvable via `command -v` to a path
    pub path_lookup: HashMap<String, String>,
    pub fail_tunnel: bool,
    /// Serve HTTP 200 on forwarded local ports
    pub tunnel_serves_health: bool,
    /// Output of the remote `tail` command
    pub remote_log_tail: String,
    pub home: String,
    pub tunnels: Vec<Arc<FakeTunnelState>>,
}

pub struct FakeRemote {
    pub state: Mutex<FakeState>,
    pub closed: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                echo_pid_on_launch: true,
                tunnel_serves_health: true,
                home: "/home/ops".to_string(),
                remote_log_tail: String::new(),
                ..FakeState::default()
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the last opened stream was force-closed.
    pub fn stream_aborted(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .stream_abort
            .as_ref()
            .is_some_and(|a| a.is_aborted())
    }

    pub fn with_state(self: &Arc<Self>, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .run_calls
            .iter()
            .any(|(cmd, _)| cmd.contains(needle))
    }

    fn socket_table(state: &FakeState) -> String {
        let mut out = String::from(
            "State  Recv-Q Send-Q  Local Address:Port   Peer Address:Port Process\n",
        );
        for l in &state.listeners {
            out.push_str(&format!(
                "LISTEN 0      128     {}:{}    0.0.0.0:*     users:((\"{}\",pid={},fd=3))\n",
                l.addr, l.port, l.name, l.pid
            ));
        }
        out
    }

    fn dispatch(&self, command: &str, elevated: bool) -> ExecOutput {
        let ok = |stdout: &str| ExecOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        let fail = |code: i32, stderr: &str| ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        };

        let mut state = self.state.lock().unwrap();
        state.run_calls.push((command.to_string(), elevated));

        if command.contains("nohup") {
            // Pick the queued listener matching the requested port, falling
            // back to launch order for commands without a --port flag.
            let port = command
                .split_whitespace()
                .skip_while(|t| *t != "--port")
                .nth(1)
                .and_then(|p| p.parse::<u16>().ok());
            let index = port
                .and_then(|p| state.launch_listeners.iter().position(|l| l.port == p))
                .or(if state.launch_listeners.is_empty() {
                    None
                } else {
                    Some(0)
                });
            if let Some(i) = index {
                if let Some(listener) = state.launch_listeners.remove(i) {
                    state.listeners.push(listener);
                }
            }
            return if state.echo_pid_on_launch {
                ok(&format!("{}\n", LAUNCH_PID))
            } else {
                ok("workload started\n")
            };
        }
        if let Some(rest) = command.strip_prefix("sha256sum ") {
            let path = rest.trim();
            return match state.files.get(path) {
                Some(data) => ok(&format!("{}  {}\n", hex::encode(Sha256::digest(data)), path)),
                None => fail(1, "sha256sum: no such file"),
            };
        }
        if command.starts_with("ss -ltnp") {
            return ok(&Self::socket_table(&state));
        }
        if let Some(rest) = command.strip_prefix("kill -0 ") {
            let pid: u32 = rest.trim().parse().unwrap_or(0);
            let alive = state.listeners.iter().any(|l| l.pid == pid);
            return if alive { ok("") } else { fail(1, "no such process") };
        }
        if let Some(rest) = command
            .strip_prefix("kill -9 ")
            .or_else(|| command.strip_prefix("kill "))
        {
            let pid: u32 = rest.trim().parse().unwrap_or(0);
            if !state.unkillable.contains(&pid) {
                state.listeners.retain(|l| l.pid != pid);
            }
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("pkill -f ") {
            let pattern = rest.trim().trim_matches('\'').to_string();
            let unkillable = state.unkillable.clone();
            state
                .listeners
                .retain(|l| !pattern.contains(&l.name) || unkillable.contains(&l.pid));
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("test -x ") {
            return if state.executables.contains(rest.trim()) {
                ok("")
            } else {
                fail(1, "")
            };
        }
        if let Some(rest) = command.strip_prefix("test -f ") {
            return if state.files.contains_key(rest.trim()) {
                ok("")
            } else {
                fail(1, "")
            };
        }
        if command.starts_with("test -w ") {
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("command -v ") {
            return match state.path_lookup.get(rest.trim()) {
                Some(path) => ok(&format!("{}\n", path)),
                None => fail(1, ""),
            };
        }
        if command.contains("$HOME") {
            return ok(&state.home.clone());
        }
        if command.starts_with("tail -n") {
            return ok(&state.remote_log_tail.clone());
        }
        // chmod, chown, and anything else unmodeled succeed silently.
        ok("")
    }
}

pub struct FakeChannel {
    events: VecDeque<ChannelEvent>,
    blocks: bool,
    abort: ChannelAbort,
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn next_event(&mut self) -> Result<ChannelEvent, RemoteError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        if self.blocks && !self.abort.is_aborted() {
            self.abort.aborted().await;
        }
        Ok(ChannelEvent::Closed)
    }

    fn abort_handle(&self) -> ChannelAbort {
        self.abort.clone()
    }
}

pub struct FakeTunnelState {
    pub local_port: u16,
    pub stopped: AtomicBool,
    serve: CancellationToken,
}

pub struct FakeTunnel {
    state: Arc<FakeTunnelState>,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        self.state.local_port
    }

    async fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        self.state.serve.cancel();
    }
}

/// Minimal HTTP 200 responder standing in for the forwarded service.
pub async fn serve_health(listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((mut stream, _)) = accepted else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            }
        }
    }
}

#[async_trait]
impl RemoteExec for FakeRemote {
    async fn run(
        &self,
        command: &str,
        elevated: bool,
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError> {
        Ok(self.dispatch(command, elevated))
    }

    async fn open_stream(
        &self,
        command: &str,
        elevated: bool,
    ) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.run_calls.push((command.to_string(), elevated));
        let events = std::mem::take(&mut state.stream_events);
        let blocks = state.stream_blocks;
        let abort = ChannelAbort::new();
        state.stream_abort = Some(abort.clone());
        Ok(Box::new(FakeChannel {
            events,
            blocks,
            abort,
        }))
    }

    async fn mkdir_all(&self, path: &str, elevated: bool) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state
            .run_calls
            .push((format!("mkdir -p {}", path), elevated));
        if state.fail_mkdir_plain && !elevated {
            return Err(RemoteError::CommandFailed {
                exit_code: 1,
                stderr: "permission denied".to_string(),
            });
        }
        Ok(())
    }

    async fn put_file(&self, data: &[u8], remote_path: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_put_file {
            return Err(RemoteError::Transfer("sftp: permission denied".to_string()));
        }
        state.files.insert(remote_path.to_string(), data.to_vec());
        Ok(())
    }

    async fn write_file_elevated(
        &self,
        remote_path: &str,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.files.insert(remote_path.to_string(), data.to_vec());
        state.elevated_writes.push(remote_path.to_string());
        Ok(())
    }

    async fn open_tunnel(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn Tunnel>, TunnelError> {
        let (fail, serves) = {
            let state = self.state.lock().unwrap();
            (state.fail_tunnel, state.tunnel_serves_health)
        };
        if fail {
            return Err(TunnelError::RemoteOpen {
                host: remote_host.to_string(),
                port: remote_port,
                message: "administratively refused".to_string(),
            });
        }

        let cancel = CancellationToken::new();
        if serves {
            let listener = TcpListener::bind(("127.0.0.1", local_port))
                .await
                .map_err(|e| TunnelError::LocalBind {
                    port: local_port,
                    message: e.to_string(),
                })?;
            tokio::spawn(serve_health(listener, cancel.clone()));
        }

        let state = Arc::new(FakeTunnelState {
            local_port,
            stopped: AtomicBool::new(false),
            serve: cancel,
        });
        self.state.lock().unwrap().tunnels.push(Arc::clone(&state));
        Ok(Box::new(FakeTunnel { state }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector(pub Arc<FakeRemote>);

#[async_trait]
impl Connect for FakeConnector {
    async fn connect(
        &self,
        _descriptor: &ConnectDescriptor,
    ) -> Result<Arc<dyn RemoteExec>, ConnectionError> {
        Ok(Arc::clone(&self.0) as Arc<dyn RemoteExec>)
    }
}

pub fn descriptor() -> ConnectDescriptor {
    ConnectDescriptor::new("127.0.0.1", "ops", Credential::Password("secret".to_string()))
}

/// Registry wired to the fake, with one session connected.
pub async fn setup(fake: &Arc<FakeRemote>) -> (Arc<SessionRegistry>, el_core::SessionId) {
    el_core::logging::init("warn");
    let registry = Arc::new(SessionRegistry::new(Arc::new(FakeConnector(Arc::clone(
        fake,
    )))));
    let session = registry.create_session(descriptor()).await.unwrap();
    let session_id = session.id.clone();
    (registry, session_id)
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
