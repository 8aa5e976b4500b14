//! Remote execution capability traits
//!
//! The orchestrator never speaks the remote-shell wire protocol itself; it
//! drives these traits. `el-remote` provides the SSH-backed implementation,
//! tests substitute an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, TunnelError};

/// Primary login credential for a managed device
#[derive(Clone)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password(***)"),
            Self::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
        }
    }
}

/// Connection descriptor for one managed device
#[derive(Debug, Clone)]
pub struct ConnectDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    /// Credential fed to `sudo -S` for elevated commands. Falls back to the
    /// login password when unset.
    pub sudo_password: Option<String>,
    pub connect_timeout: Duration,
}

impl ConnectDescriptor {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credential,
            sudo_password: None,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Fully-buffered result of a remote command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One unit of output or lifecycle change observed on a streaming channel
#[derive(Debug)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// The remote command exited; more output may still follow
    Exit(i32),
    /// No further events will be delivered
    Closed,
}

/// Clonable handle that force-closes a streaming channel from any task.
///
/// Used by cancellation and shutdown paths, which do not own the channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelAbort {
    token: CancellationToken,
}

impl ChannelAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the channel be closed; idempotent.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `abort` has been called
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }
}

/// A live streaming execution on the remote side
#[async_trait]
pub trait RemoteChannel: Send {
    /// Wait for the next event. After `Closed` is returned the channel is
    /// spent and callers must stop polling.
    async fn next_event(&mut self) -> Result<ChannelEvent, RemoteError>;

    /// Handle for force-closing this channel from another task
    fn abort_handle(&self) -> ChannelAbort;
}

/// One local TCP listener forwarded to a remote-reachable address
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn local_port(&self) -> u16;

    /// Close the listener and all in-flight forwarded connections; idempotent.
    async fn stop(&self);
}

/// Remote execution, file transfer, and tunnel capability of one connected
/// session.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run a command to completion, buffering all output.
    ///
    /// Always resolves with an exit code; a nonzero exit is not an error.
    async fn run(
        &self,
        command: &str,
        elevated: bool,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError>;

    /// Open a streaming channel for live output relay.
    ///
    /// When `elevated`, a pseudo-terminal is allocated and the elevation
    /// credential is fed as the first input line (`sudo -S` contract).
    async fn open_stream(
        &self,
        command: &str,
        elevated: bool,
    ) -> Result<Box<dyn RemoteChannel>, RemoteError>;

    /// Create a directory and any missing parents; idempotent.
    async fn mkdir_all(&self, path: &str, elevated: bool) -> Result<(), RemoteError>;

    /// Upload bytes via direct (SFTP) transfer. On failure callers fall back
    /// to `write_file_elevated`.
    async fn put_file(&self, data: &[u8], remote_path: &str) -> Result<(), RemoteError>;

    /// Pipe bytes through a privileged `tee`; errors on nonzero remote exit.
    async fn write_file_elevated(&self, remote_path: &str, data: &[u8])
        -> Result<(), RemoteError>;

    /// Open a local listener on `local_port` forwarding to
    /// `remote_host:remote_port` as seen from the remote side.
    async fn open_tunnel(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn Tunnel>, TunnelError>;

    /// Release the connection; idempotent.
    async fn close(&self);
}
