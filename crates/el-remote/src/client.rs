//! SSH client wrapper for one managed device

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use el_core::error::{ConnectionError, RemoteError, TunnelError};
use el_core::remote::{
    ConnectDescriptor, Credential, ExecOutput, RemoteChannel, RemoteExec, Tunnel,
};
use el_core::shell::quote;

use crate::channel::SshChannel;
use crate::handler::ClientHandler;
use crate::tunnel::PortForward;

pub(crate) type SharedHandle = Arc<Mutex<Option<Handle<ClientHandler>>>>;

/// One authenticated SSH connection to a managed device.
///
/// Channel opens are serialized through a short-held mutex so concurrent
/// deploy and run orchestration against the same session cannot interleave
/// on the connection; the opened channels themselves are independent.
pub struct SshRemote {
    descriptor: ConnectDescriptor,
    handle: SharedHandle,
}

impl SshRemote {
    /// Establish and authenticate the connection.
    ///
    /// On any failure the half-open handle is dropped, never returned.
    pub async fn connect(descriptor: ConnectDescriptor) -> Result<Self, ConnectionError> {
        let config = Arc::new(client::Config::default());
        let address = format!("{}:{}", descriptor.host, descriptor.port);

        tracing::debug!("Connecting to {}", address);
        let mut handle = tokio::time::timeout(
            descriptor.connect_timeout,
            client::connect(
                config,
                (descriptor.host.as_str(), descriptor.port),
                ClientHandler,
            ),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(address.clone()))?
        .map_err(|e| ConnectionError::Refused(format!("{}: {}", address, e)))?;

        let authenticated = match &descriptor.credential {
            Credential::Password(password) => handle
                .authenticate_password(&descriptor.username, password)
                .await
                .map_err(|e| ConnectionError::Refused(format!("{}: {}", address, e)))?,
            Credential::KeyFile(path) => {
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    ConnectionError::KeyLoad {
                        path: path.clone(),
                        message: e.to_string(),
                    }
                })?;
                handle
                    .authenticate_publickey(&descriptor.username, Arc::new(key))
                    .await
                    .map_err(|e| ConnectionError::Refused(format!("{}: {}", address, e)))?
            }
        };

        if !authenticated {
            return Err(ConnectionError::AuthenticationFailed {
                host: descriptor.host.clone(),
                username: descriptor.username.clone(),
            });
        }

        tracing::info!("Connected to {}@{}", descriptor.username, address);
        Ok(Self {
            descriptor,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Credential fed to `sudo -S`; the login password unless a separate
    /// sudo password was configured.
    fn sudo_password(&self) -> &str {
        if let Some(pw) = &self.descriptor.sudo_password {
            return pw;
        }
        match &self.descriptor.credential {
            Credential::Password(pw) => pw,
            Credential::KeyFile(_) => "",
        }
    }

    async fn open_session_channel(&self) -> Result<Channel<Msg>, RemoteError> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| RemoteError::Io("connection closed".to_string()))?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::ChannelOpen(e.to_string()))
    }

    /// Open a channel and start `command` on it. Elevated commands get a
    /// pseudo-terminal and the sudo password as the first input line,
    /// mirroring `sudo -S -p ''`.
    async fn start_exec(&self, command: &str, elevated: bool) -> Result<Channel<Msg>, RemoteError> {
        let channel = self.open_session_channel().await?;
        if elevated {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| RemoteError::ChannelOpen(format!("pty request failed: {}", e)))?;
            let elevated_command = format!("sudo -S -p '' {}", command);
            channel
                .exec(true, elevated_command.as_str())
                .await
                .map_err(|e| RemoteError::Io(e.to_string()))?;
            let password_line = format!("{}\n", self.sudo_password());
            channel
                .data(password_line.as_bytes())
                .await
                .map_err(|e| RemoteError::Io(e.to_string()))?;
        } else {
            channel
                .exec(true, command)
                .await
                .map_err(|e| RemoteError::Io(e.to_string()))?;
        }
        Ok(channel)
    }

    /// Drain a channel to completion, buffering both streams.
    async fn collect_exec(mut channel: Channel<Msg>) -> Result<ExecOutput, RemoteError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or(RemoteError::ChannelClosed)?;
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteExec for SshRemote {
    async fn run(
        &self,
        command: &str,
        elevated: bool,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError> {
        tracing::trace!(elevated, "run: {}", command);
        let channel = self.start_exec(command, elevated).await?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, Self::collect_exec(channel))
                .await
                .map_err(|_| RemoteError::Timeout(limit))?,
            None => Self::collect_exec(channel).await,
        }
    }

    async fn open_stream(
        &self,
        command: &str,
        elevated: bool,
    ) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        tracing::trace!(elevated, "stream: {}", command);
        let channel = self.start_exec(command, elevated).await?;
        Ok(Box::new(SshChannel::new(channel)))
    }

    async fn mkdir_all(&self, path: &str, elevated: bool) -> Result<(), RemoteError> {
        let out = self
            .run(&format!("mkdir -p {}", quote(path)), elevated, None)
            .await?;
        if !out.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn put_file(&self, data: &[u8], remote_path: &str) -> Result<(), RemoteError> {
        let channel = self.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| RemoteError::Transfer(format!("sftp subsystem: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| RemoteError::Transfer(format!("sftp handshake: {}", e)))?;

        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| RemoteError::Transfer(format!("create {}: {}", remote_path, e)))?;
        file.write_all(data)
            .await
            .map_err(|e| RemoteError::Transfer(format!("write {}: {}", remote_path, e)))?;
        file.shutdown()
            .await
            .map_err(|e| RemoteError::Transfer(format!("flush {}: {}", remote_path, e)))?;

        let _ = sftp.close().await;
        Ok(())
    }

    async fn write_file_elevated(
        &self,
        remote_path: &str,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        let command = format!("tee {} > /dev/null", quote(remote_path));
        let channel = self.start_exec(&command, true).await?;
        channel
            .data(data)
            .await
            .map_err(|e| RemoteError::Io(e.to_string()))?;
        channel
            .eof()
            .await
            .map_err(|e| RemoteError::Io(e.to_string()))?;

        let out = Self::collect_exec(channel).await?;
        if !out.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: out.exit_code,
                stderr: format!("privileged write to {} failed", remote_path),
            });
        }
        Ok(())
    }

    async fn open_tunnel(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn Tunnel>, TunnelError> {
        let forward = PortForward::start(
            Arc::clone(&self.handle),
            remote_host.to_string(),
            remote_port,
            local_port,
        )
        .await?;
        Ok(Box::new(forward))
    }

    async fn close(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "session closed", "en")
                .await;
            tracing::debug!(
                "Disconnected from {}:{}",
                self.descriptor.host,
                self.descriptor.port
            );
        }
    }
}
