//! Local TCP listener forwarded over the SSH connection

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use el_core::error::TunnelError;
use el_core::remote::Tunnel;

use crate::client::SharedHandle;

/// One local listener whose accepted connections are forwarded, as
/// direct-tcpip channels over the device connection, to a fixed
/// `remote_host:remote_port`.
pub struct PortForward {
    local_port: u16,
    cancel: CancellationToken,
}

impl PortForward {
    /// Bind the local listener and verify the remote side accepts a
    /// forwarded channel before reporting success.
    pub(crate) async fn start(
        handle: SharedHandle,
        remote_host: String,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| TunnelError::LocalBind {
                port: local_port,
                message: e.to_string(),
            })?;

        // Probe the forward target now so a dead service fails the attempt
        // instead of every future connection.
        {
            let guard = handle.lock().await;
            let h = guard.as_ref().ok_or_else(|| TunnelError::RemoteOpen {
                host: remote_host.clone(),
                port: remote_port,
                message: "connection closed".to_string(),
            })?;
            let probe = h
                .channel_open_direct_tcpip(&remote_host, remote_port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| TunnelError::RemoteOpen {
                    host: remote_host.clone(),
                    port: remote_port,
                    message: e.to_string(),
                })?;
            let _ = probe.close().await;
        }

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let target_host = remote_host.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tokio::spawn(forward_connection(
                                    handle.clone(),
                                    target_host.clone(),
                                    remote_port,
                                    stream,
                                    peer,
                                    accept_cancel.clone(),
                                ));
                            }
                            Err(e) => {
                                tracing::warn!("Tunnel accept failed on port {}: {}", local_port, e);
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("Tunnel listener on port {} closed", local_port);
        });

        tracing::info!(
            "Tunnel ready: 127.0.0.1:{} -> {}:{}",
            local_port,
            remote_host,
            remote_port
        );
        Ok(Self { local_port, cancel })
    }
}

async fn forward_connection(
    handle: SharedHandle,
    remote_host: String,
    remote_port: u16,
    mut stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let channel = {
        let guard = handle.lock().await;
        let Some(h) = guard.as_ref() else {
            return;
        };
        match h
            .channel_open_direct_tcpip(
                &remote_host,
                remote_port as u32,
                &peer.ip().to_string(),
                peer.port() as u32,
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    "Forwarded channel to {}:{} failed: {}",
                    remote_host,
                    remote_port,
                    e
                );
                return;
            }
        }
    };

    let mut remote = channel.into_stream();
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut stream, &mut remote) => {
            if let Err(e) = result {
                tracing::debug!("Forwarded connection from {} ended: {}", peer, e);
            }
        }
    }
}

#[async_trait]
impl Tunnel for PortForward {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
