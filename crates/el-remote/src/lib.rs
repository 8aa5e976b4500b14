//! el-remote: SSH implementation of the Edgelink remote capability
//!
//! Provides the concrete [`el_core::remote::RemoteExec`] backed by russh:
//! password or key authentication, buffered and streaming command execution
//! (with PTY-based sudo elevation), SFTP upload, privileged `tee` writes,
//! and direct-tcpip port tunnels.

mod channel;
mod client;
mod handler;
mod tunnel;

pub use client::SshRemote;
pub use tunnel::PortForward;
