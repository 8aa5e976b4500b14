//! Core error types for Edgelink

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the edgelink ecosystem
#[derive(Error, Debug)]
pub enum EdgelinkError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Remote execution error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Authentication failed
    #[error("Authentication failed for {username}@{host}")]
    AuthenticationFailed { host: String, username: String },

    /// Connection refused or unreachable
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Connection attempt timed out
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// Connection lost after it was established
    #[error("Connection lost: {0}")]
    Lost(String),

    /// Private key could not be loaded
    #[error("Failed to load private key {path}: {message}")]
    KeyLoad { path: PathBuf, message: String },
}

/// Errors from remote command execution and file transfer
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Opening a channel on the connection failed
    #[error("Failed to open channel: {0}")]
    ChannelOpen(String),

    /// The channel closed before an exit status was seen
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// A remote command that must succeed exited nonzero
    #[error("Remote command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Direct file transfer failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// The command did not complete within its timeout
    #[error("Remote command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Underlying protocol or I/O failure
    #[error("Remote I/O error: {0}")]
    Io(String),
}

/// Port-forward tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Local listener could not be bound
    #[error("Failed to bind local port {port}: {message}")]
    LocalBind { port: u16, message: String },

    /// The forwarded channel to the remote side could not be opened
    #[error("Failed to open forwarded channel to {host}:{port}: {message}")]
    RemoteOpen {
        host: String,
        port: u16,
        message: String,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Local install script does not exist
    #[error("Install script not found: {0}")]
    ScriptNotFound(PathBuf),

    /// Fetching a script from a URL failed
    #[error("Script fetch failed: {0}")]
    Fetch(String),
}

/// Registry lookup and lifecycle errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Deploy job not found
    #[error("Deploy job not found: {0}")]
    JobNotFound(String),

    /// Run session not found
    #[error("Run session not found: {0}")]
    RunNotFound(String),

    /// Demo not found in the demo registry
    #[error("Demo not found: {0}")]
    DemoNotFound(String),

    /// A run is already active for this (session, demo) pair
    #[error("Demo {demo_id} is already running on session {session_id}")]
    RunActive { session_id: String, demo_id: String },
}
