//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Allocate a fresh random id
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the raw id string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type! {
    /// Unique identifier for a device session
    SessionId
}

id_type! {
    /// Unique identifier for a deploy job
    JobId
}

id_type! {
    /// Unique identifier for a run session
    RunId
}

/// Deploy job lifecycle.
///
/// Transitions are monotonic: `Pending -> Uploading -> Running` and then
/// exactly one of the terminal states. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    Pending,
    Uploading,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl DeployStatus {
    /// Whether this state can never be left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Uploading => "UPLOADING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Run session lifecycle.
///
/// `Starting -> Running -> Stopped`; `Error` is reachable from any step
/// before `Running`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl RunStatus {
    /// Whether this state can never be left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether a run in this state still occupies its (session, demo) slot
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Endpoint details attached to a run's `RUNNING` status event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

/// Event pushed to live subscribers of a job or run.
///
/// Serializes to the wire shapes `{"type":"log","data":...}` and
/// `{"type":"status","data":...,"exit_code":...,"info":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Log {
        data: String,
    },
    Status {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<RunInfo>,
    },
}

impl Event {
    /// Build a log event
    pub fn log(line: impl Into<String>) -> Self {
        Self::Log { data: line.into() }
    }

    /// Build a status event for a deploy job
    pub fn job_status(status: DeployStatus, exit_code: Option<i32>) -> Self {
        Self::Status {
            data: status.to_string(),
            exit_code,
            info: None,
        }
    }

    /// Build a status event for a run session
    pub fn run_status(status: RunStatus, info: Option<RunInfo>) -> Self {
        Self::Status {
            data: status.to_string(),
            exit_code: None,
            info,
        }
    }
}
