//! el-orchestrator: session/job/run orchestration engine
//!
//! Owns the session registry, drives deploy jobs and run sessions against
//! remote devices, and fans progress out to live subscribers. The HTTP/WS
//! front end sits above this crate and only ever talks to
//! [`registry::SessionRegistry`].

pub mod connect;
pub mod deploy;
mod fetch;
mod fsops;
mod health;
pub mod hub;
mod ports;
pub mod registry;
pub mod run;

pub use connect::{Connect, SshConnector};
pub use hub::{Subscription, Target};
pub use registry::{DeployJob, RunSession, Session, SessionRegistry};
