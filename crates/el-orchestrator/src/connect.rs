//! Pluggable session connector

use std::sync::Arc;

use async_trait::async_trait;

use el_core::error::ConnectionError;
use el_core::remote::{ConnectDescriptor, RemoteExec};
use el_remote::SshRemote;

/// Opens the remote-execution client for a new session.
///
/// The registry is generic over this seam so tests can substitute an
/// in-memory remote.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectDescriptor,
    ) -> Result<Arc<dyn RemoteExec>, ConnectionError>;
}

/// Default connector backed by SSH
pub struct SshConnector;

#[async_trait]
impl Connect for SshConnector {
    async fn connect(
        &self,
        descriptor: &ConnectDescriptor,
    ) -> Result<Arc<dyn RemoteExec>, ConnectionError> {
        let remote = SshRemote::connect(descriptor.clone()).await?;
        Ok(Arc::new(remote))
    }
}
