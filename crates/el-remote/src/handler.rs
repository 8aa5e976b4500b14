//! SSH client handler

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;

/// Minimal client handler for connections to managed devices.
///
/// Host keys are accepted on first contact: devices are operator-provisioned
/// and typically reimaged often enough that pinning would only get in the
/// way. The fingerprint is logged so an operator can audit it.
pub(crate) struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Device host key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}
