//! Local network helpers

use std::io;
use std::net::TcpListener;

/// Ask the OS for a currently-free local TCP port.
///
/// The port is released again before returning, so a race with another
/// process grabbing it is possible; callers that bind it immediately
/// afterwards (the tunnel listener) treat a bind failure as a retryable
/// condition.
pub fn free_local_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_local_port_is_bindable() {
        let port = free_local_port().unwrap();
        assert_ne!(port, 0);
        // The port was released, so binding it again should succeed.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
