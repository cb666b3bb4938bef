//! Post-start reachability probe
//!
//! A short-timeout TCP connect to loopback at the port a server just bound.
//! Every outcome is advisory: a server may simply be slow to bind, so the
//! caller logs and moves on.

use std::time::Duration;
use tokio::net::TcpStream;

/// Outcome of a reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Loopback connect succeeded
    Reachable,
    /// Connect was refused or timed out
    Unreachable,
    /// The probe itself could not run (e.g. unparseable bind address)
    ProbeError,
}

/// Probe the port portion of `bind_addr` on loopback.
pub async fn probe(bind_addr: &str, timeout: Duration) -> ProbeOutcome {
    let port = match bind_addr.rsplit_once(':').map(|(_, port)| port.parse::<u16>()) {
        Some(Ok(port)) => port,
        _ => return ProbeOutcome::ProbeError,
    };

    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => ProbeOutcome::Reachable,
        Ok(Err(_)) | Err(_) => ProbeOutcome::Unreachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn a_listening_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = probe(&format!("0.0.0.0:{port}"), Duration::from_millis(500)).await;
        assert_eq!(outcome, ProbeOutcome::Reachable);
    }

    #[tokio::test]
    async fn a_closed_port_is_unreachable() {
        // Bind then drop to get a port that is almost certainly closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = probe(&format!("0.0.0.0:{port}"), Duration::from_millis(500)).await;
        assert_eq!(outcome, ProbeOutcome::Unreachable);
    }

    #[tokio::test]
    async fn an_unparseable_bind_addr_is_a_probe_error() {
        let outcome = probe("no-port-here", Duration::from_millis(100)).await;
        assert_eq!(outcome, ProbeOutcome::ProbeError);
    }
}
