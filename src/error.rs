//! Error types for the server lifecycle start path
//!
//! The stop path deliberately has no error type: failures there are logged
//! and absorbed so stop stays safe to call from cleanup and error-recovery
//! paths.

use thiserror::Error;

/// Errors surfaced by [`crate::lifecycle::ServerLifecycleManager::start`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed start parameters, detected before any process is spawned
    #[error("invalid configuration for tunnel {tunnel_id}: {reason}")]
    Config { tunnel_id: String, reason: String },

    /// The server binary could not be launched on either the primary or the
    /// PATH-resolved fallback path
    #[error("failed to launch {binary} for tunnel {tunnel_id}: {source}")]
    Spawn {
        tunnel_id: String,
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited during the startup settle window; carries the tail
    /// of the server log so operators can diagnose without reading raw logs
    #[error("{core} server failed to start (exit code: {exit_code}): {log_tail}")]
    EarlyExit {
        core: &'static str,
        exit_code: String,
        log_tail: String,
    },

    /// Filesystem error writing the config or log artifact
    #[error("io error for tunnel {tunnel_id}: {source}")]
    Io {
        tunnel_id: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_exit_message_embeds_exit_code_and_log_tail() {
        let err = LifecycleError::EarlyExit {
            core: "rathole",
            exit_code: "1".to_string(),
            log_tail: "bind: address already in use".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code: 1"));
        assert!(msg.contains("address already in use"));
    }

    #[test]
    fn config_error_names_the_tunnel() {
        let err = LifecycleError::Config {
            tunnel_id: "t1".to_string(),
            reason: "invalid remote_addr format: nocolon".to_string(),
        };
        assert!(err.to_string().contains("t1"));
        assert!(err.to_string().contains("nocolon"));
    }
}
