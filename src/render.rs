//! Per-core configuration rendering and launch plans
//!
//! Pure functions: server parameters in, configuration artifact text out.
//! Rathole, backhaul, and frp configs are serialized through typed structs;
//! chisel's flag-oriented settings use a plain-text template.

use crate::core::{Core, ServerParams};
use crate::error::LifecycleError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Result of rendering one tunnel's server configuration.
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    /// Configuration artifact text, in the core's native format
    pub text: String,
    /// Address the server will bind its control port to
    pub bind_addr: String,
}

/// Argument vector for launching a core's server binary against a rendered
/// config file. The binary itself comes from [`crate::lifecycle::CoreBinary`].
pub fn launch_args(core: Core, config_path: &Path) -> Vec<String> {
    let path = config_path.display().to_string();
    match core {
        Core::Rathole => vec!["-s".to_string(), path],
        Core::Backhaul => vec!["-c".to_string(), path],
        Core::Chisel => vec!["server".to_string(), "-c".to_string(), path],
        Core::Frp => vec!["-c".to_string(), path],
    }
}

#[derive(Serialize)]
struct RatholeConfig<'a> {
    server: RatholeServer<'a>,
}

#[derive(Serialize)]
struct RatholeServer<'a> {
    bind_addr: &'a str,
    default_token: &'a str,
    services: BTreeMap<&'a str, RatholeService>,
}

#[derive(Serialize)]
struct RatholeService {
    bind_addr: String,
}

#[derive(Serialize)]
struct BackhaulConfig<'a> {
    server: BackhaulServer<'a>,
}

#[derive(Serialize)]
struct BackhaulServer<'a> {
    bind_addr: &'a str,
    transport: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrpsConfig<'a> {
    bind_addr: &'a str,
    bind_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<FrpsAuth<'a>>,
}

#[derive(Serialize)]
struct FrpsAuth<'a> {
    method: &'a str,
    token: &'a str,
}

/// Render the configuration artifact for one tunnel's server process.
pub fn render(tunnel_id: &str, params: &ServerParams) -> Result<RenderedConfig, LifecycleError> {
    match params {
        ServerParams::Rathole {
            remote_addr,
            token,
            proxy_port,
        } => {
            // "panel.example.com:23333" or "0.0.0.0:23333"; the server binds
            // every interface on the advertised port
            let (_, port) = remote_addr.rsplit_once(':').ok_or_else(|| {
                LifecycleError::Config {
                    tunnel_id: tunnel_id.to_string(),
                    reason: format!("invalid remote_addr format: {remote_addr}"),
                }
            })?;
            let port: u16 = port.parse().map_err(|_| LifecycleError::Config {
                tunnel_id: tunnel_id.to_string(),
                reason: format!("invalid remote_addr port: {remote_addr}"),
            })?;
            let bind_addr = format!("0.0.0.0:{port}");

            let mut services = BTreeMap::new();
            services.insert(
                tunnel_id,
                RatholeService {
                    bind_addr: format!("0.0.0.0:{proxy_port}"),
                },
            );
            let config = RatholeConfig {
                server: RatholeServer {
                    bind_addr: &bind_addr,
                    default_token: token,
                    services,
                },
            };
            Ok(RenderedConfig {
                text: to_toml(tunnel_id, &config)?,
                bind_addr,
            })
        }
        ServerParams::Backhaul {
            listen_port,
            token,
            transport,
        } => {
            let bind_addr = format!("0.0.0.0:{listen_port}");
            let config = BackhaulConfig {
                server: BackhaulServer {
                    bind_addr: &bind_addr,
                    transport,
                    token: token.as_deref(),
                },
            };
            Ok(RenderedConfig {
                text: to_toml(tunnel_id, &config)?,
                bind_addr,
            })
        }
        ServerParams::Chisel {
            server_port,
            auth,
            fingerprint,
            use_ipv6,
        } => {
            let host = if *use_ipv6 { "::" } else { "0.0.0.0" };
            let mut text = format!("host: {host}\nport: {server_port}\n");
            if let Some(auth) = auth {
                text.push_str(&format!("auth: {auth}\n"));
            }
            if let Some(fingerprint) = fingerprint {
                text.push_str(&format!("fingerprint: {fingerprint}\n"));
            }
            Ok(RenderedConfig {
                text,
                bind_addr: format!("{host}:{server_port}"),
            })
        }
        ServerParams::Frp { bind_port, token } => {
            let config = FrpsConfig {
                bind_addr: "0.0.0.0",
                bind_port: *bind_port,
                auth: token.as_deref().map(|token| FrpsAuth {
                    method: "token",
                    token,
                }),
            };
            Ok(RenderedConfig {
                text: to_toml(tunnel_id, &config)?,
                bind_addr: format!("0.0.0.0:{bind_port}"),
            })
        }
    }
}

fn to_toml<T: Serialize>(tunnel_id: &str, config: &T) -> Result<String, LifecycleError> {
    toml::to_string(config).map_err(|e| LifecycleError::Config {
        tunnel_id: tunnel_id.to_string(),
        reason: format!("config serialization failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rathole_config_has_server_and_service_sections() {
        let params = ServerParams::Rathole {
            remote_addr: "0.0.0.0:23333".to_string(),
            token: "abc".to_string(),
            proxy_port: 8989,
        };
        let rendered = render("t1", &params).unwrap();
        assert_eq!(rendered.bind_addr, "0.0.0.0:23333");
        assert!(rendered.text.contains("[server]"));
        assert!(rendered.text.contains("bind_addr = \"0.0.0.0:23333\""));
        assert!(rendered.text.contains("default_token = \"abc\""));
        assert!(rendered.text.contains("[server.services.t1]"));
        assert!(rendered.text.contains("bind_addr = \"0.0.0.0:8989\""));
    }

    #[test]
    fn rathole_hostname_remote_addr_binds_all_interfaces() {
        let params = ServerParams::Rathole {
            remote_addr: "panel.example.com:23333".to_string(),
            token: "abc".to_string(),
            proxy_port: 8989,
        };
        let rendered = render("t1", &params).unwrap();
        assert_eq!(rendered.bind_addr, "0.0.0.0:23333");
    }

    #[test]
    fn rathole_remote_addr_without_port_is_rejected() {
        let params = ServerParams::Rathole {
            remote_addr: "nocolon".to_string(),
            token: "abc".to_string(),
            proxy_port: 8989,
        };
        let err = render("t1", &params).unwrap_err();
        assert!(err.to_string().contains("invalid remote_addr format"));
    }

    #[test]
    fn frps_config_omits_auth_without_a_token() {
        let rendered = render(
            "t1",
            &ServerParams::Frp {
                bind_port: 7000,
                token: None,
            },
        )
        .unwrap();
        assert!(rendered.text.contains("bindPort = 7000"));
        assert!(!rendered.text.contains("[auth]"));

        let rendered = render(
            "t1",
            &ServerParams::Frp {
                bind_port: 7000,
                token: Some("secret".to_string()),
            },
        )
        .unwrap();
        assert!(rendered.text.contains("[auth]"));
        assert!(rendered.text.contains("token = \"secret\""));
    }

    #[test]
    fn chisel_config_respects_ipv6() {
        let rendered = render(
            "t1",
            &ServerParams::Chisel {
                server_port: 8080,
                auth: Some("user:pass".to_string()),
                fingerprint: None,
                use_ipv6: true,
            },
        )
        .unwrap();
        assert_eq!(rendered.bind_addr, ":::8080");
        assert!(rendered.text.contains("host: ::"));
        assert!(rendered.text.contains("auth: user:pass"));
        assert!(!rendered.text.contains("fingerprint"));
    }

    #[test]
    fn launch_args_follow_the_per_core_contract() {
        let path = Path::new("/data/rathole/t1.toml");
        assert_eq!(
            launch_args(Core::Rathole, path),
            vec!["-s", "/data/rathole/t1.toml"]
        );
        assert_eq!(launch_args(Core::Chisel, path)[0], "server");
        assert_eq!(launch_args(Core::Frp, path)[0], "-c");
    }
}
