//! Tunnel cores and their typed specs
//!
//! A "core" is one of the supported tunnel backend implementations. Each has
//! its own configuration schema, server binary, and client-side field layout.
//! Tunnel specs are persisted as free-form JSON; this module parses them into
//! a closed set of per-core structs so the rest of the crate works with named,
//! typed fields instead of key lookups.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// A supported tunnel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Core {
    Backhaul,
    Rathole,
    Chisel,
    Frp,
}

impl Core {
    pub const ALL: [Core; 4] = [Core::Backhaul, Core::Rathole, Core::Chisel, Core::Frp];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "backhaul" => Some(Self::Backhaul),
            "rathole" => Some(Self::Rathole),
            "chisel" => Some(Self::Chisel),
            "frp" => Some(Self::Frp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backhaul => "backhaul",
            Self::Rathole => "rathole",
            Self::Chisel => "chisel",
            Self::Frp => "frp",
        }
    }

    /// Name of the server binary, both under the panel's binary directory and
    /// as the PATH-resolved fallback.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Backhaul => "backhaul",
            Self::Rathole => "rathole",
            Self::Chisel => "chisel",
            Self::Frp => "frps",
        }
    }

    /// Extension of the rendered per-tunnel configuration file.
    pub fn config_extension(&self) -> &'static str {
        match self {
            Self::Chisel => "conf",
            _ => "toml",
        }
    }
}

impl std::fmt::Display for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from parsing a persisted tunnel spec.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("{core} tunnel spec is missing required field `{field}`")]
    MissingField { core: &'static str, field: &'static str },

    #[error("{core} tunnel spec has invalid `{field}`: {reason}")]
    InvalidField {
        core: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Parameters the server side of a core needs to run one tunnel's server
/// process. Extracted from a [`TunnelSpec`]; fields required here but absent
/// from the spec surface as [`SpecError::MissingField`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerParams {
    Backhaul {
        listen_port: u16,
        token: Option<String>,
        transport: String,
    },
    Rathole {
        remote_addr: String,
        token: String,
        proxy_port: u16,
    },
    Chisel {
        server_port: u16,
        auth: Option<String>,
        fingerprint: Option<String>,
        use_ipv6: bool,
    },
    Frp {
        bind_port: u16,
        token: Option<String>,
    },
}

impl ServerParams {
    pub fn core(&self) -> Core {
        match self {
            Self::Backhaul { .. } => Core::Backhaul,
            Self::Rathole { .. } => Core::Rathole,
            Self::Chisel { .. } => Core::Chisel,
            Self::Frp { .. } => Core::Frp,
        }
    }
}

/// A tunnel's persisted configuration, parsed per core.
#[derive(Debug, Clone)]
pub enum TunnelSpec {
    Backhaul(BackhaulSpec),
    Rathole(RatholeSpec),
    Chisel(ChiselSpec),
    Frp(FrpSpec),
}

#[derive(Debug, Clone)]
pub struct BackhaulSpec {
    pub listen_port: u16,
    pub token: Option<String>,
    pub transport: String,
}

#[derive(Debug, Clone)]
pub struct RatholeSpec {
    /// Panel address the server listens on for client connections,
    /// e.g. "panel.example.com:23333"
    pub remote_addr: String,
    pub token: Option<String>,
    /// Port where the tunneled service is exposed
    pub proxy_port: u16,
    pub local_addr: String,
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ChiselSpec {
    pub server_port: u16,
    pub auth: Option<String>,
    pub fingerprint: Option<String>,
    pub use_ipv6: bool,
    pub server_addr: String,
    pub remote_port: Option<u16>,
    pub local_addr: String,
    pub local_port: Option<u16>,
    pub reverse_spec: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FrpSpec {
    pub bind_port: u16,
    pub token: Option<String>,
    pub server_addr: String,
    pub local_ip: String,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub tunnel_type: String,
}

impl TunnelSpec {
    /// Parse the persisted JSON bag for `core`. Fails only on fields that
    /// every consumer of the spec needs; fields one side can live without
    /// stay optional and are checked where they are used.
    pub fn from_value(core: Core, spec: &Value) -> Result<Self, SpecError> {
        match core {
            Core::Backhaul => Ok(Self::Backhaul(BackhaulSpec {
                listen_port: require_port(core, spec, &["listen_port"])?,
                token: str_field(spec, "token"),
                transport: str_field(spec, "transport").unwrap_or_else(|| "tcp".to_string()),
            })),
            Core::Rathole => Ok(Self::Rathole(RatholeSpec {
                remote_addr: str_field(spec, "remote_addr").ok_or(SpecError::MissingField {
                    core: core.as_str(),
                    field: "remote_addr",
                })?,
                token: str_field(spec, "token"),
                proxy_port: require_port(core, spec, &["remote_port", "listen_port"])?,
                local_addr: str_field(spec, "local_addr")
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                local_port: port_field(core, spec, "local_port")?,
            })),
            Core::Chisel => Ok(Self::Chisel(ChiselSpec {
                server_port: require_port(core, spec, &["server_port", "listen_port"])?,
                auth: str_field(spec, "auth"),
                fingerprint: str_field(spec, "fingerprint"),
                use_ipv6: spec.get("use_ipv6").and_then(Value::as_bool).unwrap_or(false),
                server_addr: str_field(spec, "server_addr")
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                remote_port: port_field(core, spec, "remote_port")?,
                local_addr: str_field(spec, "local_addr")
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                local_port: port_field(core, spec, "local_port")?,
                reverse_spec: str_field(spec, "reverse_spec"),
            })),
            Core::Frp => Ok(Self::Frp(FrpSpec {
                bind_port: port_field(core, spec, "bind_port")?.unwrap_or(7000),
                token: str_field(spec, "token"),
                server_addr: str_field(spec, "server_addr")
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                local_ip: str_field(spec, "local_ip").unwrap_or_else(|| "127.0.0.1".to_string()),
                local_port: port_field(core, spec, "local_port")?,
                remote_port: require_opt_port(core, spec, &["remote_port", "listen_port"])?,
                tunnel_type: str_field(spec, "type").unwrap_or_else(|| "tcp".to_string()),
            })),
        }
    }

    pub fn core(&self) -> Core {
        match self {
            Self::Backhaul(_) => Core::Backhaul,
            Self::Rathole(_) => Core::Rathole,
            Self::Chisel(_) => Core::Chisel,
            Self::Frp(_) => Core::Frp,
        }
    }

    /// Extract what the local server process needs. The requirements here are
    /// stricter than parsing: a rathole server cannot run without a token,
    /// for example, even though the node payload tolerates its absence.
    pub fn server_params(&self) -> Result<ServerParams, SpecError> {
        match self {
            Self::Backhaul(s) => Ok(ServerParams::Backhaul {
                listen_port: s.listen_port,
                token: s.token.clone(),
                transport: s.transport.clone(),
            }),
            Self::Rathole(s) => Ok(ServerParams::Rathole {
                remote_addr: s.remote_addr.clone(),
                token: s.token.clone().ok_or(SpecError::MissingField {
                    core: "rathole",
                    field: "token",
                })?,
                proxy_port: s.proxy_port,
            }),
            Self::Chisel(s) => Ok(ServerParams::Chisel {
                server_port: s.server_port,
                auth: s.auth.clone(),
                fingerprint: s.fingerprint.clone(),
                use_ipv6: s.use_ipv6,
            }),
            Self::Frp(s) => Ok(ServerParams::Frp {
                bind_port: s.bind_port,
                token: s.token.clone(),
            }),
        }
    }

    /// Re-derive the client-side configuration payload pushed to a node
    /// agent. Field layouts differ per core.
    pub fn node_payload(&self) -> Value {
        match self {
            Self::Backhaul(s) => json!({
                "listen_port": s.listen_port,
                "token": s.token,
                "transport": s.transport,
            }),
            Self::Rathole(s) => {
                let host = s
                    .remote_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(s.remote_addr.as_str());
                json!({
                    "remote_addr": format!("{}:{}", host, s.proxy_port),
                    "token": s.token,
                    "local_addr": s.local_addr,
                    "local_port": s.local_port,
                })
            }
            Self::Chisel(s) => {
                let reverse_spec = s.reverse_spec.clone().or_else(|| {
                    match (s.remote_port, s.local_port) {
                        (Some(remote), Some(local)) => {
                            Some(format!("R:{}:{}:{}", remote, s.local_addr, local))
                        }
                        _ => None,
                    }
                });
                json!({
                    "server_url": format!("http://{}:{}", s.server_addr, s.server_port),
                    "reverse_spec": reverse_spec,
                    "auth": s.auth,
                    "fingerprint": s.fingerprint,
                })
            }
            Self::Frp(s) => json!({
                "server_addr": s.server_addr,
                "server_port": s.bind_port,
                "token": s.token,
                "local_ip": s.local_ip,
                "local_port": s.local_port,
                "remote_port": s.remote_port,
                "type": s.tunnel_type,
            }),
        }
    }
}

fn str_field(spec: &Value, key: &str) -> Option<String> {
    spec.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Ports arrive as numbers or numeric strings depending on which client
/// wrote the spec.
fn port_field(core: Core, spec: &Value, key: &'static str) -> Result<Option<u16>, SpecError> {
    let value = match spec.get(key) {
        Some(v) if !v.is_null() => v,
        _ => return Ok(None),
    };
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse::<u16>().ok(),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| SpecError::InvalidField {
        core: core.as_str(),
        field: key,
        reason: format!("expected a port number, got {value}"),
    })
}

fn require_port(core: Core, spec: &Value, keys: &[&'static str]) -> Result<u16, SpecError> {
    require_opt_port(core, spec, keys)?.ok_or(SpecError::MissingField {
        core: core.as_str(),
        field: keys[0],
    })
}

fn require_opt_port(
    core: Core,
    spec: &Value,
    keys: &[&'static str],
) -> Result<Option<u16>, SpecError> {
    for key in keys {
        if let Some(port) = port_field(core, spec, key)? {
            return Ok(Some(port));
        }
    }
    Ok(None)
}
