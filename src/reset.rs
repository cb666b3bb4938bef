//! Best-effort per-core reset orchestration
//!
//! A reset pass converges a core toward its desired state: every active
//! tunnel's local server process is stopped and restarted, then each touched
//! node gets a freshly derived client configuration. There is no rollback;
//! individual tunnel failures are logged and the pass continues.

use crate::core::{Core, TunnelSpec};
use crate::db::{Database, TunnelRecord};
use crate::node_agent::{ApplyTunnelRequest, NodeAgentClient};
use crate::registry::CoreRegistry;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay between stop and restart of one tunnel's server, and between config
/// pushes to a node, letting sockets quiesce
const SETTLE_DELAY: Duration = Duration::from_millis(500);

pub struct ResetOrchestrator {
    registry: Arc<CoreRegistry>,
    db: Arc<Database>,
    agent: Arc<NodeAgentClient>,
    settle: Duration,
}

impl ResetOrchestrator {
    pub fn new(
        registry: Arc<CoreRegistry>,
        db: Arc<Database>,
        agent: Arc<NodeAgentClient>,
    ) -> Self {
        Self {
            registry,
            db,
            agent,
            settle: SETTLE_DELAY,
        }
    }

    /// Override the settle delay (tests use a short one).
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Restart every active tunnel's local server for `core`, then push
    /// re-derived client configs to each touched node. Only store failures
    /// abort the pass; everything else is logged per tunnel.
    pub async fn reset_core(&self, core: Core) -> Result<()> {
        let tunnels = self.db.active_tunnels(core)?;
        info!(core = %core, tunnels = tunnels.len(), "starting reset pass");

        if let Some(manager) = self.registry.get(core) {
            for tunnel in &tunnels {
                let params = match TunnelSpec::from_value(core, &tunnel.spec)
                    .and_then(|spec| spec.server_params())
                {
                    Ok(params) => params,
                    Err(e) => {
                        warn!(
                            core = %core,
                            tunnel_id = %tunnel.id,
                            error = %e,
                            "skipping local restart"
                        );
                        continue;
                    }
                };

                manager.stop(&tunnel.id).await;
                tokio::time::sleep(self.settle).await;
                if let Err(e) = manager.start(&tunnel.id, &params).await {
                    error!(
                        core = %core,
                        tunnel_id = %tunnel.id,
                        error = %e,
                        "failed to restart server"
                    );
                }
            }
        } else {
            warn!(core = %core, "no lifecycle manager registered, skipping local restarts");
        }

        self.apply_node_configs(core, &tunnels).await;

        info!(core = %core, "reset pass complete");
        Ok(())
    }

    async fn apply_node_configs(&self, core: Core, tunnels: &[TunnelRecord]) {
        let mut node_ids: Vec<String> = tunnels.iter().filter_map(|t| t.node_id.clone()).collect();
        node_ids.sort();
        node_ids.dedup();

        for node_id in node_ids {
            let node = match self.db.get_node(&node_id) {
                Ok(Some(node)) => node,
                Ok(None) => {
                    warn!(core = %core, node_id = %node_id, "tunnel references an unknown node");
                    continue;
                }
                Err(e) => {
                    error!(core = %core, node_id = %node_id, error = %e, "failed to load node");
                    continue;
                }
            };

            for tunnel in tunnels
                .iter()
                .filter(|t| t.node_id.as_deref() == Some(node_id.as_str()))
            {
                let payload = match TunnelSpec::from_value(core, &tunnel.spec) {
                    Ok(spec) => spec.node_payload(),
                    Err(e) => {
                        warn!(
                            core = %core,
                            tunnel_id = %tunnel.id,
                            error = %e,
                            "skipping node config push"
                        );
                        continue;
                    }
                };

                let request = ApplyTunnelRequest {
                    tunnel_id: &tunnel.id,
                    core,
                    spec: payload,
                };
                if let Err(e) = self.agent.apply_tunnel(&node, &request).await {
                    error!(
                        core = %core,
                        tunnel_id = %tunnel.id,
                        node_id = %node.id,
                        error = %e,
                        "failed to apply tunnel config on node"
                    );
                }
                tokio::time::sleep(self.settle).await;
            }
        }
    }
}
