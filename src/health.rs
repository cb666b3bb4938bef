//! Per-core health aggregation
//!
//! For every core, two orthogonal signals reported side by side: whether the
//! panel itself has live server processes, and whether the remote nodes
//! referenced by active tunnels respond through their agents. The two are
//! never merged into one boolean; callers interpret both.

use crate::core::Core;
use crate::db::Database;
use crate::node_agent::NodeAgentClient;
use crate::registry::CoreRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelStatus {
    Healthy,
    NoActiveServers,
    /// No lifecycle manager registered for this core
    Unknown,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Connected,
    Disconnected,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub status: NodeStatus,
    pub active_tunnels: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreHealth {
    pub core: Core,
    pub panel_status: PanelStatus,
    pub panel_healthy: bool,
    pub nodes_status: HashMap<String, NodeHealth>,
}

pub struct HealthAggregator {
    registry: Arc<CoreRegistry>,
    db: Arc<Database>,
    agent: Arc<NodeAgentClient>,
}

impl HealthAggregator {
    pub fn new(
        registry: Arc<CoreRegistry>,
        db: Arc<Database>,
        agent: Arc<NodeAgentClient>,
    ) -> Self {
        Self {
            registry,
            db,
            agent,
        }
    }

    /// Health report for every core.
    pub async fn collect(&self) -> Vec<CoreHealth> {
        let mut report = Vec::with_capacity(Core::ALL.len());
        for core in Core::ALL {
            report.push(self.core_health(core).await);
        }
        report
    }

    async fn core_health(&self, core: Core) -> CoreHealth {
        let (panel_status, panel_healthy) = match self.registry.get(core) {
            None => (PanelStatus::Unknown, false),
            Some(manager) => {
                if manager.list_active().is_empty() {
                    (PanelStatus::NoActiveServers, false)
                } else {
                    (PanelStatus::Healthy, true)
                }
            }
        };

        let mut nodes_status = HashMap::new();
        match self.db.active_tunnels(core) {
            Ok(tunnels) => {
                let mut node_ids: Vec<String> =
                    tunnels.iter().filter_map(|t| t.node_id.clone()).collect();
                node_ids.sort();
                node_ids.dedup();

                for node_id in node_ids {
                    let node = match self.db.get_node(&node_id) {
                        Ok(Some(node)) => node,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(core = %core, node_id = %node_id, error = %e, "failed to load node");
                            continue;
                        }
                    };

                    let active_tunnels = tunnels
                        .iter()
                        .filter(|t| t.node_id.as_deref() == Some(node_id.as_str()))
                        .count();

                    let (healthy, status) = match self.agent.tunnel_status(&node, "").await {
                        Ok(response) if response.status == "ok" => (true, NodeStatus::Connected),
                        Ok(_) => (false, NodeStatus::Disconnected),
                        Err(e) => {
                            error!(core = %core, node_id = %node_id, error = %e, "node health check failed");
                            (false, NodeStatus::Error)
                        }
                    };

                    nodes_status.insert(
                        node_id,
                        NodeHealth {
                            healthy,
                            status,
                            active_tunnels,
                        },
                    );
                }
            }
            Err(e) => {
                error!(core = %core, error = %e, "failed to enumerate active tunnels");
            }
        }

        CoreHealth {
            core,
            panel_status,
            panel_healthy,
            nodes_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_serialize_in_snake_case() {
        assert_eq!(
            serde_json::to_string(&PanelStatus::NoActiveServers).unwrap(),
            "\"no_active_servers\""
        );
        assert_eq!(
            serde_json::to_string(&NodeStatus::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }

    #[test]
    fn core_health_serializes_both_signals() {
        let mut nodes_status = HashMap::new();
        nodes_status.insert(
            "n1".to_string(),
            NodeHealth {
                healthy: true,
                status: NodeStatus::Connected,
                active_tunnels: 2,
            },
        );
        let health = CoreHealth {
            core: Core::Rathole,
            panel_status: PanelStatus::Healthy,
            panel_healthy: true,
            nodes_status,
        };

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["core"], "rathole");
        assert_eq!(json["panel_status"], "healthy");
        assert_eq!(json["panel_healthy"], true);
        assert_eq!(json["nodes_status"]["n1"]["status"], "connected");
        assert_eq!(json["nodes_status"]["n1"]["active_tunnels"], 2);
    }
}
