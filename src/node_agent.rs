//! HTTP client for remote node agents
//!
//! Nodes run a tunnel client agent reachable over HTTP. The panel queries
//! tunnel status during health aggregation and pushes re-derived client
//! configurations during reset passes. Failures surface as errors; callers
//! catch and log them.

use crate::core::Core;
use crate::db::NodeRecord;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Response from a node's status endpoint.
#[derive(Debug, Deserialize)]
pub struct TunnelStatusResponse {
    pub status: String,
}

/// Client configuration pushed to a node during a reset pass.
#[derive(Debug, Serialize)]
pub struct ApplyTunnelRequest<'a> {
    pub tunnel_id: &'a str,
    pub core: Core,
    pub spec: Value,
}

pub struct NodeAgentClient {
    http: reqwest::Client,
}

impl NodeAgentClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build node agent HTTP client")?;
        Ok(Self { http })
    }

    /// Query a node's tunnel status.
    pub async fn tunnel_status(
        &self,
        node: &NodeRecord,
        token: &str,
    ) -> Result<TunnelStatusResponse> {
        let url = format!("{}/status", node.agent_url.trim_end_matches('/'));
        debug!(node_id = %node.id, %url, "querying node tunnel status");

        let mut request = self.http.get(&url);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("node {} unreachable", node.id))?;
        if !response.status().is_success() {
            return Err(anyhow!("node {} returned {}", node.id, response.status()));
        }
        response
            .json()
            .await
            .with_context(|| format!("node {} returned a malformed status body", node.id))
    }

    /// Push a re-derived client configuration to a node.
    pub async fn apply_tunnel(
        &self,
        node: &NodeRecord,
        request: &ApplyTunnelRequest<'_>,
    ) -> Result<()> {
        let url = format!("{}/tunnels/apply", node.agent_url.trim_end_matches('/'));
        debug!(
            node_id = %node.id,
            tunnel_id = request.tunnel_id,
            core = %request.core,
            %url,
            "applying tunnel config on node"
        );

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("node {} unreachable", node.id))?;
        if !response.status().is_success() {
            return Err(anyhow!("node {} returned {}", node.id, response.status()));
        }
        Ok(())
    }
}
