// Self-identification through the local agent

use crate::client::Client;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

/// A member of the gossip pool, as seen by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct AgentInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Addr", default)]
    pub address: String,
    #[serde(rename = "Port", default)]
    pub port: u16,
    #[serde(rename = "Tags", default)]
    pub tags: HashMap<String, String>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Identity of the agent this client talks to. Its `name` is the node
    /// sessions should be bound to.
    async fn self_info(&self) -> Result<AgentInfo>;

    /// Members of the LAN pool, or of the WAN pool when `wan` is set.
    async fn members(&self, wan: bool) -> Result<Vec<AgentInfo>>;

    /// Makes the agent reload its configuration.
    async fn reload(&self) -> Result<()>;

    /// Puts the node into maintenance mode, or takes it out again. An empty
    /// `reason` is left off the request.
    async fn maintenance_mode(&self, enabled: bool, reason: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct SelfResponse {
    #[serde(rename = "Member")]
    member: AgentInfo,
}

#[async_trait]
impl Agent for Client {
    async fn self_info(&self) -> Result<AgentInfo> {
        let response: SelfResponse = self.get_json("/v1/agent/self", &[]).await?;
        Ok(response.member)
    }

    async fn members(&self, wan: bool) -> Result<Vec<AgentInfo>> {
        // wan=false makes consul append the dc to member names, so only send it when set
        let wan = wan.then_some("true");
        self.get_json("/v1/agent/members", &[("wan", wan)]).await
    }

    async fn reload(&self) -> Result<()> {
        self.put_discard("/v1/agent/reload", &[], String::new()).await
    }

    async fn maintenance_mode(&self, enabled: bool, reason: &str) -> Result<()> {
        let enable = if enabled { "true" } else { "false" };
        self.put_discard(
            "/v1/agent/maintenance",
            &[("enable", Some(enable)), ("reason", Some(reason))],
            String::new(),
        )
        .await
    }
}
