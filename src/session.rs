// Consul sessions - the lease primitive locks are bound to

use crate::client::Client;
use crate::error::{Error, Result};
use crate::util::{format_duration, parse_duration};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const SESSION_MINIMUM_TTL: Duration = Duration::from_secs(10);
pub const SESSION_MAXIMUM_TTL: Duration = Duration::from_secs(86_400);

pub const SESSION_MINIMUM_LOCK_DELAY: Duration = Duration::ZERO;
pub const SESSION_MAXIMUM_LOCK_DELAY: Duration = Duration::from_secs(60);

/// Opaque identifier of a session, as issued by Consul.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens to locks held by a session when it is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Held locks are released; values stay in place
    Release,
    /// Keys locked by the session are deleted
    #[default]
    Delete,
}

impl SessionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionBehavior::Release => "release",
            SessionBehavior::Delete => "delete",
        }
    }
}

impl std::str::FromStr for SessionBehavior {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "release" | "" => Ok(SessionBehavior::Release),
            "delete" => Ok(SessionBehavior::Delete),
            other => Err(Error::Validation(format!(
                "session behavior must be 'release' or 'delete', got {other:?}"
            ))),
        }
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Node the session is associated with. Normally the node name of the
    /// local agent, see [`crate::Agent::self_info`].
    pub node: String,

    /// Human-readable identifier for this session
    pub name: String,

    /// Minimum time that must pass after a lock held by this session is
    /// invalidated before another session may acquire it. Gives a
    /// still-running former leader time to notice it has lost the lock.
    /// Zero disables the delay.
    pub lock_delay: Duration,

    /// How long the session survives without renewal. Lower is better: a
    /// node that silently disappears keeps its locks until this lapses.
    pub ttl: Duration,

    pub behavior: SessionBehavior,
}

impl SessionConfig {
    /// Checks the config against Consul's limits and produces the request
    /// body. Nothing invalid ever leaves the process.
    pub fn validate(&self) -> Result<SessionRequest> {
        if self.node.is_empty() {
            return Err(Error::Validation("session node required".into()));
        }
        if self.name.is_empty() {
            return Err(Error::Validation("session name required".into()));
        }
        check_limits(self.lock_delay, self.ttl)?;

        Ok(SessionRequest {
            node: self.node.clone(),
            name: self.name.clone(),
            lock_delay: format_duration(self.lock_delay),
            ttl: format_duration(self.ttl),
            behavior: self.behavior,
        })
    }
}

/// Range checks shared by session and leadership configs.
pub(crate) fn check_limits(lock_delay: Duration, ttl: Duration) -> Result<()> {
    if lock_delay < SESSION_MINIMUM_LOCK_DELAY || lock_delay > SESSION_MAXIMUM_LOCK_DELAY {
        return Err(Error::Validation(
            "session lock delay must be at least 0 but at most 60 seconds".into(),
        ));
    }
    if ttl < SESSION_MINIMUM_TTL || ttl > SESSION_MAXIMUM_TTL {
        return Err(Error::Validation(
            "session ttl must be at least 10 but at most 86400 seconds".into(),
        ));
    }
    Ok(())
}

/// Wire format of a session creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRequest {
    pub node: String,
    pub name: String,
    pub lock_delay: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub behavior: SessionBehavior,
}

/// A session as reported back by Consul.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub config: SessionConfig,
}

#[derive(Debug, Deserialize)]
struct SessionRecord {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Node", default)]
    node: String,
    #[serde(rename = "Name", default)]
    name: String,
    // nanoseconds
    #[serde(rename = "LockDelay", default)]
    lock_delay: f64,
    #[serde(rename = "TTL", default)]
    ttl: String,
    #[serde(rename = "Behavior", default)]
    behavior: String,
}

impl SessionRecord {
    fn into_info(self) -> Result<SessionInfo> {
        let ttl = if self.ttl.is_empty() {
            Duration::ZERO
        } else {
            parse_duration(&self.ttl)
                .ok_or_else(|| Error::Decode(format!("bad session ttl {:?}", self.ttl)))?
        };
        Ok(SessionInfo {
            id: SessionId(self.id),
            config: SessionConfig {
                node: self.node,
                name: self.name,
                lock_delay: Duration::from_nanos(self.lock_delay.max(0.0) as u64),
                ttl,
                behavior: self.behavior.parse()?,
            },
        })
    }
}

fn single_session(records: Vec<SessionRecord>) -> Result<Option<SessionInfo>> {
    match records.len() {
        0 => Ok(None),
        1 => records.into_iter().next().map(SessionRecord::into_info).transpose(),
        n => Err(Error::Decode(format!("expected one session, got {n}"))),
    }
}

/// The session (lease) service.
#[async_trait]
pub trait Sessions: Send + Sync {
    /// Creates a session and returns its id. The config is validated first.
    async fn create_session(&self, dc: Option<&str>, config: &SessionConfig) -> Result<SessionId>;

    /// Renews a session, returning the TTL Consul now applies to it.
    /// `Error::SessionExpired` if the session no longer exists.
    async fn renew_session(&self, dc: Option<&str>, id: &SessionId) -> Result<Duration>;

    /// Invalidates a session, applying its behavior to held locks.
    async fn destroy_session(&self, dc: Option<&str>, id: &SessionId) -> Result<()>;

    /// `None` if no such session exists.
    async fn read_session(&self, dc: Option<&str>, id: &SessionId) -> Result<Option<SessionInfo>>;

    /// All sessions belonging to `node`.
    async fn list_sessions(
        &self,
        dc: Option<&str>,
        node: &str,
    ) -> Result<BTreeMap<SessionId, SessionConfig>>;
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "ID")]
    id: SessionId,
}

#[async_trait]
impl Sessions for Client {
    async fn create_session(&self, dc: Option<&str>, config: &SessionConfig) -> Result<SessionId> {
        let request = config.validate()?;
        let body = serde_json::to_string(&request)?;
        let response: CreateResponse = self
            .put_json("/v1/session/create", &[("dc", self.datacenter(dc))], body)
            .await?;
        Ok(response.id)
    }

    async fn renew_session(&self, dc: Option<&str>, id: &SessionId) -> Result<Duration> {
        let path = format!("/v1/session/renew/{id}");
        let records: Vec<SessionRecord> =
            match self.put_json(&path, &[("dc", self.datacenter(dc))], String::new()).await {
                Ok(records) => records,
                Err(Error::NotFound { .. }) => {
                    return Err(Error::SessionExpired { id: id.to_string() })
                }
                Err(e) => return Err(e),
            };
        match single_session(records)? {
            Some(info) => Ok(info.config.ttl),
            None => Err(Error::SessionExpired { id: id.to_string() }),
        }
    }

    async fn destroy_session(&self, dc: Option<&str>, id: &SessionId) -> Result<()> {
        let path = format!("/v1/session/destroy/{id}");
        self.put_discard(&path, &[("dc", self.datacenter(dc))], String::new())
            .await
    }

    async fn read_session(&self, dc: Option<&str>, id: &SessionId) -> Result<Option<SessionInfo>> {
        let path = format!("/v1/session/info/{id}");
        let records: Vec<SessionRecord> =
            match self.get_json(&path, &[("dc", self.datacenter(dc))]).await {
                Ok(records) => records,
                Err(Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
        single_session(records)
    }

    async fn list_sessions(
        &self,
        dc: Option<&str>,
        node: &str,
    ) -> Result<BTreeMap<SessionId, SessionConfig>> {
        let path = format!("/v1/session/node/{node}");
        let records: Vec<SessionRecord> = self
            .get_json(&path, &[("dc", self.datacenter(dc))])
            .await?;
        records
            .into_iter()
            .map(|record| record.into_info().map(|info| (info.id, info.config)))
            .collect()
    }
}
