// Key-value store access, including the session-bound lock operations

use crate::client::Client;
use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::util::trim_key;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

/// A decoded entry of the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvPair {
    pub key: String,
    /// Decoded value; empty when nothing was stored
    pub value: String,
    /// Session currently holding the lock on this key, if any
    pub session: Option<SessionId>,
    pub lock_index: u64,
    pub modify_index: u64,
}

impl KvPair {
    pub fn is_locked(&self) -> bool {
        self.session.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    lock_index: u64,
    #[serde(default)]
    modify_index: u64,
}

impl RawPair {
    fn decode(self) -> Result<KvPair> {
        let value = match self.value {
            Some(encoded) => String::from_utf8(STANDARD.decode(encoded)?)
                .map_err(|e| Error::Decode(format!("value of {:?} is not utf-8: {e}", self.key)))?,
            None => String::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()).map(SessionId::from),
            lock_index: self.lock_index,
            modify_index: self.modify_index,
        })
    }
}

/// The key-value store built into Consul.
///
/// Keys and values are treated as strings. Every method takes an optional
/// datacenter; `None` means the client default.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Full entry at `key`, or `None` if the key has never been written.
    async fn get_pair(&self, dc: Option<&str>, key: &str) -> Result<Option<KvPair>>;

    /// Value at `key`; `Error::NotFound` if absent.
    async fn get(&self, dc: Option<&str>, key: &str) -> Result<String> {
        self.get_pair(dc, key)
            .await?
            .map(|pair| pair.value)
            .ok_or_else(|| Error::NotFound { path: key.to_string() })
    }

    async fn put(&self, dc: Option<&str>, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, dc: Option<&str>, key: &str) -> Result<()>;

    /// Subpaths of `prefix` in ascending order.
    async fn keys(&self, dc: Option<&str>, prefix: &str) -> Result<Vec<String>>;

    /// Every `(key, value)` below `prefix` in ascending key order.
    async fn recurse(&self, dc: Option<&str>, prefix: &str) -> Result<Vec<(String, String)>>;

    /// CAS write that succeeds only if `key` is unlocked or already locked
    /// by `session`.
    async fn acquire(
        &self,
        dc: Option<&str>,
        key: &str,
        session: &SessionId,
        value: &str,
    ) -> Result<bool>;

    /// CAS write that unlocks `key`; succeeds only if `session` holds it.
    async fn release(
        &self,
        dc: Option<&str>,
        key: &str,
        session: &SessionId,
        value: &str,
    ) -> Result<bool>;
}

fn kv_path(key: &str) -> String {
    format!("/v1/kv/{}", trim_key(key))
}

#[async_trait]
impl Kv for Client {
    async fn get_pair(&self, dc: Option<&str>, key: &str) -> Result<Option<KvPair>> {
        let path = kv_path(key);
        let raw: Vec<RawPair> = match self.get_json(&path, &[("dc", self.datacenter(dc))]).await {
            Ok(raw) => raw,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        raw.into_iter().next().map(RawPair::decode).transpose()
    }

    async fn put(&self, dc: Option<&str>, key: &str, value: &str) -> Result<()> {
        let path = kv_path(key);
        self.put_discard(&path, &[("dc", self.datacenter(dc))], value.to_string())
            .await
    }

    async fn delete(&self, dc: Option<&str>, key: &str) -> Result<()> {
        let path = kv_path(key);
        self.delete_path(&path, &[("dc", self.datacenter(dc))]).await
    }

    async fn keys(&self, dc: Option<&str>, prefix: &str) -> Result<Vec<String>> {
        let path = kv_path(prefix);
        let params = [("dc", self.datacenter(dc)), ("keys", Some("true"))];
        let mut keys: Vec<String> = match self.get_json(&path, &params).await {
            Ok(keys) => keys,
            Err(Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        keys.sort();
        Ok(keys)
    }

    async fn recurse(&self, dc: Option<&str>, prefix: &str) -> Result<Vec<(String, String)>> {
        let path = kv_path(prefix);
        let params = [("dc", self.datacenter(dc)), ("recurse", Some("true"))];
        let raw: Vec<RawPair> = match self.get_json(&path, &params).await {
            Ok(raw) => raw,
            Err(Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut pairs = raw
            .into_iter()
            .map(|r| r.decode().map(|p| (p.key, p.value)))
            .collect::<Result<Vec<_>>>()?;
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pairs)
    }

    async fn acquire(
        &self,
        dc: Option<&str>,
        key: &str,
        session: &SessionId,
        value: &str,
    ) -> Result<bool> {
        let path = kv_path(key);
        let params = [("dc", self.datacenter(dc)), ("acquire", Some(session.as_str()))];
        self.put_json(&path, &params, value.to_string()).await
    }

    async fn release(
        &self,
        dc: Option<&str>,
        key: &str,
        session: &SessionId,
        value: &str,
    ) -> Result<bool> {
        let path = kv_path(key);
        let params = [("dc", self.datacenter(dc)), ("release", Some(session.as_str()))];
        self.put_json(&path, &params, value.to_string()).await
    }
}
