// In-memory Consul for tests
//
// Implements the KV, session and agent APIs with Consul's locking rules.
// Time is measured on the tokio clock, so paused-clock tests can drive
// session expiry and lock delays.

use crate::agent::{Agent, AgentInfo};
use crate::error::{Error, Result};
use crate::kv::{Kv, KvPair};
use crate::session::{SessionBehavior, SessionConfig, SessionId, SessionInfo, Sessions};
use crate::util::trim_key;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Consul only reaps a session once twice its TTL has passed.
const TTL_MULTIPLIER: u32 = 2;

#[derive(Debug)]
struct FakeSession {
    config: SessionConfig,
    expires: Instant,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    session: Option<SessionId>,
    lock_index: u64,
    modify_index: u64,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, FakeSession>,
    kv: BTreeMap<String, Entry>,
    /// Keys that may not be acquired until the given instant
    lock_delays: HashMap<String, Instant>,
    next_session: u64,
    index: u64,
    unreachable: bool,
    failing_acquires: usize,
    failing_renewals: usize,
    /// Time an acquire spends in flight before the server applies it
    acquire_latency: Duration,
    maintenance: Option<String>,
    reloads: usize,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn reap(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.invalidate(&id, now);
        }
        self.lock_delays.retain(|_, until| *until > now);
    }

    /// Drops a session and applies its behavior to every key it holds.
    fn invalidate(&mut self, id: &SessionId, now: Instant) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        let held: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, e)| e.session.as_ref() == Some(id))
            .map(|(k, _)| k.clone())
            .collect();

        for key in held {
            match session.config.behavior {
                SessionBehavior::Delete => {
                    self.kv.remove(&key);
                }
                SessionBehavior::Release => {
                    let index = self.bump();
                    if let Some(entry) = self.kv.get_mut(&key) {
                        entry.session = None;
                        entry.modify_index = index;
                    }
                }
            }
            if session.config.lock_delay > Duration::ZERO {
                self.lock_delays.insert(key, now + session.config.lock_delay);
            }
        }
    }

    fn pair(&self, key: &str) -> Option<KvPair> {
        self.kv.get(key).map(|e| KvPair {
            key: key.to_string(),
            value: e.value.clone(),
            session: e.session.clone(),
            lock_index: e.lock_index,
            modify_index: e.modify_index,
        })
    }
}

/// CAS-correct in-memory stand-in for a Consul agent.
#[derive(Debug)]
pub struct FakeConsul {
    node: String,
    inner: Mutex<Inner>,
    requests: AtomicUsize,
}

impl FakeConsul {
    /// A fake whose agent reports `node` as its name.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            inner: Mutex::new(Inner::default()),
            requests: AtomicUsize::new(0),
        }
    }

    /// While set, every request fails with a 503.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// The next `n` acquire requests fail with a 500.
    pub fn fail_next_acquires(&self, n: usize) {
        self.inner.lock().failing_acquires = n;
    }

    /// The next `n` renew requests fail with a 500.
    pub fn fail_next_renewals(&self, n: usize) {
        self.inner.lock().failing_renewals = n;
    }

    /// Every later acquire reaches the server only after `latency` on the
    /// tokio clock, leaving it in flight meanwhile.
    pub fn set_acquire_latency(&self, latency: Duration) {
        self.inner.lock().acquire_latency = latency;
    }

    /// Reason given when the agent was put in maintenance mode, if it is.
    pub fn maintenance(&self) -> Option<String> {
        self.inner.lock().maintenance.clone()
    }

    /// Number of agent reloads requested.
    pub fn reload_count(&self) -> usize {
        self.inner.lock().reloads
    }

    /// Invalidates a session as if its TTL had run out.
    pub fn expire_session(&self, id: &SessionId) {
        self.inner.lock().invalidate(id, Instant::now());
    }

    /// Number of API requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Session holding the lock on `key`.
    pub fn holder(&self, key: &str) -> Option<SessionId> {
        let mut inner = self.inner.lock();
        inner.reap(Instant::now());
        inner.kv.get(trim_key(key)).and_then(|e| e.session.clone())
    }

    pub fn session_exists(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.lock();
        inner.reap(Instant::now());
        inner.sessions.contains_key(id)
    }

    /// Counts the request and applies expiry. Fails while unreachable.
    fn begin(&self, path: &str) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if inner.unreachable {
            return Err(Error::Status {
                code: 503,
                path: path.to_string(),
                body: "No cluster leader".into(),
            });
        }
        inner.reap(Instant::now());
        Ok(inner)
    }
}

fn server_error(path: &str, body: &str) -> Error {
    Error::Status {
        code: 500,
        path: path.to_string(),
        body: body.to_string(),
    }
}

#[async_trait]
impl Kv for FakeConsul {
    async fn get_pair(&self, _dc: Option<&str>, key: &str) -> Result<Option<KvPair>> {
        let inner = self.begin(key)?;
        Ok(inner.pair(trim_key(key)))
    }

    async fn put(&self, _dc: Option<&str>, key: &str, value: &str) -> Result<()> {
        let mut inner = self.begin(key)?;
        let index = inner.bump();
        let entry = inner.kv.entry(trim_key(key).to_string()).or_insert(Entry {
            value: String::new(),
            session: None,
            lock_index: 0,
            modify_index: 0,
        });
        entry.value = value.to_string();
        entry.modify_index = index;
        Ok(())
    }

    async fn delete(&self, _dc: Option<&str>, key: &str) -> Result<()> {
        let mut inner = self.begin(key)?;
        inner.kv.remove(trim_key(key));
        Ok(())
    }

    async fn keys(&self, _dc: Option<&str>, prefix: &str) -> Result<Vec<String>> {
        let inner = self.begin(prefix)?;
        let prefix = trim_key(prefix);
        Ok(inner
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn recurse(&self, _dc: Option<&str>, prefix: &str) -> Result<Vec<(String, String)>> {
        let inner = self.begin(prefix)?;
        let prefix = trim_key(prefix);
        Ok(inner
            .kv
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn acquire(
        &self,
        _dc: Option<&str>,
        key: &str,
        session: &SessionId,
        value: &str,
    ) -> Result<bool> {
        let latency = self.inner.lock().acquire_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.begin(key)?;
        if inner.failing_acquires > 0 {
            inner.failing_acquires -= 1;
            return Err(server_error(key, "injected acquire failure"));
        }
        if !inner.sessions.contains_key(session) {
            return Err(server_error(key, &format!("invalid session \"{session}\"")));
        }

        let key = trim_key(key).to_string();
        if let Some(until) = inner.lock_delays.get(&key) {
            if *until > Instant::now() {
                return Ok(false);
            }
        }

        let index = inner.bump();
        let entry = inner.kv.entry(key).or_insert(Entry {
            value: String::new(),
            session: None,
            lock_index: 0,
            modify_index: 0,
        });
        match &entry.session {
            Some(holder) if holder != session => return Ok(false),
            Some(_) => {}
            None => {
                entry.session = Some(session.clone());
                entry.lock_index += 1;
            }
        }
        entry.value = value.to_string();
        entry.modify_index = index;
        Ok(true)
    }

    async fn release(
        &self,
        _dc: Option<&str>,
        key: &str,
        session: &SessionId,
        value: &str,
    ) -> Result<bool> {
        let mut inner = self.begin(key)?;
        let index = inner.bump();
        match inner.kv.get_mut(trim_key(key)) {
            Some(entry) if entry.session.as_ref() == Some(session) => {
                entry.session = None;
                entry.value = value.to_string();
                entry.modify_index = index;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl Sessions for FakeConsul {
    async fn create_session(&self, _dc: Option<&str>, config: &SessionConfig) -> Result<SessionId> {
        config.validate()?;
        let mut inner = self.begin("/v1/session/create")?;
        inner.next_session += 1;
        let id = SessionId::new(format!("{:08x}-fake-session", inner.next_session));
        inner.sessions.insert(
            id.clone(),
            FakeSession {
                config: config.clone(),
                expires: Instant::now() + config.ttl * TTL_MULTIPLIER,
            },
        );
        Ok(id)
    }

    async fn renew_session(&self, _dc: Option<&str>, id: &SessionId) -> Result<Duration> {
        let mut inner = self.begin("/v1/session/renew")?;
        if inner.failing_renewals > 0 {
            inner.failing_renewals -= 1;
            return Err(server_error("/v1/session/renew", "injected renewal failure"));
        }
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.expires = Instant::now() + session.config.ttl * TTL_MULTIPLIER;
                Ok(session.config.ttl)
            }
            None => Err(Error::SessionExpired { id: id.to_string() }),
        }
    }

    async fn destroy_session(&self, _dc: Option<&str>, id: &SessionId) -> Result<()> {
        let mut inner = self.begin("/v1/session/destroy")?;
        inner.invalidate(id, Instant::now());
        Ok(())
    }

    async fn read_session(&self, _dc: Option<&str>, id: &SessionId) -> Result<Option<SessionInfo>> {
        let inner = self.begin("/v1/session/info")?;
        Ok(inner.sessions.get(id).map(|s| SessionInfo {
            id: id.clone(),
            config: s.config.clone(),
        }))
    }

    async fn list_sessions(
        &self,
        _dc: Option<&str>,
        node: &str,
    ) -> Result<BTreeMap<SessionId, SessionConfig>> {
        let inner = self.begin("/v1/session/node")?;
        Ok(inner
            .sessions
            .iter()
            .filter(|(_, s)| s.config.node == node)
            .map(|(id, s)| (id.clone(), s.config.clone()))
            .collect())
    }
}

#[async_trait]
impl Agent for FakeConsul {
    async fn self_info(&self) -> Result<AgentInfo> {
        let _inner = self.begin("/v1/agent/self")?;
        Ok(AgentInfo {
            name: self.node.clone(),
            address: "127.0.0.1".into(),
            port: 8301,
            tags: HashMap::new(),
        })
    }

    async fn members(&self, _wan: bool) -> Result<Vec<AgentInfo>> {
        Ok(vec![self.self_info().await?])
    }

    async fn reload(&self) -> Result<()> {
        let mut inner = self.begin("/v1/agent/reload")?;
        inner.reloads += 1;
        Ok(())
    }

    async fn maintenance_mode(&self, enabled: bool, reason: &str) -> Result<()> {
        let mut inner = self.begin("/v1/agent/maintenance")?;
        inner.maintenance = enabled.then(|| reason.to_string());
        Ok(())
    }
}
