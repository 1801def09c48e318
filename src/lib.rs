#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! Leader election on top of Consul sessions and KV locks.
//!
//! Candidates call [`participate`] with the same leader key. Each one keeps a
//! session alive in the background and contends for the key with it; the
//! winner runs its [`AsLeader`] work until the lock is lost, it abdicates, or
//! the participation is shut down.
//!
//! ```no_run
//! use consul_election::{participate, Client, ClientOptions, LeadershipConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = Arc::new(Client::new(ClientOptions::from_env())?);
//! let config = LeadershipConfig::new("service/billing/leader", "http://10.0.0.5:8080");
//! let session = participate(client, config, |tenure: CancellationToken| async move {
//!     tenure.cancelled().await;
//!     anyhow::Ok(())
//! }, CancellationToken::new())
//! .await?;
//!
//! println!("leader: {}", session.current().await?);
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod client;
pub mod election;
pub mod error;
pub mod kv;
pub mod session;
pub mod util;

pub mod test_utils;

pub use agent::{Agent, AgentInfo};
pub use client::{Client, ClientOptions};
pub use election::{
    participate, AsLeader, Backend, ElectionTiming, LeaderSession, LeadershipConfig, Phase,
};
pub use error::{Error, Result};
pub use kv::{Kv, KvPair};
pub use session::{SessionBehavior, SessionConfig, SessionId, SessionInfo, Sessions};
