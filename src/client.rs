// HTTP plumbing for talking to a Consul agent

use crate::error::{Error, Result};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

pub const DEFAULT_ADDRESS: &str = "http://localhost:8500";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connection settings for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base URL of the agent, e.g. `http://localhost:8500`
    pub address: String,

    /// Per request timeout
    pub http_timeout: Duration,

    /// Accept any TLS certificate presented by the agent
    pub skip_tls_verification: bool,

    /// ACL token sent with every request
    pub token: Option<String>,

    /// Datacenter used when a call does not name one. `None` means the
    /// datacenter of the agent being talked to.
    pub datacenter: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            http_timeout: DEFAULT_TIMEOUT,
            skip_tls_verification: false,
            token: None,
            datacenter: None,
        }
    }
}

impl ClientOptions {
    /// Defaults overridden by `CONSUL_HTTP_ADDR`, `CONSUL_HTTP_TOKEN` and
    /// `CONSUL_DATACENTER` when they are set and non-empty.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let mut opts = Self::default();
        if let Some(address) = var("CONSUL_HTTP_ADDR") {
            opts.address = if address.contains("://") {
                address
            } else {
                format!("http://{address}")
            };
        }
        opts.token = var("CONSUL_HTTP_TOKEN");
        opts.datacenter = var("CONSUL_DATACENTER");
        opts
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.datacenter = Some(dc.into());
        self
    }

    pub fn with_skip_tls_verification(mut self, skip: bool) -> Self {
        self.skip_tls_verification = skip;
        self
    }
}

/// A Consul HTTP API client.
///
/// Implements [`crate::Kv`], [`crate::Sessions`] and [`crate::Agent`], and can
/// therefore be handed to [`crate::participate`]. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Client {
    opts: ClientOptions,
    http: reqwest::Client,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opts.http_timeout)
            .danger_accept_invalid_certs(opts.skip_tls_verification)
            .build()?;
        Ok(Self { opts, http })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    /// The datacenter a request should target: the explicit one, else the
    /// client default, else none (the agent's own).
    pub(crate) fn datacenter<'a>(&'a self, dc: Option<&'a str>) -> Option<&'a str> {
        dc.or(self.opts.datacenter.as_deref())
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, Option<&str>)],
    ) -> Result<T> {
        let response = self.send(Method::GET, path, params, None).await?;
        decode(path, response).await
    }

    pub(crate) async fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, Option<&str>)],
        body: String,
    ) -> Result<T> {
        let response = self.send(Method::PUT, path, params, Some(body)).await?;
        decode(path, response).await
    }

    /// PUT whose response body is irrelevant.
    pub(crate) async fn put_discard(
        &self,
        path: &str,
        params: &[(&str, Option<&str>)],
        body: String,
    ) -> Result<()> {
        self.send(Method::PUT, path, params, Some(body)).await?;
        Ok(())
    }

    pub(crate) async fn delete_path(&self, path: &str, params: &[(&str, Option<&str>)]) -> Result<()> {
        self.send(Method::DELETE, path, params, None).await?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, Option<&str>)],
        body: Option<String>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.opts.address.trim_end_matches('/'), path);
        let query: Vec<(&str, &str)> = params
            .iter()
            .filter_map(|(name, value)| match value {
                Some(v) if !v.is_empty() => Some((*name, *v)),
                _ => None,
            })
            .collect();

        trace!(%method, %url, ?query, "consul request");

        let mut request = self.http.request(method, &url).query(&query);
        if let Some(token) = &self.opts.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound { path: path.to_string() });
        }

        // the body usually carries consul's explanation
        let body = response.text().await.unwrap_or_default();
        Err(Error::Status {
            code: status.as_u16(),
            path: path.to_string(),
            body: body.trim().to_string(),
        })
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Decode(format!("{path}: {e}")))
}
