//! The client side of the v1 protocol.

use crate::wire::{CmdResult, RemoteCmd};
use dashmap::DashMap;
use hivemind_consensus::RaftMessage;
use hivemind_types::{HiveError, Message, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stateless client for one destination address.
///
/// Requests are plain POSTs with bincode bodies; the connection pool inside
/// the shared `reqwest` client may reconnect at any time, which is safe
/// because every endpoint is idempotent.
pub struct Proxy {
    base: String,
    client: reqwest::Client,
}

impl Proxy {
    pub fn new(addr: &str, client: reqwest::Client) -> Self {
        Self {
            base: format!("http://{addr}"),
            client,
        }
    }

    pub async fn send_msg(&self, msg: &Message) -> Result<()> {
        let result = self.post("/v1/msgs", hivemind_codec::encode_frame(msg)?).await?;
        result.into_result().map(|_| ())
    }

    pub async fn send_cmd(&self, cmd: &RemoteCmd) -> Result<CmdResult> {
        self.post("/v1/cmds", hivemind_codec::encode_frame(cmd)?).await
    }

    pub async fn send_raft(&self, msg: &RaftMessage) -> Result<()> {
        let result = self.post("/v1/raft", hivemind_codec::encode_frame(msg)?).await?;
        result.into_result().map(|_| ())
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<CmdResult> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .client
            .post(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| HiveError::transient(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HiveError::transient(format!("{url}: http {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HiveError::transient(format!("{url}: {e}")))?;
        debug!(url = %url, bytes = bytes.len(), "proxied request");
        hivemind_codec::decode_frame(&bytes)
    }
}

/// One proxy per destination address, created on first use.
pub struct ProxyPool {
    client: reqwest::Client,
    proxies: DashMap<String, Arc<Proxy>>,
}

impl ProxyPool {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| HiveError::fatal(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client,
            proxies: DashMap::new(),
        })
    }

    pub fn proxy(&self, addr: &str) -> Arc<Proxy> {
        self.proxies
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Proxy::new(addr, self.client.clone())))
            .clone()
    }
}
