//! HTTP client for a remote leaf storage server.
//!
//! Speaks the storage servers' JSON protocol: write replies carry an
//! optional application error alongside the status, transport failures
//! surface as network errors tagged with the server address (which is
//! what ends up inside a `no quorum (...)` message).

use super::StorageServer;
use crate::error::{KeyplaneError, Result};
use crate::types::{Element, ServerAddr, SlotId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Serialize)]
struct InsertRequest<'a> {
    key: &'a str,
    member: &'a str,
    timestamp: i64,
    ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct InsertReply {
    #[serde(default)]
    updated: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    key: &'a str,
    member: &'a str,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct DeleteReply {
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SelectRequest<'a> {
    key: &'a str,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct SelectReply {
    #[serde(default)]
    elements: Vec<Element>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeysReply {
    #[serde(default)]
    keys: Vec<String>,
}

/// A [`StorageServer`] reached over HTTP.
pub struct HttpServerClient {
    addr: ServerAddr,
    base_url: String,
    client: reqwest::Client,
}

impl HttpServerClient {
    /// Create a client with the caller-provided per-request timeout.
    pub fn new(addr: ServerAddr, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let base_url = format!("http://{}", addr);
        Self {
            addr,
            base_url,
            client,
        }
    }

    async fn post<Req: Serialize, Reply: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Reply> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| KeyplaneError::Network(format!("{}: {}", self.addr, e)))?;
        response
            .json()
            .await
            .map_err(|e| KeyplaneError::Serialization(format!("{}: {}", self.addr, e)))
    }

    fn application_error(&self, error: Option<String>) -> Result<()> {
        match error {
            Some(message) => Err(KeyplaneError::Storage(format!("{}: {}", self.addr, message))),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl StorageServer for HttpServerClient {
    fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    async fn insert(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let reply: InsertReply = self
            .post(
                &format!("kv/{}/insert", slot_id),
                &InsertRequest {
                    key,
                    member,
                    timestamp,
                    ttl,
                },
            )
            .await?;
        self.application_error(reply.error)?;
        Ok(reply.updated)
    }

    async fn delete(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
    ) -> Result<bool> {
        let reply: DeleteReply = self
            .post(
                &format!("kv/{}/delete", slot_id),
                &DeleteRequest {
                    key,
                    member,
                    timestamp,
                },
            )
            .await?;
        self.application_error(reply.error)?;
        Ok(reply.deleted)
    }

    async fn select(&self, slot_id: SlotId, key: &str, timestamp: i64) -> Result<Vec<Element>> {
        let reply: SelectReply = self
            .post(
                &format!("kv/{}/select", slot_id),
                &SelectRequest { key, timestamp },
            )
            .await?;
        self.application_error(reply.error)?;
        Ok(reply.elements)
    }

    async fn keys(
        &self,
        slot_id: SlotId,
        batch_size: usize,
    ) -> Result<mpsc::Receiver<Vec<String>>> {
        let url = format!(
            "{}/kv/{}/keys?batch_size={}",
            self.base_url, slot_id, batch_size
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeyplaneError::Network(format!("{}: {}", self.addr, e)))?;
        let reply: KeysReply = response
            .json()
            .await
            .map_err(|e| KeyplaneError::Serialization(format!("{}: {}", self.addr, e)))?;

        // The server answers with the full key list; batching happens
        // client-side so the migration loop stays uniform across
        // implementations.
        let batches: Vec<Vec<String>> = reply
            .keys
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            let _ = tx.try_send(batch);
        }
        Ok(rx)
    }
}
