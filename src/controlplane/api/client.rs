//! Pool Service Client
//!
//! Thin HTTP client for the REST API, used by the command-line surface.
//! Error bodies are turned back into [`Error::Api`] so the caller sees the
//! same kind (and exit code) the server produced.

use super::rest::{ApiErrorResponse, ConnectBody, CreatePoolBody, CreatePoolResponse, EvictBody};
use crate::controlplane::service::PoolInfo;
use crate::error::{Error, Result};
use crate::membership::{ConnectionHandle, EvictionReport};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Client of one pool service endpoint
pub struct PoolClient {
    client: Client,
    base_url: String,
}

impl PoolClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        match response.json::<ApiErrorResponse>().await {
            Ok(body) => {
                debug!(%status, kind = %body.error, "request rejected");
                Err(Error::Api {
                    kind: body.error,
                    message: body.message,
                })
            }
            Err(_) => Err(Error::Api {
                kind: "remote_error".into(),
                message: format!("server returned {}", status),
            }),
        }
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn create_pool(&self, body: &CreatePoolBody) -> Result<CreatePoolResponse> {
        self.json(self.client.post(self.url("/v1/pools")).json(body))
            .await
    }

    pub async fn connect(&self, uuid: &str, body: &ConnectBody) -> Result<ConnectionHandle> {
        let url = self.url(&format!("/v1/pools/{}/connect", uuid));
        self.json(self.client.post(url).json(body)).await
    }

    pub async fn evict(&self, uuid: &str, body: &EvictBody) -> Result<EvictionReport> {
        let url = self.url(&format!("/v1/pools/{}/evict", uuid));
        self.json(self.client.post(url).json(body)).await
    }

    pub async fn destroy(&self, uuid: &str, group: Option<&str>, force: bool) -> Result<()> {
        let url = self.url(&format!("/v1/pools/{}", uuid));
        let mut request = self.client.delete(url).query(&[("force", force.to_string())]);
        if let Some(group) = group {
            request = request.query(&[("group", group)]);
        }
        self.send(request).await?;
        Ok(())
    }

    pub async fn query(&self, uuid: &str, group: Option<&str>) -> Result<PoolInfo> {
        let url = self.url(&format!("/v1/pools/{}", uuid));
        let mut request = self.client.get(url);
        if let Some(group) = group {
            request = request.query(&[("group", group)]);
        }
        self.json(request).await
    }

    pub async fn list(&self, group: Option<&str>) -> Result<Vec<PoolInfo>> {
        let mut request = self.client.get(self.url("/v1/pools"));
        if let Some(group) = group {
            request = request.query(&[("group", group)]);
        }
        self.json(request).await
    }

    pub async fn disconnect(&self, handle: &str) -> Result<bool> {
        let url = self.url(&format!("/v1/handles/{}", handle));
        let body: serde_json::Value = self.json(self.client.delete(url)).await?;
        Ok(body["removed"].as_bool().unwrap_or(false))
    }
}
