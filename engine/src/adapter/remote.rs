//! Remote-API tier.
//!
//! Each adapter call maps to one HTTP request against the record API served
//! by `groundwork-server`. Connection failures, timeouts and 5xx responses are
//! retryable; they are retried once before surfacing as
//! [`Error::Remote`] with `retryable: true`.

use super::{Adapter, AdapterKind};
use crate::config::RemoteConfig;
use crate::error::Result;
use crate::query::Predicate;
use crate::record::Record;
use crate::Error;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of `POST /collections/{c}/count`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountRequest {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
}

/// Response of `POST /collections/{c}/count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub count: usize,
}

/// Response of `DELETE /collections/{c}/records/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResponse {
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteAdapter {
    client: Client,
    base_url: Url,
}

impl RemoteAdapter {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Remote {
                retryable: false,
                message: e.to_string(),
            })?;
        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| Error::Remote {
                retryable: false,
                message: format!("invalid base url '{}'", config.base_url),
            })?;
        Ok(Self { client, base_url })
    }

    /// Base url extended by `segments`, each percent-encoded as one path
    /// segment so ids may contain `/`, `?` or `#`.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Remote {
                retryable: false,
                message: format!("invalid base url '{}'", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn records_url(&self, collection: &str) -> Result<Url> {
        self.url(&["collections", collection, "records"])
    }

    fn record_url(&self, collection: &str, id: &str) -> Result<Url> {
        self.url(&["collections", collection, "records", id])
    }

    /// Send a request, retrying once on a retryable failure.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        match Self::attempt(build()).await {
            Err(err) if err.is_retryable() => {
                tracing::debug!(error = %err, "remote request failed, retrying once");
                Self::attempt(build()).await
            }
            other => other,
        }
    }

    async fn attempt(request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_server_error() {
            return Err(Error::Remote {
                retryable: true,
                message: format!("server returned {}", response.status()),
            });
        }
        Ok(response)
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::Remote {
        retryable: err.is_timeout() || err.is_connect() || err.is_request(),
        message: err.to_string(),
    }
}

async fn rejected(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::Remote {
        retryable: false,
        message: format!("server returned {status}: {body}"),
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response.json::<T>().await.map_err(|e| Error::Remote {
        retryable: false,
        message: format!("invalid response body: {e}"),
    })
}

#[async_trait]
impl Adapter for RemoteAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Remote
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let url = self.record_url(collection, id)?;
        let response = self.send(|| self.client.get(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(decode(response).await?)),
            _ => Err(rejected(response).await),
        }
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let url = self.records_url(collection)?;
        let response = self.send(|| self.client.get(url.clone())).await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        decode(response).await
    }

    async fn insert(&self, collection: &str, record: &Record) -> Result<()> {
        let url = self.records_url(collection)?;
        let response = self.send(|| self.client.post(url.clone()).json(record)).await?;
        match response.status() {
            StatusCode::CONFLICT => Err(Error::RecordAlreadyExists {
                collection: collection.to_string(),
                id: record.id.clone(),
            }),
            s if s.is_success() => Ok(()),
            _ => Err(rejected(response).await),
        }
    }

    async fn update(&self, collection: &str, record: &Record) -> Result<()> {
        let url = self.record_url(collection, &record.id)?;
        let response = self.send(|| self.client.put(url.clone()).json(record)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::not_found(collection, &record.id)),
            s if s.is_success() => Ok(()),
            _ => Err(rejected(response).await),
        }
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let url = self.record_url(collection, id)?;
        let response = self.send(|| self.client.delete(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(decode::<RemoveResponse>(response).await?.removed),
            _ => Err(rejected(response).await),
        }
    }

    async fn count(&self, collection: &str, predicates: &[Predicate]) -> Result<usize> {
        let url = self.url(&["collections", collection, "count"])?;
        let body = CountRequest {
            predicates: predicates.to_vec(),
        };
        let response = self.send(|| self.client.post(url.clone()).json(&body)).await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(decode::<CountResponse>(response).await?.count)
    }
}
