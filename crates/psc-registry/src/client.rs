//! HTTP client for the registry service.
//!
//! Each operation has a single-attempt `try_*` form and a deadline-bounded
//! form that sleeps and retries on transient failures. Once the deadline
//! passes the bounded form returns [`RegistryError::Timeout`], which agents
//! treat as fatal.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use psc_core::RegistryId;

use crate::error::{ApiErrorDetail, RegistryError};
use crate::schema::entries::{QueryResponse, RegisterResponse};
use crate::store::{Entry, EntryData, EntryFilter};

/// Default pause between retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    retry_interval: Duration,
}

impl RegistryClient {
    pub fn new(host: &str, port: u16) -> Self {
        RegistryClient {
            http: reqwest::Client::new(),
            base_url: format!("http://{}:{}", host, port),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn try_register(&self, data: &EntryData) -> Result<RegistryId, RegistryError> {
        let resp = self
            .http
            .post(format!("{}/entries", self.base_url))
            .json(data)
            .send()
            .await?;
        let body: RegisterResponse = decode("register", resp).await?;
        Ok(body.id)
    }

    pub async fn try_change(&self, id: RegistryId, data: &EntryData) -> Result<(), RegistryError> {
        let resp = self
            .http
            .put(format!("{}/entries/{}", self.base_url, id))
            .json(data)
            .send()
            .await?;
        decode::<serde_json::Value>("change", resp).await.map(|_| ())
    }

    pub async fn try_delete(&self, id: RegistryId) -> Result<(), RegistryError> {
        let resp = self
            .http
            .delete(format!("{}/entries/{}", self.base_url, id))
            .send()
            .await?;
        decode::<serde_json::Value>("delete", resp).await.map(|_| ())
    }

    pub async fn try_query(&self, filter: &EntryFilter) -> Result<Vec<Entry>, RegistryError> {
        let resp = self
            .http
            .post(format!("{}/entries/query", self.base_url))
            .json(filter)
            .send()
            .await?;
        let body: QueryResponse = decode("query", resp).await?;
        Ok(body.entries)
    }

    pub async fn register(&self, data: &EntryData, deadline: Instant) -> Result<RegistryId, RegistryError> {
        self.retry_until("register", deadline, || self.try_register(data))
            .await
    }

    pub async fn change(
        &self,
        id: RegistryId,
        data: &EntryData,
        deadline: Instant,
    ) -> Result<(), RegistryError> {
        self.retry_until("change", deadline, || self.try_change(id, data))
            .await
    }

    pub async fn delete(&self, id: RegistryId, deadline: Instant) -> Result<(), RegistryError> {
        self.retry_until("delete", deadline, || self.try_delete(id))
            .await
    }

    pub async fn query(&self, filter: &EntryFilter, deadline: Instant) -> Result<Vec<Entry>, RegistryError> {
        self.retry_until("query", deadline, || self.try_query(filter))
            .await
    }

    /// Polls `query` until it returns at least one entry.
    ///
    /// Used to wait for a peer that has not registered yet.
    pub async fn query_nonempty(
        &self,
        filter: &EntryFilter,
        deadline: Instant,
    ) -> Result<Vec<Entry>, RegistryError> {
        loop {
            let found = self.query(filter, deadline).await?;
            if !found.is_empty() {
                return Ok(found);
            }
            if Instant::now() + self.retry_interval > deadline {
                return Err(RegistryError::Timeout { op: "query" });
            }
            tracing::debug!(?filter, "no matching registry entry yet");
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn retry_until<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Instant,
        mut attempt: F,
    ) -> Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if Instant::now() + self.retry_interval > deadline {
                        tracing::error!(op, error = %err, "registry deadline exceeded");
                        return Err(RegistryError::Timeout { op });
                    }
                    tracing::warn!(op, error = %err, "registry call failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(op: &'static str, resp: reqwest::Response) -> Result<T, RegistryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let message = match resp.json::<serde_json::Value>().await {
        Ok(body) => serde_json::from_value::<ApiErrorDetail>(body["error"].clone())
            .map(|d| d.message)
            .unwrap_or_default(),
        Err(_) => String::new(),
    };
    Err(RegistryError::Rejected {
        op,
        status: status.as_u16(),
        message,
    })
}
