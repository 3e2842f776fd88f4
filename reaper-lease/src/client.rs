//! HTTP client for the lease broker.
//!
//! Transport failures and unexpected statuses are retried with a quadratic
//! backoff. Answers the broker gives on purpose (nothing to acquire, already
//! in use, unknown type) are returned right away.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::error::{LeaseError, Result};
use crate::types::{Metric, Resource, ResourceState, UserData};

const MAX_ATTEMPTS: u32 = 4;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a 404 for an unknown resource type.
pub fn type_not_found_message(resource_type: &str) -> String {
    format!("resource type {:?} does not exist", resource_type)
}

enum Attempt<T> {
    Done(T),
    Retry(String),
}

/// Client acting on behalf of one owner.
#[derive(Clone)]
pub struct LeaseClient {
    http: Client,
    base_url: String,
    owner: String,
    backoff: Duration,
}

impl LeaseClient {
    pub fn new(owner: &str, base_url: &str) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Base delay between attempts; attempt `n` waits `n * n` times as long.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire one resource of `resource_type` in `state`, moving it to `dest`.
    pub async fn acquire(
        &self,
        resource_type: &str,
        state: ResourceState,
        dest: ResourceState,
    ) -> Result<Resource> {
        let resource = self
            .retry("acquire", || self.acquire_once(resource_type, state, dest))
            .await?;
        debug!(name = %resource.name, resource_type = %resource_type, state = %dest, "Acquired resource");
        Ok(resource)
    }

    /// Hand `name` back in state `dest`.
    pub async fn release(&self, name: &str, dest: ResourceState) -> Result<()> {
        self.retry("release", || async move {
            let request = self.post("/release").query(&[
                ("name", name),
                ("dest", dest.as_str()),
                ("owner", self.owner.as_str()),
            ]);
            expect_ok(request).await
        })
        .await
    }

    /// Heartbeat: set `state` on `name`, merging `user_data` when given.
    pub async fn update(
        &self,
        name: &str,
        state: ResourceState,
        user_data: Option<&UserData>,
    ) -> Result<()> {
        self.retry("update", || async move {
            let mut request = self.post("/update").query(&[
                ("name", name),
                ("owner", self.owner.as_str()),
                ("state", state.as_str()),
            ]);
            if let Some(data) = user_data {
                request = request.json(data);
            }
            expect_ok(request).await
        })
        .await
    }

    pub async fn metric(&self, resource_type: &str) -> Result<Metric> {
        self.retry("metric", || async move {
            let request = self
                .http
                .get(format!("{}/metric", self.base_url))
                .query(&[("type", resource_type)]);
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return Ok(Attempt::Retry(e.to_string())),
            };
            if response.status() != StatusCode::OK {
                return Ok(Attempt::Retry(format!("status {}", response.status())));
            }
            let metric = response
                .json()
                .await
                .map_err(|e| LeaseError::InvalidResponse(e.to_string()))?;
            Ok(Attempt::Done(metric))
        })
        .await
    }

    fn post(&self, action: &str) -> RequestBuilder {
        self.http.post(format!("{}{}", self.base_url, action))
    }

    async fn acquire_once(
        &self,
        resource_type: &str,
        state: ResourceState,
        dest: ResourceState,
    ) -> Result<Attempt<Resource>> {
        let request = self.post("/acquire").query(&[
            ("type", resource_type),
            ("state", state.as_str()),
            ("owner", self.owner.as_str()),
            ("dest", dest.as_str()),
        ]);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(e.to_string())),
        };

        match response.status() {
            StatusCode::OK => {
                let resource: Resource = response
                    .json()
                    .await
                    .map_err(|e| LeaseError::InvalidResponse(e.to_string()))?;
                if resource.name.is_empty() {
                    return Err(LeaseError::InvalidResponse(
                        "unable to parse resource".to_string(),
                    ));
                }
                Ok(Attempt::Done(resource))
            }
            StatusCode::UNAUTHORIZED => Err(LeaseError::AlreadyInUse),
            StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                if body.contains(&type_not_found_message(resource_type)) {
                    Err(LeaseError::TypeNotFound(resource_type.to_string()))
                } else {
                    Err(LeaseError::NotFound)
                }
            }
            status => Ok(Attempt::Retry(format!("status {}", status))),
        }
    }

    async fn retry<T, F, Fut>(&self, action: &str, mut work: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let mut errors = Vec::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match work().await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(error) => {
                    warn!(action = %action, attempt, error = %error, "Lease broker request failed");
                    errors.push(error);
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.backoff * attempt * attempt).await;
            }
        }

        Err(LeaseError::RetriesExhausted {
            action: action.to_string(),
            errors,
        })
    }
}

async fn expect_ok(request: RequestBuilder) -> Result<Attempt<()>> {
    match request.send().await {
        Ok(response) if response.status() == StatusCode::OK => Ok(Attempt::Done(())),
        Ok(response) => Ok(Attempt::Retry(format!("status {}", response.status()))),
        Err(e) => Ok(Attempt::Retry(e.to_string())),
    }
}
