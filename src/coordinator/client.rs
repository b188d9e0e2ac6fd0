//! Coordinator → worker calls.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::WorkerEndpoint;
use crate::error::DispatchError;
use crate::protocol::{AcceptResponse, CancelRequest, DispatchRequest, SignedBody};

pub const EDGE_CLIENT_ID_HEADER: &str = "CF-Access-Client-Id";
pub const EDGE_CLIENT_SECRET_HEADER: &str = "CF-Access-Client-Secret";

/// Signed calls to a worker's HTTP surface.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn dispatch(
        &self,
        worker: &WorkerEndpoint,
        request: &DispatchRequest,
    ) -> Result<AcceptResponse, DispatchError>;

    async fn cancel(
        &self,
        worker: &WorkerEndpoint,
        request: &CancelRequest,
    ) -> Result<(), DispatchError>;
}

/// [`WorkerClient`] over HTTP with a bounded timeout on every call.
pub struct HttpWorkerClient {
    client: reqwest::Client,
    secret: SecretString,
    timeout: Duration,
}

impl HttpWorkerClient {
    pub fn new(secret: SecretString, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Unreachable {
                worker: "*".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            secret,
            timeout,
        })
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        worker: &WorkerEndpoint,
        path: &str,
        payload: &T,
    ) -> Result<reqwest::Response, DispatchError> {
        let signed = SignedBody::new(self.secret.expose_secret().as_bytes(), payload)?;
        let url = format!("{}{}", worker.base_url, path);
        let mut request = signed.apply(self.client.post(&url));
        if let Some(access) = &worker.access {
            request = request
                .header(EDGE_CLIENT_ID_HEADER, &access.client_id)
                .header(EDGE_CLIENT_SECRET_HEADER, access.client_secret.expose_secret());
        }
        debug!(worker = %worker.name, url = %url, "Calling worker");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout {
                    worker: worker.name.clone(),
                    timeout: self.timeout,
                }
            } else {
                DispatchError::Unreachable {
                    worker: worker.name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                worker: worker.name.clone(),
                status,
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn dispatch(
        &self,
        worker: &WorkerEndpoint,
        request: &DispatchRequest,
    ) -> Result<AcceptResponse, DispatchError> {
        let response = self.post(worker, "/tasks", request).await?;
        response
            .json::<AcceptResponse>()
            .await
            .map_err(|e| DispatchError::Unreachable {
                worker: worker.name.clone(),
                reason: format!("invalid accept response: {e}"),
            })
    }

    async fn cancel(
        &self,
        worker: &WorkerEndpoint,
        request: &CancelRequest,
    ) -> Result<(), DispatchError> {
        let path = format!("/tasks/{}/cancel", request.task_id);
        self.post(worker, &path, request).await?;
        Ok(())
    }
}
