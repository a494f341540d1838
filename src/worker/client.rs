//! HTTP transport to external worker instances.
//!
//! Workers expose a start endpoint taking a multipart request (session key,
//! callback URL, configuration payload, exported input datasets) and reply
//! with their own process id. Status and cancel endpoints are templates with
//! an `{id}` placeholder. Timeouts and rejections are reported as distinct
//! error variants so callers can log them apart.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;

use crate::config::InstanceConfig;
use crate::error::WorkerError;

/// One named part of the start request body.
#[derive(Debug, Clone)]
pub struct StartPart {
    pub name: String,
    pub file_name: String,
    pub payload: Vec<u8>,
}

/// The assembled start request for one dispatch.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Relative start endpoint.
    pub endpoint: String,
    /// Session key identifying the dispatch, echoed back by the worker.
    pub session_key: String,
    /// Callback URL the worker reports completion to.
    pub callback_url: String,
    /// Serialized job configuration.
    pub configuration: String,
    /// Exported input datasets and other named parts.
    pub parts: Vec<StartPart>,
}

/// Body of a successful start response.
#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    /// Worker-assigned process identifier.
    pub process_id: String,
}

/// Structured error body a worker may return alongside a non-2xx status.
#[derive(Debug, Clone, Deserialize)]
struct WorkerErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Transport seam to worker instances. Implemented over HTTP in production
/// and by recording fakes in tests.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Dispatches a start request to an instance and returns the worker's
    /// process id.
    async fn start_process(
        &self,
        instance: &InstanceConfig,
        request: &StartRequest,
    ) -> Result<StartResponse, WorkerError>;

    /// Fetches the current status of a running process. The document is
    /// opaque to the engine and forwarded verbatim.
    async fn fetch_status(
        &self,
        instance: &InstanceConfig,
        endpoint: &str,
    ) -> Result<serde_json::Value, WorkerError>;

    /// Asks the worker to cancel a running process. Best-effort: the
    /// response body and status are ignored, only transport failures
    /// surface.
    async fn cancel(
        &self,
        instance: &InstanceConfig,
        endpoint: &str,
        session_key: &str,
        external_id: &str,
    ) -> Result<(), WorkerError>;

    /// Probes an instance's health endpoint. Any failure counts as down.
    async fn probe_health(&self, instance: &InstanceConfig, endpoint: &str, timeout: Duration)
        -> bool;
}

/// Substitutes the worker-assigned id into an endpoint template.
pub fn render_endpoint(template: &str, external_id: &str) -> String {
    template.replace("{id}", external_id)
}

/// Production transport over reqwest.
pub struct HttpWorkerTransport {
    http_client: Client,
}

/// Health body workers answer with when up.
#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

impl HttpWorkerTransport {
    /// Creates a transport with the given dispatch timeout.
    pub fn new(dispatch_timeout: Duration) -> Result<Self, WorkerError> {
        let http_client = Client::builder()
            .timeout(dispatch_timeout)
            .build()
            .map_err(|e| WorkerError::Request(e.to_string()))?;
        Ok(Self { http_client })
    }

    fn url(instance: &InstanceConfig, endpoint: &str) -> String {
        format!(
            "{}/{}",
            instance.url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    /// Maps a non-2xx response into a worker error, surfacing a structured
    /// error body when the worker sent one.
    async fn rejection(response: reqwest::Response) -> WorkerError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<WorkerErrorBody>(&body) {
            if parsed.code.is_some() || parsed.message.is_some() {
                return WorkerError::ErrorBody {
                    code: parsed.code.unwrap_or_else(|| "UNKNOWN".to_string()),
                    message: parsed.message.unwrap_or_default(),
                };
            }
        }
        WorkerError::UnexpectedStatus { status, body }
    }

    fn transport_error(context: &str, error: reqwest::Error) -> WorkerError {
        if error.is_timeout() {
            WorkerError::Timeout(context.to_string())
        } else {
            WorkerError::Request(format!("{}: {}", context, error))
        }
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn start_process(
        &self,
        instance: &InstanceConfig,
        request: &StartRequest,
    ) -> Result<StartResponse, WorkerError> {
        let mut form = Form::new()
            .text("session_key", request.session_key.clone())
            .text("callback", request.callback_url.clone())
            .text("configuration", request.configuration.clone());
        for part in &request.parts {
            form = form.part(
                part.name.clone(),
                Part::bytes(part.payload.clone()).file_name(part.file_name.clone()),
            );
        }

        let url = Self::url(instance, &request.endpoint);
        tracing::debug!(url = %url, parts = request.parts.len(), "Dispatching start request");

        let response = self
            .http_client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::transport_error("start", e))?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        response
            .json::<StartResponse>()
            .await
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }

    async fn fetch_status(
        &self,
        instance: &InstanceConfig,
        endpoint: &str,
    ) -> Result<serde_json::Value, WorkerError> {
        let url = Self::url(instance, endpoint);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error("status", e))?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }

    async fn cancel(
        &self,
        instance: &InstanceConfig,
        endpoint: &str,
        session_key: &str,
        external_id: &str,
    ) -> Result<(), WorkerError> {
        let url = Self::url(instance, endpoint);
        let form = [("session_key", session_key), ("pid", external_id)];
        let response = self
            .http_client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Self::transport_error("cancel", e))?;

        // Best-effort: a worker that no longer knows the process answers
        // with an error we have no use for.
        tracing::debug!(url = %url, status = %response.status(), "Cancel request sent");
        Ok(())
    }

    async fn probe_health(
        &self,
        instance: &InstanceConfig,
        endpoint: &str,
        timeout: Duration,
    ) -> bool {
        let url = Self::url(instance, endpoint);
        match self.http_client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthBody>().await {
                    Ok(body) => body.status.eq_ignore_ascii_case("up"),
                    Err(_) => false,
                }
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Health probe failed");
                false
            }
        }
    }
}
