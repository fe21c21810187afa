use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::{MonitorError, format_http_error};
use crate::transport::{EventByteStream, RunTransport};
use crate::types::{
    LaunchResponse, LoopRunBody, RunId, RunKind, RunRequest, RunSnapshotPayload, RunSummary,
    RunSummaryList, SingleRunBody,
};

pub const DEFAULT_LIST_LIMIT: usize = 20;

/// HTTP client for the run service.
#[derive(Debug, Clone)]
pub struct RunApiClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

impl RunApiClient {
    pub fn new(config: &MonitorConfig) -> Result<Self, MonitorError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            timeout: config.timeout(),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn launch_path(kind: RunKind) -> &'static str {
        match kind {
            RunKind::Single => "/run",
            RunKind::Iterative => "/loop",
        }
    }

    #[must_use]
    pub fn run_path(run_id: &RunId) -> String {
        format!("/runs/{}", run_id.as_str())
    }

    #[must_use]
    pub fn run_cancel_path(run_id: &RunId) -> String {
        format!("/runs/{}/cancel", run_id.as_str())
    }

    #[must_use]
    pub fn run_stream_path(run_id: &RunId) -> String {
        format!("/runs/{}/stream", run_id.as_str())
    }

    #[must_use]
    pub fn runs_path(limit: usize) -> String {
        format!("/runs?limit={}", limit.max(1))
    }

    pub async fn launch_run(&self, request: &RunRequest) -> Result<LaunchResponse, MonitorError> {
        let path = Self::launch_path(request.kind);
        match request.kind {
            RunKind::Single => self.post_json(path, &SingleRunBody::from(request)).await,
            RunKind::Iterative => self.post_json(path, &LoopRunBody::from(request)).await,
        }
    }

    pub async fn run_snapshot(&self, run_id: &RunId) -> Result<RunSnapshotPayload, MonitorError> {
        self.get_json(Self::run_path(run_id).as_str()).await
    }

    pub async fn cancel_run(&self, run_id: &RunId) -> Result<(), MonitorError> {
        let url = self
            .endpoint(Self::run_cancel_path(run_id).as_str())
            .ok_or(MonitorError::InvalidPath)?;
        let response = self
            .authorized(self.http.post(url.as_str()))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| MonitorError::connection(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(format_http_error(status, &body))
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, MonitorError> {
        let list: RunSummaryList = self.get_json(Self::runs_path(limit).as_str()).await?;
        Ok(list.into_runs())
    }

    /// Opens the live stream. No whole-request timeout is applied to the body.
    pub async fn run_stream(&self, run_id: &RunId) -> Result<EventByteStream, MonitorError> {
        let url = self
            .endpoint(Self::run_stream_path(run_id).as_str())
            .ok_or(MonitorError::InvalidPath)?;
        let response = self
            .authorized(self.http.get(url.as_str()))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|error| MonitorError::connection(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(format_http_error(status, &body));
        }
        debug!(run_id = %run_id, "run stream opened");

        let chunks = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|error| MonitorError::connection(error.to_string()))
        });
        Ok(Box::pin(chunks))
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, MonitorError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send_get(path).await?;
        decode_json_response(response).await
    }

    /// Launches are not retried; a duplicated POST could start a second run.
    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, MonitorError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(MonitorError::InvalidPath)?;
        let response = self
            .authorized(self.http.post(url.as_str()))
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|error| MonitorError::connection(error.to_string()))?;
        decode_json_response(response).await
    }

    async fn send_get(&self, path: &str) -> Result<reqwest::Response, MonitorError> {
        let url = self.endpoint(path).ok_or(MonitorError::InvalidPath)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = self
                .authorized(self.http.get(url.as_str()))
                .timeout(self.timeout);

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(MonitorError::Connection {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("x-request-id", format!("req_{}", Uuid::new_v4().simple()));
        match self.api_key.as_deref() {
            Some(key) => request.header(AUTHORIZATION, format!("Bearer {key}")),
            None => request,
        }
    }
}

#[async_trait]
impl RunTransport for RunApiClient {
    async fn launch(&self, request: &RunRequest) -> Result<LaunchResponse, MonitorError> {
        self.launch_run(request).await
    }

    async fn fetch_snapshot(&self, run_id: &RunId) -> Result<RunSnapshotPayload, MonitorError> {
        self.run_snapshot(run_id).await
    }

    async fn cancel(&self, run_id: &RunId) -> Result<(), MonitorError> {
        self.cancel_run(run_id).await
    }

    async fn open_stream(&self, run_id: &RunId) -> Result<EventByteStream, MonitorError> {
        self.run_stream(run_id).await
    }
}

fn normalize_base_url(base_url: &str) -> Result<String, MonitorError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(MonitorError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, MonitorError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| MonitorError::connection(error.to_string()))?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| MonitorError::protocol(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> RunApiClient {
        RunApiClient::new(&MonitorConfig::new(base_url)).expect("run client")
    }

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let client = client("https://runs.example.com/");

        assert_eq!(
            client.endpoint("/runs/r-1"),
            Some("https://runs.example.com/runs/r-1".to_string())
        );
        assert_eq!(
            client.endpoint("runs/r-1"),
            Some("https://runs.example.com/runs/r-1".to_string())
        );
        assert_eq!(client.endpoint(""), None);
    }

    #[test]
    fn path_helpers_are_deterministic() {
        let run_id = RunId::new("r-42").expect("run id");
        assert_eq!(RunApiClient::launch_path(RunKind::Single), "/run");
        assert_eq!(RunApiClient::launch_path(RunKind::Iterative), "/loop");
        assert_eq!(RunApiClient::run_path(&run_id), "/runs/r-42");
        assert_eq!(RunApiClient::run_cancel_path(&run_id), "/runs/r-42/cancel");
        assert_eq!(RunApiClient::run_stream_path(&run_id), "/runs/r-42/stream");
        assert_eq!(RunApiClient::runs_path(5), "/runs?limit=5");
        assert_eq!(RunApiClient::runs_path(0), "/runs?limit=1");
    }

    #[test]
    fn base_url_missing_is_rejected() {
        let result = RunApiClient::new(&MonitorConfig::new("   "));
        assert!(matches!(result, Err(MonitorError::BaseUrlMissing)));
    }

    #[test]
    fn blank_api_key_is_dropped() {
        let mut config = MonitorConfig::new("http://127.0.0.1:1");
        config.api_key = Some("  ".to_string());
        let client = RunApiClient::new(&config).expect("run client");
        assert!(client.api_key.is_none());
    }
}
