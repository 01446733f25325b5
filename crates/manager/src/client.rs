//! `Client`: the manager API facade used by the `cli` crate and by
//! integration tests (spec §4.I). Every mutating call is HMAC-signed
//! the same way `signer::HmacSigner` validates on the receiving end.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

use crate::signer::{HmacSigner, RequestSigner};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to manager failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("manager returned {status}: {body}")]
    Unexpected { status: StatusCode, body: String },
}

pub struct Client {
    base_url: String,
    http: reqwest::Client,
    signer: HmacSigner,
}

impl Client {
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self { base_url: base_url.into(), http: reqwest::Client::new(), signer: HmacSigner::new(secret.into()) }
    }

    async fn post_signed(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        let digest = self.signer.digest(&bytes);
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Clusterrunner-Message-Authentication-Digest", digest)
            .body(bytes)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let response = self.http.get(format!("{}{path}", self.base_url)).send().await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() && status != StatusCode::ACCEPTED {
            return Err(ClientError::Unexpected { status, body });
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }

    pub async fn post_new_build(&self, job_description: &str) -> Result<u64, ClientError> {
        let response = self.post_signed("/build", json!({ "job_description": job_description })).await?;
        Ok(response["build_id"].as_u64().unwrap_or_default())
    }

    pub async fn cancel_build(&self, build_id: u64) -> Result<Value, ClientError> {
        self.post_signed(&format!("/build/{build_id}"), json!({ "status": "canceled" })).await
    }

    pub async fn get_build_status(&self, build_id: u64) -> Result<Value, ClientError> {
        self.get(&format!("/build/{build_id}")).await
    }

    /// Returns the response body and whether artifacts are ready yet
    /// (false on a 202, matching spec §4.I).
    pub async fn get_build_artifacts(&self, build_id: u64) -> Result<(bool, Vec<u8>), ClientError> {
        let response = self.http.get(format!("{}/build/{build_id}/artifacts.zip", self.base_url)).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        Ok((status == StatusCode::OK, bytes.to_vec()))
    }

    pub async fn get_console_output(
        &self,
        build_id: u64,
        subjob_id: u32,
        atom_id: u32,
        max_lines: Option<usize>,
        offset: Option<usize>,
    ) -> Result<String, ClientError> {
        let mut url = format!("{}/build/{build_id}/subjob/{subjob_id}/atom/{atom_id}/console", self.base_url);
        let mut params = Vec::new();
        if let Some(max_lines) = max_lines {
            params.push(format!("max_lines={max_lines}"));
        }
        if let Some(offset) = offset {
            params.push(format!("offset_line={offset}"));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        let response = self.get_raw(&url).await?;
        Ok(response["content"].as_str().unwrap_or_default().to_string())
    }

    async fn get_raw(&self, url: &str) -> Result<Value, ClientError> {
        let response = self.http.get(url).send().await?;
        Self::parse(response).await
    }

    pub async fn get_workers(&self) -> Result<Value, ClientError> {
        self.get("/worker").await
    }

    /// Connects an already-running worker to the manager. The worker's
    /// session token is never invented here: it's read off the worker's
    /// own liveness endpoint and forwarded as-is, so the manager records
    /// exactly the token the worker will later present on every probe
    /// and RPC response (spec §3 Worker invariant 3).
    pub async fn connect_worker(&self, url: &str, num_executors: u32) -> Result<u64, ClientError> {
        let liveness = self.get_raw(url).await?;
        let session_id = liveness["worker"]["session_id"].as_str().unwrap_or_default().to_string();
        let response = self
            .post_signed("/worker", json!({ "worker": url, "num_executors": num_executors, "session_id": session_id }))
            .await?;
        Ok(response["worker_id"].as_u64().unwrap_or_default())
    }

    pub async fn get_worker_status(&self, worker_id: u64) -> Result<Value, ClientError> {
        self.get(&format!("/worker/{worker_id}")).await
    }

    pub async fn graceful_shutdown_workers_by_id(&self, ids: &[u64]) -> Result<Value, ClientError> {
        self.post_signed("/worker/shutdown", json!({ "workers": ids })).await
    }

    pub async fn graceful_shutdown_all_workers(&self) -> Result<Value, ClientError> {
        self.post_signed("/worker/shutdown", json!({ "shutdown_all": true })).await
    }

    /// Polls `build_status` until its `status` field is one of
    /// `statuses` or `timeout` elapses. `None` timeout waits forever
    /// (spec §5 "none means infinity").
    pub async fn block_until_build_has_status(
        &self,
        build_id: u64,
        statuses: &[&str],
        timeout: Option<Duration>,
        mut in_progress_callback: impl FnMut(&Value),
    ) -> bool {
        wait_for(
            || async {
                let Ok(body) = self.get_build_status(build_id).await else { return false };
                in_progress_callback(&body);
                body["build"]["status"].as_str().map(|s| statuses.contains(&s)).unwrap_or(false)
            },
            timeout,
            Duration::from_millis(250),
        )
        .await
    }
}

/// Generic predicate-poller (spec §4.I): re-evaluates `predicate` every
/// `poll_period` until it returns true or `timeout` elapses. `None`
/// timeout polls indefinitely.
pub async fn wait_for<F, Fut>(mut predicate: F, timeout: Option<Duration>, poll_period: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    loop {
        if predicate().await {
            return true;
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
        tokio::time::sleep(poll_period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn wait_for_returns_true_as_soon_as_the_predicate_passes() {
        let calls = AtomicU32::new(0);
        let ok = wait_for(
            || async { calls.fetch_add(1, Ordering::SeqCst) >= 2 },
            Some(Duration::from_secs(1)),
            Duration::from_millis(1),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn wait_for_times_out_when_the_predicate_never_passes() {
        let ok = wait_for(|| async { false }, Some(Duration::from_millis(20)), Duration::from_millis(5)).await;
        assert!(!ok);
    }
}
