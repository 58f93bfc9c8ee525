//! HTTP client for the composer's worker-facing endpoints.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::debug;
use trx_models::{CompletionOutcome, CompletionReport, DispatchResponse, NextSubtaskRequest, ProgressReport, TaskId};

use crate::error::{WorkerError, WorkerResult};
use crate::retry::{retry_async, RetryConfig};
use crate::stopped;

/// Longer than the composer's blocking dequeue.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ComposerClient {
    http: reqwest::Client,
    base_url: String,
    identity: NextSubtaskRequest,
    transfer_retry: RetryConfig,
}

impl ComposerClient {
    pub fn new(base_url: impl Into<String>, identity: NextSubtaskRequest) -> WorkerResult<Self> {
        let http = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
            transfer_retry: RetryConfig::new("transfer"),
        })
    }

    pub fn with_transfer_retry(mut self, retry: RetryConfig) -> Self {
        self.transfer_retry = retry;
        self
    }

    pub fn identity(&self) -> &NextSubtaskRequest {
        &self.identity
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Ask for the next subtask of this worker's routing class.
    pub async fn next_subtask(&self) -> WorkerResult<DispatchResponse> {
        let response = self
            .http
            .post(self.url("/internal/v1/dispatch/next"))
            .timeout(DISPATCH_TIMEOUT)
            .json(&self.identity)
            .send()
            .await
            .map_err(transport)?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn report_progress(&self, task_id: TaskId, delta_ms: i64) -> WorkerResult<()> {
        let report = ProgressReport { task_id, delta_ms };
        let response = self
            .http
            .post(self.url("/internal/v1/progress"))
            .json(&report)
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        Ok(())
    }

    /// Deliver a completion report, retrying while the composer is unreachable.
    pub async fn report_completion(&self, report: &CompletionReport) -> WorkerResult<CompletionOutcome> {
        let retry = RetryConfig::new("report_completion").with_max_retries(5);
        retry_async(&retry, WorkerError::is_transient, || async move {
            let response = self
                .http
                .post(self.url("/internal/v1/completions"))
                .json(report)
                .send()
                .await
                .map_err(transport)?;
            Ok(check(response).await?.json().await?)
        })
        .await
        .into_result()
    }

    /// Fetch `url` into `dst`. Returns the number of bytes written.
    pub async fn download(&self, url: &str, dst: &Path, cancel: &watch::Receiver<bool>) -> WorkerResult<u64> {
        retry_async(&self.transfer_retry, WorkerError::is_transient, || {
            self.try_download(url, dst, cancel.clone())
        })
        .await
        .into_result()
    }

    async fn try_download(&self, url: &str, dst: &Path, mut cancel: watch::Receiver<bool>) -> WorkerResult<u64> {
        let response = self.http.get(url).send().await.map_err(transport)?;
        let mut stream = check(response).await?.bytes_stream();

        let partial = dst.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                _ = stopped(&mut cancel) => return Err(WorkerError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(chunk) => {
                    let chunk = chunk.map_err(transport)?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                None => break,
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dst).await?;
        debug!(url, bytes = written, "Downloaded");
        Ok(written)
    }

    /// Upload `file` as `{push_to}/{part}/{name}`.
    pub async fn upload(&self, push_to: &str, part: u32, name: &str, file: &Path) -> WorkerResult<()> {
        let url = format!("{}/{}/{}", push_to.trim_end_matches('/'), part, name);
        let url = url.as_str();
        retry_async(&self.transfer_retry, WorkerError::is_transient, || async move {
            let body = tokio::fs::File::open(file).await?;
            let response = self.http.put(url).body(body).send().await.map_err(transport)?;
            check(response).await?;
            Ok(())
        })
        .await
        .into_result()
    }
}

/// Connection-level failures mean the composer is unreachable.
fn transport(e: reqwest::Error) -> WorkerError {
    if e.is_connect() || e.is_timeout() {
        WorkerError::Unavailable(e.to_string())
    } else {
        WorkerError::Http(e)
    }
}

async fn check(response: reqwest::Response) -> WorkerResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::GONE => WorkerError::TaskGone,
        StatusCode::SERVICE_UNAVAILABLE => WorkerError::Unavailable(body),
        _ => WorkerError::Rejected {
            status: status.as_u16(),
            body,
        },
    })
}
