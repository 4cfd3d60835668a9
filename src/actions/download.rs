//! Streamed file download.

use crate::scheduler::{TaskContext, WorkError, WorkFunction, WorkResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Downloads `url` to `destination`, reporting bytes received against the
/// advertised content length.
///
/// A download that is cancelled or fails after the file was created removes
/// the partially written file.
#[derive(Debug, Clone)]
pub struct DownloadAction {
    url: String,
    destination: PathBuf,
    client: reqwest::Client,
}

impl DownloadAction {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Use a shared or preconfigured HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn fetch(&self, ctx: &TaskContext) -> Result<u64, WorkError> {
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(WorkError::Cancelled),
            response = self.client.get(&self.url).send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(WorkError::failed(format!(
                "download of {} returned HTTP {status}",
                self.url
            )));
        }

        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&self.destination).await?;

        // Once the file exists, any failure leaves it incomplete.
        match self.write_body(ctx, response, file).await {
            Ok(size) => Ok(size),
            Err(e) => {
                remove_partial(&self.destination).await;
                Err(e)
            }
        }
    }

    async fn write_body(
        &self,
        ctx: &TaskContext,
        response: reqwest::Response,
        mut file: tokio::fs::File,
    ) -> Result<u64, WorkError> {
        let expected = response.content_length().filter(|len| *len > 0);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = ctx.cancelled() => return Err(WorkError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = expected {
                ctx.set_progress(received as f64 / total as f64 * 100.0);
            }
        }

        file.flush().await?;
        Ok(received)
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove partial download: {e}"),
    }
}

#[async_trait]
impl WorkFunction for DownloadAction {
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        ctx.check_cancelled()?;
        debug!(url = %self.url, destination = %self.destination.display(), "starting download");

        let size = self.fetch(&ctx).await?;
        ctx.set_progress(100.0);
        Ok(json!({
            "url": self.url,
            "destination": self.destination.display().to_string(),
            "size": size,
        }))
    }
}
