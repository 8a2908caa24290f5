//! Billing receiver push and report archival

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{ArchiveConfig, BillingConfig};
use crate::storage::StorageClient;

/// Delivers the receiver payload file to a billing endpoint.
#[async_trait]
pub trait ReceiverPush: Send + Sync {
    async fn push(&self, endpoint: &str, payload: &Path) -> Result<()>;
}

pub struct HttpReceiver {
    client: reqwest::Client,
    api_key: String,
}

impl HttpReceiver {
    pub fn new(config: &BillingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build HTTP client for the billing receiver")?;

        Ok(Self {
            client,
            api_key: config.receiver_api_key.clone(),
        })
    }
}

#[async_trait]
impl ReceiverPush for HttpReceiver {
    async fn push(&self, endpoint: &str, payload: &Path) -> Result<()> {
        let body = tokio::fs::read(payload)
            .await
            .with_context(|| format!("Failed to read payload {}", payload.display()))?;

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("API-Key", &self.api_key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to push data to billing receiver {}", endpoint))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Billing receiver {} answered with HTTP {}: {}", endpoint, status, text.trim());
        }

        info!(endpoint, response = %text.trim(), "Pushed data to billing receiver");
        Ok(())
    }
}

/// Copies produced files to a dated directory of the archive area.
pub struct Archiver {
    client: Arc<dyn StorageClient>,
    host: String,
    directory: String,
}

impl Archiver {
    pub fn new(client: Arc<dyn StorageClient>, config: &ArchiveConfig) -> Self {
        Self {
            client,
            host: config.host.clone(),
            directory: config.directory.clone(),
        }
    }

    /// `<directory>/YYYY/MM/DD`
    pub fn dated_dir(&self, date: NaiveDate) -> String {
        format!(
            "{}/{}",
            self.directory.trim_end_matches('/'),
            date.format("%Y/%m/%d")
        )
    }

    pub async fn archive(&self, files: &[PathBuf], date: NaiveDate) -> Result<String> {
        let dir = self.dated_dir(date);

        self.client
            .mkdir(&self.host, &dir)
            .await
            .with_context(|| format!("Failed to create archive directory {} on {}", dir, self.host))?;

        for file in files {
            let name = file
                .file_name()
                .with_context(|| format!("Archived path {} has no file name", file.display()))?
                .to_string_lossy();
            let remote = format!("{}/{}", dir, name);

            self.client
                .upload(&self.host, file, &remote)
                .await
                .with_context(|| format!("Failed to archive {} to {}", file.display(), remote))?;
        }

        info!(host = %self.host, dir = %dir, files = files.len(), "Archived report files");
        Ok(dir)
    }
}
