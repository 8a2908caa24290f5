//! Charge classification
//!
//! Account names are sent to the billing-classification API in fixed-size chunks. The
//! API is shared and rate-sensitive, so chunk requests run on their own pool, one
//! request in flight by default. A failed chunk aborts the run: an incomplete charge
//! feed would produce a misleading report.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BillingConfig;
use crate::models::ChargeRecord;
use crate::pool::BoundedPool;

/// Batch classification endpoint: accounts in, `account -> fields` object out.
#[async_trait]
pub trait ChargeApi: Send + Sync {
    async fn classify(&self, accounts: &[String]) -> Result<Map<String, Value>>;
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    users: &'a [String],
}

pub struct HttpChargeApi {
    client: reqwest::Client,
    url: String,
}

impl HttpChargeApi {
    pub fn new(config: &BillingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build HTTP client for the charge API")?;

        Ok(Self {
            client,
            url: config.charge_api_url.clone(),
        })
    }
}

#[async_trait]
impl ChargeApi for HttpChargeApi {
    async fn classify(&self, accounts: &[String]) -> Result<Map<String, Value>> {
        let response = self
            .client
            .post(&self.url)
            .json(&ChargeRequest { users: accounts })
            .send()
            .await
            .with_context(|| format!("Failed to reach charge API at {}", self.url))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            anyhow::bail!("Charge API at {} answered with HTTP {}", self.url, status);
        }

        response
            .json::<Map<String, Value>>()
            .await
            .context("Failed to parse charge API response")
    }
}

pub struct ChargeResolver {
    api: Arc<dyn ChargeApi>,
    chunk_size: usize,
}

impl ChargeResolver {
    pub fn new(api: Arc<dyn ChargeApi>, chunk_size: usize) -> Self {
        Self {
            api,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunks(&self, accounts: &[String]) -> Vec<Vec<String>> {
        accounts.chunks(self.chunk_size).map(<[String]>::to_vec).collect()
    }

    /// Classify every account, one chunk per request, on `pool`.
    pub async fn resolve(
        &self,
        accounts: &[String],
        pool: &BoundedPool,
    ) -> Result<HashMap<String, ChargeRecord>> {
        let total = accounts.len();
        let chunks = self.chunks(accounts);
        let sent = Arc::new(AtomicUsize::new(0));
        let charges = Arc::new(Mutex::new(HashMap::new()));

        info!(accounts = total, chunks = chunks.len(), width = pool.width(), "Resolving charge information");

        pool.try_run(chunks, |chunk| {
            let api = self.api.clone();
            let sent = sent.clone();
            let charges = charges.clone();
            async move {
                let response = api.classify(&chunk).await?;
                let done = sent.fetch_add(chunk.len(), Ordering::Relaxed) + chunk.len();
                info!(sent = chunk.len(), received = response.len(), done, total, "Charge chunk resolved");

                let decoded = decode_response(response);
                let mut map = charges
                    .lock()
                    .map_err(|_| anyhow::anyhow!("Charge result map poisoned"))?;
                map.extend(decoded);
                Ok::<_, anyhow::Error>(())
            }
        })
        .await?;

        let map = charges
            .lock()
            .map_err(|_| anyhow::anyhow!("Charge result map poisoned"))?
            .drain()
            .collect();
        Ok(map)
    }
}

/// Field-by-field decode of a charge response. Undecodable records are skipped.
pub fn decode_response(response: Map<String, Value>) -> HashMap<String, ChargeRecord> {
    let mut charges = HashMap::with_capacity(response.len());

    for (account, value) in response {
        match serde_json::from_value::<ChargeRecord>(value) {
            Ok(record) => {
                let record = record.trimmed();
                debug!(account = %account, ?record, "Charge info for account");
                charges.insert(account, record);
            }
            Err(e) => {
                warn!(account = %account, error = %e, "Skipping undecodable charge record");
            }
        }
    }

    charges
}
