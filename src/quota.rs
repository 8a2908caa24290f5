//! Quota collection
//!
//! One quota dump per instance touched by the listing, merged into a single index keyed
//! by `(account, instance)`. The same account has independent quotas on different
//! instances, so the instance is part of the key.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use crate::models::{QuotaRecord, StorageEntity};
use crate::storage::StorageClient;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaIndex {
    quotas: HashMap<(String, String), QuotaRecord>,
}

impl QuotaIndex {
    pub fn insert(&mut self, account: &str, instance: &str, quota: QuotaRecord) {
        self.quotas
            .insert((account.to_string(), instance.to_string()), quota);
    }

    pub fn get(&self, account: &str, instance: &str) -> Option<&QuotaRecord> {
        self.quotas.get(&(account.to_string(), instance.to_string()))
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }
}

pub struct QuotaCollector {
    client: Arc<dyn StorageClient>,
    project_prefix: String,
    home_prefix: String,
}

impl QuotaCollector {
    pub fn new(client: Arc<dyn StorageClient>, config: &StorageConfig) -> Self {
        Self {
            client,
            project_prefix: config.project_prefix.clone(),
            home_prefix: config.home_prefix.clone(),
        }
    }

    /// Home instances are named after the user namespace.
    pub fn prefix_for(&self, instance: &str) -> &str {
        if instance.contains("home") {
            &self.home_prefix
        } else {
            &self.project_prefix
        }
    }

    /// Dump the quotas of every instance. Any failing instance aborts the run.
    pub async fn collect(&self, instances: &[String]) -> Result<QuotaIndex> {
        let mut index = QuotaIndex::default();

        for instance in instances {
            let prefix = self.prefix_for(instance);
            let quotas = self
                .client
                .dump_quotas(instance, prefix)
                .await
                .with_context(|| format!("Failed to dump quotas of {}", instance))?;

            info!(instance = %instance, prefix, accounts = quotas.len(), "Collected quotas");
            for (account, quota) in quotas {
                index.insert(&account, instance, quota);
            }
        }

        Ok(index)
    }
}

/// Distinct instance names, sorted.
pub fn instances_of(entities: &[StorageEntity]) -> Vec<String> {
    entities
        .iter()
        .map(|e| e.instance_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
