//! Entity listing across instance shards
//!
//! Projects and user homes live on one instance per namespace initial. Every shard is
//! listed in turn; a failing shard aborts the run, since accounting on a partial
//! inventory would under-charge silently.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::{StorageConfig, SHARD_PLACEHOLDER};
use crate::models::StorageEntity;
use crate::storage::{FileInfo, StorageClient};

/// Which namespace a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Project,
    UserHome,
}

impl Category {
    fn name(&self) -> &'static str {
        match self {
            Category::Project => "project",
            Category::UserHome => "user home",
        }
    }
}

pub struct EntityLister {
    client: Arc<dyn StorageClient>,
    config: StorageConfig,
}

impl EntityLister {
    pub fn new(client: Arc<dyn StorageClient>, config: StorageConfig) -> Self {
        Self { client, config }
    }

    /// `(host, prefix)` of every shard of a category, in shard order.
    pub fn shards(&self, category: Category) -> Vec<(String, String)> {
        let (host_template, prefix) = match category {
            Category::Project => (&self.config.project_host_template, &self.config.project_prefix),
            Category::UserHome => (&self.config.home_host_template, &self.config.home_prefix),
        };

        self.config
            .shards
            .chars()
            .map(|shard| {
                let shard = shard.to_string();
                (
                    host_template.replace(SHARD_PLACEHOLDER, &shard),
                    format!("{}/{}", prefix.trim_end_matches('/'), shard),
                )
            })
            .collect()
    }

    /// List up to `limit` entities of `category`; `None` lists everything.
    pub async fn list(&self, category: Category, limit: Option<usize>) -> Result<Vec<StorageEntity>> {
        let mut entities = Vec::new();

        for (host, prefix) in self.shards(category) {
            let infos = self
                .client
                .list(&host, &prefix)
                .await
                .with_context(|| format!("Failed to list {} entities on {}", category.name(), host))?;

            info!(host = %host, prefix = %prefix, count = infos.len(), "Listed shard");
            entities.extend(infos.into_iter().map(|fi| to_entity(fi, &host)));
        }

        if let Some(limit) = limit {
            entities.truncate(limit);
        }

        info!(category = category.name(), count = entities.len(), "Listing complete");
        Ok(entities)
    }
}

fn to_entity(info: FileInfo, host: &str) -> StorageEntity {
    StorageEntity {
        owner_id: info.uid,
        created_at: parse_ctime(info.attrs.get("ctime").map(String::as_str)),
        path: info.path,
        instance_name: host.to_string(),
    }
}

/// Seconds part of a `sec.nsec` ctime attribute; anything unparsable is the epoch.
pub fn parse_ctime(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| s.split('.').next())
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
