//! In-memory fakes of every external collaborator

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storage_accounting::charge::ChargeApi;
use storage_accounting::config::Config;
use storage_accounting::identity::{AccountLookup, Directory};
use storage_accounting::pipeline::Collaborators;
use storage_accounting::receiver::ReceiverPush;
use storage_accounting::storage::{FileInfo, StorageClient};
use storage_accounting::{AccountType, IdentityRecord, QuotaRecord};

pub const PROJECT_A: &str = "root://eosproject-a.cern.ch";
pub const PROJECT_B: &str = "root://eosproject-b.cern.ch";
pub const HOME_A: &str = "root://eoshome-a.cern.ch";

/// Two shards keep listings small.
pub fn test_config(out_dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.shards = "ab".to_string();
    config.processing.progress_interval = 1;
    config.paths.output_directory = out_dir.to_path_buf();
    config
}

#[derive(Default)]
pub struct FakeStorage {
    /// host -> listed directories
    pub listings: HashMap<String, Vec<FileInfo>>,
    /// host -> account -> quota
    pub quotas: HashMap<String, HashMap<String, QuotaRecord>>,
    pub fail_list_on: Option<String>,
    pub fail_quota_on: Option<String>,
    pub ops: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn with_entity(mut self, host: &str, path: &str, uid: u64) -> Self {
        let mut attrs = HashMap::new();
        attrs.insert("ctime".to_string(), "1600000000.0".to_string());
        self.listings.entry(host.to_string()).or_default().push(FileInfo {
            path: path.to_string(),
            uid,
            attrs,
        });
        self
    }

    pub fn with_quota(mut self, host: &str, account: &str, available: i64, used: i64) -> Self {
        self.quotas
            .entry(host.to_string())
            .or_default()
            .insert(account.to_string(), QuotaRecord::new(available, used));
        self
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn list(&self, host: &str, _prefix: &str) -> Result<Vec<FileInfo>> {
        if self.fail_list_on.as_deref() == Some(host) {
            anyhow::bail!("connection refused");
        }
        Ok(self.listings.get(host).cloned().unwrap_or_default())
    }

    async fn dump_quotas(&self, host: &str, _prefix: &str) -> Result<HashMap<String, QuotaRecord>> {
        if self.fail_quota_on.as_deref() == Some(host) {
            anyhow::bail!("quota dump timed out");
        }
        Ok(self.quotas.get(host).cloned().unwrap_or_default())
    }

    async fn mkdir(&self, host: &str, dir: &str) -> Result<()> {
        self.ops.lock().unwrap().push(format!("mkdir {} {}", host, dir));
        Ok(())
    }

    async fn upload(&self, _host: &str, local: &Path, remote: &str) -> Result<()> {
        assert!(local.is_file(), "uploading missing file {}", local.display());
        self.ops.lock().unwrap().push(format!("cp {}", remote));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAccounts {
    pub names: HashMap<u64, String>,
}

impl FakeAccounts {
    pub fn with(mut self, uid: u64, account: &str) -> Self {
        self.names.insert(uid, account.to_string());
        self
    }
}

#[async_trait]
impl AccountLookup for FakeAccounts {
    async fn account_name(&self, owner_id: u64) -> Result<String> {
        self.names
            .get(&owner_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("getent: no entry for {}", owner_id))
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    pub records: HashMap<String, IdentityRecord>,
}

impl FakeDirectory {
    pub fn with_primary(mut self, account: &str, department: &str) -> Self {
        self.records.insert(
            account.to_string(),
            IdentityRecord {
                uid: "1000".to_string(),
                gid: "1000".to_string(),
                account: account.to_string(),
                name: format!("{} name", account),
                account_type: AccountType::Primary,
                department: department.to_string(),
                ..Default::default()
            },
        );
        self
    }

    pub fn with_service(mut self, account: &str, owner: &str) -> Self {
        self.records.insert(
            account.to_string(),
            IdentityRecord {
                account: account.to_string(),
                account_type: AccountType::Service,
                owner_dn: format!("CN={},OU=Users,OU=Organic Units,DC=cern,DC=ch", owner),
                ..Default::default()
            },
        );
        self
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn lookup(&self, account: &str) -> Result<Option<IdentityRecord>> {
        Ok(self.records.get(account).cloned())
    }
}

/// Records every chunk it receives and the highest number of overlapping requests.
#[derive(Default)]
pub struct FakeChargeApi {
    pub groups: HashMap<String, String>,
    pub chunks: Mutex<Vec<usize>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail: bool,
}

impl FakeChargeApi {
    pub fn with_group(mut self, account: &str, group: &str) -> Self {
        self.groups.insert(account.to_string(), group.to_string());
        self
    }
}

#[async_trait]
impl ChargeApi for FakeChargeApi {
    async fn classify(&self, accounts: &[String]) -> Result<Map<String, Value>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.chunks.lock().unwrap().push(accounts.len());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            anyhow::bail!("Charge API answered with HTTP 503");
        }

        let mut response = Map::new();
        for account in accounts {
            if let Some(group) = self.groups.get(account) {
                response.insert(
                    account.clone(),
                    json!({"type": "department", "owner": account, "charge_group": format!(" {} ", group)}),
                );
            }
        }
        Ok(response)
    }
}

#[derive(Default)]
pub struct FakeReceiver {
    pub pushes: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ReceiverPush for FakeReceiver {
    async fn push(&self, endpoint: &str, payload: &Path) -> Result<()> {
        let body: Value = serde_json::from_slice(&std::fs::read(payload)?)?;
        self.pushes.lock().unwrap().push((endpoint.to_string(), body));
        Ok(())
    }
}

pub fn collaborators(
    storage: Arc<FakeStorage>,
    accounts: FakeAccounts,
    directory: FakeDirectory,
    charges: Arc<FakeChargeApi>,
    receiver: Arc<FakeReceiver>,
) -> Collaborators {
    Collaborators {
        storage,
        accounts: Arc::new(accounts),
        directory: Arc::new(directory),
        charges,
        receiver,
    }
}
