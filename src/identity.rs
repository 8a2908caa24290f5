//! Identity resolution
//!
//! An entity owner id is turned into a local account name, the account is looked up in
//! the directory, and delegated accounts get their human owner attached. Every failure
//! on that path degrades to an empty [`IdentityRecord`]; one bad identity never aborts
//! a run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DirectoryConfig;
use crate::models::{AccountOwner, AccountType, IdentityRecord};
use crate::pool::BoundedPool;

/// Numeric owner id to local account name.
#[async_trait]
pub trait AccountLookup: Send + Sync {
    async fn account_name(&self, owner_id: u64) -> Result<String>;
}

/// Account name to directory record. `Ok(None)` means the account does not exist.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, account: &str) -> Result<Option<IdentityRecord>>;
}

pub struct IdentityResolver {
    accounts: Arc<dyn AccountLookup>,
    directory: Arc<dyn Directory>,
}

impl IdentityResolver {
    pub fn new(accounts: Arc<dyn AccountLookup>, directory: Arc<dyn Directory>) -> Self {
        Self { accounts, directory }
    }

    /// Resolve one owner id. Never fails.
    pub async fn resolve(&self, owner_id: u64) -> IdentityRecord {
        let account = match self.accounts.account_name(owner_id).await {
            Ok(account) => account,
            Err(e) => {
                debug!(owner_id, error = %e, "No local account for owner id");
                return IdentityRecord::default();
            }
        };

        let mut record = self.lookup_or_default(&account).await;

        if record.account_type.is_delegated() {
            let owner_account = extract_cn(&record.owner_dn);
            let owner = if owner_account.is_empty() {
                IdentityRecord::default()
            } else {
                self.lookup_or_default(owner_account).await
            };
            record.owner = AccountOwner::Delegated(Box::new(owner));
        } else if record.account_type == AccountType::Primary {
            record.owner = AccountOwner::Itself;
        }

        record
    }

    async fn lookup_or_default(&self, account: &str) -> IdentityRecord {
        match self.directory.lookup(account).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(account, "Account not found in directory");
                IdentityRecord::default()
            }
            Err(e) => {
                warn!(account, error = %e, "Directory lookup failed");
                IdentityRecord::default()
            }
        }
    }

    /// Resolve every distinct owner id on `pool`.
    pub async fn resolve_all(
        self: Arc<Self>,
        owner_ids: impl IntoIterator<Item = u64>,
        pool: &BoundedPool,
    ) -> Result<HashMap<u64, IdentityRecord>> {
        let distinct: BTreeSet<u64> = owner_ids.into_iter().collect();
        let results = Arc::new(Mutex::new(HashMap::with_capacity(distinct.len())));

        info!(owners = distinct.len(), width = pool.width(), "Resolving identities");

        pool.try_run(distinct, |owner_id| {
            let resolver = self.clone();
            let results = results.clone();
            async move {
                let record = resolver.resolve(owner_id).await;
                results
                    .lock()
                    .map_err(|_| anyhow::anyhow!("Identity result map poisoned"))?
                    .insert(owner_id, record);
                Ok(())
            }
        })
        .await?;

        let map = results
            .lock()
            .map_err(|_| anyhow::anyhow!("Identity result map poisoned"))?
            .drain()
            .collect();
        Ok(map)
    }
}

/// First RDN value of a DN: `CN=jdoe,OU=Users,DC=cern,DC=ch` gives `jdoe`.
pub fn extract_cn(dn: &str) -> &str {
    dn.split(',')
        .next()
        .and_then(|rdn| rdn.split_once('='))
        .map(|(_, value)| value.trim())
        .unwrap_or("")
}

/// Resolves owner ids through the name service switch with `getent passwd`.
pub struct GetentLookup {
    binary: String,
    timeout: Duration,
}

impl GetentLookup {
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            binary: config.getent_binary.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl AccountLookup for GetentLookup {
    async fn account_name(&self, owner_id: u64) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("passwd")
            .arg(owner_id.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("getent timed out for uid {}", owner_id))?
            .with_context(|| format!("Failed to start {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("uid {} not known ({})", owner_id, output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let name = stdout.split(':').next().unwrap_or("").trim();
        if name.is_empty() {
            anyhow::bail!("uid {} has an empty passwd entry", owner_id);
        }
        Ok(name.to_string())
    }
}

/// Directory lookups through the OpenLDAP `ldapsearch` client.
pub struct LdapSearchDirectory {
    binary: String,
    uri: String,
    base_dn: String,
    timeout: Duration,
}

const LDAP_ATTRIBUTES: [&str; 11] = [
    "cn",
    "displayName",
    "cernAccountType",
    "mail",
    "telephoneNumber",
    "division",
    "cernGroup",
    "cernSection",
    "cernAccountOwner",
    "uidNumber",
    "gidNumber",
];

impl LdapSearchDirectory {
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            binary: config.ldapsearch_binary.clone(),
            uri: config.ldap_uri.clone(),
            base_dn: config.base_dn.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl Directory for LdapSearchDirectory {
    async fn lookup(&self, account: &str) -> Result<Option<IdentityRecord>> {
        let filter = format!(
            "(&(objectClass=user)(samaccountname={}))",
            escape_filter_value(account)
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(["-x", "-LLL", "-o", "ldif-wrap=no"])
            .args(["-H", self.uri.as_str(), "-b", self.base_dn.as_str()])
            .arg(&filter)
            .args(LDAP_ATTRIBUTES)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("ldapsearch timed out for {}", account))?
            .with_context(|| format!("Failed to start {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!(
                "ldapsearch failed for {} ({}): {}",
                account,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let ldif = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ldif_entry(&ldif).map(|attrs| record_from_attrs(&attrs)))
    }
}

/// RFC 4515 escaping of an assertion value.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Attributes of the first entry of an LDIF document. Only the first value of a
/// multi-valued attribute is kept.
pub fn parse_ldif_entry(ldif: &str) -> Option<HashMap<String, String>> {
    // unfold continuation lines
    let mut lines: Vec<String> = Vec::new();
    for raw in ldif.lines() {
        if let Some(cont) = raw.strip_prefix(' ') {
            if let Some(last) = lines.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        lines.push(raw.to_string());
    }

    let mut attrs = HashMap::new();
    let mut seen_entry = false;

    for line in &lines {
        if line.starts_with('#') {
            continue;
        }
        if line.trim().is_empty() {
            if seen_entry {
                break;
            }
            continue;
        }

        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };

        let value = if let Some(encoded) = rest.strip_prefix(':') {
            match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!(attribute = name, error = %e, "Skipping undecodable LDIF value");
                    continue;
                }
            }
        } else {
            rest.trim().to_string()
        };

        if name.eq_ignore_ascii_case("dn") {
            seen_entry = true;
            continue;
        }
        attrs.entry(name.to_string()).or_insert(value);
    }

    seen_entry.then_some(attrs)
}

fn record_from_attrs(attrs: &HashMap<String, String>) -> IdentityRecord {
    let get = |name: &str| attrs.get(name).cloned().unwrap_or_default();

    IdentityRecord {
        uid: get("uidNumber"),
        gid: get("gidNumber"),
        account: get("cn"),
        name: get("displayName"),
        account_type: AccountType::parse(&get("cernAccountType")),
        department: get("division"),
        group: get("cernGroup"),
        section: get("cernSection"),
        mail: get("mail"),
        phone: get("telephoneNumber"),
        owner_dn: get("cernAccountOwner"),
        owner: AccountOwner::Unresolved,
    }
}
