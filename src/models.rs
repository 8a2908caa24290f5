//! Core Data Models
//!
//! This module defines the records that flow through one accounting run, from the
//! raw storage listing to the enriched per-entity record the aggregation views read.
//!
//! ## Data Flow
//!
//! 1. **Listing**: [`StorageEntity`] - one project or user home as listed on an instance
//! 2. **Identity join**: [`IdentityRecord`] - directory information for the entity owner
//! 3. **Quota join**: [`QuotaRecord`] - available/used bytes for `(account, instance)`
//! 4. **Charge join**: [`ChargeRecord`] - billing classification for the account
//! 5. **Aggregation input**: [`EnrichedEntity`] - the composition of all of the above
//!
//! Every join is an explicit map lookup; a missing lookup leaves the zero value in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A project space or user home as returned by the storage listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntity {
    #[serde(rename = "ownerId")]
    pub owner_id: u64,
    pub path: String,
    #[serde(rename = "instanceName")]
    pub instance_name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl StorageEntity {
    /// Creation date as shown in the flat report.
    pub fn created_human(&self) -> String {
        self.created_at.format("%d/%m/%Y").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccountType {
    Primary,
    Service,
    Secondary,
    #[default]
    Unknown,
}

impl AccountType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Primary" => AccountType::Primary,
            "Service" => AccountType::Service,
            "Secondary" => AccountType::Secondary,
            _ => AccountType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Primary => "Primary",
            AccountType::Service => "Service",
            AccountType::Secondary => "Secondary",
            AccountType::Unknown => "",
        }
    }

    /// Service and secondary accounts are owned by a distinct human account.
    pub fn is_delegated(&self) -> bool {
        matches!(self, AccountType::Service | AccountType::Secondary)
    }

    /// Label used as charge role for home directories, e.g. `Primary-Account`.
    pub fn human(&self) -> String {
        match self {
            AccountType::Unknown => String::new(),
            other => format!("{}-Account", other.as_str()),
        }
    }
}

/// Who is responsible for an account.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AccountOwner {
    /// Primary accounts own themselves.
    Itself,
    /// Service and secondary accounts point at the resolved human owner.
    Delegated(Box<IdentityRecord>),
    #[default]
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityRecord {
    pub uid: String,
    pub gid: String,
    pub account: String,
    pub name: String,
    pub account_type: AccountType,
    pub department: String,
    pub group: String,
    pub section: String,
    pub mail: String,
    pub phone: String,
    /// Distinguished name of the owner account, only set for delegated accounts.
    pub owner_dn: String,
    pub owner: AccountOwner,
}

impl IdentityRecord {
    /// The record of the human responsible for this account, if known.
    pub fn owner(&self) -> Option<&IdentityRecord> {
        match &self.owner {
            AccountOwner::Itself => Some(self),
            AccountOwner::Delegated(owner) => Some(owner),
            AccountOwner::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.account.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaRecord {
    #[serde(rename = "availableBytes")]
    pub available_bytes: i64,
    #[serde(rename = "usedBytes")]
    pub used_bytes: i64,
}

impl QuotaRecord {
    pub fn new(available_bytes: i64, used_bytes: i64) -> Self {
        Self {
            available_bytes: available_bytes.max(0),
            used_bytes: used_bytes.max(0),
        }
    }
}

/// Billing classification of an account, decoded loosely from the charge API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeRecord {
    #[serde(rename = "type")]
    pub charge_type: String,
    pub owner: String,
    #[serde(rename = "charge_group")]
    pub charge_group: String,
    #[serde(rename = "charge_role")]
    pub charge_role: String,
}

impl ChargeRecord {
    /// Upstream values come with incidental whitespace.
    pub fn trimmed(self) -> Self {
        Self {
            charge_type: self.charge_type.trim().to_string(),
            owner: self.owner.trim().to_string(),
            charge_group: self.charge_group.trim().to_string(),
            charge_role: self.charge_role.trim().to_string(),
        }
    }
}

/// Per-entity record every report view is computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEntity {
    pub entity: StorageEntity,
    pub identity: IdentityRecord,
    pub quota: QuotaRecord,
    /// `None` when charging was not requested for the run.
    pub charge: Option<ChargeRecord>,
    pub to_be_archived: bool,
}

impl EnrichedEntity {
    pub fn new(entity: StorageEntity, identity: IdentityRecord) -> Self {
        Self {
            entity,
            identity,
            quota: QuotaRecord::default(),
            charge: None,
            to_be_archived: false,
        }
    }

    pub fn account(&self) -> &str {
        &self.identity.account
    }

    pub fn charge_group(&self) -> &str {
        self.charge.as_ref().map(|c| c.charge_group.as_str()).unwrap_or("")
    }

    pub fn charge_role(&self) -> &str {
        self.charge.as_ref().map(|c| c.charge_role.as_str()).unwrap_or("")
    }

    pub fn charge_type(&self) -> &str {
        self.charge.as_ref().map(|c| c.charge_type.as_str()).unwrap_or("")
    }
}

/// Summed quota of an aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QuotaTotals {
    #[serde(rename = "availableBytes")]
    pub available_bytes: i64,
    #[serde(rename = "usedBytes")]
    pub used_bytes: i64,
}

impl QuotaTotals {
    pub fn add(&mut self, quota: &QuotaRecord) {
        self.available_bytes = self.available_bytes.saturating_add(quota.available_bytes);
        self.used_bytes = self.used_bytes.saturating_add(quota.used_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_type_labels() {
        assert_eq!(AccountType::parse("Primary").human(), "Primary-Account");
        assert_eq!(AccountType::parse(" Service ").human(), "Service-Account");
        assert_eq!(AccountType::parse("Robot"), AccountType::Unknown);
        assert_eq!(AccountType::Unknown.human(), "");
    }

    #[test]
    fn test_owner_of_primary_is_itself() {
        let record = IdentityRecord {
            account: "alice".to_string(),
            account_type: AccountType::Primary,
            owner: AccountOwner::Itself,
            ..Default::default()
        };
        assert_eq!(record.owner().map(|o| o.account.as_str()), Some("alice"));
        assert!(IdentityRecord::default().owner().is_none());
    }

    #[test]
    fn test_charge_record_trimmed() {
        let record = ChargeRecord {
            charge_type: "  department".to_string(),
            owner: "bob ".to_string(),
            charge_group: "\tIT ".to_string(),
            charge_role: " ".to_string(),
        }
        .trimmed();
        assert_eq!(record.charge_type, "department");
        assert_eq!(record.owner, "bob");
        assert_eq!(record.charge_group, "IT");
        assert_eq!(record.charge_role, "");
    }

    #[test]
    fn test_quota_record_never_negative() {
        let quota = QuotaRecord::new(-5, 10);
        assert_eq!(quota.available_bytes, 0);
        assert_eq!(quota.used_bytes, 10);
    }

    #[test]
    fn test_quota_totals_saturate() {
        let mut totals = QuotaTotals::default();
        totals.add(&QuotaRecord::new(i64::MAX, 7));
        totals.add(&QuotaRecord::new(1, 3));
        assert_eq!(totals.available_bytes, i64::MAX);
        assert_eq!(totals.used_bytes, 10);
    }
}
