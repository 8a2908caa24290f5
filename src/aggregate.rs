//! Aggregation Engine
//!
//! Joins listed entities with identity, quota and charge lookups, then computes the
//! report views from the joined set.
//!
//! ## Stages
//!
//! 1. **Join**: [`join_identities`], [`fill_quotas`] and [`fill_charges`] are explicit map
//!    lookups; a missing key leaves the zero value in place
//! 2. **Derivation**: [`derive_charge_roles`] synthesizes project roles and defaults empty
//!    group/role to `Unknown`
//! 3. **Cleaning**: [`clean`] drops entities the billing system cannot classify
//! 4. **Deduplication**: [`unique_infos`] collapses entities sharing account and quota
//!    numbers
//! 5. **Views**: group, group+role and simplified-role sums via [`upsert`], plus the
//!    billing-receiver payload
//!
//! ## Deduplication caveat
//!
//! The fingerprint is content based: two distinct entities owned by the same account
//! with identical quota numbers are counted once. The flat per-entity view is never
//! deduplicated.
//!
//! Every view is a pure function of the joined set; running [`AggregationEngine::views`]
//! twice yields identical results.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::models::{ChargeRecord, EnrichedEntity, IdentityRecord, QuotaRecord, QuotaTotals, StorageEntity};
use crate::quota::QuotaIndex;

pub const UNKNOWN: &str = "Unknown";
pub const PROJECT_SPACES: &str = "Project Spaces";
pub const HOME_DIRECTORIES: &str = "Home Directories";

pub const MESSAGE_FORMAT_VERSION: u32 = 3;

/// Attach the identity of every entity's owner. Unresolved owners get the default record.
pub fn join_identities(
    entities: Vec<StorageEntity>,
    identities: &HashMap<u64, IdentityRecord>,
) -> Vec<EnrichedEntity> {
    entities
        .into_iter()
        .map(|entity| {
            let identity = identities.get(&entity.owner_id).cloned().unwrap_or_default();
            EnrichedEntity::new(entity, identity)
        })
        .collect()
}

pub fn fill_quotas(entities: &mut [EnrichedEntity], quotas: &QuotaIndex) {
    let mut missing = 0usize;

    for e in entities.iter_mut() {
        if e.account().is_empty() {
            e.quota = QuotaRecord::default();
            continue;
        }
        match quotas.get(e.account(), &e.entity.instance_name) {
            Some(quota) => e.quota = *quota,
            None => {
                missing += 1;
                e.quota = QuotaRecord::default();
            }
        }
    }

    if missing > 0 {
        debug!(missing, "Entities without quota entry");
    }
}

/// Attach charge information. Accounts the API did not classify get an empty record.
pub fn fill_charges(entities: &mut [EnrichedEntity], charges: &HashMap<String, ChargeRecord>) {
    for e in entities.iter_mut() {
        e.charge = Some(charges.get(e.account()).cloned().unwrap_or_default());
    }
}

/// Project entities are charged as `<label> Project <basename>`, homes by account type.
pub fn derive_charge_roles(entities: &mut [EnrichedEntity], project_prefix: &str, label: &str) {
    let project_root = format!("{}/", project_prefix.trim_end_matches('/'));

    for e in entities.iter_mut() {
        let role = if e.entity.path.starts_with(&project_root) {
            format!("{} Project {}", label, basename(&e.entity.path))
        } else {
            e.identity.account_type.human()
        };

        let charge = e.charge.get_or_insert_with(ChargeRecord::default);
        charge.charge_role = if role.is_empty() { UNKNOWN.to_string() } else { role };
        if charge.charge_group.is_empty() {
            charge.charge_group = UNKNOWN.to_string();
        }
        e.to_be_archived = charge.charge_group == UNKNOWN;
    }
}

fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub fn is_classified(e: &EnrichedEntity) -> bool {
    let group = e.charge_group();
    !group.is_empty() && group != UNKNOWN
}

/// Drop unclassified entities unless `keep_invalid` is set.
pub fn clean(entities: &[EnrichedEntity], keep_invalid: bool) -> Vec<&EnrichedEntity> {
    if keep_invalid {
        return entities.iter().collect();
    }

    let kept: Vec<_> = entities.iter().filter(|e| is_classified(e)).collect();
    info!(before = entities.len(), after = kept.len(), "Removed unclassified entities");
    kept
}

/// One entity per `(account, available, used)` fingerprint.
///
/// The last occurrence wins and the output follows the order of last occurrences.
pub fn unique_infos<'a>(entities: &[&'a EnrichedEntity]) -> Vec<&'a EnrichedEntity> {
    let mut seen = HashSet::with_capacity(entities.len());
    let mut unique: Vec<&EnrichedEntity> = entities
        .iter()
        .rev()
        .filter(|e| {
            seen.insert((
                e.account().to_string(),
                e.quota.available_bytes,
                e.quota.used_bytes,
            ))
        })
        .copied()
        .collect();
    unique.reverse();
    unique
}

/// Add `quota` to the bucket at `key`, creating it at zero if absent.
pub fn upsert<K: Ord>(buckets: &mut BTreeMap<K, QuotaTotals>, key: K, quota: &QuotaRecord) {
    buckets.entry(key).or_default().add(quota);
}

pub fn by_group(entities: &[&EnrichedEntity]) -> BTreeMap<String, QuotaTotals> {
    let mut buckets = BTreeMap::new();
    for e in entities {
        upsert(&mut buckets, e.charge_group().to_string(), &e.quota);
    }
    buckets
}

pub fn by_group_role(entities: &[&EnrichedEntity]) -> BTreeMap<(String, String), QuotaTotals> {
    let mut buckets = BTreeMap::new();
    for e in entities {
        let key = (e.charge_group().to_string(), e.charge_role().to_string());
        upsert(&mut buckets, key, &e.quota);
    }
    buckets
}

pub fn simplified_role(role: &str, label: &str) -> &'static str {
    if role.starts_with(&format!("{} Project", label)) {
        PROJECT_SPACES
    } else if role.contains("Account") {
        HOME_DIRECTORIES
    } else {
        UNKNOWN
    }
}

pub fn by_simplified_role(
    entities: &[&EnrichedEntity],
    label: &str,
) -> BTreeMap<(String, String), QuotaTotals> {
    let mut buckets = BTreeMap::new();
    for e in entities {
        let key = (
            e.charge_group().to_string(),
            simplified_role(e.charge_role(), label).to_string(),
        );
        upsert(&mut buckets, key, &e.quota);
    }
    buckets
}

/// Billing-receiver message, schema version 3.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiverPayload {
    #[serde(rename = "MessageFormatVersion")]
    pub message_format_version: u32,
    #[serde(rename = "FromChargeGroup")]
    pub from_charge_group: String,
    #[serde(rename = "MetricName")]
    pub metric_name: String,
    #[serde(rename = "TimePeriod")]
    pub time_period: String,
    #[serde(rename = "TimeStamp")]
    pub time_stamp: String,
    #[serde(rename = "TimeAggregate")]
    pub time_aggregate: String,
    #[serde(rename = "AccountingDoc")]
    pub accounting_doc: String,
    pub data: Vec<ReceiverRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverRecord {
    #[serde(rename = "ToChargeGroup")]
    pub to_charge_group: String,
    #[serde(rename = "MetricValue")]
    pub metric_value: i64,
    #[serde(rename = "ToChargeRole")]
    pub to_charge_role: String,
}

/// All views of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingViews {
    pub groups: BTreeMap<String, QuotaTotals>,
    pub group_roles: BTreeMap<(String, String), QuotaTotals>,
    pub simplified: BTreeMap<(String, String), QuotaTotals>,
    pub payload: ReceiverPayload,
    /// Entities left after cleaning, before deduplication.
    pub retained: usize,
}

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    pub project_label: String,
    pub from_charge_group: String,
    pub accounting_doc: String,
}

impl AggregationEngine {
    pub fn new(
        project_label: impl Into<String>,
        from_charge_group: impl Into<String>,
        accounting_doc: impl Into<String>,
    ) -> Self {
        Self {
            project_label: project_label.into(),
            from_charge_group: from_charge_group.into(),
            accounting_doc: accounting_doc.into(),
        }
    }

    pub fn views(&self, entities: &[EnrichedEntity], keep_invalid: bool, date: NaiveDate) -> AccountingViews {
        let cleaned = clean(entities, keep_invalid);
        let unique = unique_infos(&cleaned);
        debug!(cleaned = cleaned.len(), unique = unique.len(), "Deduplicated entities");

        let group_roles = by_group_role(&unique);
        let payload = self.payload(&group_roles, date);

        AccountingViews {
            groups: by_group(&unique),
            simplified: by_simplified_role(&unique, &self.project_label),
            group_roles,
            payload,
            retained: cleaned.len(),
        }
    }

    pub fn payload(&self, group_roles: &BTreeMap<(String, String), QuotaTotals>, date: NaiveDate) -> ReceiverPayload {
        ReceiverPayload {
            message_format_version: MESSAGE_FORMAT_VERSION,
            from_charge_group: self.from_charge_group.clone(),
            metric_name: "UsedBytes".to_string(),
            time_period: "day".to_string(),
            time_stamp: date.format("%Y-%m-%d").to_string(),
            time_aggregate: "avg".to_string(),
            accounting_doc: self.accounting_doc.clone(),
            data: group_roles
                .iter()
                .map(|((group, role), totals)| ReceiverRecord {
                    to_charge_group: group.clone(),
                    metric_value: totals.used_bytes,
                    to_charge_role: role.clone(),
                })
                .collect(),
        }
    }
}
