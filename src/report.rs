//! Report Output
//!
//! Renders the per-entity table and the aggregate views as tab-separated text files
//! with an upper-case header row, writes the billing-receiver payload as JSON, and
//! prints the run summary on the console.
//!
//! ## Files
//!
//! - [`FLAT_FILE`] - one row per listed entity, never deduplicated
//! - [`GROUPS_FILE`] - sums per charge group
//! - [`GROUP_ROLES_FILE`] - sums per charge group and role
//! - [`SIMPLIFIED_FILE`] - sums per charge group and simplified role
//! - [`RECEIVER_FILE`] - schema v3 billing-receiver payload

use anyhow::{Context, Result};
use chrono::NaiveDate;
use colored::Colorize;
use human_bytes::human_bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::aggregate::AccountingViews;
use crate::cost::CostModel;
use crate::models::{EnrichedEntity, IdentityRecord, QuotaTotals};
use crate::pipeline::RunSummary;

pub const FLAT_FILE: &str = "accounting.txt";
pub const GROUPS_FILE: &str = "accounting-agg-groups.txt";
pub const GROUP_ROLES_FILE: &str = "accounting-agg.txt";
pub const SIMPLIFIED_FILE: &str = "accounting-agg-simple.txt";
pub const RECEIVER_FILE: &str = "accounting-json-accreceiver.json";

const FLAT_COLUMNS: [&str; 20] = [
    "UID", "GID", "INSTANCE", "PATH", "MAXBYTES", "USEDBYTES", "MAXBYTESH", "USEDBYTESH",
    "CREATED", "ACCTYPE", "ACC", "OWNER", "NAME", "DEPT", "GROUP", "SECTION", "CHARGETYPE",
    "CHARGEGROUP", "CHARGEROLE", "COSTH",
];

const GROUP_COLUMNS: [&str; 7] = [
    "MAXBYTES", "USEDBYTES", "MAXBYTESH", "USEDBYTESH", "CREATED", "CHARGEGROUP", "COSTH",
];

const GROUP_ROLE_COLUMNS: [&str; 8] = [
    "MAXBYTES", "USEDBYTES", "MAXBYTESH", "USEDBYTESH", "CREATED", "CHARGEGROUP", "CHARGEROLE",
    "COSTH",
];

pub struct ReportWriter {
    out_dir: PathBuf,
    cost: CostModel,
}

impl ReportWriter {
    pub fn new(out_dir: impl Into<PathBuf>, cost: CostModel) -> Self {
        Self {
            out_dir: out_dir.into(),
            cost,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn write_flat(&self, entities: &[EnrichedEntity]) -> Result<PathBuf> {
        let rows: Vec<Vec<String>> = entities.iter().map(|e| self.flat_row(e)).collect();
        let path = self.out_dir.join(FLAT_FILE);
        write_table(&path, &FLAT_COLUMNS, &rows)?;
        Ok(path)
    }

    /// Write the aggregate tables and the receiver payload, in that order.
    pub fn write_views(&self, views: &AccountingViews, date: NaiveDate) -> Result<Vec<PathBuf>> {
        let created = date.format("%Y-%m-%d").to_string();
        let mut written = Vec::with_capacity(4);

        let rows: Vec<_> = views
            .groups
            .iter()
            .map(|(group, totals)| self.aggregate_row(totals, &created, &[group.as_str()]))
            .collect();
        let path = self.out_dir.join(GROUPS_FILE);
        write_table(&path, &GROUP_COLUMNS, &rows)?;
        written.push(path);

        for (file, buckets) in [
            (GROUP_ROLES_FILE, &views.group_roles),
            (SIMPLIFIED_FILE, &views.simplified),
        ] {
            let path = self.out_dir.join(file);
            write_table(&path, &GROUP_ROLE_COLUMNS, &self.role_rows(buckets, &created))?;
            written.push(path);
        }

        let path = self.out_dir.join(RECEIVER_FILE);
        write_json(&path, &views.payload)?;
        written.push(path);

        Ok(written)
    }

    fn flat_row(&self, e: &EnrichedEntity) -> Vec<String> {
        let unresolved = IdentityRecord::default();
        let owner = e.identity.owner().unwrap_or(&unresolved);

        vec![
            owner.uid.clone(),
            owner.gid.clone(),
            e.entity.instance_name.clone(),
            e.entity.path.clone(),
            e.quota.available_bytes.to_string(),
            e.quota.used_bytes.to_string(),
            human_bytes(e.quota.available_bytes as f64),
            human_bytes(e.quota.used_bytes as f64),
            e.entity.created_human(),
            e.identity.account_type.human(),
            e.identity.account.clone(),
            owner.account.clone(),
            owner.name.clone(),
            owner.department.clone(),
            owner.group.clone(),
            owner.section.clone(),
            e.charge_type().to_string(),
            e.charge_group().to_string(),
            e.charge_role().to_string(),
            self.cost.format(e.quota.used_bytes),
        ]
    }

    fn aggregate_row(&self, totals: &QuotaTotals, created: &str, keys: &[&str]) -> Vec<String> {
        let mut row = vec![
            totals.available_bytes.to_string(),
            totals.used_bytes.to_string(),
            human_bytes(totals.available_bytes as f64),
            human_bytes(totals.used_bytes as f64),
            created.to_string(),
        ];
        row.extend(keys.iter().map(|k| k.to_string()));
        row.push(self.cost.format(totals.used_bytes));
        row
    }

    fn role_rows(&self, buckets: &BTreeMap<(String, String), QuotaTotals>, created: &str) -> Vec<Vec<String>> {
        buckets
            .iter()
            .map(|((group, role), totals)| self.aggregate_row(totals, created, &[group.as_str(), role.as_str()]))
            .collect()
    }
}

/// Tab-separated table with a header row. Parent directories are created.
pub fn write_table(path: &Path, columns: &[&str], rows: &[Vec<String>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let file = fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let header: Vec<String> = columns.iter().map(|c| c.to_uppercase()).collect();
    writeln!(out, "{}", header.join("\t"))?;
    for row in rows {
        writeln!(out, "{}", row.join("\t"))?;
    }
    out.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;

    info!(file = %path.display(), rows = rows.len(), "Wrote report table");
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let data = serde_json::to_vec(value).context("Failed to serialize report payload")?;
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;

    info!(file = %path.display(), "Wrote JSON report");
    Ok(())
}

pub fn print_summary(summary: &RunSummary, json_output: bool) {
    if json_output {
        match serde_json::to_string_pretty(summary) {
            Ok(json_str) => println!("{}", json_str),
            Err(e) => eprintln!("Error serializing run summary to JSON: {}", e),
        }
        return;
    }

    println!("\n{}", "=".repeat(60).bright_cyan());
    println!(
        "{} {}",
        "Storage accounting report".bright_white().bold(),
        summary.report_date.to_string().bright_yellow()
    );
    println!("{}", "=".repeat(60).bright_cyan());

    println!(
        "  {} {}",
        "Entities listed:".bright_white(),
        summary.entities.to_string().bright_green()
    );
    if summary.charging {
        println!(
            "  {} {}",
            "Entities charged:".bright_white(),
            summary.retained.to_string().bright_green()
        );
    }

    println!("  {}", "Files:".bright_white());
    for file in &summary.files {
        println!("    {}", file.display().to_string().bright_blue());
    }

    if let Some(target) = &summary.pushed_to {
        println!("  {} {}", "Pushed to:".bright_white(), target.bright_magenta());
    }
    if let Some(dir) = &summary.archived_to {
        println!("  {} {}", "Archived to:".bright_white(), dir.bright_magenta());
    }
    println!();
}
