//! Accounting Pipeline
//!
//! Orchestrates one accounting run from the storage listing to the written reports.
//!
//! ## Stages
//!
//! Stages run as sequential barriers; each completes before the next starts.
//!
//! 1. **Listing**: projects, optionally user homes, shard by shard
//! 2. **Identity join**: distinct owner ids on the identity pool
//! 3. **Quota join**: one quota dump per instance touched by the listing
//! 4. **Charge join** (with charging): chunked classification on the charge pool, role
//!    derivation
//! 5. **Reports**: flat table always; aggregate views and receiver payload with charging
//! 6. **Delivery**: optional push of the payload, optional archival of every file
//!
//! Listing, quota, charge, file and delivery failures abort the run. Identity failures
//! only leave the affected entities with an empty identity.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use storage_accounting::config::Config;
//! use storage_accounting::pipeline::{AccountingPipeline, Collaborators, ReportOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let collaborators = Collaborators::from_config(&config)?;
//! let pipeline = AccountingPipeline::new(config.clone(), collaborators);
//!
//! let options = ReportOptions {
//!     charging: true,
//!     ..ReportOptions::from_config(&config)
//! };
//! let summary = pipeline.run(&options).await?;
//! println!("{} entities", summary.entities);
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use chrono::{Duration, Local, NaiveDate};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use crate::aggregate::{self, AggregationEngine};
use crate::charge::{ChargeApi, ChargeResolver, HttpChargeApi};
use crate::config::Config;
use crate::cost::CostModel;
use crate::identity::{AccountLookup, Directory, GetentLookup, IdentityResolver, LdapSearchDirectory};
use crate::lister::{Category, EntityLister};
use crate::logging::run_span;
use crate::pool::BoundedPool;
use crate::quota::{instances_of, QuotaCollector};
use crate::receiver::{Archiver, HttpReceiver, ReceiverPush};
use crate::report::ReportWriter;
use crate::storage::{EosCli, StorageClient};

/// External services one run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn StorageClient>,
    pub accounts: Arc<dyn AccountLookup>,
    pub directory: Arc<dyn Directory>,
    pub charges: Arc<dyn ChargeApi>,
    pub receiver: Arc<dyn ReceiverPush>,
}

impl Collaborators {
    /// Production adapters: `eos`, `getent`, `ldapsearch` and the HTTP endpoints.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            storage: Arc::new(EosCli::new(&config.storage, config.archive.timeout_secs)),
            accounts: Arc::new(GetentLookup::new(&config.directory)),
            directory: Arc::new(LdapSearchDirectory::new(&config.directory)),
            charges: Arc::new(HttpChargeApi::new(&config.billing)?),
            receiver: Arc::new(HttpReceiver::new(&config.billing)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushTarget {
    Prod,
    Dev,
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Entities per category; `None` lists everything.
    pub limit: Option<usize>,
    pub identity_concurrency: usize,
    pub charging: bool,
    pub user_also: bool,
    pub show_invalid: bool,
    pub push: Option<PushTarget>,
    pub archive: bool,
    pub as_yesterday: bool,
    pub out_dir: PathBuf,
    pub cost_per_tb: f64,
}

impl ReportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limit: None,
            identity_concurrency: config.processing.identity_concurrency,
            charging: false,
            user_also: false,
            show_invalid: false,
            push: None,
            archive: false,
            as_yesterday: false,
            out_dir: config.paths.output_directory.clone(),
            cost_per_tb: config.billing.cost_per_tb,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub report_date: NaiveDate,
    /// Listed entities, all present in the flat table.
    pub entities: usize,
    /// Entities left for the aggregate views after cleaning.
    pub retained: usize,
    pub charging: bool,
    pub files: Vec<PathBuf>,
    pub pushed_to: Option<String>,
    pub archived_to: Option<String>,
}

pub struct AccountingPipeline {
    config: Config,
    collaborators: Collaborators,
}

impl AccountingPipeline {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub async fn run(&self, options: &ReportOptions) -> Result<RunSummary> {
        self.run_stages(options).instrument(run_span()).await
    }

    async fn run_stages(&self, options: &ReportOptions) -> Result<RunSummary> {
        let config = &self.config;
        let today = Local::now().date_naive();
        let report_date = if options.as_yesterday {
            today - Duration::days(1)
        } else {
            today
        };

        info!(
            charging = options.charging,
            user_also = options.user_also,
            limit = ?options.limit,
            %report_date,
            "Starting accounting run"
        );
        if options.push.is_some() && !options.charging {
            warn!("Push requested without charging, nothing will be pushed");
        }

        // Listing
        let lister = EntityLister::new(self.collaborators.storage.clone(), config.storage.clone());
        let mut listed = lister.list(Category::Project, options.limit).await?;
        if options.user_also {
            listed.extend(lister.list(Category::UserHome, options.limit).await?);
        }
        let instances = instances_of(&listed);

        // Identity join
        let identity_pool = BoundedPool::new("identity", options.identity_concurrency)
            .with_progress_interval(config.processing.progress_interval);
        let resolver = Arc::new(IdentityResolver::new(
            self.collaborators.accounts.clone(),
            self.collaborators.directory.clone(),
        ));
        let identities = resolver
            .resolve_all(listed.iter().map(|e| e.owner_id), &identity_pool)
            .await?;
        let mut entities = aggregate::join_identities(listed, &identities);

        // Quota join
        let quotas = QuotaCollector::new(self.collaborators.storage.clone(), &config.storage)
            .collect(&instances)
            .await?;
        aggregate::fill_quotas(&mut entities, &quotas);
        info!(entities = entities.len(), quotas = quotas.len(), "Joined quotas");

        // Charge join
        if options.charging {
            let accounts: Vec<String> = entities
                .iter()
                .map(|e| e.account().to_string())
                .filter(|a| !a.is_empty())
                .collect();

            let charge_pool = BoundedPool::new("charge", config.processing.charge_concurrency)
                .with_progress_interval(config.processing.progress_interval);
            let charges = ChargeResolver::new(
                self.collaborators.charges.clone(),
                config.processing.charge_chunk_size,
            )
            .resolve(&accounts, &charge_pool)
            .await?;

            aggregate::fill_charges(&mut entities, &charges);
            aggregate::derive_charge_roles(
                &mut entities,
                &config.storage.project_prefix,
                &config.billing.project_label,
            );
        }

        // Reports
        let writer = ReportWriter::new(
            &options.out_dir,
            CostModel::new(options.cost_per_tb, config.billing.currency.clone()),
        );
        let mut files = vec![writer.write_flat(&entities)?];
        let mut retained = entities.len();
        let mut pushed_to = None;

        if options.charging {
            let engine = AggregationEngine::new(
                config.billing.project_label.clone(),
                config.billing.from_charge_group.clone(),
                config.billing.accounting_doc.clone(),
            );
            let views = engine.views(&entities, options.show_invalid, report_date);
            retained = views.retained;
            files.extend(writer.write_views(&views, report_date)?);

            if let Some(target) = options.push {
                let endpoint = match target {
                    PushTarget::Prod => &config.billing.receiver_prod_url,
                    PushTarget::Dev => &config.billing.receiver_dev_url,
                };
                let payload = writer.out_dir().join(crate::report::RECEIVER_FILE);
                self.collaborators.receiver.push(endpoint, &payload).await?;
                pushed_to = Some(endpoint.clone());
            }
        }

        // Archival
        let archived_to = if options.archive {
            let archiver = Archiver::new(self.collaborators.storage.clone(), &config.archive);
            Some(archiver.archive(&files, today).await?)
        } else {
            None
        };

        info!(entities = entities.len(), retained, files = files.len(), "Accounting run complete");

        Ok(RunSummary {
            report_date,
            entities: entities.len(),
            retained,
            charging: options.charging,
            files,
            pushed_to,
            archived_to,
        })
    }
}
