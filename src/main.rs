use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use storage_accounting::config::{init_config, Config};
use storage_accounting::logging::init_logging;
use storage_accounting::pipeline::{AccountingPipeline, Collaborators, PushTarget, ReportOptions};
use storage_accounting::report::print_summary;

#[derive(Parser)]
#[command(name = "storage-accounting")]
#[command(about = "Storage accounting reports for distributed storage instances")]
#[command(version = "1.0.0")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List, enrich and aggregate storage entities into accounting reports
    Report {
        /// Width of the identity resolution pool
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,
        /// Entities per category, -1 for all
        #[arg(short = 'l', long, default_value_t = -1, allow_negative_numbers = true)]
        limit: i64,
        /// Resolve charge information and produce the aggregate reports
        #[arg(long)]
        charging: bool,
        /// Include user homes in addition to project spaces
        #[arg(long)]
        user_also: bool,
        /// Keep entities without charge classification in the aggregate reports
        #[arg(long)]
        show_invalid: bool,
        /// Push the receiver payload to the production billing receiver
        #[arg(long)]
        push_prod: bool,
        /// Push the receiver payload to the development billing receiver
        #[arg(long)]
        push_dev: bool,
        /// Archive every produced file to the dated archive directory
        #[arg(long)]
        archive: bool,
        /// Date the receiver payload as yesterday, for runs just after midnight
        #[arg(long)]
        as_yesterday: bool,
        /// Output directory
        #[arg(short = 'o', long)]
        out: Option<PathBuf>,
        /// Cost in CHF per TB of used space
        #[arg(long)]
        cost: Option<f64>,
        /// Output run summary and errors in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Report {
            concurrency,
            limit,
            charging,
            user_also,
            show_invalid,
            push_prod,
            push_dev,
            archive,
            as_yesterday,
            out,
            cost,
            json,
        } => {
            let loaded = Config::load(cli.config.as_deref()).and_then(|mut config| {
                if let Some(cost) = cost {
                    config.billing.cost_per_tb = cost;
                    config.validate()?;
                }
                Ok(config)
            });
            let config = match loaded {
                Ok(config) => init_config(config),
                Err(e) => handle_error(e, json),
            };
            let _guard = init_logging(&config.logging, &config.paths.log_directory);

            let defaults = ReportOptions::from_config(config);
            let options = ReportOptions {
                limit: usize::try_from(limit).ok(),
                identity_concurrency: concurrency.unwrap_or(defaults.identity_concurrency),
                charging,
                user_also,
                show_invalid,
                push: if push_prod {
                    Some(PushTarget::Prod)
                } else if push_dev {
                    Some(PushTarget::Dev)
                } else {
                    None
                },
                archive,
                as_yesterday,
                out_dir: out.unwrap_or(defaults.out_dir),
                cost_per_tb: defaults.cost_per_tb,
            };

            let collaborators = match Collaborators::from_config(config) {
                Ok(c) => c,
                Err(e) => handle_error(e, json),
            };
            let pipeline = AccountingPipeline::new(config.clone(), collaborators);

            match pipeline.run(&options).await {
                Ok(summary) => {
                    print_summary(&summary, json);
                    Ok(())
                }
                Err(e) => handle_error(e, json),
            }
        }
    }
}

fn handle_error(e: anyhow::Error, json: bool) -> ! {
    if json {
        println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
    } else {
        eprintln!("Error: {:#}", e);
    }
    process::exit(1);
}
