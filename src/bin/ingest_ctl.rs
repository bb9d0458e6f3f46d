//! Ingest Control - on-demand pipeline operations
//!
//! Triggers runs, manual promotion/discard/re-ingestion, and reads queue,
//! settings, run history and credit usage. Every command prints JSON.
//!
//! Usage:
//!   cargo run --bin ingest_ctl -- stats
//!   cargo run --bin ingest_ctl -- tier1 --budget 20
//!   cargo run --bin ingest_ctl -- promote MINT_A MINT_B
//!   cargo run --bin ingest_ctl -- settings set '{"enrich_enabled": true}'
//!
//! A run refused because another run holds the coordinator exits with code 2.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use std::sync::Arc;
use tierflow::pipeline::{
    analysis::HttpAnalysisWorkflow,
    collaborators::Enrichment,
    dexscreener::DexScreenerFeed,
    error::{EnrichError, EnrichErrorKind},
    helius::HeliusEnricher,
    queue::QueueQuery,
    service::{HotRefreshParams, Tier0Params, Tier1Params},
    settings::SettingsUpdate,
    Collaborators, Database, EnrichmentApi, PipelineConfig, PipelineError, PipelineService,
    Status, Tier,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Token lifecycle pipeline control", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Override TIERFLOW_DB_PATH
    #[arg(long, env = "TIERFLOW_DB_PATH")]
    db: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run Tier-0 discovery from the free feed
    Tier0 {
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        mc_min: Option<f64>,
        #[arg(long)]
        volume_min: Option<f64>,
        #[arg(long)]
        liquidity_min: Option<f64>,
        #[arg(long)]
        age_max_hours: Option<f64>,
    },

    /// Run Tier-1 paid enrichment
    Tier1 {
        #[arg(long)]
        batch_size: Option<usize>,
        /// Credit budget for this run
        #[arg(long)]
        budget: Option<u64>,
    },

    /// Score enriched entries and promote the prime ones
    AutoPromote {
        #[arg(long)]
        max: Option<usize>,
    },

    /// Promote the given addresses (must be enriched)
    Promote {
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Discard the given addresses
    Discard {
        #[arg(required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Restart discarded addresses as a fresh lineage
    Reingest {
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Refresh metrics of stale analyzed entries
    HotRefresh {
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        age_hours: Option<f64>,
    },

    /// Show or update pipeline settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// List queue entries
    Queue {
        #[arg(long)]
        tier: Option<Tier>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show one entry with its archived lineages
    Entry { address: String },

    /// Queue counts and last-run bookkeeping
    Stats,

    /// Recent run history
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Recent credit ledger entries
    Credits {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    /// Apply a partial JSON update, e.g. '{"tier1_batch_size": 20}'
    Set { json: String },
}

/// Stand-in when HELIUS_API_KEY is unset; commands that enrich check the key first
struct UnconfiguredEnrichment;

#[async_trait]
impl EnrichmentApi for UnconfiguredEnrichment {
    fn estimated_cost(&self) -> u64 {
        0
    }

    async fn enrich(&self, _address: &str) -> Result<Enrichment, EnrichError> {
        Err(EnrichError::new(EnrichErrorKind::Api, "HELIUS_API_KEY not set"))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_service(config: &PipelineConfig) -> Result<PipelineService, Box<dyn std::error::Error>> {
    let db = Database::open(&config.db_path, &config.schema_dir)?;

    let enrichment: Arc<dyn EnrichmentApi> = if config.helius_api_key.is_some() {
        Arc::new(HeliusEnricher::new(config)?)
    } else {
        Arc::new(UnconfiguredEnrichment)
    };

    let collaborators = Collaborators {
        feed: Arc::new(DexScreenerFeed::new(config)?),
        enrichment,
        analysis: Arc::new(HttpAnalysisWorkflow::new(config)?),
    };

    Ok(PipelineService::new(db, collaborators, config.run_soft_deadline()))
}

async fn execute(
    command: Commands,
    config: &PipelineConfig,
    service: &PipelineService,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Tier0 {
            max_tokens,
            mc_min,
            volume_min,
            liquidity_min,
            age_max_hours,
        } => {
            let params = Tier0Params {
                max_tokens,
                mc_min,
                volume_min,
                liquidity_min,
                age_max_hours,
            };
            print_json(&service.run_tier0(&params).await?)
        }
        Commands::Tier1 { batch_size, budget } => {
            config.require_helius_key()?;
            let params = Tier1Params {
                batch_size,
                credit_budget: budget,
            };
            print_json(&service.run_tier1(&params).await?)
        }
        Commands::AutoPromote { max } => print_json(&service.run_auto_promotion(max).await?),
        Commands::Promote { addresses } => print_json(&service.promote(&addresses).await?),
        Commands::Discard { addresses, reason } => {
            print_json(&service.discard(&addresses, reason.as_deref())?)
        }
        Commands::Reingest { addresses } => print_json(&service.reingest(&addresses)?),
        Commands::HotRefresh {
            max_tokens,
            age_hours,
        } => {
            config.require_helius_key()?;
            let params = HotRefreshParams {
                max_tokens,
                age_hours,
            };
            print_json(&service.run_hot_refresh(&params).await?)
        }
        Commands::Settings { action } => match action {
            SettingsAction::Show => print_json(&service.settings()?),
            SettingsAction::Set { json } => {
                let update: SettingsUpdate = serde_json::from_str(&json)?;
                print_json(&service.update_settings(&update)?)
            }
        },
        Commands::Queue {
            tier,
            status,
            limit,
            offset,
        } => {
            let query = QueueQuery {
                tier,
                status,
                limit,
                offset,
            };
            print_json(&service.list_queue(&query)?)
        }
        Commands::Entry { address } => {
            let entry = service
                .get_entry(&address)?
                .ok_or_else(|| PipelineError::NotFound(address.clone()))?;
            let history = service.entry_history(&address)?;
            print_json(&serde_json::json!({ "entry": entry, "history": history }))
        }
        Commands::Stats => print_json(&service.stats()?),
        Commands::Runs { limit } => print_json(&service.recent_runs(limit)?),
        Commands::Credits { limit } => print_json(&service.recent_credits(limit)?),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let service = build_service(&config)?;

    if let Err(e) = execute(args.command, &config, &service).await {
        if let Some(pipeline_err) = e.downcast_ref::<PipelineError>() {
            if pipeline_err.is_busy() {
                eprintln!("⏭️  {}", pipeline_err);
                std::process::exit(2);
            }
        }
        return Err(e);
    }

    Ok(())
}
