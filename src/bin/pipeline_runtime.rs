//! Pipeline Runtime
//!
//! Long-running process for the token lifecycle pipeline:
//! - Opens the SQLite database and applies schema migrations
//! - Marks runs interrupted by a previous crash as failed
//! - Spawns the recurring stage schedulers (when enabled)
//! - Waits for CTRL+C
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables (see `PipelineConfig::from_env`):
//!   TIERFLOW_DB_PATH - SQLite database path (default: tierflow.db)
//!   HELIUS_API_KEY - Required for enrichment
//!   ENABLE_SCHEDULER - Master switch for recurring triggers (default: false)

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use tierflow::pipeline::{
    analysis::HttpAnalysisWorkflow, dexscreener::DexScreenerFeed, helius::HeliusEnricher,
    scheduler, Collaborators, Database, PipelineConfig, PipelineService,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Tierflow Pipeline Runtime");

    let config = PipelineConfig::from_env();

    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Feed: {} ({})", config.dexscreener_base_url, config.chain);
    info!("   ├─ Enrichment: {}", config.helius_rpc_url);
    info!("   ├─ Analysis: {}", config.analysis_url);
    info!("   └─ Soft deadline: {}s", config.run_soft_deadline_secs);

    info!("🔧 Initializing database...");
    let db = Database::open(&config.db_path, &config.schema_dir)?;
    info!("✅ Database initialized");

    let collaborators = Collaborators {
        feed: Arc::new(DexScreenerFeed::new(&config)?),
        enrichment: Arc::new(HeliusEnricher::new(&config)?),
        analysis: Arc::new(HttpAnalysisWorkflow::new(&config)?),
    };

    let service = Arc::new(PipelineService::new(
        db,
        collaborators,
        config.run_soft_deadline(),
    ));

    let recovered = service.recover_interrupted_runs()?;
    if recovered > 0 {
        info!("♻️  Recovered {} interrupted run(s)", recovered);
    }

    let settings = service.settings()?;
    info!("📊 Pipeline Settings:");
    info!(
        "   ├─ Tier-0: {} (every {}m, max {})",
        on_off(settings.ingest_enabled),
        settings.tier0_interval_minutes,
        settings.tier0_max_per_run
    );
    info!(
        "   ├─ Tier-1: {} (every {}m, batch {}, budget {} credits)",
        on_off(settings.enrich_enabled),
        settings.tier1_interval_minutes,
        settings.tier1_batch_size,
        settings.tier1_credit_budget_per_run
    );
    info!(
        "   ├─ Auto-promotion: {} (every {}m, max {})",
        on_off(settings.auto_promote_enabled),
        settings.promotion_interval_minutes,
        settings.auto_promote_max_per_run
    );
    info!(
        "   └─ Hot refresh: {} (every {}m, >{}h)",
        on_off(settings.hot_refresh_enabled),
        settings.hot_refresh_interval_minutes,
        settings.hot_refresh_age_hours
    );

    let handles = if config.scheduler_enabled {
        let handles = scheduler::spawn_all(service.clone());
        info!("✅ {} stage schedulers running", handles.len());
        handles
    } else {
        info!("⚠️  Scheduler is DISABLED (set ENABLE_SCHEDULER=true to activate)");
        info!("   └─ Runs can still be triggered with ingest_ctl");
        Vec::new()
    };

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    for handle in handles {
        handle.abort();
    }

    info!("✅ Pipeline runtime stopped");
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}
