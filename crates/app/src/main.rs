use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use swapledger_config::{load_from_env_or_default, AppConfig};
use swapledger_ingestion::IngestionService;
use swapledger_storage::SqliteStore;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod gateway;
mod reprocess;
mod sync_runtime;
mod telemetry;

use crate::gateway::PersistenceGateway;
use crate::sync_runtime::{run_sync_cycle, CycleReport, SyncMode};
use crate::telemetry::{format_error_chain, log_cycle_report, log_reprocess_summary};

const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";
const HEARTBEAT_COMPONENT: &str = "swapledger-app";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Scheduler,
    Once,
    FullHistory,
    ReprocessErrors,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_config = parse_config_arg();
    let run_mode = parse_run_mode();
    let default_path = cli_config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, loaded_config_path) = load_from_env_or_default(&default_path)?;

    init_tracing(&config.system.log_level, config.system.log_json);
    info!(
        config_path = %loaded_config_path.display(),
        env = %config.system.env,
        run_mode = ?run_mode,
        "configuration loaded"
    );

    let sqlite_path = PathBuf::from(&config.sqlite.path);
    let mut store =
        SqliteStore::open(&sqlite_path).context("failed to initialize sqlite store")?;
    let migrations_dir = PathBuf::from(&config.system.migrations_dir);
    let applied = store
        .run_migrations(&migrations_dir)
        .with_context(|| format!("failed to apply migrations in {}", migrations_dir.display()))?;
    info!(applied, "sqlite migrations applied");

    store
        .record_heartbeat(HEARTBEAT_COMPONENT, "startup")
        .context("failed to write startup heartbeat")?;

    let config = Arc::new(config);
    let service = Arc::new(IngestionService::build(Arc::clone(&config)));

    match run_mode {
        RunMode::Scheduler => run_app_loop(store, service, config, sqlite_path).await,
        RunMode::Once | RunMode::FullHistory => {
            let mode = if run_mode == RunMode::FullHistory {
                SyncMode::FullHistory
            } else {
                SyncMode::Incremental
            };
            let report = run_sync_cycle(
                service,
                config.enabled_sources(),
                config.sync.clone(),
                sqlite_path,
                mode,
            )
            .await;
            log_cycle_report(&report);
            store
                .record_heartbeat(HEARTBEAT_COMPONENT, "shutdown")
                .context("failed to write shutdown heartbeat")?;
            Ok(())
        }
        RunMode::ReprocessErrors => {
            let mut gateway = PersistenceGateway::from_store(&sqlite_path, store);
            let summary = reprocess::reprocess_ingestion_errors(
                &mut gateway,
                &service.parsers(),
                config.sync.max_reprocess_attempts,
            )?;
            log_reprocess_summary(&summary);
            gateway
                .store()
                .record_heartbeat(HEARTBEAT_COMPONENT, "shutdown")
                .context("failed to write shutdown heartbeat")?;
            Ok(())
        }
    }
}

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(inline) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(inline));
        }
    }
    None
}

fn parse_run_mode() -> RunMode {
    run_mode_from_args(env::args().skip(1))
}

fn run_mode_from_args(args: impl IntoIterator<Item = String>) -> RunMode {
    let mut mode = RunMode::Scheduler;
    for arg in args {
        match arg.as_str() {
            "--reprocess-errors" => return RunMode::ReprocessErrors,
            "--full-history" => mode = RunMode::FullHistory,
            "--once" if mode == RunMode::Scheduler => mode = RunMode::Once,
            _ => {}
        }
    }
    mode
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

async fn run_app_loop(
    store: SqliteStore,
    service: Arc<IngestionService>,
    config: Arc<AppConfig>,
    sqlite_path: PathBuf,
) -> Result<()> {
    let mut interval = time::interval(Duration::from_secs(config.system.heartbeat_seconds.max(1)));
    let mut sync_interval =
        time::interval(Duration::from_secs(config.sync.interval_seconds.max(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sync_cycles: JoinSet<CycleReport> = JoinSet::new();
    let sources = config.enabled_sources();
    info!(
        sources = ?sources,
        interval_seconds = config.sync.interval_seconds,
        "sync scheduler started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(error) = store.record_heartbeat(HEARTBEAT_COMPONENT, "alive") {
                    warn!(error = %format_error_chain(&error), "heartbeat write failed");
                }
            }
            _ = sync_interval.tick() => {
                if !sync_cycles.is_empty() {
                    debug!("previous sync cycle still running, skipping tick");
                    continue;
                }
                sync_cycles.spawn(run_sync_cycle(
                    Arc::clone(&service),
                    sources.clone(),
                    config.sync.clone(),
                    sqlite_path.clone(),
                    SyncMode::Incremental,
                ));
            }
            Some(joined) = sync_cycles.join_next(), if !sync_cycles.is_empty() => {
                match joined {
                    Ok(report) => log_cycle_report(&report),
                    Err(error) => warn!(error = %error, "sync cycle task aborted"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    // Pages already persisted keep their SyncState; an interrupted page is refetched next run.
    sync_cycles.shutdown().await;
    store
        .record_heartbeat(HEARTBEAT_COMPONENT, "shutdown")
        .context("failed to write shutdown heartbeat")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::{Context, Result};
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use swapledger_config::AppConfig;
    use swapledger_ingestion::{NoPrices, ParserRegistry};
    use swapledger_storage::SqliteStore;
    use tempfile::TempDir;

    pub(crate) fn migrated_db(name: &str) -> Result<(TempDir, PathBuf)> {
        let temp = tempfile::tempdir().context("failed to create tempdir")?;
        let db_path = temp.path().join(name);
        let migration_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let mut store = SqliteStore::open(&db_path)?;
        store.run_migrations(&migration_dir)?;
        Ok((temp, db_path))
    }

    pub(crate) fn thorchain_registry() -> ParserRegistry {
        ParserRegistry::from_config(&AppConfig::default(), Arc::new(NoPrices))
    }

    /// A `vi`-affiliated ETH -> BTC action at `secs` past the epoch.
    pub(crate) fn midgard_event(tx_id: &str, secs: i64) -> Value {
        json!({
            "date": format!("{secs}000000000"),
            "in": [{"address": "0xuser", "txID": tx_id, "coins": [{"asset": "ETH.ETH", "amount": "50000000"}]}],
            "out": [
                {"affiliate": false, "coins": [{"asset": "BTC.BTC", "amount": "1000000"}]},
                {"affiliate": true, "coins": [{"asset": "THOR.RUNE", "amount": "60000000"}]}
            ],
            "metadata": {"swap": {
                "affiliateAddress": "vi",
                "memo": "=:BTC.BTC:bc1q:0/1/0:vi:30",
                "inPriceUSD": "2000",
                "outPriceUSD": "99500"
            }}
        })
    }

    pub(crate) fn broken_midgard_event(tx_id: &str) -> Value {
        let mut event = midgard_event(tx_id, 0);
        event["date"] = json!("not-a-date");
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn run_mode_flags() {
        assert_eq!(run_mode_from_args(args(&[])), RunMode::Scheduler);
        assert_eq!(
            run_mode_from_args(args(&["--config", "configs/prod.toml", "--once"])),
            RunMode::Once
        );
        assert_eq!(
            run_mode_from_args(args(&["--once", "--full-history"])),
            RunMode::FullHistory
        );
        assert_eq!(
            run_mode_from_args(args(&["--full-history", "--reprocess-errors"])),
            RunMode::ReprocessErrors
        );
    }
}
