use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use swapledger_core_types::SwapSource;

use super::env_parsing::{
    parse_csv_list_env, parse_env_bool, parse_source_map_env, validate_config,
};
use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let configured = env::var("SWAPLEDGER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());
    let mut config = load_from_path(&configured)?;

    if let Ok(log_level) = env::var("SWAPLEDGER_LOG_LEVEL") {
        let trimmed = log_level.trim();
        if !trimmed.is_empty() {
            config.system.log_level = trimmed.to_string();
        }
    }
    if let Some(log_json) = env::var("SWAPLEDGER_LOG_JSON")
        .ok()
        .and_then(parse_env_bool)
    {
        config.system.log_json = log_json;
    }
    if let Ok(migrations_dir) = env::var("SWAPLEDGER_MIGRATIONS_DIR") {
        config.system.migrations_dir = migrations_dir;
    }
    if let Ok(sqlite_path) = env::var("SWAPLEDGER_SQLITE_PATH") {
        config.sqlite.path = sqlite_path;
    }
    if let Some(interval_seconds) = env::var("SWAPLEDGER_SYNC_INTERVAL_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.sync.interval_seconds = interval_seconds;
    }
    if let Some(max_concurrent_sources) = env::var("SWAPLEDGER_SYNC_MAX_CONCURRENT_SOURCES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        config.sync.max_concurrent_sources = max_concurrent_sources;
    }
    if let Some(max_pages_per_cycle) = env::var("SWAPLEDGER_SYNC_MAX_PAGES_PER_CYCLE")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        config.sync.max_pages_per_cycle = max_pages_per_cycle;
    }
    if let Some(full_history_max_pages) = env::var("SWAPLEDGER_SYNC_FULL_HISTORY_MAX_PAGES")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        config.sync.full_history_max_pages = full_history_max_pages;
    }
    if let Ok(sources_csv) = env::var("SWAPLEDGER_SYNC_ENABLED_SOURCES") {
        let sources = parse_csv_list_env(&sources_csv, "SWAPLEDGER_SYNC_ENABLED_SOURCES")?;
        if !sources.is_empty() {
            config.sync.enabled_sources = sources;
        }
    }
    if let Some(max_attempts) = env::var("SWAPLEDGER_HTTP_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        config.http.max_attempts = max_attempts;
    }
    if let Some(request_timeout_ms) = env::var("SWAPLEDGER_HTTP_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.http.request_timeout_ms = request_timeout_ms;
    }
    if let Some(retry_after_floor_ms) = env::var("SWAPLEDGER_HTTP_RETRY_AFTER_FLOOR_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.http.retry_after_floor_ms = retry_after_floor_ms;
    }
    if let Ok(delays_csv) = env::var("SWAPLEDGER_PROVIDER_DELAYS_MS") {
        let delays = parse_source_map_env(&delays_csv, "SWAPLEDGER_PROVIDER_DELAYS_MS", |value| {
            value.trim().parse::<u64>().ok()
        })?;
        for (source, delay_ms) in delays {
            config.provider_mut(source).inter_request_delay_ms = delay_ms;
        }
    }
    if let Ok(codes_csv) = env::var("SWAPLEDGER_AFFILIATE_CODES") {
        let codes = parse_csv_list_env(&codes_csv, "SWAPLEDGER_AFFILIATE_CODES")?;
        if !codes.is_empty() {
            config.affiliates.codes = codes;
        }
    }
    for source in SwapSource::ALL {
        let prefix = source.as_str().to_ascii_uppercase();
        let endpoints_env = format!("SWAPLEDGER_{prefix}_ENDPOINTS");
        if let Ok(endpoints_csv) = env::var(&endpoints_env) {
            let endpoints = parse_csv_list_env(&endpoints_csv, &endpoints_env)?;
            if !endpoints.is_empty() {
                config.provider_mut(source).endpoints = endpoints;
            }
        }
        if let Ok(api_key) = env::var(format!("SWAPLEDGER_{prefix}_API_KEY")) {
            config.provider_mut(source).api_key = api_key.trim().to_string();
        }
    }

    validate_config(&config)?;

    Ok((config, configured))
}
