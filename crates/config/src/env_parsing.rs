use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashSet};
use swapledger_core_types::SwapSource;

use super::AppConfig;

pub(crate) fn parse_env_bool(value: String) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `source:value` pairs, e.g. `thorchain:1500,lifi:800`.
pub(crate) fn parse_source_map_env<T, F>(
    csv: &str,
    env_name: &str,
    parse_value: F,
) -> Result<BTreeMap<SwapSource, T>>
where
    F: Fn(&str) -> Option<T>,
{
    let mut values = BTreeMap::new();
    let mut seen_normalized = HashSet::new();
    for token in csv.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((key, raw_value)) = token.split_once(':') else {
            return Err(anyhow!(
                "{env_name} contains malformed token (expected source:value): {}",
                token
            ));
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(anyhow!(
                "{env_name} contains empty source key in token: {}",
                token
            ));
        }
        let source = key
            .parse::<SwapSource>()
            .map_err(|error| anyhow!("{env_name}: {error}"))?;
        let Some(parsed_value) = parse_value(raw_value) else {
            return Err(anyhow!(
                "{env_name} contains invalid numeric value for source={}: {}",
                key,
                raw_value.trim()
            ));
        };
        if !seen_normalized.insert(key.clone()) {
            return Err(anyhow!(
                "{env_name} contains duplicate source after normalization: {}",
                key
            ));
        }
        values.insert(source, parsed_value);
    }
    Ok(values)
}

pub(crate) fn parse_csv_list_env(csv: &str, env_name: &str) -> Result<Vec<String>> {
    let mut values = Vec::new();
    let mut seen_normalized = HashSet::new();
    for token in csv
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .split(',')
    {
        let value = token.trim().trim_matches('"').trim_matches('\'');
        if value.is_empty() {
            continue;
        }
        let normalized = value.to_ascii_lowercase();
        if !seen_normalized.insert(normalized.clone()) {
            return Err(anyhow!(
                "{env_name} contains duplicate entry after normalization: {}",
                normalized
            ));
        }
        values.push(value.to_string());
    }
    Ok(values)
}

pub(crate) fn validate_endpoint_url(endpoint: &str) -> Result<()> {
    let parsed = url::Url::parse(endpoint).context("invalid URL parse")?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(anyhow!("unsupported scheme {}", parsed.scheme()));
    }
    if parsed.host_str().is_none() {
        return Err(anyhow!("host missing"));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(anyhow!("URL credentials are not allowed"));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(anyhow!("query/fragment are not allowed"));
    }
    Ok(())
}

pub(crate) fn validate_config(config: &AppConfig) -> Result<()> {
    let mut seen_sources = HashSet::new();
    for name in &config.sync.enabled_sources {
        let source = name
            .parse::<SwapSource>()
            .map_err(|error| anyhow!("sync.enabled_sources: {error}"))?;
        if !seen_sources.insert(source) {
            return Err(anyhow!(
                "sync.enabled_sources lists source={} more than once",
                source
            ));
        }
        let provider = config.provider(source);
        if provider.endpoints.is_empty() {
            return Err(anyhow!(
                "providers.{}.endpoints must not be empty for an enabled source",
                source
            ));
        }
        for endpoint in &provider.endpoints {
            validate_endpoint_url(endpoint).with_context(|| {
                format!("providers.{}.endpoints contains invalid url: {}", source, endpoint)
            })?;
        }
        if !provider.price_history_url.trim().is_empty() {
            validate_endpoint_url(&provider.price_history_url).with_context(|| {
                format!("providers.{}.price_history_url is invalid", source)
            })?;
        }
    }

    if config.sync.max_concurrent_sources == 0 {
        return Err(anyhow!("sync.max_concurrent_sources must be >= 1"));
    }
    if config.sync.interval_seconds == 0 {
        return Err(anyhow!("sync.interval_seconds must be >= 1"));
    }
    if config.http.max_attempts == 0 {
        return Err(anyhow!("http.max_attempts must be >= 1"));
    }
    if config.http.server_error_max_attempts == 0 {
        return Err(anyhow!("http.server_error_max_attempts must be >= 1"));
    }

    if config.affiliates.codes.is_empty() {
        return Err(anyhow!("affiliates.codes must list at least one code"));
    }
    let mut seen_codes = HashSet::new();
    for code in &config.affiliates.codes {
        let normalized = code.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(anyhow!("affiliates.codes contains an empty code"));
        }
        if !seen_codes.insert(normalized.clone()) {
            return Err(anyhow!(
                "affiliates.codes contains duplicate code after normalization: {}",
                normalized
            ));
        }
    }

    Ok(())
}
