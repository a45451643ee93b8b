use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use tracing::debug;

use crate::client::{ApiClient, EndpointSet};

const PRICE_BUCKET_SECONDS: i64 = 300;

/// Best-effort market price lookup. `None` means unknown, never zero.
pub trait PriceOracle: Send + Sync {
    fn price_usd(&self, asset: &str, chain: &str, as_of: DateTime<Utc>) -> Option<f64>;
}

/// A price source that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrices;

impl PriceOracle for NoPrices {
    fn price_usd(&self, _asset: &str, _chain: &str, _as_of: DateTime<Utc>) -> Option<f64> {
        None
    }
}

fn price_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(PRICE_BUCKET_SECONDS)
}

/// Settlement asset prices keyed by 5-minute bucket.
#[derive(Debug, Default)]
pub struct PriceBook {
    prices: Mutex<HashMap<(String, i64), f64>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: &str, as_of: DateTime<Utc>, price_usd: f64) {
        if !price_usd.is_finite() || price_usd <= 0.0 {
            return;
        }
        if let Ok(mut guard) = self.prices.lock() {
            guard.insert((asset.to_ascii_uppercase(), price_bucket(as_of)), price_usd);
        }
    }

    pub fn contains(&self, asset: &str, as_of: DateTime<Utc>) -> bool {
        self.prices
            .lock()
            .map(|guard| guard.contains_key(&(asset.to_ascii_uppercase(), price_bucket(as_of))))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.prices.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches missing settlement prices for the given event times from a Midgard
    /// swap-history endpoint. Failures are logged and skipped.
    pub async fn warm_from_history(
        &self,
        client: &ApiClient,
        history: &mut EndpointSet,
        settlement_asset: &str,
        event_times: &[DateTime<Utc>],
        max_lookups: usize,
    ) -> usize {
        let mut buckets = BTreeSet::new();
        for ts in event_times {
            if !self.contains(settlement_asset, *ts) {
                buckets.insert(price_bucket(*ts));
            }
        }

        let mut warmed = 0usize;
        for bucket in buckets.into_iter().take(max_lookups) {
            let from = bucket * PRICE_BUCKET_SECONDS;
            client
                .telemetry()
                .price_lookups
                .fetch_add(1, Ordering::Relaxed);
            let query = [
                ("interval", "5min".to_string()),
                ("from", from.to_string()),
                ("count", "1".to_string()),
            ];
            let price = match client.fetch_json(history, &query).await {
                Ok(body) => settlement_price_from_history(&body),
                Err(error) => {
                    debug!(
                        source = %client.source(),
                        bucket_start = from,
                        error = %error,
                        "settlement price lookup failed"
                    );
                    None
                }
            };
            match price.zip(DateTime::from_timestamp(from, 0)) {
                Some((price, as_of)) => {
                    self.insert(settlement_asset, as_of, price);
                    warmed += 1;
                }
                None => {
                    client
                        .telemetry()
                        .price_lookup_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        warmed
    }
}

impl PriceOracle for PriceBook {
    fn price_usd(&self, asset: &str, _chain: &str, as_of: DateTime<Utc>) -> Option<f64> {
        let guard = self.prices.lock().ok()?;
        guard
            .get(&(asset.to_ascii_uppercase(), price_bucket(as_of)))
            .copied()
    }
}

/// Reads `intervals[0].runePriceUSD` (or the CACAO field on Maya).
pub fn settlement_price_from_history(body: &Value) -> Option<f64> {
    let interval = body.get("intervals")?.as_array()?.first()?;
    ["runePriceUSD", "cacaoPriceUSD", "assetPriceUSD"]
        .iter()
        .find_map(|key| interval.get(*key).and_then(value_as_f64))
        .filter(|price| price.is_finite() && *price > 0.0)
}

pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn lookups_share_a_five_minute_bucket() {
        let book = PriceBook::new();
        let at = Utc.timestamp_opt(1_700_000_100, 0).single().expect("ts");
        book.insert("thor.rune", at, 5.25);

        let same_bucket = Utc.timestamp_opt(1_700_000_199, 0).single().expect("ts");
        let next_bucket = Utc.timestamp_opt(1_700_000_400, 0).single().expect("ts");
        assert_eq!(book.price_usd("THOR.RUNE", "THOR", same_bucket), Some(5.25));
        assert_eq!(book.price_usd("THOR.RUNE", "THOR", next_bucket), None);
    }

    #[test]
    fn non_positive_prices_are_not_cached() {
        let book = PriceBook::new();
        let at = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        book.insert("THOR.RUNE", at, 0.0);
        book.insert("THOR.RUNE", at, f64::NAN);
        assert!(book.is_empty());
    }

    #[test]
    fn history_price_accepts_string_numbers() {
        let body = json!({"intervals": [{"runePriceUSD": "4.8123"}]});
        assert_eq!(settlement_price_from_history(&body), Some(4.8123));
        assert_eq!(settlement_price_from_history(&json!({"intervals": []})), None);
    }
}
