pub mod affiliate;
mod arkham;
mod lifi;
mod midgard;

pub use arkham::{normalize_chain_name, ArkhamTransferParser};
pub use lifi::LifiTransferParser;
pub use midgard::{AmmProfile, AssetScaling, MidgardSwapParser};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use swapledger_config::AppConfig;
use swapledger_core_types::{Swap, SwapSource};
use tracing::{debug, warn};

use crate::pricing::{value_as_f64, PriceOracle};
use crate::telemetry::IngestionTelemetry;

/// Maps one raw provider event to a canonical swap.
///
/// `Ok(None)` filters the event out (not ours, no fee output). `Err` means the
/// event has an unexpected shape and should be kept for replay.
pub trait SwapParser: Send + Sync {
    fn source(&self) -> SwapSource;
    fn parse(&self, raw: &Value) -> Result<Option<Swap>>;
}

pub enum ProviderParser {
    Amm(MidgardSwapParser),
    Lifi(LifiTransferParser),
    Arkham(ArkhamTransferParser),
}

impl SwapParser for ProviderParser {
    fn source(&self) -> SwapSource {
        match self {
            Self::Amm(parser) => parser.source(),
            Self::Lifi(parser) => parser.source(),
            Self::Arkham(parser) => parser.source(),
        }
    }

    fn parse(&self, raw: &Value) -> Result<Option<Swap>> {
        match self {
            Self::Amm(parser) => parser.parse(raw),
            Self::Lifi(parser) => parser.parse(raw),
            Self::Arkham(parser) => parser.parse(raw),
        }
    }
}

/// Source-keyed parsers with their per-source telemetry.
pub struct ParserRegistry {
    parsers: BTreeMap<SwapSource, ProviderParser>,
    telemetry: BTreeMap<SwapSource, Arc<IngestionTelemetry>>,
}

impl ParserRegistry {
    pub fn from_config(config: &AppConfig, prices: Arc<dyn PriceOracle>) -> Self {
        let mut parsers = BTreeMap::new();
        let mut telemetry = BTreeMap::new();
        for source in SwapSource::ALL {
            let counters = Arc::new(IngestionTelemetry::new(source));
            let parser = match source {
                SwapSource::Thorchain => ProviderParser::Amm(MidgardSwapParser::new(
                    AmmProfile::thorchain(),
                    &config.affiliates,
                    Arc::clone(&prices),
                    Arc::clone(&counters),
                )),
                SwapSource::Mayachain => ProviderParser::Amm(MidgardSwapParser::new(
                    AmmProfile::mayachain(),
                    &config.affiliates,
                    Arc::clone(&prices),
                    Arc::clone(&counters),
                )),
                SwapSource::Lifi => ProviderParser::Lifi(LifiTransferParser::new(
                    &config.providers.lifi.integrators,
                    &config.affiliates.platform_by_integrator,
                )),
                SwapSource::Arkham => ProviderParser::Arkham(ArkhamTransferParser::new(
                    &config.providers.arkham.integrator_address,
                )),
            };
            parsers.insert(source, parser);
            telemetry.insert(source, counters);
        }
        Self { parsers, telemetry }
    }

    pub fn parser(&self, source: SwapSource) -> Option<&ProviderParser> {
        self.parsers.get(&source)
    }

    pub fn telemetry(&self, source: SwapSource) -> Option<Arc<IngestionTelemetry>> {
        self.telemetry.get(&source).cloned()
    }

    /// Parses and records the outcome on the source's counters.
    pub fn parse(&self, source: SwapSource, raw: &Value) -> Result<Option<Swap>> {
        let parser = self
            .parsers
            .get(&source)
            .ok_or_else(|| anyhow!("no parser registered for source={source}"))?;
        let outcome = parser.parse(raw);
        if let Some(telemetry) = self.telemetry.get(&source) {
            match &outcome {
                Ok(Some(swap)) => telemetry.note_parsed(swap.fee_valuation),
                Ok(None) => telemetry.note_skipped(),
                Err(error) => telemetry.note_parse_rejected(error),
            }
        }
        match &outcome {
            Ok(None) => debug!(source = %source, tx_id = ?event_tx_id(source, raw), "event skipped"),
            Err(error) => warn!(
                source = %source,
                tx_id = ?event_tx_id(source, raw),
                error = %error,
                raw = %raw,
                "event rejected"
            ),
            Ok(Some(_)) => {}
        }
        outcome
    }
}

/// Provider-native transaction id, when the event carries one.
pub fn event_tx_id(source: SwapSource, raw: &Value) -> Option<String> {
    let id = match source {
        SwapSource::Thorchain | SwapSource::Mayachain => {
            raw.get("in").and_then(|ins| ins.get(0)).and_then(|input| str_at(input, "txID"))
        }
        SwapSource::Lifi => str_at(raw, "transactionId")
            .or_else(|| raw.get("sending").and_then(|sending| str_at(sending, "txHash"))),
        SwapSource::Arkham => str_at(raw, "transactionHash"),
    };
    id.map(str::to_string)
}

/// Event time without parsing the full event, for the known-data check.
pub fn event_timestamp(source: SwapSource, raw: &Value) -> Option<DateTime<Utc>> {
    match source {
        SwapSource::Thorchain | SwapSource::Mayachain => {
            raw.get("date").and_then(|date| parse_epoch(date).ok())
        }
        SwapSource::Lifi => raw
            .get("sending")
            .and_then(|sending| sending.get("timestamp"))
            .and_then(|ts| parse_epoch(ts).ok()),
        SwapSource::Arkham => str_at(raw, "blockTimestamp").and_then(|ts| parse_rfc3339(ts).ok()),
    }
}

pub(crate) fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub(crate) fn f64_at(value: &Value, key: &str) -> Option<f64> {
    value
        .get(key)
        .and_then(value_as_f64)
        .filter(|number| number.is_finite())
}

pub(crate) fn u64_at(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Epoch timestamp, unit picked by digit count: up to 10 is seconds, 13 is
/// milliseconds, 16 is microseconds, 19 is nanoseconds. Anything else is
/// rejected. Sub-second precision is dropped.
pub(crate) fn parse_epoch(value: &Value) -> Result<DateTime<Utc>> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        other => return Err(anyhow!("unparseable timestamp: {other}")),
    };
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("unparseable timestamp: {text:?}"));
    }
    let raw: i64 = text
        .parse()
        .with_context(|| format!("unparseable timestamp: {text:?}"))?;
    let units_per_second: i64 = match text.len() {
        1..=10 => 1,
        13 => 1_000,
        16 => 1_000_000,
        19 => 1_000_000_000,
        digits => {
            return Err(anyhow!(
                "unparseable timestamp: {text:?} has {digits} digits"
            ))
        }
    };
    let seconds = raw / units_per_second;
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| anyhow!("timestamp out of range: {text}"))
}

pub(crate) fn parse_rfc3339(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("unparseable timestamp: {text:?}"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::NoPrices;
    use serde_json::json;

    #[test]
    fn epoch_accepts_seconds_and_nanoseconds() {
        let secs = parse_epoch(&json!("1700000000")).expect("seconds");
        let nanos = parse_epoch(&json!("1700000000123456789")).expect("nanos");
        let number = parse_epoch(&json!(1_700_000_000)).expect("number");
        assert_eq!(secs.timestamp(), 1_700_000_000);
        assert_eq!(nanos, secs);
        assert_eq!(number, secs);
        assert!(parse_epoch(&json!("soon")).is_err());
        assert!(parse_epoch(&json!(null)).is_err());
    }

    #[test]
    fn epoch_unit_follows_digit_count() {
        let secs = parse_epoch(&json!(1_700_000_000)).expect("seconds");
        let millis = parse_epoch(&json!(1_700_000_000_123_i64)).expect("millis");
        let micros = parse_epoch(&json!("1700000000123456")).expect("micros");
        assert_eq!(millis, secs);
        assert_eq!(micros, secs);
        assert_eq!(parse_epoch(&json!("86400")).expect("early").timestamp(), 86_400);

        for odd in ["17000000001", "170000000012345", "17000000001234567890"] {
            let error = parse_epoch(&json!(odd)).expect_err("ambiguous length");
            assert!(error.to_string().contains("unparseable timestamp"), "{error}");
        }
    }

    #[test]
    fn registry_counts_skips_and_rejections() {
        let registry = ParserRegistry::from_config(&AppConfig::default(), Arc::new(NoPrices));
        let foreign = json!({
            "date": "1700000000000000000",
            "in": [{"txID": "AA", "coins": [{"asset": "ETH.ETH", "amount": "1"}]}],
            "metadata": {"swap": {"affiliateAddress": "ss", "memo": ""}}
        });
        assert!(registry
            .parse(SwapSource::Thorchain, &foreign)
            .expect("filter")
            .is_none());
        let broken = json!({
            "date": "1700000000000000000",
            "in": [],
            "metadata": {"swap": {"affiliateAddress": "vi", "memo": ""}},
            "out": [{"affiliate": true, "coins": [{"asset": "THOR.RUNE", "amount": "1"}]}]
        });
        assert!(registry.parse(SwapSource::Thorchain, &broken).is_err());

        let snapshot = registry
            .telemetry(SwapSource::Thorchain)
            .expect("telemetry")
            .snapshot();
        assert_eq!(snapshot.skipped_total, 1);
        assert_eq!(snapshot.rejected_total, 1);
    }

    #[test]
    fn tx_id_and_timestamp_are_read_per_source() {
        let lifi = json!({"sending": {"txHash": "0xabc", "timestamp": 1_700_000_000}});
        assert_eq!(event_tx_id(SwapSource::Lifi, &lifi).as_deref(), Some("0xabc"));
        assert_eq!(
            event_timestamp(SwapSource::Lifi, &lifi).map(|ts| ts.timestamp()),
            Some(1_700_000_000)
        );
        let arkham = json!({"transactionHash": "0xdef", "blockTimestamp": "2023-11-14T22:13:20Z"});
        assert_eq!(
            event_timestamp(SwapSource::Arkham, &arkham).map(|ts| ts.timestamp()),
            Some(1_700_000_000)
        );
    }
}
