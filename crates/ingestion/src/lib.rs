pub mod client;
pub mod feed;
pub mod pagination;
pub mod parsers;
pub mod pricing;
pub mod telemetry;

#[cfg(test)]
mod test_http;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use swapledger_config::AppConfig;
use swapledger_core_types::SwapSource;

pub use client::{ApiClient, EndpointSet, FetchError, RetryPolicy};
pub use feed::ProviderFeed;
pub use pagination::{KnownDataPredicate, Page, PageFetcher, PaginationWalker, StopReason};
pub use parsers::{event_timestamp, event_tx_id, ParserRegistry, ProviderParser, SwapParser};
pub use pricing::{NoPrices, PriceBook, PriceOracle};
pub use telemetry::{classify_parse_reject_reason, IngestionTelemetry, TelemetrySnapshot};

/// Shared ingestion state: one price book and one parser registry per process.
pub struct IngestionService {
    config: Arc<AppConfig>,
    prices: Arc<PriceBook>,
    parsers: Arc<ParserRegistry>,
}

impl IngestionService {
    pub fn build(config: Arc<AppConfig>) -> Self {
        let prices = Arc::new(PriceBook::new());
        let oracle: Arc<dyn PriceOracle> = prices.clone();
        let parsers = Arc::new(ParserRegistry::from_config(&config, oracle));
        Self {
            config,
            prices,
            parsers,
        }
    }

    pub fn parsers(&self) -> Arc<ParserRegistry> {
        Arc::clone(&self.parsers)
    }

    pub fn telemetry(&self, source: SwapSource) -> Result<Arc<IngestionTelemetry>> {
        self.parsers
            .telemetry(source)
            .ok_or_else(|| anyhow!("no telemetry registered for source={source}"))
    }

    /// A fresh feed for `source`. Each sync run owns its own client and endpoint order.
    pub fn feed(&self, source: SwapSource) -> Result<ProviderFeed> {
        ProviderFeed::from_config(
            source,
            &self.config,
            self.telemetry(source)?,
            Arc::clone(&self.prices),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_parses_with_its_shared_price_book() {
        let service = IngestionService::build(Arc::new(AppConfig::default()));
        let at = chrono::DateTime::from_timestamp(1_700_000_000, 0).expect("ts");
        service.prices.insert("THOR.RUNE", at, 5.0);

        let raw = json!({
            "date": "1700000000000000000",
            "in": [{"address": "0xuser", "txID": "TX1", "coins": [{"asset": "ETH.ETH", "amount": "50000000"}]}],
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
        });
        let swap = service
            .parsers()
            .parse(SwapSource::Thorchain, &raw)
            .expect("parse")
            .expect("swap");
        assert!((swap.affiliate_fee_usd - 3.0).abs() < 1e-9);
        let snapshot = service
            .telemetry(SwapSource::Thorchain)
            .expect("telemetry")
            .snapshot();
        assert_eq!(snapshot.parsed_total, 1);
    }
}
