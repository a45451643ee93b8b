use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use swapledger_config::AppConfig;
use swapledger_core_types::SwapSource;
use tracing::debug;

use crate::client::{ApiClient, EndpointSet};
use crate::pagination::{Page, PageFetcher};
use crate::parsers::event_timestamp;
use crate::pricing::PriceBook;
use crate::telemetry::IngestionTelemetry;

const MIDGARD_MAX_PAGE_LIMIT: u32 = 50;

struct PriceWarmer {
    book: Arc<PriceBook>,
    history: EndpointSet,
    settlement_asset: &'static str,
    max_lookups: usize,
}

/// Cursor shape of a provider's listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorStyle {
    /// `nextPageToken` in `meta`.
    Midgard,
    /// `hasNext` plus opaque `next`.
    Lifi,
    /// Numeric offset, full pages only.
    Offset,
}

/// Fetches one provider's listing pages through its own `ApiClient`.
pub struct ProviderFeed {
    source: SwapSource,
    style: CursorStyle,
    client: ApiClient,
    endpoints: EndpointSet,
    page_limit: u32,
    filter_values: Vec<String>,
    price_warmer: Option<PriceWarmer>,
}

impl ProviderFeed {
    pub fn from_config(
        source: SwapSource,
        config: &AppConfig,
        telemetry: Arc<IngestionTelemetry>,
        prices: Arc<PriceBook>,
    ) -> Result<Self> {
        let provider = config.provider(source);
        let endpoints = EndpointSet::new(source, &provider.endpoints)?;
        let mut client = ApiClient::new(
            source,
            &config.http,
            provider.inter_request_delay_ms,
            telemetry,
        )?;
        let page_limit = provider.page_limit.unwrap_or(config.sync.page_limit).max(1);

        let (style, page_limit, filter_values) = match source {
            SwapSource::Thorchain | SwapSource::Mayachain => (
                CursorStyle::Midgard,
                page_limit.min(MIDGARD_MAX_PAGE_LIMIT),
                config.affiliates.codes.clone(),
            ),
            SwapSource::Lifi => {
                client = client.with_header("x-lifi-api-key", &provider.api_key)?;
                (CursorStyle::Lifi, page_limit, provider.integrators.clone())
            }
            SwapSource::Arkham => {
                if provider.integrator_address.trim().is_empty() {
                    return Err(anyhow!(
                        "providers.arkham.integrator_address must be set to page arkham transfers"
                    ));
                }
                client = client.with_header("api-key", &provider.api_key)?;
                (
                    CursorStyle::Offset,
                    page_limit,
                    vec![provider.integrator_address.trim().to_string()],
                )
            }
        };

        let price_warmer = match source {
            SwapSource::Thorchain | SwapSource::Mayachain
                if !provider.price_history_url.trim().is_empty() =>
            {
                Some(PriceWarmer {
                    book: prices,
                    history: EndpointSet::new(
                        source,
                        std::slice::from_ref(&provider.price_history_url),
                    )?,
                    settlement_asset: if source == SwapSource::Thorchain {
                        "THOR.RUNE"
                    } else {
                        "MAYA.CACAO"
                    },
                    max_lookups: config.sync.price_warm_max_lookups_per_page,
                })
            }
            _ => None,
        };

        Ok(Self {
            source,
            style,
            client,
            endpoints,
            page_limit,
            filter_values,
            price_warmer,
        })
    }

    pub fn source(&self) -> SwapSource {
        self.source
    }

    pub fn telemetry(&self) -> &Arc<IngestionTelemetry> {
        self.client.telemetry()
    }

    pub fn preferred_endpoint(&self) -> &str {
        self.endpoints.preferred()
    }

    fn query(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let joined = self.filter_values.join(",");
        let mut query = Vec::with_capacity(4);
        match self.style {
            CursorStyle::Midgard => {
                query.push(("type", "swap".to_string()));
                query.push(("affiliate", joined));
                query.push(("limit", self.page_limit.to_string()));
                if let Some(cursor) = cursor {
                    query.push(("nextPageToken", cursor.to_string()));
                }
            }
            CursorStyle::Lifi => {
                query.push(("integrator", joined));
                query.push(("limit", self.page_limit.to_string()));
                if let Some(cursor) = cursor {
                    query.push(("next", cursor.to_string()));
                }
            }
            CursorStyle::Offset => {
                query.push(("base", joined));
                query.push(("limit", self.page_limit.to_string()));
                query.push(("offset", cursor.unwrap_or("0").to_string()));
            }
        }
        query
    }

    async fn warm_prices(&mut self, events: &[Value]) {
        let Some(warmer) = self.price_warmer.as_mut() else {
            return;
        };
        let times: Vec<_> = events
            .iter()
            .filter_map(|event| event_timestamp(self.source, event))
            .collect();
        if times.is_empty() {
            return;
        }
        let warmed = warmer
            .book
            .warm_from_history(
                &self.client,
                &mut warmer.history,
                warmer.settlement_asset,
                &times,
                warmer.max_lookups,
            )
            .await;
        debug!(source = %self.source, warmed, "settlement prices warmed");
    }
}

impl PageFetcher for ProviderFeed {
    async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page> {
        let query = self.query(cursor);
        let body = self
            .client
            .fetch_json(&mut self.endpoints, &query)
            .await
            .with_context(|| format!("failed to fetch {} page", self.source))?;
        let page = read_page(self.style, self.source, self.page_limit, body, cursor)?;
        self.warm_prices(&page.events).await;
        Ok(page)
    }
}

fn take_array(body: &mut Value, key: &str, source: SwapSource) -> Result<Vec<Value>> {
    match body.get_mut(key).map(Value::take) {
        Some(Value::Array(events)) => Ok(events),
        Some(Value::Null) | None => Err(anyhow!(
            "unexpected {source} page shape: missing `{key}` array"
        )),
        Some(other) => Err(anyhow!(
            "unexpected {source} page shape: `{key}` is not an array: {other}"
        )),
    }
}

fn non_empty_cursor(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn read_page(
    style: CursorStyle,
    source: SwapSource,
    page_limit: u32,
    mut body: Value,
    cursor: Option<&str>,
) -> Result<Page> {
    let (events, next_cursor) = match style {
        CursorStyle::Midgard => {
            let events = take_array(&mut body, "actions", source)?;
            let next = non_empty_cursor(
                body.get("meta")
                    .and_then(|meta| meta.get("nextPageToken")),
            );
            (events, next)
        }
        CursorStyle::Lifi => {
            let events = take_array(&mut body, "data", source)?;
            let has_next = body
                .get("hasNext")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let next = non_empty_cursor(body.get("next")).filter(|_| has_next);
            (events, next)
        }
        CursorStyle::Offset => {
            let events = take_array(&mut body, "transfers", source)?;
            let offset = match cursor {
                Some(cursor) => cursor
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid {source} offset cursor {cursor:?}"))?,
                None => 0,
            };
            let next = (events.len() as u64 == u64::from(page_limit))
                .then(|| (offset + events.len() as u64).to_string());
            (events, next)
        }
    };
    Ok(Page {
        events,
        cursor: cursor.map(str::to_string),
        next_cursor,
    })
}
