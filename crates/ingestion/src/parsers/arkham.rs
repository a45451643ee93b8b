use anyhow::{anyhow, Result};
use serde_json::Value;
use swapledger_core_types::{
    classify_volume_tier, normalize_event_time, FeeValuation, Platform, Swap, SwapSource,
};

use super::{f64_at, parse_rfc3339, str_at, u64_at, SwapParser};

const NATIVE_TOKEN_ADDRESS: &str = "NATIVE";

/// Arkham chain slugs to display names; unknown slugs are capitalized.
pub fn normalize_chain_name(chain: &str) -> String {
    let lowered = chain.trim().to_ascii_lowercase();
    let mapped = match lowered.as_str() {
        "" => "Unknown",
        "ethereum" => "Ethereum",
        "bsc" | "binance-smart-chain" => "BSC",
        "polygon" | "polygon-pos" => "Polygon",
        "arbitrum_one" | "arbitrum-one" => "Arbitrum",
        "optimism" => "Optimism",
        "base" => "Base",
        "avalanche" => "Avalanche",
        "blast" => "Blast",
        _ => {
            let mut chars = lowered.chars();
            return match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            };
        }
    };
    mapped.to_string()
}

fn native_symbol(chain: &str) -> Option<&'static str> {
    match chain {
        "Ethereum" | "Arbitrum" | "Optimism" | "Base" | "Blast" => Some("ETH"),
        "BSC" => Some("BNB"),
        "Polygon" => Some("MATIC"),
        "Avalanche" => Some("AVAX"),
        _ => None,
    }
}

fn address_of(holder: &Value) -> Option<&str> {
    match holder {
        Value::String(text) => Some(text.trim()).filter(|text| !text.is_empty()),
        Value::Object(_) => str_at(holder, "address"),
        _ => None,
    }
}

/// Aggregator name from the sender's Arkham entity label.
fn protocol_from_entity(from: &Value) -> Option<&'static str> {
    let entity = from.get("arkhamEntity")?;
    let id = str_at(entity, "id").unwrap_or("").to_ascii_lowercase();
    let name = str_at(entity, "name").unwrap_or("").to_ascii_lowercase();
    if id.contains("1inch") || name.contains("1inch") {
        Some("1inch")
    } else if id.contains("paraswap") || name.contains("paraswap") {
        Some("paraswap")
    } else if id.contains("cow") || name.contains("cowswap") {
        Some("cowswap")
    } else if id.contains("matcha") || name.contains("0x") {
        Some("matcha")
    } else {
        None
    }
}

/// One fee transfer into the integrator wallet becomes one swap row whose
/// whole fee is affiliate revenue.
pub struct ArkhamTransferParser {
    integrator_address: String,
}

impl ArkhamTransferParser {
    pub fn new(integrator_address: &str) -> Self {
        Self {
            integrator_address: integrator_address.trim().to_ascii_lowercase(),
        }
    }
}

impl SwapParser for ArkhamTransferParser {
    fn source(&self) -> SwapSource {
        SwapSource::Arkham
    }

    fn parse(&self, raw: &Value) -> Result<Option<Swap>> {
        let to = raw.get("toAddress").unwrap_or(&Value::Null);
        if !self.integrator_address.is_empty()
            && !address_of(to).is_some_and(|address| address.eq_ignore_ascii_case(&self.integrator_address))
        {
            return Ok(None);
        }

        let tx_id = str_at(raw, "transactionHash")
            .ok_or_else(|| anyhow!("missing transaction id in arkham transfer"))?
            .to_string();
        let block_ts = str_at(raw, "blockTimestamp")
            .ok_or_else(|| anyhow!("missing timestamp in arkham transfer {tx_id}"))?;
        let (timestamp, date_bucket) = normalize_event_time(parse_rfc3339(block_ts)?);

        let chain = normalize_chain_name(str_at(raw, "chain").unwrap_or(""));
        let token_address = str_at(raw, "tokenAddress").unwrap_or(NATIVE_TOKEN_ADDRESS);
        let symbol = match str_at(raw, "tokenSymbol") {
            Some(symbol) => symbol.to_string(),
            None if token_address.eq_ignore_ascii_case(NATIVE_TOKEN_ADDRESS) => {
                native_symbol(&chain).unwrap_or("").to_string()
            }
            None => String::new(),
        };
        let fee_usd = f64_at(raw, "historicalUSD").unwrap_or(0.0).max(0.0);
        let from = raw.get("fromAddress").unwrap_or(&Value::Null);

        Ok(Some(Swap {
            source: SwapSource::Arkham,
            tx_id,
            timestamp,
            date_bucket,
            user_address: address_of(from).unwrap_or("").to_string(),
            in_asset: String::new(),
            out_asset: format!("{symbol}.{chain}"),
            in_amount: 0.0,
            out_amount: f64_at(raw, "unitValue").unwrap_or(0.0),
            in_amount_usd: 0.0,
            out_amount_usd: fee_usd,
            in_price_usd: None,
            out_price_usd: None,
            total_fee_usd: fee_usd,
            network_fee_usd: 0.0,
            liquidity_fee_usd: 0.0,
            affiliate_fee_usd: fee_usd,
            affiliate_addresses: Vec::new(),
            affiliate_fee_bps: Vec::new(),
            platform: Platform::Unknown,
            volume_tier: classify_volume_tier(0.0).to_string(),
            fee_valuation: Some(FeeValuation::ProviderReported),
            block_height: u64_at(raw, "blockNumber"),
            swap_slip_bps: None,
            pools: vec![chain],
            is_streaming_swap: false,
            status: "success".to_string(),
            memo: protocol_from_entity(from).map(str::to_string),
            raw_payload: raw.clone(),
        }))
    }
}
