use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use swapledger_core_types::{
    classify_volume_tier, normalize_event_time, FeeValuation, Swap, SwapSource,
};

use super::affiliate::platform_from_integrator;
use super::{f64_at, parse_epoch, str_at, u64_at, SwapParser};

const DEFAULT_TOKEN_DECIMALS: u32 = 18;
const FEE_COLLECTION_TOOL: &str = "feeCollection";

pub struct LifiTransferParser {
    integrators: Vec<String>,
    platform_by_integrator: BTreeMap<String, String>,
}

struct TransferLeg<'a> {
    leg: &'a Value,
    token: &'a Value,
}

impl<'a> TransferLeg<'a> {
    fn new(raw: &'a Value, key: &str) -> Self {
        let leg = raw.get(key).unwrap_or(&Value::Null);
        Self {
            leg,
            token: leg.get("token").unwrap_or(&Value::Null),
        }
    }

    fn decimals(&self) -> u32 {
        u64_at(self.token, "decimals")
            .and_then(|decimals| u32::try_from(decimals).ok())
            .unwrap_or(DEFAULT_TOKEN_DECIMALS)
    }

    fn scale(&self, base_units: f64) -> f64 {
        match self.decimals() {
            0 => base_units,
            decimals => base_units / 10f64.powi(decimals as i32),
        }
    }

    fn chain_id(&self) -> String {
        match self.token.get("chainId") {
            Some(Value::Number(number)) => number.to_string(),
            Some(Value::String(text)) => text.trim().to_string(),
            _ => String::new(),
        }
    }

    /// `SYMBOL-chainId`, e.g. `USDC-1`.
    fn asset(&self) -> String {
        format!(
            "{}-{}",
            str_at(self.token, "symbol").unwrap_or(""),
            self.chain_id()
        )
    }

    fn amount(&self) -> f64 {
        self.scale(f64_at(self.leg, "amount").unwrap_or(0.0))
    }

    fn usd(&self, key: &str) -> f64 {
        f64_at(self.leg, key).unwrap_or(0.0)
    }

    fn price(&self) -> f64 {
        f64_at(self.token, "priceUSD").unwrap_or(0.0)
    }
}

impl LifiTransferParser {
    pub fn new(integrators: &[String], platform_by_integrator: &BTreeMap<String, String>) -> Self {
        Self {
            integrators: integrators
                .iter()
                .map(|integrator| integrator.trim().to_ascii_lowercase())
                .filter(|integrator| !integrator.is_empty())
                .collect(),
            platform_by_integrator: platform_by_integrator.clone(),
        }
    }

    fn is_ours(&self, integrator: &str) -> bool {
        self.integrators.is_empty()
            || self
                .integrators
                .iter()
                .any(|known| known.eq_ignore_ascii_case(integrator))
    }

    /// Integrator fee taken by `feeCollection` steps, in sending-token USD.
    fn route_fee_usd(sending: &TransferLeg<'_>) -> f64 {
        let price = sending.price();
        if price <= 0.0 {
            return 0.0;
        }
        sending
            .leg
            .get("includedSteps")
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|step| str_at(step, "tool") == Some(FEE_COLLECTION_TOOL))
                    .map(|step| {
                        let taken = f64_at(step, "fromAmount").unwrap_or(0.0)
                            - f64_at(step, "toAmount").unwrap_or(0.0);
                        sending.scale(taken) * price
                    })
                    .sum()
            })
            .unwrap_or(0.0)
    }
}

impl SwapParser for LifiTransferParser {
    fn source(&self) -> SwapSource {
        SwapSource::Lifi
    }

    fn parse(&self, raw: &Value) -> Result<Option<Swap>> {
        let integrator = raw
            .get("metadata")
            .and_then(|metadata| str_at(metadata, "integrator"))
            .unwrap_or("");
        if !self.is_ours(integrator) {
            return Ok(None);
        }

        let sending = TransferLeg::new(raw, "sending");
        let receiving = TransferLeg::new(raw, "receiving");
        let tx_id = str_at(raw, "transactionId")
            .or_else(|| str_at(sending.leg, "txHash"))
            .ok_or_else(|| anyhow!("missing transaction id in lifi transfer"))?
            .to_string();
        let ts = sending
            .leg
            .get("timestamp")
            .ok_or_else(|| anyhow!("missing sending timestamp in lifi transfer {tx_id}"))?;
        let (timestamp, date_bucket) = normalize_event_time(parse_epoch(ts)?);

        let in_usd = sending.usd("amountUSD");
        let out_usd = receiving.usd("amountUSD");
        let affiliate_fee_usd = Self::route_fee_usd(&sending).max(0.0);
        let network_fee_usd = sending.usd("gasAmountUSD") + receiving.usd("gasAmountUSD");
        let liquidity_fee_usd = (in_usd - out_usd - affiliate_fee_usd).max(0.0);
        let in_price = sending.price();
        let out_price = receiving.price();

        Ok(Some(Swap {
            source: SwapSource::Lifi,
            tx_id,
            timestamp,
            date_bucket,
            user_address: str_at(raw, "fromAddress").unwrap_or("").to_string(),
            in_asset: sending.asset(),
            out_asset: receiving.asset(),
            in_amount: sending.amount(),
            out_amount: receiving.amount(),
            in_amount_usd: in_usd,
            out_amount_usd: out_usd,
            in_price_usd: Some(in_price).filter(|price| *price > 0.0),
            out_price_usd: Some(out_price).filter(|price| *price > 0.0),
            total_fee_usd: network_fee_usd + affiliate_fee_usd + liquidity_fee_usd,
            network_fee_usd,
            liquidity_fee_usd,
            affiliate_fee_usd,
            affiliate_addresses: Vec::new(),
            affiliate_fee_bps: Vec::new(),
            platform: platform_from_integrator(integrator, &self.platform_by_integrator),
            volume_tier: classify_volume_tier(in_usd).to_string(),
            fee_valuation: Some(FeeValuation::RouteFeeSteps),
            block_height: None,
            swap_slip_bps: None,
            pools: vec![format!("{}-{}", sending.chain_id(), receiving.chain_id())],
            is_streaming_swap: false,
            status: str_at(raw, "status").unwrap_or("unknown").to_string(),
            memo: Some(integrator.to_string()).filter(|memo| !memo.is_empty()),
            raw_payload: raw.clone(),
        }))
    }
}
