use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use swapledger_config::AffiliateConfig;
use swapledger_core_types::{
    classify_volume_tier, normalize_event_time, FeeValuation, Swap, SwapSource,
};
use tracing::warn;

use super::affiliate::{platform_from_code, reconcile_usd, resolve_affiliates};
use super::{f64_at, parse_epoch, str_at, u64_at, SwapParser};
use crate::pricing::PriceOracle;
use crate::telemetry::IngestionTelemetry;

/// Base-unit decimals per asset. Overrides match on a substring of the asset id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetScaling {
    default_decimals: u32,
    overrides: Vec<(&'static str, u32)>,
}

impl AssetScaling {
    pub fn uniform(decimals: u32) -> Self {
        Self {
            default_decimals: decimals,
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, asset_fragment: &'static str, decimals: u32) -> Self {
        self.overrides.push((asset_fragment, decimals));
        self
    }

    pub fn decimals(&self, asset: &str) -> u32 {
        let upper = asset.to_ascii_uppercase();
        self.overrides
            .iter()
            .find(|(fragment, _)| upper.contains(fragment))
            .map(|(_, decimals)| *decimals)
            .unwrap_or(self.default_decimals)
    }

    pub fn to_units(&self, asset: &str, base_units: f64) -> f64 {
        base_units / 10f64.powi(self.decimals(asset) as i32)
    }
}

/// What differs between the Midgard-style AMMs.
#[derive(Debug, Clone)]
pub struct AmmProfile {
    pub source: SwapSource,
    pub settlement_asset: &'static str,
    pub chain: &'static str,
    pub scaling: AssetScaling,
    /// When false the affiliate output amount is ignored and the fee is always
    /// valued from bps; Maya's Midgard reports inflated fee amounts.
    pub value_fee_output: bool,
}

impl AmmProfile {
    pub fn thorchain() -> Self {
        Self {
            source: SwapSource::Thorchain,
            settlement_asset: "THOR.RUNE",
            chain: "THOR",
            scaling: AssetScaling::uniform(8),
            value_fee_output: true,
        }
    }

    pub fn mayachain() -> Self {
        Self {
            source: SwapSource::Mayachain,
            settlement_asset: "MAYA.CACAO",
            chain: "MAYA",
            scaling: AssetScaling::uniform(8)
                .with_override("CACAO", 10)
                .with_override("MAYA", 10),
            value_fee_output: false,
        }
    }
}

pub struct MidgardSwapParser {
    profile: AmmProfile,
    affiliate_codes: Vec<String>,
    platform_by_code: BTreeMap<String, String>,
    prices: Arc<dyn PriceOracle>,
    telemetry: Arc<IngestionTelemetry>,
}

struct Coin<'a> {
    asset: &'a str,
    amount: f64,
}

fn first_coin(holder: &Value) -> Option<Coin<'_>> {
    let coin = holder.get("coins")?.get(0)?;
    Some(Coin {
        asset: str_at(coin, "asset").unwrap_or(""),
        amount: f64_at(coin, "amount").unwrap_or(0.0),
    })
}

/// Affiliate outputs follow the order of the memo's affiliate list, so with one
/// output per slot the platform's is the one at `slot`. Otherwise some
/// referrer took no fee and the first coin-bearing affiliate output is used.
fn find_affiliate_fee_output(outputs: &[Value], slot: usize, slot_count: usize) -> Option<&Value> {
    let affiliate_outputs: Vec<&Value> = outputs
        .iter()
        .filter(|output| {
            output
                .get("affiliate")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .collect();
    let platform_output = match affiliate_outputs.get(slot) {
        Some(output) if affiliate_outputs.len() == slot_count => Some(*output),
        _ => None,
    };
    platform_output
        .filter(|output| first_coin(output).is_some())
        .or_else(|| {
            affiliate_outputs
                .into_iter()
                .find(|output| first_coin(output).is_some())
        })
}

/// The swap's delivered output: a non-affiliate output in a different asset,
/// else any non-affiliate output, else the first one.
fn find_swap_output<'a>(outputs: &'a [Value], in_asset: &str) -> Option<&'a Value> {
    let is_affiliate = |output: &Value| {
        output
            .get("affiliate")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    outputs
        .iter()
        .find(|output| {
            !is_affiliate(output)
                && first_coin(output).is_some_and(|coin| coin.asset != in_asset)
        })
        .or_else(|| outputs.iter().find(|output| !is_affiliate(output)))
        .or_else(|| outputs.first())
}

impl MidgardSwapParser {
    pub fn new(
        profile: AmmProfile,
        affiliates: &AffiliateConfig,
        prices: Arc<dyn PriceOracle>,
        telemetry: Arc<IngestionTelemetry>,
    ) -> Self {
        Self {
            profile,
            affiliate_codes: affiliates.codes.clone(),
            platform_by_code: affiliates.platform_by_code.clone(),
            prices,
            telemetry,
        }
    }

    pub fn profile(&self) -> &AmmProfile {
        &self.profile
    }

    /// Settlement asset price at `ts`: the oracle first, then whichever swap leg
    /// is the settlement asset.
    fn settlement_price(
        &self,
        ts: DateTime<Utc>,
        legs: [(&str, f64); 2],
    ) -> Option<(f64, FeeValuation)> {
        let settlement = self.profile.settlement_asset;
        if let Some(price) = self
            .prices
            .price_usd(settlement, self.profile.chain, ts)
            .filter(|price| *price > 0.0)
        {
            return Some((price, FeeValuation::FeeOutputSettlementPrice));
        }
        legs.iter()
            .find(|(asset, price)| *asset == settlement && *price > 0.0)
            .map(|(_, price)| (*price, FeeValuation::FeeOutputSwapLegPrice))
    }

    fn network_fee_usd(
        &self,
        swap_meta: &Value,
        settlement_price: Option<f64>,
        legs: [(&str, f64); 2],
    ) -> f64 {
        let Some(fees) = swap_meta.get("networkFees").and_then(Value::as_array) else {
            return 0.0;
        };
        fees.iter()
            .filter_map(|fee| {
                let asset = str_at(fee, "asset")?;
                let amount = self.profile.scaling.to_units(asset, f64_at(fee, "amount")?);
                let price = if asset == self.profile.settlement_asset {
                    settlement_price
                } else {
                    legs.iter()
                        .find(|(leg, price)| *leg == asset && *price > 0.0)
                        .map(|(_, price)| *price)
                }?;
                Some(amount * price)
            })
            .sum()
    }
}

impl SwapParser for MidgardSwapParser {
    fn source(&self) -> SwapSource {
        self.profile.source
    }

    fn parse(&self, raw: &Value) -> Result<Option<Swap>> {
        let source = self.profile.source;
        let swap_meta = raw
            .get("metadata")
            .and_then(|metadata| metadata.get("swap"))
            .unwrap_or(&Value::Null);
        let affiliate_field = str_at(swap_meta, "affiliateAddress").unwrap_or("");
        let memo = str_at(swap_meta, "memo").unwrap_or("");

        let Some(affiliate) = resolve_affiliates(affiliate_field, memo, &self.affiliate_codes)
        else {
            return Ok(None);
        };

        let outputs: &[Value] = raw
            .get("out")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let Some(fee_coin) = find_affiliate_fee_output(outputs, affiliate.slot, affiliate.slot_count)
            .and_then(first_coin)
        else {
            return Ok(None);
        };

        let input = raw
            .get("in")
            .and_then(|ins| ins.get(0))
            .ok_or_else(|| anyhow!("missing in[0] in {source} action"))?;
        let tx_id = str_at(input, "txID")
            .ok_or_else(|| anyhow!("missing tx id in {source} action"))?
            .to_string();
        let date = raw
            .get("date")
            .ok_or_else(|| anyhow!("missing timestamp in {source} action {tx_id}"))?;
        let (timestamp, date_bucket) = normalize_event_time(parse_epoch(date)?);
        let in_coin =
            first_coin(input).ok_or_else(|| anyhow!("missing input coin in {source} action {tx_id}"))?;

        if affiliate.bps_mismatch {
            self.telemetry.note_bps_mismatch();
            warn!(
                source = %source,
                tx_id = %tx_id,
                affiliate = affiliate_field,
                memo,
                "memo bps list does not match affiliate list, using fallback bps"
            );
        }

        let out_coin = find_swap_output(outputs, in_coin.asset).and_then(first_coin);
        let (out_asset, out_base_units) = out_coin
            .map(|coin| (coin.asset, coin.amount))
            .unwrap_or(("", 0.0));

        let scaling = &self.profile.scaling;
        let in_price = f64_at(swap_meta, "inPriceUSD").unwrap_or(0.0);
        let out_price = f64_at(swap_meta, "outPriceUSD").unwrap_or(0.0);
        let in_amount = scaling.to_units(in_coin.asset, in_coin.amount);
        let out_amount = scaling.to_units(out_asset, out_base_units);
        let slip_bps = f64_at(swap_meta, "swapSlip").unwrap_or(0.0);
        let (in_usd, out_usd) = reconcile_usd(in_amount * in_price, out_amount * out_price, slip_bps);
        let total_fee_usd = (in_usd - out_usd).max(0.0);

        let legs = [(in_coin.asset, in_price), (out_asset, out_price)];
        let settlement = self.settlement_price(timestamp, legs);
        let bps_fee_usd = f64::from(affiliate.bps) / 10_000.0 * in_usd;
        let fee_units = scaling.to_units(fee_coin.asset, fee_coin.amount);
        let (affiliate_fee_usd, fee_valuation) = if !self.profile.value_fee_output {
            (bps_fee_usd, FeeValuation::BpsFallback)
        } else if fee_coin.asset == self.profile.settlement_asset {
            match settlement {
                Some((price, valuation)) => (fee_units * price, valuation),
                None => (bps_fee_usd, FeeValuation::BpsFallback),
            }
        } else if fee_coin.asset == in_coin.asset && in_price > 0.0 {
            (fee_units * in_price, FeeValuation::FeeOutputLegPrice)
        } else if fee_coin.asset == out_asset && out_price > 0.0 {
            (fee_units * out_price, FeeValuation::FeeOutputLegPrice)
        } else {
            (bps_fee_usd, FeeValuation::BpsFallback)
        };

        let settlement_price = settlement.map(|(price, _)| price);
        let liquidity_fee_usd = match (f64_at(swap_meta, "liquidityFee"), settlement_price) {
            (Some(fee), Some(price)) => {
                scaling.to_units(self.profile.settlement_asset, fee) * price
            }
            _ => 0.0,
        };
        let network_fee_usd = self.network_fee_usd(swap_meta, settlement_price, legs);

        let pools = raw
            .get("pools")
            .and_then(Value::as_array)
            .map(|pools| {
                pools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Swap {
            source,
            tx_id,
            timestamp,
            date_bucket,
            user_address: str_at(input, "address").unwrap_or("").to_string(),
            in_asset: in_coin.asset.to_string(),
            out_asset: out_asset.to_string(),
            in_amount,
            out_amount,
            in_amount_usd: in_usd,
            out_amount_usd: out_usd,
            in_price_usd: Some(in_price).filter(|price| *price > 0.0),
            out_price_usd: Some(out_price).filter(|price| *price > 0.0),
            total_fee_usd,
            network_fee_usd,
            liquidity_fee_usd,
            affiliate_fee_usd: affiliate_fee_usd.max(0.0),
            platform: platform_from_code(&affiliate.code, &self.platform_by_code),
            affiliate_addresses: affiliate.addresses,
            affiliate_fee_bps: affiliate.fee_bps,
            volume_tier: classify_volume_tier(in_usd).to_string(),
            fee_valuation: Some(fee_valuation),
            block_height: u64_at(raw, "height"),
            swap_slip_bps: swap_meta
                .get("swapSlip")
                .and(Some(slip_bps))
                .filter(|slip| *slip >= 0.0)
                .map(|slip| slip.round() as u32),
            pools,
            is_streaming_swap: swap_meta
                .get("isStreamingSwap")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            status: str_at(raw, "status").unwrap_or("success").to_string(),
            memo: Some(memo.to_string()).filter(|memo| !memo.is_empty()),
            raw_payload: raw.clone(),
        }))
    }
}
