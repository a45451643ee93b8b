use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapSource {
    Thorchain,
    Mayachain,
    Lifi,
    Arkham,
}

impl SwapSource {
    pub const ALL: [SwapSource; 4] = [
        SwapSource::Thorchain,
        SwapSource::Mayachain,
        SwapSource::Lifi,
        SwapSource::Arkham,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thorchain => "thorchain",
            Self::Mayachain => "mayachain",
            Self::Lifi => "lifi",
            Self::Arkham => "arkham",
        }
    }

    /// AMM sources carry memo-encoded affiliate lists and the shared fee algorithm.
    pub fn is_amm(self) -> bool {
        matches!(self, Self::Thorchain | Self::Mayachain)
    }
}

impl fmt::Display for SwapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for SwapSource {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thorchain" => Ok(Self::Thorchain),
            "mayachain" => Ok(Self::Mayachain),
            "lifi" => Ok(Self::Lifi),
            "arkham" => Ok(Self::Arkham),
            _ => Err(UnknownVariant::new("swap source", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
    Mac,
    Windows,
    Other,
    Unknown,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
            Self::Mac => "mac",
            Self::Windows => "windows",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "web" => Ok(Self::Web),
            "mac" => Ok(Self::Mac),
            "windows" => Ok(Self::Windows),
            "other" => Ok(Self::Other),
            "unknown" => Ok(Self::Unknown),
            _ => Err(UnknownVariant::new("platform", value)),
        }
    }
}

/// Which path produced `affiliate_fee_usd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeValuation {
    FeeOutputSettlementPrice,
    FeeOutputSwapLegPrice,
    FeeOutputLegPrice,
    BpsFallback,
    RouteFeeSteps,
    ProviderReported,
}

impl FeeValuation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FeeOutputSettlementPrice => "fee_output_settlement_price",
            Self::FeeOutputSwapLegPrice => "fee_output_swap_leg_price",
            Self::FeeOutputLegPrice => "fee_output_leg_price",
            Self::BpsFallback => "bps_fallback",
            Self::RouteFeeSteps => "route_fee_steps",
            Self::ProviderReported => "provider_reported",
        }
    }
}

impl FromStr for FeeValuation {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "fee_output_settlement_price" => Ok(Self::FeeOutputSettlementPrice),
            "fee_output_swap_leg_price" => Ok(Self::FeeOutputSwapLegPrice),
            "fee_output_leg_price" => Ok(Self::FeeOutputLegPrice),
            "bps_fallback" => Ok(Self::BpsFallback),
            "route_fee_steps" => Ok(Self::RouteFeeSteps),
            "provider_reported" => Ok(Self::ProviderReported),
            _ => Err(UnknownVariant::new("fee valuation", value)),
        }
    }
}

/// Canonical swap record shared by every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub source: SwapSource,
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
    pub date_bucket: NaiveDate,
    pub user_address: String,
    pub in_asset: String,
    pub out_asset: String,
    pub in_amount: f64,
    pub out_amount: f64,
    pub in_amount_usd: f64,
    pub out_amount_usd: f64,
    pub in_price_usd: Option<f64>,
    pub out_price_usd: Option<f64>,
    pub total_fee_usd: f64,
    pub network_fee_usd: f64,
    pub liquidity_fee_usd: f64,
    pub affiliate_fee_usd: f64,
    pub affiliate_addresses: Vec<String>,
    pub affiliate_fee_bps: Vec<u32>,
    pub platform: Platform,
    pub volume_tier: String,
    pub fee_valuation: Option<FeeValuation>,
    pub block_height: Option<u64>,
    pub swap_slip_bps: Option<u32>,
    pub pools: Vec<String>,
    pub is_streaming_swap: bool,
    pub status: String,
    pub memo: Option<String>,
    pub raw_payload: Value,
}

impl Swap {
    pub fn natural_key(&self) -> (SwapSource, &str, DateTime<Utc>) {
        (self.source, self.tx_id.as_str(), self.timestamp)
    }

    pub fn has_affiliate_parity(&self) -> bool {
        self.affiliate_addresses.len() == self.affiliate_fee_bps.len()
    }
}

/// Event times are kept at second precision so the natural key is stable
/// across providers that report nanoseconds.
pub fn normalize_event_time(ts: DateTime<Utc>) -> (DateTime<Utc>, NaiveDate) {
    let ts = ts.trunc_subsecs(0);
    (ts, ts.date_naive())
}

const VOLUME_TIERS: [(f64, &str); 10] = [
    (100.0, "<=$100"),
    (1_000.0, "100-1000"),
    (5_000.0, "1000-5000"),
    (10_000.0, "5000-10000"),
    (50_000.0, "10000-50000"),
    (100_000.0, "50000-100000"),
    (250_000.0, "100000-250000"),
    (500_000.0, "250000-500000"),
    (750_000.0, "500000-750000"),
    (1_000_000.0, "750000-1000000"),
];

pub fn classify_volume_tier(volume_usd: f64) -> &'static str {
    VOLUME_TIERS
        .iter()
        .find(|(upper, _)| volume_usd <= *upper)
        .map(|(_, label)| *label)
        .unwrap_or(">1000000")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Parsing,
    Persisting,
    Draining,
    Failed,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Persisting => "persisting",
            Self::Draining => "draining",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncPhase {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "idle" => Ok(Self::Idle),
            "fetching" => Ok(Self::Fetching),
            "parsing" => Ok(Self::Parsing),
            "persisting" => Ok(Self::Persisting),
            "draining" => Ok(Self::Draining),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownVariant::new("sync phase", value)),
        }
    }
}

/// Per-source progress, owned by the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub source: SwapSource,
    pub resume_cursor: Option<String>,
    pub newest_ingested_timestamp: Option<DateTime<Utc>>,
    pub consecutive_error_count: u32,
    pub last_error: Option<String>,
    pub phase: SyncPhase,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(source: SwapSource) -> Self {
        Self {
            source,
            resume_cursor: None,
            newest_ingested_timestamp: None,
            consecutive_error_count: 0,
            last_error: None,
            phase: SyncPhase::Idle,
            last_synced_at: None,
        }
    }

    pub fn note_page_success(&mut self, cursor: Option<String>, now: DateTime<Utc>) {
        self.resume_cursor = cursor;
        self.consecutive_error_count = 0;
        self.last_error = None;
        self.last_synced_at = Some(now);
    }

    pub fn note_failure(&mut self, error: String) {
        self.consecutive_error_count = self.consecutive_error_count.saturating_add(1);
        self.last_error = Some(error);
        self.phase = SyncPhase::Failed;
    }

    pub fn advance_newest(&mut self, ts: DateTime<Utc>) {
        if self.newest_ingested_timestamp.map_or(true, |current| ts > current) {
            self.newest_ingested_timestamp = Some(ts);
        }
    }
}
