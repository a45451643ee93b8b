use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use swapledger_core_types::{FeeValuation, SwapSource};
use tracing::info;

/// Per-source counters shared by the client, feed and parsers.
#[derive(Debug)]
pub struct IngestionTelemetry {
    source: SwapSource,
    pub(crate) requests_total: AtomicU64,
    pub(crate) http_429: AtomicU64,
    pub(crate) http_5xx: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) endpoint_fallbacks: AtomicU64,
    pub(crate) endpoints_exhausted: AtomicU64,
    pub(crate) price_lookups: AtomicU64,
    pub(crate) price_lookup_failures: AtomicU64,
    parsed_total: AtomicU64,
    skipped_total: AtomicU64,
    rejected_total: AtomicU64,
    bps_mismatch_total: AtomicU64,
    rejected_by_reason: Mutex<BTreeMap<&'static str, u64>>,
    fee_valuation_counts: Mutex<BTreeMap<FeeValuation, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub requests_total: u64,
    pub http_429: u64,
    pub http_5xx: u64,
    pub timeouts: u64,
    pub endpoint_fallbacks: u64,
    pub endpoints_exhausted: u64,
    pub parsed_total: u64,
    pub skipped_total: u64,
    pub rejected_total: u64,
    pub bps_mismatch_total: u64,
}

impl IngestionTelemetry {
    pub fn new(source: SwapSource) -> Self {
        Self {
            source,
            requests_total: AtomicU64::new(0),
            http_429: AtomicU64::new(0),
            http_5xx: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            endpoint_fallbacks: AtomicU64::new(0),
            endpoints_exhausted: AtomicU64::new(0),
            price_lookups: AtomicU64::new(0),
            price_lookup_failures: AtomicU64::new(0),
            parsed_total: AtomicU64::new(0),
            skipped_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            bps_mismatch_total: AtomicU64::new(0),
            rejected_by_reason: Mutex::new(BTreeMap::new()),
            fee_valuation_counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn source(&self) -> SwapSource {
        self.source
    }

    pub fn note_parsed(&self, valuation: Option<FeeValuation>) {
        self.parsed_total.fetch_add(1, Ordering::Relaxed);
        if let Some(valuation) = valuation {
            if let Ok(mut guard) = self.fee_valuation_counts.lock() {
                let entry = guard.entry(valuation).or_insert(0);
                *entry = entry.saturating_add(1);
            }
        }
    }

    pub fn note_skipped(&self) {
        self.skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_bps_mismatch(&self) {
        self.bps_mismatch_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_parse_rejected(&self, error: &anyhow::Error) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        let reason = classify_parse_reject_reason(error);
        if let Ok(mut guard) = self.rejected_by_reason.lock() {
            let entry = guard.entry(reason).or_insert(0);
            *entry = entry.saturating_add(1);
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            http_429: self.http_429.load(Ordering::Relaxed),
            http_5xx: self.http_5xx.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            endpoint_fallbacks: self.endpoint_fallbacks.load(Ordering::Relaxed),
            endpoints_exhausted: self.endpoints_exhausted.load(Ordering::Relaxed),
            parsed_total: self.parsed_total.load(Ordering::Relaxed),
            skipped_total: self.skipped_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            bps_mismatch_total: self.bps_mismatch_total.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) {
        let rejected_by_reason = self
            .rejected_by_reason
            .lock()
            .ok()
            .map(|values| values.clone())
            .unwrap_or_default();
        let fee_valuation_counts: BTreeMap<&'static str, u64> = self
            .fee_valuation_counts
            .lock()
            .ok()
            .map(|values| {
                values
                    .iter()
                    .map(|(valuation, count)| (valuation.as_str(), *count))
                    .collect()
            })
            .unwrap_or_default();
        let snapshot = self.snapshot();
        info!(
            source = %self.source,
            requests_total = snapshot.requests_total,
            http_429 = snapshot.http_429,
            http_5xx = snapshot.http_5xx,
            timeouts = snapshot.timeouts,
            endpoint_fallbacks = snapshot.endpoint_fallbacks,
            endpoints_exhausted = snapshot.endpoints_exhausted,
            price_lookups = self.price_lookups.load(Ordering::Relaxed),
            price_lookup_failures = self.price_lookup_failures.load(Ordering::Relaxed),
            parsed_total = snapshot.parsed_total,
            skipped_total = snapshot.skipped_total,
            rejected_total = snapshot.rejected_total,
            bps_mismatch_total = snapshot.bps_mismatch_total,
            rejected_by_reason = ?rejected_by_reason,
            fee_valuation_counts = ?fee_valuation_counts,
            "ingestion source metrics"
        );
    }
}

pub fn classify_parse_reject_reason(error: &anyhow::Error) -> &'static str {
    let lowered = error.to_string().to_ascii_lowercase();
    if lowered.contains("timestamp") {
        return "invalid_timestamp";
    }
    if lowered.contains("missing in[0]") || lowered.contains("missing input") {
        return "missing_input";
    }
    if lowered.contains("tx id") || lowered.contains("transaction id") {
        return "missing_tx_id";
    }
    if lowered.contains("amount") {
        return "invalid_amount";
    }
    "other"
}
