use chrono::Utc;
use std::collections::BTreeMap;
use swapledger_storage::sqlite_contention_snapshot;
use tracing::{info, warn};

use crate::reprocess::ReprocessSummary;
use crate::sync_runtime::CycleReport;

pub(crate) fn format_error_chain(error: &anyhow::Error) -> String {
    let mut chain = String::new();
    for (idx, cause) in error.chain().enumerate() {
        if idx > 0 {
            chain.push_str(" | ");
        }
        chain.push_str(&cause.to_string());
    }
    chain
}

pub(crate) fn stop_reason_counts(report: &CycleReport) -> BTreeMap<&'static str, u64> {
    let mut counts = BTreeMap::new();
    for source in &report.sources {
        let key = match (source.failed(), source.stop_reason) {
            (true, _) => "failed",
            (false, Some(reason)) => reason.as_str(),
            (false, None) => "unknown",
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

pub(crate) fn log_cycle_report(report: &CycleReport) {
    let elapsed_ms = (Utc::now() - report.started_at).num_milliseconds().max(0);
    let failed_sources = report.failed_sources();
    let stop_reasons = stop_reason_counts(report);
    let sqlite = sqlite_contention_snapshot();
    if failed_sources.is_empty() {
        info!(
            cycle_id = %report.cycle_id,
            mode = report.mode.as_str(),
            sources = report.sources.len(),
            inserted = report.inserted_total(),
            stop_reasons = ?stop_reasons,
            sqlite_write_retry_total = sqlite.write_retry_total,
            sqlite_busy_error_total = sqlite.busy_error_total,
            elapsed_ms,
            "sync cycle finished"
        );
    } else {
        warn!(
            cycle_id = %report.cycle_id,
            mode = report.mode.as_str(),
            sources = report.sources.len(),
            inserted = report.inserted_total(),
            failed_sources = ?failed_sources,
            stop_reasons = ?stop_reasons,
            sqlite_write_retry_total = sqlite.write_retry_total,
            sqlite_busy_error_total = sqlite.busy_error_total,
            elapsed_ms,
            "sync cycle finished with failed sources"
        );
    }
}

pub(crate) fn log_reprocess_summary(summary: &ReprocessSummary) {
    info!(
        examined = summary.examined,
        recovered = summary.recovered,
        inserted = summary.inserted,
        dropped = summary.dropped,
        still_failing = summary.still_failing,
        "ingestion error reprocess finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_runtime::{SourceRunReport, SyncMode};
    use anyhow::anyhow;
    use swapledger_core_types::SwapSource;
    use swapledger_ingestion::StopReason;
    use uuid::Uuid;

    #[test]
    fn error_chain_joins_every_cause() {
        let error = anyhow!("connection reset").context("failed to fetch thorchain page");
        assert_eq!(
            format_error_chain(&error),
            "failed to fetch thorchain page | connection reset"
        );
    }

    #[test]
    fn failed_sources_count_as_failed_whatever_the_walker_said() {
        let report = CycleReport {
            cycle_id: Uuid::new_v4(),
            mode: SyncMode::Incremental,
            started_at: Utc::now(),
            sources: vec![
                SourceRunReport {
                    source: SwapSource::Thorchain,
                    pages: 2,
                    parsed: 3,
                    inserted: 3,
                    skipped: 0,
                    rejected: 0,
                    stop_reason: Some(StopReason::ReachedKnownData),
                    error: None,
                },
                SourceRunReport {
                    source: SwapSource::Lifi,
                    pages: 0,
                    parsed: 0,
                    inserted: 0,
                    skipped: 0,
                    rejected: 0,
                    stop_reason: None,
                    error: Some("lifi page fetch failed".to_string()),
                },
            ],
        };
        let counts = stop_reason_counts(&report);
        assert_eq!(counts.get("reached_known_data"), Some(&1));
        assert_eq!(counts.get("failed"), Some(&1));
        assert_eq!(report.failed_sources(), vec![SwapSource::Lifi]);
        assert_eq!(report.inserted_total(), 3);
    }
}
