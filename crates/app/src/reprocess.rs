use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use swapledger_core_types::SwapSource;
use swapledger_ingestion::ParserRegistry;
use swapledger_storage::IngestionErrorRow;
use tracing::{debug, warn};

use crate::gateway::PersistenceGateway;
use crate::telemetry::format_error_chain;

const REPROCESS_BATCH_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReprocessSummary {
    pub(crate) examined: usize,
    pub(crate) recovered: usize,
    pub(crate) inserted: usize,
    /// Events the current parsers no longer consider ours.
    pub(crate) dropped: usize,
    pub(crate) still_failing: usize,
}

/// One pass over the stored rejects that still have attempts left.
pub(crate) fn reprocess_ingestion_errors(
    gateway: &mut PersistenceGateway,
    parsers: &ParserRegistry,
    max_attempts: u32,
) -> Result<ReprocessSummary> {
    let rows = gateway
        .store()
        .list_ingestion_errors(None, max_attempts, REPROCESS_BATCH_LIMIT)
        .context("failed to load ingestion errors for reprocessing")?;
    let mut summary = ReprocessSummary::default();

    for row in rows {
        summary.examined += 1;
        match replay(gateway, parsers, &row) {
            Ok(Some(inserted)) => {
                summary.recovered += 1;
                summary.inserted += inserted;
                gateway.store().delete_ingestion_error(row.id)?;
            }
            Ok(None) => {
                summary.dropped += 1;
                gateway.store().delete_ingestion_error(row.id)?;
                debug!(source = %row.source, tx_id = %row.tx_id, "reprocessed event skipped");
            }
            Err(error) => {
                summary.still_failing += 1;
                let chain = format_error_chain(&error);
                warn!(
                    source = %row.source,
                    tx_id = %row.tx_id,
                    retry_count = row.retry_count + 1,
                    error = %chain,
                    "reprocess attempt failed"
                );
                gateway.store().bump_ingestion_error_retry(row.id, &chain)?;
            }
        }
    }
    Ok(summary)
}

/// `Some(inserted)` when the event now parses to a swap, `None` when it is skipped.
fn replay(
    gateway: &mut PersistenceGateway,
    parsers: &ParserRegistry,
    row: &IngestionErrorRow,
) -> Result<Option<usize>> {
    let source: SwapSource = row
        .source
        .parse()
        .with_context(|| format!("stored ingestion error id={} has unknown source", row.id))?;
    let raw: Value = serde_json::from_str(&row.raw_payload)
        .with_context(|| format!("stored payload for tx_id={} is not json", row.tx_id))?;
    let Some(swap) = parsers.parse(source, &raw)? else {
        return Ok(None);
    };
    if !swap.has_affiliate_parity() {
        return Err(anyhow!(
            "reparsed swap tx_id={} has mismatched affiliate lists",
            swap.tx_id
        ));
    }
    gateway.upsert_batch(std::slice::from_ref(&swap)).map(Some)
}
