use super::{format_ts, parse_ts, IngestionErrorRow, SqliteStore};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use swapledger_core_types::SwapSource;

impl SqliteStore {
    /// Records a rejected event. A repeat for the same `(source, tx_id)` refreshes
    /// the message and payload but keeps the retry count.
    pub fn record_ingestion_error(
        &self,
        source: SwapSource,
        tx_id: &str,
        error_type: &str,
        error_message: &str,
        raw_payload: &Value,
    ) -> Result<()> {
        let now = format_ts(Utc::now());
        let raw_payload = raw_payload.to_string();
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO ingestion_errors(
                    source, tx_id, error_type, error_message, raw_payload,
                    retry_count, first_seen_at, last_attempt_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
                 ON CONFLICT(source, tx_id) DO UPDATE SET
                    error_type = excluded.error_type,
                    error_message = excluded.error_message,
                    raw_payload = excluded.raw_payload,
                    last_attempt_at = excluded.last_attempt_at",
                params![
                    source.as_str(),
                    tx_id,
                    error_type,
                    error_message,
                    &raw_payload,
                    &now
                ],
            )
        })
        .with_context(|| format!("failed to record ingestion error source={source} tx_id={tx_id}"))?;
        Ok(())
    }

    pub fn list_ingestion_errors(
        &self,
        source: Option<SwapSource>,
        max_retry_count: u32,
        limit: usize,
    ) -> Result<Vec<IngestionErrorRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, source, tx_id, error_type, error_message, raw_payload,
                        retry_count, first_seen_at, last_attempt_at
                 FROM ingestion_errors
                 WHERE (?1 IS NULL OR source = ?1) AND retry_count < ?2
                 ORDER BY first_seen_at ASC, id ASC
                 LIMIT ?3",
            )
            .context("failed to prepare ingestion error query")?;
        let rows = stmt
            .query_map(
                params![
                    source.map(SwapSource::as_str),
                    max_retry_count,
                    limit.min(i64::MAX as usize) as i64
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .context("failed to query ingestion errors")?;

        let mut errors = Vec::new();
        for row in rows {
            let (
                id,
                source,
                tx_id,
                error_type,
                error_message,
                raw_payload,
                retry_count,
                first_seen_at,
                last_attempt_at,
            ) = row.context("failed to read ingestion error row")?;
            errors.push(IngestionErrorRow {
                id,
                source,
                tx_id,
                error_type,
                error_message,
                raw_payload,
                retry_count,
                first_seen_at: parse_ts(&first_seen_at)?,
                last_attempt_at: parse_ts(&last_attempt_at)?,
            });
        }
        Ok(errors)
    }

    pub fn bump_ingestion_error_retry(&self, id: i64, error_message: &str) -> Result<()> {
        let now = format_ts(Utc::now());
        self.execute_with_retry(|conn| {
            conn.execute(
                "UPDATE ingestion_errors
                 SET retry_count = retry_count + 1,
                     error_message = ?2,
                     last_attempt_at = ?3
                 WHERE id = ?1",
                params![id, error_message, &now],
            )
        })
        .with_context(|| format!("failed to bump ingestion error retry id={id}"))?;
        Ok(())
    }

    pub fn delete_ingestion_error(&self, id: i64) -> Result<bool> {
        let deleted = self
            .execute_with_retry(|conn| {
                conn.execute("DELETE FROM ingestion_errors WHERE id = ?1", params![id])
            })
            .with_context(|| format!("failed to delete ingestion error id={id}"))?;
        Ok(deleted > 0)
    }

    pub fn ingestion_error_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ingestion_errors", [], |row| row.get(0))
            .context("failed to count ingestion errors")?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_store;
    use serde_json::json;

    #[test]
    fn repeated_error_for_same_event_keeps_one_row() -> Result<()> {
        let (_temp, store) = migrated_store("ingestion-errors-upsert.db")?;
        let payload = json!({"metadata": {}});
        store.record_ingestion_error(SwapSource::Thorchain, "TX1", "parse", "missing in[0]", &payload)?;
        store.record_ingestion_error(SwapSource::Thorchain, "TX1", "parse", "missing date", &payload)?;

        let rows = store.list_ingestion_errors(None, 10, 100)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error_message, "missing date");
        assert_eq!(rows[0].retry_count, 0);
        Ok(())
    }

    #[test]
    fn exhausted_rows_are_excluded_from_replay_listing() -> Result<()> {
        let (_temp, store) = migrated_store("ingestion-errors-retry.db")?;
        let payload = json!({});
        store.record_ingestion_error(SwapSource::Lifi, "A", "parse", "bad", &payload)?;
        store.record_ingestion_error(SwapSource::Arkham, "B", "parse", "bad", &payload)?;

        let rows = store.list_ingestion_errors(Some(SwapSource::Lifi), 2, 100)?;
        assert_eq!(rows.len(), 1);
        let id = rows[0].id;
        store.bump_ingestion_error_retry(id, "still bad")?;
        store.bump_ingestion_error_retry(id, "still bad")?;
        assert!(store
            .list_ingestion_errors(Some(SwapSource::Lifi), 2, 100)?
            .is_empty());
        assert_eq!(store.list_ingestion_errors(None, 2, 100)?.len(), 1);

        assert!(store.delete_ingestion_error(id)?);
        assert_eq!(store.ingestion_error_count()?, 1);
        Ok(())
    }
}
