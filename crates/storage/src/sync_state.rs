use super::{format_ts, parse_ts, SqliteStore};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use swapledger_core_types::{SwapSource, SyncPhase, SyncState};

impl SqliteStore {
    /// Loads the source's sync row, creating an idle one on first use.
    pub fn load_or_create_sync_state(&self, source: SwapSource) -> Result<SyncState> {
        if let Some(state) = self.load_sync_state(source)? {
            return Ok(state);
        }
        let state = SyncState::new(source);
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sync_state(source, phase, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    source.as_str(),
                    state.phase.as_str(),
                    format_ts(Utc::now())
                ],
            )
        })
        .with_context(|| format!("failed to create sync state for source={source}"))?;
        Ok(state)
    }

    pub fn load_sync_state(&self, source: SwapSource) -> Result<Option<SyncState>> {
        type RawRow = (
            Option<String>,
            Option<String>,
            i64,
            Option<String>,
            String,
            Option<String>,
        );
        let raw: Option<RawRow> = self
            .conn
            .query_row(
                "SELECT resume_cursor, newest_ingested_ts, consecutive_error_count,
                        last_error, phase, last_synced_at
                 FROM sync_state WHERE source = ?1",
                params![source.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read sync state for source={source}"))?;

        let Some((resume_cursor, newest, error_count, last_error, phase, last_synced_at)) = raw
        else {
            return Ok(None);
        };
        Ok(Some(SyncState {
            source,
            resume_cursor,
            newest_ingested_timestamp: newest.as_deref().map(parse_ts).transpose()?,
            consecutive_error_count: error_count.clamp(0, i64::from(u32::MAX)) as u32,
            last_error,
            phase: phase
                .parse::<SyncPhase>()
                .map_err(|error| anyhow!("sync state for source={source}: {error}"))?,
            last_synced_at: last_synced_at.as_deref().map(parse_ts).transpose()?,
        }))
    }

    pub fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let newest = state.newest_ingested_timestamp.map(format_ts);
        let last_synced_at = state.last_synced_at.map(format_ts);
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO sync_state(
                    source, resume_cursor, newest_ingested_ts, consecutive_error_count,
                    last_error, phase, last_synced_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(source) DO UPDATE SET
                    resume_cursor = excluded.resume_cursor,
                    newest_ingested_ts = excluded.newest_ingested_ts,
                    consecutive_error_count = excluded.consecutive_error_count,
                    last_error = excluded.last_error,
                    phase = excluded.phase,
                    last_synced_at = excluded.last_synced_at,
                    updated_at = excluded.updated_at",
                params![
                    state.source.as_str(),
                    state.resume_cursor.as_deref(),
                    newest.as_deref(),
                    state.consecutive_error_count,
                    state.last_error.as_deref(),
                    state.phase.as_str(),
                    last_synced_at.as_deref(),
                    format_ts(Utc::now()),
                ],
            )
        })
        .with_context(|| format!("failed to save sync state for source={}", state.source))?;
        Ok(())
    }
}
