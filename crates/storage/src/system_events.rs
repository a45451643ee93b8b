use super::{format_ts, parse_ts, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl SqliteStore {
    pub fn record_heartbeat(&self, component: &str, status: &str) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO system_heartbeat(component, ts, status) VALUES (?1, ?2, ?3)",
                params![component, format_ts(Utc::now()), status],
            )
        })
        .context("failed to record heartbeat")?;
        Ok(())
    }

    pub fn latest_heartbeat(&self, component: &str) -> Result<Option<(DateTime<Utc>, String)>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT ts, status FROM system_heartbeat
                 WHERE component = ?1
                 ORDER BY rowid DESC
                 LIMIT 1",
                params![component],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read latest heartbeat")?;
        row.map(|(ts, status)| Ok((parse_ts(&ts)?, status)))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::migrated_store;
    use anyhow::Result;

    #[test]
    fn latest_heartbeat_returns_most_recent_status() -> Result<()> {
        let (_temp, store) = migrated_store("heartbeat.db")?;
        assert!(store.latest_heartbeat("swapledger")?.is_none());
        store.record_heartbeat("swapledger", "startup")?;
        store.record_heartbeat("swapledger", "alive")?;
        let (_, status) = store
            .latest_heartbeat("swapledger")?
            .expect("heartbeat row");
        assert_eq!(status, "alive");
        Ok(())
    }
}
