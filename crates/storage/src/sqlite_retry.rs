use super::{
    note_sqlite_busy_error, note_sqlite_write_retry, SqliteStore, SQLITE_WRITE_MAX_RETRIES,
    SQLITE_WRITE_RETRY_BACKOFF_MS,
};
use anyhow::{anyhow, Result};
use rusqlite::{Connection, ErrorCode};
use std::time::Duration as StdDuration;

impl SqliteStore {
    pub(crate) fn execute_with_retry<F>(&self, mut operation: F) -> rusqlite::Result<usize>
    where
        F: FnMut(&Connection) -> rusqlite::Result<usize>,
    {
        let mut attempt = 0usize;
        loop {
            match operation(&self.conn) {
                Ok(changed) => return Ok(changed),
                Err(error) => {
                    let retryable = is_retryable_sqlite_error(&error);
                    if retryable {
                        note_sqlite_busy_error();
                    }
                    if attempt < SQLITE_WRITE_MAX_RETRIES && retryable {
                        backoff_before_retry(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Runs `operation` inside `BEGIN IMMEDIATE`, retrying the whole unit on
    /// busy/locked contention. The closure may run more than once.
    pub(crate) fn with_immediate_transaction<T, F>(
        &self,
        label: &'static str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        for attempt in 0..=SQLITE_WRITE_MAX_RETRIES {
            if let Err(error) = self.conn.execute_batch("BEGIN IMMEDIATE TRANSACTION") {
                let error = anyhow!(error).context(format!("failed to open {label} transaction"));
                if should_retry_contended(&error, attempt) {
                    continue;
                }
                return Err(error);
            }

            match operation(&self.conn) {
                Ok(value) => {
                    if let Err(error) = self.conn.execute_batch("COMMIT") {
                        let error =
                            anyhow!(error).context(format!("failed to commit {label} transaction"));
                        let _ = self.conn.execute_batch("ROLLBACK");
                        if should_retry_contended(&error, attempt) {
                            continue;
                        }
                        return Err(error);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    if should_retry_contended(&error, attempt) {
                        continue;
                    }
                    return Err(error);
                }
            }
        }
        Err(anyhow!("{label} transaction exhausted contention retries"))
    }
}

fn should_retry_contended(error: &anyhow::Error, attempt: usize) -> bool {
    let retryable = is_retryable_sqlite_anyhow_error(error);
    if retryable {
        note_sqlite_busy_error();
    }
    if attempt < SQLITE_WRITE_MAX_RETRIES && retryable {
        backoff_before_retry(attempt);
        return true;
    }
    false
}

fn backoff_before_retry(attempt: usize) {
    note_sqlite_write_retry();
    std::thread::sleep(StdDuration::from_millis(
        SQLITE_WRITE_RETRY_BACKOFF_MS[attempt],
    ));
}

fn is_retryable_sqlite_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("database is locked")
        || lowered.contains("database is busy")
        || lowered.contains("database table is locked")
}

pub(crate) fn is_retryable_sqlite_error(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(code, message) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) || message
                .as_deref()
                .map(is_retryable_sqlite_message)
                .unwrap_or(false)
        }
        _ => is_retryable_sqlite_message(&error.to_string()),
    }
}

pub fn is_retryable_sqlite_anyhow_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        if let Some(sqlite_error) = cause.downcast_ref::<rusqlite::Error>() {
            return is_retryable_sqlite_error(sqlite_error);
        }
        is_retryable_sqlite_message(&cause.to_string())
    })
}
