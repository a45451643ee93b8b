use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use swapledger_config::SyncConfig;
use swapledger_core_types::{Swap, SwapSource, SyncPhase, SyncState};
use swapledger_ingestion::{
    classify_parse_reject_reason, event_timestamp, event_tx_id, IngestionService,
    IngestionTelemetry, Page, PageFetcher, PaginationWalker, ParserRegistry, StopReason,
};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::PersistenceGateway;
use crate::telemetry::format_error_chain;

const PAGE_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMode {
    /// Newest-first from the head, stopping once already-ingested events show up.
    Incremental,
    /// Resumes the stored backfill cursor and walks toward the oldest page.
    FullHistory,
}

impl SyncMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::FullHistory => "full_history",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncSettings {
    pub(crate) mode: SyncMode,
    pub(crate) page_budget: u32,
    pub(crate) zero_insert_page_limit: u32,
    pub(crate) empty_page_limit: u32,
    pub(crate) page_retry_budget: u32,
}

impl SyncSettings {
    pub(crate) fn from_config(config: &SyncConfig, mode: SyncMode) -> Self {
        let page_budget = match mode {
            SyncMode::Incremental => config.max_pages_per_cycle,
            SyncMode::FullHistory => config.full_history_max_pages,
        };
        Self {
            mode,
            page_budget: page_budget.max(1),
            zero_insert_page_limit: config.zero_insert_page_limit.max(1),
            empty_page_limit: config.empty_page_limit.max(1),
            page_retry_budget: config.page_retry_budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceRunReport {
    pub(crate) source: SwapSource,
    pub(crate) pages: u32,
    pub(crate) parsed: usize,
    pub(crate) inserted: usize,
    pub(crate) skipped: usize,
    pub(crate) rejected: usize,
    pub(crate) stop_reason: Option<StopReason>,
    pub(crate) error: Option<String>,
}

impl SourceRunReport {
    fn new(source: SwapSource) -> Self {
        Self {
            source,
            pages: 0,
            parsed: 0,
            inserted: 0,
            skipped: 0,
            rejected: 0,
            stop_reason: None,
            error: None,
        }
    }

    pub(crate) fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CycleReport {
    pub(crate) cycle_id: Uuid,
    pub(crate) mode: SyncMode,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) sources: Vec<SourceRunReport>,
}

impl CycleReport {
    pub(crate) fn inserted_total(&self) -> usize {
        self.sources.iter().map(|report| report.inserted).sum()
    }

    pub(crate) fn failed_sources(&self) -> Vec<SwapSource> {
        self.sources
            .iter()
            .filter(|report| report.failed())
            .map(|report| report.source)
            .collect()
    }
}

#[derive(Default)]
struct PageOutcome {
    swaps: Vec<Swap>,
    skipped: usize,
    rejected: usize,
}

/// Everything one source needs for one sync run, owned by value so the run
/// can move into its own task.
pub(crate) struct SourceRuntime<F> {
    source: SwapSource,
    fetcher: F,
    parsers: Arc<ParserRegistry>,
    telemetry: Option<Arc<IngestionTelemetry>>,
    gateway: PersistenceGateway,
    settings: SyncSettings,
}

impl<F: PageFetcher> SourceRuntime<F> {
    pub(crate) fn new(
        source: SwapSource,
        fetcher: F,
        parsers: Arc<ParserRegistry>,
        gateway: PersistenceGateway,
        settings: SyncSettings,
    ) -> Self {
        let telemetry = parsers.telemetry(source);
        Self {
            source,
            fetcher,
            parsers,
            telemetry,
            gateway,
            settings,
        }
    }

    /// Walks pages until a stop condition, persisting each page and its
    /// `SyncState` before the next fetch.
    pub(crate) async fn run(self) -> SourceRunReport {
        let Self {
            source,
            fetcher,
            parsers,
            telemetry,
            mut gateway,
            settings,
        } = self;
        let mut report = SourceRunReport::new(source);
        let mut state = match gateway.store().load_or_create_sync_state(source) {
            Ok(state) => state,
            Err(error) => {
                let chain = format_error_chain(&error);
                warn!(source = %source, error = %chain, "failed to load sync state");
                report.error = Some(chain);
                return report;
            }
        };

        let start_cursor = match settings.mode {
            SyncMode::Incremental => None,
            SyncMode::FullHistory => state.resume_cursor.clone(),
        };
        let mut walker = PaginationWalker::new(
            fetcher,
            start_cursor.clone(),
            settings.empty_page_limit,
        );
        if settings.mode == SyncMode::Incremental {
            if let Some(newest) = state.newest_ingested_timestamp {
                walker = walker.with_known_data_predicate(Box::new(move |page: &Page| {
                    page.events
                        .iter()
                        .filter_map(|event| event_timestamp(source, event))
                        .any(|ts| ts <= newest)
                }));
            }
        }
        info!(
            source = %source,
            mode = settings.mode.as_str(),
            start_cursor = start_cursor.as_deref().unwrap_or(""),
            newest_ingested = ?state.newest_ingested_timestamp,
            "source sync started"
        );

        let mut consecutive_zero_insert_pages = 0u32;
        state.phase = SyncPhase::Fetching;
        loop {
            let page = match fetch_with_retry(
                &mut walker,
                &mut gateway,
                &mut state,
                settings.page_retry_budget,
            )
            .await
            {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(error) => {
                    let chain = format_error_chain(&error);
                    warn!(
                        source = %source,
                        cursor = walker.cursor().unwrap_or(""),
                        error = %chain,
                        "page retry budget exhausted, stopping source for this cycle"
                    );
                    state.note_failure(chain.clone());
                    save_state(&gateway, &state);
                    report.error = Some(chain);
                    break;
                }
            };
            report.pages = report.pages.saturating_add(1);

            state.phase = SyncPhase::Parsing;
            let outcome = parse_page(source, &parsers, &gateway, &page);
            report.parsed += outcome.swaps.len();
            report.skipped += outcome.skipped;
            report.rejected += outcome.rejected;

            state.phase = SyncPhase::Persisting;
            let inserted = match gateway.upsert_batch(&outcome.swaps) {
                Ok(inserted) => inserted,
                Err(error) => {
                    let chain = format_error_chain(&error);
                    warn!(source = %source, error = %chain, "page persist failed");
                    state.note_failure(chain.clone());
                    save_state(&gateway, &state);
                    report.error = Some(chain);
                    break;
                }
            };
            report.inserted += inserted;

            for swap in &outcome.swaps {
                state.advance_newest(swap.timestamp);
            }
            let resume_cursor = match settings.mode {
                SyncMode::Incremental => state.resume_cursor.clone(),
                SyncMode::FullHistory => page.next_cursor.clone(),
            };
            state.note_page_success(resume_cursor, Utc::now());

            if inserted == 0 {
                consecutive_zero_insert_pages = consecutive_zero_insert_pages.saturating_add(1);
            } else {
                consecutive_zero_insert_pages = 0;
            }
            if consecutive_zero_insert_pages >= settings.zero_insert_page_limit {
                walker.halt(StopReason::CaughtUp);
            }
            if walker.pages_delivered() >= settings.page_budget {
                walker.halt(StopReason::PageBudget);
            }
            state.phase = SyncPhase::Fetching;
            save_state(&gateway, &state);

            debug!(
                source = %source,
                cursor = page.cursor.as_deref().unwrap_or(""),
                next_cursor = page.next_cursor.as_deref().unwrap_or(""),
                events = page.events.len(),
                parsed = outcome.swaps.len(),
                inserted,
                "page synced"
            );
        }

        report.stop_reason = walker.stop_reason();
        if !report.failed() {
            state.phase = SyncPhase::Draining;
            save_state(&gateway, &state);
            state.phase = SyncPhase::Idle;
            save_state(&gateway, &state);
        }
        if let Some(telemetry) = &telemetry {
            telemetry.report();
        }
        info!(
            source = %source,
            mode = settings.mode.as_str(),
            pages = report.pages,
            parsed = report.parsed,
            inserted = report.inserted,
            skipped = report.skipped,
            rejected = report.rejected,
            stop_reason = report.stop_reason.map(StopReason::as_str).unwrap_or("failed"),
            failed = report.failed(),
            "source sync finished"
        );
        report
    }
}

fn parse_page(
    source: SwapSource,
    parsers: &ParserRegistry,
    gateway: &PersistenceGateway,
    page: &Page,
) -> PageOutcome {
    let mut outcome = PageOutcome::default();
    for event in &page.events {
        match parsers.parse(source, event) {
            Ok(Some(swap)) => outcome.swaps.push(swap),
            Ok(None) => outcome.skipped += 1,
            Err(error) => {
                outcome.rejected += 1;
                record_rejected(source, gateway, event, &error);
            }
        }
    }
    outcome
}

fn record_rejected(
    source: SwapSource,
    gateway: &PersistenceGateway,
    event: &Value,
    error: &anyhow::Error,
) {
    // Keyless events are keyed by a digest of their payload.
    let tx_id = event_tx_id(source, event).unwrap_or_else(|| {
        format!(
            "unkeyed:{}",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, event.to_string().as_bytes())
        )
    });
    if let Err(store_error) = gateway.store().record_ingestion_error(
        source,
        &tx_id,
        classify_parse_reject_reason(error),
        &format_error_chain(error),
        event,
    ) {
        warn!(
            source = %source,
            tx_id = %tx_id,
            error = %format_error_chain(&store_error),
            "failed to record ingestion error"
        );
    }
}

/// Every failed attempt is recorded on `state` and saved before the retry
/// sleep; the phase stays `Fetching` until the budget is spent.
async fn fetch_with_retry<F: PageFetcher>(
    walker: &mut PaginationWalker<F>,
    gateway: &mut PersistenceGateway,
    state: &mut SyncState,
    retry_budget: u32,
) -> Result<Option<Page>> {
    let mut attempt = 0u32;
    loop {
        match walker.next_page().await {
            Ok(page) => return Ok(page),
            Err(error) if attempt < retry_budget => {
                attempt += 1;
                let chain = format_error_chain(&error);
                warn!(
                    source = %state.source,
                    attempt,
                    retry_budget,
                    cursor = walker.cursor().unwrap_or(""),
                    error = %chain,
                    "page fetch failed, retrying"
                );
                state.note_failure(chain);
                state.phase = SyncPhase::Fetching;
                save_state(gateway, state);
                time::sleep(Duration::from_millis(PAGE_RETRY_DELAY_MS)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn save_state(gateway: &PersistenceGateway, state: &SyncState) {
    if let Err(error) = gateway.store().save_sync_state(state) {
        warn!(
            source = %state.source,
            phase = state.phase.as_str(),
            error = %format_error_chain(&error),
            "failed to save sync state"
        );
    }
}

/// Runs one source runtime per entry, at most `max_concurrent` at a time.
/// A source whose runtime cannot be built is reported as failed; the others
/// still run.
pub(crate) async fn run_sources<F, M>(
    sources: &[SwapSource],
    max_concurrent: usize,
    mut make_runtime: M,
) -> Vec<SourceRunReport>
where
    F: PageFetcher + 'static,
    M: FnMut(SwapSource) -> Result<SourceRuntime<F>>,
{
    let max_concurrent = max_concurrent.max(1);
    let mut reports = Vec::with_capacity(sources.len());
    let mut tasks: JoinSet<SourceRunReport> = JoinSet::new();
    let mut pending = sources.iter().copied();

    loop {
        while tasks.len() < max_concurrent {
            let Some(source) = pending.next() else {
                break;
            };
            match make_runtime(source) {
                Ok(runtime) => {
                    tasks.spawn(runtime.run());
                }
                Err(error) => {
                    let chain = format_error_chain(&error);
                    warn!(source = %source, error = %chain, "failed to build source runtime");
                    let mut report = SourceRunReport::new(source);
                    report.error = Some(chain);
                    reports.push(report);
                }
            }
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok(report) => reports.push(report),
            Err(error) => warn!(error = %error, "source sync task aborted"),
        }
    }
    reports
}

/// One scheduler tick: every enabled source, fanned out over the bounded pool.
pub(crate) async fn run_sync_cycle(
    service: Arc<IngestionService>,
    sources: Vec<SwapSource>,
    sync_config: SyncConfig,
    sqlite_path: PathBuf,
    mode: SyncMode,
) -> CycleReport {
    let cycle_id = Uuid::new_v4();
    let started_at = Utc::now();
    let settings = SyncSettings::from_config(&sync_config, mode);
    info!(
        cycle_id = %cycle_id,
        mode = mode.as_str(),
        sources = sources.len(),
        "sync cycle started"
    );

    let reports = run_sources(&sources, sync_config.max_concurrent_sources, |source| {
        let feed = service.feed(source)?;
        let gateway = PersistenceGateway::open(&sqlite_path)?;
        Ok(SourceRuntime::new(
            source,
            feed,
            service.parsers(),
            gateway,
            settings,
        ))
    })
    .await;

    CycleReport {
        cycle_id,
        mode,
        started_at,
        sources: reports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{broken_midgard_event, midgard_event, migrated_db, thorchain_registry};
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use swapledger_storage::SqliteStore;

    #[derive(Default)]
    struct MemoryFetcher {
        pages: HashMap<Option<String>, (Vec<Value>, Option<String>)>,
        failures: HashMap<Option<String>, u32>,
        requested: Arc<Mutex<Vec<Option<String>>>>,
        stored_states: Option<(PathBuf, Arc<Mutex<Vec<SyncState>>>)>,
    }

    impl MemoryFetcher {
        fn page(mut self, cursor: Option<&str>, events: Vec<Value>, next: Option<&str>) -> Self {
            self.pages.insert(
                cursor.map(str::to_string),
                (events, next.map(str::to_string)),
            );
            self
        }

        fn failing(mut self, cursor: Option<&str>, times: u32) -> Self {
            self.failures.insert(cursor.map(str::to_string), times);
            self
        }

        /// Reads the stored thorchain `SyncState` at the start of every fetch.
        fn recording_stored_state(
            mut self,
            db_path: &Path,
        ) -> (Self, Arc<Mutex<Vec<SyncState>>>) {
            let states = Arc::new(Mutex::new(Vec::new()));
            self.stored_states = Some((db_path.to_path_buf(), Arc::clone(&states)));
            (self, states)
        }
    }

    impl PageFetcher for MemoryFetcher {
        async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page> {
            let key = cursor.map(str::to_string);
            self.requested
                .lock()
                .expect("requested lock")
                .push(key.clone());
            if let Some((db_path, states)) = &self.stored_states {
                let state = thorchain_state(db_path)?;
                states.lock().expect("states lock").push(state);
            }
            if let Some(remaining) = self.failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(anyhow!("provider unavailable at {key:?}"));
                }
            }
            let (events, next_cursor) = self
                .pages
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow!("no page for cursor {key:?}"))?;
            Ok(Page {
                events,
                cursor: key,
                next_cursor,
            })
        }
    }

    fn three_pages() -> MemoryFetcher {
        MemoryFetcher::default()
            .page(
                None,
                vec![midgard_event("TX5", 1_700_000_500), midgard_event("TX4", 1_700_000_400)],
                Some("c1"),
            )
            .page(Some("c1"), vec![midgard_event("TX3", 1_700_000_300)], Some("c2"))
            .page(
                Some("c2"),
                vec![midgard_event("TX2", 1_700_000_200), midgard_event("TX1", 1_700_000_100)],
                None,
            )
    }

    fn settings(mode: SyncMode) -> SyncSettings {
        SyncSettings {
            mode,
            page_budget: 10,
            zero_insert_page_limit: 3,
            empty_page_limit: 3,
            page_retry_budget: 1,
        }
    }

    async fn run_once(
        db_path: &Path,
        fetcher: MemoryFetcher,
        settings: SyncSettings,
    ) -> Result<SourceRunReport> {
        let runtime = SourceRuntime::new(
            SwapSource::Thorchain,
            fetcher,
            Arc::new(thorchain_registry()),
            PersistenceGateway::open(db_path)?,
            settings,
        );
        Ok(runtime.run().await)
    }

    fn thorchain_state(db_path: &Path) -> Result<SyncState> {
        SqliteStore::open(db_path)?.load_or_create_sync_state(SwapSource::Thorchain)
    }

    #[tokio::test]
    async fn incremental_run_persists_every_page_in_order() -> Result<()> {
        let (_temp, db_path) = migrated_db("incremental.db")?;
        let fetcher = three_pages();
        let requested = Arc::clone(&fetcher.requested);

        let report = run_once(&db_path, fetcher, settings(SyncMode::Incremental)).await?;
        assert_eq!(report.pages, 3);
        assert_eq!(report.inserted, 5);
        assert_eq!(report.stop_reason, Some(StopReason::NoNextCursor));
        assert!(!report.failed());
        assert_eq!(
            *requested.lock().expect("requested lock"),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );

        let state = thorchain_state(&db_path)?;
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.consecutive_error_count, 0);
        assert_eq!(
            state.newest_ingested_timestamp.map(|ts| ts.timestamp()),
            Some(1_700_000_500)
        );
        assert!(state.resume_cursor.is_none());
        assert_eq!(
            SqliteStore::open(&db_path)?.swap_count(Some(SwapSource::Thorchain))?,
            5
        );
        Ok(())
    }

    #[tokio::test]
    async fn incremental_rerun_stops_at_known_data() -> Result<()> {
        let (_temp, db_path) = migrated_db("known.db")?;
        run_once(&db_path, three_pages(), settings(SyncMode::Incremental)).await?;

        let fetcher = three_pages().page(
            None,
            vec![midgard_event("TX6", 1_700_000_600), midgard_event("TX5", 1_700_000_500)],
            Some("c1"),
        );
        let report = run_once(&db_path, fetcher, settings(SyncMode::Incremental)).await?;
        assert_eq!(report.pages, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.stop_reason, Some(StopReason::ReachedKnownData));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_page_failure_is_retried_within_budget() -> Result<()> {
        let (_temp, db_path) = migrated_db("retry.db")?;
        let (fetcher, stored_states) = three_pages()
            .failing(Some("c1"), 1)
            .recording_stored_state(&db_path);
        let started = time::Instant::now();
        let report = run_once(&db_path, fetcher, settings(SyncMode::Incremental)).await?;
        assert!(!report.failed());
        assert_eq!(report.inserted, 5);
        assert!(started.elapsed() >= Duration::from_millis(PAGE_RETRY_DELAY_MS));

        // Fetches: head, c1 (fails), c1 retry, c2.
        let stored_states = stored_states.lock().expect("states lock");
        assert_eq!(stored_states.len(), 4);
        let during_retry = &stored_states[2];
        assert_eq!(during_retry.consecutive_error_count, 1);
        assert_eq!(during_retry.phase, SyncPhase::Fetching);
        assert!(during_retry
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("provider unavailable")));
        assert_eq!(stored_states[3].consecutive_error_count, 0);
        assert!(stored_states[3].last_error.is_none());

        let state = thorchain_state(&db_path)?;
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.consecutive_error_count, 0);
        assert!(state.last_error.is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_budget_fails_the_source_after_earlier_pages_commit() -> Result<()> {
        let (_temp, db_path) = migrated_db("failed.db")?;
        let fetcher = three_pages().failing(Some("c1"), 2);
        let report = run_once(&db_path, fetcher, settings(SyncMode::FullHistory)).await?;
        assert!(report.failed());
        assert_eq!(report.inserted, 2);

        let state = thorchain_state(&db_path)?;
        assert_eq!(state.phase, SyncPhase::Failed);
        // The retried attempt and the final one.
        assert_eq!(state.consecutive_error_count, 2);
        assert!(state
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("provider unavailable")));
        assert_eq!(state.resume_cursor.as_deref(), Some("c1"));

        let report = run_once(&db_path, three_pages(), settings(SyncMode::FullHistory)).await?;
        assert!(!report.failed());
        assert_eq!(report.pages, 2);
        assert_eq!(report.inserted, 3);
        let state = thorchain_state(&db_path)?;
        assert_eq!(state.consecutive_error_count, 0);
        assert!(state.last_error.is_none());
        assert!(state.resume_cursor.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn page_budget_leaves_a_resume_cursor() -> Result<()> {
        let (_temp, db_path) = migrated_db("budget.db")?;
        let mut budgeted = settings(SyncMode::FullHistory);
        budgeted.page_budget = 2;
        let report = run_once(&db_path, three_pages(), budgeted).await?;
        assert_eq!(report.pages, 2);
        assert_eq!(report.stop_reason, Some(StopReason::PageBudget));
        assert_eq!(thorchain_state(&db_path)?.resume_cursor.as_deref(), Some("c2"));

        let fetcher = three_pages();
        let requested = Arc::clone(&fetcher.requested);
        let report = run_once(&db_path, fetcher, budgeted).await?;
        assert_eq!(report.inserted, 2);
        assert_eq!(
            *requested.lock().expect("requested lock"),
            vec![Some("c2".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn zero_insert_pages_mark_the_source_caught_up() -> Result<()> {
        let (_temp, db_path) = migrated_db("caught_up.db")?;
        run_once(&db_path, three_pages(), settings(SyncMode::FullHistory)).await?;

        let mut strict = settings(SyncMode::FullHistory);
        strict.zero_insert_page_limit = 2;
        let report = run_once(&db_path, three_pages(), strict).await?;
        assert_eq!(report.inserted, 0);
        assert_eq!(report.pages, 2);
        assert_eq!(report.stop_reason, Some(StopReason::CaughtUp));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_events_are_logged_and_the_page_still_commits() -> Result<()> {
        let (_temp, db_path) = migrated_db("rejected.db")?;
        let fetcher = MemoryFetcher::default().page(
            None,
            vec![
                midgard_event("TX1", 1_700_000_100),
                broken_midgard_event("TXBAD"),
                midgard_event("TX2", 1_700_000_200),
            ],
            None,
        );
        let report = run_once(&db_path, fetcher, settings(SyncMode::Incremental)).await?;
        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected, 1);

        let store = SqliteStore::open(&db_path)?;
        let errors = store.list_ingestion_errors(Some(SwapSource::Thorchain), 10, 10)?;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tx_id, "TXBAD");
        assert_eq!(errors[0].error_type, "invalid_timestamp");
        Ok(())
    }

    #[tokio::test]
    async fn one_failing_source_does_not_stop_the_others() -> Result<()> {
        let (_temp, db_path) = migrated_db("fanout.db")?;
        let registry = Arc::new(thorchain_registry());
        let sources = [SwapSource::Thorchain, SwapSource::Mayachain, SwapSource::Lifi];

        let reports = run_sources(&sources, 2, |source| {
            if source == SwapSource::Lifi {
                return Err(anyhow!("lifi feed misconfigured"));
            }
            let fetcher = match source {
                SwapSource::Thorchain => three_pages(),
                _ => MemoryFetcher::default().failing(None, 5),
            };
            Ok(SourceRuntime::new(
                source,
                fetcher,
                Arc::clone(&registry),
                PersistenceGateway::open(&db_path)?,
                SyncSettings {
                    page_retry_budget: 0,
                    ..settings(SyncMode::Incremental)
                },
            ))
        })
        .await;

        assert_eq!(reports.len(), 3);
        let by_source: HashMap<_, _> = reports
            .iter()
            .map(|report| (report.source, report))
            .collect();
        assert!(!by_source[&SwapSource::Thorchain].failed());
        assert_eq!(by_source[&SwapSource::Thorchain].inserted, 5);
        assert!(by_source[&SwapSource::Mayachain].failed());
        assert!(by_source[&SwapSource::Lifi].failed());
        Ok(())
    }
}
