use anyhow::Result;
use serde_json::Value;
use std::future::Future;

/// One provider page: raw events plus the cursor that fetched it and the one after.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub events: Vec<Value>,
    pub cursor: Option<String>,
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub trait PageFetcher: Send {
    fn fetch_page(&mut self, cursor: Option<&str>) -> impl Future<Output = Result<Page>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoNextCursor,
    EmptyPages,
    ReachedKnownData,
    CaughtUp,
    PageBudget,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoNextCursor => "no_next_cursor",
            Self::EmptyPages => "empty_pages",
            Self::ReachedKnownData => "reached_known_data",
            Self::CaughtUp => "caught_up",
            Self::PageBudget => "page_budget",
        }
    }
}

pub type KnownDataPredicate = Box<dyn Fn(&Page) -> bool + Send + Sync>;

/// Lazily walks a cursor-paged feed. A failed fetch leaves the cursor where it
/// was, so the next call retries the same page.
pub struct PaginationWalker<F> {
    fetcher: F,
    cursor: Option<String>,
    empty_page_limit: u32,
    consecutive_empty_pages: u32,
    known_data: Option<KnownDataPredicate>,
    stopped: Option<StopReason>,
    pages_delivered: u32,
}

impl<F: PageFetcher> PaginationWalker<F> {
    pub fn new(fetcher: F, start_cursor: Option<String>, empty_page_limit: u32) -> Self {
        Self {
            fetcher,
            cursor: start_cursor,
            empty_page_limit: empty_page_limit.max(1),
            consecutive_empty_pages: 0,
            known_data: None,
            stopped: None,
            pages_delivered: 0,
        }
    }

    pub fn with_known_data_predicate(mut self, predicate: KnownDataPredicate) -> Self {
        self.known_data = Some(predicate);
        self
    }

    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.stopped.is_some() {
            return Ok(None);
        }
        let page = self.fetcher.fetch_page(self.cursor.as_deref()).await?;
        self.pages_delivered = self.pages_delivered.saturating_add(1);

        if page.is_empty() {
            self.consecutive_empty_pages = self.consecutive_empty_pages.saturating_add(1);
        } else {
            self.consecutive_empty_pages = 0;
        }

        match page.next_cursor.as_ref() {
            Some(next) if Some(next) != self.cursor.as_ref() => {
                self.cursor = Some(next.clone());
            }
            // A provider repeating the cursor would loop forever.
            _ => self.stopped = Some(StopReason::NoNextCursor),
        }
        if self.stopped.is_none() && self.consecutive_empty_pages >= self.empty_page_limit {
            self.stopped = Some(StopReason::EmptyPages);
        }
        if self.stopped.is_none()
            && self
                .known_data
                .as_ref()
                .is_some_and(|reached| reached(&page))
        {
            self.stopped = Some(StopReason::ReachedKnownData);
        }
        Ok(Some(page))
    }

    pub fn halt(&mut self, reason: StopReason) {
        if self.stopped.is_none() {
            self.stopped = Some(reason);
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// The cursor the next fetch would use.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_delivered(&self) -> u32 {
        self.pages_delivered
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn into_fetcher(self) -> F {
        self.fetcher
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::{Page, PageFetcher};
    use anyhow::{anyhow, Result};
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Default)]
    pub struct ScriptedFetcher {
        pages: HashMap<Option<String>, (Vec<Value>, Option<String>)>,
        failures: VecDeque<String>,
        pub requested: Vec<Option<String>>,
    }

    impl ScriptedFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn page(mut self, cursor: Option<&str>, events: Vec<Value>, next: Option<&str>) -> Self {
            self.pages.insert(
                cursor.map(str::to_string),
                (events, next.map(str::to_string)),
            );
            self
        }

        /// Queues a failure returned before any page is served.
        pub fn fail_next(mut self, message: &str) -> Self {
            self.failures.push_back(message.to_string());
            self
        }
    }

    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&mut self, cursor: Option<&str>) -> Result<Page> {
            self.requested.push(cursor.map(str::to_string));
            if let Some(message) = self.failures.pop_front() {
                return Err(anyhow!(message));
            }
            let key = cursor.map(str::to_string);
            let (events, next_cursor) = self
                .pages
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow!("no scripted page for cursor {key:?}"))?;
            Ok(Page {
                events,
                cursor: key,
                next_cursor,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedFetcher;
    use super::*;
    use serde_json::json;

    async fn drain<F: PageFetcher>(walker: &mut PaginationWalker<F>) -> Vec<Page> {
        let mut pages = Vec::new();
        while let Some(page) = walker.next_page().await.expect("page fetch") {
            pages.push(page);
        }
        pages
    }

    #[tokio::test]
    async fn walks_pages_in_order_and_stops_after_last_cursor() {
        let fetcher = ScriptedFetcher::new()
            .page(None, vec![json!({"n": 1})], Some("b"))
            .page(Some("b"), vec![json!({"n": 2})], Some("c"))
            .page(Some("c"), vec![json!({"n": 3})], None);
        let mut walker = PaginationWalker::new(fetcher, None, 3);

        let pages = drain(&mut walker).await;
        let numbers: Vec<i64> = pages
            .iter()
            .flat_map(|page| page.events.iter())
            .filter_map(|event| event["n"].as_i64())
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(walker.stop_reason(), Some(StopReason::NoNextCursor));
        assert_eq!(
            walker.fetcher().requested,
            vec![None, Some("b".to_string()), Some("c".to_string())]
        );
    }

    #[tokio::test]
    async fn consecutive_empty_pages_stop_the_walk() {
        let fetcher = ScriptedFetcher::new()
            .page(None, vec![], Some("b"))
            .page(Some("b"), vec![], Some("c"))
            .page(Some("c"), vec![json!({})], None);
        let mut walker = PaginationWalker::new(fetcher, None, 2);

        let pages = drain(&mut walker).await;
        assert_eq!(pages.len(), 2);
        assert_eq!(walker.stop_reason(), Some(StopReason::EmptyPages));
    }

    #[tokio::test]
    async fn known_data_page_is_delivered_before_stopping() {
        let fetcher = ScriptedFetcher::new()
            .page(None, vec![json!({"ts": 30})], Some("b"))
            .page(Some("b"), vec![json!({"ts": 20}), json!({"ts": 10})], Some("c"))
            .page(Some("c"), vec![json!({"ts": 5})], None);
        let mut walker = PaginationWalker::new(fetcher, None, 3).with_known_data_predicate(
            Box::new(|page: &Page| {
                page.events
                    .iter()
                    .any(|event| event["ts"].as_i64().is_some_and(|ts| ts <= 20))
            }),
        );

        let pages = drain(&mut walker).await;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].events.len(), 2);
        assert_eq!(walker.stop_reason(), Some(StopReason::ReachedKnownData));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cursor_for_retry() {
        let fetcher = ScriptedFetcher::new()
            .fail_next("connection reset")
            .page(Some("resume"), vec![json!({})], None);
        let mut walker = PaginationWalker::new(fetcher, Some("resume".to_string()), 3);

        assert!(walker.next_page().await.is_err());
        assert_eq!(walker.cursor(), Some("resume"));
        let page = walker.next_page().await.expect("retry").expect("page");
        assert_eq!(page.cursor.as_deref(), Some("resume"));
        assert!(walker.next_page().await.expect("stopped").is_none());
    }

    #[tokio::test]
    async fn halted_walker_yields_nothing() {
        let fetcher = ScriptedFetcher::new().page(None, vec![json!({})], Some("b"));
        let mut walker = PaginationWalker::new(fetcher, None, 3);
        walker.next_page().await.expect("first page");
        walker.halt(StopReason::PageBudget);
        assert!(walker.next_page().await.expect("halted").is_none());
        assert_eq!(walker.stop_reason(), Some(StopReason::PageBudget));
    }
}
