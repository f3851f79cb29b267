//! Lazy, restartable iteration over a source's detail records.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AdapterError, DetailRecord, PageCursor, SourceClient};

/// What to do with a listing whose detail call failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailFailurePolicy {
    /// Yield the listing-page fields only.
    #[default]
    Fallback,
    /// Drop the listing.
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    pub pages: u32,
    pub yielded: u64,
    pub detail_failures: u64,
    pub fallbacks: u64,
    pub skipped: u64,
}

impl StreamCounters {
    /// Items that did not make it out as a full detail record.
    pub fn errors(&self) -> u64 {
        self.detail_failures - self.fallbacks + self.skipped
    }
}

pub struct ListingStream<'a> {
    client: &'a dyn SourceClient,
    cursor: PageCursor,
    buffer: VecDeque<crate::ListingSummary>,
    exhausted: bool,
    limit: Option<u64>,
    policy: DetailFailurePolicy,
    counters: StreamCounters,
}

impl<'a> ListingStream<'a> {
    pub fn new(client: &'a dyn SourceClient, start: PageCursor, policy: DetailFailurePolicy) -> Self {
        Self {
            client,
            cursor: start,
            buffer: VecDeque::new(),
            exhausted: false,
            limit: None,
            policy,
            counters: StreamCounters::default(),
        }
    }

    /// Caps the number of records yielded.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Cursor of the next page to fetch. Records already buffered from the
    /// current page are not covered by it.
    pub fn checkpoint(&self) -> PageCursor {
        self.cursor
    }

    pub fn counters(&self) -> StreamCounters {
        self.counters
    }

    pub async fn next(&mut self) -> Result<Option<DetailRecord>, AdapterError> {
        loop {
            if self.limit.is_some_and(|limit| self.counters.yielded >= limit) {
                return Ok(None);
            }

            if let Some(summary) = self.buffer.pop_front() {
                match self.client.fetch_detail(&summary).await {
                    Ok(detail) => {
                        self.counters.yielded += 1;
                        return Ok(Some(detail));
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        self.counters.detail_failures += 1;
                        warn!(
                            source = self.client.source_id(),
                            external_id = %summary.external_id,
                            error = %err,
                            policy = ?self.policy,
                            "detail fetch failed"
                        );
                        match self.policy {
                            DetailFailurePolicy::Fallback => {
                                self.counters.fallbacks += 1;
                                self.counters.yielded += 1;
                                return Ok(Some(DetailRecord::from_summary(summary)));
                            }
                            DetailFailurePolicy::Skip => continue,
                        }
                    }
                }
            }

            if self.exhausted {
                return Ok(None);
            }

            let page = self.client.fetch_page(&self.cursor).await?;
            self.counters.pages += 1;
            self.counters.skipped += u64::from(page.skipped);
            debug!(
                source = self.client.source_id(),
                offset = self.cursor.offset,
                items = page.items.len(),
                has_more = page.has_more,
                "fetched listing page"
            );
            self.exhausted = !page.has_more;
            self.cursor = page.next;
            self.buffer.extend(page.items);
        }
    }
}
