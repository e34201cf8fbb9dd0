use std::collections::HashMap;
use std::time::Duration;

use capsync_core::{EndpointFamily, PageWindow};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Consecutive failed pages after which an open-ended walk gives up.
pub const MAX_CONSECUTIVE_PAGE_FAILURES: usize = 3;

/// One bulk-lookup request worth of natural keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdBatch {
    pub index: usize,
    pub ids: Vec<i64>,
}

/// Splits `keys` into batches of at most `batch_size`, preserving order. Every
/// key lands in exactly one batch.
pub fn plan_id_batches(keys: &[i64], batch_size: usize) -> Vec<IdBatch> {
    keys.chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, ids)| IdBatch {
            index,
            ids: ids.to_vec(),
        })
        .collect()
}

/// Walks `(start, limit)` windows. Open-ended walks stop at the first short
/// page or after [`MAX_CONSECUTIVE_PAGE_FAILURES`] failed pages in a row;
/// bounded walks cover `1..=total` regardless of what the pages return.
#[derive(Debug, Clone)]
pub struct PageCursor {
    limit: usize,
    total: Option<usize>,
    next_start: usize,
    next_index: usize,
    consecutive_failures: usize,
    finished: bool,
}

impl PageCursor {
    pub fn open_ended(limit: usize) -> Self {
        Self::with_total(limit, None)
    }

    pub fn bounded(limit: usize, total: usize) -> Self {
        Self::with_total(limit, Some(total))
    }

    fn with_total(limit: usize, total: Option<usize>) -> Self {
        Self {
            limit: limit.max(1),
            total,
            next_start: 1,
            next_index: 0,
            consecutive_failures: 0,
            finished: false,
        }
    }

    pub fn next_window(&mut self) -> Option<PageWindow> {
        if self.finished {
            return None;
        }
        if let Some(total) = self.total {
            if self.next_start > total {
                self.finished = true;
                return None;
            }
        }

        let window = PageWindow {
            index: self.next_index,
            start: self.next_start,
            limit: self.limit,
        };
        self.next_index += 1;
        self.next_start = self.next_start.saturating_add(self.limit);
        Some(window)
    }

    pub fn record_page(&mut self, records: usize) {
        self.consecutive_failures = 0;
        if self.total.is_none() && records < self.limit {
            self.finished = true;
        }
    }

    /// A failed page counts as full, so the walk moves on to the next window.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.total.is_none() && self.consecutive_failures >= MAX_CONSECUTIVE_PAGE_FAILURES {
            self.finished = true;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Enforces a minimum spacing between requests to the same endpoint family by
/// handing out send slots. The lock only guards slot bookkeeping; waiting for
/// a slot happens outside it.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<EndpointFamily, Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Resolves once this caller may send a request for `family`.
    pub async fn wait_turn(&self, family: EndpointFamily) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(&family).copied().map_or(now, |next| next.max(now));
            slots.insert(family, slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
