//! Paginated fetch as a lazy cursor.
//!
//! Each call to `next()` fetches one page synchronously on the context's
//! lane: records with `start <= number < start + batch_size`, ascending.
//! Paging stops on the first empty page, or (bounded mode) once a page
//! starting at or beyond the limit has been fetched.
//!
//! The bound is the reference workload's notion of "the dataset is known to
//! end here". `UntilEmpty` ignores it and relies on the empty page alone.

use tracing::debug;

use crate::context::Context;
use crate::error::FetchError;
use crate::record::Record;

/// Page start beyond which the reference fetch loop stops asking for more.
pub const REFERENCE_FETCH_LIMIT: i32 = 10_000;

/// When a cursor stops paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTermination {
    /// Stop on an empty page, or after the page starting at `limit`
    Bounded {
        /// Last page start that may be followed by another page
        limit: i32,
    },
    /// Stop on the first empty page only
    UntilEmpty,
}

impl Default for FetchTermination {
    fn default() -> Self {
        FetchTermination::Bounded { limit: REFERENCE_FETCH_LIMIT }
    }
}

/// One fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// First number covered
    pub start: i32,
    /// Numbers covered
    pub batch_size: i32,
    /// Records found, ascending by number
    pub records: Vec<Record>,
}

impl Page {
    /// True when the page found nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in the page.
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Lazy sequence of pages against one context.
///
/// Iteration ends after the terminating page or after the first error.
#[derive(Debug)]
pub struct PageCursor {
    context: Context,
    next_start: Option<i32>,
    batch_size: i32,
    termination: FetchTermination,
    pages: usize,
}

impl PageCursor {
    /// Cursor whose first page starts at `start`.
    pub fn new(context: Context, start: i32, batch_size: i32, termination: FetchTermination) -> Self {
        Self {
            context,
            next_start: Some(start),
            batch_size,
            termination,
            pages: 0,
        }
    }

    /// Pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    fn fetch_page(&self, start: i32) -> Result<Page, FetchError> {
        let batch_size = self.batch_size;
        let records = self
            .context
            .perform_and_wait(move |scope| scope.fetch(start, batch_size))??;
        Ok(Page { start, batch_size, records })
    }

    fn continues_after(&self, page: &Page) -> bool {
        if page.is_empty() {
            return false;
        }
        match self.termination {
            FetchTermination::Bounded { limit } => page.start < limit,
            FetchTermination::UntilEmpty => true,
        }
    }
}

impl Iterator for PageCursor {
    type Item = Result<Page, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_start.take()?;
        let page = match self.fetch_page(start) {
            Ok(page) => page,
            Err(err) => return Some(Err(err)),
        };
        self.pages += 1;
        debug!(context = %self.context.id(), start, found = page.len(), "page");
        if self.continues_after(&page) {
            self.next_start = start.checked_add(self.batch_size);
        }
        Some(Ok(page))
    }
}

/// Fetch `amount` numbers starting at `start`, `batch_size` at a time,
/// stopping early on an empty page.
pub fn fetch_iterative(
    context: &Context,
    start: i32,
    amount: i32,
    batch_size: i32,
) -> Result<Vec<Record>, FetchError> {
    let end = start.saturating_add(amount.max(0));
    let mut records = Vec::new();
    for page in PageCursor::new(context.clone(), start, batch_size, FetchTermination::UntilEmpty) {
        let page = page?;
        let next = page.start.saturating_add(page.batch_size);
        records.extend(page.records.into_iter().filter(|r| r.number < end));
        if next >= end {
            break;
        }
    }
    Ok(records)
}
