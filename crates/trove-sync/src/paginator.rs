//! Cursor pagination with cycle detection.

use std::collections::HashSet;
use std::future::Future;

use trove_core::Page;

/// Walk state: the next cursor to fetch, or `None` once the walk is over.
///
/// A cursor is remembered as soon as its page has been fetched, so a
/// provider whose `after` cursor degenerates into a fixed point still
/// terminates.
#[derive(Debug, Clone)]
pub struct CursorWalk {
    seen: HashSet<String>,
    cursor: Option<String>,
    unbounded: bool,
}

impl CursorWalk {
    pub fn new(start: impl Into<String>, unbounded: bool) -> Self {
        Self {
            seen: HashSet::new(),
            cursor: Some(start.into()),
            unbounded,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Records the page just fetched at the current cursor and moves on to `next`.
    pub fn advance(&mut self, next: &str) {
        let Some(current) = self.cursor.take() else {
            return;
        };
        self.seen.insert(current);
        if self.unbounded && !next.is_empty() && !self.seen.contains(next) {
            self.cursor = Some(next.to_string());
        }
    }
}

/// Items fetched before a page failed.
#[derive(Debug)]
pub struct PartialWalk<T, E> {
    pub items: Vec<T>,
    pub error: E,
}

/// Fetches pages from `start` until the cursor runs out or repeats. With
/// `unbounded` false only the first page is fetched.
pub async fn walk<T, E, F, Fut>(start: &str, unbounded: bool, mut fetch_page: F) -> Result<Vec<T>, PartialWalk<T, E>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    let mut state = CursorWalk::new(start, unbounded);
    let mut items = Vec::new();
    while let Some(cursor) = state.cursor().map(str::to_string) {
        match fetch_page(cursor).await {
            Ok(page) => {
                items.extend(page.items);
                state.advance(&page.next_cursor);
            }
            Err(error) => return Err(PartialWalk { items, error }),
        }
    }
    Ok(items)
}
