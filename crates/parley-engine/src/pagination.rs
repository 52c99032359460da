//! Cursor pagination.
//!
//! [`walk`] yields pages lazily; [`collect_all`] drains a walk into one
//! vector, truncated to `max_items`. Cursor state is local to one call.

use std::collections::HashSet;
use std::future::Future;

use async_stream::stream;
use futures::{pin_mut, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// What the fetch function is asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` on the first call.
    pub cursor: Option<String>,
    /// Requested size; servers may return fewer or more.
    pub page_size: Option<u32>,
}

/// One page of results.
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Cursor for the next page.
    pub next_cursor: Option<String>,
    /// Whether another page follows.
    pub has_more: bool,
}

impl<T> Page<T> {
    /// A page that continues iff it carries a cursor.
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        let has_more = next_cursor.is_some();
        Self {
            items,
            next_cursor,
            has_more,
        }
    }

    /// Final page.
    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }
}

/// Limits for a paginated walk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationOptions {
    /// Page size to request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Stop once this many items are collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    /// Stop after this many pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<usize>,
}

impl PaginationOptions {
    /// Set the requested page size.
    #[must_use]
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Cap the number of collected items.
    #[must_use]
    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }

    /// Cap the number of fetched pages.
    #[must_use]
    pub fn max_pages(mut self, max: usize) -> Self {
        self.max_pages = Some(max);
        self
    }
}

/// Lazily fetch pages until the server stops handing out cursors or
/// `max_pages` is reached. An error is yielded once and ends the stream.
pub fn walk<P, T, E, F, Fut, X>(
    mut fetch: F,
    extract: X,
    options: PaginationOptions,
) -> impl Stream<Item = Result<Page<T>, E>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<P, E>>,
    X: Fn(P) -> Page<T>,
{
    stream! {
        let mut cursor: Option<String> = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages = 0_usize;

        loop {
            if options.max_pages.is_some_and(|max| pages >= max) {
                break;
            }
            let request = PageRequest {
                cursor: cursor.clone(),
                page_size: options.page_size,
            };
            let page = match fetch(request).await {
                Ok(raw) => extract(raw),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            pages += 1;

            let next = if page.has_more { page.next_cursor.clone() } else { None };
            let has_more = page.has_more;
            yield Ok(page);

            if !has_more {
                break;
            }
            match next {
                None => {
                    warn!(pages, "page reported has_more without a cursor; stopping");
                    break;
                }
                Some(next) => {
                    if !seen.insert(next.clone()) {
                        warn!(cursor = %next, pages, "server repeated a cursor; stopping");
                        break;
                    }
                    cursor = Some(next);
                }
            }
        }
    }
}

/// Fetch every item, stopping early once `max_items` have been gathered.
pub async fn collect_all<P, T, E, F, Fut, X>(
    fetch: F,
    extract: X,
    options: PaginationOptions,
) -> Result<Vec<T>, E>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<P, E>>,
    X: Fn(P) -> Page<T>,
{
    let max_items = options.max_items;
    let mut items = Vec::new();
    if max_items == Some(0) {
        return Ok(items);
    }

    let pages = walk(fetch, extract, options);
    pin_mut!(pages);
    while let Some(page) = pages.next().await {
        items.extend(page?.items);
        if let Some(max) = max_items {
            if items.len() >= max {
                items.truncate(max);
                break;
            }
        }
    }
    Ok(items)
}

/// Read a page out of a task result shaped like
/// `{ "<items_field>": [...], "pagination": { "cursor": "...", "has_more": true } }`.
pub fn page_from_value(data: &Value, items_field: &str) -> Page<Value> {
    let items = data
        .get(items_field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let meta = data.get("pagination").unwrap_or(data);
    let cursor = ["cursor", "next_cursor", "nextCursor"]
        .iter()
        .find_map(|k| meta.get(*k).and_then(Value::as_str))
        .filter(|c| !c.is_empty())
        .map(str::to_owned);
    let has_more = ["has_more", "hasMore"]
        .iter()
        .find_map(|k| meta.get(*k).and_then(Value::as_bool))
        .unwrap_or(cursor.is_some());

    Page {
        items,
        next_cursor: cursor,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Pages keyed by the cursor that requests them (`""` for the first).
    fn server(pages: Vec<(Vec<i32>, Option<&str>)>) -> HashMap<String, Page<i32>> {
        let mut map = HashMap::new();
        let mut key = String::new();
        for (items, next) in pages {
            let page = Page::new(items, next.map(str::to_owned));
            let following = next.map(str::to_owned).unwrap_or_default();
            let _ = map.insert(std::mem::replace(&mut key, following), page);
        }
        map
    }

    fn fetcher(
        pages: HashMap<String, Page<i32>>,
        log: Arc<Mutex<Vec<PageRequest>>>,
    ) -> impl FnMut(PageRequest) -> futures::future::Ready<Result<Page<i32>, String>> {
        move |req: PageRequest| {
            log.lock().push(req.clone());
            let key = req.cursor.unwrap_or_default();
            futures::future::ready(pages.get(&key).cloned().ok_or_else(|| format!("no page {key}")))
        }
    }

    fn three_pages() -> HashMap<String, Page<i32>> {
        server(vec![
            (vec![1, 2, 3], Some("c2")),
            (vec![4], Some("c3")),
            (vec![5, 6], None),
        ])
    }

    #[tokio::test]
    async fn collects_all_pages_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = collect_all(fetcher(three_pages(), log.clone()), |p| p, PaginationOptions::default())
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
        let cursors: Vec<_> = log.lock().iter().map(|r| r.cursor.clone()).collect();
        assert_eq!(cursors, vec![None, Some("c2".into()), Some("c3".into())]);
    }

    #[tokio::test]
    async fn max_items_truncates_exactly() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = collect_all(
            fetcher(three_pages(), log.clone()),
            |p| p,
            PaginationOptions::default().max_items(4),
        )
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(log.lock().len(), 2);

        let items = collect_all(
            fetcher(three_pages(), log),
            |p| p,
            PaginationOptions::default().max_items(2),
        )
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn max_pages_and_page_size() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = collect_all(
            fetcher(three_pages(), log.clone()),
            |p| p,
            PaginationOptions::default().max_pages(2).page_size(50),
        )
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert!(log.lock().iter().all(|r| r.page_size == Some(50)));
    }

    #[tokio::test]
    async fn repeated_cursor_stops() {
        let pages = server(vec![(vec![1], Some("loop")), (vec![2], Some("loop"))]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = collect_all(fetcher(pages, log.clone()), |p| p, PaginationOptions::default())
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn has_more_without_cursor_stops() {
        let mut pages = HashMap::new();
        let _ = pages.insert(
            String::new(),
            Page {
                items: vec![1],
                next_cursor: None,
                has_more: true,
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let items = collect_all(fetcher(pages, log), |p| p, PaginationOptions::default())
            .await
            .unwrap();
        assert_eq!(items, vec![1]);
    }

    #[tokio::test]
    async fn fetch_error_propagates() {
        let pages = server(vec![(vec![1], Some("missing"))]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = collect_all(fetcher(pages, log), |p| p, PaginationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, "no page missing");
    }

    #[tokio::test]
    async fn walk_is_lazy() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pages = walk(fetcher(three_pages(), log.clone()), |p| p, PaginationOptions::default());
        pin_mut!(pages);
        let first = pages.next().await.unwrap().unwrap();
        assert_eq!(first.items, vec![1, 2, 3]);
        assert_eq!(log.lock().len(), 1);

        let rest: Vec<_> = pages.collect().await;
        assert_eq!(rest.len(), 2);
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn page_from_task_result() {
        let page = page_from_value(
            &json!({"products": [{"id": 1}, {"id": 2}], "pagination": {"cursor": "abc", "has_more": true}}),
            "products",
        );
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        assert!(page.has_more);

        let last = page_from_value(&json!({"products": [], "pagination": {"has_more": false}}), "products");
        assert!(last.items.is_empty());
        assert!(!last.has_more);

        let top_level = page_from_value(&json!({"items": [1], "nextCursor": "n"}), "items");
        assert_eq!(top_level.next_cursor.as_deref(), Some("n"));
        assert!(top_level.has_more);

        let missing = page_from_value(&json!({"other": 1}), "items");
        assert!(missing.items.is_empty() && !missing.has_more);
    }
}
