//! Lazy cursor-based walk over a listing endpoint.

use futures_util::stream::{self, BoxStream, StreamExt};
use rph_core::RawRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{ApiClient, ClientError};

/// Records pulled one at a time; dropping the stream stops all further requests.
pub type RecordStream = BoxStream<'static, Result<RawRecord, ClientError>>;

/// Pagination shared by every listing-shaped endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paging {
    pub page_size: u32,
    pub max_items: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            page_size: Self::MAX_PAGE_SIZE,
            max_items: 1000,
        }
    }
}

impl Paging {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page_size: u32, max_items: usize) -> Self {
        Self {
            page_size,
            max_items,
        }
    }

    /// Value sent as `limit`.
    pub fn limit(&self) -> u32 {
        self.page_size.clamp(1, Self::MAX_PAGE_SIZE)
    }
}

/// One decoded page envelope: `{ data: { children: [ { data } ], after } }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub items: Vec<RawRecord>,
    pub cursor: Option<String>,
}

impl ListingPage {
    pub fn from_envelope(body: &JsonValue) -> Self {
        let data = body.get("data");
        let items = data
            .and_then(|d| d.get("children"))
            .and_then(JsonValue::as_array)
            .map(|children| {
                children
                    .iter()
                    .map(|child| match child.get("data") {
                        Some(JsonValue::Object(record)) => record.clone(),
                        _ => RawRecord::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let cursor = data
            .and_then(|d| d.get("after"))
            .and_then(JsonValue::as_str)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string);
        Self { items, cursor }
    }
}

struct WalkState {
    cursor: Option<String>,
    produced: usize,
    pages: usize,
    finished: bool,
}

impl ApiClient {
    /// Walks `path` page by page, yielding each record as it is pulled.
    ///
    /// Nothing is requested until the first poll. The walk ends after
    /// `max_items` records, on a page without a cursor, on an empty page, or
    /// right after yielding the error of a failed page fetch.
    pub fn listing(
        &self,
        path: impl Into<String>,
        paging: Paging,
        extra_params: Vec<(String, String)>,
    ) -> RecordStream {
        let client = self.clone();
        let path = path.into();
        let initial = WalkState {
            cursor: None,
            produced: 0,
            pages: 0,
            finished: paging.max_items == 0,
        };

        stream::unfold(initial, move |mut state| {
            let client = client.clone();
            let path = path.clone();
            let extra_params = extra_params.clone();
            async move {
                if state.finished {
                    return None;
                }
                if state.pages > 0 && !client.page_delay().is_zero() {
                    tokio::time::sleep(client.page_delay()).await;
                }

                let mut query = Vec::with_capacity(extra_params.len() + 2);
                query.push(("limit".to_string(), paging.limit().to_string()));
                query.extend(extra_params);
                if let Some(cursor) = &state.cursor {
                    query.push(("after".to_string(), cursor.clone()));
                }

                match client.get_json(&path, &query).await {
                    Ok(body) => {
                        let page = ListingPage::from_envelope(&body);
                        let page_len = page.items.len();
                        let remaining = paging.max_items.saturating_sub(state.produced);
                        let items: Vec<Result<RawRecord, ClientError>> =
                            page.items.into_iter().take(remaining).map(Ok).collect();

                        state.pages += 1;
                        state.produced += items.len();
                        state.finished = page_len == 0
                            || page.cursor.is_none()
                            || state.produced >= paging.max_items;
                        debug!(
                            path = %path,
                            page = state.pages,
                            items = page_len,
                            produced = state.produced,
                            finished = state.finished,
                            "listing page fetched"
                        );
                        state.cursor = page.cursor;
                        Some((stream::iter(items), state))
                    }
                    Err(err) => {
                        state.finished = true;
                        Some((stream::iter(vec![Err(err)]), state))
                    }
                }
            }
        })
        .flatten()
        .boxed()
    }
}
