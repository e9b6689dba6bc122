//! Core record model shared by the harvester crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "rph-core";

/// Constant tag attached to every normalized row.
pub const SOURCE_TAG: &str = "reddit";

/// Prefix used to qualify relative permalinks.
pub const SITE_BASE_URL: &str = "https://reddit.com";

/// Dataset name used when a caller does not pick one.
pub const DEFAULT_DATASET: &str = "posts";

/// Loosely-typed item as returned by the provider. Only lives between fetch and normalization.
pub type RawRecord = Map<String, JsonValue>;

/// Declared storage kind of a canonical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Category,
    Int32,
    Int64,
    Float32,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn column(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

/// Canonical column order of a normalized posts dataset.
pub const POST_COLUMNS: [Column; 18] = [
    column("id", ColumnKind::Text),
    column("subreddit", ColumnKind::Category),
    column("author", ColumnKind::Category),
    column("title", ColumnKind::Text),
    column("selftext", ColumnKind::Text),
    column("created_utc", ColumnKind::Int64),
    column("num_comments", ColumnKind::Int32),
    column("score", ColumnKind::Int32),
    column("upvote_ratio", ColumnKind::Float32),
    column("url", ColumnKind::Text),
    column("permalink", ColumnKind::Text),
    column("over_18", ColumnKind::Boolean),
    column("is_self", ColumnKind::Boolean),
    column("domain", ColumnKind::Category),
    column("link_flair_text", ColumnKind::Category),
    column("subreddit_subscribers", ColumnKind::Int64),
    column("retrieved_at", ColumnKind::Int64),
    column("source", ColumnKind::Category),
];

pub fn post_column(name: &str) -> Option<Column> {
    POST_COLUMNS.iter().copied().find(|c| c.name == name)
}

/// Strictly-typed post row. `id` is always non-empty once a row leaves normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub id: String,
    pub subreddit: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub selftext: Option<String>,
    pub created_utc: Option<i64>,
    pub num_comments: Option<i32>,
    pub score: Option<i32>,
    pub upvote_ratio: Option<f32>,
    pub url: Option<String>,
    pub permalink: Option<String>,
    pub over_18: Option<bool>,
    pub is_self: Option<bool>,
    pub domain: Option<String>,
    pub link_flair_text: Option<String>,
    pub subreddit_subscribers: Option<i64>,
    pub retrieved_at: i64,
    pub source: String,
}

impl NormalizedRow {
    /// Row with only the identity columns populated.
    pub fn bare(id: impl Into<String>, retrieved_at: i64) -> Self {
        Self {
            id: id.into(),
            subreddit: None,
            author: None,
            title: None,
            selftext: None,
            created_utc: None,
            num_comments: None,
            score: None,
            upvote_ratio: None,
            url: None,
            permalink: None,
            over_18: None,
            is_self: None,
            domain: None,
            link_flair_text: None,
            subreddit_subscribers: None,
            retrieved_at,
            source: SOURCE_TAG.to_string(),
        }
    }
}
