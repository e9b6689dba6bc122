//! Raw listing records -> strictly typed, deduplicated post rows.

use std::borrow::Borrow;
use std::collections::HashSet;

use chrono::Utc;
use rph_core::{NormalizedRow, RawRecord, SITE_BASE_URL};
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::debug;

pub const CRATE_NAME: &str = "rph-transform";

/// Normalizes a batch stamped with the current time.
pub fn normalize_posts<I>(records: I) -> Vec<NormalizedRow>
where
    I: IntoIterator,
    I::Item: Borrow<RawRecord>,
{
    normalize_posts_at(records, Utc::now().timestamp())
}

/// Normalizes a batch, dropping rows without an id and keeping the first row per id.
///
/// Input order is preserved. Malformed fields become `None`; they never
/// discard the row they belong to.
pub fn normalize_posts_at<I>(records: I, retrieved_at: i64) -> Vec<NormalizedRow>
where
    I: IntoIterator,
    I::Item: Borrow<RawRecord>,
{
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut missing_id = 0usize;
    let mut duplicates = 0usize;

    for record in records {
        let Some(row) = normalize_post(record.borrow(), retrieved_at) else {
            missing_id += 1;
            continue;
        };
        if !seen.insert(row.id.clone()) {
            duplicates += 1;
            continue;
        }
        rows.push(row);
    }

    debug!(rows = rows.len(), missing_id, duplicates, "normalized batch");
    rows
}

/// Maps one raw record to a row, or `None` when it carries no usable id.
pub fn normalize_post(raw: &RawRecord, retrieved_at: i64) -> Option<NormalizedRow> {
    let rec = match raw.get("data") {
        Some(JsonValue::Object(inner)) => inner,
        _ => raw,
    };
    let field = |name: &str| rec.get(name);

    let id = field("id").and_then(identifier)?;
    let mut row = NormalizedRow::bare(id, retrieved_at);
    row.subreddit = field("subreddit").and_then(identifier);
    row.author = field("author").and_then(identifier);
    row.title = field("title").and_then(text);
    row.selftext = field("selftext").and_then(text);
    row.created_utc = field("created_utc").and_then(coerce_i64);
    row.num_comments = field("num_comments").and_then(coerce_i32);
    row.score = field("score").and_then(coerce_i32);
    row.upvote_ratio = field("upvote_ratio").and_then(coerce_ratio);
    row.url = field("url").and_then(text);
    row.permalink = field("permalink").and_then(text).map(qualify_permalink);
    row.over_18 = field("over_18").and_then(coerce_bool);
    row.is_self = field("is_self").and_then(coerce_bool);
    row.domain = field("domain").and_then(identifier);
    row.link_flair_text = field("link_flair_text").and_then(text);
    row.subreddit_subscribers = field("subreddit_subscribers").and_then(coerce_i64);
    Some(row)
}

/// Unescapes HTML entities, turns CR/LF into spaces and collapses whitespace.
pub fn clean_text(raw: &str) -> Option<String> {
    let unescaped = if raw.contains('&') {
        unescape_entities(raw)
    } else {
        raw.to_string()
    };
    let collapsed = unescaped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

// Escaping `<` keeps markup-looking text literal, so only entities are decoded.
fn unescape_entities(raw: &str) -> String {
    let fragment = Html::parse_fragment(&raw.replace('<', "&lt;"));
    fragment.root_element().text().collect()
}

pub fn qualify_permalink(permalink: String) -> String {
    if permalink.starts_with("http") {
        permalink
    } else if permalink.starts_with('/') {
        format!("{SITE_BASE_URL}{permalink}")
    } else {
        format!("{SITE_BASE_URL}/{permalink}")
    }
}

fn text(value: &JsonValue) -> Option<String> {
    value.as_str().and_then(clean_text)
}

fn identifier(value: &JsonValue) -> Option<String> {
    let trimmed = value.as_str()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Integer coercion: integers, finite floats (truncated), integer strings, booleans.
pub fn coerce_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().and_then(float_to_i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn float_to_i64(f: f64) -> Option<i64> {
    let truncated = f.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        Some(truncated as i64)
    } else {
        None
    }
}

pub fn coerce_i32(value: &JsonValue) -> Option<i32> {
    coerce_i64(value).and_then(|v| i32::try_from(v).ok())
}

pub fn coerce_f64(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn coerce_ratio(value: &JsonValue) -> Option<f32> {
    coerce_f64(value)
        .filter(|f| (0.0..=1.0).contains(f))
        .map(|f| f as f32)
}

/// Accepts `true`/`false` and the numbers 0 and 1; anything else is unknown.
pub fn coerce_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => Some(false),
            Some(f) if f == 1.0 => Some(true),
            _ => None,
        },
        _ => None,
    }
}
