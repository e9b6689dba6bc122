use std::path::PathBuf;

use rph_core::RawRecord;
use rph_transform::normalize_posts_at;
use serde_json::Value;

fn fixture_children(name: &str) -> Vec<RawRecord> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    let text = std::fs::read_to_string(&path).unwrap();
    let body: Value = serde_json::from_str(&text).unwrap();
    body["data"]["children"]
        .as_array()
        .unwrap()
        .iter()
        .map(|child| child.as_object().unwrap().clone())
        .collect()
}

#[test]
fn listing_page_normalizes_to_typed_rows() {
    let rows = normalize_posts_at(fixture_children("subreddit_new_page.json"), 1_713_600_000);

    let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["1c9x3a", "1c9x3b"]);

    let first = &rows[0];
    assert_eq!(first.title.as_deref(), Some("Air Max 1 & 90 restock thread"));
    assert_eq!(first.selftext.as_deref(), Some("Drop your links here. No resellers >:("));
    assert_eq!(first.score, Some(412));
    assert_eq!(first.created_utc, Some(1_713_520_000));
    assert_eq!(first.is_self, Some(true));
    assert_eq!(first.over_18, Some(false));
    assert_eq!(
        first.permalink.as_deref(),
        Some("https://reddit.com/r/Sneakers/comments/1c9x3a/air_max_restock/")
    );
    assert_eq!(first.link_flair_text.as_deref(), Some("Discussion"));
    assert_eq!(first.retrieved_at, 1_713_600_000);

    let second = &rows[1];
    assert_eq!(second.selftext, None);
    assert_eq!(second.num_comments, Some(3));
    assert_eq!(second.upvote_ratio, Some(1.0));
    assert_eq!(second.over_18, Some(false));
    assert_eq!(second.link_flair_text, None);
    assert_eq!(second.domain.as_deref(), Some("i.redd.it"));
    assert!(rows.iter().all(|r| r.source == "reddit"));
}
