use std::sync::Arc;

use arrow_array::{ArrayRef, Int64Array, LargeStringArray, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, TimeZone, Utc};
use rph_core::NormalizedRow;
use rph_storage::{read_rows, DuckDbIndex, IndexError, ParquetStore, StorageError};
use serde_json::json;
use tempfile::tempdir;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

fn row(id: &str, score: i32) -> NormalizedRow {
    let mut row = NormalizedRow::bare(id, 1_713_600_000);
    row.subreddit = Some("Sneakers".to_string());
    row.author = Some("kicks_collector".to_string());
    row.title = Some(format!("post {id}"));
    row.created_utc = Some(1_713_520_000);
    row.num_comments = Some(57);
    row.score = Some(score);
    row.upvote_ratio = Some(0.75);
    row.permalink = Some(format!("https://reddit.com/r/Sneakers/comments/{id}/"));
    row.over_18 = Some(false);
    row.is_self = None;
    row.subreddit_subscribers = Some(3_120_044);
    row
}

#[test]
fn saved_rows_read_back_unchanged() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path());
    let rows = vec![row("a1", 412), row("b2", -3), NormalizedRow::bare("c3", 1_713_600_000)];

    let saved = store
        .save_rows_at("posts", &rows, Some("subreddit_new_Sneakers"), at(1_713_520_000))
        .unwrap();

    assert_eq!(saved.rows, 3);
    assert_eq!(
        saved.path.file_name().and_then(|n| n.to_str()),
        Some("posts_20240419_094640_subreddit_new_Sneakers.parquet")
    );
    let bytes = std::fs::read(&saved.path).unwrap();
    assert_eq!(saved.bytes, bytes.len() as u64);
    assert_eq!(saved.sha256, ParquetStore::sha256_hex(&bytes));

    assert_eq!(read_rows(&saved.path).unwrap(), rows);
}

#[test]
fn duplicate_ids_are_dropped_before_writing() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path());

    let saved = store
        .save_rows_at("posts", &[row("a", 1), row("a", 2), row("b", 3)], None, at(0))
        .unwrap();

    let back = read_rows(&saved.path).unwrap();
    let got: Vec<_> = back.iter().map(|r| (r.id.as_str(), r.score)).collect();
    assert_eq!(got, [("a", Some(1)), ("b", Some(3))]);
}

#[test]
fn record_batches_from_other_producers_are_deduplicated_too() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path().join("curated"));
    let index = DuckDbIndex::new(dir.path().join("reddit.duckdb"), dir.path().join("curated"));

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::LargeUtf8, true),
        Field::new("score", DataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(LargeStringArray::from(vec!["a", "b", "a", "c", "b"])) as ArrayRef,
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])) as ArrayRef,
        ],
    )
    .unwrap();

    let saved = store
        .save_record_batch("imported", &batch, Some("backfill"))
        .unwrap();
    assert_eq!(saved.rows, 3);
    assert!(saved
        .path
        .to_string_lossy()
        .ends_with("_backfill.parquet"));

    index.create_view("imported", None).unwrap();
    let result = index
        .query("SELECT id, score FROM vw_imported ORDER BY id")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            json!({"id": "a", "score": 1}),
            json!({"id": "b", "score": 2}),
            json!({"id": "c", "score": 4}),
        ]
    );
}

#[test]
fn empty_batch_fails_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path());

    let err = store.save_rows("posts", &[], None).unwrap_err();
    assert!(matches!(err, StorageError::EmptyBatch { ref dataset } if dataset == "posts"));
    assert!(!store.dataset_dir("posts").exists());
    assert!(store.list_files("posts").unwrap().is_empty());
}

#[test]
fn existing_files_are_never_overwritten() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path());

    let first = store.save_rows_at("posts", &[row("a", 1)], None, at(60)).unwrap();
    let err = store
        .save_rows_at("posts", &[row("b", 2)], None, at(60))
        .unwrap_err();

    assert!(matches!(err, StorageError::FileExists(ref p) if p == &first.path));
    assert_eq!(read_rows(&first.path).unwrap()[0].id, "a");
}

#[test]
fn listing_is_sorted_and_latest_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path());

    for (i, secs) in [300, 100, 200].into_iter().enumerate() {
        store
            .save_rows_at("posts", &[row(&format!("id{i}"), 1)], None, at(secs))
            .unwrap();
    }
    std::fs::write(store.dataset_dir("posts").join("notes.txt"), "x").unwrap();
    std::fs::write(store.dataset_dir("posts").join(".abc.tmp"), "x").unwrap();

    let names = |paths: Vec<std::path::PathBuf>| -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    };

    assert_eq!(
        names(store.list_files("posts").unwrap()),
        [
            "posts_19700101_000140.parquet",
            "posts_19700101_000320.parquet",
            "posts_19700101_000500.parquet",
        ]
    );
    assert_eq!(
        names(store.latest_files("posts", 2).unwrap()),
        ["posts_19700101_000320.parquet", "posts_19700101_000500.parquet"]
    );
    assert_eq!(store.latest_files("posts", 10).unwrap().len(), 3);
    assert!(store.list_files("comments").unwrap().is_empty());
}

#[test]
fn invalid_dataset_names_are_rejected() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path());
    let err = store.save_rows("../escape", &[row("a", 1)], None).unwrap_err();
    assert!(matches!(err, StorageError::InvalidDataset(_)));
}

#[test]
fn view_unions_every_file_and_sees_new_ones() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("curated");
    let store = ParquetStore::new(&base);
    let index = DuckDbIndex::new(dir.path().join("db/reddit.duckdb"), &base);

    store
        .save_rows_at("posts", &[row("a", 10), row("b", 20)], None, at(100))
        .unwrap();

    assert_eq!(index.create_view("posts", None).unwrap(), "vw_posts");
    assert_eq!(index.create_view("posts", None).unwrap(), "vw_posts");

    let result = index
        .query("SELECT id, score, upvote_ratio, subreddit FROM vw_posts ORDER BY id")
        .unwrap();
    assert_eq!(result.columns, ["id", "score", "upvote_ratio", "subreddit"]);
    assert_eq!(
        result.rows,
        vec![
            json!({"id": "a", "score": 10, "upvote_ratio": 0.75, "subreddit": "Sneakers"}),
            json!({"id": "b", "score": 20, "upvote_ratio": 0.75, "subreddit": "Sneakers"}),
        ]
    );

    store.save_rows_at("posts", &[row("c", 30)], None, at(200)).unwrap();
    let count = index.query("SELECT count(*) AS n FROM vw_posts").unwrap();
    assert_eq!(count.rows, vec![json!({"n": 3})]);
}

#[test]
fn custom_view_name_and_missing_dataset() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path().join("curated"));
    let index = DuckDbIndex::new(dir.path().join("reddit.duckdb"), dir.path().join("curated"));

    assert!(matches!(
        index.create_view("posts", None),
        Err(IndexError::NoFiles { .. })
    ));

    store.save_rows_at("posts", &[row("a", 1)], None, at(0)).unwrap();
    assert_eq!(index.create_view("posts", Some("recent_posts")).unwrap(), "recent_posts");
    assert!(matches!(
        index.create_view("posts", Some("bad name")),
        Err(IndexError::InvalidName(_))
    ));

    let result = index.query("SELECT id FROM recent_posts").unwrap();
    assert_eq!(result.rows, vec![json!({"id": "a"})]);
}

#[test]
fn query_connection_is_read_only() {
    let dir = tempdir().unwrap();
    let store = ParquetStore::new(dir.path().join("curated"));
    let index = DuckDbIndex::new(dir.path().join("reddit.duckdb"), dir.path().join("curated"));
    store.save_rows_at("posts", &[row("a", 1)], None, at(0)).unwrap();
    index.create_view("posts", None).unwrap();

    assert!(index.query("CREATE TABLE scratch AS SELECT 1 AS x").is_err());
    assert!(index.query("SELECT 1 AS one").is_ok());
}
