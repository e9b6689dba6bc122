//! Immutable, timestamp-named Parquet batches per dataset, plus the DuckDB view layer.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Int32Type, Int64Type};
use arrow_array::{
    Array, ArrayRef, BooleanArray, DictionaryArray, Float32Array, Int32Array, Int64Array,
    RecordBatch, StringArray,
};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef};
use arrow_select::filter::filter_record_batch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use rph_core::{ColumnKind, NormalizedRow, POST_COLUMNS, SOURCE_TAG};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub mod index;

pub use index::{DuckDbIndex, IndexError, QueryResult};

pub const CRATE_NAME: &str = "rph-storage";

/// Fixed-width, lexicographically sortable stamp embedded in every file name.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const PARQUET_EXTENSION: &str = "parquet";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no rows left to write for dataset {dataset} after deduplication")]
    EmptyBatch { dataset: String },
    #[error("invalid dataset name {0:?}: use letters, digits and underscores")]
    InvalidDataset(String),
    #[error("refusing to overwrite existing file {}", .0.display())]
    FileExists(PathBuf),
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected column layout: {0}")]
    Schema(String),
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Writer tuning: compact files over write latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParquetWriteOptions {
    pub zstd_level: i32,
    pub dictionary: bool,
    pub data_page_size_limit: usize,
}

impl Default for ParquetWriteOptions {
    fn default() -> Self {
        Self {
            zstd_level: 7,
            dictionary: true,
            data_page_size_limit: 128 * 1024,
        }
    }
}

impl ParquetWriteOptions {
    fn writer_properties(&self) -> Result<WriterProperties, StorageError> {
        Ok(WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(self.zstd_level)?))
            .set_dictionary_enabled(self.dictionary)
            .set_data_page_size_limit(self.data_page_size_limit)
            .build())
    }
}

/// Result of one successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedBatch {
    pub dataset: String,
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ParquetStore {
    base_dir: PathBuf,
    options: ParquetWriteOptions,
}

impl ParquetStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_options(base_dir, ParquetWriteOptions::default())
    }

    pub fn with_options(base_dir: impl Into<PathBuf>, options: ParquetWriteOptions) -> Self {
        Self {
            base_dir: base_dir.into(),
            options,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.base_dir.join(dataset)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<dataset>_<YYYYMMDD>_<HHMMSS>[_<suffix>].parquet`
    pub fn file_name(dataset: &str, at: DateTime<Utc>, suffix: Option<&str>) -> String {
        let stamp = at.format(FILE_TIMESTAMP_FORMAT);
        match suffix.map(sanitize_suffix).filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{dataset}_{stamp}_{suffix}.{PARQUET_EXTENSION}"),
            None => format!("{dataset}_{stamp}.{PARQUET_EXTENSION}"),
        }
    }

    pub fn save_rows(
        &self,
        dataset: &str,
        rows: &[NormalizedRow],
        suffix: Option<&str>,
    ) -> Result<SavedBatch, StorageError> {
        self.save_rows_at(dataset, rows, suffix, Utc::now())
    }

    pub fn save_rows_at(
        &self,
        dataset: &str,
        rows: &[NormalizedRow],
        suffix: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SavedBatch, StorageError> {
        let batch = rows_to_batch(rows)?;
        self.save_record_batch_at(dataset, &batch, suffix, at)
    }

    pub fn save_record_batch(
        &self,
        dataset: &str,
        batch: &RecordBatch,
        suffix: Option<&str>,
    ) -> Result<SavedBatch, StorageError> {
        self.save_record_batch_at(dataset, batch, suffix, Utc::now())
    }

    /// Deduplicates by `id` and writes the batch as one new file.
    ///
    /// Fails with [`StorageError::EmptyBatch`] without touching the disk when
    /// nothing is left to write, and with [`StorageError::FileExists`] rather
    /// than replacing a file of the same name.
    pub fn save_record_batch_at(
        &self,
        dataset: &str,
        batch: &RecordBatch,
        suffix: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SavedBatch, StorageError> {
        validate_dataset(dataset)?;
        let span = info_span!("parquet_save", dataset, input_rows = batch.num_rows());
        let _guard = span.enter();

        let batch = dedup_by_id(batch)?;
        if batch.num_rows() == 0 {
            return Err(StorageError::EmptyBatch {
                dataset: dataset.to_string(),
            });
        }

        let dir = self.dataset_dir(dataset);
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let path = dir.join(Self::file_name(dataset, at, suffix));
        if path.exists() {
            return Err(StorageError::FileExists(path));
        }

        let bytes = self.encode(&batch)?;
        let sha256 = Self::sha256_hex(&bytes);
        write_atomically(&dir, &path, &bytes)?;

        info!(path = %path.display(), rows = batch.num_rows(), bytes = bytes.len(), "saved parquet batch");
        Ok(SavedBatch {
            dataset: dataset.to_string(),
            path,
            rows: batch.num_rows(),
            bytes: bytes.len() as u64,
            sha256,
            written_at: at,
        })
    }

    fn encode(&self, batch: &RecordBatch) -> Result<Vec<u8>, StorageError> {
        let props = self.options.writer_properties()?;
        let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
        writer.write(batch)?;
        Ok(writer.into_inner()?)
    }

    /// Every file of the dataset, sorted by name (and therefore by write time).
    pub fn list_files(&self, dataset: &str) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.dataset_dir(dataset);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&dir, err)),
        };

        let prefix = format!("{dataset}_");
        let suffix = format!(".{PARQUET_EXTENSION}");
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(&suffix) && entry.path().is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// The `n` most recent files, oldest first.
    pub fn latest_files(&self, dataset: &str, n: usize) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = self.list_files(dataset)?;
        let skip = files.len().saturating_sub(n);
        Ok(files.split_off(skip))
    }
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let written = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::io(&temp_path, err));
    }

    // hard_link refuses an existing target, unlike rename.
    let published = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    match published {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Err(StorageError::FileExists(path.to_path_buf()))
        }
        Err(err) => Err(StorageError::io(path, err)),
    }
}

pub fn validate_dataset(dataset: &str) -> Result<(), StorageError> {
    let valid = !dataset.is_empty()
        && dataset
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidDataset(dataset.to_string()))
    }
}

/// Keeps `[A-Za-z0-9_-]`; each run of other characters becomes one `-`.
pub fn sanitize_suffix(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Drops every row whose `id` was already seen earlier in the batch.
///
/// Batches without a string `id` column pass through untouched.
pub fn dedup_by_id(batch: &RecordBatch) -> Result<RecordBatch, StorageError> {
    let Some(column) = batch.column_by_name("id") else {
        return Ok(batch.clone());
    };

    let keep: BooleanArray = if let Some(ids) = column.as_string_opt::<i32>() {
        first_occurrences(ids.iter())
    } else if let Some(ids) = column.as_string_opt::<i64>() {
        first_occurrences(ids.iter())
    } else {
        warn!(data_type = %column.data_type(), "id column is not text, skipping dedup");
        return Ok(batch.clone());
    };

    let kept = keep.true_count();
    if kept == batch.num_rows() {
        return Ok(batch.clone());
    }
    debug!(dropped = batch.num_rows() - kept, "dropped duplicate ids");
    Ok(filter_record_batch(batch, &keep)?)
}

fn first_occurrences<'a>(ids: impl Iterator<Item = Option<&'a str>>) -> BooleanArray {
    let mut seen = HashSet::new();
    ids.map(|id| Some(seen.insert(id))).collect()
}

/// Arrow schema of a posts dataset, in canonical column order.
pub fn posts_schema() -> SchemaRef {
    let fields: Vec<Field> = POST_COLUMNS
        .iter()
        .map(|column| {
            let nullable = !matches!(column.name, "id" | "retrieved_at" | "source");
            Field::new(column.name, data_type_for(column.kind), nullable)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn data_type_for(kind: ColumnKind) -> DataType {
    match kind {
        ColumnKind::Text => DataType::Utf8,
        ColumnKind::Category => {
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
        }
        ColumnKind::Int32 => DataType::Int32,
        ColumnKind::Int64 => DataType::Int64,
        ColumnKind::Float32 => DataType::Float32,
        ColumnKind::Boolean => DataType::Boolean,
    }
}

pub fn rows_to_batch(rows: &[NormalizedRow]) -> Result<RecordBatch, StorageError> {
    let columns = POST_COLUMNS
        .iter()
        .map(|column| column_array(column.name, rows))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(posts_schema(), columns)?)
}

fn text_array<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(values.collect::<StringArray>())
}

fn category_array<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(values.collect::<DictionaryArray<Int32Type>>())
}

fn column_array(name: &str, rows: &[NormalizedRow]) -> Result<ArrayRef, StorageError> {
    let rows = rows.iter();
    let array: ArrayRef = match name {
        "id" => text_array(rows.map(|r| Some(r.id.as_str()))),
        "subreddit" => category_array(rows.map(|r| r.subreddit.as_deref())),
        "author" => category_array(rows.map(|r| r.author.as_deref())),
        "title" => text_array(rows.map(|r| r.title.as_deref())),
        "selftext" => text_array(rows.map(|r| r.selftext.as_deref())),
        "created_utc" => Arc::new(rows.map(|r| r.created_utc).collect::<Int64Array>()),
        "num_comments" => Arc::new(rows.map(|r| r.num_comments).collect::<Int32Array>()),
        "score" => Arc::new(rows.map(|r| r.score).collect::<Int32Array>()),
        "upvote_ratio" => Arc::new(rows.map(|r| r.upvote_ratio).collect::<Float32Array>()),
        "url" => text_array(rows.map(|r| r.url.as_deref())),
        "permalink" => text_array(rows.map(|r| r.permalink.as_deref())),
        "over_18" => Arc::new(rows.map(|r| r.over_18).collect::<BooleanArray>()),
        "is_self" => Arc::new(rows.map(|r| r.is_self).collect::<BooleanArray>()),
        "domain" => category_array(rows.map(|r| r.domain.as_deref())),
        "link_flair_text" => category_array(rows.map(|r| r.link_flair_text.as_deref())),
        "subreddit_subscribers" => {
            Arc::new(rows.map(|r| r.subreddit_subscribers).collect::<Int64Array>())
        }
        "retrieved_at" => Arc::new(rows.map(|r| Some(r.retrieved_at)).collect::<Int64Array>()),
        "source" => category_array(rows.map(|r| Some(r.source.as_str()))),
        other => return Err(StorageError::Schema(format!("no row field for column {other}"))),
    };
    Ok(array)
}

/// Reads a posts file back into rows. Columns missing from the file read as `None`.
pub fn read_rows(path: impl AsRef<Path>) -> Result<Vec<NormalizedRow>, StorageError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        rows.extend(batch_to_rows(&batch)?);
    }
    Ok(rows)
}

fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<NormalizedRow>, StorageError> {
    let ids = strings(batch, "id")?
        .ok_or_else(|| StorageError::Schema("missing id column".to_string()))?;
    let text = |name| strings(batch, name).map(|v| v.unwrap_or_else(|| vec![None; ids.len()]));
    let subreddit = text("subreddit")?;
    let author = text("author")?;
    let title = text("title")?;
    let selftext = text("selftext")?;
    let url = text("url")?;
    let permalink = text("permalink")?;
    let domain = text("domain")?;
    let flair = text("link_flair_text")?;
    let source = text("source")?;
    let created_utc = primitives::<Int64Type>(batch, "created_utc")?;
    let num_comments = primitives::<Int32Type>(batch, "num_comments")?;
    let score = primitives::<Int32Type>(batch, "score")?;
    let upvote_ratio = primitives::<Float32Type>(batch, "upvote_ratio")?;
    let subscribers = primitives::<Int64Type>(batch, "subreddit_subscribers")?;
    let retrieved_at = primitives::<Int64Type>(batch, "retrieved_at")?;
    let over_18 = booleans(batch, "over_18")?;
    let is_self = booleans(batch, "is_self")?;

    let mut rows = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let Some(id) = id.clone() else {
            continue;
        };
        rows.push(NormalizedRow {
            id,
            subreddit: subreddit[i].clone(),
            author: author[i].clone(),
            title: title[i].clone(),
            selftext: selftext[i].clone(),
            created_utc: created_utc[i],
            num_comments: num_comments[i],
            score: score[i],
            upvote_ratio: upvote_ratio[i],
            url: url[i].clone(),
            permalink: permalink[i].clone(),
            over_18: over_18[i],
            is_self: is_self[i],
            domain: domain[i].clone(),
            link_flair_text: flair[i].clone(),
            subreddit_subscribers: subscribers[i],
            retrieved_at: retrieved_at[i].unwrap_or_default(),
            source: source[i].clone().unwrap_or_else(|| SOURCE_TAG.to_string()),
        });
    }
    Ok(rows)
}

fn strings(batch: &RecordBatch, name: &str) -> Result<Option<Vec<Option<String>>>, StorageError> {
    let Some(column) = batch.column_by_name(name) else {
        return Ok(None);
    };
    if let Some(values) = column.as_string_opt::<i32>() {
        return Ok(Some(values.iter().map(|v| v.map(str::to_string)).collect()));
    }
    if let Some(dict) = column.as_dictionary_opt::<Int32Type>() {
        let Some(values) = dict.values().as_string_opt::<i32>() else {
            return Err(StorageError::Schema(format!("{name}: dictionary values are not text")));
        };
        let out = dict
            .keys()
            .iter()
            .map(|key| {
                key.map(|k| k as usize)
                    .filter(|&k| k < values.len() && values.is_valid(k))
                    .map(|k| values.value(k).to_string())
            })
            .collect();
        return Ok(Some(out));
    }
    Err(StorageError::Schema(format!(
        "{name}: expected text, found {}",
        column.data_type()
    )))
}

fn primitives<T>(batch: &RecordBatch, name: &str) -> Result<Vec<Option<T::Native>>, StorageError>
where
    T: arrow_array::ArrowPrimitiveType,
{
    match batch.column_by_name(name) {
        None => Ok(vec![None; batch.num_rows()]),
        Some(column) => column
            .as_primitive_opt::<T>()
            .map(|values| values.iter().collect())
            .ok_or_else(|| {
                StorageError::Schema(format!("{name}: unexpected type {}", column.data_type()))
            }),
    }
}

fn booleans(batch: &RecordBatch, name: &str) -> Result<Vec<Option<bool>>, StorageError> {
    match batch.column_by_name(name) {
        None => Ok(vec![None; batch.num_rows()]),
        Some(column) => column
            .as_boolean_opt()
            .map(|values| values.iter().collect())
            .ok_or_else(|| {
                StorageError::Schema(format!("{name}: unexpected type {}", column.data_type()))
            }),
    }
}
