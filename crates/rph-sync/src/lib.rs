//! Harvest orchestration: env config, YAML job plans, the run loop and the cron scheduler.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use rph_client::{
    BackoffPolicy, ClientConfig, ClientError, Paging, RecordStream, RedditClient, SearchParams,
    SearchSort, SubredditListing, SubredditSort, TimeRange, DEFAULT_API_BASE, DEFAULT_AUTH_URL,
};
use rph_core::{NormalizedRow, DEFAULT_DATASET};
use rph_storage::{DuckDbIndex, IndexError, ParquetStore, SavedBatch, StorageError};
use rph_transform::normalize_posts;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rph-sync";

/// Local storage locations; needs no credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub duckdb_path: PathBuf,
}

impl StoragePaths {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            data_dir: get("DATA_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/curated/reddit")),
            duckdb_path: get("RPH_DUCKDB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/reddit.duckdb")),
        }
    }

    pub fn store(&self) -> ParquetStore {
        ParquetStore::new(self.data_dir.clone())
    }

    pub fn index(&self) -> DuckDbIndex {
        DuckDbIndex::new(self.duckdb_path.clone(), self.data_dir.clone())
    }
}

#[derive(Clone)]
pub struct HarvestConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub user_agent_prefix: String,
    pub auth_url: String,
    pub api_base: String,
    pub data_dir: PathBuf,
    pub duckdb_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub page_delay_ms: u64,
    pub jobs_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| match get(key) {
            Some(value) => Ok(value),
            None => bail!("{key} must be set"),
        };
        let parsed = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
                None => Ok(default),
            }
        };

        let storage = StoragePaths::from_lookup(&lookup);
        Ok(Self {
            client_id: required("REDDIT_CLIENT_ID")?,
            client_secret: required("REDDIT_CLIENT_SECRET")?,
            username: get("REDDIT_USERNAME").unwrap_or_else(|| "anonymous".to_string()),
            user_agent_prefix: get("REDDIT_USER_AGENT")
                .unwrap_or_else(|| "rph-harvester/0.1".to_string()),
            auth_url: get("REDDIT_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            api_base: get("REDDIT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            data_dir: storage.data_dir,
            duckdb_path: Some(storage.duckdb_path),
            http_timeout_secs: parsed("RPH_HTTP_TIMEOUT_SECS", 20)?,
            max_retries: parsed("RPH_MAX_RETRIES", 3)? as usize,
            page_delay_ms: parsed("RPH_PAGE_DELAY_MS", 600)?,
            jobs_file: get("RPH_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./harvest.yaml")),
            scheduler_enabled: get("RPH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("RPH_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }

    pub fn user_agent(&self) -> String {
        ClientConfig::user_agent_for(&self.user_agent_prefix, &self.username)
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.client_id, &self.client_secret, self.user_agent());
        config.auth_url = self.auth_url.clone();
        config.api_base = self.api_base.clone();
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.page_delay = Duration::from_millis(self.page_delay_ms);
        config.backoff = BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        };
        config
    }
}

impl fmt::Debug for HarvestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvestConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("user_agent_prefix", &self.user_agent_prefix)
            .field("api_base", &self.api_base)
            .field("data_dir", &self.data_dir)
            .field("duckdb_path", &self.duckdb_path)
            .field("max_retries", &self.max_retries)
            .field("page_delay_ms", &self.page_delay_ms)
            .field("jobs_file", &self.jobs_file)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .finish_non_exhaustive()
    }
}

/// Where a job pulls its records from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSource {
    SubredditNew {
        subreddit: String,
    },
    SubredditTop {
        subreddit: String,
        #[serde(default)]
        time: TimeRange,
    },
    Search {
        query: String,
        #[serde(default)]
        sort: SearchSort,
        #[serde(default = "all_time")]
        time: TimeRange,
        #[serde(default)]
        restrict_to: Option<String>,
        #[serde(default)]
        include_over_18: Option<bool>,
    },
}

fn all_time() -> TimeRange {
    TimeRange::All
}

fn default_dataset() -> String {
    DEFAULT_DATASET.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestJob {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub paging: Paging,
    pub source: JobSource,
}

impl HarvestJob {
    pub fn new(source: JobSource) -> Self {
        Self {
            dataset: default_dataset(),
            suffix: None,
            paging: Paging::default(),
            source,
        }
    }

    /// Suffix derived from the source, used when none is configured.
    pub fn default_suffix(&self) -> String {
        match &self.source {
            JobSource::SubredditNew { subreddit } => format!("subreddit_new_{subreddit}"),
            JobSource::SubredditTop { subreddit, time } => {
                format!("subreddit_top_{subreddit}_{}", time.as_str())
            }
            JobSource::Search { query, .. } => format!("search_{query}"),
        }
    }

    pub fn effective_suffix(&self) -> String {
        self.suffix.clone().unwrap_or_else(|| self.default_suffix())
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.dataset, self.default_suffix())
    }

    pub fn stream(&self, client: &RedditClient) -> RecordStream {
        match &self.source {
            JobSource::SubredditNew { subreddit } => client.subreddit(&SubredditListing {
                subreddit: subreddit.clone(),
                sort: SubredditSort::New,
                paging: self.paging,
            }),
            JobSource::SubredditTop { subreddit, time } => client.subreddit(&SubredditListing {
                subreddit: subreddit.clone(),
                sort: SubredditSort::Top(*time),
                paging: self.paging,
            }),
            JobSource::Search {
                query,
                sort,
                time,
                restrict_to,
                include_over_18,
            } => client.search(&SearchParams {
                query: query.clone(),
                sort: *sort,
                time: *time,
                restrict_to: restrict_to.clone(),
                include_over_18: *include_over_18,
                paging: self.paging,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestPlan {
    #[serde(default)]
    pub jobs: Vec<HarvestJob>,
}

impl HarvestPlan {
    pub fn single(job: HarvestJob) -> Self {
        Self { jobs: vec![job] }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing harvest plan")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Distinct datasets touched by the plan, sorted.
    pub fn datasets(&self) -> BTreeSet<String> {
        self.jobs.iter().map(|job| job.dataset.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Saved { batch: SavedBatch },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub label: String,
    pub dataset: String,
    pub fetched: usize,
    pub normalized: usize,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobOutcome>,
    pub views: Vec<String>,
}

impl HarvestRunSummary {
    pub fn saved_files(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Saved { .. }))
            .count()
    }

    pub fn saved_rows(&self) -> usize {
        self.jobs
            .iter()
            .map(|job| match &job.status {
                JobStatus::Saved { batch } => batch.rows,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Failed { .. }))
            .count()
    }
}

/// Drains a listing stream and normalizes what it yielded.
///
/// The first failed page aborts the whole collection.
pub async fn collect_normalized(
    stream: RecordStream,
) -> Result<(usize, Vec<NormalizedRow>), ClientError> {
    let raw: Vec<_> = stream.try_collect().await?;
    let fetched = raw.len();
    Ok((fetched, normalize_posts(raw)))
}

pub struct HarvestPipeline {
    client: RedditClient,
    store: ParquetStore,
    index: Option<DuckDbIndex>,
}

impl HarvestPipeline {
    pub fn new(config: &HarvestConfig) -> Result<Self> {
        let client =
            RedditClient::new(&config.client_config()).context("building reddit client")?;
        let store = ParquetStore::new(config.data_dir.clone());
        let index = config
            .duckdb_path
            .as_ref()
            .map(|db| DuckDbIndex::new(db.clone(), config.data_dir.clone()));
        Ok(Self::from_parts(client, store, index))
    }

    pub fn from_parts(client: RedditClient, store: ParquetStore, index: Option<DuckDbIndex>) -> Self {
        Self {
            client,
            store,
            index,
        }
    }

    pub fn client(&self) -> &RedditClient {
        &self.client
    }

    pub fn store(&self) -> &ParquetStore {
        &self.store
    }

    pub fn index(&self) -> Option<&DuckDbIndex> {
        self.index.as_ref()
    }

    /// Fetch, normalize and save one job.
    ///
    /// Authentication failures abort with an error; any other failure is
    /// reported in the outcome so the remaining jobs still run.
    pub async fn run_job(&self, job: &HarvestJob) -> Result<JobOutcome> {
        let label = job.label();
        let span = info_span!("harvest_job", job = %label);
        async {
            let mut outcome = JobOutcome {
                label: label.clone(),
                dataset: job.dataset.clone(),
                fetched: 0,
                normalized: 0,
                status: JobStatus::Skipped {
                    reason: String::new(),
                },
            };

            let rows = match collect_normalized(job.stream(&self.client)).await {
                Ok((fetched, rows)) => {
                    outcome.fetched = fetched;
                    outcome.normalized = rows.len();
                    rows
                }
                Err(err @ ClientError::Auth { .. }) => {
                    return Err(err).with_context(|| format!("authenticating for job {label}"));
                }
                Err(err) => {
                    warn!(error = %err, "listing failed");
                    outcome.status = JobStatus::Failed {
                        error: err.to_string(),
                    };
                    return Ok(outcome);
                }
            };

            let suffix = job.effective_suffix();
            outcome.status = match self.store.save_rows(&job.dataset, &rows, Some(suffix.as_str())) {
                Ok(batch) => JobStatus::Saved { batch },
                Err(err @ StorageError::EmptyBatch { .. }) => {
                    warn!(fetched = outcome.fetched, "nothing to save");
                    JobStatus::Skipped {
                        reason: err.to_string(),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "saving batch failed");
                    JobStatus::Failed {
                        error: err.to_string(),
                    }
                }
            };
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    pub async fn run_plan(&self, plan: &HarvestPlan) -> Result<HarvestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, jobs = plan.jobs.len(), "harvest started");

        let mut jobs = Vec::with_capacity(plan.jobs.len());
        for job in &plan.jobs {
            jobs.push(self.run_job(job).await?);
        }
        let views = self.refresh_views(&plan.datasets());

        let summary = HarvestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            jobs,
            views,
        };
        info!(
            %run_id,
            files = summary.saved_files(),
            rows = summary.saved_rows(),
            failed = summary.failed(),
            "harvest finished"
        );
        Ok(summary)
    }

    /// Recreates `vw_<dataset>` for every dataset that has files. Returns the views made.
    pub fn refresh_views(&self, datasets: &BTreeSet<String>) -> Vec<String> {
        let Some(index) = &self.index else {
            return Vec::new();
        };
        let mut views = Vec::new();
        for dataset in datasets {
            match index.create_view(dataset, None) {
                Ok(view) => views.push(view),
                Err(IndexError::NoFiles { .. }) => debug!(%dataset, "no files yet, view skipped"),
                Err(err) => warn!(%dataset, error = %err, "could not refresh view"),
            }
        }
        views
    }
}

/// Scheduler that runs the whole plan on every `cron` trigger (six-field, seconds first).
pub async fn build_scheduler(
    pipeline: Arc<HarvestPipeline>,
    plan: Arc<HarvestPlan>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let plan = plan.clone();
        Box::pin(async move {
            match pipeline.run_plan(&plan).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    rows = summary.saved_rows(),
                    "scheduled harvest complete"
                ),
                Err(err) => error!(error = ?err, "scheduled harvest failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &HarvestConfig,
    pipeline: Arc<HarvestPipeline>,
    plan: Arc<HarvestPlan>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, plan, &config.sync_cron).await.map(Some)
}

/// Starts `sched` and keeps it running until Ctrl+C.
pub async fn run_until_ctrl_c(mut sched: JobScheduler, cron: &str) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    warn!("Ctrl+C received, stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_apply_when_only_credentials_are_set() {
        let config = HarvestConfig::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "cid"),
            ("REDDIT_CLIENT_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.username, "anonymous");
        assert_eq!(config.user_agent(), "rph-harvester/0.1 by u/anonymous");
        assert_eq!(config.data_dir, PathBuf::from("./data/curated/reddit"));
        assert_eq!(config.duckdb_path, Some(PathBuf::from("./data/reddit.duckdb")));
        assert_eq!(config.max_retries, 3);
        assert!(!config.scheduler_enabled);

        let client = config.client_config();
        assert_eq!(client.page_delay, Duration::from_millis(600));
        assert_eq!(client.backoff.base_delay, Duration::from_millis(800));
        assert_eq!(client.timeout, Duration::from_secs(20));
        assert_eq!(client.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn missing_credentials_and_bad_numbers_are_errors() {
        let err = HarvestConfig::from_lookup(lookup(&[("REDDIT_CLIENT_ID", "cid")])).unwrap_err();
        assert!(err.to_string().contains("REDDIT_CLIENT_SECRET"));

        let err = HarvestConfig::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "cid"),
            ("REDDIT_CLIENT_SECRET", "secret"),
            ("RPH_MAX_RETRIES", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RPH_MAX_RETRIES"));
    }

    #[test]
    fn config_debug_hides_the_secret() {
        let config = HarvestConfig::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "cid"),
            ("REDDIT_CLIENT_SECRET", "hunter2"),
        ]))
        .unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn plan_parses_every_job_kind_with_defaults() {
        let plan = HarvestPlan::from_yaml_str(
            r#"
jobs:
  - source:
      kind: subreddit_new
      subreddit: sneakers
    paging:
      max_items: 300
  - dataset: top_posts
    suffix: weekly
    source:
      kind: subreddit_top
      subreddit: sneakers
      time: week
  - source:
      kind: search
      query: nike air max
      sort: new
      restrict_to: sneakers
      include_over_18: false
"#,
        )
        .unwrap();

        assert_eq!(plan.jobs.len(), 3);
        assert_eq!(plan.jobs[0].dataset, "posts");
        assert_eq!(plan.jobs[0].paging, Paging::new(100, 300));
        assert_eq!(plan.jobs[0].effective_suffix(), "subreddit_new_sneakers");
        assert_eq!(plan.jobs[1].effective_suffix(), "weekly");
        assert_eq!(plan.jobs[1].default_suffix(), "subreddit_top_sneakers_week");
        assert_eq!(
            plan.jobs[2].source,
            JobSource::Search {
                query: "nike air max".to_string(),
                sort: SearchSort::New,
                time: TimeRange::All,
                restrict_to: Some("sneakers".to_string()),
                include_over_18: Some(false),
            }
        );
        assert_eq!(
            plan.datasets().into_iter().collect::<Vec<_>>(),
            ["posts", "top_posts"]
        );
    }

    fn scheduler_config(enabled: &str, cron: &str) -> HarvestConfig {
        HarvestConfig::from_lookup(lookup(&[
            ("REDDIT_CLIENT_ID", "cid"),
            ("REDDIT_CLIENT_SECRET", "secret"),
            ("RPH_SCHEDULER_ENABLED", enabled),
            ("RPH_SYNC_CRON", cron),
        ]))
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_is_built_only_when_enabled() {
        let plan = Arc::new(HarvestPlan::default());

        let config = scheduler_config("false", "0 0 6 * * *");
        let pipeline = Arc::new(HarvestPipeline::new(&config).unwrap());
        let sched = maybe_build_scheduler(&config, pipeline, plan.clone()).await.unwrap();
        assert!(sched.is_none());

        let config = scheduler_config("true", "0 0 6 * * *");
        let pipeline = Arc::new(HarvestPipeline::new(&config).unwrap());
        let sched = maybe_build_scheduler(&config, pipeline, plan.clone()).await.unwrap();
        assert!(sched.is_some());

        let config = scheduler_config("true", "every morning");
        let pipeline = Arc::new(HarvestPipeline::new(&config).unwrap());
        match maybe_build_scheduler(&config, pipeline, plan).await {
            Err(err) => assert!(err.to_string().contains("every morning"), "{err:#}"),
            Ok(_) => panic!("malformed cron expression was accepted"),
        }
    }

    #[test]
    fn unknown_job_kind_is_rejected() {
        let err = HarvestPlan::from_yaml_str("jobs:\n  - source:\n      kind: comments\n").unwrap_err();
        assert!(format!("{err:#}").contains("comments"));
    }
}
