use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rph_client::{Paging, SearchSort, TimeRange};
use rph_core::DEFAULT_DATASET;
use rph_sync::{
    HarvestConfig, HarvestJob, HarvestPipeline, HarvestPlan, HarvestRunSummary, JobSource,
    JobStatus, StoragePaths,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rph")]
#[command(about = "Reddit post harvester: fetch listings into Parquet and query them with DuckDB")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every job of the harvest plan once, or on its cron schedule.
    Sync {
        /// Plan file; defaults to RPH_JOBS_FILE or ./harvest.yaml.
        #[arg(long)]
        jobs: Option<PathBuf>,
        /// Keep running and repeat the plan on RPH_SYNC_CRON.
        #[arg(long)]
        schedule: bool,
    },
    /// Harvest the newest posts of a subreddit.
    New {
        subreddit: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Harvest the top posts of a subreddit.
    Top {
        subreddit: String,
        #[arg(long, default_value = "day")]
        time: TimeRange,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Harvest search results.
    Search {
        query: String,
        /// Restrict the search to one subreddit.
        #[arg(long)]
        restrict_to: Option<String>,
        #[arg(long, default_value = "relevance")]
        sort: SearchSort,
        #[arg(long, default_value = "all")]
        time: TimeRange,
        #[arg(long)]
        include_over_18: Option<bool>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Create or replace the DuckDB view over a dataset.
    View {
        #[arg(default_value = DEFAULT_DATASET)]
        dataset: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run read-only SQL against the DuckDB database; prints one JSON object per row.
    Query { sql: String },
    /// List the Parquet files of a dataset, oldest first.
    Files {
        #[arg(default_value = DEFAULT_DATASET)]
        dataset: String,
        #[arg(long)]
        latest: Option<usize>,
    },
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long, default_value_t = 1000)]
    max_items: usize,
    #[arg(long, default_value_t = Paging::MAX_PAGE_SIZE)]
    page_size: u32,
    #[arg(long, default_value = DEFAULT_DATASET)]
    dataset: String,
    /// File name suffix; derived from the source when omitted.
    #[arg(long)]
    suffix: Option<String>,
}

impl TargetArgs {
    fn job(self, source: JobSource) -> HarvestJob {
        HarvestJob {
            dataset: self.dataset,
            suffix: self.suffix,
            paging: Paging::new(self.page_size, self.max_items),
            source,
        }
    }
}

fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("rph_client=info,rph_transform=info,rph_storage=info,rph_sync=info")
    });

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_summary(summary: &HarvestRunSummary) {
    for job in &summary.jobs {
        match &job.status {
            JobStatus::Saved { batch } => println!(
                "saved: job={} fetched={} rows={} bytes={} path={}",
                job.label,
                job.fetched,
                batch.rows,
                batch.bytes,
                batch.path.display()
            ),
            JobStatus::Skipped { reason } => {
                println!("skipped: job={} fetched={} reason={reason}", job.label, job.fetched)
            }
            JobStatus::Failed { error } => println!("failed: job={} error={error}", job.label),
        }
    }
    println!(
        "harvest complete: run_id={} files={} rows={} failed={} views={}",
        summary.run_id,
        summary.saved_files(),
        summary.saved_rows(),
        summary.failed(),
        summary.views.join(",")
    );
}

async fn run_once(config: &HarvestConfig, plan: &HarvestPlan) -> Result<()> {
    let summary = HarvestPipeline::new(config)?.run_plan(plan).await?;
    print_summary(&summary);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        jobs: None,
        schedule: false,
    }) {
        Commands::Sync { jobs, schedule } => {
            let config = HarvestConfig::from_env()?;
            let plan = HarvestPlan::load(jobs.as_ref().unwrap_or(&config.jobs_file)).await?;
            let pipeline = Arc::new(HarvestPipeline::new(&config)?);
            let plan = Arc::new(plan);
            let scheduler = if schedule {
                let cron = &config.sync_cron;
                Some(rph_sync::build_scheduler(pipeline.clone(), plan.clone(), cron).await?)
            } else {
                rph_sync::maybe_build_scheduler(&config, pipeline.clone(), plan.clone()).await?
            };
            match scheduler {
                Some(sched) => rph_sync::run_until_ctrl_c(sched, &config.sync_cron).await?,
                None => print_summary(&pipeline.run_plan(&plan).await?),
            }
        }
        Commands::New { subreddit, target } => {
            let config = HarvestConfig::from_env()?;
            let job = target.job(JobSource::SubredditNew { subreddit });
            run_once(&config, &HarvestPlan::single(job)).await?;
        }
        Commands::Top {
            subreddit,
            time,
            target,
        } => {
            let config = HarvestConfig::from_env()?;
            let job = target.job(JobSource::SubredditTop { subreddit, time });
            run_once(&config, &HarvestPlan::single(job)).await?;
        }
        Commands::Search {
            query,
            restrict_to,
            sort,
            time,
            include_over_18,
            target,
        } => {
            let config = HarvestConfig::from_env()?;
            let job = target.job(JobSource::Search {
                query,
                sort,
                time,
                restrict_to,
                include_over_18,
            });
            run_once(&config, &HarvestPlan::single(job)).await?;
        }
        Commands::View { dataset, name } => {
            let paths = StoragePaths::from_env();
            let view = paths
                .index()
                .create_view(&dataset, name.as_deref())
                .with_context(|| format!("creating view for {dataset}"))?;
            println!(
                "view ready: view={view} dataset={dataset} db={}",
                paths.duckdb_path.display()
            );
        }
        Commands::Query { sql } => {
            let result = StoragePaths::from_env().index().query(&sql)?;
            for row in &result.rows {
                println!("{}", serde_json::to_string(row)?);
            }
            eprintln!("{} row(s)", result.rows.len());
        }
        Commands::Files { dataset, latest } => {
            let store = StoragePaths::from_env().store();
            let files = match latest {
                Some(n) => store.latest_files(&dataset, n)?,
                None => store.list_files(&dataset)?,
            };
            for path in files {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
