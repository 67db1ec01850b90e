use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use procmerge_storage::ArchiveRotator;
use procmerge_sync::{
    maybe_build_scheduler, report_markdown, DatasetRegistry, DatasetStatus, MergeConfig,
    MergePipeline,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "procmerge")]
#[command(about = "Consolidate procurement scraper snapshots into merged batch files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge every enabled dataset once.
    Merge,
    /// Delete archived files older than the retention window.
    Prune,
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run merges on the configured cron schedule until interrupted.
    Schedule,
    /// List the configured datasets.
    Datasets,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("procmerge=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = MergeConfig::from_env();

    match cli.command.unwrap_or(Commands::Merge) {
        Commands::Merge => {
            let registry = DatasetRegistry::resolve(&config).context("loading dataset registry")?;
            let report = tokio::task::spawn_blocking(move || {
                MergePipeline::new(config, registry).run_once()
            })
            .await
            .context("merge task")??;

            for dataset in &report.datasets {
                let status = match &dataset.status {
                    DatasetStatus::Merged => "merged".to_string(),
                    DatasetStatus::NoInput => "no_input".to_string(),
                    DatasetStatus::Failed { error } => format!("failed: {error}"),
                };
                println!(
                    "{}: {} loaded={} reduced={} active={} files={}",
                    dataset.dataset,
                    status,
                    dataset.loaded_records,
                    dataset.after_reduction,
                    dataset.after_expiry,
                    dataset.written.len()
                );
            }
            println!(
                "merge complete: run_id={} ready_files={} pruned={}",
                report.run_id,
                report.ready_files().len(),
                report.pruned.len()
            );
            if let Some(path) = &report.report_path {
                println!("report: {}", path.display());
            }
            if report.has_failures() {
                bail!("one or more datasets failed to merge");
            }
        }
        Commands::Prune => {
            let rotator = ArchiveRotator::new(&config.base_dir, &config.archive_dir_name);
            let outcomes = rotator.prune(config.retention_days, std::time::SystemTime::now());
            let skipped = outcomes.iter().filter(|o| o.is_skipped()).count();
            println!(
                "pruned {} file(s) from {} ({} skipped)",
                outcomes.len() - skipped,
                rotator.archive_dir().display(),
                skipped
            );
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, Some(config.base_dir.clone()))?);
        }
        Commands::Schedule => {
            let registry = DatasetRegistry::resolve(&config).context("loading dataset registry")?;
            let cron = config.merge_cron.clone();
            let scheduler = maybe_build_scheduler(
                MergeConfig {
                    scheduler_enabled: true,
                    ..config
                },
                registry,
            )
            .await?;
            let Some(mut scheduler) = scheduler else {
                bail!("scheduler could not be built");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Datasets => {
            let registry = DatasetRegistry::resolve(&config).context("loading dataset registry")?;
            for dataset in &registry.datasets {
                println!(
                    "{} crawler={} raw={} merged={}_* strategy={:?} expiry={} enabled={}",
                    dataset.name,
                    dataset.crawler_id,
                    dataset.raw_pattern,
                    dataset.merged_prefix,
                    dataset.strategy,
                    dataset
                        .date_field
                        .as_deref()
                        .filter(|_| dataset.filter_expired)
                        .unwrap_or("off"),
                    dataset.enabled
                );
            }
        }
    }

    Ok(())
}
