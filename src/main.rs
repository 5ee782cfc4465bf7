use anyhow::{bail, Context, Result};
use clap::Parser;
use database::Database;
use harvester_core::export::{self, ExportFormat};
use harvester_core::{AppConfig, KeywordMode, KeywordSet, RunOutcome, RunProgress, RunResult};
use run_service::{RunHandle, RunRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telegram_client::TelegramClient;
use tracing_subscriber::EnvFilter;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_SHOWN_AUTHORS: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about = "Collect commenters of a Telegram channel whose comments mention your keywords")]
struct Cli {
    /// Channel reference: @name, name or a t.me link
    #[arg(long)]
    channel: String,

    /// Number of most recent posts to check
    #[arg(long)]
    posts: Option<u32>,

    /// Comma-separated keywords; empty keeps every comment
    #[arg(long)]
    keywords: Option<String>,

    /// How keywords combine: any|all (or|and also accepted)
    #[arg(long = "keyword-mode")]
    keyword_mode: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "output-dir", default_value = "./output")]
    output_dir: PathBuf,

    /// Export format: csv|json
    #[arg(long, default_value = "csv")]
    format: String,

    /// Skip writing the export file
    #[arg(long = "no-export")]
    no_export: bool,

    /// Print every author instead of the first ten
    #[arg(long = "show-all")]
    show_all: bool,

    /// Only print warnings and the final summary
    #[arg(long, short)]
    quiet: bool,

    /// SQLite URL for run history, e.g. sqlite://harvester.db
    #[arg(long)]
    database: Option<String>,
}

fn init_tracing(quiet: bool) {
    let default = if quiet {
        "warn"
    } else {
        "comment_harvester=info,run_service=info,telegram_client=info,database=info,harvester_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_progress(progress: &RunProgress) {
    println!(
        "[{:>3}%] {} | posts {}/{} | comments {} | matched {} | authors {}",
        progress.percent_complete(),
        progress.state,
        progress.posts_checked,
        progress.posts_total,
        progress.total_comments,
        progress.matched_comments,
        progress.unique_authors
    );
}

fn print_summary(result: &RunResult, show_all: bool) {
    println!();
    println!("Channel:             {}", result.channel);
    println!("Posts checked:       {}", result.posts_checked);
    println!("Posts with comments: {}", result.posts_with_comments);
    println!("Comments:            {}", result.total_comments);
    println!("Matched comments:    {}", result.matched_comments);
    println!("Unique authors:      {}", result.unique_author_count);
    if result.skipped_posts > 0 {
        println!("Posts skipped:       {}", result.skipped_posts);
    }
    if result.skipped_bots > 0 {
        println!("Bot comments:        {}", result.skipped_bots);
    }
    println!("Elapsed:             {:.1}s", result.elapsed.as_secs_f64());

    if result.authors.is_empty() {
        return;
    }
    println!();
    let shown = if show_all {
        result.authors.len()
    } else {
        DEFAULT_SHOWN_AUTHORS.min(result.authors.len())
    };
    for (i, author) in result.authors.iter().take(shown).enumerate() {
        let handle = author
            .handle
            .as_deref()
            .map(|h| format!(" (@{})", h))
            .unwrap_or_default();
        let text: String = author.first_comment_text.chars().take(80).collect();
        println!("{:>3}. {}{} [{}]: {}", i + 1, author.display_name, handle, author.author_id, text);
    }
    if shown < result.authors.len() {
        println!("... and {} more (use --show-all)", result.authors.len() - shown);
    }
}

/// Poll progress until the run ends. The first Ctrl-C cancels the run.
async fn watch_run(registry: &RunRegistry, handle: &RunHandle, quiet: bool) -> Result<RunOutcome> {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            outcome = registry.wait(handle) => return Ok(outcome?),
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::warn!("Interrupted, cancelling run {}", handle);
                registry.cancel(handle)?;
                cancel_requested = true;
            }
            _ = ticker.tick() => {
                if !quiet {
                    print_progress(&registry.get_progress(handle)?);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    tracing::info!("Starting comment harvester");

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = &cli.database {
        config.database_url = Some(url.clone());
    }
    config.validate().context("Invalid configuration")?;

    let mode = match &cli.keyword_mode {
        Some(mode) => mode.parse::<KeywordMode>()?,
        None => config.defaults.keyword_mode,
    };
    let format: ExportFormat = cli.format.parse()?;
    let keywords = KeywordSet::parse(cli.keywords.as_deref().unwrap_or(""), mode);
    let posts = cli.posts.unwrap_or(config.defaults.posts_limit);

    let client = TelegramClient::new(&config.telegram, config.credentials()?)
        .context("Failed to create Telegram client")?;
    let mut registry = RunRegistry::from_config(&config, Arc::new(client));

    let database = match &config.database_url {
        Some(url) => {
            let db = Arc::new(
                Database::open(url)
                    .await
                    .with_context(|| format!("Failed to open database {}", url))?,
            );
            registry = registry.with_sink(db.clone());
            Some(db)
        }
        None => None,
    };

    let handle = registry
        .start_run(&cli.channel, posts, keywords)
        .context("Failed to start run")?;
    let outcome = watch_run(&registry, &handle, cli.quiet).await?;
    // Let the run finish its last history writes before the pool closes
    registry.shutdown().await;

    if let Some(db) = &database {
        db.close().await;
    }

    match outcome {
        RunOutcome::Done(result) => {
            print_summary(&result, cli.show_all);
            if !cli.no_export && !result.authors.is_empty() {
                let path =
                    export::write_export(&cli.output_dir, &result.channel, format, &result.authors)
                        .await
                        .context("Failed to write export")?;
                println!();
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
        RunOutcome::Failed { failure, progress } => {
            print_progress(&progress);
            bail!("Run failed [{}]: {}", failure.code, failure.message)
        }
        RunOutcome::Cancelled { progress } => {
            print_progress(&progress);
            bail!("Run cancelled before completion")
        }
    }
}
