use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use colored::Colorize;
use friendgraph_core::aggregate;
use friendgraph_core::config::Config;
use friendgraph_core::crawl::{CrawlOptions, CrawlRequest, CrawlService, progress_spinner};
use friendgraph_core::data::{Database, SqliteStore};
use friendgraph_core::report::{ReportFormat, gather_report_data, generate_report, save_report};
use friendgraph_crawler::error::CrawlError;
use friendgraph_crawler::model::{CrawlJob, JobState};
use friendgraph_crawler::source::SteamSource;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, info, warn};

use crate::{logging, server};

pub const DEFAULT_CONFIG_DIR: &str = "~/.config/friendgraph/";
pub const DB_FILE_NAME: &str = "friendgraph.db";

pub fn default_db_path() -> String {
    format!("{}{}", DEFAULT_CONFIG_DIR, DB_FILE_NAME)
}

/// Expands `~` and environment variables in a user-supplied path. An unset
/// variable is left as written and only `~` is expanded.
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> io::Result<String> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().to_lowercase())
}

fn colored_state(state: JobState) -> colored::ColoredString {
    match state {
        JobState::Pending => state.as_str().bright_white(),
        JobState::Running => state.as_str().cyan(),
        JobState::Completed => state.as_str().green().bold(),
        JobState::PartiallyFailed => state.as_str().yellow().bold(),
        JobState::Cancelled => state.as_str().red(),
    }
}

/// Opens a database that `friendgraph init` (or a server) already created.
fn open_existing(db_path: &Path) -> Result<Database> {
    if !Database::exists(db_path) {
        bail!(
            "no database at {} (run `friendgraph init` first)",
            db_path.display()
        );
    }
    Database::new(db_path).with_context(|| format!("opening {}", db_path.display()))
}

// ============================================================================
// init
// ============================================================================

/// Creates the config directory and an empty database inside it. An existing
/// database is only replaced when `force` is set.
pub fn init_database(config_dir: &Path, force: bool) -> Result<PathBuf> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("creating {}", config_dir.display()))?;

    let db_path = config_dir.join(DB_FILE_NAME);
    if Database::exists(&db_path) {
        if !force {
            bail!("database already exists at {}", db_path.display());
        }
        Database::drop(&db_path)?;
    }

    Database::new(&db_path)?;
    Ok(db_path)
}

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    print_divider();
    println!("{}", "  FRIENDGRAPH INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let config_dir = args
        .get_one::<String>("PATH")
        .map(|p| expand_path(p))
        .unwrap_or_else(|| expand_path(DEFAULT_CONFIG_DIR));
    let mut force = args.get_flag("force");
    let db_path = config_dir.join(DB_FILE_NAME);

    println!(
        "{} Target: {}",
        "→".blue(),
        config_dir.display().to_string().bright_white()
    );
    println!();

    if Database::exists(&db_path) && !force {
        println!("{}", "⚠ WARNING".yellow().bold());
        println!("Database already exists at:");
        println!(
            "  {} {}",
            "•".yellow(),
            db_path.display().to_string().bright_white()
        );
        println!();
        println!(
            "{}",
            "Overwriting it deletes every stored crawl job and graph.".yellow()
        );

        let response = print_prompt("Do you want to continue? [y/N]:")?;
        println!();
        if response != "y" && response != "yes" {
            println!("{} Initialization cancelled.", "✗".red().bold());
            return Ok(());
        }
        force = true;
    }

    let db_path = init_database(&config_dir, force)?;
    println!("{} Database: {}", "✓".green().bold(), db_path.display());
    println!();
    println!("{}", "Next steps:".bright_blue().bold());
    println!(
        "  {} friendgraph crawl --origin <PROFILE_ID> --depth 2",
        "$".bright_black()
    );
    println!(
        "  {} friendgraph serve   (reads its settings from the environment)",
        "$".bright_black()
    );
    Ok(())
}

// ============================================================================
// serve
// ============================================================================

pub async fn handle_serve() -> Result<()> {
    let config = Config::from_env()?;
    let span = logging::init_service(&config)?;

    let service = Arc::new(CrawlService::from_config(&config)?.with_span(span.clone()));

    let resumed = service
        .resume_interrupted()
        .instrument(span.clone())
        .await?;
    if !resumed.is_empty() {
        warn!(parent: &span, "Resumed {} interrupted crawl job(s)", resumed.len());
    }
    info!(
        parent: &span,
        "Database at {}, {} crawl workers per job",
        config.database_path.display(),
        config.crawl_workers
    );

    server::serve(service, &config.bind_addr(), span).await
}

// ============================================================================
// crawl
// ============================================================================

pub async fn handle_crawl(args: &ArgMatches) -> Result<()> {
    logging::init_cli(args.get_flag("verbose"))?;

    let origins: Vec<String> = args
        .get_many::<String>("origin")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let depth = args.get_one::<u32>("depth").copied().unwrap_or(1);
    let workers = args.get_one::<usize>("threads").copied().unwrap_or(4);
    let timeout = args.get_one::<u64>("timeout").copied().unwrap_or(10);
    let api_key = args
        .get_one::<String>("api-key")
        .context("a Steam API key is required (--api-key or STEAM_API_KEY)")?;
    let db_path = db_path_arg(args);

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let source = Arc::new(SteamSource::new(api_key.clone(), Duration::from_secs(timeout))?);
    let options = CrawlOptions {
        workers,
        fetch_timeout: Duration::from_secs(timeout),
        profile_reuse: args
            .get_one::<u64>("reuse-profiles")
            .map(|secs| Duration::from_secs(*secs)),
        ..Default::default()
    };
    let service = CrawlService::new(store, source, options);

    let request = CrawlRequest {
        origins,
        depth,
        job_id: args.get_one::<String>("job-id").cloned(),
        force: args.get_flag("force"),
    };

    let (pb, progress) = progress_spinner();
    let result = service.run_crawl(request, Some(progress)).await;
    pb.finish_and_clear();
    let job = result?;

    print_divider();
    println!("{}", "  CRAWL FINISHED".bright_white().bold());
    print_divider();
    print_job(&job);
    println!();
    println!(
        "{} friendgraph graph {}",
        "Build the graph with:".bright_blue(),
        job.job_id
    );
    Ok(())
}

// ============================================================================
// status
// ============================================================================

/// Plain-text summary of a job's progress.
pub fn format_job_status(job: &CrawlJob) -> String {
    let mut out = String::new();
    out.push_str(&format!("Job:        {}\n", job.job_id));
    out.push_str(&format!("State:      {}\n", job.state));
    out.push_str(&format!("Origins:    {}\n", job.origins.join(", ")));
    out.push_str(&format!("Max depth:  {}\n", job.max_depth));
    out.push_str(&format!(
        "Progress:   {}/{} profiles ({} failed, {} skipped)\n",
        job.completed, job.total_discovered, job.failed, job.skipped
    ));
    out
}

fn print_job(job: &CrawlJob) {
    println!("{} {}", "Job:       ".bright_white(), job.job_id);
    println!("{} {}", "State:     ".bright_white(), colored_state(job.state));
    println!("{} {}", "Origins:   ".bright_white(), job.origins.join(", "));
    println!("{} {}", "Max depth: ".bright_white(), job.max_depth);
    println!(
        "{} {}/{} profiles ({} failed, {} skipped)",
        "Progress:  ".bright_white(),
        job.completed,
        job.total_discovered,
        job.failed,
        job.skipped
    );
}

pub fn handle_status(args: &ArgMatches) -> Result<()> {
    let db_path = db_path_arg(args);
    let db = open_existing(&db_path)?;

    if let Some(job_id) = args.get_one::<String>("JOB_ID") {
        let job = db
            .get_job(job_id)?
            .ok_or_else(|| CrawlError::NotFound(job_id.clone()))?;
        print_job(&job);
        return Ok(());
    }

    let limit = args.get_one::<usize>("limit").copied().unwrap_or(20);
    let jobs = db.list_jobs(limit)?;
    if jobs.is_empty() {
        println!("No crawl jobs recorded in {}", db_path.display());
        return Ok(());
    }
    println!(
        "{}",
        format!(
            "{:<34} {:<18} {:>5} {:>11}  {}",
            "JOB", "STATE", "DEPTH", "PROGRESS", "ORIGINS"
        )
        .bright_white()
        .bold()
    );
    for job in jobs {
        println!(
            "{:<34} {:<18} {:>5} {:>11}  {}",
            job.job_id,
            colored_state(job.state),
            job.max_depth,
            format!("{}/{}", job.completed, job.total_discovered),
            job.origins.join(", ")
        );
    }
    Ok(())
}

// ============================================================================
// graph
// ============================================================================

/// Aggregates a finished job (once) and renders its report.
pub async fn graph_report(db_path: &Path, job_id: &str, format: ReportFormat) -> Result<String> {
    let db = open_existing(db_path)?;
    let store = SqliteStore::new(db);
    aggregate::create_graph(&store, job_id).await?;
    drop(store);

    let db = open_existing(db_path)?;
    let data = gather_report_data(&db, job_id)?
        .ok_or_else(|| CrawlError::NotFound(job_id.to_string()))?;
    Ok(generate_report(&data, format)?)
}

pub async fn handle_graph(args: &ArgMatches) -> Result<()> {
    let job_id = args
        .get_one::<String>("JOB_ID")
        .context("a job ID is required")?;
    let format_name = args
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("text");
    let format = ReportFormat::from_str(format_name)
        .with_context(|| format!("unknown report format '{}'", format_name))?;

    let report = graph_report(&db_path_arg(args), job_id, format).await?;

    match args.get_one::<PathBuf>("output") {
        Some(path) => {
            save_report(&report, path)?;
            println!(
                "{} Report saved to {}",
                "✓".green().bold(),
                path.display().to_string().bright_white()
            );
        }
        None => print!("{}", report),
    }
    Ok(())
}

// ============================================================================
// cancel
// ============================================================================

/// Marks a stored job cancelled. Terminal jobs are left untouched.
pub fn cancel_job(db_path: &Path, job_id: &str) -> Result<CrawlJob> {
    let db = open_existing(db_path)?;
    let mut job = db
        .get_job(job_id)?
        .ok_or_else(|| CrawlError::NotFound(job_id.to_string()))?;
    job.transition(JobState::Cancelled)?;
    db.update_job(&job)?;
    Ok(job)
}

pub fn handle_cancel(args: &ArgMatches) -> Result<()> {
    let job_id = args
        .get_one::<String>("JOB_ID")
        .context("a job ID is required")?;
    let job = cancel_job(&db_path_arg(args), job_id)?;
    println!(
        "{} Job {} is now {}",
        "✓".green().bold(),
        job.job_id,
        colored_state(job.state)
    );
    Ok(())
}

fn db_path_arg(args: &ArgMatches) -> PathBuf {
    match args.get_one::<String>("db") {
        Some(path) => expand_path(path),
        None => expand_path(&default_db_path()),
    }
}
