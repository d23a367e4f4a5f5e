use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use stepsync::{
    ArchiveBuilder, ArchiveConfig, DownloadConfig, Downloader, DumpConfig, Dumper, ExtractConfig,
    Extractor, RestoreConfig, Restorer, Session, SessionStatus, StepError, StepStatus,
};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stepsync")]
#[command(about = "Resumable, stepwise database dumps, zip archives and downloads", long_about = None)]
#[command(version)]
struct Args {
    /// Directory holding session working directories
    #[arg(long, global = true, default_value = ".stepsync")]
    root: PathBuf,

    /// Session id; re-running with the same id resumes an interrupted job
    #[arg(short, long, global = true)]
    session: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump a SQLite database into a statement log
    Dump {
        /// SQLite database file
        db: PathBuf,
        /// Output directory for backup.sql.jsonl
        #[arg(short, long)]
        output: PathBuf,
        /// Rows per step
        #[arg(long, default_value_t = 1000)]
        chunk_size: u64,
        /// Table prefix of the source database, recorded for the restorer
        /// and applied to --exclude names
        #[arg(long, default_value = "")]
        prefix: String,
        /// Unprefixed table names to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
    /// Replay a statement log into a SQLite database
    Restore {
        /// Path of backup.sql.jsonl
        dump: PathBuf,
        /// Target SQLite database file
        db: PathBuf,
        /// Lines per step
        #[arg(long, default_value_t = 1000)]
        line_budget: u64,
        /// Table prefix of the target database
        #[arg(long, default_value = "")]
        prefix: String,
        /// Unprefixed name of the options table (restored as upserts)
        #[arg(long, default_value = "options")]
        options_table: String,
        /// Unprefixed table names to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
    /// Archive a directory into size-capped zip parts
    Archive {
        /// Directory to archive
        source: PathBuf,
        /// Path of the first part, e.g. backup.zip
        #[arg(short, long)]
        output: PathBuf,
        /// Files per step
        #[arg(long, default_value_t = 100)]
        chunk_size: usize,
        /// Maximum bytes per part
        #[arg(long, default_value_t = 2 * 1024 * 1024 * 1024)]
        max_part_size: u64,
        /// Store files without compression
        #[arg(long)]
        store_only: bool,
        /// Top-level names to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
    /// Extract a zip archive in batches
    Extract {
        /// Zip archive
        archive: PathBuf,
        /// Destination directory
        #[arg(short, long)]
        output: PathBuf,
        /// Entries per step
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        /// Replace files that already exist
        #[arg(long)]
        overwrite: bool,
        /// Only extract these top-level names (comma-separated)
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,
        /// Top-level names to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
    /// Download a remote file in byte-range chunks
    Download {
        /// Remote URL
        url: String,
        /// Final file path
        #[arg(short, long)]
        output: PathBuf,
        /// Bytes per step
        #[arg(long, default_value_t = 5 * 1024 * 1024)]
        chunk_size: u64,
        /// Per-request timeout, e.g. "30s"
        #[arg(long, default_value = "30s")]
        timeout: humantime::Duration,
        /// Attempts per chunk after the first failure
        #[arg(long, default_value_t = 5)]
        retries: usize,
        /// Delay between attempts, e.g. "10s"
        #[arg(long, default_value = "10s")]
        retry_delay: humantime::Duration,
        /// Skip the ETag checksum check
        #[arg(long)]
        skip_verify: bool,
        /// Keep the chunk directory after merging
        #[arg(long)]
        keep_chunks: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("stepsync={}", log_level))
        .init();

    let started = Instant::now();
    let result = run(args).await;
    let elapsed = humantime::format_duration(Duration::from_secs(started.elapsed().as_secs()));
    match result {
        Ok(()) => {
            info!("✅ Finished in {}", elapsed);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Error after {}: {:#}", elapsed, e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let root = args.root;
    let requested_id = args.session;
    let id = |default: &str| requested_id.clone().unwrap_or_else(|| default.to_string());

    match args.command {
        Command::Dump {
            db,
            output,
            chunk_size,
            prefix,
            exclude,
        } => {
            let conn = rusqlite::Connection::open(&db)
                .with_context(|| format!("opening database {}", db.display()))?;
            let (mut session, resume) = open_session(&root, &id("dump"), &db, &output)?;
            let config = DumpConfig {
                chunk_size,
                table_prefix: prefix,
            };
            let dumper = Dumper::new(session.clone(), &conn, config);
            let result: Result<StepStatus, StepError> = (|| {
                let first = if resume {
                    None
                } else {
                    Some(dumper.start(&exclude)?)
                };
                let status = drive("🗄️  Dumping rows", first, || dumper.step())?;
                dumper.finish()?;
                Ok(status)
            })();
            settle(&mut session, result)?;
            info!("📄 Dump written to {}", dumper.dump_path().display());
        }
        Command::Restore {
            dump,
            db,
            line_budget,
            prefix,
            options_table,
            exclude,
        } => {
            let mut conn = rusqlite::Connection::open(&db)
                .with_context(|| format!("opening database {}", db.display()))?;
            let (mut session, resume) = open_session(&root, &id("restore"), &dump, &db)?;
            let config = RestoreConfig {
                line_budget,
                table_prefix: prefix,
                options_table,
                exclude_tables: exclude,
            };
            let mut restorer = Restorer::new(session.clone(), &mut conn, config);
            let result: Result<StepStatus, StepError> = (|| {
                let first = if resume { None } else { Some(restorer.start()?) };
                let status = drive("🔄 Restoring statements", first, || restorer.step())?;
                restorer.finish()?;
                Ok(status)
            })();
            settle(&mut session, result)?;
        }
        Command::Archive {
            source,
            output,
            chunk_size,
            max_part_size,
            store_only,
            exclude,
        } => {
            let (mut session, resume) = open_session(&root, &id("archive"), &source, &output)?;
            let config = ArchiveConfig {
                chunk_size,
                max_part_size,
                store_only,
            };
            let builder = ArchiveBuilder::new(session.clone(), config);
            let result: Result<StepStatus, StepError> = (|| {
                let first = if resume {
                    None
                } else {
                    Some(builder.start(&source, &exclude)?)
                };
                drive("📦 Archiving files", first, || builder.step())
            })();
            let status = settle(&mut session, result)?;
            for part in &status.parts {
                info!("📦 Part {}", part.display());
            }
        }
        Command::Extract {
            archive,
            output,
            batch_size,
            overwrite,
            include,
            exclude,
        } => {
            let (mut session, _) = open_session(&root, &id("extract"), &archive, &output)?;
            let config = ExtractConfig {
                batch_size,
                overwrite_existing: overwrite,
                include,
                exclude,
            };
            let extractor = Extractor::new(session.clone(), config);
            let result = drive("📂 Extracting entries", None, || extractor.step());
            settle(&mut session, result)?;
        }
        Command::Download {
            url,
            output,
            chunk_size,
            timeout,
            retries,
            retry_delay,
            skip_verify,
            keep_chunks,
        } => {
            let (mut session, resume) =
                open_session(&root, &id("download"), Path::new(&url), &output)?;
            let config = DownloadConfig {
                chunk_size,
                request_timeout: timeout.into(),
                verify_checksum: !skip_verify,
            };
            let downloader = Downloader::new(session.clone(), config)?;
            let result = download(
                &downloader,
                &url,
                chunk_size,
                resume,
                retries,
                retry_delay.into(),
            )
            .await;
            let result = match result {
                Ok(status) if !keep_chunks => downloader.cleanup(true).await.map(|_| status),
                other => other,
            };
            settle(&mut session, result)?;
            info!("⬇️  Saved {}", downloader.final_path().display());
        }
    }
    Ok(())
}

/// Reopens an unfinished session for the same job, or creates a fresh one.
fn open_session(
    root: &Path,
    id: &str,
    source: &Path,
    destination: &Path,
) -> anyhow::Result<(Session, bool)> {
    let source = source.to_string_lossy().to_string();
    let destination = destination.to_string_lossy().to_string();

    if let Some(mut existing) = Session::open(root, id)? {
        let resumable = existing.source == source
            && existing.destination == destination
            && existing.status != SessionStatus::Completed
            && existing.progress_store().path().exists();
        if resumable {
            info!("♻️  Resuming session {}", id);
            existing.set_status(SessionStatus::Running)?;
            return Ok((existing, true));
        }
    }

    let mut session = Session::new(root, id, source, destination)?;
    session.progress_store().delete()?;
    session.set_status(SessionStatus::Running)?;
    Ok((session, false))
}

/// Records the outcome of a job on its session.
fn settle(session: &mut Session, result: Result<StepStatus, StepError>) -> anyhow::Result<StepStatus> {
    match result {
        Ok(status) => {
            session.set_status(SessionStatus::Completed)?;
            session.log("completed")?;
            Ok(status)
        }
        Err(e) => {
            session.set_status(SessionStatus::Failed)?;
            session.log(&format!("failed: {}", e))?;
            Err(e.into())
        }
    }
}

fn progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}",
    ) {
        pb.set_style(style.progress_chars("█▓▒░ "));
    }
    pb.set_message(message.to_string());
    pb
}

fn update(pb: &ProgressBar, status: &StepStatus) {
    pb.set_length(status.total_units);
    pb.set_position(status.done_units);
    for error in &status.errors {
        pb.suspend(|| warn!("{}", error));
    }
}

/// Calls `step` until it reports done.
fn drive(
    message: &str,
    first: Option<StepStatus>,
    mut step: impl FnMut() -> Result<StepStatus, StepError>,
) -> Result<StepStatus, StepError> {
    let pb = progress_bar(message);
    if let Some(status) = first {
        update(&pb, &status);
        if status.done {
            pb.finish();
            return Ok(status);
        }
    }
    loop {
        match step() {
            Ok(status) => {
                update(&pb, &status);
                if status.done {
                    pb.finish();
                    return Ok(status);
                }
            }
            Err(e) => {
                pb.abandon_with_message("❌ Failed");
                return Err(e);
            }
        }
    }
}

async fn download(
    downloader: &Downloader,
    url: &str,
    chunk_size: u64,
    resume: bool,
    retries: usize,
    retry_delay: Duration,
) -> Result<StepStatus, StepError> {
    let pb = progress_bar("⬇️  Downloading");
    let mut status = if resume {
        downloader.status()?
    } else {
        downloader.start_download(url, chunk_size).await?
    };
    update(&pb, &status);

    while !status.done {
        let retry_strategy =
            FixedInterval::from_millis(retry_delay.as_millis() as u64).take(retries);
        let result = Retry::spawn(retry_strategy, move || async move {
            match downloader.process_step().await {
                Ok(status) => Ok(status),
                Err(e) if e.is_retryable() => {
                    warn!("Step of {} failed, retrying: {}", url, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        })
        .await;
        match result {
            Ok(next) => {
                status = next;
                update(&pb, &status);
            }
            Err(e) => {
                pb.abandon_with_message("❌ Download failed!");
                return Err(e);
            }
        }
    }
    pb.finish_with_message("✅ Download complete");
    Ok(status)
}
