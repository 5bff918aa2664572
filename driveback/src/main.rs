mod archive;
mod config;
mod drive;
mod files;
mod folders;
mod resolver;
mod rotation;
mod session;
#[cfg(test)]
mod testutil;

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use driveback_common::query::Query;
use driveback_common::store::TransferProgress;
use driveback_common::DriveError;

use archive::TarArchiver;
use config::Config;
use drive::DriveClient;
use resolver::Located;
use session::Session;

const DEFAULT_CONFIG_PATH: &str = "driveback.toml";

#[derive(Parser, Debug)]
#[command(name = "driveback")]
#[command(about = "Path-based file operations and rotating backups on Google Drive", long_about = None)]
struct Cli {
    /// Config file [default: driveback.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive directories and upload them to the backup folder
    Backup {
        /// Remote backup folder
        #[arg(short = 'b', long)]
        folder: Option<String>,
        /// Number of archives to keep per directory
        #[arg(short = 'k', long)]
        keepfiles: Option<usize>,
        /// Absolute path to leave out of the archives (repeatable)
        #[arg(short = 'e', long = "exclude")]
        exclude: Vec<PathBuf>,
        #[arg(required = true)]
        directories: Vec<PathBuf>,
    },
    /// List nodes matching a raw store query, trashed ones included
    List {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long)]
        exclude_trashed: bool,
        /// Download every listed file
        #[arg(short, long)]
        download: bool,
        #[arg(long, default_value = ".")]
        dest: PathBuf,
        /// Move every listed node to the trash (after downloading, if asked)
        #[arg(long)]
        delete: bool,
        /// With --delete, remove permanently instead of trashing
        #[arg(long, requires = "delete")]
        hard: bool,
    },
    /// List the children of a folder whose name matches a pattern
    Filter {
        /// `/folder/path/<regex>`
        pattern: String,
        #[arg(long)]
        include_trashed: bool,
        /// Download every matching file
        #[arg(short, long)]
        download: bool,
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },
    /// Download a file by id
    Download {
        id: String,
        #[arg(long, default_value = ".")]
        dest: PathBuf,
        /// Local file name [default: the remote name]
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete the node at a path
    DeletePath {
        path: String,
        /// Remove permanently instead of moving to the trash
        #[arg(long)]
        hard: bool,
    },
    /// Delete a node by id
    DeleteId {
        id: String,
        #[arg(long)]
        hard: bool,
    },
    /// Create a folder path, including missing parents
    Mkdir { path: String },
    /// Upload a local file into a folder
    Upload {
        file: PathBuf,
        #[arg(short, long, default_value = "/")]
        parent: String,
        #[arg(long)]
        allow_duplicate: bool,
    },
}

fn init_tracing(log_file: Option<&Path>, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn log_progress(p: TransferProgress) {
    match p.percent() {
        Some(pct) => debug!(transferred = p.transferred, "{}%", pct),
        None => debug!(transferred = p.transferred, "Transferring"),
    }
}

fn print_located(item: &Located) {
    let suffix = if item.node.is_folder() { "/" } else { "" };
    let size = item
        .node
        .size
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}{}\t{}\t{}\t{}",
        item.path,
        suffix,
        item.node.id,
        size,
        item.node.modified_time.to_rfc3339()
    );
}

/// Download every file among `items` into `dest`, moving past failures.
/// Returns the ids that could not be downloaded.
async fn download_listed(session: &Session, items: &[Located], dest: &Path) -> HashSet<String> {
    let mut failed = HashSet::new();
    for item in items.iter().filter(|i| !i.node.is_folder()) {
        match files::download_by_id(session, item.id(), dest, None, &mut log_progress).await {
            Ok((path, _)) => println!("{}\t-> {}", item.path, path.display()),
            Err(e) => {
                warn!(path = %item.path, error = %e, "Download failed");
                failed.insert(item.node.id.clone());
            }
        }
    }
    failed
}

/// Delete every node among `items` whose id is not in `skip`. Returns the
/// number of deletions that failed.
async fn delete_listed(session: &Session, items: &[Located], trash: bool, skip: &HashSet<String>) -> usize {
    let mut failures = 0;
    for item in items.iter().filter(|i| !skip.contains(&i.node.id)) {
        match files::delete_by_id(session, item.id(), trash).await {
            Ok(removed) => println!("{}\t{}", if trash { "trashed" } else { "deleted" }, removed.path),
            Err(e) => {
                warn!(path = %item.path, error = %e, "Delete failed");
                failures += 1;
            }
        }
    }
    failures
}

/// Expand a leading `~` and make the path absolute without trailing slashes.
fn local_directory(path: &Path) -> anyhow::Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            PathBuf::from(home).join(rest)
        }
        Err(_) => path.to_path_buf(),
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(expanded)
    };
    Ok(absolute.components().collect())
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let token = config.access_token()?;
    let client = DriveClient::new(&config.api_url, &config.upload_url, &token);
    let session = Session::open(Box::new(client))
        .await
        .context("Failed to reach the drive")?;

    match cli.command {
        Command::Backup {
            folder,
            keepfiles,
            exclude,
            directories,
        } => {
            let mut backup = config.backup.clone();
            if let Some(folder) = folder {
                backup.folder = folder;
            }
            if let Some(keepfiles) = keepfiles {
                backup.keepfiles = keepfiles;
            }
            if !exclude.is_empty() {
                backup.exclude = exclude;
            }
            backup.validate()?;

            let directories = directories
                .iter()
                .map(|d| local_directory(d))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let report = rotation::run_backup(
                &session,
                &TarArchiver::default(),
                &backup.plan(),
                &directories,
            )
            .await?;

            for u in &report.uploaded {
                let size = u.size.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string());
                println!("uploaded\t{}\t{}\t{} bytes", u.directory.display(), u.path, size);
            }
            for u in &report.unchanged {
                println!("unchanged\t{}\t{}", u.directory.display(), u.path);
            }
            for m in &report.missing {
                println!("missing\t{}", m.display());
            }
            for f in &report.failed {
                println!("failed\t{}\t{}", f.directory.display(), f.error);
            }
            for p in &report.pruned {
                println!("pruned\t{}", p);
            }
            for f in &report.prune_failed {
                println!("prune-failed\t{}\t{}", f.path, f.error);
            }
        }
        Command::List {
            query,
            exclude_trashed,
            download,
            dest,
            delete,
            hard,
        } => {
            let query = match query {
                Some(q) => Query::new().raw(&q),
                None => Query::new(),
            };
            let items = resolver::list_by_predicate(&session, &query, !exclude_trashed).await?;
            for item in &items {
                print_located(item);
            }
            let failed_downloads = if download {
                download_listed(&session, &items, &dest).await
            } else {
                HashSet::new()
            };
            let failed_deletes = if delete {
                delete_listed(&session, &items, !hard, &failed_downloads).await
            } else {
                0
            };
            if !failed_downloads.is_empty() || failed_deletes > 0 {
                anyhow::bail!(
                    "{} downloads and {} deletions failed",
                    failed_downloads.len(),
                    failed_deletes
                );
            }
        }
        Command::Filter {
            pattern,
            include_trashed,
            download,
            dest,
        } => {
            let matches = resolver::filter_by_pattern(&session, &pattern, include_trashed).await?;
            for item in &matches {
                print_located(item);
            }
            if download {
                let failed = download_listed(&session, &matches, &dest).await;
                if !failed.is_empty() {
                    anyhow::bail!("{} of {} downloads failed", failed.len(), matches.len());
                }
            }
        }
        Command::Download { id, dest, name } => {
            let (path, node) =
                files::download_by_id(&session, &id, &dest, name.as_deref(), &mut log_progress).await?;
            println!("{}\t{}", node.name, path.display());
        }
        Command::DeletePath { path, hard } => {
            let removed = files::delete_by_path(&session, &path, !hard).await?;
            println!("{}\t{}", removed.path, removed.node.id);
        }
        Command::DeleteId { id, hard } => {
            let removed = files::delete_by_id(&session, &id, !hard).await?;
            println!("{}\t{}", removed.path, removed.node.id);
        }
        Command::Mkdir { path } => {
            let folder = folders::create_folder_path(&session, &path).await?;
            println!("{}/\t{}", folder.path.trim_end_matches('/'), folder.node.id);
        }
        Command::Upload {
            file,
            parent,
            allow_duplicate,
        } => {
            let uploaded = files::upload_to_path(
                &session,
                &file,
                &parent,
                allow_duplicate,
                None,
                &mut log_progress,
            )
            .await?;
            info!(path = %uploaded.path, "Upload complete");
            println!("{}\t{}", uploaded.path, uploaded.node.id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path, true),
        None => Config::load(Path::new(DEFAULT_CONFIG_PATH), false),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("driveback: {:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = init_tracing(config.log_file.as_deref(), cli.verbose) {
        eprintln!("driveback: {:#}", e);
        return ExitCode::from(2);
    }

    let logs_to_file = config.log_file.is_some();
    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {:#}", e);
            if logs_to_file {
                eprintln!("driveback: {:#}", e);
            }
            let aborted = e
                .downcast_ref::<DriveError>()
                .map_or(false, DriveError::aborts_run);
            if aborted {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
