//! # regsync CLI
//!
//! The `regsync` binary drives the mirror: database initialization, site
//! crawling, reference resolution, and status reporting.
//!
//! ## Usage
//!
//! ```bash
//! regsync --config ./config/regsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `regsync init` | Create the SQLite database and run schema migrations |
//! | `regsync crawl` | Crawl every enabled site and mirror new records |
//! | `regsync crawl --site <name>` | Crawl a single site |
//! | `regsync resolve` | Link unresolved external references to registry identities |
//! | `regsync status` | Report mirror, resolution, and checkpoint state |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use regsync::{config, crawl, migrate, resolve, status};

/// regsync — mirror lab-site records and resolve their patient references
/// against the canonical registry.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/regsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "regsync",
    about = "Mirror lab-site records and resolve external patient references",
    version,
    long_about = "regsync crawls token-authenticated lab sites, mirrors their patient and case \
    records into SQLite with content-fingerprint deduplication, and resolves the loosely-keyed \
    patient references they carry to canonical registry identities via multi-pass matching."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/regsync.toml`. All database, site, and
    /// matching settings are read from this file.
    #[arg(long, global = true, default_value = "./config/regsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Crawl remote sites and mirror their records.
    ///
    /// Sites crawl in parallel, one worker per site; within a site requests
    /// are sequential and rate-limited. Interrupted runs resume from
    /// checkpoints, and already-mirrored (patient, case) pairs are skipped
    /// unless `--full` is given.
    Crawl {
        /// Crawl only this site (as named in the config).
        #[arg(long)]
        site: Option<String>,

        /// Ignore checkpoints and known pairs — refetch everything.
        #[arg(long)]
        full: bool,
    },

    /// Resolve external references against the canonical registry.
    ///
    /// Runs the configured matching passes in order, strictest first.
    /// A reference is assigned at most once; already-resolved rows are
    /// never revisited.
    Resolve,

    /// Report mirror, resolution, and checkpoint state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl { site, full } => {
            crawl::run_crawl(&cfg, site.as_deref(), full).await?;
        }
        Commands::Resolve => {
            resolve::run_resolve(&cfg).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}
