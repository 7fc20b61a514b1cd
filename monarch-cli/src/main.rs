//! The `monarch` command.
//!
//! ```text
//! monarch init
//! monarch create add_users_table
//! monarch migrate
//! monarch reapply 20240101000000AddUsersTable.lua
//! monarch status
//! ```
//!
//! `DATABASE_URL` and `MIGRATIONS_PATH` are read from the environment (or a
//! `.env` file) unless given as flags.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use monarch::{Migrator, RunContext};
use postgres::{Client, NoTls};
use tracing::Level;

#[derive(Parser)]
#[command(name = "monarch", version, about = "PostgreSQL migrations written in Lua")]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Directory holding template.lua and the migration scripts
    #[arg(long, env = "MIGRATIONS_PATH", global = true)]
    migrations_path: Option<PathBuf>,

    /// Abort the run after this many seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Log library events to stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the migrations directory and its default template
    Init,
    /// Run every migration that has not been run yet
    Migrate,
    /// Create a new migration file from the template
    Create {
        /// Migration name, letters, digits and underscores only (add_users_table)
        name: String,
    },
    /// Run an already applied migration again
    Reapply {
        /// Migration file name, with or without the .lua extension
        name: String,
    },
    /// List migrations and when they were applied
    Status,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let migrations_path = cli
        .migrations_path
        .clone()
        .ok_or("provide a migrations path via --migrations-path or the MIGRATIONS_PATH env var")?;
    let migrator = progress_reporting(Migrator::new(migrations_path));

    let ctx = match cli.timeout {
        Some(seconds) => RunContext::new().with_timeout(Duration::from_secs(seconds)),
        None => RunContext::new(),
    };

    match &cli.command {
        Commands::Init => {
            migrator.init_directory()?;
            println!("initialized {}", migrator.directory().display());
        }
        Commands::Create { name } => {
            let path = migrator.create(name, Utc::now())?;
            println!("created {}", path.display());
        }
        Commands::Migrate => {
            let mut client = connect(&cli)?;
            println!("running migrations");
            let report = migrator.migrate(&mut client, &ctx)?;
            if report.applied.is_empty() && report.skipped == 0 {
                println!("no migrations to run");
            }
        }
        Commands::Reapply { name } => {
            let mut client = connect(&cli)?;
            migrator.reapply(&mut client, &ctx, name)?;
        }
        Commands::Status => {
            let mut client = connect(&cli)?;
            let statuses = migrator.status(&mut client)?;
            if statuses.is_empty() {
                println!("no migrations in {}", migrator.directory().display());
            }
            for status in statuses {
                match status.record {
                    Some(record) => println!(
                        "applied  {}  migrated {}  last applied {}",
                        status.file,
                        record.migrated_at.to_rfc3339(),
                        record.last_applied_at.to_rfc3339()
                    ),
                    None => println!("pending  {}", status.file),
                }
            }
        }
    }

    Ok(())
}

fn connect(cli: &Cli) -> Result<Client, Box<dyn std::error::Error>> {
    let url = cli
        .database_url
        .as_deref()
        .ok_or("provide a database URL via --database-url or the DATABASE_URL env var")?;
    Ok(Client::connect(url, NoTls)?)
}

/// Print the progress lines users see on stdout.
fn progress_reporting(migrator: Migrator) -> Migrator {
    migrator
        .on_migration_start(|name| {
            print!("running {}... ", name);
            let _ = std::io::stdout().flush();
        })
        .on_migration_complete(|_, _| println!("done"))
        .on_migration_error(|_, _| println!("failed"))
        .on_migration_skipped(|name| println!("skipping previously migrated {}", name))
        .on_migrations_skipped(|count| println!("skipped {} previously migrated migrations", count))
}
