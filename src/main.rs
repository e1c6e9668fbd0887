use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use gleaner::config::{DataDirs, RuntimeEnv};
use gleaner::core::Core;
use gleaner::storage::DatabaseError;

/// Exit codes: 0 clean, 1 configuration or I/O fatal, 2 schema
/// incompatibility.
const EXIT_FATAL: i32 = 1;
const EXIT_SCHEMA: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "gleaner", about = "Personal RSS/Atom aggregator core")]
struct Args {
    /// Data directory (overrides the DATA_DIR environment variable)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Delete old articles and exit: AGE_DAYS[,MAX_SIZE_BYTES]
    #[arg(long, value_name = "SPEC")]
    cleanup: Option<String>,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            // Schema incompatibility gets its own exit code so wrappers can
            // tell "upgrade the binary" apart from ordinary failures.
            let code = if e
                .downcast_ref::<DatabaseError>()
                .is_some_and(|db_err| matches!(db_err, DatabaseError::SchemaIncompatible { .. }))
            {
                EXIT_SCHEMA
            } else {
                EXIT_FATAL
            };
            eprintln!("Error: {:#}", e);
            code
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let env = RuntimeEnv::from_env()?;

    // DEBUG=1 turns on verbose logging unless RUST_LOG says otherwise.
    let default_filter = if env.debug { "gleaner=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let dirs = match args.data_dir {
        Some(dir) => DataDirs::at(dir),
        None => DataDirs::resolve()?,
    };
    dirs.ensure()?;
    tracing::info!(data_dir = %dirs.root.display(), "Using data directory");

    if args.reset_db && dirs.db_path.exists() {
        std::fs::remove_file(&dirs.db_path)?;
        println!("Database reset.");
    }

    let core = Core::start(&dirs).await?;

    if let Some(spec) = args.cleanup {
        let (age, size) = parse_cleanup_spec(&spec)?;
        let deleted = core.cleanup(age, size).await?;
        println!("Cleanup removed {} articles.", deleted);
        core.shutdown().await;
        return Ok(());
    }

    if let (Some(host), Some(port)) = (&env.host, env.port) {
        // The HTTP transport itself lives outside this crate; the embedding
        // server binds these and calls into `Core`.
        tracing::info!(host = %host, port = port, "API transport configured by environment");
    }

    tracing::info!("gleaner core running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    core.shutdown().await;

    Ok(())
}

fn parse_cleanup_spec(spec: &str) -> Result<(i64, u64)> {
    let mut parts = spec.splitn(2, ',');
    let age: i64 = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("--cleanup expects AGE_DAYS[,MAX_SIZE_BYTES], got {:?}", spec))?;
    let size: u64 = match parts.next() {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid MAX_SIZE_BYTES in --cleanup: {:?}", raw))?,
        None => 0,
    };
    Ok((age, size))
}
