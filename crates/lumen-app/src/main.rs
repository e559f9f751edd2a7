use std::process;

use lumen_app::cli::{AuditArgs, Cli, Commands, SetsArgs, SetsCommands, SetsListArgs};
use lumen_app::config::{self, StorageBackend};
use lumen_app::error::AppError;
use lumen_app::server;
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            server::run(config).await?;
        }
        Some(Commands::Sets(SetsArgs {
            command: SetsCommands::List(args),
        })) => {
            run_sets_list(args).await?;
        }
        Some(Commands::Audit(args)) => {
            run_audit(args).await?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}

async fn run_sets_list(args: SetsListArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let store = server::build_store(&cfg)?;
    let items = store.list_committed().await?;
    let limit = args.limit.unwrap_or(usize::MAX);
    for item in items.iter().take(limit) {
        println!("{}", serde_json::to_string(item)?);
    }
    tracing::debug!(total = items.len(), "listed committed sets");
    Ok(())
}

async fn run_audit(args: AuditArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    if cfg.storage.backend != StorageBackend::Local {
        return Err(AppError::AuditRequiresLocalStore);
    }
    let store = server::open_local_store(&cfg)?;
    let report = store.audit().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("committed sets: {}", report.committed);
        println!("pending sets:   {}", report.pending_sets.len());
        for set_id in &report.pending_sets {
            println!("  pending {set_id}");
        }
        println!("orphaned files: {}", report.orphaned_files.len());
        for path in &report.orphaned_files {
            println!("  orphan {}", path.display());
        }
        println!("missing files:  {}", report.missing_files.len());
        for missing in &report.missing_files {
            println!("  missing {} ({})", missing.path.display(), missing.set_id);
        }
    }

    if args.strict && !report.is_consistent() {
        return Err(AppError::AuditInconsistent {
            orphaned: report.orphaned_files.len(),
            missing: report.missing_files.len(),
        });
    }
    Ok(())
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        Some(Commands::Sets(_)) | Some(Commands::Audit(_)) => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        None => LevelFilter::WARN,
    }
}
