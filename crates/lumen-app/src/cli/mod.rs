use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Default, Parser)]
#[command(
    name = "lumen",
    version,
    about = "Image ingestion, staged artifact commits and streaming retrieval"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the lumen HTTP/WebSocket server.
    Serve(ServeArgs),
    /// Inspect committed artifact sets.
    Sets(SetsArgs),
    /// Cross-check durable artifacts, the catalog and pending staging areas.
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct SetsArgs {
    #[command(subcommand)]
    pub command: SetsCommands,
}

#[derive(Debug, Subcommand)]
pub enum SetsCommands {
    /// Print committed sets as JSON lines, newest first.
    List(SetsListArgs),
}

#[derive(Debug, Args)]
pub struct SetsListArgs {
    /// Print at most this many sets.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    /// Emit the report as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
    /// Exit with an error when orphaned or missing files are found.
    #[arg(long)]
    pub strict: bool,
}
