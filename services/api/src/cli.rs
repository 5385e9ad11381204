use crate::demo::{run_demo, run_legacy_lookup, DemoArgs, LegacyLookupArgs};
use crate::server;
use catechese::error::AppError;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "Catechese",
    about = "Run and demonstrate the parish catechism enrollment assistant",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Inspect the historical register
    Legacy {
        #[command(subcommand)]
        command: LegacyCommand,
    },
    /// Replay scripted parent conversations against an in-memory engine
    Demo(DemoArgs),
}

#[derive(Subcommand, Debug)]
enum LegacyCommand {
    /// Find a parent by phone number and suggest classes for their children
    Lookup(LegacyLookupArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Legacy {
            command: LegacyCommand::Lookup(args),
        } => run_legacy_lookup(args),
        Command::Demo(args) => run_demo(args).await,
    }
}
