mod cli;
mod commands;
mod error;
mod fleet;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use edgesync_config::{LogFormat, LoggingSection};

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Dispatch and handle errors with proper exit codes
    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, logging: &LoggingSection) {
    let filter = match verbosity {
        0 => logging.level.as_deref().unwrap_or("warn"),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    // Shell completions need neither config nor fleet state
    if let Command::Completions(args) = &cli.command {
        use clap::CommandFactory;
        use clap_complete::generate;

        let mut cmd = Cli::command();
        generate(args.shell, &mut cmd, "edgesync", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = edgesync_config::load_config(cli.global.config.as_deref())?;
    init_tracing(cli.global.verbose, &cfg.logging);

    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(args, &cfg, &cli.global),
        cmd => commands::dispatch(cmd, &cfg, &cli.global).await,
    }
}
