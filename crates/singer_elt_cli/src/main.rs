mod error;
mod logging;
mod run;
mod validate;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "singer-elt")]
#[command(about = "Run Singer taps into targets, optionally through a mapper")]
#[command(version)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline described by a TOML file.
    Run(run::Args),
    /// Resolve a pipeline file and print the command line of every stage.
    Validate(validate::Args),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let result = match cli.command {
        Command::Run(args) => run::run(args).await,
        Command::Validate(args) => validate::run(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}
