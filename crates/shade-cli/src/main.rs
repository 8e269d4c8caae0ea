mod cli;
mod commands;
mod watcher;

use std::process::ExitCode;

use clap::Parser;
use cli::{CliArgs, Command};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    tracing::debug!("shade v{}", env!("CARGO_PKG_VERSION"));

    let result = match &args.command {
        Command::Build { effect, out, watch } => {
            if *watch {
                commands::build_watch(effect, out)
            } else {
                commands::build(effect, out)
            }
        }
        Command::Run {
            effect,
            input,
            output,
            width,
            height,
            set,
            overrides,
        } => {
            let opts = commands::RunOptions {
                input,
                output,
                output_size: width.zip(*height).map(|(w, h)| [w, h]),
                parameters: set,
                overrides,
            };
            commands::run(effect, &opts)
        }
        Command::Check { effect, format } => commands::check(effect, *format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
