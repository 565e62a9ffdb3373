use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod commands;
mod exit_codes;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "ddalab_lsl=info",
        1 => "ddalab_lsl=debug",
        _ => "ddalab_lsl=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let exit_code = match cli.command {
        cli::Command::List(args) => commands::list::execute(args),
        cli::Command::Send(args) => commands::send::execute(args),
        cli::Command::Receive(args) => commands::receive::execute(args),
    };

    std::process::exit(exit_code);
}
