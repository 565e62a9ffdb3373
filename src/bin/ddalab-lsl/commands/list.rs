use super::{cancel_on_ctrl_c, fail};
use crate::cli::ListArgs;
use crate::exit_codes;
use anyhow::Context;
use ddalab_lsl::{Predicate, ResolveTimeout, ResolvedStream, Transport};
use std::time::Duration;

pub fn execute(args: ListArgs) -> i32 {
    match run(args) {
        Ok(code) => code,
        Err(e) => fail(e),
    }
}

fn run(args: ListArgs) -> anyhow::Result<i32> {
    let predicate = Predicate::parse(args.predicate.as_deref().unwrap_or(""))?;

    let transport = Transport::from_env().context("Failed to start transport")?;
    let cancel = cancel_on_ctrl_c(&transport.runtime_handle()?);
    let streams = transport.resolve_with_cancel(
        &predicate,
        usize::MAX,
        ResolveTimeout::After(Duration::from_millis(args.wait_ms)),
        &cancel,
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&streams)?);
    } else if streams.is_empty() {
        println!("No streams found");
    } else {
        print_table(&streams);
    }

    Ok(exit_codes::SUCCESS)
}

fn print_table(streams: &[ResolvedStream]) {
    println!(
        "{:<20} {:<12} {:>8} {:>12} {:<10} {:<22} {:<16}",
        "NAME", "TYPE", "CHANNELS", "RATE", "FORMAT", "ENDPOINT", "SOURCE ID"
    );
    for stream in streams {
        let d = &stream.descriptor;
        println!(
            "{:<20} {:<12} {:>8} {:>12} {:<10} {:<22} {:<16}",
            d.name(),
            d.content_type(),
            d.channel_count(),
            d.nominal_rate().to_string(),
            d.encoding(),
            stream.endpoint.to_string(),
            d.source_id()
        );
    }
}
