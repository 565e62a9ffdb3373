use super::{cancel_on_ctrl_c, fail, stream_layout};
use crate::cli::ReceiveArgs;
use crate::exit_codes;
use anyhow::Context;
use ddalab_lsl::{InletOptions, ResolveTimeout, Transport};
use std::io::Write;
use std::time::Duration;
use tracing::info;

pub fn execute(args: ReceiveArgs) -> i32 {
    match run(args) {
        Ok(code) => code,
        Err(e) => fail(e),
    }
}

fn run(args: ReceiveArgs) -> anyhow::Result<i32> {
    let encoding = stream_layout(&args.format, args.channels)?;
    let timeout = match args.timeout_secs {
        Some(secs) => ResolveTimeout::from_secs_f64(secs),
        None => ResolveTimeout::Forever,
    };
    let options = InletOptions::default()
        .with_buffer_seconds(args.buffer_seconds)
        .with_recover(!args.no_recover);

    let transport = Transport::from_env().context("Failed to start transport")?;
    let cancel = cancel_on_ctrl_c(&transport.runtime_handle()?);

    let inlet = match transport.resolve_and_open_inlet_with_cancel(
        &args.name,
        &args.content_type,
        args.channels,
        encoding,
        timeout,
        options,
        &cancel,
    )? {
        Some(inlet) => inlet,
        None => {
            eprintln!("No stream named '{}' found", args.name);
            return Ok(exit_codes::NOT_FOUND);
        }
    };

    let poll = Duration::from_millis(args.poll_ms.max(1));
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut received = 0u64;

    while !cancel.is_cancelled() {
        let Some(sample) = inlet.pull_sample(poll)? else {
            continue;
        };
        let timestamp = if args.local_time {
            inlet.translate(sample.timestamp)
        } else {
            sample.timestamp
        };
        writeln!(out, "{:.6}\t{}", timestamp, sample.values)?;
        out.flush()?;

        received += 1;
        if args.count.is_some_and(|count| received >= count) {
            info!("Received {} sample(s)", received);
            return Ok(exit_codes::SUCCESS);
        }
    }

    info!("Received {} sample(s)", received);
    Ok(exit_codes::INTERRUPTED)
}
