use super::{fail, stream_layout};
use crate::cli::SendArgs;
use crate::exit_codes;
use anyhow::Context;
use ddalab_lsl::{NominalRate, SampleValues, StreamDescriptor, Transport, ValueEncoding};
use std::io::BufRead;
use std::time::Duration;
use tracing::{info, warn};

/// Time given to consumer connections to drain before the outlet closes
const LINGER: Duration = Duration::from_millis(250);

pub fn execute(args: SendArgs) -> i32 {
    match run(args) {
        Ok(code) => code,
        Err(e) => fail(e),
    }
}

fn run(args: SendArgs) -> anyhow::Result<i32> {
    let encoding = stream_layout(&args.format, args.channels)?;
    let descriptor = StreamDescriptor::new(
        &args.name,
        &args.content_type,
        args.channels,
        NominalRate::from_hz(args.rate)?,
        encoding,
        &args.source_id,
    )?;

    let transport = Transport::from_env().context("Failed to start transport")?;
    let outlet = transport.create_outlet(descriptor, args.buffer_seconds)?;

    let mut sent = 0u64;
    let mut skipped = 0u64;
    for (index, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line.context("Failed to read stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let values = match parse_line(line, encoding, args.channels) {
            Ok(values) => values,
            Err(e) => {
                warn!("Skipping line {}: {}", index + 1, e);
                skipped += 1;
                continue;
            }
        };
        match outlet.push(values) {
            Ok(_) => sent += 1,
            Err(e) if e.is_configuration_error() => {
                warn!("Skipping line {}: {}", index + 1, e);
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if outlet.have_consumers() {
        std::thread::sleep(LINGER);
    }
    info!("Sent {} sample(s), skipped {}", sent, skipped);
    outlet.close();

    Ok(exit_codes::SUCCESS)
}

/// One line of whitespace-separated values; a single-channel string stream takes the whole line
fn parse_line(line: &str, encoding: ValueEncoding, channels: u32) -> ddalab_lsl::LslResult<SampleValues> {
    if encoding == ValueEncoding::String && channels == 1 {
        return SampleValues::parse(encoding, &[line]);
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    SampleValues::parse(encoding, &tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("event A", ValueEncoding::String, 1).unwrap(),
            SampleValues::String(vec!["event A".to_string()])
        );
        assert_eq!(
            parse_line("1 2.5", ValueEncoding::Float32, 2).unwrap(),
            SampleValues::Float32(vec![1.0, 2.5])
        );
        assert_eq!(parse_line("1 2 3", ValueEncoding::Int16, 2).unwrap().len(), 3);
        assert!(parse_line("one", ValueEncoding::Int32, 1).is_err());
    }
}
