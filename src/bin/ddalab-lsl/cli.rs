use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ddalab-lsl",
    version,
    about = "Lab Streaming Layer style stream discovery and transport",
    long_about = "Publish, discover and receive real-time sample streams on the local network.\n\
                  Network settings come from LSL_* environment variables or a .env file."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// List streams visible on the network
    List(ListArgs),
    /// Publish a stream, one sample per line of stdin
    Send(SendArgs),
    /// Receive a stream and print its samples
    Receive(ReceiveArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// How long to listen for advertisements, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub wait_ms: u64,

    /// Only list streams matching this predicate (e.g. "type='EEG'")
    #[arg(long)]
    pub predicate: Option<String>,

    /// JSON output
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct SendArgs {
    /// Stream name
    #[arg(long, default_value = "pd_send")]
    pub name: String,

    /// Content type
    #[arg(long = "type", default_value = "EEG")]
    pub content_type: String,

    /// Channels per sample
    #[arg(long, default_value_t = 1)]
    pub channels: u32,

    /// Value format (string, float, double, int32, int16, int8, int64)
    #[arg(long, default_value = "string")]
    pub format: String,

    /// Nominal rate in Hz (0 for irregular)
    #[arg(long, default_value_t = 0.0)]
    pub rate: f64,

    /// Stable source id, lets consumers recover across restarts
    #[arg(long, default_value = "")]
    pub source_id: String,

    /// Outlet buffer length in seconds
    #[arg(long, default_value_t = 300.0)]
    pub buffer_seconds: f64,
}

#[derive(Args)]
pub struct ReceiveArgs {
    /// Stream name
    #[arg(long, default_value = "pd")]
    pub name: String,

    /// Content type (empty matches any)
    #[arg(long = "type", default_value = "EEG")]
    pub content_type: String,

    /// Expected channels per sample
    #[arg(long, default_value_t = 1)]
    pub channels: u32,

    /// Expected value format
    #[arg(long, default_value = "string")]
    pub format: String,

    /// Give up resolving after this many seconds (waits forever if omitted)
    #[arg(long)]
    pub timeout_secs: Option<f64>,

    /// Do not reconnect when the connection drops
    #[arg(long, default_value_t = false)]
    pub no_recover: bool,

    /// Exit after this many samples
    #[arg(long)]
    pub count: Option<u64>,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1)]
    pub poll_ms: u64,

    /// Inlet buffer length in seconds
    #[arg(long, default_value_t = 300.0)]
    pub buffer_seconds: f64,

    /// Translate producer timestamps into local clock time
    #[arg(long, default_value_t = false)]
    pub local_time: bool,
}
