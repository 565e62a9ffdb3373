pub mod list;
pub mod receive;
pub mod send;

use crate::exit_codes;
use ddalab_lsl::{CancellationToken, LslError, ValueEncoding, MAX_CHANNELS};
use tokio::runtime::Handle;
use tracing::info;

/// Report a command failure and map it to an exit code
pub fn fail(error: anyhow::Error) -> i32 {
    eprintln!("Error: {:#}", error);
    match error.downcast_ref::<LslError>() {
        Some(LslError::Cancelled) => exit_codes::INTERRUPTED,
        Some(e) if e.is_configuration_error() => exit_codes::INPUT_ERROR,
        _ => exit_codes::EXECUTION_ERROR,
    }
}

/// Parse the value format and check the channel count before touching the network
pub fn stream_layout(format: &str, channels: u32) -> Result<ValueEncoding, LslError> {
    let encoding = format.parse::<ValueEncoding>()?;
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(LslError::Configuration(format!(
            "Channel count must be between 1 and {} (got {})",
            MAX_CHANNELS, channels
        )));
    }
    Ok(encoding)
}

/// Token cancelled on Ctrl-C
pub fn cancel_on_ctrl_c(runtime: &Handle) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            token.cancel();
        }
    });
    cancel
}
