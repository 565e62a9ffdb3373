pub mod buffer;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod inlet;
pub mod outlet;
pub mod predicate;
pub mod transport;
pub mod types;
pub mod wire;

pub use buffer::{BufferMetrics, RetentionBudget};
pub use clock::{local_clock, ClockStats, ClockSync};
pub use config::{ConfigError, TransportConfig};
pub use discovery::{ResolveTimeout, ResolvedStream};
pub use error::{LslError, LslResult};
pub use inlet::{Inlet, InletOptions, InletState};
pub use outlet::Outlet;
pub use predicate::Predicate;
pub use tokio_util::sync::CancellationToken;
pub use transport::Transport;
pub use types::*;
