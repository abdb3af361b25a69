pub mod aggregator;
pub mod engine;
pub mod upstream;

pub use aggregator::PersistingStream;
pub use engine::{spawn_turn, TurnOutcome};
pub use upstream::{AuditedUpstream, DeltaStream, ScriptedUpstream, Upstream, UpstreamError};

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        {
            tracing::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        {
            tracing::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        {
            tracing::error!($($arg)*);
        }
    };
}
