//! # Logging
//!
//! All output goes through `tracing`. The subscriber installed here is the
//! single process-wide sink:
//!
//! - `RUST_LOG` selects what is recorded (default `info`).
//! - [`LogFormat::Json`] writes one JSON object per event with the event
//!   fields flattened, which is what log collectors expect.
//! - [`LogFormat::Pretty`] is the multi-line format for local development.
//!
//! Events emitted by the call interceptor carry `method`, `duration` and
//! `code` fields; lifecycle milestones are plain messages with the address
//! or counts attached as fields.

use crate::server::config::LogFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_target(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339()),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                    .with_file(true)
                    .pretty(),
            )
            .try_init()?,
    }

    Ok(())
}
