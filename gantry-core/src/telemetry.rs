//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guard returned by [`init_telemetry`]; keep it alive for the program's
/// lifetime so buffered events are flushed on exit.
pub struct TelemetryGuard {
    _private: (),
}

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set; otherwise the stage decides:
/// the `"debug"` stage turns the gossip substrate's chatter on, every other
/// stage keeps it at warn, matching how operators run gateway fleets.
///
/// Calling this twice is a no-op (the second `try_init` fails silently),
/// which keeps tests that share a process from panicking.
pub fn init_telemetry(stage: &str) -> TelemetryGuard {
    let default_directives = if stage == "debug" {
        "debug"
    } else {
        "info,gantry_cluster::basis=warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();

    TelemetryGuard { _private: () }
}
