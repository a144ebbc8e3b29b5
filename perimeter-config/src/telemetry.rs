use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Directives used when `RUST_LOG` is unset: quiet by default, with the
/// pipeline's lifecycle messages visible.
pub const DEFAULT_DIRECTIVES: &str =
    "info,scan::dispatch=info,scan::coordinator=info,scan::cache=warn,scan::store=warn";

/// Install the global subscriber. `RUST_LOG` wins over `default_directives`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
