//! Logger bootstrap shared by the daemon and CLI binaries.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise env_logger once with `default_level` as the fallback filter.
///
/// `RUST_LOG` still wins when set, so operators can raise verbosity per
/// module without touching configuration.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_secs()
            .init();
    });
}
