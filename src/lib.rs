//! OdontoChart: live dental chart reconciliation over SQLite.
//!
//! `chart` holds the sync core and its tokio service, `backend` the SQLite
//! storage and in-process change hub that feed it.

pub mod backend; // CH-09: SQLite storage + change hub
pub mod chart; // CH-01 through CH-08: chart sync
pub mod config;
pub mod db;
pub mod models;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// filter. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);
    }
}
