pub mod cache;
pub mod cli;
pub mod io_util;
pub mod locker;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod resolver;
pub mod server;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::error;

use crate::cache::Manager;
use crate::locker::KeyedLocker;
use crate::processor::Processor;
use crate::resolver::PathResolver;
use crate::server::AppContext;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let resolver = Arc::new(PathResolver::new(&settings)?);
    let cache = Arc::new(Manager::new(&settings));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    cache.clone().start_sweeper(shutdown_rx);

    let app = AppContext {
        settings,
        resolver,
        cache,
        locks: Arc::new(KeyedLocker::new()),
        processor: Arc::new(Processor::new()),
    };
    server::run(app, shutdown_tx).await
}
