//! Controller runner - builds the long-running controller futures
//!
//! Each `build_*` function returns a boxed future the binary composes with the
//! webhook server. Both stop when the shutdown token is cancelled.

use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fqdnguard_common::crd::HTTPProxy;

use crate::cache_sync::CacheSync;
use crate::events::EventTranslator;
use crate::finalizer::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Finalizer controller over every HTTPProxy
pub fn build_finalizer_controller(
    client: Client,
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) -> ControllerFuture {
    let proxies: Api<HTTPProxy> = Api::all(client);

    info!("- HTTPProxy finalizer controller");

    Box::pin(
        Controller::new(proxies, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .graceful_shutdown_on(shutdown.cancelled_owned())
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("HTTPProxy")),
    )
}

/// Watcher feeding [`CacheSync`], starting from the bootstrap listing
pub fn build_cache_sync(
    client: Client,
    sync: CacheSync,
    seed: Vec<HTTPProxy>,
    shutdown: CancellationToken,
) -> ControllerFuture {
    let proxies: Api<HTTPProxy> = Api::all(client);

    info!("- HTTPProxy cache watcher");

    Box::pin(async move {
        let events = watcher::watcher(proxies, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff();
        drive_cache_sync(events, EventTranslator::seeded(seed), &sync, shutdown).await;
    })
}

async fn drive_cache_sync<S>(
    events: S,
    mut translator: EventTranslator,
    sync: &CacheSync,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<HTTPProxy>, watcher::Error>>,
{
    let mut events = pin!(events);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(event)) => {
                    for change in translator.translate(event) {
                        debug!(
                            proxy = %change.object().identity(),
                            event = change.kind(),
                            "Applying watch event to cache"
                        );
                        sync.apply_event(&change);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "HTTPProxy watch error"),
                None => break,
            },
        }
    }
    info!(known = translator.len(), "Cache watcher stopped");
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
