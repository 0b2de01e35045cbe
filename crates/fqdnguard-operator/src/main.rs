//! fqdnguard - keeps Contour HTTPProxy hostnames unique per ingress class

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fqdnguard_common::cache::ReservationCache;
use fqdnguard_common::config::Config;
use fqdnguard_common::install_crypto_provider;
use fqdnguard_common::telemetry::{init_telemetry, TelemetryConfig};
use fqdnguard_controller::{
    build_cache_sync, build_finalizer_controller, seed_cache, CacheSync, Context,
    KubeProxyStore, ProxyStore,
};
use fqdnguard_webhook::{serve, ServerConfig, WebhookState};

const SHUTDOWN_GRACE_SECS: u64 = 30;

/// fqdnguard - admission webhook and controller for HTTPProxy FQDN uniqueness
#[derive(Parser, Debug)]
#[command(name = "fqdnguard", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(
        long = "config-file-path",
        env = "FQDNGUARD_CONFIG_FILE",
        default_value = "./config.yaml"
    )]
    config_file_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    if !install_crypto_provider() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig::default())?;

    let result = run(cli).await;
    if let Err(e) = &result {
        error!(error = ?e, "fqdnguard stopped with an error");
    }

    telemetry.shutdown();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config_file_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            cli.config_file_path.display()
        )
    })?;
    info!(
        ingress_classes = ?config.ingress_classes,
        entry_ttl_secs = config.cache.entry_ttl_second,
        clean_up_interval_secs = config.cache.clean_up_interval_second,
        "Loaded configuration"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    // The webhook must not answer before every existing reservation is known
    let cache = Arc::new(ReservationCache::new());
    let allow_list = config.allow_list();
    let store: Arc<dyn ProxyStore> = Arc::new(KubeProxyStore::new(client.clone()));
    let seed = seed_cache(store.as_ref(), &cache, &allow_list)
        .await
        .context("failed to seed the reservation cache")?;

    let sweeper = cache.spawn_sweeper(config.clean_up_interval());
    let shutdown = CancellationToken::new();

    info!("Starting controllers");
    let ctx = Arc::new(Context::new(store).with_retry(config.finalizer_retry()));
    let controllers = tokio::spawn(futures::future::join_all([
        build_finalizer_controller(client.clone(), ctx, shutdown.clone()),
        build_cache_sync(
            client,
            CacheSync::new(cache.clone(), allow_list),
            seed,
            shutdown.clone(),
        ),
    ]));

    let handle = axum_server::Handle::new();
    let server_config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], config.webhook.port)),
        cert_file: config.webhook.tls_cert_file.clone(),
        key_file: config.webhook.tls_key_file.clone(),
    };
    let state = Arc::new(WebhookState::from_config(&config, cache.clone()));
    let mut server = tokio::spawn(serve(server_config, state, handle.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;

    let finished = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            None
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            None
        }
        result = &mut server => Some(result),
    };

    let server_result = match finished {
        Some(result) => {
            warn!("Webhook server exited before shutdown was requested");
            result
        }
        None => {
            handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
            server.await
        }
    };

    shutdown.cancel();
    if let Err(e) = controllers.await {
        warn!(error = %e, "Controller task ended abnormally");
    }
    sweeper.shutdown().await;
    info!("Shutdown complete");

    match server_result {
        Ok(result) => result.context("webhook server failed"),
        Err(e) => Err(anyhow!("webhook server task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_local_config_file() {
        let cli = Cli::try_parse_from(["fqdnguard"]).unwrap();
        if std::env::var_os("FQDNGUARD_CONFIG_FILE").is_none() {
            assert_eq!(cli.config_file_path, PathBuf::from("./config.yaml"));
        }
    }

    #[test]
    fn cli_accepts_config_path_flag() {
        let cli =
            Cli::try_parse_from(["fqdnguard", "--config-file-path", "/etc/fqdnguard/config.yaml"])
                .unwrap();
        assert_eq!(
            cli.config_file_path,
            PathBuf::from("/etc/fqdnguard/config.yaml")
        );
    }

    #[tokio::test]
    async fn run_fails_fast_on_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "ingressClasses: []\n").unwrap();

        let err = run(Cli {
            config_file_path: path,
        })
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("at least one ingress class"));
    }
}
