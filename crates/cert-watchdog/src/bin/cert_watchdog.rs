/*
 * 5D Labs Agent Platform - Mesh Certificate Watchdog
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Certificate watchdog service
//!
//! Runs the detection loop against the current cluster and serves
//! `/healthz` and `/readyz` until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use cert_watchdog::health::{self, Readiness};
use cert_watchdog::kube_store::KubeClusterStore;
use cert_watchdog::rotation::{SelfSignedCa, TrustBundleSecret};
use cert_watchdog::{
    ClusterStore, LogCollector, Monitor, RegisterLedger, RemediationWorkflow, RestartOrchestrator,
    WatchdogConfig, WorkflowSettings, REGISTRY,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Watches mesh logs for certificate failures and rotates the self-managed CA
#[derive(Parser)]
#[command(name = "cert-watchdog")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "WATCHDOG_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Port for the health endpoints (overrides the config file)
    #[arg(long)]
    health_port: Option<u16>,

    /// Run a single scan cycle and exit
    #[arg(long)]
    once: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        "Starting certificate watchdog v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = WatchdogConfig::load(&cli.config).with_context(|| {
        format!("Failed to load configuration from {}", cli.config.display())
    })?;
    if let Some(port) = cli.health_port {
        config.health_port = port;
    }
    config.validate().context("Invalid watchdog configuration")?;
    info!(
        ledger = %format!("{}/{}", config.ledger_namespace, config.ledger_name),
        control_plane = %config.control_plane_namespace,
        workloads = %config.workload_namespace,
        "Configuration ready"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let store: Arc<dyn ClusterStore> = Arc::new(KubeClusterStore::new(client.clone()));
    let ledger = Arc::new(RegisterLedger::new(
        store.clone(),
        &config.ledger_namespace,
        &config.ledger_name,
    ));
    let generator = Arc::new(SelfSignedCa::new(config.self_managed_issuer_org.clone()));
    let secrets = Arc::new(TrustBundleSecret::new(
        client,
        &config.control_plane_namespace,
        &config.trust_bundle_secret,
    ));
    let retry = config.retry_policy();
    let restarts = RestartOrchestrator::new(
        store.clone(),
        config.control_plane_targets(),
        &config.workload_namespace,
        config.rollout_budget(),
    )
    .with_retry(retry.clone());
    let workflow = RemediationWorkflow::new(
        ledger,
        generator,
        secrets,
        restarts,
        WorkflowSettings::from_config(&config),
    )
    .with_retry(retry);
    let collector = LogCollector::new(store, config.clone());
    let mut monitor = Monitor::new(
        collector,
        REGISTRY.to_vec(),
        workflow,
        config.scan_interval(),
    );

    if cli.once {
        let report = monitor.run_cycle().await.context("Scan cycle failed")?;
        info!(?report, "Single scan cycle complete");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let readiness = Readiness::new();

    let health_handle = {
        let readiness = readiness.clone();
        let shutdown = shutdown.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, readiness, shutdown).await {
                error!("Health server error: {}", e);
            }
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    readiness.mark_ready();
    monitor.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = health_handle.await {
        warn!("Health server task ended abnormally: {}", e);
    }
    info!("Certificate watchdog stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
