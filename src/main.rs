use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use weir_core::bus::MessageBus;
use weir_core::catalog::{Catalog, CatalogDocument, MetricSource};
use weir_core::config::WeirConfig;
use weir_core::logging::init_tracing;
use weir_core::runtime::Registry;
use weir_enforcer::{
    AllocationStrategy, EnforcementLoop, EnforcerConfig, MinSloWithSpareShare,
    ProportionalReplication,
};
use weir_metrics::{HubConfig, HubHandle, MetricHub, RawBatchObserver, SubscriberChannel};
use weir_rules::{
    hub_registry_name, ControlApiClient, PolicyApiBuilder, PolicyServiceConfig, RuleManager,
};

#[derive(Parser)]
#[command(name = "weird")]
#[command(about = "Policy-driven control plane daemon for a storage cluster", long_about = None)]
struct Cli {
    /// Bind address for the policy API, overriding WEIR_HTTP_BIND.
    #[arg(long)]
    bind: Option<String>,

    /// Path to a JSON snapshot of the configuration store.
    #[arg(long, env = "WEIR_CATALOG_FILE")]
    catalog: Option<String>,

    /// Log filter, e.g. `info` or `weir=debug`.
    #[arg(long)]
    log: Option<String>,
}

/// Bandwidth metrics the enforcement loops bind to, with the request
/// method their change records carry.
const BANDWIDTH_METRICS: &[(&str, &str)] = &[
    ("get_bw", "GET"),
    ("put_bw", "PUT"),
    ("ssync_bw", "REPLICATION"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.log.as_deref()) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let config = WeirConfig::from_env().context("failed to load configuration")?;

    let catalog = Catalog::new();
    match &cli.catalog {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read catalog snapshot {path}"))?;
            let document: CatalogDocument =
                serde_json::from_str(&raw).context("malformed catalog snapshot")?;
            catalog.load_document(document);
        }
        None => seed_default_metrics(&catalog, &config),
    }
    catalog
        .require_metrics()
        .context("cannot start without a metric catalog")?;

    let bus = MessageBus::new();
    let registry = Registry::new();

    for name in catalog.metric_names() {
        let source = catalog
            .metric(&name)
            .context("metric disappeared from the catalog during startup")?;
        let hub = MetricHub::spawn(
            HubConfig {
                metric: name.clone(),
                period: config.aggregation_period,
                binding: source.binding(),
            },
            &bus,
        )
        .await;
        registry.register(hub_registry_name(&name), hub);
        info!(metric = %name, "metric hub started");
    }

    spawn_enforcement_loops(&config, &catalog, &bus, &registry).await;

    let dispatcher = ControlApiClient::new(
        &config.controller_url,
        config.auth_token.clone(),
        catalog.clone(),
    )
    .context("invalid controller URL")?;
    let manager = RuleManager::new(catalog.clone(), registry.clone(), Arc::new(dispatcher));

    let bind_address = cli
        .bind
        .or_else(|| config.http_bind.clone())
        .unwrap_or_else(|| PolicyServiceConfig::default().bind_address);
    let shutdown_api = PolicyApiBuilder::new(manager.clone())
        .serve(PolicyServiceConfig {
            bind_address: bind_address.clone(),
        })
        .await
        .context("failed to start the policy API")?;
    info!(node = %config.node_name, address = %bind_address, "weird is up");

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_api.send(());
    manager.stop_all().await;
    registry.stop_all().await;

    Ok(())
}

/// Without a catalog snapshot the daemon still monitors the stock metric
/// set on the configured exchange.
fn seed_default_metrics(catalog: &Catalog, config: &WeirConfig) {
    let mut names = vec!["get_ops", "put_ops", "active_requests"];
    names.extend(BANDWIDTH_METRICS.iter().map(|(metric, _)| *metric));
    for metric in names {
        catalog.register_metric(MetricSource {
            name: metric.to_string(),
            exchange: config.metrics_exchange.clone(),
            queue: format!("weir-hub-{metric}"),
            routing_key: format!("{metric}.#"),
        });
    }
}

/// Hooks one enforcement loop onto the raw channel of every bandwidth
/// metric hub that is actually running.
async fn spawn_enforcement_loops(
    config: &WeirConfig,
    catalog: &Catalog,
    bus: &MessageBus,
    registry: &Registry,
) {
    for (metric, method) in BANDWIDTH_METRICS {
        let Some(hub) = registry.lookup::<HubHandle>(&hub_registry_name(metric)) else {
            continue;
        };

        let strategy: Box<dyn AllocationStrategy> = if *method == "REPLICATION" {
            Box::new(ProportionalReplication::new(config.replication_budget))
        } else {
            Box::new(MinSloWithSpareShare::new(
                config.per_disk_capacity,
                config.disk_capacity,
                config.proxy_capacity,
            ))
        };

        let name = format!("enforcer:{metric}");
        let enforcer = EnforcementLoop::new(
            EnforcerConfig {
                name: name.clone(),
                method: method.to_string(),
                slo: metric.to_string(),
                exchange: config.bandwidth_exchange.clone(),
            },
            strategy,
            catalog.clone(),
            bus.clone(),
        );

        let observer: Arc<dyn RawBatchObserver> = enforcer;
        match hub
            .attach(&name, "*", "*", SubscriberChannel::Raw(observer))
            .await
        {
            Ok(()) => info!(%metric, %method, "enforcement loop attached"),
            Err(err) => warn!(%metric, %err, "enforcement loop could not attach"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
