//! edge-gateway - Layer-7 Gateway with Hexagonal Architecture
//!
//! This is the composition root that wires together all the components.

use edge_gateway::adapters::inbound::{AdminServer, AdminState, HttpServer};
use edge_gateway::adapters::outbound::{
    CachingSecretProvider, DashMapAffinityStore, DashMapBackendState, FileSecretProvider,
    HttpProber, ReqwestForwarder, SelfSignedSecretProvider, TracingEventSink,
};
use edge_gateway::config::{load_config, SecretProviderKind};
use edge_gateway::domain::ports::SecretProvider;
use edge_gateway::domain::value_objects::Protocol;
use edge_gateway::infrastructure::{
    shutdown_signal, CertificateManager, ConfigWatcher, HealthMonitor, ShutdownController,
};
use edge_gateway::{GatewayConfig, GatewayService, RoutingCompiler};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting edge-gateway config={} (hexagonal architecture)",
        cfg.routing_config
    );

    // The first document must compile; later ones fall back to the running table
    let document = GatewayConfig::from_file(&cfg.routing_config)?;
    let table = RoutingCompiler::compile(&document)?;

    // ===== COMPOSITION ROOT =====
    // Wire up all adapters and services

    // 1. Create outbound adapters
    let events = Arc::new(TracingEventSink::new());

    let backend_state = Arc::new(DashMapBackendState::new());

    let affinity = Arc::new(DashMapAffinityStore::new());
    affinity.start_gc(
        Duration::from_secs(cfg.affinity_ttl_secs),
        Duration::from_secs(cfg.affinity_gc_interval_secs),
    );

    let store: Arc<dyn SecretProvider> = match cfg.secret_provider {
        SecretProviderKind::File => {
            tracing::info!("loading certificates from {}", cfg.cert_dir);
            Arc::new(FileSecretProvider::new(&cfg.cert_dir))
        }
        SecretProviderKind::SelfSigned => {
            tracing::warn!("using self-signed certificates, not for production");
            Arc::new(SelfSignedSecretProvider::new(
                cfg.self_signed_names.clone(),
                cfg.self_signed_validity_days,
            ))
        }
    };
    let mut secrets =
        CachingSecretProvider::new(store, Duration::from_secs(cfg.secret_cache_ttl_secs));
    if cfg.secret_env_fallback {
        secrets = secrets.with_env_fallback();
    }
    let secrets: Arc<dyn SecretProvider> = Arc::new(secrets);

    // 2. Create application service
    let service = Arc::new(GatewayService::new(
        table,
        backend_state.clone(),
        affinity,
        Arc::new(ReqwestForwarder::new()),
        events.clone(),
        cfg.unknown_grace_secs.map(Duration::from_secs),
    ));

    // 3. Background loops
    let monitor = Arc::new(HealthMonitor::new(
        backend_state,
        Arc::new(HttpProber::new()),
        events.clone(),
    ));
    service.add_observer(monitor.clone());

    let certificates = CertificateManager::new(secrets, events);
    let table = service.table();
    certificates.sync(&table, chrono::Utc::now()).await;
    service.add_observer(Arc::new(certificates.clone()));
    certificates.start(Duration::from_secs(cfg.cert_poll_secs.max(1)));

    if cfg.config_poll_secs > 0 {
        let watcher = Arc::new(ConfigWatcher::new(
            &cfg.routing_config,
            Duration::from_secs(cfg.config_poll_secs),
        )?);
        watcher.start(service.clone());
    }

    // 4. Create inbound adapters and run
    let shutdown = ShutdownController::new();
    let mut servers = tokio::task::JoinSet::new();

    for listener in table.listeners() {
        let server = HttpServer::new(
            service.clone(),
            listener.clone(),
            &cfg.bind_host,
            shutdown.clone(),
        );
        let server = match listener.protocol {
            Protocol::Https => match certificates.resolver(&listener.name) {
                Some(resolver) => server.with_tls(resolver),
                None => {
                    tracing::error!(
                        "listener {} has no certificate binding, not started",
                        listener.name
                    );
                    continue;
                }
            },
            Protocol::Http => server,
        };
        servers.spawn(server.run());
    }

    if cfg.admin_enabled {
        let admin = AdminServer::new(
            cfg.admin_listen_addr.clone(),
            AdminState {
                service: service.clone(),
                certificates: Some(certificates.clone()),
                config_path: Some(cfg.routing_config.clone().into()),
            },
        );
        servers.spawn(admin.run(shutdown.signalled()));
    }

    tokio::select! {
        _ = shutdown_signal(shutdown.clone()) => {}
        Some(result) = servers.join_next() => {
            // a listener failing to bind or accept stops the gateway
            shutdown.shutdown();
            match result {
                Ok(Err(e)) => tracing::error!("server stopped: {:#}", e),
                Err(e) => tracing::error!("server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    let drained = shutdown
        .wait_for_drain(Duration::from_secs(cfg.drain_timeout_secs))
        .await;
    monitor.shutdown();
    tracing::info!("edge-gateway stopped (drained: {})", drained);

    Ok(())
}
