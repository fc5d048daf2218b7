//! Gateway entry point: wire configuration, keystore, audit, telemetry, the
//! task manager, and plugin discovery into the shared service state, then
//! serve the REST surface.

use hephaestus_core::release::host::HttpReleaseHost;
use hephaestus_core::release::sigstore::ExternalSigstoreVerifier;
use hephaestus_core::release::ReleasePipeline;
use hephaestus_core::{
    AuditLog, CoreConfig, Keystore, ServiceState, TaskManager, TaskManagerConfig, TelemetrySink,
    Verifier,
};
use hephaestus_gateway::build_router;
use hephaestus_plugins::DiscoveryGateProvider;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[hephaestus-gateway] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoreConfig::from_env();
    let telemetry = Arc::new(TelemetrySink::new(config.telemetry_enabled));
    let audit = Arc::new(AuditLog::new(&config.audit_log_dir));
    let keystore = Arc::new(
        Keystore::load(&config.service_account_keys_path).expect("load service-account keystore"),
    );
    let verifier = Arc::new(Verifier::new(Arc::clone(&keystore)));
    let tasks = TaskManager::new(
        TaskManagerConfig {
            max_tasks: config.max_tasks,
            retention: config.task_retention,
            default_timeout: config.task_timeout,
            ..TaskManagerConfig::default()
        },
        Arc::clone(&telemetry),
    );

    let sigstore: Arc<dyn hephaestus_core::release::sigstore::SigstoreVerifier> =
        Arc::new(ExternalSigstoreVerifier::from_env());
    let release = Arc::new(ReleasePipeline::new(
        Arc::new(HttpReleaseHost::new()),
        Arc::clone(&sigstore),
        Arc::clone(&telemetry),
    ));

    let workspace = std::env::current_dir().expect("resolve working directory");
    let discovery =
        hephaestus_plugins::Discovery::for_workspace(&workspace, Arc::clone(&sigstore));
    let gate_provider = Arc::new(
        DiscoveryGateProvider::from_discovery(&discovery)
            .await
            .expect("plugin discovery"),
    );

    let services = Arc::new(ServiceState {
        config: config.clone(),
        telemetry,
        audit,
        keystore: Arc::clone(&keystore),
        verifier,
        tasks,
        release,
        gate_provider,
    });

    // SIGHUP reloads the keystore without a restart (key rotation).
    #[cfg(unix)]
    {
        let keystore = Arc::clone(&keystore);
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot install SIGHUP handler");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                match keystore.reload() {
                    Ok(count) => {
                        tracing::info!(count, "keystore reloaded on SIGHUP");
                    }
                    Err(e) => tracing::error!(error = %e, "keystore reload failed"),
                }
            }
        });
    }

    let app = build_router(services);
    let listener = tokio::net::TcpListener::bind(&config.gateway_addr)
        .await
        .expect("bind gateway address");
    tracing::info!(addr = %config.gateway_addr, "hephaestus gateway listening");
    axum::serve(listener, app).await.expect("serve gateway");
}
