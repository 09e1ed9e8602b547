//! agent-mesh control plane entrypoint.

use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use agent_mesh_control::{CheckSpec, ConsulDiscovery, DiscoveryProvider, RemoteRegistration};

mod config;
mod control;

use config::AppConfig;
use control::ControlPlane;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        consul = %config.consul_addr,
        service = %config.service_name,
        "starting agent-mesh control plane"
    );

    let discovery: Arc<dyn DiscoveryProvider> =
        Arc::new(ConsulDiscovery::new(config.consul_addr.clone())?);

    let plane = ControlPlane::build(&config, Some(discovery.clone()));
    plane.start().await;

    // Mirror the control plane itself into the discovery provider so
    // sidecars can find it. Provider outages are not fatal at startup.
    let self_registration = RemoteRegistration {
        service_id: format!("{}-{}", config.service_name, uuid::Uuid::new_v4()),
        name: config.service_name.clone(),
        host: config.host.clone(),
        port: config.grpc_port,
        tags: vec!["control-plane".to_string()],
        meta: [
            ("health_port".to_string(), config.health_port.to_string()),
            ("metrics_port".to_string(), config.metrics_port.to_string()),
        ]
        .into_iter()
        .collect(),
        check: Some(CheckSpec {
            http: format!("http://{}:{}/health", config.host, config.health_port),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(30),
        }),
    };
    if let Err(err) = discovery.register_remote(self_registration).await {
        tracing::warn!(error = %err, "self-registration with discovery provider failed");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    plane.shutdown().await;
    Ok(())
}
