//! Application configuration.
//!
//! Wraps the core configuration with the process-level settings the
//! binary needs: the discovery provider address and the identity this
//! control plane registers itself under.

use std::env;

use agent_mesh_core::config::CoreConfig;
use agent_mesh_core::error::MeshError;

/// Default ports the control plane advertises for itself.
const DEFAULT_GRPC_PORT: u16 = 50051;
const DEFAULT_HEALTH_PORT: u16 = 50200;
const DEFAULT_METRICS_PORT: u16 = 8080;

/// Full configuration for the control-plane process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub core: CoreConfig,
    /// Base URL of the Consul-compatible discovery provider.
    pub consul_addr: String,
    /// Host the control plane advertises.
    pub host: String,
    pub grpc_port: u16,
    pub health_port: u16,
    pub metrics_port: u16,
    /// Service name the control plane registers itself under.
    pub service_name: String,
}

impl AppConfig {
    /// Load from `MESH_*` environment variables with defaults. Invalid
    /// values fail startup.
    pub fn from_env() -> Result<Self, MeshError> {
        let core = CoreConfig::from_env()?;
        Ok(Self {
            core,
            consul_addr: env::var("MESH_CONSUL_ADDR")
                .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string()),
            host: env::var("MESH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            grpc_port: parse_port("MESH_GRPC_PORT", DEFAULT_GRPC_PORT)?,
            health_port: parse_port("MESH_HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
            metrics_port: parse_port("MESH_METRICS_PORT", DEFAULT_METRICS_PORT)?,
            service_name: env::var("MESH_SERVICE_NAME")
                .unwrap_or_else(|_| "agent-mesh-core".to_string()),
        })
    }
}

fn parse_port(name: &str, default: u16) -> Result<u16, MeshError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| MeshError::ConfigurationError {
            message: format!("invalid value for {}: {}", name, raw),
        }),
        Err(_) => Ok(default),
    }
}
