//! External discovery-provider seam.
//!
//! The control plane mirrors its registry into a Consul-compatible
//! key/value + health store and reconciles membership from it. The
//! [`DiscoveryProvider`] trait is the seam; [`ConsulDiscovery`] is the
//! HTTP implementation. Provider outages are never fatal: callers log and
//! retry on the next cycle.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use agent_mesh_core::error::MeshError;

/// Health check the provider runs against a registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    /// HTTP URL the provider probes.
    pub http: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Remove the service after this long in critical state.
    pub deregister_after: Duration,
}

impl Default for CheckSpec {
    fn default() -> Self {
        Self {
            http: String::new(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(30),
        }
    }
}

/// Registration mirrored to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRegistration {
    pub service_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub check: Option<CheckSpec>,
}

/// An instance as the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub service_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

/// Operations the control plane consumes from the discovery provider.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Mirror a local registration to the provider.
    async fn register_remote(&self, registration: RemoteRegistration) -> Result<(), MeshError>;

    /// Mirror a local deregistration to the provider.
    async fn deregister_remote(&self, service_id: &str) -> Result<(), MeshError>;

    /// Instances of one service, optionally restricted to passing checks.
    async fn service(&self, name: &str, passing_only: bool)
        -> Result<Vec<RemoteInstance>, MeshError>;

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError>;

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), MeshError>;

    /// Blocking-query watch: waits up to `wait` for the service's index to
    /// advance past `index`, then returns the new index and membership.
    async fn watch(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<RemoteInstance>), MeshError>;
}

/// Consul-compatible HTTP discovery provider.
pub struct ConsulDiscovery {
    base_url: String,
    client: reqwest::Client,
}

impl ConsulDiscovery {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MeshError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(65))
            .build()
            .map_err(|e| MeshError::ConfigurationError {
                message: format!("failed to build discovery http client: {}", e),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn interval_string(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: HealthServiceBody,
}

#[derive(Debug, Deserialize)]
struct HealthServiceBody {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

impl From<HealthServiceEntry> for RemoteInstance {
    fn from(entry: HealthServiceEntry) -> Self {
        RemoteInstance {
            service_id: entry.service.id,
            name: entry.service.service,
            host: entry.service.address,
            port: entry.service.port,
            tags: entry.service.tags,
            meta: entry.service.meta,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[async_trait]
impl DiscoveryProvider for ConsulDiscovery {
    async fn register_remote(&self, registration: RemoteRegistration) -> Result<(), MeshError> {
        let mut body = json!({
            "ID": registration.service_id,
            "Name": registration.name,
            "Address": registration.host,
            "Port": registration.port,
            "Tags": registration.tags,
            "Meta": registration.meta,
        });
        if let Some(check) = &registration.check {
            body["Check"] = json!({
                "HTTP": check.http,
                "Interval": interval_string(check.interval),
                "Timeout": interval_string(check.timeout),
                "DeregisterCriticalServiceAfter": interval_string(check.deregister_after),
            });
        }
        let response = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MeshError::remote_unavailable(format!(
                "discovery register failed: HTTP {}",
                response.status()
            )));
        }
        tracing::debug!(service = %registration.name, service_id = %registration.service_id, "mirrored registration to discovery provider");
        Ok(())
    }

    async fn deregister_remote(&self, service_id: &str) -> Result<(), MeshError> {
        let response = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{}", service_id)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MeshError::remote_unavailable(format!(
                "discovery deregister failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn service(
        &self,
        name: &str,
        passing_only: bool,
    ) -> Result<Vec<RemoteInstance>, MeshError> {
        let mut url = self.url(&format!("/v1/health/service/{}", name));
        if passing_only {
            url.push_str("?passing=true");
        }
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(MeshError::remote_unavailable(format!(
                "discovery query failed: HTTP {}",
                response.status()
            )));
        }
        let entries: Vec<HealthServiceEntry> = response.json().await?;
        Ok(entries.into_iter().map(RemoteInstance::from).collect())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/kv/{}", key)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MeshError::remote_unavailable(format!(
                "kv get failed: HTTP {}",
                response.status()
            )));
        }
        let entries: Vec<KvEntry> = response.json().await?;
        match entries.into_iter().next().and_then(|e| e.value) {
            Some(encoded) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| MeshError::serialization(format!("kv value not base64: {}", e)))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), MeshError> {
        let response = self
            .client
            .put(self.url(&format!("/v1/kv/{}", key)))
            .body(value.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MeshError::remote_unavailable(format!(
                "kv put failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn watch(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<RemoteInstance>), MeshError> {
        let url = self.url(&format!(
            "/v1/health/service/{}?index={}&wait={}s",
            name,
            index,
            wait.as_secs()
        ));
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(MeshError::remote_unavailable(format!(
                "discovery watch failed: HTTP {}",
                response.status()
            )));
        }
        let next_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(index);
        let entries: Vec<HealthServiceEntry> = response.json().await?;
        Ok((next_index, entries.into_iter().map(RemoteInstance::from).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registration(name: &str, id: &str) -> RemoteRegistration {
        RemoteRegistration {
            service_id: id.to_string(),
            name: name.to_string(),
            host: "10.0.0.5".to_string(),
            port: 50051,
            tags: vec!["agent".to_string()],
            meta: HashMap::new(),
            check: Some(CheckSpec {
                http: "http://10.0.0.5:50200/health".to_string(),
                ..CheckSpec::default()
            }),
        }
    }

    #[tokio::test]
    async fn registers_service_with_check_spec() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let discovery = ConsulDiscovery::new(server.uri()).unwrap();
        discovery
            .register_remote(registration("svc-a", "id-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn parses_service_health_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/svc-a"))
            .and(query_param("passing", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "Service": {
                        "ID": "id-1",
                        "Service": "svc-a",
                        "Address": "10.0.0.5",
                        "Port": 50051,
                        "Tags": ["agent"],
                        "Meta": { "health_port": "50200" }
                    }
                }
            ])))
            .mount(&server)
            .await;

        let discovery = ConsulDiscovery::new(server.uri()).unwrap();
        let instances = discovery.service("svc-a", true).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].service_id, "id-1");
        assert_eq!(instances[0].meta["health_port"], "50200");
    }

    #[tokio::test]
    async fn kv_round_trips_base64_values() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/mesh/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "Value": base64::engine::general_purpose::STANDARD.encode(b"payload") }
            ])))
            .mount(&server)
            .await;

        let discovery = ConsulDiscovery::new(server.uri()).unwrap();
        let value = discovery.kv_get("mesh/config").await.unwrap();
        assert_eq!(value.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn kv_get_missing_key_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let discovery = ConsulDiscovery::new(server.uri()).unwrap();
        assert!(discovery.kv_get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_advances_the_index_from_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/svc-a"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Consul-Index", "42")
                    .set_body_json(json!([])),
            )
            .mount(&server)
            .await;

        let discovery = ConsulDiscovery::new(server.uri()).unwrap();
        let (index, instances) = discovery
            .watch("svc-a", 7, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(index, 42);
        assert!(instances.is_empty());
    }

    #[tokio::test]
    async fn provider_error_maps_to_remote_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let discovery = ConsulDiscovery::new(server.uri()).unwrap();
        let err = discovery
            .register_remote(registration("svc-a", "id-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RemoteUnavailable { .. }));
    }
}
