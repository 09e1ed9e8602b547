//! The async work-queue router.
//!
//! Callers submit requests into a bounded queue and await a reply slot; a
//! fixed pool of workers drains the queue, selects an instance through
//! the balancer (health filter, circuit breakers, strategy), dispatches
//! over the pooled transport, and retries transient failures with
//! exponential backoff under the request's absolute deadline. Every final
//! outcome emits a `route_called` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agent_mesh_control::ServiceRegistry;
use agent_mesh_core::config::{CircuitBreakerConfig, RouterConfig};
use agent_mesh_core::error::{MeshError, RetryPolicy};
use agent_mesh_core::events::{Event, EventPayload, EventStore, Metadata};

use crate::balancer::{LoadBalancer, RoutingStrategy};
use crate::queue::{RequestQueue, RouteRequest, RouteResponse};
use crate::transport::RpcTransport;

/// A caller-facing route submission.
#[derive(Debug, Clone)]
pub struct RouteSubmission {
    pub source: String,
    pub target: String,
    pub method: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
    pub timeout: Duration,
    pub strategy: RoutingStrategy,
}

impl RouteSubmission {
    pub fn new(source: &str, target: &str, method: &str, payload: Bytes) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            method: method.to_string(),
            payload,
            metadata: HashMap::new(),
            timeout: Duration::from_secs(30),
            strategy: RoutingStrategy::HealthAware,
        }
    }
}

/// Router introspection counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStats {
    pub pending_requests: usize,
    pub in_flight_requests: usize,
    pub workers: usize,
    pub pooled_channels: usize,
    pub tracked_instances: usize,
}

/// Async request router with a fixed worker pool.
pub struct Router {
    registry: Arc<ServiceRegistry>,
    store: Arc<EventStore>,
    queue: Arc<RequestQueue>,
    balancer: Arc<LoadBalancer>,
    transport: Arc<dyn RpcTransport>,
    retry: RetryPolicy,
    config: RouterConfig,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<EventStore>,
        transport: Arc<dyn RpcTransport>,
        config: RouterConfig,
        circuit_breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            queue: Arc::new(RequestQueue::new(config.queue_capacity)),
            balancer: Arc::new(LoadBalancer::new(circuit_breaker)),
            transport,
            retry,
            config,
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Spawn the worker pool.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.workers {
            let router = self.clone();
            workers.push(tokio::spawn(async move {
                tracing::debug!(worker_id, "routing worker started");
                loop {
                    let item = tokio::select! {
                        _ = router.shutdown.cancelled() => break,
                        item = router.queue.dequeue() => item,
                    };
                    let (request, reply) = match item {
                        Some(item) => item,
                        None => break,
                    };
                    let response = router.process(request).await;
                    router.queue.finish();
                    let _ = reply.send(response);
                }
                tracing::debug!(worker_id, "routing worker stopped");
            }));
        }
        tracing::info!(workers = self.config.workers, "router started");
    }

    /// Stop the workers and close every pooled channel.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
        self.transport.shutdown().await;
        tracing::info!("router stopped");
    }

    /// Submit a route and await its outcome. Saturation surfaces as
    /// `QueueFull`; every other failure mode resolves to a response with
    /// `success == false`.
    pub async fn route(&self, submission: RouteSubmission) -> Result<RouteResponse, MeshError> {
        let deadline = Instant::now() + submission.timeout;
        let request = RouteRequest {
            request_id: Uuid::new_v4(),
            source: submission.source,
            target: submission.target,
            method: submission.method,
            payload: submission.payload,
            metadata: submission.metadata,
            deadline,
            retries_used: 0,
            max_retries: self.retry.max_attempts.saturating_sub(1),
            strategy: submission.strategy,
        };
        let request_id = request.request_id;
        let receiver = self.queue.submit(request)?;
        match tokio::time::timeout(submission.timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Ok(RouteResponse::failure(
                request_id,
                "router shut down before completion",
                0.0,
            )),
            Err(_) => Ok(RouteResponse::failure(
                request_id,
                "deadline exceeded",
                submission.timeout.as_secs_f64() * 1000.0,
            )),
        }
    }

    /// Dispatch one request, retrying transient failures while the
    /// backoff still fits under the deadline. A retry may land on a
    /// different instance.
    async fn process(&self, mut request: RouteRequest) -> RouteResponse {
        let started = Instant::now();
        loop {
            if Instant::now() >= request.deadline {
                return self
                    .finish_failure(&request, "deadline exceeded", started, String::new())
                    .await;
            }

            let instances = self.registry.instances(&request.target).await;
            if instances.is_empty() {
                return self
                    .finish_failure(
                        &request,
                        format!("no instances for service {}", request.target),
                        started,
                        String::new(),
                    )
                    .await;
            }

            let instance = match self.balancer.select(&instances, request.strategy).await {
                Some(instance) => instance,
                None => {
                    // Every candidate's breaker rejected the call.
                    if self.permits_retry(&request) {
                        request.retries_used += 1;
                        tokio::time::sleep(self.retry.backoff_for(request.retries_used)).await;
                        continue;
                    }
                    return self
                        .finish_failure(
                            &request,
                            format!("all instances of {} have open circuits", request.target),
                            started,
                            String::new(),
                        )
                        .await;
                }
            };

            let instance_key = instance.address();
            self.balancer.connection_opened(&instance_key).await;
            let attempt_started = Instant::now();
            let outcome = self
                .transport
                .call(
                    &instance_key,
                    &request.method,
                    &request.metadata,
                    request.payload.clone(),
                    request.deadline,
                )
                .await;
            let attempt_latency_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;
            self.balancer.connection_closed(&instance_key).await;
            self.balancer
                .record_result(&instance_key, attempt_latency_ms, outcome.is_ok())
                .await;

            match outcome {
                Ok(payload) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.emit_route_called(&request, true, &instance_key, latency_ms)
                        .await;
                    return RouteResponse {
                        request_id: request.request_id,
                        success: true,
                        payload: Some(payload),
                        error: None,
                        latency_ms,
                        target_instance: instance_key,
                        retries_used: request.retries_used,
                    };
                }
                Err(err) => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        target = %request.target,
                        instance = %instance_key,
                        retries_used = request.retries_used,
                        error = %err,
                        "route attempt failed"
                    );
                    if err.is_retryable() && self.permits_retry(&request) {
                        request.retries_used += 1;
                        tokio::time::sleep(self.retry.backoff_for(request.retries_used)).await;
                        continue;
                    }
                    return self
                        .finish_failure(&request, err.to_string(), started, instance_key)
                        .await;
                }
            }
        }
    }

    /// Another retry is allowed when attempts remain and its backoff still
    /// finishes before the absolute deadline.
    fn permits_retry(&self, request: &RouteRequest) -> bool {
        if request.retries_used >= request.max_retries {
            return false;
        }
        let backoff = self.retry.backoff_for(request.retries_used + 1);
        Instant::now() + backoff < request.deadline
    }

    async fn finish_failure(
        &self,
        request: &RouteRequest,
        error: impl Into<String>,
        started: Instant,
        instance_key: String,
    ) -> RouteResponse {
        let error = error.into();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.emit_route_called(request, false, &instance_key, latency_ms)
            .await;
        RouteResponse {
            request_id: request.request_id,
            success: false,
            payload: None,
            error: Some(error),
            latency_ms,
            target_instance: instance_key,
            retries_used: request.retries_used,
        }
    }

    async fn emit_route_called(
        &self,
        request: &RouteRequest,
        success: bool,
        instance_key: &str,
        latency_ms: f64,
    ) {
        let mut metadata = Metadata::new();
        metadata.insert("instance".to_string(), json!(instance_key));
        metadata.insert("latency_ms".to_string(), json!(latency_ms));
        metadata.insert("strategy".to_string(), json!(request.strategy.as_str()));
        self.store
            .append(Event::new(EventPayload::RouteCalled {
                source_service: request.source.clone(),
                target_service: request.target.clone(),
                method: request.method.clone(),
                success,
                metadata,
            }))
            .await;
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            pending_requests: self.queue.pending_count(),
            in_flight_requests: self.queue.in_flight_count(),
            workers: self.workers.lock().await.len(),
            pooled_channels: self.transport.channel_count().await,
            tracked_instances: self.balancer.tracked_instances().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use agent_mesh_control::ServiceInstance;
    use agent_mesh_core::events::{EventFilter, EventKind, ServiceStatus};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn instance(name: &str, id: &str, host: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            service_id: id.to_string(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            host: host.to_string(),
            grpc_port: port,
            health_port: port + 1,
            metrics_port: port + 2,
            manifest: json!({
                "kind": "AOLAgent",
                "apiVersion": "mesh/v1",
                "metadata": { "name": name },
                "spec": {},
            }),
            tags: BTreeSet::new(),
            meta: HashMap::new(),
            status: ServiceStatus::Starting,
            last_heartbeat: Utc::now(),
        }
    }

    async fn router_with(
        transport: Arc<ScriptedTransport>,
    ) -> (Arc<EventStore>, Arc<ServiceRegistry>, Arc<Router>) {
        let store = Arc::new(EventStore::new(1000));
        let registry = Arc::new(ServiceRegistry::new(store.clone()));
        let router = Router::new(
            registry.clone(),
            store.clone(),
            transport,
            RouterConfig {
                workers: 2,
                queue_capacity: 16,
            },
            CircuitBreakerConfig::default(),
            RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                multiplier: 2.0,
            },
        );
        router.start().await;
        (store, registry, router)
    }

    #[tokio::test]
    async fn routes_to_a_healthy_instance() {
        let transport = Arc::new(ScriptedTransport::default());
        let (store, registry, router) = router_with(transport).await;
        registry.register(instance("svc-b", "i1", "h1", 50051)).await.unwrap();
        registry
            .update_health("svc-b", "i1", ServiceStatus::Healthy)
            .await
            .unwrap();

        let response = router
            .route(RouteSubmission::new("svc-a", "svc-b", "Process", Bytes::from_static(b"{}")))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.target_instance, "h1:50051");
        assert_eq!(response.retries_used, 0);

        let events = store
            .get_events(EventFilter {
                kind: Some(EventKind::RouteCalled),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::RouteCalled {
                success, metadata, ..
            } => {
                assert!(success);
                assert_eq!(metadata["instance"], json!("h1:50051"));
                assert_eq!(metadata["strategy"], json!("health_aware"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        router.stop().await;
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_first("h1:50051", 1);
        let (_store, registry, router) = router_with(transport).await;
        registry.register(instance("svc-b", "i1", "h1", 50051)).await.unwrap();
        registry
            .update_health("svc-b", "i1", ServiceStatus::Healthy)
            .await
            .unwrap();

        let response = router
            .route(RouteSubmission::new("svc-a", "svc-b", "Process", Bytes::new()))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.retries_used, 1);
        router.stop().await;
    }

    #[tokio::test]
    async fn unknown_target_fails_without_instances() {
        let transport = Arc::new(ScriptedTransport::default());
        let (store, _registry, router) = router_with(transport).await;

        let response = router
            .route(RouteSubmission::new("svc-a", "ghost", "Process", Bytes::new()))
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("no instances"));

        let events = store
            .get_events(EventFilter {
                kind: Some(EventKind::RouteCalled),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
        router.stop().await;
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_first("h1:50051", 100);
        let (_store, registry, router) = router_with(transport).await;
        registry.register(instance("svc-b", "i1", "h1", 50051)).await.unwrap();
        registry
            .update_health("svc-b", "i1", ServiceStatus::Healthy)
            .await
            .unwrap();

        let response = router
            .route(RouteSubmission::new("svc-a", "svc-b", "Process", Bytes::new()))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.retries_used, 2);
        router.stop().await;
    }

    #[tokio::test]
    async fn queue_full_rejects_synchronously() {
        let store = Arc::new(EventStore::new(100));
        let registry = Arc::new(ServiceRegistry::new(store.clone()));
        let router = Router::new(
            registry,
            store,
            Arc::new(ScriptedTransport::default()),
            RouterConfig {
                workers: 1,
                queue_capacity: 1,
            },
            CircuitBreakerConfig::default(),
            RetryPolicy::default(),
        );
        // Workers never started: the queue fills and rejects.
        let first = router.queue.submit(RouteRequest {
            request_id: Uuid::new_v4(),
            source: "a".to_string(),
            target: "b".to_string(),
            method: "Process".to_string(),
            payload: Bytes::new(),
            metadata: HashMap::new(),
            deadline: Instant::now() + Duration::from_secs(1),
            retries_used: 0,
            max_retries: 0,
            strategy: RoutingStrategy::RoundRobin,
        });
        assert!(first.is_ok());
        let err = router
            .route(RouteSubmission::new("a", "b", "Process", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { .. }));
    }
}
