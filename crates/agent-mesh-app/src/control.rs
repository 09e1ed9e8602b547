//! The control-plane facade.
//!
//! [`ControlPlane`] wires the registry, health supervisor, event store,
//! credit engine, router, and workflow executor together and exposes the
//! query and submission surface an external transport (HTTP, gRPC) would
//! serve. The facade itself carries no transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use agent_mesh_control::{
    DiscoveryProvider, HealthSupervisor, RegistrySnapshot, ServiceInstance, ServiceRegistry,
};
use agent_mesh_core::credit::{CreditEngine, CreditStats, WorkflowHealth};
use agent_mesh_core::error::MeshError;
use agent_mesh_core::events::{
    service_channel, workflow_channel, AgentReport, Event, EventFilter, EventStore, StoreStats,
    Subscription, WorkflowReport, GLOBAL_CHANNEL,
};
use agent_mesh_router::{
    FramedTcpTransport, Router, RouterStats, RouteResponse, RouteSubmission, RpcTransport,
};
use agent_mesh_workflow::{ExecutionResult, ServiceInvoker, WorkflowExecutor, WorkflowGraph};

use crate::config::AppConfig;

/// Event-stream topic selector.
#[derive(Debug, Clone)]
pub enum Topic {
    Global,
    Service(String),
    Workflow(String),
}

impl Topic {
    fn channel_name(&self) -> String {
        match self {
            Topic::Global => GLOBAL_CHANNEL.to_string(),
            Topic::Service(name) => service_channel(name),
            Topic::Workflow(id) => workflow_channel(id),
        }
    }
}

/// Aggregated control-plane statistics.
#[derive(Debug, Clone)]
pub struct ControlPlaneStats {
    pub store: StoreStats,
    pub router: RouterStats,
    pub credit: CreditStats,
}

/// Bridges workflow agent nodes onto the router.
struct RouterInvoker {
    router: Arc<Router>,
    source: String,
}

#[async_trait]
impl ServiceInvoker for RouterInvoker {
    async fn invoke(
        &self,
        service_name: &str,
        method: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<Value, MeshError> {
        let payload = serde_json::to_vec(&input)?;
        let mut submission =
            RouteSubmission::new(&self.source, service_name, method, Bytes::from(payload));
        submission.timeout = timeout;
        let response = self.router.route(submission).await?;
        if !response.success {
            return Err(MeshError::remote_unavailable(
                response
                    .error
                    .unwrap_or_else(|| "route failed".to_string()),
            ));
        }
        match response.payload {
            Some(payload) if !payload.is_empty() => {
                serde_json::from_slice(&payload).map_err(Into::into)
            }
            _ => Ok(Value::Null),
        }
    }
}

/// The assembled control plane.
pub struct ControlPlane {
    store: Arc<EventStore>,
    registry: Arc<ServiceRegistry>,
    supervisor: Arc<HealthSupervisor>,
    credit: Arc<CreditEngine>,
    router: Arc<Router>,
    executor: Arc<WorkflowExecutor>,
    credit_interval: Duration,
    shutdown: CancellationToken,
}

impl ControlPlane {
    /// Wire all components from configuration. The discovery provider is
    /// optional so tests and single-node setups can run without one.
    pub fn build(
        config: &AppConfig,
        discovery: Option<Arc<dyn DiscoveryProvider>>,
    ) -> Arc<Self> {
        Self::build_with_transport(config, discovery, Arc::new(FramedTcpTransport::new()))
    }

    /// Same as [`ControlPlane::build`] with an explicit transport seam.
    pub fn build_with_transport(
        config: &AppConfig,
        discovery: Option<Arc<dyn DiscoveryProvider>>,
        transport: Arc<dyn RpcTransport>,
    ) -> Arc<Self> {
        let store = Arc::new(EventStore::new(config.core.event_store.capacity));
        let registry = Arc::new(ServiceRegistry::new(store.clone()));
        let credit = Arc::new(CreditEngine::new(
            store.clone(),
            config.core.lazy_detection.clone(),
        ));

        let mut supervisor = HealthSupervisor::new(
            registry.clone(),
            store.clone(),
            config.core.health.clone(),
        )
        .with_credit(credit.clone());
        if let Some(discovery) = discovery {
            supervisor = supervisor.with_discovery(discovery);
        }
        let supervisor = Arc::new(supervisor);

        let router = Router::new(
            registry.clone(),
            store.clone(),
            transport,
            config.core.router.clone(),
            config.core.circuit_breaker.clone(),
            config.core.retry.clone(),
        );

        let executor = Arc::new(
            WorkflowExecutor::new(config.core.workflow.clone())
                .with_invoker(Arc::new(RouterInvoker {
                    router: router.clone(),
                    source: config.service_name.clone(),
                }))
                .with_store(store.clone())
                .with_credit(credit.clone()),
        );

        Arc::new(Self {
            store,
            registry,
            supervisor,
            credit,
            router,
            executor,
            credit_interval: config.core.health.check_interval,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the background machinery: probe sweeps, router workers, and
    /// the periodic credit analysis tick.
    pub async fn start(self: &Arc<Self>) {
        self.supervisor.spawn();
        self.router.start().await;

        let credit = self.credit.clone();
        let interval = self.credit_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for decision in credit.tick().await {
                            tracing::info!(
                                workflow_id = %decision.workflow_id,
                                reason = %decision.reason,
                                "deliberation restarted"
                            );
                        }
                    }
                }
            }
        });
        tracing::info!("control plane started");
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.supervisor.stop();
        self.router.stop().await;
        tracing::info!("control plane stopped");
    }

    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    // --- Registration surface -------------------------------------------

    pub async fn register_service(&self, instance: ServiceInstance) -> Result<(), MeshError> {
        self.supervisor.register_service(instance).await
    }

    pub async fn deregister_service(
        &self,
        service_name: &str,
        service_id: &str,
    ) -> Result<(), MeshError> {
        self.supervisor
            .deregister_service(service_name, service_id)
            .await
    }

    // --- Query surface --------------------------------------------------

    pub async fn list_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.registry.list_all().await
    }

    pub async fn get_service(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.registry.instances(service_name).await
    }

    pub async fn registry_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot().await
    }

    pub async fn list_events(&self, filter: EventFilter) -> Vec<Event> {
        self.store.get_events(filter).await
    }

    pub async fn list_routes(
        &self,
        source: Option<&str>,
        target: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        self.store.get_route_events(source, target, limit).await
    }

    /// All events for one workflow, oldest first.
    pub async fn workflow_timeline(&self, workflow_id: &str) -> Vec<Event> {
        self.store
            .get_events(EventFilter {
                workflow: Some(workflow_id.to_string()),
                limit: Some(self.store.capacity()),
                ..Default::default()
            })
            .await
    }

    pub async fn agent_report(&self, agent_id: &str) -> AgentReport {
        self.store.agent_report(agent_id).await
    }

    pub async fn workflow_report(&self, workflow_id: &str) -> Option<WorkflowReport> {
        self.store.workflow_report(workflow_id).await
    }

    pub async fn workflow_health(&self, workflow_id: &str) -> Option<WorkflowHealth> {
        self.credit.workflow_health(workflow_id).await
    }

    pub async fn stats(&self) -> ControlPlaneStats {
        ControlPlaneStats {
            store: self.store.stats().await,
            router: self.router.stats().await,
            credit: self.credit.stats().await,
        }
    }

    /// Subscribe to the event stream by topic. Idempotent per subscriber
    /// id.
    pub async fn subscribe(&self, topic: Topic, subscriber_id: &str) -> Subscription {
        self.store
            .bus()
            .subscribe(&topic.channel_name(), subscriber_id)
            .await
    }

    // --- Submission surface ---------------------------------------------

    pub async fn submit_route(
        &self,
        submission: RouteSubmission,
    ) -> Result<RouteResponse, MeshError> {
        self.router.route(submission).await
    }

    pub async fn submit_workflow(
        &self,
        graph: &WorkflowGraph,
        input: Value,
    ) -> ExecutionResult {
        self.executor.execute(graph, input).await
    }

    pub async fn cancel_workflow_execution(&self, execution_id: &str) -> bool {
        self.executor.cancel(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_mesh_core::events::{EventKind, ServiceStatus};
    use agent_mesh_router::testing::ScriptedTransport;
    use agent_mesh_router::RoutingStrategy;
    use agent_mesh_workflow::WorkflowBuilder;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn test_config() -> AppConfig {
        AppConfig {
            core: agent_mesh_core::config::CoreConfig::default(),
            consul_addr: "http://127.0.0.1:8500".to_string(),
            host: "127.0.0.1".to_string(),
            grpc_port: 50051,
            health_port: 50200,
            metrics_port: 8080,
            service_name: "agent-mesh-core".to_string(),
        }
    }

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

    #[tokio::test]
    async fn end_to_end_route_through_the_facade() {
        let transport = Arc::new(ScriptedTransport::default());
        let plane = ControlPlane::build_with_transport(&test_config(), None, transport);
        plane.start().await;

        plane
            .register_service(instance("svc-b", "i1", "h1", 50061))
            .await
            .unwrap();
        plane
            .registry
            .update_health("svc-b", "i1", ServiceStatus::Healthy)
            .await
            .unwrap();

        let mut submission =
            RouteSubmission::new("cli", "svc-b", "Process", Bytes::from_static(b"{\"k\":1}"));
        submission.strategy = RoutingStrategy::RoundRobin;
        let response = plane.submit_route(submission).await.unwrap();
        assert!(response.success);

        let routes = plane.list_routes(Some("cli"), None, 10).await;
        assert_eq!(routes.len(), 1);
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn workflow_submission_produces_a_timeline() {
        let transport = Arc::new(ScriptedTransport::default());
        let plane = ControlPlane::build_with_transport(&test_config(), None, transport);
        plane.start().await;

        plane
            .register_service(instance("svc-echo", "i1", "h1", 50071))
            .await
            .unwrap();
        plane
            .registry
            .update_health("svc-echo", "i1", ServiceStatus::Healthy)
            .await
            .unwrap();

        let graph = WorkflowBuilder::new("echo-flow")
            .add_agent("step", "svc-echo")
            .build()
            .unwrap();
        let result = plane.submit_workflow(&graph, json!({"k": 1})).await;
        assert!(result.success, "error: {:?}", result.error);

        let timeline = plane.workflow_timeline(&graph.workflow_id).await;
        let kinds: Vec<EventKind> = timeline.iter().map(|e| e.kind()).collect();
        assert!(kinds.contains(&EventKind::WorkflowStarted));
        assert!(kinds.contains(&EventKind::AgentContribution));
        assert!(kinds.contains(&EventKind::WorkflowCompleted));
        plane.shutdown().await;
    }

    #[tokio::test]
    async fn subscription_sees_facade_activity() {
        let transport = Arc::new(ScriptedTransport::default());
        let plane = ControlPlane::build_with_transport(&test_config(), None, transport);

        let subscription = plane.subscribe(Topic::Global, "watcher").await;
        plane
            .register_service(instance("svc-b", "i1", "h1", 50081))
            .await
            .unwrap();
        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::ServiceRegistered);
    }
}
