//! Async request router for the agent mesh.
//!
//! - [`queue`] - bounded submit queue with one-shot reply slots
//! - [`balancer`] - health-aware instance selection and per-instance
//!   circuit breakers
//! - [`circuit`] - the breaker state machine
//! - [`transport`] - framed-RPC channel pool
//! - [`router`] - the worker pool tying it all together

pub mod balancer;
pub mod circuit;
pub mod queue;
pub mod router;
pub mod testing;
pub mod transport;

pub use balancer::{InstanceMetrics, LoadBalancer, RoutingStrategy};
pub use circuit::{CircuitBreaker, CircuitState};
pub use queue::{RequestQueue, RouteRequest, RouteResponse};
pub use router::{Router, RouterStats, RouteSubmission};
pub use transport::{FramedTcpTransport, RpcTransport};
