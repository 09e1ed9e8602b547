//! Bounded submit queue feeding the router's worker pool.
//!
//! Each submission carries a one-shot reply slot the worker resolves on
//! completion. `submit` never blocks: at capacity it rejects with a
//! queue-full error, which the caller sees synchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use agent_mesh_core::error::MeshError;

use crate::balancer::RoutingStrategy;

/// One request travelling through the router.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub request_id: Uuid,
    pub source: String,
    pub target: String,
    pub method: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
    /// Absolute deadline; retries never extend it.
    pub deadline: Instant,
    pub retries_used: u32,
    pub max_retries: u32,
    pub strategy: RoutingStrategy,
}

/// The router's answer for one request.
#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub request_id: Uuid,
    pub success: bool,
    pub payload: Option<Bytes>,
    pub error: Option<String>,
    pub latency_ms: f64,
    pub target_instance: String,
    pub retries_used: u32,
}

impl RouteResponse {
    pub fn failure(request_id: Uuid, error: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            request_id,
            success: false,
            payload: None,
            error: Some(error.into()),
            latency_ms,
            target_instance: String::new(),
            retries_used: 0,
        }
    }
}

pub(crate) type QueueItem = (RouteRequest, oneshot::Sender<RouteResponse>);

/// Bounded multi-producer queue with a shared worker-side receiver.
pub struct RequestQueue {
    sender: mpsc::Sender<QueueItem>,
    receiver: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Enqueue a request, returning the reply slot. Rejects immediately at
    /// capacity.
    pub fn submit(
        &self,
        request: RouteRequest,
    ) -> Result<oneshot::Receiver<RouteResponse>, MeshError> {
        let (reply, receiver) = oneshot::channel();
        match self.sender.try_send((request, reply)) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::Relaxed);
                Ok(receiver)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(MeshError::QueueFull {
                queue: "router".to_string(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MeshError::internal(
                "router queue closed before submission",
            )),
        }
    }

    /// Worker-side dequeue. Returns `None` once the queue is closed and
    /// drained.
    pub(crate) async fn dequeue(&self) -> Option<QueueItem> {
        let item = self.receiver.lock().await.recv().await;
        if item.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            self.in_flight.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Marks a dequeued request finished.
    pub(crate) fn finish(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(target: &str) -> RouteRequest {
        RouteRequest {
            request_id: Uuid::new_v4(),
            source: "src".to_string(),
            target: target.to_string(),
            method: "Process".to_string(),
            payload: Bytes::from_static(b"{}"),
            metadata: HashMap::new(),
            deadline: Instant::now() + Duration::from_secs(30),
            retries_used: 0,
            max_retries: 3,
            strategy: RoutingStrategy::HealthAware,
        }
    }

    #[tokio::test]
    async fn rejects_submissions_at_capacity() {
        let queue = RequestQueue::new(2);
        queue.submit(request("a")).unwrap();
        queue.submit(request("b")).unwrap();
        let err = queue.submit(request("c")).unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { .. }));
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn dequeue_tracks_pending_and_in_flight() {
        let queue = RequestQueue::new(4);
        queue.submit(request("a")).unwrap();
        assert_eq!(queue.pending_count(), 1);
        let item = queue.dequeue().await.unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.in_flight_count(), 1);
        queue.finish();
        assert_eq!(queue.in_flight_count(), 0);
        drop(item);
    }
}
