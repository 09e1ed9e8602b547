//! Test doubles for the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use agent_mesh_core::error::MeshError;

use crate::transport::RpcTransport;

/// Transport stub that fails a scripted number of calls per address and
/// echoes payloads afterwards.
#[derive(Default)]
pub struct ScriptedTransport {
    failures: Mutex<HashMap<String, u32>>,
    calls: AtomicU64,
}

impl ScriptedTransport {
    /// The next `count` calls to `address` fail with a transient error.
    pub fn fail_first(&self, address: &str, count: u32) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(address.to_string(), count);
    }

    /// Total calls observed across all addresses.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn call(
        &self,
        address: &str,
        _method: &str,
        _metadata: &HashMap<String, String>,
        payload: Bytes,
        _deadline: Instant,
    ) -> Result<Bytes, MeshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().expect("failures lock");
            if let Some(remaining) = failures.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MeshError::remote_unavailable(format!(
                        "scripted failure for {}",
                        address
                    )));
                }
            }
        }
        Ok(payload)
    }

    async fn evict(&self, _address: &str) {}

    async fn shutdown(&self) {}

    async fn channel_count(&self) -> usize {
        0
    }
}
