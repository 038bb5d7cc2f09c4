//! The transport registry (spec.md §3, §4.2, §4.9-§4.10): owns the listening
//! socket, hands out [`LocalEndPoint`]s, and tears everything down together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::net::TcpListener;
use tokio::time::Duration;

use crate::address::EndPointAddress;
use crate::error::NewEndPointErrorCode;
use crate::local::{LocalEndPoint, LocalShared};
use crate::listener;

/// Tuning knobs for a [`Transport`]. `[SUPPLEMENT]` spec.md §4.10: bounds how
/// long `connect()` will wait for an in-flight connection attempt (ours or a
/// crossed peer's) to resolve before giving up.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub resolve_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            resolve_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct TransportShared {
    self_weak: Weak<TransportShared>,
    pub(crate) bind_host: String,
    pub(crate) bind_port: u16,
    resolve_timeout: Duration,
    next_endpoint_id: AtomicI32,
    endpoints: StdMutex<HashMap<i32, Arc<LocalShared>>>,
    closed: AtomicBool,
}

impl TransportShared {
    pub(crate) fn new_endpoint(&self) -> Result<LocalEndPoint, NewEndPointErrorCode> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NewEndPointErrorCode::NewEndPointFailed);
        }
        let id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        let address = EndPointAddress::new(self.bind_host.clone(), self.bind_port.to_string(), id);
        let local = LocalShared::new(address, self.self_weak.clone(), self.resolve_timeout);
        self.endpoints.lock().unwrap().insert(id, local.clone());
        Ok(LocalEndPoint::new(local))
    }

    pub(crate) fn forget_endpoint(&self, id: i32) {
        self.endpoints.lock().unwrap().remove(&id);
    }

    pub(crate) fn lookup_endpoint(&self, id: i32) -> Option<Arc<LocalShared>> {
        self.endpoints.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn endpoints_snapshot(&self) -> Vec<Arc<LocalShared>> {
        self.endpoints.lock().unwrap().values().cloned().collect()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let locals = self.endpoints_snapshot();
        for local in locals {
            local.close().await;
        }
    }
}

/// One bound TCP listening socket and the set of [`LocalEndPoint`]s reachable
/// through it (spec.md §3).
pub struct Transport {
    inner: Arc<TransportShared>,
}

impl Transport {
    /// Binds `host:port` (`port = 0` picks an ephemeral port, as scenario 1
    /// of spec.md §8 exercises) and starts the accept loop.
    pub async fn bind(host: impl Into<String>, port: u16, config: TransportConfig) -> std::io::Result<Self> {
        let host = host.into();
        let tcp_listener = TcpListener::bind((host.as_str(), port)).await?;
        let bound_port = tcp_listener.local_addr()?.port();
        let shared = Arc::new_cyclic(|self_weak| TransportShared {
            self_weak: self_weak.clone(),
            bind_host: host,
            bind_port: bound_port,
            resolve_timeout: config.resolve_timeout,
            next_endpoint_id: AtomicI32::new(0),
            endpoints: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let accept_shared = shared.clone();
        tokio::spawn(async move {
            listener::accept_loop(accept_shared, tcp_listener).await;
        });
        Ok(Transport { inner: shared })
    }

    pub fn local_host(&self) -> &str {
        &self.inner.bind_host
    }

    pub fn local_port(&self) -> u16 {
        self.inner.bind_port
    }

    /// Allocates a fresh [`LocalEndPoint`] under this transport (spec.md §4.2).
    pub fn new_endpoint(&self) -> Result<LocalEndPoint, NewEndPointErrorCode> {
        self.inner.new_endpoint()
    }

    /// Closes every endpoint still registered under this transport and stops
    /// accepting new connections.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}
