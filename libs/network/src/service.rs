//! Service: all endpoints of one service type on one node.
//!
//! A service owns a fixed number of endpoint slots (configuration-driven,
//! stable for its lifetime). Each slot runs a supervisor task that connects,
//! waits for the endpoint to die, and reconnects with backoff. Endpoints
//! are recreated, never resized. Dispatch round-robins over the currently
//! connected endpoints only.

use crate::config::RetryConfig;
use crate::endpoint::{DispatchEntry, Endpoint, Lifecycle, OobHandler};
use crate::error::ClientError;
use crate::transport::Connector;
use parking_lot::RwLock;
use reef_types::ServiceType;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Aggregate health of a service's endpoint pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    /// Every endpoint is connected
    Connected,
    /// Some, but not all, endpoints are connected
    Degraded,
    /// No endpoint is connected
    Disconnected,
}

struct Slot {
    endpoint: RwLock<Option<Arc<Endpoint>>>,
    supervisor: RwLock<Option<JoinHandle<()>>>,
}

/// Endpoint pool for one (node, service type) pair.
pub struct Service {
    host: String,
    port: u16,
    service_type: ServiceType,
    slots: Vec<Arc<Slot>>,
    next: AtomicUsize,
    shutting_down: Arc<AtomicBool>,
}

impl Service {
    /// Create the service and spawn one supervisor per endpoint slot.
    pub fn open(
        host: impl Into<String>,
        port: u16,
        service_type: ServiceType,
        pool_size: usize,
        queue_depth: usize,
        connector: Arc<dyn Connector>,
        reconnect: RetryConfig,
        oob: Option<OobHandler>,
    ) -> Arc<Service> {
        let host = host.into();
        let slots: Vec<Arc<Slot>> = (0..pool_size)
            .map(|_| {
                Arc::new(Slot {
                    endpoint: RwLock::new(None),
                    supervisor: RwLock::new(None),
                })
            })
            .collect();

        let service = Arc::new(Service {
            host: host.clone(),
            port,
            service_type,
            slots,
            next: AtomicUsize::new(0),
            shutting_down: Arc::new(AtomicBool::new(false)),
        });

        for (index, slot) in service.slots.iter().enumerate() {
            let handle = tokio::spawn(supervise_slot(
                Arc::clone(slot),
                host.clone(),
                port,
                queue_depth,
                Arc::clone(&connector),
                reconnect.clone(),
                Arc::clone(&service.shutting_down),
                oob.clone(),
                index,
            ));
            *slot.supervisor.write() = Some(handle);
        }

        info!(host = %service.host, port, service = %service_type, pool_size, "Service opened");
        service
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Round-robin over connected endpoints; endpoints that are connecting,
    /// degraded or down are skipped. Hands the entry back with
    /// `NoHealthyEndpoint` when nothing qualifies; the dispatcher decides
    /// whether to retry.
    pub async fn dispatch(
        &self,
        entry: DispatchEntry,
    ) -> std::result::Result<(), (DispatchEntry, ClientError)> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let count = self.slots.len();

        let mut entry = entry;
        for offset in 0..count {
            let slot = &self.slots[(start + offset) % count];
            let endpoint = {
                let guard = slot.endpoint.read();
                guard.as_ref().map(Arc::clone)
            };
            let Some(endpoint) = endpoint else { continue };
            if !endpoint.is_connected() {
                continue;
            }
            match endpoint.send(entry).await {
                Ok(()) => return Ok(()),
                // Endpoint died under us; try the next slot.
                Err(returned) => entry = returned,
            }
        }

        Err((
            entry,
            ClientError::NoHealthyEndpoint {
                host: self.host.clone(),
                service: self.service_type,
            },
        ))
    }

    /// Aggregate pool health.
    pub fn health(&self) -> ServiceHealth {
        let connected = self
            .slots
            .iter()
            .filter(|slot| {
                slot.endpoint
                    .read()
                    .as_ref()
                    .map(|e| e.is_connected())
                    .unwrap_or(false)
            })
            .count();
        if connected == 0 {
            ServiceHealth::Disconnected
        } else if connected == self.slots.len() {
            ServiceHealth::Connected
        } else {
            ServiceHealth::Degraded
        }
    }

    /// Stop supervisors and disconnect every endpoint.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for slot in &self.slots {
            if let Some(handle) = slot.supervisor.write().take() {
                handle.abort();
            }
            if let Some(endpoint) = slot.endpoint.write().take() {
                endpoint.disconnect();
            }
        }
        info!(host = %self.host, port = self.port, service = %self.service_type, "Service shut down");
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise_slot(
    slot: Arc<Slot>,
    host: String,
    port: u16,
    queue_depth: usize,
    connector: Arc<dyn Connector>,
    reconnect: RetryConfig,
    shutting_down: Arc<AtomicBool>,
    oob: Option<OobHandler>,
    index: usize,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutting_down.load(Ordering::Acquire) {
            return;
        }

        match Endpoint::connect(connector.as_ref(), &host, port, queue_depth, oob.clone()).await {
            Ok(endpoint) => {
                attempt = 0;
                let endpoint = Arc::new(endpoint);
                let mut state = endpoint.watch_state();
                *slot.endpoint.write() = Some(Arc::clone(&endpoint));

                // Park until the endpoint reaches Disconnected, then recreate it.
                while *state.borrow() != Lifecycle::Disconnected {
                    if state.changed().await.is_err() {
                        break;
                    }
                }
                *slot.endpoint.write() = None;
                debug!(%host, port, slot = index, "Endpoint slot lost its connection");
            }
            Err(e) => {
                warn!(%host, port, slot = index, attempt, "Endpoint connect failed: {}", e);
            }
        }

        let delay = reconnect.calculate_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}
