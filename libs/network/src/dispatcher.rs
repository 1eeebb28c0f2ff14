//! Dispatcher: the core request intake facade.
//!
//! Resolves each request's target via the locator against the bucket's
//! current topology snapshot, forwards it to the right service, and retries
//! transient topology failures with backoff. Topology snapshots are
//! published through an atomic handle swap; in-flight requests already
//! assigned to an endpoint are never migrated.

use crate::config::CoreConfig;
use crate::endpoint::DispatchEntry;
use crate::error::{ClientError, Result};
use crate::locator::{locate, NodeRef, RingCache};
use crate::request::{completion, CompletionHandle, CompletionSink, Request};
use crate::service::Service;
use crate::transport::{Connector, TcpConnector};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use reef_codec::{opcode, Frame};
use reef_types::{ClusterMap, ServiceType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Consumer of topology updates produced by the config refresher.
pub trait TopologySink: Send + Sync {
    /// Offer a new snapshot; stale revisions are dropped silently.
    fn install(&self, map: Arc<ClusterMap>);

    /// Mark a bucket's installed topology as provisionally unreliable
    /// without discarding it.
    fn set_tainted(&self, bucket: &str, tainted: bool);
}

struct BucketState {
    map: ArcSwapOption<ClusterMap>,
    rings: RingCache,
    tainted: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    host: String,
    port: u16,
    service: ServiceType,
}

/// Top-level dispatch facade of the client core.
pub struct Core {
    config: CoreConfig,
    connector: Arc<dyn Connector>,
    buckets: DashMap<String, Arc<BucketState>>,
    services: DashMap<ServiceKey, Arc<Service>>,
}

impl Core {
    /// Create a core with a custom connector (tests inject in-memory
    /// transports here).
    pub fn new(config: CoreConfig, connector: Arc<dyn Connector>) -> Result<Arc<Core>> {
        config.validate()?;
        Ok(Arc::new(Core {
            config,
            connector,
            buckets: DashMap::new(),
            services: DashMap::new(),
        }))
    }

    /// Create a core with the standard TCP connector.
    pub fn with_tcp(config: CoreConfig) -> Result<Arc<Core>> {
        let connector = Arc::new(TcpConnector::new(
            config.connect_timeout,
            config.max_frame_body,
        ));
        Self::new(config, connector)
    }

    /// Register a bucket. Dispatch works once the first topology snapshot
    /// for it is installed.
    pub fn open_bucket(&self, name: impl Into<String>) {
        let name = name.into();
        self.buckets.entry(name.clone()).or_insert_with(|| {
            info!(bucket = %name, "Bucket opened");
            Arc::new(BucketState {
                map: ArcSwapOption::empty(),
                rings: RingCache::new(),
                tainted: AtomicBool::new(false),
            })
        });
    }

    /// Drop a bucket and tear down endpoints no other bucket needs.
    pub fn close_bucket(&self, name: &str) {
        if self.buckets.remove(name).is_some() {
            info!(bucket = %name, "Bucket closed");
            self.prune_services();
        }
    }

    /// The bucket's currently installed snapshot.
    pub fn topology(&self, bucket: &str) -> Option<Arc<ClusterMap>> {
        self.buckets.get(bucket).and_then(|b| b.map.load_full())
    }

    pub fn is_tainted(&self, bucket: &str) -> bool {
        self.buckets
            .get(bucket)
            .map(|b| b.tainted.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Submit a request. Returns immediately; resolution happens through
    /// the handle.
    pub fn submit(self: &Arc<Self>, request: Request) -> CompletionHandle {
        let (sink, handle) = completion(request.deadline);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.dispatch_with_retry(request, sink).await;
        });
        handle
    }

    /// Tear down every service and endpoint.
    pub fn shutdown(&self) {
        for entry in self.services.iter() {
            entry.value().shutdown();
        }
        self.services.clear();
        self.buckets.clear();
        info!("Core shut down");
    }

    async fn dispatch_with_retry(self: Arc<Self>, request: Request, sink: CompletionSink) {
        let mut sink = Some(sink);
        let mut last_error = None;
        let max_attempts = self.config.retry.max_attempts;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.calculate_delay(attempt - 1)).await;
            }
            if sink.as_ref().map(|s| s.is_cancelled()).unwrap_or(true) {
                return;
            }

            let Some(bucket) = self.buckets.get(&request.bucket).map(|b| Arc::clone(&b)) else {
                if let Some(sink) = sink.take() {
                    sink.complete(Err(ClientError::BucketNotOpen {
                        bucket: request.bucket.clone(),
                    }));
                }
                return;
            };
            let Some(map) = bucket.map.load_full() else {
                if let Some(sink) = sink.take() {
                    sink.complete(Err(ClientError::NoTopology {
                        bucket: request.bucket.clone(),
                    }));
                }
                return;
            };

            let located = locate(&request, &map, &bucket.rings);
            let error = match located {
                Ok(node_ref) => {
                    if bucket.tainted.load(Ordering::Acquire) {
                        debug!(bucket = %request.bucket, "Dispatching against tainted topology");
                    }
                    let service = self.service_for(&request, &node_ref, &map);
                    let Some(taken) = sink.take() else { return };
                    let entry = DispatchEntry {
                        frame: request.kind.encode(),
                        sink: taken,
                    };
                    match service.dispatch(entry).await {
                        Ok(()) => return,
                        Err((entry, error)) => {
                            sink = Some(entry.sink);
                            error
                        }
                    }
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                if let Some(sink) = sink.take() {
                    sink.complete(Err(error));
                }
                return;
            }
            debug!(bucket = %request.bucket, attempt, "Transient dispatch failure: {}", error);
            last_error = Some(error);
        }

        if let Some(sink) = sink.take() {
            let last = last_error.unwrap_or(ClientError::NoTopology {
                bucket: request.bucket.clone(),
            });
            sink.complete(Err(ClientError::RetryExhausted {
                attempts: max_attempts,
                last: Box::new(last),
            }));
        }
    }

    /// Look up or lazily create the service for a resolved target.
    fn service_for(
        self: &Arc<Self>,
        request: &Request,
        node_ref: &NodeRef,
        map: &ClusterMap,
    ) -> Arc<Service> {
        let port = if self.config.tls {
            map.node_at(node_ref.index)
                .and_then(|n| n.port_for(request.service, true))
                .unwrap_or(node_ref.port)
        } else {
            node_ref.port
        };
        let key = ServiceKey {
            host: node_ref.host.clone(),
            port,
            service: request.service,
        };
        if let Some(service) = self.services.get(&key) {
            return Arc::clone(&service);
        }

        let oob = self.oob_handler(request.bucket.clone(), node_ref.host.clone());
        let service = Service::open(
            key.host.clone(),
            key.port,
            key.service,
            self.config.endpoints_per_node,
            self.config.request_queue_depth,
            Arc::clone(&self.connector),
            self.config.retry.clone(),
            Some(oob),
        );
        self.services
            .entry(key)
            .or_insert(service)
            .value()
            .clone()
    }

    /// Out-of-band frames pushed on data connections can carry fresh config
    /// payloads; they feed the same install path as the refresher.
    fn oob_handler(self: &Arc<Self>, bucket: String, origin: String) -> crate::endpoint::OobHandler {
        let weak: Weak<Core> = Arc::downgrade(self);
        Arc::new(move |frame: Frame| {
            if frame.opcode != opcode::CONFIG {
                debug!(opcode = frame.opcode, "Ignoring unsolicited non-config frame");
                return;
            }
            let Some(core) = weak.upgrade() else { return };
            match std::str::from_utf8(&frame.body) {
                Ok(raw) => match reef_types::parse_payload(raw, &origin) {
                    Ok(map) => core.install(Arc::new(map)),
                    Err(e) => warn!(%bucket, "Dropping malformed pushed config: {}", e),
                },
                Err(_) => warn!(%bucket, "Dropping non-UTF8 pushed config"),
            }
        })
    }

    /// Drop services no open bucket references anymore.
    fn prune_services(&self) {
        let mut live: std::collections::HashSet<ServiceKey> = std::collections::HashSet::new();
        for bucket in self.buckets.iter() {
            let Some(map) = bucket.value().map.load_full() else {
                continue;
            };
            for node in map.nodes() {
                for service in ServiceType::ALL {
                    if let Some(port) = node.port_for(service, self.config.tls) {
                        live.insert(ServiceKey {
                            host: node.host.clone(),
                            port,
                            service,
                        });
                    }
                    // Both port flavors stay live while a bucket references
                    // the node; pruning only targets removed nodes.
                    if let Some(port) = node.port_for(service, !self.config.tls) {
                        live.insert(ServiceKey {
                            host: node.host.clone(),
                            port,
                            service,
                        });
                    }
                }
            }
        }

        let dead: Vec<ServiceKey> = self
            .services
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in dead {
            if let Some((_, service)) = self.services.remove(&key) {
                info!(host = %key.host, port = key.port, service = %key.service, "Pruning service");
                service.shutdown();
            }
        }
    }
}

impl TopologySink for Core {
    fn install(&self, map: Arc<ClusterMap>) {
        let Some(bucket) = self.buckets.get(map.bucket()) else {
            debug!(bucket = %map.bucket(), "Ignoring config for unopened bucket");
            return;
        };
        if let Err(e) = map.validate() {
            warn!(bucket = %map.bucket(), "Rejecting structurally invalid config: {}", e);
            return;
        }

        // Writes are serialized per bucket (one refresher monitor), so a
        // load-then-store is race-free here; readers always see a complete
        // snapshot through the atomic swap.
        let current = bucket.map.load_full();
        if let Some(current) = &current {
            if map.revision() <= current.revision() {
                debug!(
                    bucket = %map.bucket(),
                    installed = current.revision(),
                    offered = map.revision(),
                    "Ignoring stale config push"
                );
                return;
            }
        }
        info!(bucket = %map.bucket(), revision = map.revision(), "Installing topology snapshot");
        bucket.map.store(Some(Arc::clone(&map)));
        drop(bucket);
        self.prune_services();
    }

    fn set_tainted(&self, bucket: &str, tainted: bool) {
        if let Some(state) = self.buckets.get(bucket) {
            state.tainted.store(tainted, Ordering::Release);
            debug!(%bucket, tainted, "Bucket taint updated");
        }
    }
}
