//! Request envelope and completion plumbing.
//!
//! Requests are a tagged variant over operation kind; shared metadata
//! (bucket, service, deadline) lives in the envelope rather than a type
//! hierarchy. Each request owns exactly one completion sink which resolves
//! at most once, no matter how responses, drops, timeouts and cancellations
//! interleave.

use crate::{ClientError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use reef_codec::{opcode, Frame, FrameStatus};
use reef_types::ServiceType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Operation kind plus the fields that kind needs.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
    Query { statement: String },
    Stat { key: Option<String> },
    Config,
    Noop,
}

impl RequestKind {
    /// Wire opcode for this operation.
    pub fn opcode(&self) -> u8 {
        match self {
            RequestKind::Get { .. } => opcode::GET,
            RequestKind::Set { .. } => opcode::SET,
            RequestKind::Query { .. } => opcode::QUERY,
            RequestKind::Stat { .. } => opcode::STAT,
            RequestKind::Config => opcode::CONFIG,
            RequestKind::Noop => opcode::NOOP,
        }
    }

    /// The document key, for operations that address one.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            RequestKind::Get { key } | RequestKind::Set { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Encode the operation body into a frame.
    pub fn encode(&self) -> Frame {
        let body = match self {
            RequestKind::Get { key } => key.clone(),
            RequestKind::Set { key, value } => {
                let mut buf = BytesMut::with_capacity(2 + key.len() + value.len());
                buf.put_u16(key.len() as u16);
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
                buf.freeze()
            }
            RequestKind::Query { statement } => Bytes::copy_from_slice(statement.as_bytes()),
            RequestKind::Stat { key } => key
                .as_deref()
                .map(|k| Bytes::copy_from_slice(k.as_bytes()))
                .unwrap_or_default(),
            RequestKind::Config | RequestKind::Noop => Bytes::new(),
        };
        Frame::request(self.opcode(), body)
    }
}

/// One abstract request as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Request {
    pub bucket: String,
    pub service: ServiceType,
    pub kind: RequestKind,
    /// Route to this partition instead of hashing the key
    pub partition_hint: Option<u16>,
    /// Target the given replica slot instead of the partition master
    pub replica: Option<usize>,
    /// Absolute deadline; enforced caller-side by the completion handle
    pub deadline: Option<Instant>,
}

impl Request {
    pub fn new(bucket: impl Into<String>, service: ServiceType, kind: RequestKind) -> Self {
        Self {
            bucket: bucket.into(),
            service,
            kind,
            partition_hint: None,
            replica: None,
            deadline: None,
        }
    }

    pub fn with_partition_hint(mut self, partition: u16) -> Self {
        self.partition_hint = Some(partition);
        self
    }

    pub fn with_replica(mut self, replica: usize) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Fully decoded response, chunks already reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: FrameStatus,
    pub body: Bytes,
}

#[derive(Debug)]
struct CompletionState {
    cancelled: AtomicBool,
}

/// Producer half: resolves the request exactly once.
///
/// Owned by whichever component terminates the request (endpoint on
/// response/drop, dispatcher on retry exhaustion). Dropping it without
/// completing resolves the handle with a connection-dropped failure, so no
/// request is ever left pending.
#[derive(Debug)]
pub struct CompletionSink {
    state: Arc<CompletionState>,
    tx: oneshot::Sender<Result<Response>>,
}

impl CompletionSink {
    /// Resolve the request. Delivery is skipped silently when the caller
    /// already cancelled; the at-most-once guard is the oneshot itself.
    pub fn complete(self, result: Result<Response>) {
        if self.state.cancelled.load(Ordering::Acquire) {
            return;
        }
        // Receiver may be gone (timeout already resolved the handle).
        let _ = self.tx.send(result);
    }

    /// Whether the caller gave up on this request.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

/// Consumer half: the caller's future for the response.
#[derive(Debug)]
pub struct CompletionHandle {
    state: Arc<CompletionState>,
    rx: oneshot::Receiver<Result<Response>>,
    deadline: Option<Instant>,
    started: Instant,
}

impl CompletionHandle {
    /// Abandon the request. The transport layer keeps its queue entry and
    /// discards it silently when the matching response eventually arrives.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Wait for the terminal result, honoring the request deadline.
    pub async fn wait(self) -> Result<Response> {
        let state = Arc::clone(&self.state);
        let recv = async move {
            match self.rx.await {
                Ok(result) => result,
                // The sink is gone without delivering: either the caller
                // cancelled and delivery was skipped, or the owning endpoint
                // was torn down mid-flight.
                Err(_) if state.cancelled.load(Ordering::Acquire) => Err(ClientError::Cancelled),
                Err(_) => Err(ClientError::dropped("request abandoned by transport")),
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    result = recv => result,
                    _ = tokio::time::sleep_until(deadline) => {
                        self.state.cancelled.store(true, Ordering::Release);
                        Err(ClientError::Timeout {
                            elapsed_ms: self.started.elapsed().as_millis() as u64,
                        })
                    }
                }
            }
            None => recv.await,
        }
    }
}

/// Create a linked sink/handle pair for one request.
pub fn completion(deadline: Option<Instant>) -> (CompletionSink, CompletionHandle) {
    let state = Arc::new(CompletionState {
        cancelled: AtomicBool::new(false),
    });
    let (tx, rx) = oneshot::channel();
    (
        CompletionSink {
            state: Arc::clone(&state),
            tx,
        },
        CompletionHandle {
            state,
            rx,
            deadline,
            started: Instant::now(),
        },
    )
}
