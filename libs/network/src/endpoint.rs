//! Endpoint: one persistent connection to one (node, service) pair.
//!
//! The endpoint owns the encode/write path, the FIFO queue of sent requests
//! awaiting responses, and the lifecycle state machine. All of that state is
//! mutated only by the endpoint's own I/O task; callers interact through a
//! bounded channel (writes) and a watch channel (lifecycle), so no lock
//! guards the per-connection hot path.
//!
//! Correlation is by send order: the service protocols answer requests in
//! the order they were written, so each complete response pops the queue
//! head. A multi-frame response holds a cursor to the in-progress request
//! instead of consuming further queue entries.

use crate::error::ClientError;
use crate::request::{CompletionSink, Response};
use crate::transport::ByteTransport;
use bytes::BytesMut;
use reef_codec::{opcode, Frame};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Endpoint lifecycle states.
///
/// `Idle` is the initial (and terminal) state of an endpoint slot with no
/// registered connection; transitions otherwise follow
/// `Disconnected → Connecting → Connected`, `Connected ↔ Degraded` under
/// write backpressure, and `Connected → Disconnecting → Disconnected` on
/// clean shutdown. Fatal failures drop straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Disconnecting,
}

/// One encoded request travelling to the endpoint's I/O task.
#[derive(Debug)]
pub struct DispatchEntry {
    pub frame: Frame,
    pub sink: CompletionSink,
}

/// Handler for unsolicited (out-of-band) frames pushed by the server,
/// e.g. configuration updates interleaved with responses.
pub type OobHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Handle to a running endpoint.
pub struct Endpoint {
    tx: mpsc::Sender<DispatchEntry>,
    state_tx: Arc<watch::Sender<Lifecycle>>,
    state_rx: watch::Receiver<Lifecycle>,
    shutdown: Arc<Notify>,
    target: String,
}

impl Endpoint {
    /// Connect and spawn the I/O task.
    ///
    /// The transport is handed over to the task wholesale; this handle only
    /// keeps the channels.
    pub async fn connect(
        connector: &dyn crate::transport::Connector,
        host: &str,
        port: u16,
        queue_depth: usize,
        oob: Option<OobHandler>,
    ) -> crate::Result<Endpoint> {
        let target = format!("{host}:{port}");
        let (state_tx, state_rx) = watch::channel(Lifecycle::Idle);
        let state_tx = Arc::new(state_tx);

        state_tx.send_replace(Lifecycle::Connecting);
        let transport = match connector.connect(host, port).await {
            Ok(t) => t,
            Err(e) => {
                state_tx.send_replace(Lifecycle::Disconnected);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(queue_depth);
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(run_io(
            transport,
            rx,
            Arc::clone(&state_tx),
            Arc::clone(&shutdown),
            target.clone(),
            oob,
        ));

        Ok(Endpoint {
            tx,
            state_tx,
            state_rx,
            shutdown,
            target,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), Lifecycle::Connected)
    }

    /// A receiver observing lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<Lifecycle> {
        self.state_rx.clone()
    }

    /// Enqueue one encoded request.
    ///
    /// A full queue is write backpressure: the endpoint degrades and the
    /// caller is parked until capacity frees up; outstanding requests are
    /// never failed for backpressure. The entry is handed back if the
    /// endpoint is already gone so the caller can retry elsewhere.
    pub async fn send(&self, entry: DispatchEntry) -> std::result::Result<(), DispatchEntry> {
        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(entry)) => {
                self.state_tx.send_if_modified(|s| {
                    if *s == Lifecycle::Connected {
                        *s = Lifecycle::Degraded;
                        true
                    } else {
                        false
                    }
                });
                debug!(target = %self.target, "Write queue full, pausing sender");
                let result = self.tx.send(entry).await.map_err(|e| e.0);
                self.state_tx.send_if_modified(|s| {
                    if *s == Lifecycle::Degraded {
                        *s = Lifecycle::Connected;
                        true
                    } else {
                        false
                    }
                });
                result
            }
            Err(TrySendError::Closed(entry)) => Err(entry),
        }
    }

    /// Request a clean shutdown; pending requests drain with
    /// `ConnectionDropped`.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

struct PendingRequest {
    sink: CompletionSink,
    /// Opcode of the request as written, used to tell correlated responses
    /// apart from server pushes carrying a different opcode.
    opcode: u8,
    /// Accumulated chunks of a multi-frame response
    buffer: Option<BytesMut>,
}

enum IoEvent {
    Shutdown,
    Outbound(Option<DispatchEntry>),
    Inbound(crate::Result<Option<Frame>>),
}

async fn run_io(
    mut transport: Box<dyn ByteTransport>,
    mut rx: mpsc::Receiver<DispatchEntry>,
    state: Arc<watch::Sender<Lifecycle>>,
    shutdown: Arc<Notify>,
    target: String,
    oob: Option<OobHandler>,
) {
    state.send_replace(Lifecycle::Connected);
    info!(%target, "Endpoint connected");

    let mut sent_queue: VecDeque<PendingRequest> = VecDeque::new();
    let mut current: Option<PendingRequest> = None;
    let mut clean = false;

    let reason: String = loop {
        let event = tokio::select! {
            _ = shutdown.notified() => IoEvent::Shutdown,
            entry = rx.recv() => IoEvent::Outbound(entry),
            frame = transport.read_frame() => IoEvent::Inbound(frame),
        };

        match event {
            IoEvent::Shutdown => {
                clean = true;
                break "closed by owner".to_string();
            }
            IoEvent::Outbound(None) => {
                clean = true;
                break "endpoint handle dropped".to_string();
            }
            IoEvent::Outbound(Some(entry)) => {
                // Cancelled before it ever hit the wire: skip silently.
                if entry.sink.is_cancelled() {
                    continue;
                }
                match transport.write_frame(&entry.frame).await {
                    Ok(()) => sent_queue.push_back(PendingRequest {
                        sink: entry.sink,
                        opcode: entry.frame.opcode,
                        buffer: None,
                    }),
                    Err(e) => {
                        entry.sink.complete(Err(ClientError::dropped(format!(
                            "write to {target} failed: {e}"
                        ))));
                        break format!("write failed: {e}");
                    }
                }
            }
            IoEvent::Inbound(Ok(Some(frame))) => {
                handle_frame(frame, &mut sent_queue, &mut current, oob.as_ref(), &target);
            }
            IoEvent::Inbound(Ok(None)) => break "peer closed connection".to_string(),
            IoEvent::Inbound(Err(ClientError::Protocol { message })) => {
                // One malformed frame fails only its correlated request;
                // the stream is still aligned.
                warn!(%target, %message, "Malformed response frame");
                let pending = current.take().or_else(|| sent_queue.pop_front());
                match pending {
                    Some(p) => p.sink.complete(Err(ClientError::Protocol { message })),
                    None => warn!(%target, "Malformed frame with no outstanding request"),
                }
            }
            IoEvent::Inbound(Err(e)) => break format!("read failed: {e}"),
        }
    };

    if clean {
        state.send_replace(Lifecycle::Disconnecting);
        if let Err(e) = transport.close().await {
            debug!(%target, "Error closing transport: {}", e);
        }
    }

    // No request left behind: everything outstanding or still queued fails
    // with ConnectionDropped now, not never.
    let outstanding = current.is_some() as usize + sent_queue.len();
    if outstanding > 0 {
        info!(%target, outstanding, %reason, "Draining outstanding requests");
    }
    if let Some(pending) = current.take() {
        pending
            .sink
            .complete(Err(ClientError::dropped(reason.clone())));
    }
    for pending in sent_queue.drain(..) {
        pending
            .sink
            .complete(Err(ClientError::dropped(reason.clone())));
    }
    rx.close();
    while let Ok(entry) = rx.try_recv() {
        entry.sink.complete(Err(ClientError::dropped(reason.clone())));
    }

    state.send_replace(Lifecycle::Disconnected);
    info!(%target, %reason, "Endpoint disconnected");
}

fn handle_frame(
    frame: Frame,
    sent_queue: &mut VecDeque<PendingRequest>,
    current: &mut Option<PendingRequest>,
    oob: Option<&OobHandler>,
    target: &str,
) {
    // Config pushes may arrive at any point in the stream, including while
    // requests are outstanding. Correlation alone cannot tell them from the
    // next response, so a CONFIG frame bypasses the queue unless the request
    // being answered asked for a config itself.
    let expected = current
        .as_ref()
        .map(|p| p.opcode)
        .or_else(|| sent_queue.front().map(|p| p.opcode));
    if frame.opcode == opcode::CONFIG && expected != Some(opcode::CONFIG) {
        match oob {
            Some(handler) => handler(frame),
            None => warn!(%target, "Dropping unsolicited config frame"),
        }
        return;
    }

    // Continuation of an in-progress multi-frame response?
    if let Some(mut pending) = current.take() {
        let mut buffer = pending.buffer.take().unwrap_or_default();
        buffer.extend_from_slice(&frame.body);
        if frame.is_partial() {
            pending.buffer = Some(buffer);
            *current = Some(pending);
        } else {
            pending.sink.complete(Ok(Response {
                status: frame.status,
                body: buffer.freeze(),
            }));
        }
        return;
    }

    match sent_queue.pop_front() {
        Some(mut pending) => {
            if frame.is_partial() {
                pending.buffer = Some(BytesMut::from(&frame.body[..]));
                *current = Some(pending);
            } else {
                pending.sink.complete(Ok(Response {
                    status: frame.status,
                    body: frame.body,
                }));
            }
        }
        // Out-of-band push from the server, e.g. a config update.
        None => match oob {
            Some(handler) => handler(frame),
            None => warn!(%target, opcode = frame.opcode, "Dropping unsolicited frame"),
        },
    }
}
