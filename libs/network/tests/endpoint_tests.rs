//! Endpoint I/O task behavior over in-memory duplex transports.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use reef_codec::{encode_frame, opcode, Frame, FrameStatus};
use reef_network::endpoint::{DispatchEntry, Endpoint, Lifecycle, OobHandler};
use reef_network::transport::{ByteTransport, Connector, FramedTransport};
use reef_network::{completion, ClientError, CompletionHandle, Result};
use std::sync::Arc;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const MAX_BODY: usize = 1024 * 1024;

/// Hands out duplex client halves and pushes the matching server half to
/// the test through a channel.
struct TestConnector {
    servers: mpsc::UnboundedSender<DuplexStream>,
}

impl TestConnector {
    fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { servers: tx }, rx)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn ByteTransport>> {
        let (client, server) = duplex(64 * 1024);
        self.servers
            .send(server)
            .map_err(|_| ClientError::dropped("test server receiver gone"))?;
        Ok(Box::new(FramedTransport::new(client, MAX_BODY)))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect_endpoint(oob: Option<OobHandler>) -> (Endpoint, FramedTransport<DuplexStream>) {
    init_tracing();
    let (connector, mut servers) = TestConnector::new();
    let endpoint = Endpoint::connect(&connector, "test-node", 11210, 32, oob)
        .await
        .unwrap();
    let server = FramedTransport::new(servers.recv().await.unwrap(), MAX_BODY);
    (endpoint, server)
}

fn get_entry(key: &[u8]) -> (DispatchEntry, CompletionHandle) {
    let (sink, handle) = completion(None);
    let frame = Frame::request(opcode::GET, Bytes::copy_from_slice(key));
    (DispatchEntry { frame, sink }, handle)
}

async fn wait_for(endpoint: &Endpoint, wanted: Lifecycle) {
    let mut rx = endpoint.watch_state();
    timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn responses_correlate_in_send_order() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let mut handles = Vec::new();
    for key in [b"r1".as_slice(), b"r2", b"r3"] {
        let (entry, handle) = get_entry(key);
        endpoint.send(entry).await.unwrap();
        handles.push(handle);
    }

    // Echo each request key back as the response body, strictly in order.
    for _ in 0..3 {
        let request = server.read_frame().await.unwrap().unwrap();
        let response = Frame::response(request.opcode, FrameStatus::Ok, request.body);
        server.write_frame(&response).await.unwrap();
    }

    for (handle, expected) in handles.into_iter().zip([b"r1".as_slice(), b"r2", b"r3"]) {
        let response = timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, FrameStatus::Ok);
        assert_eq!(&response.body[..], expected);
    }
}

#[tokio::test]
async fn partial_frames_reassemble_into_one_response() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry, handle) = get_entry(b"chunked");
    endpoint.send(entry).await.unwrap();
    let request = server.read_frame().await.unwrap().unwrap();

    let chunks = [
        Frame::response(request.opcode, FrameStatus::Ok, Bytes::from_static(b"hel")).partial(),
        Frame::response(request.opcode, FrameStatus::Ok, Bytes::from_static(b"lo ")).partial(),
        Frame::response(request.opcode, FrameStatus::Ok, Bytes::from_static(b"world")),
    ];
    for chunk in &chunks {
        server.write_frame(chunk).await.unwrap();
    }

    let response = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"hello world");
}

#[tokio::test]
async fn peer_drop_drains_every_outstanding_request() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry_a, handle_a) = get_entry(b"a");
    let (entry_b, handle_b) = get_entry(b"b");
    endpoint.send(entry_a).await.unwrap();
    endpoint.send(entry_b).await.unwrap();

    // Both hit the wire, then the connection dies under them.
    server.read_frame().await.unwrap();
    server.read_frame().await.unwrap();
    drop(server);

    for handle in [handle_a, handle_b] {
        let err = timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionDropped { .. }));
    }
    wait_for(&endpoint, Lifecycle::Disconnected).await;
}

#[tokio::test]
async fn malformed_frame_fails_only_its_request() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry_a, handle_a) = get_entry(b"a");
    let (entry_b, handle_b) = get_entry(b"b");
    endpoint.send(entry_a).await.unwrap();
    endpoint.send(entry_b).await.unwrap();
    server.read_frame().await.unwrap();
    server.read_frame().await.unwrap();

    // First response carries reserved flag bits: well-framed but invalid.
    // Poke the flags byte directly so framing stays intact.
    let mut raw = BytesMut::new();
    encode_frame(
        &Frame::response(opcode::GET, FrameStatus::Ok, Bytes::from_static(b"bad")),
        &mut raw,
    );
    raw[5] |= 0x80;
    server.get_mut().write_all(&raw).await.unwrap();

    let second = Frame::response(opcode::GET, FrameStatus::Ok, Bytes::from_static(b"good"));
    server.write_frame(&second).await.unwrap();

    let err = timeout(Duration::from_secs(2), handle_a.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Protocol { .. }));

    // The stream stayed aligned; the next request still completes.
    let response = timeout(Duration::from_secs(2), handle_b.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"good");
    assert!(endpoint.is_connected());
}

#[tokio::test]
async fn garbage_on_the_wire_tears_the_endpoint_down() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry, handle) = get_entry(b"doomed");
    endpoint.send(entry).await.unwrap();
    server.read_frame().await.unwrap();

    // Bad magic: framing is lost, so the whole connection must go.
    server
        .get_mut()
        .write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let err = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionDropped { .. }));
    wait_for(&endpoint, Lifecycle::Disconnected).await;
}

#[tokio::test]
async fn cancelled_entries_never_reach_the_wire() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry, handle) = get_entry(b"cancelled");
    handle.cancel();
    endpoint.send(entry).await.unwrap();

    let (entry, live) = get_entry(b"live");
    endpoint.send(entry).await.unwrap();

    // Only the live request shows up on the server side.
    let request = server.read_frame().await.unwrap().unwrap();
    assert_eq!(&request.body[..], b"live");
    server
        .write_frame(&Frame::response(request.opcode, FrameStatus::Ok, request.body))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(2), live.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"live");

    let err = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled));
}

#[tokio::test]
async fn disconnect_drains_queued_requests() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry, handle) = get_entry(b"pending");
    endpoint.send(entry).await.unwrap();
    server.read_frame().await.unwrap();

    endpoint.disconnect();
    let err = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionDropped { .. }));
    wait_for(&endpoint, Lifecycle::Disconnected).await;
}

#[tokio::test]
async fn unsolicited_frames_reach_the_oob_handler() {
    let pushed: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&pushed);
    let handler: OobHandler = Arc::new(move |frame| sink.lock().push(frame));

    let (endpoint, mut server) = connect_endpoint(Some(handler)).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let push = Frame::response(
        opcode::CONFIG,
        FrameStatus::Ok,
        Bytes::from_static(b"{\"rev\":9}"),
    );
    server.write_frame(&push).await.unwrap();

    // A correlated request afterwards still resolves normally.
    let (entry, handle) = get_entry(b"after-push");
    endpoint.send(entry).await.unwrap();
    let request = server.read_frame().await.unwrap().unwrap();
    server
        .write_frame(&Frame::response(request.opcode, FrameStatus::Ok, request.body))
        .await
        .unwrap();
    let response = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"after-push");

    let pushed = pushed.lock();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].opcode, opcode::CONFIG);
    assert_eq!(&pushed[0].body[..], b"{\"rev\":9}");
}

#[tokio::test]
async fn config_push_while_a_request_is_outstanding_skips_the_queue() {
    let pushed: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&pushed);
    let handler: OobHandler = Arc::new(move |frame| sink.lock().push(frame));

    let (endpoint, mut server) = connect_endpoint(Some(handler)).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (entry, handle) = get_entry(b"in-flight");
    endpoint.send(entry).await.unwrap();
    let request = server.read_frame().await.unwrap().unwrap();

    // Server pushes a config update before answering the request. The push
    // must not be mistaken for the response at the queue head.
    let push = Frame::response(
        opcode::CONFIG,
        FrameStatus::Ok,
        Bytes::from_static(b"{\"rev\":9}"),
    );
    server.write_frame(&push).await.unwrap();
    server
        .write_frame(&Frame::response(request.opcode, FrameStatus::Ok, request.body))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"in-flight");

    let pushed = pushed.lock();
    assert_eq!(pushed.len(), 1);
    assert_eq!(&pushed[0].body[..], b"{\"rev\":9}");
}

#[tokio::test]
async fn config_responses_still_answer_config_requests() {
    let pushed: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&pushed);
    let handler: OobHandler = Arc::new(move |frame| sink.lock().push(frame));

    let (endpoint, mut server) = connect_endpoint(Some(handler)).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    // A request asking for the config gets its CONFIG-opcode response
    // delivered to its own handle, not the out-of-band handler.
    let (sink_half, handle) = completion(None);
    let frame = Frame::request(opcode::CONFIG, Bytes::new());
    endpoint
        .send(DispatchEntry { frame, sink: sink_half })
        .await
        .unwrap();
    let request = server.read_frame().await.unwrap().unwrap();
    assert_eq!(request.opcode, opcode::CONFIG);
    server
        .write_frame(&Frame::response(
            opcode::CONFIG,
            FrameStatus::Ok,
            Bytes::from_static(b"{\"rev\":3}"),
        ))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"{\"rev\":3}");
    assert!(pushed.lock().is_empty());
}

#[tokio::test]
async fn timed_out_request_is_cancelled_at_the_handle() {
    let (endpoint, mut server) = connect_endpoint(None).await;
    wait_for(&endpoint, Lifecycle::Connected).await;

    let (sink, handle) = completion(Some(
        tokio::time::Instant::now() + Duration::from_millis(20),
    ));
    let frame = Frame::request(opcode::GET, Bytes::from_static(b"slow"));
    endpoint.send(DispatchEntry { frame, sink }).await.unwrap();
    server.read_frame().await.unwrap();

    // The server never answers; the caller's deadline fires instead.
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));

    // Late response arrives against a cancelled sink and is dropped.
    server
        .write_frame(&Frame::response(
            opcode::GET,
            FrameStatus::Ok,
            Bytes::from_static(b"late"),
        ))
        .await
        .unwrap();

    let (entry, live) = get_entry(b"still-alive");
    endpoint.send(entry).await.unwrap();
    let request = server.read_frame().await.unwrap().unwrap();
    server
        .write_frame(&Frame::response(request.opcode, FrameStatus::Ok, request.body))
        .await
        .unwrap();
    let response = timeout(Duration::from_secs(2), live.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"still-alive");
}
