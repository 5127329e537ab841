//! Shared test helpers: an in-memory connection and a scripted engine.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use subwire_proto::{ClientIdentity, CloseStatus};
use subwire_router::{DispatchError, DispatchItem, DispatchQueue, EventRouter};
use subwire_server::{
    ClientConnection, EngineError, EngineResult, Inbound, PassthroughEngine, QueryEngine,
    Resolution, ResolveRequest, TransportError, TransportResult, TransportState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default wait for anything a test expects to happen.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// What the server did to a mock connection, as seen by the test.
#[derive(Debug, Default)]
pub struct Record {
    pub opened_with: Option<String>,
    pub closed: Option<(CloseStatus, String)>,
    pub response: Option<(u16, String)>,
}

/// In-memory [`ClientConnection`].
///
/// Starts in `Connecting` like an un-upgraded HTTP request, so errors
/// reported before `open` go out as raw responses.
pub struct MockConnection {
    path: String,
    identity: Option<ClientIdentity>,
    requested: Option<String>,
    state: TransportState,
    response_started: bool,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
    record: Arc<Mutex<Record>>,
}

impl MockConnection {
    /// Create a connection for `path` and the peer driving it.
    pub fn pair(path: &str) -> (Self, MockPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let record = Arc::new(Mutex::new(Record::default()));

        let connection = Self {
            path: path.to_string(),
            identity: None,
            requested: None,
            state: TransportState::Connecting,
            response_started: false,
            inbound: inbound_rx,
            outbound: outbound_tx,
            record: Arc::clone(&record),
        };
        let peer = MockPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            record,
        };
        (connection, peer)
    }

    /// Request these sub-protocols.
    pub fn with_protocols(mut self, protocols: &str) -> Self {
        self.requested = Some(protocols.to_string());
        self
    }

    /// Authenticate as `principal`.
    pub fn with_identity(mut self, principal: &str) -> Self {
        self.identity = Some(ClientIdentity::new(principal));
        self
    }

    /// Start already open, as after a completed upgrade.
    pub fn opened(mut self) -> Self {
        self.state = TransportState::Open;
        self.response_started = true;
        self
    }
}

impl ClientConnection for MockConnection {
    fn path(&self) -> &str {
        &self.path
    }

    fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    fn requested_protocols(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn response_started(&self) -> bool {
        self.response_started
    }

    fn open<'a>(&'a mut self, subprotocol: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            match self.state {
                TransportState::Connecting => {
                    self.state = TransportState::Open;
                    self.response_started = true;
                    self.record.lock().opened_with = Some(subprotocol.to_string());
                    Ok(())
                }
                // already upgraded
                TransportState::Open => {
                    self.record.lock().opened_with = Some(subprotocol.to_string());
                    Ok(())
                }
                other => Err(TransportError::InvalidState(other)),
            }
        })
    }

    fn send(&mut self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.state != TransportState::Open {
                return Err(TransportError::InvalidState(self.state));
            }
            self.outbound.send(text).map_err(|_| TransportError::Closed)
        })
    }

    fn receive(&mut self) -> BoxFuture<'_, TransportResult<Inbound>> {
        Box::pin(async move { self.inbound.recv().await.ok_or(TransportError::Closed) })
    }

    fn close<'a>(
        &'a mut self,
        status: CloseStatus,
        reason: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.state = TransportState::Closed;
            self.record.lock().closed = Some((status, reason.to_string()));
            Ok(())
        })
    }

    fn write_response<'a>(
        &'a mut self,
        status: u16,
        message: &'a str,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            if self.response_started {
                return Err(TransportError::ResponseStarted);
            }
            self.response_started = true;
            self.state = TransportState::Closed;
            self.record.lock().response = Some((status, message.to_string()));
            Ok(())
        })
    }
}

/// Test side of a [`MockConnection`].
pub struct MockPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<String>,
    record: Arc<Mutex<Record>>,
}

impl MockPeer {
    /// Send a JSON frame to the server.
    pub fn send(&self, frame: &Value) {
        if let Some(inbound) = &self.inbound {
            inbound.send(Inbound::Text(frame.to_string())).unwrap();
        }
    }

    /// Send a raw text frame to the server.
    pub fn send_text(&self, text: &str) {
        if let Some(inbound) = &self.inbound {
            inbound.send(Inbound::Text(text.to_string())).unwrap();
        }
    }

    /// Hang up without a close frame.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Stop accepting server frames; later sends fail as on a dead socket.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    /// Next frame the server sent, parsed as JSON.
    pub async fn recv(&mut self) -> Value {
        let text = timeout(TEST_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for server frame")
            .expect("server dropped the connection");
        serde_json::from_str(&text).unwrap()
    }

    /// Assert nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(text)) = timeout(window, self.outbound.recv()).await {
            panic!("unexpected frame: {text}");
        }
    }

    /// Frames already sent, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    /// How the server closed the transport, if it did.
    pub fn closed(&self) -> Option<(CloseStatus, String)> {
        self.record.lock().closed.clone()
    }

    /// Raw response the server wrote, if any.
    pub fn response(&self) -> Option<(u16, String)> {
        self.record.lock().response.clone()
    }

    /// Protocol the transport was opened with.
    pub fn opened_with(&self) -> Option<String> {
        self.record.lock().opened_with.clone()
    }

    /// Wait until the server closes the transport.
    pub async fn wait_closed(&self) -> (CloseStatus, String) {
        timeout(TEST_TIMEOUT, async {
            loop {
                if let Some(closed) = self.closed() {
                    return closed;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for close")
    }
}

/// Queue that drops everything; for tests that never publish.
#[derive(Debug, Default)]
pub struct NullQueue;

impl DispatchQueue for NullQueue {
    fn enqueue(&self, _item: DispatchItem) -> Result<(), DispatchError> {
        Ok(())
    }

    fn pending(&self) -> usize {
        0
    }

    fn stop_accepting(&self) {}

    fn dispose(&self) -> usize {
        0
    }
}

/// A router whose dispatch queue goes nowhere.
pub fn detached_router() -> Arc<EventRouter> {
    Arc::new(EventRouter::new(Arc::new(NullQueue)))
}

/// Engine that faults on any document containing `explode` and otherwise
/// behaves like [`PassthroughEngine`].
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    calls: AtomicUsize,
    fallback: PassthroughEngine,
}

impl ScriptedEngine {
    pub const FAULT_DETAIL: &'static str = "connection pool exhausted";

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl QueryEngine for ScriptedEngine {
    fn resolve<'a>(&'a self, request: ResolveRequest<'a>) -> BoxFuture<'a, EngineResult<Resolution>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.operation.query.contains("explode") {
            return Box::pin(async { Err(EngineError::Fault(Self::FAULT_DETAIL.to_string())) });
        }
        self.fallback.resolve(request)
    }
}

/// Poll `check` until it holds or the test timeout passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
