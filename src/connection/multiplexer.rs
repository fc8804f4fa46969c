//! Connection Multiplexer
//!
//! A single task owns the TCP stream of a client and pipelines every command
//! issued on it. Callers never touch the socket: they post a request over a
//! channel and await a oneshot reply slot.
//!
//! ## Request Flow
//!
//! ```text
//!   command tasks                multiplexer task                 server
//!  ┌────────────┐   mpsc    ┌───────────────────────┐  write   ┌────────┐
//!  │ send(args) │──────────>│ write frame           │─────────>│        │
//!  │            │           │ push slot to pending  │          │        │
//!  │  await ◄───┼── oneshot─│ pop slot on reply  ◄──┼──────────│        │
//!  └────────────┘           └───────────────────────┘   read   └────────┘
//! ```
//!
//! Replies come back in request order, so the pending queue is a FIFO. A
//! caller that gave up (timeout) leaves its slot in the queue; the late reply
//! lands in a closed slot and alignment is preserved.
//!
//! ## Connection Loss
//!
//! EOF, an I/O error or an undecodable reply drops the link and fails every
//! pending slot with a disconnect error. The next request reconnects; if that
//! fails, later requests fail fast until the retry strategy's backoff expires.
//!
//! A server that stops answering is treated the same way: once the oldest
//! `MAX_UNANSWERED` slots in the queue have all been abandoned by their
//! callers, the next request drops the link and reconnects.

use crate::config::ConnectionRequest;
use crate::connection::error::RequestError;
use crate::connection::handshake;
use crate::protocol::{encode_command, ParseError, ReplyDecoder, RespValue};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Abandoned requests at the head of the queue after which the link is
/// considered unresponsive.
const MAX_UNANSWERED: usize = 3;

type ReplySlot = oneshot::Sender<Result<RespValue, RequestError>>;

/// Counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub requests_sent: AtomicU64,
    pub replies_received: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub disconnects: AtomicU64,
    pub reconnects: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn request_sent(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }
}

struct Request {
    frame: Bytes,
    reply: ReplySlot,
}

/// Cheap, cloneable handle to a connection's multiplexer task.
///
/// The task stops once every handle is dropped; requests still pending at
/// that point fail with [`RequestError::Closing`].
#[derive(Clone)]
pub struct Connection {
    requests: mpsc::UnboundedSender<Request>,
    stats: Arc<ConnectionStats>,
}

impl Connection {
    /// Spawns the multiplexer for an established (handshaken) stream.
    pub fn start(runtime: &Handle, stream: TcpStream, request: Arc<ConnectionRequest>) -> Self {
        let (requests, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(ConnectionStats::new());

        let multiplexer = Multiplexer {
            link: Some(Link::new(stream)),
            pending: VecDeque::new(),
            decoder: ReplyDecoder::new(),
            request,
            failed_attempts: 0,
            retry_at: None,
            stats: Arc::clone(&stats),
        };
        runtime.spawn(multiplexer.run(receiver));

        Self { requests, stats }
    }

    /// Sends one command and waits for its reply.
    ///
    /// Error replies are returned as [`RequestError::Server`]. There is no
    /// timeout here; callers bound the wait themselves.
    pub async fn send(&self, args: &[Bytes]) -> Result<RespValue, RequestError> {
        let (reply, receiver) = oneshot::channel();
        let request = Request {
            frame: encode_command(args),
            reply,
        };

        self.requests
            .send(request)
            .map_err(|_| RequestError::Closing)?;

        receiver.await.map_err(|_| RequestError::Closing)?
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

struct Link {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Link {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }
}

struct Multiplexer {
    /// `None` while disconnected
    link: Option<Link>,
    pending: VecDeque<ReplySlot>,
    decoder: ReplyDecoder,
    request: Arc<ConnectionRequest>,
    /// Consecutive failed reconnect attempts
    failed_attempts: u32,
    retry_at: Option<Instant>,
    stats: Arc<ConnectionStats>,
}

impl Multiplexer {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.submit(request).await,
                    None => break,
                },
                read = read_link(&mut self.link) => self.on_read(read),
            }
        }

        debug!(pending = self.pending.len(), "Multiplexer stopping");
        self.fail_pending(|| RequestError::Closing);
    }

    async fn submit(&mut self, request: Request) {
        if request.reply.is_closed() {
            trace!("Skipping request abandoned before it was written");
            return;
        }

        let unanswered = self.unanswered();
        if self.link.is_some() && unanswered >= MAX_UNANSWERED {
            self.drop_link(&format!("no reply to the last {} requests", unanswered));
        }

        if self.link.is_none() {
            if let Err(e) = self.reconnect().await {
                let _ = request.reply.send(Err(e));
                return;
            }
        }

        let Some(link) = self.link.as_mut() else {
            let _ = request.reply.send(Err(RequestError::Disconnected(
                "not connected".to_string(),
            )));
            return;
        };

        match link.stream.write_all(&request.frame).await {
            Ok(()) => {
                self.stats.request_sent(request.frame.len());
                self.pending.push_back(request.reply);
                trace!(
                    bytes = request.frame.len(),
                    pending = self.pending.len(),
                    "Request written"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = request
                    .reply
                    .send(Err(RequestError::Disconnected(reason.clone())));
                self.drop_link(&reason);
            }
        }
    }

    /// Oldest pending slots whose callers have already given up.
    fn unanswered(&self) -> usize {
        self.pending
            .iter()
            .take_while(|slot| slot.is_closed())
            .count()
    }

    fn on_read(&mut self, read: io::Result<usize>) {
        match read {
            Ok(0) => self.drop_link("connection closed by server"),
            Ok(n) => {
                self.stats.bytes_read(n);
                trace!(bytes = n, "Read data");
                self.drain_replies();
            }
            Err(e) => self.drop_link(&e.to_string()),
        }
    }

    /// Completes pending slots with every complete reply in the read buffer.
    fn drain_replies(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let failure: Option<ParseError> = loop {
            match self.decoder.decode(&mut link.buffer) {
                Ok(Some(reply)) => {
                    self.stats.reply_received();
                    match self.pending.pop_front() {
                        Some(slot) => {
                            // The caller may have timed out already.
                            let _ = slot.send(into_result(reply));
                        }
                        None => warn!(reply = %reply, "Dropping unsolicited reply"),
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        match failure {
            Some(e) => {
                warn!(error = %e, "Undecodable reply, dropping connection");
                self.drop_link(&format!("protocol error: {}", e));
            }
            None => {
                if link.buffer.capacity() - link.buffer.len() < 1024 {
                    link.buffer.reserve(INITIAL_BUFFER_SIZE);
                }
            }
        }
    }

    fn drop_link(&mut self, reason: &str) {
        if self.link.take().is_some() {
            self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
            warn!(reason, pending = self.pending.len(), "Connection lost");
        }
        self.failed_attempts = 0;
        self.retry_at = None;
        self.fail_pending(|| RequestError::Disconnected(reason.to_string()));
    }

    async fn reconnect(&mut self) -> Result<(), RequestError> {
        if let Some(retry_at) = self.retry_at {
            let now = Instant::now();
            if now < retry_at {
                return Err(RequestError::Disconnected(format!(
                    "not connected, next reconnect attempt in {} ms",
                    (retry_at - now).as_millis()
                )));
            }
        }

        match handshake::connect(&self.request).await {
            Ok(stream) => {
                info!(attempts = self.failed_attempts + 1, "Reconnected");
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                self.link = Some(Link::new(stream));
                self.failed_attempts = 0;
                self.retry_at = None;
                Ok(())
            }
            Err(e) => {
                self.failed_attempts = self.failed_attempts.saturating_add(1);
                let delay = self
                    .request
                    .connection_retry_strategy
                    .delay(self.failed_attempts);
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    error = %e,
                    attempts = self.failed_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconnect failed"
                );
                Err(RequestError::Disconnected(e.to_string()))
            }
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> RequestError) {
        for slot in self.pending.drain(..) {
            let _ = slot.send(Err(error()));
        }
    }
}

/// Reads from the link, or never completes while disconnected.
async fn read_link(link: &mut Option<Link>) -> io::Result<usize> {
    match link {
        Some(link) => link.stream.read_buf(&mut link.buffer).await,
        None => std::future::pending().await,
    }
}

fn into_result(reply: RespValue) -> Result<RespValue, RequestError> {
    match reply {
        RespValue::Error(message) => Err(RequestError::Server(message)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockServer;
    use std::time::Duration;

    async fn connect(server: &MockServer) -> Connection {
        let request = Arc::new(server.request());
        let stream = handshake::connect(&request).await.unwrap();
        Connection::start(&Handle::current(), stream, request)
    }

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::from(p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = MockServer::start();
        let connection = connect(&server).await;

        let reply = connection.send(&args(&["PING"])).await.unwrap();
        assert_eq!(reply, RespValue::simple_string("PONG"));
        assert_eq!(connection.stats().requests_sent.load(Ordering::Relaxed), 1);
        assert_eq!(connection.stats().replies_received.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_set_get_and_server_error() {
        let server = MockServer::start();
        let connection = connect(&server).await;

        assert!(connection
            .send(&args(&["SET", "name", "Ariz"]))
            .await
            .unwrap()
            .is_ok());
        assert_eq!(
            connection.send(&args(&["GET", "name"])).await.unwrap(),
            RespValue::bulk_string("Ariz")
        );
        assert_eq!(
            connection.send(&args(&["NOPE"])).await,
            Err(RequestError::Server("ERR unknown command 'NOPE'".to_string()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_stay_aligned() {
        let server = MockServer::start();
        let connection = connect(&server).await;

        let mut tasks = Vec::new();
        for i in 0..200 {
            let connection = connection.clone();
            tasks.push(tokio::spawn(async move {
                let value = format!("value-{}", i);
                let reply = connection
                    .send(&[Bytes::from("ECHO"), Bytes::from(value.clone())])
                    .await
                    .unwrap();
                assert_eq!(reply, RespValue::bulk_string(value));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_reconnects() {
        let server = MockServer::start();
        let connection = connect(&server).await;

        // DROP makes the mock server close the socket without replying.
        let err = connection.send(&args(&["DROP"])).await.unwrap_err();
        assert!(matches!(err, RequestError::Disconnected(_)));

        // The next request reconnects transparently.
        let reply = connection.send(&args(&["PING"])).await.unwrap();
        assert_eq!(reply, RespValue::simple_string("PONG"));
        assert_eq!(connection.stats().disconnects.load(Ordering::Relaxed), 1);
        assert_eq!(connection.stats().reconnects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_fast_during_backoff() {
        let server = MockServer::start();
        let connection = connect(&server).await;
        server.shutdown();

        let err = connection.send(&args(&["DROP"])).await.unwrap_err();
        assert!(matches!(err, RequestError::Disconnected(_)));

        // Reconnect fails, then the backoff window rejects immediately.
        let first = connection.send(&args(&["PING"])).await.unwrap_err();
        assert_eq!(first.kind(), crate::connection::RequestErrorType::Disconnect);
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            connection.send(&args(&["PING"])),
        )
        .await
        .expect("backoff rejection should be immediate")
        .unwrap_err();
        assert!(matches!(second, RequestError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_late_reply_after_caller_gave_up() {
        let server = MockServer::start();
        let connection = connect(&server).await;

        // SLOW replies after 200ms; the caller abandons it after 20ms.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            connection.send(&args(&["SLOW", "200"])),
        )
        .await;
        assert!(abandoned.is_err());

        // The late reply must not be handed to the next caller.
        let reply = connection.send(&args(&["ECHO", "next"])).await.unwrap();
        assert_eq!(reply, RespValue::bulk_string("next"));
    }

    #[tokio::test]
    async fn test_unresponsive_link_is_replaced() {
        let server = MockServer::start();
        let connection = connect(&server).await;

        // After HANG the server reads but never answers on this socket.
        for command in ["HANG", "PING", "PING"] {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(20),
                connection.send(&args(&[command])),
            )
            .await;
            assert!(abandoned.is_err(), "{} was answered", command);
        }
        assert_eq!(connection.stats().disconnects.load(Ordering::Relaxed), 0);

        // Three abandoned replies at the head of the queue: the next request
        // goes out on a fresh connection.
        let reply = connection.send(&args(&["PING"])).await.unwrap();
        assert_eq!(reply, RespValue::simple_string("PONG"));
        assert_eq!(connection.stats().disconnects.load(Ordering::Relaxed), 1);
        assert_eq!(connection.stats().reconnects.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_dropping_all_handles_stops_multiplexer() {
        let server = MockServer::start();
        let connection = connect(&server).await;
        let stats = Arc::clone(&connection.stats);
        drop(connection);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.open_connections(), 0);
        assert_eq!(stats.requests_sent.load(Ordering::Relaxed), 0);
    }
}
