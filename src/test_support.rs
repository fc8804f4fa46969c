//! Shared fixtures for the unit tests: a loopback RESP server and a callback
//! inbox that turns C callbacks back into Rust values.

use crate::client::Callbacks;
use crate::config::ConnectionRequest;
use crate::connection::RequestErrorType;
use crate::protocol::{parse_reply, RespValue};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Splits a command line into arguments.
pub fn args(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from(p.to_string())).collect()
}

// ============================================================================
// Mock server
// ============================================================================

type Store = Arc<Mutex<HashMap<Bytes, Bytes>>>;

#[derive(Clone)]
struct ServerState {
    store: Store,
    password: Option<String>,
    open: Arc<AtomicUsize>,
}

/// A small RESP server on its own thread and runtime, so it keeps serving
/// while the code under test blocks.
///
/// Beyond the usual commands it understands a few test verbs:
/// `SLOW ms` (sleep, then `+OK`), `HANG` (stop replying on this
/// connection), `DROP` (close the socket without replying), `EXEC`
/// (`EXECABORT` error), `NULBYTE` (bulk reply with an interior NUL) and
/// `LIST` (mixed array reply).
pub struct MockServer {
    addr: SocketAddr,
    open: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    /// A server that requires `AUTH password` before any other command.
    pub fn with_password(password: &str) -> Self {
        Self::spawn(Some(password.to_string()))
    }

    fn spawn(password: Option<String>) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let state = ServerState {
            store: Arc::new(Mutex::new(HashMap::new())),
            password,
            open: Arc::new(AtomicUsize::new(0)),
        };
        let open = Arc::clone(&state.open);
        let (shutdown, mut stopped) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("mock-server".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(listener).unwrap();
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => match accepted {
                                Ok((stream, _)) => {
                                    tokio::spawn(serve(stream, state.clone()));
                                }
                                Err(_) => break,
                            },
                            _ = stopped.changed() => break,
                        }
                    }
                });
                // Dropping the runtime cancels every connection task and
                // closes their sockets.
            })
            .unwrap();

        Self {
            addr,
            open,
            shutdown,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A connection request pointing at this server.
    pub fn request(&self) -> ConnectionRequest {
        ConnectionRequest::for_address("127.0.0.1", self.port())
    }

    /// The same request in its JSON wire form.
    pub fn config_json(&self) -> String {
        format!(
            r#"{{"addresses":[{{"host":"127.0.0.1","port":{}}}]}}"#,
            self.port()
        )
    }

    /// Number of client connections the server currently holds.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Stops listening and closes every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        // Connection tasks die with the runtime, so joining the thread means
        // every socket is closed.
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(open))
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Reply {
    Send(RespValue),
    Hang,
    Drop,
}

async fn serve(mut stream: TcpStream, state: ServerState) {
    let _guard = OpenGuard::new(&state.open);
    let mut buffer = BytesMut::with_capacity(1024);
    let mut authenticated = state.password.is_none();

    loop {
        match stream.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        while let Ok(Some((frame, consumed))) = parse_reply(&buffer) {
            let _ = buffer.split_to(consumed);
            let RespValue::Array(items) = frame else {
                return;
            };
            let parts: Vec<Bytes> = items
                .into_iter()
                .filter_map(|item| match item {
                    RespValue::BulkString(data) => Some(data),
                    _ => None,
                })
                .collect();

            match execute(&parts, &state, &mut authenticated).await {
                Reply::Send(value) => {
                    let mut out = BytesMut::new();
                    value.serialize_into(&mut out);
                    if stream.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Reply::Hang => {
                    // Keep the socket open but never answer again.
                    let mut sink = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut sink).await {
                        if n == 0 {
                            return;
                        }
                    }
                    return;
                }
                Reply::Drop => return,
            }
        }
    }
}

async fn execute(parts: &[Bytes], state: &ServerState, authenticated: &mut bool) -> Reply {
    let Some(name) = parts.first() else {
        return Reply::Send(RespValue::error("ERR empty command"));
    };
    let name = String::from_utf8_lossy(name).to_uppercase();
    let arg = |i: usize| parts.get(i).cloned().unwrap_or_default();

    if name == "AUTH" {
        let given = parts.last().cloned().unwrap_or_default();
        let expected = state.password.clone().unwrap_or_default();
        return if given == expected.as_bytes() {
            *authenticated = true;
            Reply::Send(RespValue::simple_string("OK"))
        } else {
            Reply::Send(RespValue::error(
                "WRONGPASS invalid username-password pair or user is disabled.",
            ))
        };
    }
    if !*authenticated {
        return Reply::Send(RespValue::error("NOAUTH Authentication required."));
    }

    let value = match name.as_str() {
        "PING" => RespValue::simple_string("PONG"),
        "ECHO" => RespValue::bulk_string(arg(1)),
        "SELECT" => RespValue::simple_string("OK"),
        "CLIENT" => RespValue::simple_string("OK"),
        "SET" => {
            state.store.lock().unwrap().insert(arg(1), arg(2));
            RespValue::simple_string("OK")
        }
        "GET" => match state.store.lock().unwrap().get(&arg(1)) {
            Some(value) => RespValue::bulk_string(value.clone()),
            None => RespValue::Null,
        },
        "DEL" => {
            let mut store = state.store.lock().unwrap();
            let removed = parts[1..]
                .iter()
                .filter(|key| store.remove(*key).is_some())
                .count();
            RespValue::Integer(removed as i64)
        }
        "INCR" => {
            let mut store = state.store.lock().unwrap();
            let current = store
                .get(&arg(1))
                .and_then(|v| std::str::from_utf8(v).ok()?.parse::<i64>().ok())
                .unwrap_or(0);
            store.insert(arg(1), Bytes::from((current + 1).to_string()));
            RespValue::Integer(current + 1)
        }
        "SLOW" => {
            let millis = std::str::from_utf8(&arg(1))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            RespValue::simple_string("OK")
        }
        "HANG" => return Reply::Hang,
        "DROP" => return Reply::Drop,
        "EXEC" => RespValue::error("EXECABORT Transaction discarded because of previous errors."),
        "NULBYTE" => RespValue::bulk_string(&b"a\0b"[..]),
        "LIST" => RespValue::Array(vec![
            RespValue::bulk_string("a"),
            RespValue::Integer(1),
            RespValue::Null,
        ]),
        _ => RespValue::error(format!("ERR unknown command '{}'", name)),
    };
    Reply::Send(value)
}

// ============================================================================
// Callback inbox
// ============================================================================

/// What a callback reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Option<String>),
    Failure(String, RequestErrorType),
}

/// Receives the outcome of the commands issued with its token.
///
/// The token is the address of a boxed channel sender, the same way a host
/// passes the address of its completion slot.
pub struct Inbox {
    sender: *mut mpsc::Sender<Outcome>,
    receiver: mpsc::Receiver<Outcome>,
}

// The raw pointer is only dereferenced as a shared `Sender`, which is `Sync`.
unsafe impl Send for Inbox {}

impl Inbox {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender: Box::into_raw(Box::new(sender)),
            receiver,
        }
    }

    pub fn token(&self) -> usize {
        self.sender as usize
    }

    /// Waits for the next outcome; panics if none arrives within 5 seconds.
    pub fn recv(&self) -> Outcome {
        self.receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("no callback within 5 seconds")
    }

    pub fn try_recv(&self) -> Option<Outcome> {
        self.receiver.try_recv().ok()
    }

    /// Asserts that no further callback fires for this token.
    pub fn assert_no_more(&self) {
        if let Ok(extra) = self.receiver.recv_timeout(Duration::from_millis(100)) {
            panic!("unexpected extra callback: {:?}", extra);
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        // SAFETY: created by `Box::into_raw` in `new`.
        drop(unsafe { Box::from_raw(self.sender) });
    }
}

unsafe extern "C" fn on_success(token: usize, message: *const c_char) {
    let text = if message.is_null() {
        None
    } else {
        Some(CStr::from_ptr(message).to_string_lossy().into_owned())
    };
    let sender = &*(token as *const mpsc::Sender<Outcome>);
    let _ = sender.send(Outcome::Success(text));
}

unsafe extern "C" fn on_failure(token: usize, message: *const c_char, kind: RequestErrorType) {
    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
    crate::ffi::free_error_message(message as *mut c_char);
    let sender = &*(token as *const mpsc::Sender<Outcome>);
    let _ = sender.send(Outcome::Failure(text, kind));
}

/// Callbacks that forward into the [`Inbox`] addressed by the token.
pub fn callbacks() -> Callbacks {
    Callbacks {
        success: on_success,
        failure: on_failure,
    }
}
