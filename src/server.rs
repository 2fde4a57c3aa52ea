//! The server shell: composes the reactor, worker pool, router, and
//! WebSocket path into a running HTTP server.
//!
//! One request per connection. A worker reads the whole request, dispatches
//! it, writes the response, and closes the socket. The exception is a
//! WebSocket upgrade, where the descriptor is handed to the registered
//! handler and left open.

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{ServerError, ServerResult};
use crate::http::{self, Method, Request, Response};
use crate::parser;
use crate::pool::WorkerPool;
use crate::reactor::Reactor;
use crate::router::Router;
use crate::syscalls;
use crate::websocket;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

/// Assumes ownership of the descriptor; responsible for closing it.
pub type WebSocketHandler = Arc<dyn Fn(RawFd, &[u8]) + Send + Sync>;

/// Pause between retries when a non-blocking socket reports "would block".
const RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Retry cap for response writes.
const WRITE_MAX_ATTEMPTS: u32 = 100;

struct Core {
    config: Config,
    reactor: Arc<Reactor>,
    pool: WorkerPool,
    router: RwLock<Router>,
    ws_handlers: RwLock<HashMap<String, WebSocketHandler>>,
    ws_connections: Mutex<HashSet<RawFd>>,
    running: AtomicBool,
    listen_fd: AtomicI32,
}

pub struct Server {
    core: Arc<Core>,
    reactor_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: Config) -> ServerResult<Self> {
        let reactor = Arc::new(Reactor::new()?);
        let pool = WorkerPool::new(config.thread_pool_size);

        Ok(Self {
            core: Arc::new(Core {
                config,
                reactor,
                pool,
                router: RwLock::new(Router::new()),
                ws_handlers: RwLock::new(HashMap::new()),
                ws_connections: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                listen_fd: AtomicI32::new(-1),
            }),
            reactor_thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Register a handler for an arbitrary method.
    pub fn route<H>(&self, method: Method, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.core.router.write().unwrap().register(method, pattern, handler);
    }

    pub fn get<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Get, pattern, handler);
    }

    pub fn post<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Post, pattern, handler);
    }

    pub fn put<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Put, pattern, handler);
    }

    pub fn delete<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Delete, pattern, handler);
    }

    pub fn patch<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Patch, pattern, handler);
    }

    /// Register the WebSocket handler for `path`. On a successful upgrade
    /// the handler receives the descriptor (which it now owns) and the raw
    /// handshake request bytes.
    pub fn register_websocket_handler<H>(&self, path: &str, handler: H)
    where
        H: Fn(RawFd, &[u8]) + Send + Sync + 'static,
    {
        self.core
            .ws_handlers
            .write()
            .unwrap()
            .insert(path.to_string(), Arc::new(handler));
    }

    /// Serve files under `directory` for GET requests below `prefix`.
    /// Resolved paths must stay inside the directory; escapes are 403.
    pub fn serve_static(&self, prefix: &str, directory: &str) {
        let dir = Path::new(directory);
        if !dir.is_dir() {
            tracing::warn!(directory, "static directory does not exist");
            return;
        }

        let prefix_owned = prefix.trim_end_matches('/').to_string();
        let directory_owned = directory.to_string();
        let pattern = format!("{}/*", prefix_owned);

        self.get(&pattern, move |request| {
            serve_static_file(&prefix_owned, &directory_owned, request)
        });
    }

    /// Bind, listen, install the accept callback, and launch the reactor
    /// thread. Returns once the server is accepting connections.
    pub fn start(&self) -> ServerResult<()> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listen_fd = match syscalls::create_listen_socket(
            &self.core.config.host,
            self.core.config.port,
            self.core.config.max_connections as i32,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                self.core.running.store(false, Ordering::SeqCst);
                return Err(ServerError::Io(e));
            }
        };
        self.core.listen_fd.store(listen_fd, Ordering::SeqCst);

        let accept_core = self.core.clone();
        if let Err(e) = self.core.reactor.register_read(
            listen_fd,
            Arc::new(move |fd, _kind| accept_drain(&accept_core, fd)),
        ) {
            syscalls::close_fd(listen_fd);
            self.core.listen_fd.store(-1, Ordering::SeqCst);
            self.core.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let reactor = self.core.reactor.clone();
        let handle = thread::Builder::new()
            .name("vigil-reactor".to_string())
            .spawn(move || reactor.run())
            .map_err(|e| ServerError::Io(e))?;
        *self.reactor_thread.lock().unwrap() = Some(handle);

        tracing::info!(
            address = %self.core.config.bind_addr(),
            workers = self.core.pool.size(),
            "server listening"
        );
        Ok(())
    }

    /// Stop accepting, stop the reactor, and close the listen socket.
    /// In-flight worker tasks run to completion.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.core.reactor.stop();

        let listen_fd = self.core.listen_fd.swap(-1, Ordering::SeqCst);
        if listen_fd >= 0 {
            self.core.reactor.unregister(listen_fd);
            syscalls::close_fd(listen_fd);
        }

        if let Some(handle) = self.reactor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// The actual listen port (useful when configured with port 0).
    pub fn local_port(&self) -> Option<u16> {
        let fd = self.core.listen_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return None;
        }
        syscalls::local_port(fd).ok()
    }

    /// Drop the bookkeeping entry for an upgraded descriptor. WebSocket
    /// handlers call this when they close a connection they own.
    pub fn forget_websocket(&self, fd: RawFd) {
        self.core.ws_connections.lock().unwrap().remove(&fd);
    }

    pub fn websocket_connection_count(&self) -> usize {
        self.core.ws_connections.lock().unwrap().len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept until the queue reports "would block"; hand each connection a
/// one-shot read callback that submits it to the worker pool.
fn accept_drain(core: &Arc<Core>, listen_fd: RawFd) {
    loop {
        match syscalls::accept_connection(listen_fd) {
            Ok(Some(client_fd)) => {
                let submit_core = core.clone();
                let register = core.reactor.register_read(
                    client_fd,
                    Arc::new(move |fd, _kind| {
                        submit_core.reactor.unregister(fd);
                        let task_core = submit_core.clone();
                        if let Err(e) = submit_core.pool.submit(move || {
                            handle_connection(&task_core, fd);
                        }) {
                            tracing::error!(fd, error = %e, "could not submit connection");
                            syscalls::close_fd(fd);
                        }
                    }),
                );
                if let Err(e) = register {
                    tracing::error!(fd = client_fd, error = %e, "could not register connection");
                    syscalls::close_fd(client_fd);
                }
            }
            Ok(None) => break,
            Err(e) => {
                if core.running.load(Ordering::SeqCst) {
                    tracing::error!(error = %e, "accept failed");
                }
                break;
            }
        }
    }
}

/// Worker-side request lifecycle for one connection.
fn handle_connection(core: &Arc<Core>, fd: RawFd) {
    let conn = Connection::new(fd);

    let raw = match read_request(core, &conn) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(peer = %conn.remote_addr(), error = %e, "request read failed");
            return;
        }
    };
    if raw.is_empty() {
        return;
    }

    if websocket::is_upgrade_request(&raw) {
        handle_websocket(core, conn, &raw);
        return;
    }

    let request = parser::parse(&raw);
    tracing::info!(
        peer = %conn.remote_addr(),
        method = %request.method,
        path = %request.path,
        "request"
    );

    let response = dispatch_with_recovery(core, request);
    if let Err(e) = write_all(&conn, &response.to_bytes()) {
        tracing::warn!(peer = %conn.remote_addr(), error = %e, "response write failed");
    }
    // Connection drops here and closes the descriptor.
}

fn dispatch_with_recovery(core: &Arc<Core>, request: Request) -> Response {
    let router = core.router.read().unwrap();
    match catch_unwind(AssertUnwindSafe(|| router.dispatch(request))) {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("handler panicked");
            http::internal_error("Internal Server Error")
        }
    }
}

/// Read a full request with a bounded retry loop: 10 ms between "would
/// block" retries, budget derived from `request_timeout_seconds`.
fn read_request(core: &Arc<Core>, conn: &Connection) -> io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; core.config.read_buffer_size.max(1)];
    let mut request = Vec::new();

    let max_attempts = (core.config.request_timeout_seconds * 100).max(1);
    let mut attempts = 0u64;

    loop {
        match conn.read(&mut chunk) {
            Ok(0) => break, // peer closed
            Ok(n) => {
                request.extend_from_slice(&chunk[..n]);
                attempts = 0;
                if request_is_complete(&request) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                attempts += 1;
                if attempts >= max_attempts {
                    break;
                }
                thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(request)
}

/// Headers finished, and any declared `content-length` fully buffered.
fn request_is_complete(raw: &[u8]) -> bool {
    let Some(head_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let body_received = raw.len() - (head_end + 4);

    let head = String::from_utf8_lossy(&raw[..head_end]);
    for line in head.lines().skip(1) {
        if let Some(colon) = line.find(':') {
            if line[..colon].trim().eq_ignore_ascii_case("content-length") {
                if let Ok(declared) = line[colon + 1..].trim().parse::<usize>() {
                    return body_received >= declared;
                }
            }
        }
    }
    true
}

fn write_all(conn: &Connection, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0usize;
    let mut attempts = 0u32;

    while written < bytes.len() {
        match conn.write(&bytes[written..]) {
            Ok(0) => break, // peer stopped reading
            Ok(n) => {
                written += n;
                attempts = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                attempts += 1;
                if attempts >= WRITE_MAX_ATTEMPTS {
                    break;
                }
                thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }

    if written < bytes.len() {
        tracing::warn!(written, total = bytes.len(), "short response write");
    }
    Ok(())
}

/// Complete the upgrade and transfer descriptor ownership to the registered
/// handler. Without a handler for the path the connection is closed.
fn handle_websocket(core: &Arc<Core>, conn: Connection, raw: &[u8]) {
    let path = parser::parse(raw).path;

    let Some(handshake) = websocket::handshake_response(raw) else {
        tracing::warn!(peer = %conn.remote_addr(), "upgrade without Sec-WebSocket-Key");
        return;
    };

    if let Err(e) = write_all(&conn, &handshake) {
        tracing::warn!(peer = %conn.remote_addr(), error = %e, "handshake write failed");
        return;
    }

    let handler = core.ws_handlers.read().unwrap().get(&path).cloned();
    match handler {
        Some(handler) => {
            let fd = conn.into_raw();
            core.ws_connections.lock().unwrap().insert(fd);
            tracing::info!(fd, path = %path, "websocket upgraded");

            if catch_unwind(AssertUnwindSafe(|| handler(fd, raw))).is_err() {
                tracing::error!(fd, path = %path, "websocket handler panicked");
            }
        }
        None => {
            tracing::warn!(path = %path, "no websocket handler registered");
            // conn drops and closes.
        }
    }
}

fn serve_static_file(prefix: &str, directory: &str, request: &Request) -> Response {
    let mut rel = request.path.strip_prefix(prefix).unwrap_or(&request.path);
    rel = rel.trim_start_matches('/');

    let canonical_dir = match std::fs::canonicalize(directory) {
        Ok(dir) => dir,
        Err(_) => return http::internal_error("Static directory unavailable"),
    };

    let candidate = canonical_dir.join(rel);
    let canonical_file = match std::fs::canonicalize(&candidate) {
        Ok(file) => file,
        Err(_) => return http::not_found("File not found"),
    };

    if !canonical_file.starts_with(&canonical_dir) {
        return http::forbidden("Access denied");
    }

    Response::from_file(&canonical_file)
}
