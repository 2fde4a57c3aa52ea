use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use vigil::http::{self, status};
use vigil::metrics::now_millis;
use vigil::websocket::{decode_frame, encode_frame, Opcode};
use vigil::{logging, syscalls, AlertManager, Config, MetricsCollector, MetricsStorage, Response, Server};

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");

/// One hour of one-second samples.
const STORAGE_CAPACITY: usize = 3600;

fn main() {
    let mut config = Config::from_env();

    // vigil [port] [workers]
    let args: Vec<String> = std::env::args().collect();
    if let Some(port) = args.get(1).and_then(|a| a.parse().ok()) {
        config.port = port;
    }
    if let Some(workers) = args.get(2).and_then(|a| a.parse().ok()) {
        config.thread_pool_size = workers;
    }

    logging::init_logging(&config);

    let running = Arc::new(AtomicBool::new(true));
    let storage = Arc::new(MetricsStorage::new(STORAGE_CAPACITY));
    let alerts = Arc::new(AlertManager::new());
    alerts.set_cpu_threshold(80.0);
    alerts.set_memory_threshold(85.0);
    alerts.set_disk_threshold(90.0);
    alerts.set_network_threshold(100.0 * 1024.0 * 1024.0);

    spawn_collector(storage.clone(), alerts.clone(), running.clone());

    let server = match Server::new(config.clone()) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!(error = %e, "could not create server");
            std::process::exit(1);
        }
    };

    register_routes(&server, &storage, &alerts);

    if !config.static_directory.is_empty() {
        server.serve_static("/static", &config.static_directory);
    }

    let ws_storage = storage.clone();
    let ws_running = running.clone();
    let ws_server = Arc::downgrade(&server);
    server.register_websocket_handler("/ws/metrics", move |fd, _raw| {
        let storage = ws_storage.clone();
        let running = ws_running.clone();
        let server = ws_server.clone();
        let spawned = thread::Builder::new()
            .name(format!("vigil-ws-{}", fd))
            .spawn(move || stream_metrics(fd, storage, running, server));
        if spawned.is_err() {
            syscalls::close_fd(fd);
        }
    });

    let ctrlc_running = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        ctrlc_running.store(false, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "could not install signal handler");
    }

    if let Err(e) = server.start() {
        tracing::error!(error = %e, "server failed to start");
        std::process::exit(1);
    }

    tracing::info!(
        dashboard = format!("http://localhost:{}/", config.port),
        websocket = format!("ws://localhost:{}/ws/metrics", config.port),
        "vigil is up"
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    server.stop();
}

fn spawn_collector(
    storage: Arc<MetricsStorage>,
    alerts: Arc<AlertManager>,
    running: Arc<AtomicBool>,
) {
    let spawned = thread::Builder::new()
        .name("vigil-metrics".to_string())
        .spawn(move || {
            let mut collector = MetricsCollector::new();
            while running.load(Ordering::Acquire) {
                let sample = collector.collect();
                storage.add_sample(sample);
                alerts.check_metrics(&sample);
                thread::sleep(Duration::from_secs(1));
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "could not start metrics collector");
    }
}

fn register_routes(server: &Server, storage: &Arc<MetricsStorage>, alerts: &Arc<AlertManager>) {
    server.get("/", |_req| {
        let mut response = Response::new(status::OK);
        response.set_content_type("text/html");
        response.set_body(DASHBOARD_HTML.as_bytes().to_vec());
        response
    });

    let latest_storage = storage.clone();
    server.get("/api/metrics/latest", move |_req| {
        match latest_storage.latest() {
            Some(sample) => http::json_response(sample.to_json(), status::OK),
            None => http::json_response("{}", status::OK),
        }
    });

    let range_storage = storage.clone();
    server.get("/api/metrics/range", move |req| {
        let seconds = req
            .query_params
            .get("seconds")
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);
        let samples = range_storage.last_seconds(seconds);
        let json = serde_json::to_string(&samples).unwrap_or_else(|_| "[]".to_string());
        http::json_response(json, status::OK)
    });

    let stats_storage = storage.clone();
    server.get("/api/metrics/stats", move |req| {
        let seconds: u64 = req
            .query_params
            .get("seconds")
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600);
        let end = now_millis();
        let stats = stats_storage.aggregate(end.saturating_sub(seconds * 1000), end);
        let json = serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string());
        http::json_response(json, status::OK)
    });

    let alerts_clone = alerts.clone();
    server.get("/api/alerts", move |_req| {
        let json =
            serde_json::to_string(&alerts_clone.active_alerts()).unwrap_or_else(|_| "[]".to_string());
        http::json_response(json, status::OK)
    });

    server.get("/health", |_req| {
        http::json_response(r#"{"status": "healthy", "service": "vigil"}"#, status::OK)
    });
}

/// Stream one metrics sample per second over an upgraded socket. The
/// session ends on a client Close frame, EOF, or any send failure.
fn stream_metrics(
    fd: RawFd,
    storage: Arc<MetricsStorage>,
    running: Arc<AtomicBool>,
    server: Weak<Server>,
) {
    let mut inbox: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 512];

    'session: while running.load(Ordering::Acquire) {
        // Drain client frames between sends to catch Close promptly.
        loop {
            match syscalls::read_fd(fd, &mut read_buf) {
                Ok(0) => break 'session,
                Ok(n) => {
                    inbox.extend_from_slice(&read_buf[..n]);
                    while let Some((frame, consumed)) = decode_frame(&inbox) {
                        inbox.drain(..consumed);
                        match frame.opcode {
                            Opcode::Close => {
                                let _ = write_frame(fd, &encode_frame(&[], Opcode::Close));
                                break 'session;
                            }
                            Opcode::Ping => {
                                if !write_frame(fd, &encode_frame(&frame.payload, Opcode::Pong)) {
                                    break 'session;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break 'session,
            }
        }

        let Some(sample) = storage.latest() else {
            thread::sleep(Duration::from_millis(500));
            continue;
        };

        let frame = encode_frame(sample.to_json().as_bytes(), Opcode::Text);
        if !write_frame(fd, &frame) {
            break;
        }

        thread::sleep(Duration::from_secs(1));
    }

    let _ = write_frame(fd, &encode_frame(&[], Opcode::Close));
    syscalls::close_fd(fd);
    if let Some(server) = server.upgrade() {
        server.forget_websocket(fd);
    }
    tracing::info!(fd, "websocket stream ended");
}

fn write_frame(fd: RawFd, frame: &[u8]) -> bool {
    let mut written = 0usize;
    let mut attempts = 0u32;

    while written < frame.len() {
        match syscalls::write_fd(fd, &frame[written..]) {
            Ok(0) => return false,
            Ok(n) => {
                written += n;
                attempts = 0;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                attempts += 1;
                if attempts >= 100 {
                    return false;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return false,
        }
    }
    true
}
