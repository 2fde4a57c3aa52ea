//! End-to-end tests driving a live server over real sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use vigil::http::{self, status};
use vigil::websocket::{encode_frame, Opcode};
use vigil::{syscalls, Config, Response, Server};

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        thread_pool_size: 2,
        request_timeout_seconds: 2,
        ..Config::default()
    }
}

fn start_server(server: &Server) -> u16 {
    server.start().expect("server should start");
    server.local_port().expect("listen port should be known")
}

/// Send raw bytes and collect the full response (the server closes the
/// connection after answering).
fn roundtrip(port: u16, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request).unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn serves_registered_route() {
    let server = Server::new(test_config()).unwrap();
    server.get("/hello", |_req| http::ok("hi there"));
    let port = start_server(&server);

    let response = roundtrip(port, b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains(&format!("Server: {}\r\n", http::SERVER_NAME)));
    assert!(response.ends_with("hi there"));

    server.stop();
}

#[test]
fn unrouted_path_is_404() {
    let server = Server::new(test_config()).unwrap();
    server.get("/known", |_req| http::ok("yes"));
    let port = start_server(&server);

    let response = roundtrip(port, b"GET /unknown HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("Route not found"));

    server.stop();
}

#[test]
fn path_params_reach_the_handler() {
    let server = Server::new(test_config()).unwrap();
    server.get("/users/:id", |req| {
        http::ok(format!("id={}", req.path_params["id"]))
    });
    let port = start_server(&server);

    let response = roundtrip(port, b"GET /users/123 HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("id=123"));

    server.stop();
}

#[test]
fn post_body_is_delivered() {
    let server = Server::new(test_config()).unwrap();
    server.post("/echo", |req| http::ok(req.body.clone()));
    let port = start_server(&server);

    let response = roundtrip(
        port,
        b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 17\r\n\r\n{\"name\": \"Alice\"}",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("{\"name\": \"Alice\"}"));

    server.stop();
}

#[test]
fn query_params_are_decoded() {
    let server = Server::new(test_config()).unwrap();
    server.get("/search", |req| {
        http::ok(format!(
            "q={} page={}",
            req.query_params["q"], req.query_params["page"]
        ))
    });
    let port = start_server(&server);

    let response = roundtrip(
        port,
        b"GET /search?q=rust+lang&page=2 HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );

    assert!(response.ends_with("q=rust lang page=2"));

    server.stop();
}

#[test]
fn handler_panic_becomes_500() {
    let server = Server::new(test_config()).unwrap();
    server.get("/boom", |_req| -> Response { panic!("handler bug") });
    let port = start_server(&server);

    let response = roundtrip(port, b"GET /boom HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(response.ends_with("Internal Server Error"));

    // The server keeps working afterwards.
    server.get("/ok", |_req| http::ok("fine"));
    let response = roundtrip(port, b"GET /ok HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    server.stop();
}

#[test]
fn method_mismatch_is_404() {
    let server = Server::new(test_config()).unwrap();
    server.post("/submit", |_req| http::created("made"));
    let port = start_server(&server);

    let response = roundtrip(port, b"GET /submit HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let response = roundtrip(
        port,
        b"POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));

    server.stop();
}

#[test]
fn websocket_upgrade_handshake_and_frame() {
    let server = Server::new(test_config()).unwrap();
    server.register_websocket_handler("/ws/echo", |fd, _raw| {
        let frame = encode_frame(b"Hello", Opcode::Text);
        let mut written = 0;
        while written < frame.len() {
            match syscalls::write_fd(fd, &frame[written..]) {
                Ok(n) if n > 0 => written += n,
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break,
            }
        }
        syscalls::close_fd(fd);
    });
    let port = start_server(&server);

    let response = roundtrip(
        port,
        b"GET /ws/echo HTTP/1.1\r\n\
          Host: localhost\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          \r\n",
    );

    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // After the handshake terminator comes the first frame.
    let head_end = response.find("\r\n\r\n").unwrap() + 4;
    let frame = &response.as_bytes()[head_end..];
    assert_eq!(frame, [0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);

    server.stop();
}

#[test]
fn websocket_upgrade_without_handler_closes() {
    let server = Server::new(test_config()).unwrap();
    let port = start_server(&server);

    let response = roundtrip(
        port,
        b"GET /ws/none HTTP/1.1\r\n\
          Host: localhost\r\n\
          Upgrade: websocket\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          \r\n",
    );

    // Handshake completes, then the connection is simply closed.
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.ends_with("\r\n\r\n"));

    server.stop();
}

#[test]
fn static_files_served_and_traversal_refused() {
    let base = std::env::temp_dir().join(format!("vigil-static-{}", std::process::id()));
    let docroot = base.join("public");
    std::fs::create_dir_all(&docroot).unwrap();
    std::fs::write(docroot.join("page.html"), "<h1>hi</h1>").unwrap();
    std::fs::write(base.join("secret.txt"), "keep out").unwrap();

    let server = Server::new(test_config()).unwrap();
    server.serve_static("/static", docroot.to_str().unwrap());
    let port = start_server(&server);

    let response = roundtrip(
        port,
        b"GET /static/page.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/html\r\n"));
    assert!(response.ends_with("<h1>hi</h1>"));

    let response = roundtrip(
        port,
        b"GET /static/../secret.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));

    let response = roundtrip(
        port,
        b"GET /static/missing.css HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    server.stop();
    let _ = std::fs::remove_dir_all(&base);
}

#[test]
fn stop_closes_the_listen_socket() {
    let server = Server::new(test_config()).unwrap();
    server.get("/", |_req| http::ok("root"));
    let port = start_server(&server);

    assert!(server.is_running());
    server.stop();
    assert!(!server.is_running());

    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}

#[test]
fn json_endpoint_sets_content_type() {
    let server = Server::new(test_config()).unwrap();
    server.get("/api/data", |_req| {
        http::json_response(r#"{"value":42}"#, status::OK)
    });
    let port = start_server(&server);

    let response = roundtrip(port, b"GET /api/data HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(response.contains("Content-Type: application/json\r\n"));
    assert!(response.contains("Content-Length: 12\r\n"));
    assert!(response.ends_with(r#"{"value":42}"#));

    server.stop();
}
