//! HTTP request/response types and the response serializer.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const SERVER_NAME: &str = concat!("vigil/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Unknown,
}

impl Method {
    /// Case-insensitive parse; anything unrecognized is `Unknown`.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Unknown
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request. Immutable once parsed, except that the router fills in
/// `path_params` for the matched route.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    /// Keys lowercased; duplicate headers are last-write-wins.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub query_params: HashMap<String, String>,
    pub path_params: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

pub mod status {
    pub const SWITCHING_PROTOCOLS: u16 = 101;
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Canonical IANA reason phrase; unknown codes report `Unknown`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// An outgoing response. Header key casing is preserved on output;
/// `Content-Length` tracks the body whenever it is set through `set_body`.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        let mut response = Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        };
        response.set_header("Server", SERVER_NAME);
        response.set_header("Connection", "close");
        response
    }

    pub fn with_body(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Self::new(status);
        response.set_body(body);
        response
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    /// Set or replace a header (name match is case-insensitive).
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            entry.0 = key.to_string();
            entry.1 = value.to_string();
        } else {
            self.headers.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.set_header("Content-Type", content_type)
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        let len = self.body.len().to_string();
        self.set_header("Content-Length", &len)
    }

    pub fn set_json(&mut self, json: impl Into<String>) -> &mut Self {
        self.set_content_type("application/json");
        self.set_body(json.into().into_bytes())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serve a file from disk: 404 when missing, 400 for non-regular paths,
    /// 500 when the read fails. `Content-Type` is inferred from the
    /// extension.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return not_found("File not found"),
        };
        if !meta.is_file() {
            return bad_request("Path is not a file");
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return internal_error("Failed to open file"),
        };

        let mut response = Response::new(status::OK);
        response.set_body(bytes);
        response.set_content_type(content_type_for_path(path));
        response
    }

    /// Serialize to the wire: status line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub fn ok(body: impl Into<Vec<u8>>) -> Response {
    Response::with_body(status::OK, body)
}

pub fn created(body: impl Into<Vec<u8>>) -> Response {
    Response::with_body(status::CREATED, body)
}

pub fn not_found(message: &str) -> Response {
    plain_text(status::NOT_FOUND, message)
}

pub fn bad_request(message: &str) -> Response {
    plain_text(status::BAD_REQUEST, message)
}

pub fn forbidden(message: &str) -> Response {
    plain_text(status::FORBIDDEN, message)
}

pub fn internal_error(message: &str) -> Response {
    plain_text(status::INTERNAL_SERVER_ERROR, message)
}

pub fn json_response(json: impl Into<String>, status: u16) -> Response {
    let mut response = Response::new(status);
    response.set_json(json);
    response
}

fn plain_text(status: u16, message: &str) -> Response {
    let mut response = Response::new(status);
    response.set_content_type("text/plain");
    response.set_body(message.as_bytes().to_vec());
    response
}
