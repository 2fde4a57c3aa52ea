//! Byte-level HTTP/1.1 request parser.
//!
//! The parser is lenient: missing or malformed pieces yield empty/default
//! fields rather than an error. Callers that need strictness check the
//! resulting [`Request`] themselves.

use crate::http::{Method, Request};
use std::collections::HashMap;

/// Parse a raw request buffer into a structured [`Request`].
pub fn parse(raw: &[u8]) -> Request {
    let mut request = Request::default();
    if raw.is_empty() {
        return request;
    }

    let (head, rest) = match find_subslice(raw, b"\r\n\r\n") {
        Some(idx) => (&raw[..idx], &raw[idx + 4..]),
        None => (raw, &raw[raw.len()..]),
    };

    let mut lines = head.split(|&b| b == b'\n').map(strip_cr);

    if let Some(line) = lines.next() {
        parse_request_line(line, &mut request);
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(line);
        if let Some(colon) = text.find(':') {
            let key = text[..colon].trim().to_ascii_lowercase();
            let value = text[colon + 1..].trim().to_string();
            // Duplicates are last-write-wins.
            request.headers.insert(key, value);
        }
    }

    request.body = match request
        .headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        Some(len) => rest[..len.min(rest.len())].to_vec(),
        None => rest.to_vec(),
    };

    request
}

fn parse_request_line(line: &[u8], request: &mut Request) {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();

    if let Some(token) = parts.next() {
        request.method = Method::from_token(token);
    }

    if let Some(target) = parts.next() {
        match target.find('?') {
            Some(q) => {
                request.path = target[..q].to_string();
                request.query_params = parse_query_string(&target[q + 1..]);
            }
            None => request.path = target.to_string(),
        }
    }

    if let Some(version) = parts.next() {
        request.version = version.to_string();
    }
}

/// Parse `k=v&k2=v2` pairs; keys and values are URL-decoded, and a key
/// without `=` maps to the empty string.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.find('=') {
            Some(eq) => {
                params.insert(url_decode(&pair[..eq]), url_decode(&pair[eq + 1..]));
            }
            None => {
                params.insert(url_decode(pair), String::new());
            }
        }
    }
    params
}

/// Decode `%HH` escapes and `+`-as-space.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
