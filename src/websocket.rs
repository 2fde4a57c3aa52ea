//! RFC 6455 upgrade handshake and frame codec.
//!
//! The handshake side works on the raw request bytes so it can run before
//! (or without) full HTTP parsing. Frames are encoded unmasked (server to
//! client) and decoded with mask support (client to server).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// Magic GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// True when the raw request carries an `Upgrade: websocket` header
/// (ASCII case-insensitive).
pub fn is_upgrade_request(raw: &[u8]) -> bool {
    header_value(raw, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Pull the trimmed `Sec-WebSocket-Key` value out of the raw request.
pub fn extract_key(raw: &[u8]) -> Option<String> {
    header_value(raw, "sec-websocket-key")
}

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn generate_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the 101 Switching Protocols response, or `None` when the client
/// key is missing (the upgrade is then abandoned).
pub fn handshake_response(raw: &[u8]) -> Option<Vec<u8>> {
    let key = extract_key(raw)?;
    let accept = generate_accept_key(&key);

    Some(
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            accept
        )
        .into_bytes(),
    )
}

/// Encode a single unmasked frame with FIN set.
pub fn encode_frame(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 10);

    frame.push(0x80 | (opcode as u8 & 0x0F));

    if len < 126 {
        frame.push(len as u8);
    } else if len < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Decode one frame from the front of `buf`. Returns the frame and the
/// number of bytes it occupied, or `None` when the buffer does not yet hold
/// a complete frame (the caller buffers more input and retries).
pub fn decode_frame(buf: &[u8]) -> Option<(Frame, usize)> {
    if buf.len() < 2 {
        return None;
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as usize;

    let (payload_len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len_bytes) as usize, 10)
        }
        n => (n, 2),
    };

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return None;
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return None;
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        offset + payload_len,
    ))
}

fn header_value(raw: &[u8], name: &str) -> Option<String> {
    for line in raw.split(|&b| b == b'\n').skip(1) {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(line);
        if let Some(colon) = text.find(':') {
            if text[..colon].trim().eq_ignore_ascii_case(name) {
                return Some(text[colon + 1..].trim().to_string());
            }
        }
    }
    None
}
