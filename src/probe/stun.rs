//! STUN message codec and Binding transactions (RFC 5389).
//!
//! Shared by the srflx gathering path and the TURN client: header and
//! attribute encoding, XOR address handling, MESSAGE-INTEGRITY and
//! FINGERPRINT, and a receive loop that matches responses by transaction ID.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::net::UdpSocket;

type HmacSha1 = Hmac<Sha1>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// STUN magic cookie (RFC 5389).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (type + length + magic + transaction ID).
pub const STUN_HEADER_SIZE: usize = 20;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;
#[cfg(test)]
pub const BINDING_ERROR_RESPONSE: u16 = 0x0111;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_REALM: u16 = 0x0014;
pub const ATTR_NONCE: u16 = 0x0015;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_FINGERPRINT: u16 = 0x8028;

/// FINGERPRINT XOR constant per RFC 5389.
const FINGERPRINT_XOR: u32 = 0x5354554e;

/// Error code ICE reports when a server could not be reached at all.
pub const ERROR_CODE_UNREACHABLE: u16 = 701;

const BINDING_TIMEOUT: Duration = Duration::from_secs(2);
const BINDING_ATTEMPTS: u32 = 2;

const REQUEST_TIMED_OUT: &str = "STUN request timed out.";
const BINDING_TIMED_OUT: &str = "STUN binding request timed out.";

// ---------------------------------------------------------------------------
// CRC-32 (IEEE 802.3) for the FINGERPRINT attribute.
// ---------------------------------------------------------------------------

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFFFFFF
}

// ---------------------------------------------------------------------------
// Transaction errors
// ---------------------------------------------------------------------------

/// A failed STUN/TURN transaction, as an ICE error code and text.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionError {
    pub code: u16,
    pub reason: String,
}

impl TransactionError {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            code: ERROR_CODE_UNREACHABLE,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

// ---------------------------------------------------------------------------
// Message building
// ---------------------------------------------------------------------------

/// Generate a random 12-byte STUN transaction ID.
pub fn generate_transaction_id() -> [u8; 12] {
    let id = uuid::Uuid::new_v4();
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&id.as_bytes()[..12]);
    txn
}

pub fn build_header(msg_type: u16, txn_id: &[u8; 12]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&msg_type.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // length placeholder
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(txn_id);
    buf
}

/// Write the attribute length into the header.
pub fn set_length(buf: &mut [u8]) {
    let attr_len = (buf.len() - STUN_HEADER_SIZE) as u16;
    buf[2..4].copy_from_slice(&attr_len.to_be_bytes());
}

/// Append an attribute, padding the value to a 4-byte boundary.
pub fn append_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    let pad = (4 - (value.len() % 4)) % 4;
    buf.extend(std::iter::repeat(0).take(pad));
}

/// Append MESSAGE-INTEGRITY (HMAC-SHA1 keyed by `key`) and FINGERPRINT.
pub fn add_message_integrity_and_fingerprint(mut buf: Vec<u8>, key: &[u8]) -> Vec<u8> {
    // The length must already cover MESSAGE-INTEGRITY (24 bytes) when hashing.
    let mi_length = (buf.len() - STUN_HEADER_SIZE + 24) as u16;
    buf[2..4].copy_from_slice(&mi_length.to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length is valid");
    mac.update(&buf);
    let hmac_result = mac.finalize().into_bytes();
    append_attr(&mut buf, ATTR_MESSAGE_INTEGRITY, &hmac_result[..20]);

    let fp_length = (buf.len() - STUN_HEADER_SIZE + 8) as u16;
    buf[2..4].copy_from_slice(&fp_length.to_be_bytes());

    let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
    append_attr(&mut buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());

    buf
}

/// Build a STUN Binding Request (header only, no attributes).
pub fn build_binding_request(txn_id: &[u8; 12]) -> Vec<u8> {
    build_header(BINDING_REQUEST, txn_id)
}

/// Encode a SocketAddr as an XOR-*-ADDRESS attribute value.
#[cfg(test)]
pub fn encode_xor_address(addr: SocketAddr, txn_id: &[u8; 12]) -> Vec<u8> {
    let mut val = Vec::with_capacity(20);
    val.push(0); // reserved
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            val.push(0x01);
            val.extend_from_slice(&xport.to_be_bytes());
            let cookie = MAGIC_COOKIE.to_be_bytes();
            val.extend(ip.octets().iter().zip(cookie.iter()).map(|(a, b)| a ^ b));
        }
        IpAddr::V6(ip) => {
            val.push(0x02);
            val.extend_from_slice(&xport.to_be_bytes());
            let key = xor_key_v6(txn_id);
            val.extend(ip.octets().iter().zip(key.iter()).map(|(a, b)| a ^ b));
        }
    }
    val
}

fn xor_key_v6(txn_id: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    if txn_id.len() >= 12 {
        key[4..16].copy_from_slice(&txn_id[..12]);
    }
    key
}

/// Decode an XOR-*-ADDRESS attribute value.
pub fn decode_xor_address(value: &[u8], txn_id: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ (MAGIC_COOKIE >> 16) as u16;

    match family {
        0x01 if value.len() >= 8 => {
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let ip = Ipv4Addr::new(
                value[4] ^ cookie[0],
                value[5] ^ cookie[1],
                value[6] ^ cookie[2],
                value[7] ^ cookie[3],
            );
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if value.len() >= 20 => {
            let key = xor_key_v6(txn_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(octets.into()), port))
        }
        _ => None,
    }
}

/// Decode a MAPPED-ADDRESS attribute value (no XOR, IPv4 only).
fn decode_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Check if a packet looks like a STUN message (leading zero bits + magic cookie).
pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < STUN_HEADER_SIZE || data[0] & 0xC0 != 0 {
        return false;
    }
    u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

pub fn message_type(data: &[u8]) -> Option<u16> {
    is_stun_message(data).then(|| u16::from_be_bytes([data[0], data[1]]))
}

pub fn transaction_id(data: &[u8]) -> Option<[u8; 12]> {
    if data.len() < STUN_HEADER_SIZE {
        return None;
    }
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&data[8..20]);
    Some(txn)
}

/// Error responses have the class bits 0b11.
pub fn is_error_response(msg_type: u16) -> bool {
    msg_type & 0x0110 == 0x0110
}

/// Iterate over the attributes of a STUN message.
pub fn iter_attrs(data: &[u8], mut f: impl FnMut(u16, &[u8])) {
    if data.len() < STUN_HEADER_SIZE {
        return;
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let attrs_end = std::cmp::min(STUN_HEADER_SIZE + msg_len, data.len());

    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let attr_start = pos + 4;
        let attr_end = attr_start + attr_len;
        if attr_end > attrs_end {
            break;
        }
        f(attr_type, &data[attr_start..attr_end]);
        pos = attr_start + ((attr_len + 3) & !3);
    }
}

/// Decode the ERROR-CODE attribute, if present.
pub fn parse_error_code(data: &[u8]) -> Option<(u16, String)> {
    let mut result = None;
    iter_attrs(data, |attr_type, value| {
        if attr_type == ATTR_ERROR_CODE && value.len() >= 4 && result.is_none() {
            let class = (value[2] & 0x07) as u16;
            let number = value[3] as u16;
            let reason = String::from_utf8_lossy(&value[4..]).to_string();
            result = Some((class * 100 + number, reason));
        }
    });
    result
}

/// Extract the mapped address from a Binding Success Response.
pub fn parse_binding_response(data: &[u8]) -> Option<SocketAddr> {
    if message_type(data)? != BINDING_RESPONSE {
        return None;
    }
    let txn_id = &data[8..20];

    let mut xor_mapped = None;
    let mut mapped = None;
    iter_attrs(data, |attr_type, value| match attr_type {
        ATTR_XOR_MAPPED_ADDRESS => xor_mapped = decode_xor_address(value, txn_id),
        ATTR_MAPPED_ADDRESS => mapped = decode_mapped_address(value),
        _ => {}
    });

    xor_mapped.or(mapped)
}

/// Verify MESSAGE-INTEGRITY of a received message against `key`.
pub fn verify_message_integrity(data: &[u8], key: &[u8]) -> bool {
    if data.len() < STUN_HEADER_SIZE {
        return false;
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let attrs_end = std::cmp::min(STUN_HEADER_SIZE + msg_len, data.len());

    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let attr_start = pos + 4;

        if attr_type == ATTR_MESSAGE_INTEGRITY && attr_len == 20 {
            let attr_end = attr_start + 20;
            if attr_end > data.len() {
                return false;
            }

            // Hash covers everything before the attribute, with the length
            // field adjusted to end right after MESSAGE-INTEGRITY.
            let mut check_buf = data[..pos].to_vec();
            let adjusted_len = (pos - STUN_HEADER_SIZE + 24) as u16;
            check_buf[2..4].copy_from_slice(&adjusted_len.to_be_bytes());

            let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length is valid");
            mac.update(&check_buf);
            return mac.verify_slice(&data[attr_start..attr_end]).is_ok();
        }

        pos = attr_start + ((attr_len + 3) & !3);
    }

    false
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Wait for the response to `txn_id` from `server`, ignoring unrelated packets.
pub async fn recv_response(
    socket: &UdpSocket,
    server: SocketAddr,
    txn_id: &[u8; 12],
    timeout: Duration,
) -> Result<Vec<u8>, TransactionError> {
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let data = &buf[..len];
                if from != server || !is_stun_message(data) {
                    continue;
                }
                if transaction_id(data).as_ref() != Some(txn_id) {
                    continue;
                }
                return Ok(data.to_vec());
            }
            Ok(Err(e)) => {
                return Err(TransactionError::unreachable(format!("recv from {} failed: {}", server, e)));
            }
            Err(_) => {
                return Err(TransactionError::unreachable(REQUEST_TIMED_OUT));
            }
        }
    }
}

/// Run a Binding transaction and return our address as seen by `server`.
pub async fn binding(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr, TransactionError> {
    let txn_id = generate_transaction_id();
    let request = build_binding_request(&txn_id);

    let mut last_err = TransactionError::unreachable(BINDING_TIMED_OUT);
    for attempt in 0..BINDING_ATTEMPTS {
        if let Err(e) = socket.send_to(&request, server).await {
            return Err(TransactionError::unreachable(format!(
                "send to {} failed: {}",
                server, e
            )));
        }

        match recv_response(socket, server, &txn_id, BINDING_TIMEOUT).await {
            Ok(data) => match message_type(&data) {
                Some(BINDING_RESPONSE) => {
                    return parse_binding_response(&data).ok_or_else(|| {
                        TransactionError::unreachable("Binding response without mapped address")
                    });
                }
                Some(t) if is_error_response(t) => {
                    let (code, reason) = parse_error_code(&data)
                        .unwrap_or((400, "Binding error response".to_string()));
                    return Err(TransactionError { code, reason });
                }
                _ => {
                    tracing::debug!("Unexpected STUN response from {}", server);
                }
            },
            Err(e) => {
                tracing::debug!("STUN binding to {} failed (attempt {}): {}", server, attempt, e);
                if e.reason != REQUEST_TIMED_OUT {
                    last_err = e;
                }
            }
        }
    }

    Err(last_err)
}

// ---------------------------------------------------------------------------
// Server-side helpers for loopback fakes in tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub fn build_binding_response(txn_id: &[u8; 12], mapped_addr: SocketAddr) -> Vec<u8> {
    let mut buf = build_header(BINDING_RESPONSE, txn_id);
    let xma = encode_xor_address(mapped_addr, txn_id);
    append_attr(&mut buf, ATTR_XOR_MAPPED_ADDRESS, &xma);
    set_length(&mut buf);
    buf
}

#[cfg(test)]
pub fn build_error_response(
    msg_type: u16,
    txn_id: &[u8; 12],
    code: u16,
    reason: &str,
    realm: Option<&str>,
    nonce: Option<&str>,
) -> Vec<u8> {
    let mut buf = build_header(msg_type, txn_id);
    let mut ec = vec![0u8, 0, (code / 100) as u8, (code % 100) as u8];
    ec.extend_from_slice(reason.as_bytes());
    append_attr(&mut buf, ATTR_ERROR_CODE, &ec);
    if let Some(realm) = realm {
        append_attr(&mut buf, ATTR_REALM, realm.as_bytes());
    }
    if let Some(nonce) = nonce {
        append_attr(&mut buf, ATTR_NONCE, nonce.as_bytes());
    }
    set_length(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_values() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32(b""), 0x00000000);
    }

    #[test]
    fn test_binding_request_header() {
        let txn_id = [1u8; 12];
        let req = build_binding_request(&txn_id);
        assert_eq!(req.len(), STUN_HEADER_SIZE);
        assert_eq!(&req[0..2], &[0x00, 0x01]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(transaction_id(&req), Some(txn_id));
    }

    #[test]
    fn test_binding_response_parseable() {
        let txn_id = [7u8; 12];
        let addr: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let resp = build_binding_response(&txn_id, addr);
        assert_eq!(message_type(&resp), Some(BINDING_RESPONSE));
        assert_eq!(parse_binding_response(&resp), Some(addr));
    }

    #[test]
    fn test_xor_address_ipv6() {
        let txn_id = [0x5Au8; 12];
        let addr: SocketAddr = "[2001:db8::42]:3478".parse().unwrap();
        let encoded = encode_xor_address(addr, &txn_id);
        assert_eq!(decode_xor_address(&encoded, &txn_id), Some(addr));
    }

    #[test]
    fn test_error_code_parsing() {
        let txn_id = [3u8; 12];
        let resp = build_error_response(
            BINDING_ERROR_RESPONSE,
            &txn_id,
            401,
            "Unauthorized",
            Some("example.org"),
            None,
        );
        assert!(is_error_response(message_type(&resp).unwrap()));
        assert_eq!(parse_error_code(&resp), Some((401, "Unauthorized".to_string())));
        assert!(parse_binding_response(&resp).is_none());
    }

    #[test]
    fn test_message_integrity_and_fingerprint() {
        let txn_id = [0xABu8; 12];
        let mut req = build_header(BINDING_REQUEST, &txn_id);
        append_attr(&mut req, ATTR_USERNAME, b"user");
        let msg = add_message_integrity_and_fingerprint(req, b"key");

        let len = msg.len();
        let fp_type = u16::from_be_bytes([msg[len - 8], msg[len - 7]]);
        assert_eq!(fp_type, ATTR_FINGERPRINT);
        let fp_val = u32::from_be_bytes([msg[len - 4], msg[len - 3], msg[len - 2], msg[len - 1]]);
        assert_eq!(fp_val, crc32(&msg[..len - 8]) ^ FINGERPRINT_XOR);

        assert!(verify_message_integrity(&msg, b"key"));
        assert!(!verify_message_integrity(&msg, b"other"));
    }

    #[test]
    fn test_non_stun_rejected() {
        assert!(!is_stun_message(&[0u8; 20]));
        assert!(!is_stun_message(&[0u8; 5]));
        let mut channel_data = build_binding_request(&[0u8; 12]);
        channel_data[0] = 0x40;
        assert!(!is_stun_message(&channel_data));
    }

    #[tokio::test]
    async fn test_binding_against_loopback_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let txn = transaction_id(&buf[..len]).unwrap();
            let resp = build_binding_response(&txn, from);
            server.send_to(&resp, from).await.unwrap();
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapped = binding(&client, server_addr).await.unwrap();
        assert_eq!(mapped, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_binding_timeout_reports_binding_text() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = binding(&client, silent_addr).await.unwrap_err();
        assert_eq!(err.code, ERROR_CODE_UNREACHABLE);
        assert_eq!(err.reason, "STUN binding request timed out.");
        drop(silent);
    }
}
