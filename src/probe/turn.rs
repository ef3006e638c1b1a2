//! TURN relay allocation (RFC 5766) with long-term credentials.
//!
//! Only what relay-candidate discovery needs: Allocate (with the 401
//! realm/nonce challenge and one stale-nonce retry) and releasing the
//! allocation with a zero-lifetime Refresh.

use std::net::SocketAddr;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::net::UdpSocket;

use super::stun::{
    self, append_attr, build_header, set_length, TransactionError, ATTR_NONCE, ATTR_REALM,
    ATTR_USERNAME, ATTR_XOR_MAPPED_ADDRESS, STUN_HEADER_SIZE,
};

const ALLOCATE_REQUEST: u16 = 0x0003;
const ALLOCATE_RESPONSE: u16 = 0x0103;
const REFRESH_REQUEST: u16 = 0x0004;

const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

/// REQUESTED-TRANSPORT protocol number for UDP.
const TRANSPORT_UDP: u8 = 17;

const ALLOCATE_TIMEOUT: Duration = Duration::from_secs(3);
const REFRESH_TIMEOUT: Duration = Duration::from_millis(500);

const UNAUTHORIZED: u16 = 401;
const STALE_NONCE: u16 = 438;

/// Result of a successful Allocate.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub relay_addr: SocketAddr,
    /// Our reflexive address as seen by the TURN server.
    pub mapped_addr: Option<SocketAddr>,
    pub lifetime: u32,
}

/// Compute the long-term credential key: MD5(username ":" realm ":" password).
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes()).to_vec()
}

/// TURN client that talks to one TURN server over UDP.
pub struct TurnClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    username: String,
    credential: String,
    /// Realm and nonce from the server's 401 challenge.
    realm: Option<String>,
    nonce: Option<String>,
    allocation: Option<Allocation>,
}

impl TurnClient {
    pub async fn new(
        server_addr: SocketAddr,
        username: &str,
        credential: &str,
    ) -> std::io::Result<Self> {
        let bind = if server_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        Ok(TurnClient {
            socket,
            server_addr,
            username: username.to_string(),
            credential: credential.to_string(),
            realm: None,
            nonce: None,
            allocation: None,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Perform TURN Allocate (RFC 5766 section 6).
    ///
    /// The first request is unauthenticated to learn realm and nonce; the
    /// retry carries USERNAME/REALM/NONCE and MESSAGE-INTEGRITY.
    pub async fn allocate(&mut self) -> Result<Allocation, TransactionError> {
        match self.allocate_once(false).await? {
            AllocateOutcome::Allocated(allocation) => {
                tracing::debug!("TURN allocated without auth: {}", allocation.relay_addr);
                return Ok(self.store(allocation));
            }
            AllocateOutcome::Challenged => {}
        }

        // A stale nonce refreshes the challenge; retry once with the new one.
        for _ in 0..2 {
            match self.allocate_once(true).await? {
                AllocateOutcome::Allocated(allocation) => {
                    tracing::debug!(
                        "TURN allocated: relay={}, lifetime={}s",
                        allocation.relay_addr,
                        allocation.lifetime
                    );
                    return Ok(self.store(allocation));
                }
                AllocateOutcome::Challenged => {}
            }
        }

        Err(TransactionError {
            code: STALE_NONCE,
            reason: "Stale Nonce".into(),
        })
    }

    fn store(&mut self, allocation: Allocation) -> Allocation {
        self.allocation = Some(allocation.clone());
        allocation
    }

    async fn allocate_once(&mut self, authenticated: bool) -> Result<AllocateOutcome, TransactionError> {
        let txn = stun::generate_transaction_id();
        let mut req = build_header(ALLOCATE_REQUEST, &txn);
        append_attr(&mut req, ATTR_REQUESTED_TRANSPORT, &[TRANSPORT_UDP, 0, 0, 0]);

        let key = if authenticated {
            let key = self.auth_key()?;
            self.append_auth_attrs(&mut req);
            Some(key)
        } else {
            None
        };

        let req = match key {
            Some(ref key) => stun::add_message_integrity_and_fingerprint(req, key),
            None => {
                set_length(&mut req);
                req
            }
        };

        let resp = self.transact(&req, &txn, ALLOCATE_TIMEOUT).await?;
        let msg_type = stun::message_type(&resp).unwrap_or_default();

        if msg_type == ALLOCATE_RESPONSE {
            if let Some(ref key) = key {
                if has_attr(&resp, stun::ATTR_MESSAGE_INTEGRITY)
                    && !stun::verify_message_integrity(&resp, key)
                {
                    tracing::warn!(
                        "TURN server {} sent Allocate response with bad MESSAGE-INTEGRITY",
                        self.server_addr
                    );
                }
            }
            return parse_allocate_success(&resp).map(AllocateOutcome::Allocated);
        }

        if !stun::is_error_response(msg_type) {
            return Err(TransactionError::unreachable(format!(
                "unexpected TURN response type 0x{:04x}",
                msg_type
            )));
        }

        let (code, reason) =
            stun::parse_error_code(&resp).unwrap_or((400, "Allocate error response".into()));
        let (realm, nonce) = parse_challenge(&resp);

        match code {
            UNAUTHORIZED if !authenticated && realm.is_some() && nonce.is_some() => {
                self.realm = realm;
                self.nonce = nonce;
                tracing::debug!("TURN 401 received, realm={:?}", self.realm);
                Ok(AllocateOutcome::Challenged)
            }
            STALE_NONCE if authenticated && nonce.is_some() => {
                self.nonce = nonce;
                if realm.is_some() {
                    self.realm = realm;
                }
                tracing::debug!("TURN stale nonce, retrying");
                Ok(AllocateOutcome::Challenged)
            }
            _ => Err(TransactionError { code, reason }),
        }
    }

    /// Release the allocation with a zero-lifetime Refresh.
    pub async fn deallocate(&mut self) {
        if self.allocation.take().is_none() {
            return;
        }
        let key = match self.auth_key() {
            Ok(key) => key,
            Err(_) => return,
        };

        let txn = stun::generate_transaction_id();
        let mut req = build_header(REFRESH_REQUEST, &txn);
        append_attr(&mut req, ATTR_LIFETIME, &0u32.to_be_bytes());
        self.append_auth_attrs(&mut req);
        let req = stun::add_message_integrity_and_fingerprint(req, &key);

        match self.transact(&req, &txn, REFRESH_TIMEOUT).await {
            Ok(_) => tracing::debug!("TURN allocation on {} released", self.server_addr),
            Err(e) => tracing::debug!("TURN refresh to {} failed: {}", self.server_addr, e),
        }
    }

    fn auth_key(&self) -> Result<Vec<u8>, TransactionError> {
        let realm = self
            .realm
            .as_deref()
            .ok_or_else(|| TransactionError::unreachable("no realm from TURN server"))?;
        Ok(long_term_key(&self.username, realm, &self.credential))
    }

    fn append_auth_attrs(&self, buf: &mut Vec<u8>) {
        append_attr(buf, ATTR_USERNAME, self.username.as_bytes());
        if let Some(ref realm) = self.realm {
            append_attr(buf, ATTR_REALM, realm.as_bytes());
        }
        if let Some(ref nonce) = self.nonce {
            append_attr(buf, ATTR_NONCE, nonce.as_bytes());
        }
    }

    async fn transact(
        &self,
        req: &[u8],
        txn: &[u8; 12],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransactionError> {
        self.socket
            .send_to(req, self.server_addr)
            .await
            .map_err(|e| TransactionError::unreachable(format!("TURN send failed: {}", e)))?;
        stun::recv_response(&self.socket, self.server_addr, txn, timeout).await
    }
}

enum AllocateOutcome {
    Allocated(Allocation),
    Challenged,
}

fn has_attr(data: &[u8], wanted: u16) -> bool {
    let mut found = false;
    stun::iter_attrs(data, |attr_type, _| found |= attr_type == wanted);
    found
}

fn parse_challenge(data: &[u8]) -> (Option<String>, Option<String>) {
    let mut realm = None;
    let mut nonce = None;
    stun::iter_attrs(data, |attr_type, value| match attr_type {
        ATTR_REALM => realm = Some(String::from_utf8_lossy(value).to_string()),
        ATTR_NONCE => nonce = Some(String::from_utf8_lossy(value).to_string()),
        _ => {}
    });
    (realm, nonce)
}

fn parse_allocate_success(data: &[u8]) -> Result<Allocation, TransactionError> {
    if data.len() < STUN_HEADER_SIZE {
        return Err(TransactionError::unreachable("truncated Allocate response"));
    }
    let txn_id = &data[8..20];

    let mut relay_addr = None;
    let mut mapped_addr = None;
    let mut lifetime = 600u32;

    stun::iter_attrs(data, |attr_type, value| match attr_type {
        ATTR_XOR_RELAYED_ADDRESS => relay_addr = stun::decode_xor_address(value, txn_id),
        ATTR_XOR_MAPPED_ADDRESS => mapped_addr = stun::decode_xor_address(value, txn_id),
        ATTR_LIFETIME if value.len() >= 4 => {
            lifetime = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
        }
        _ => {}
    });

    let relay_addr = relay_addr
        .ok_or_else(|| TransactionError::unreachable("Allocate response missing XOR-RELAYED-ADDRESS"))?;

    Ok(Allocation {
        relay_addr,
        mapped_addr,
        lifetime,
    })
}

// ---------------------------------------------------------------------------
// Loopback fake TURN server for tests
// ---------------------------------------------------------------------------
