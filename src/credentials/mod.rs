//! TURN credential acquisition and minting.
//!
//! Credentials follow the REST-API long-term scheme used by coturn's
//! `static-auth-secret` mode:
//! - username: `<expiry_unix_timestamp>:<identity>`
//! - password: base64(HMAC-SHA1(secret, username))
//!
//! A probing run obtains one pair up front from a `CredentialProvider` and
//! shares it across every server probe.

pub mod server;

use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::error::{ProbeError, ProbeResult};

type HmacSha1 = Hmac<Sha1>;

/// Identity embedded in minted usernames when none is configured.
pub const DEFAULT_IDENTITY: &str = "bongo";

/// Validity window of minted credentials.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Timeout for fetching credentials from an HTTP endpoint.
const CREDENTIAL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A TURN username/password pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(alias = "credential")]
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Expiry encoded in a time-limited username, if it has one.
    pub fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let (ts, _) = self.username.split_once(':')?;
        let ts: i64 = ts.parse().ok()?;
        chrono::DateTime::from_timestamp(ts, 0)
    }
}

/// Source of the credential pair for a probing run.
pub trait CredentialProvider: Send + Sync {
    fn obtain(&self) -> BoxFuture<'_, ProbeResult<Credential>>;
}

/// Compute the time-limited password for `username`.
pub fn sign(secret: &str, username: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(username.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Mint a credential valid until `now + ttl`, saturating at `u64::MAX`.
pub fn mint(secret: &str, identity: &str, now: u64, ttl: Duration) -> Credential {
    let username = format!("{}:{}", now.saturating_add(ttl.as_secs()), identity);
    let password = sign(secret, &username);
    Credential { username, password }
}

pub fn unix_now() -> u64 {
    // Clocks set before 1970 clamp to the epoch.
    chrono::Utc::now().timestamp().max(0) as u64
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// A literal credential pair supplied by the user.
pub struct StaticCredentials(Credential);

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }
}

impl CredentialProvider for StaticCredentials {
    fn obtain(&self) -> BoxFuture<'_, ProbeResult<Credential>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Mints credentials locally from a shared secret.
///
/// Also backs the HTTP credential endpoint.
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    secret: String,
    identity: String,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(secret: impl Into<String>, identity: impl Into<String>) -> ProbeResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ProbeError::CredentialUnavailable(
                "shared secret is empty".into(),
            ));
        }
        Ok(Self {
            secret,
            identity: identity.into(),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Mint a credential valid from now.
    pub fn issue(&self) -> Credential {
        mint(&self.secret, &self.identity, unix_now(), self.ttl)
    }
}

impl CredentialProvider for CredentialIssuer {
    fn obtain(&self) -> BoxFuture<'_, ProbeResult<Credential>> {
        Box::pin(async move { Ok(self.issue()) })
    }
}

/// Fetches credentials from an HTTP endpoint such as `/giveMeCredentials`.
pub struct HttpCredentials {
    http: reqwest::Client,
    url: url::Url,
}

impl HttpCredentials {
    pub fn new(url: &str) -> ProbeResult<Self> {
        let url = url::Url::parse(url).map_err(|e| {
            ProbeError::CredentialUnavailable(format!("bad credentials URL {:?}: {}", url, e))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
        })
    }
}

impl CredentialProvider for HttpCredentials {
    fn obtain(&self) -> BoxFuture<'_, ProbeResult<Credential>> {
        Box::pin(async move {
            tracing::debug!("Fetching TURN credentials from {}", self.url);

            let resp = self
                .http
                .get(self.url.clone())
                .timeout(CREDENTIAL_FETCH_TIMEOUT)
                .send()
                .await
                .map_err(|e| {
                    ProbeError::CredentialUnavailable(format!("GET {} failed: {}", self.url, e))
                })?;

            let status = resp.status();
            if status != reqwest::StatusCode::OK {
                let body = resp.text().await.unwrap_or_default();
                return Err(ProbeError::CredentialUnavailable(format!(
                    "GET {} returned {}: {}",
                    self.url,
                    status,
                    body.chars().take(200).collect::<String>()
                )));
            }

            let credential: Credential = resp.json().await.map_err(|e| {
                ProbeError::CredentialUnavailable(format!(
                    "malformed credentials from {}: {}",
                    self.url, e
                ))
            })?;

            tracing::debug!("Obtained TURN username {}", credential.username);
            Ok(credential)
        })
    }
}
