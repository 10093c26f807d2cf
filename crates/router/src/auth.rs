use std::{
    collections::HashSet,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, ensure};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Issues and verifies purpose-scoped request tokens (nonces).
pub trait AuthChecker: Send + Sync {
    fn issue_token(&self, purpose: &str) -> String;
    fn verify_token(&self, purpose: &str, token: &str) -> bool;
}

/// Capabilities held by the caller of one request.
pub trait PermissionChecker: Send + Sync {
    fn has(&self, capability: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    granted: HashSet<String>,
}

impl CapabilitySet {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl PermissionChecker for CapabilitySet {
    fn has(&self, capability: &str) -> bool {
        self.granted.contains(capability)
    }
}

type HmacSha256 = Hmac<Sha256>;

const TOKEN_BYTES: usize = 12;

/// HMAC-SHA256 nonces bound to a purpose string and a time tick.
///
/// A tick is half the configured lifetime. A token verifies during the tick it
/// was issued in and the next one, and may be verified any number of times.
#[derive(Clone)]
pub struct HmacNonceAuth {
    mac: HmacSha256,
    lifetime: Duration,
}

impl HmacNonceAuth {
    pub fn new(secret: &[u8], lifetime: Duration) -> anyhow::Result<Self> {
        ensure!(!secret.is_empty(), "nonce secret cannot be empty");
        ensure!(
            lifetime.as_secs() >= 2,
            "nonce lifetime must be at least two seconds"
        );
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| anyhow!("invalid nonce secret: {e}"))?;
        Ok(Self { mac, lifetime })
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn issue_token_at(&self, purpose: &str, unix_secs: u64) -> String {
        URL_SAFE_NO_PAD.encode(self.token_for_tick(purpose, self.tick_at(unix_secs)))
    }

    pub fn verify_token_at(&self, purpose: &str, token: &str, unix_secs: u64) -> bool {
        let Ok(provided) = URL_SAFE_NO_PAD.decode(token.trim()) else {
            return false;
        };
        let tick = self.tick_at(unix_secs);
        let current = self.token_for_tick(purpose, tick);
        let previous = self.token_for_tick(purpose, tick.saturating_sub(1));
        let matches = current[..].ct_eq(&provided[..]) | previous[..].ct_eq(&provided[..]);
        matches.into()
    }

    fn tick_at(&self, unix_secs: u64) -> u64 {
        let half_life = (self.lifetime.as_secs() / 2).max(1);
        unix_secs / half_life
    }

    fn token_for_tick(&self, purpose: &str, tick: u64) -> [u8; TOKEN_BYTES] {
        let mut mac = self.mac.clone();
        mac.update(tick.to_string().as_bytes());
        mac.update(b"|");
        mac.update(purpose.as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut token = [0u8; TOKEN_BYTES];
        token.copy_from_slice(&digest[..TOKEN_BYTES]);
        token
    }
}

impl AuthChecker for HmacNonceAuth {
    fn issue_token(&self, purpose: &str) -> String {
        self.issue_token_at(purpose, unix_now())
    }

    fn verify_token(&self, purpose: &str, token: &str) -> bool {
        self.verify_token_at(purpose, token, unix_now())
    }
}

impl fmt::Debug for HmacNonceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacNonceAuth")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
