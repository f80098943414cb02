//! Uplink tokens: opaque, server-minted, cryptographically unneeded but
//! structurally binding `(gateway antenna identifiers, gateway timestamp µs,
//! server nanosecond time, server wall-clock receive time)`.
//!
//! Binding is structural, not cryptographic: each server process mints a
//! random instance salt at startup and prefixes every token with it, so a
//! token minted by a different process instance fails to decode here even
//! though no signature is involved.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenBody {
    antenna_ids: Vec<u32>,
    gateway_timestamp_us: u32,
    server_nanos: u128,
    received_at_unix_nanos: u128,
}

#[derive(Clone)]
pub struct TokenMinter {
    instance_salt: [u8; 8],
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token does not belong to this server instance")]
    ForeignInstance,
    #[error("malformed token")]
    Malformed,
    #[error("token older than the freshness window")]
    Stale,
}

impl TokenMinter {
    pub fn new() -> Self {
        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { instance_salt: salt }
    }

    pub fn mint(&self, antenna_ids: &[u32], gateway_timestamp_us: u32, received_at: SystemTime) -> Vec<u8> {
        let body = TokenBody {
            antenna_ids: antenna_ids.to_vec(),
            gateway_timestamp_us,
            server_nanos: now_monotonic_nanos(),
            received_at_unix_nanos: received_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
        };
        let mut buf = self.instance_salt.to_vec();
        buf.extend(serde_json::to_vec(&body).expect("token body always serializes"));
        buf
    }

    /// Decode a token minted by this instance, verifying it is within
    /// `freshness` of now. Returns the anchoring gateway timestamp and the
    /// server wall-clock time the anchoring uplink was received, which
    /// together seed the scheduler's gateway/server clock coupling.
    pub fn verify(&self, token: &[u8], freshness: Duration) -> Result<(u32, SystemTime), TokenError> {
        if token.len() < 8 || token[..8] != self.instance_salt[..] {
            return Err(TokenError::ForeignInstance);
        }
        let body: TokenBody = serde_json::from_slice(&token[8..]).map_err(|_| TokenError::Malformed)?;
        let received_at = SystemTime::UNIX_EPOCH + Duration::from_nanos(body.received_at_unix_nanos as u64);
        let age = SystemTime::now()
            .duration_since(received_at)
            .unwrap_or(Duration::from_secs(0));
        if age > freshness {
            return Err(TokenError::Stale);
        }
        Ok((body.gateway_timestamp_us, received_at))
    }
}

impl Default for TokenMinter {
    fn default() -> Self {
        Self::new()
    }
}

fn now_monotonic_nanos() -> u128 {
    use std::time::Instant;
    // There is no direct Instant -> nanos-since-epoch conversion in std, but
    // the token only needs a value that is unique and monotonic per process,
    // which elapsed-since-an-arbitrary-origin satisfies.
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let origin = *ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_and_verifies_roundtrip() {
        let minter = TokenMinter::new();
        let token = minter.mint(&[0], 12345, SystemTime::now());
        let (ts, _received_at) = minter.verify(&token, Duration::from_secs(60)).unwrap();
        assert_eq!(ts, 12345);
    }

    #[test]
    fn rejects_token_from_another_instance() {
        let a = TokenMinter::new();
        let b = TokenMinter::new();
        let token = a.mint(&[0], 1, SystemTime::now());
        assert!(matches!(b.verify(&token, Duration::from_secs(60)), Err(TokenError::ForeignInstance)));
    }

    #[test]
    fn rejects_stale_token() {
        let minter = TokenMinter::new();
        let old = SystemTime::now() - Duration::from_secs(3600);
        let token = minter.mint(&[0], 1, old);
        assert!(matches!(minter.verify(&token, Duration::from_secs(60)), Err(TokenError::Stale)));
    }

    #[test]
    fn tokens_are_non_empty() {
        let minter = TokenMinter::new();
        let token = minter.mint(&[1, 2], 9, SystemTime::now());
        assert!(!token.is_empty());
    }
}
