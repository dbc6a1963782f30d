/*
[INPUT]:  Request parameters, API secret, and a millisecond clock
[OUTPUT]: Canonical query string with timestamp, recvWindow and HMAC signature
[POS]:    HTTP layer - request signing for privileged endpoints
[UPDATE]: When changing signing algorithm or parameter ordering
*/

use crate::http::error::{BinanceError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_KEY: &str = "timestamp";
const RECV_WINDOW_KEY: &str = "recvWindow";
const SIGNATURE_KEY: &str = "signature";

/// Source of millisecond timestamps for signed requests
pub trait TimestampProvider: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimestampProvider for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Pinned clock, makes signatures reproducible
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl TimestampProvider for FixedClock {
    fn now_millis(&self) -> u64 {
        self.0
    }
}

/// Output of [`RequestSigner::sign`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedParams {
    /// Ordered parameters, `signature` last
    pub params: Vec<(String, String)>,
    /// Exact string the signature was computed over
    pub canonical: String,
    pub signature: String,
    pub timestamp: u64,
}

impl SignedParams {
    /// Full query string including the trailing signature
    pub fn query_string(&self) -> String {
        if self.canonical.is_empty() {
            format!("{SIGNATURE_KEY}={}", self.signature)
        } else {
            format!("{}&{SIGNATURE_KEY}={}", self.canonical, self.signature)
        }
    }
}

/// Signs privileged requests with HMAC-SHA256
///
/// Parameter order is fixed: caller parameters in insertion order, then
/// `recvWindow` (when set), then `timestamp`. The hex signature is appended
/// last. Stateless apart from the secret, safe to share across tasks.
#[derive(Clone)]
pub struct RequestSigner {
    secret: String,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    /// Create a signer; an empty secret is a configuration error
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(BinanceError::Config("API secret is empty".to_string()));
        }
        Ok(Self { secret })
    }

    /// Sign a parameter set
    pub fn sign(
        &self,
        params: &[(String, String)],
        recv_window: Option<u64>,
        clock: &dyn TimestampProvider,
    ) -> Result<SignedParams> {
        let timestamp = clock.now_millis();

        let mut ordered: Vec<(String, String)> = params
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .cloned()
            .collect();
        if let Some(window) = recv_window {
            ordered.push((RECV_WINDOW_KEY.to_string(), window.to_string()));
        }
        ordered.push((TIMESTAMP_KEY.to_string(), timestamp.to_string()));

        let canonical = canonical_query(&ordered);
        let signature = self.hmac_hex(&canonical)?;
        ordered.push((SIGNATURE_KEY.to_string(), signature.clone()));

        Ok(SignedParams {
            params: ordered,
            canonical,
            signature,
            timestamp,
        })
    }

    /// Hex-encoded HMAC-SHA256 of `payload`
    pub fn hmac_hex(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|err| BinanceError::Config(format!("invalid HMAC key: {err}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn is_reserved(key: &str) -> bool {
    key == TIMESTAMP_KEY || key == RECV_WINDOW_KEY || key == SIGNATURE_KEY
}

/// URL-encode parameters in the given order
pub fn canonical_query(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";

    fn order_params() -> Vec<(String, String)> {
        [
            ("symbol", "LTCBTC"),
            ("side", "BUY"),
            ("type", "LIMIT"),
            ("timeInForce", "GTC"),
            ("quantity", "1"),
            ("price", "0.1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_sign_matches_published_vector() {
        let signer = RequestSigner::new(DOC_SECRET).unwrap();
        let signed = signer
            .sign(&order_params(), Some(5000), &FixedClock(1_499_827_319_559))
            .unwrap();

        assert_eq!(
            signed.canonical,
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559"
        );
        assert_eq!(
            signed.signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
        assert_eq!(signed.params.last().unwrap().0, "signature");
    }

    #[test]
    fn test_sign_is_deterministic() {
        let signer = RequestSigner::new("secret").unwrap();
        let clock = FixedClock(1_700_000_000_000);
        let first = signer.sign(&order_params(), None, &clock).unwrap();
        let second = signer.sign(&order_params(), None, &clock).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reserved_keys_are_replaced() {
        let signer = RequestSigner::new("secret").unwrap();
        let params = vec![
            ("timestamp".to_string(), "1".to_string()),
            ("symbol".to_string(), "BTCUSDT".to_string()),
            ("signature".to_string(), "stale".to_string()),
        ];
        let signed = signer.sign(&params, None, &FixedClock(42)).unwrap();
        assert_eq!(signed.canonical, "symbol=BTCUSDT&timestamp=42");
        assert_eq!(
            signed.params.iter().filter(|(k, _)| k == "timestamp").count(),
            1
        );
    }

    #[test]
    fn test_empty_params_query_string() {
        let signer = RequestSigner::new("secret").unwrap();
        let signed = signer.sign(&[], None, &FixedClock(7)).unwrap();
        assert_eq!(signed.canonical, "timestamp=7");
        assert!(signed.query_string().starts_with("timestamp=7&signature="));
    }

    #[test]
    fn test_empty_secret_is_config_error() {
        let err = RequestSigner::new("  ").unwrap_err();
        assert!(matches!(err, BinanceError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let signer = RequestSigner::new("very-secret").unwrap();
        assert!(!format!("{signer:?}").contains("very-secret"));
    }
}
