use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length of a session secret in bytes.
pub const SECRET_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 32;
const PAYLOAD_LENGTH: usize = NONCE_LENGTH + 8;
// Tolerated clock skew for tokens stamped in the future.
const FUTURE_SKEW: u64 = 60;

/// Per-session signing key for CSRF tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret([u8; SECRET_LENGTH]);

impl SessionSecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key material, e.g. loaded from a session backend.
    pub fn from_bytes(bytes: [u8; SECRET_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw key material.
    pub fn as_bytes(&self) -> &[u8; SECRET_LENGTH] {
        &self.0
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size")
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionSecret").field(&"***").finish()
    }
}

/// The random value embedded in a verified token.
#[derive(Clone)]
pub struct TokenValue([u8; NONCE_LENGTH]);

impl TokenValue {
    /// Constant-time comparison of two token values.
    pub fn ct_eq(&self, other: &TokenValue) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenValue").field(&"***").finish()
    }
}

/// A signed CSRF token.
///
/// The wire form is `base64url(nonce || issued_at) "." base64url(hmac)`,
/// where the HMAC-SHA256 is keyed with the session secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CsrfToken(String);

impl CsrfToken {
    /// Mint a new token signed with `secret`.
    pub fn mint(secret: &SessionSecret) -> Self {
        let mut payload = [0u8; PAYLOAD_LENGTH];
        OsRng.fill_bytes(&mut payload[..NONCE_LENGTH]);
        payload[NONCE_LENGTH..].copy_from_slice(&unix_now().to_be_bytes());

        let mut mac = secret.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Self(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Create a token from an existing string, e.g. a cookie value.
    pub fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the signature and age of `token` against `secret`.
    pub fn verify(token: &str, secret: &SessionSecret, max_age: Option<Duration>) -> bool {
        Self::decode(token, secret, max_age).is_some()
    }

    /// Verify `token` and extract its embedded value.
    ///
    /// Returns `None` for anything that is not a well-formed token signed
    /// with `secret` and younger than `max_age`. The caller cannot tell
    /// which check failed.
    pub fn decode(token: &str, secret: &SessionSecret, max_age: Option<Duration>) -> Option<TokenValue> {
        let (payload, signature) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        if payload.len() != PAYLOAD_LENGTH {
            return None;
        }

        let mut mac = secret.mac();
        mac.update(&payload);
        mac.verify_slice(&signature).ok()?;

        let mut issued_at = [0u8; 8];
        issued_at.copy_from_slice(&payload[NONCE_LENGTH..]);
        let issued_at = u64::from_be_bytes(issued_at);
        let now = unix_now();
        if issued_at > now.saturating_add(FUTURE_SKEW) {
            return None;
        }
        if let Some(max_age) = max_age {
            if now.saturating_sub(issued_at) > max_age.as_secs() {
                return None;
            }
        }

        let mut value = [0u8; NONCE_LENGTH];
        value.copy_from_slice(&payload[..NONCE_LENGTH]);
        Some(TokenValue(value))
    }
}

impl fmt::Debug for CsrfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CsrfToken").field(&"***").finish()
    }
}

impl fmt::Display for CsrfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Random url-safe string of `length` bytes of entropy.
pub(crate) fn random_string(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WEEK: Option<Duration> = Some(Duration::from_secs(60 * 60 * 24 * 7));

    fn signed_with_timestamp(secret: &SessionSecret, issued_at: u64) -> String {
        let mut payload = [7u8; PAYLOAD_LENGTH];
        payload[NONCE_LENGTH..].copy_from_slice(&issued_at.to_be_bytes());
        let mut mac = secret.mac();
        mac.update(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_minted_token_verifies_with_its_secret() {
        let secret = SessionSecret::generate();
        let token = CsrfToken::mint(&secret);
        assert!(CsrfToken::verify(token.as_str(), &secret, WEEK));
    }

    #[test]
    fn test_token_does_not_verify_with_another_secret() {
        let token = CsrfToken::mint(&SessionSecret::generate());
        assert!(!CsrfToken::verify(
            token.as_str(),
            &SessionSecret::generate(),
            WEEK
        ));
    }

    #[test]
    fn test_tokens_are_unique() {
        let secret = SessionSecret::generate();
        let a = CsrfToken::mint(&secret);
        let b = CsrfToken::mint(&secret);
        assert_ne!(a, b);

        let a = CsrfToken::decode(a.as_str(), &secret, WEEK).unwrap();
        let b = CsrfToken::decode(b.as_str(), &secret, WEEK).unwrap();
        assert!(!a.ct_eq(&b));
        assert!(a.ct_eq(&a.clone()));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let secret = SessionSecret::generate();
        let token = CsrfToken::mint(&secret);
        let (payload, signature) = token.as_str().split_once('.').unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
        bytes[0] ^= 0xff;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(bytes), signature);
        assert!(!CsrfToken::verify(&forged, &secret, WEEK));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let secret = SessionSecret::generate();
        let old = signed_with_timestamp(&secret, unix_now() - 3600);
        assert!(CsrfToken::verify(&old, &secret, None));
        assert!(CsrfToken::verify(&old, &secret, Some(Duration::from_secs(7200))));
        assert!(!CsrfToken::verify(&old, &secret, Some(Duration::from_secs(60))));
    }

    #[test]
    fn test_future_token_is_rejected() {
        let secret = SessionSecret::generate();
        let future = signed_with_timestamp(&secret, unix_now() + 3600);
        assert!(!CsrfToken::verify(&future, &secret, None));
    }

    #[test]
    fn test_debug_redacts_material() {
        let secret = SessionSecret::generate();
        let token = CsrfToken::mint(&secret);
        assert_eq!(format!("{:?}", secret), "SessionSecret(\"***\")");
        assert!(!format!("{:?}", token).contains(token.as_str()));
    }

    proptest! {
        #[test]
        fn prop_garbage_never_verifies(input in ".*") {
            let secret = SessionSecret::generate();
            prop_assert!(!CsrfToken::verify(&input, &secret, None));
        }

        #[test]
        fn prop_wrong_length_payload_never_verifies(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assume!(bytes.len() != PAYLOAD_LENGTH);
            let secret = SessionSecret::generate();
            let mut mac = secret.mac();
            mac.update(&bytes);
            let token = format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(&bytes),
                URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
            );
            prop_assert!(!CsrfToken::verify(&token, &secret, None));
        }
    }
}
