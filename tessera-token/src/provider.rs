use crate::error::{TokenError, TokenResult};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

/// Random bytes per token unless configured otherwise.
pub const DEFAULT_TOKEN_BYTES: usize = 32;

/// 128 bits.
pub const MIN_TOKEN_BYTES: usize = 16;

/// Source of session identifiers and secret tokens.
///
/// Implementations must be safe to share between concurrent requests.
pub trait TokenProvider: Send + Sync {
    /// Generate a new session identifier.
    fn generate_session_id(&self) -> String;

    /// Generate a new secret token (session token or CSRF token).
    fn generate_token(&self) -> String;
}

/// Token provider backed by the thread-local CSPRNG.
///
/// Every value is `bytes` random bytes encoded as base64url without padding,
/// so it can travel in cookies, headers and form fields unescaped.
#[derive(Debug, Clone)]
pub struct RandomTokenProvider {
    bytes: usize,
}

impl RandomTokenProvider {
    /// Create a provider producing `bytes` random bytes per token.
    pub fn new(bytes: usize) -> TokenResult<Self> {
        if bytes < MIN_TOKEN_BYTES {
            return Err(TokenError::InsufficientEntropy {
                bytes,
                minimum: MIN_TOKEN_BYTES,
            });
        }
        Ok(Self { bytes })
    }

    /// Number of random bytes behind each token.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn random_string(&self) -> String {
        let mut buf = vec![0u8; self.bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }
}

impl Default for RandomTokenProvider {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_TOKEN_BYTES,
        }
    }
}

impl TokenProvider for RandomTokenProvider {
    fn generate_session_id(&self) -> String {
        self.random_string()
    }

    fn generate_token(&self) -> String {
        self.random_string()
    }
}

/// Compare a stored token against a presented one in constant time.
///
/// Used for double-submit CSRF validation; the running time depends only on
/// the length of the inputs, never on where they first differ.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    let a = expected.as_bytes();
    let b = presented.as_bytes();

    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
