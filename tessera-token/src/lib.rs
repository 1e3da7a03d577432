//! # Tessera Tokens
//!
//! Unguessable identifiers for the Tessera session store.
//!
//! ## Features
//!
//! - **Session identifiers** - Random, URL-safe ids handed to the transport layer
//! - **Session & CSRF tokens** - Secrets rotated on every authentication change
//! - **Constant-time comparison** - Double-submit CSRF validation without timing leaks
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_token::{RandomTokenProvider, TokenProvider, tokens_match};
//!
//! let provider = RandomTokenProvider::default();
//!
//! let ses_id = provider.generate_session_id();
//! let csrf = provider.generate_token();
//!
//! // 32 random bytes, base64url without padding
//! assert_eq!(ses_id.len(), 43);
//! assert!(tokens_match(&csrf, &csrf.clone()));
//! assert!(!tokens_match(&csrf, &ses_id));
//! ```
//!
//! ## Entropy
//!
//! Providers refuse to produce tokens with less than 128 bits of entropy:
//!
//! ```rust
//! use tessera_token::RandomTokenProvider;
//!
//! assert!(RandomTokenProvider::new(8).is_err());
//! assert!(RandomTokenProvider::new(16).is_ok());
//! ```

pub mod error;
pub mod provider;

pub use error::{TokenError, TokenResult};
pub use provider::{
    DEFAULT_TOKEN_BYTES, MIN_TOKEN_BYTES, RandomTokenProvider, TokenProvider, tokens_match,
};
