//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for the signing secret of user
//! access tokens, the platform service token and the Redis URL (which may
//! embed a password).
//!
//! `SecretString` implements `Debug` with redaction, so any struct deriving
//! `Debug` that holds one stays safe to log through `{:?}` or tracing fields.
//! Reading the value requires an explicit `expose_secret()` call at the
//! point of use.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct PlatformCredentials {
//!     base_url: String,
//!     token: SecretString,
//! }
//!
//! let creds = PlatformCredentials {
//!     base_url: "http://platform.internal".to_string(),
//!     token: SecretString::from("svc-token"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("svc-token"));
//! assert_eq!(creds.token.expose_secret(), "svc-token");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
