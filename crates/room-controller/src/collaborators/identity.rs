//! Access-token identity verification.

use super::{Identity, IdentityVerifier};
use crate::errors::RcError;
use common::jwt::{decode_user_token, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

/// Verifies HS256 user access tokens issued by the platform.
pub struct JwtIdentityVerifier {
    secret: SecretString,
    clock_skew: Duration,
}

impl JwtIdentityVerifier {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    #[must_use]
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, RcError> {
        let claims = decode_user_token(
            token,
            self.secret.expose_secret().as_bytes(),
            self.clock_skew,
        )?;

        debug!(target: "rc.signaling", role = claims.role.as_str(), "Access token verified");

        Ok(Identity {
            user_id: claims.sub,
            role: claims.role,
            display_name: claims.name,
        })
    }
}
