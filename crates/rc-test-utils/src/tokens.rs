//! Signed user access tokens for signaling tests.

use crate::fixtures::TestUser;
use common::jwt::UserClaims;
use common::types::UserRole;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

/// HMAC key the harness verifies tokens with.
pub const TEST_JWT_SECRET: &str = "rc-test-secret-0123456789abcdef0123456789";

/// Builder for an HS256 user access token.
#[derive(Debug, Clone)]
pub struct TestToken {
    claims: UserClaims,
    secret: String,
}

impl TestToken {
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            claims: UserClaims {
                sub: user_id.into(),
                role,
                name: None,
                exp: now + 3600,
                iat: now,
            },
            secret: TEST_JWT_SECRET.to_string(),
        }
    }

    #[must_use]
    pub fn for_user(user: &TestUser) -> Self {
        Self::new(user.user_id.clone(), user.role).with_name(user.name.clone())
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.claims.name = Some(name.into());
        self
    }

    /// Expired an hour ago, well past any clock skew.
    #[must_use]
    pub fn expired(mut self) -> Self {
        let now = chrono::Utc::now().timestamp();
        self.claims.iat = now - 7200;
        self.claims.exp = now - 3600;
        self
    }

    /// Issued an hour in the future.
    #[must_use]
    pub fn issued_in_future(mut self) -> Self {
        let now = chrono::Utc::now().timestamp();
        self.claims.iat = now + 3600;
        self.claims.exp = now + 7200;
        self
    }

    /// Sign with a key the harness does not trust.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    #[must_use]
    pub fn sign(&self) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &self.claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("HS256 signing cannot fail")
    }
}
