use crate::model::UserContext;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    pub fn user(&self) -> UserContext {
        UserContext::new(self.sub.clone(), self.email.clone())
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Claims>;
}

pub struct Hs256Verifier {
    key: DecodingKey,
    signing: EncodingKey,
}

impl Hs256Verifier {
    pub fn new(secret: String) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            signing: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign a token for `user`. Without `ttl` the token never expires.
    pub fn issue(&self, user: &UserContext, ttl: Option<Duration>) -> Result<String> {
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            exp: ttl.map(|ttl| (Utc::now() + ttl).timestamp()),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.signing)?)
    }
}

#[async_trait]
impl TokenVerifier for Hs256Verifier {
    async fn verify(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp is optional, but checked when present.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        decode::<Claims>(token, &self.key, &validation)
            .ok()
            .map(|d| d.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_tokens_verify_to_the_same_user() {
        let verifier = Hs256Verifier::new("secret".into());
        let alice = UserContext::new("alice", "alice@example.com");
        let token = verifier.issue(&alice, Some(Duration::hours(1))).unwrap();

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.user(), alice);
        assert!(claims.exp.is_some());
    }

    #[tokio::test]
    async fn rejects_foreign_and_expired_tokens() {
        let verifier = Hs256Verifier::new("secret".into());
        let other = Hs256Verifier::new("other".into());
        let alice = UserContext::new("alice", "alice@example.com");

        let foreign = other.issue(&alice, None).unwrap();
        assert!(verifier.verify(&foreign).await.is_none());

        let expired = verifier.issue(&alice, Some(Duration::hours(-1))).unwrap();
        assert!(verifier.verify(&expired).await.is_none());

        assert!(verifier.verify("not-a-token").await.is_none());
    }

    #[tokio::test]
    async fn tokens_without_expiry_are_accepted() {
        let verifier = Hs256Verifier::new("secret".into());
        let token = verifier
            .issue(&UserContext::new("bob", "bob@example.com"), None)
            .unwrap();
        assert_eq!(verifier.verify(&token).await.unwrap().sub, "bob");
    }
}
