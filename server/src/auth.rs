//! Credential verification for handshakes.
//!
//! Two bearer formats are accepted: a signed JWT checked against the cached
//! signing-key set, and (only when the deployment enables display-name
//! admission) a short-lived opaque token carrying the display name.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{SigningKey, Store};
use crate::utils::get_timestamp_secs;
use shared::frames::ErrorCode;
use shared::{KEY_SET_TTL, OPAQUE_TOKEN_MAX_AGE};

/// Audience a signed token must be issued for.
pub const TOKEN_AUDIENCE: &str = "authenticated";

/// Accepted clock skew when validating expiry.
const CLOCK_SKEW_SECS: u64 = 30;

/// Credential rejection, classified for the wire.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential rejected: {0}")]
    Failed(String),
    #[error("credential expired")]
    Expired,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Failed(_) => ErrorCode::AuthFailed,
            AuthError::Expired => ErrorCode::AuthExpired,
        }
    }
}

/// Successful verification result.
#[derive(Debug, Clone)]
pub struct Verified {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpaqueToken {
    display_name: String,
    user_id: String,
    issued_at: u64,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
}

struct KeyCache {
    keys: Vec<SigningKey>,
    fetched_at: Option<Instant>,
}

/// Validates presented bearer tokens against the signing-key set.
///
/// The key set is cached for [`KEY_SET_TTL`]; a signature failure against a
/// cached set invalidates it and fetches once more before giving up.
/// Concurrent refreshes collapse onto one store call via the cache lock.
pub struct CredentialVerifier {
    store: Arc<dyn Store>,
    fallback_secret: Option<String>,
    allow_display_name: bool,
    cache: Mutex<KeyCache>,
}

impl CredentialVerifier {
    pub fn new(
        store: Arc<dyn Store>,
        fallback_secret: Option<String>,
        allow_display_name: bool,
    ) -> Self {
        Self {
            store,
            fallback_secret,
            allow_display_name,
            cache: Mutex::new(KeyCache {
                keys: Vec::new(),
                fetched_at: None,
            }),
        }
    }

    /// Verifies a bearer token in either accepted format.
    pub async fn verify(&self, token: &str) -> Result<Verified, AuthError> {
        if self.allow_display_name {
            if let Some(result) = self.try_opaque(token) {
                return result;
            }
        }
        self.verify_signed(token).await
    }

    /// Attempts the opaque display-name format.
    ///
    /// Returns `None` when the token is not in that format at all, so the
    /// caller falls through to signed verification.
    fn try_opaque(&self, token: &str) -> Option<Result<Verified, AuthError>> {
        let bytes = BASE64.decode(token).ok()?;
        let opaque: OpaqueToken = serde_json::from_slice(&bytes).ok()?;
        let age = get_timestamp_secs().saturating_sub(opaque.issued_at);
        if age > OPAQUE_TOKEN_MAX_AGE.as_secs() {
            return Some(Err(AuthError::Expired));
        }
        Some(Ok(Verified {
            user_id: opaque.user_id,
            display_name: Some(opaque.display_name),
        }))
    }

    async fn verify_signed(&self, token: &str) -> Result<Verified, AuthError> {
        let header = decode_header(token)
            .map_err(|err| AuthError::Failed(format!("malformed token: {err}")))?;

        let (keys, from_cache) = self.keys(false).await?;
        match self.decode_signed(token, &header, &keys) {
            Ok(verified) => Ok(verified),
            Err(AuthError::Expired) => Err(AuthError::Expired),
            Err(err) if from_cache => {
                // The signer may have rotated; drop the cache and retry once.
                debug!("signature check failed against cached key set: {err}");
                let (keys, _) = self.keys(true).await?;
                self.decode_signed(token, &header, &keys)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the signing-key set and whether it came from cache.
    async fn keys(&self, force_refresh: bool) -> Result<(Vec<SigningKey>, bool), AuthError> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .fetched_at
            .map(|at| at.elapsed() < KEY_SET_TTL)
            .unwrap_or(false);
        if fresh && !force_refresh {
            return Ok((cache.keys.clone(), true));
        }

        let mut keys = match self.store.key_set().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("signing-key fetch failed: {err}");
                return Err(AuthError::Failed("key set unavailable".to_string()));
            }
        };
        if let Some(secret) = &self.fallback_secret {
            keys.push(SigningKey {
                kid: None,
                algorithm: "HS256".to_string(),
                key_data: secret.clone(),
            });
        }
        cache.keys = keys.clone();
        cache.fetched_at = Some(Instant::now());
        Ok((keys, false))
    }

    fn decode_signed(
        &self,
        token: &str,
        header: &Header,
        keys: &[SigningKey],
    ) -> Result<Verified, AuthError> {
        let mut validation = Validation::new(header.alg);
        validation.leeway = CLOCK_SKEW_SECS;
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        for key in keys {
            match key.algorithm.parse::<Algorithm>() {
                Ok(alg) if alg == header.alg => {}
                _ => continue,
            }
            // When both sides carry a key id, they must agree.
            if let (Some(kid), Some(key_kid)) = (&header.kid, &key.kid) {
                if kid != key_kid {
                    continue;
                }
            }
            let decoding_key = match header.alg {
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                    DecodingKey::from_secret(key.key_data.as_bytes())
                }
                Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                    match DecodingKey::from_rsa_pem(key.key_data.as_bytes()) {
                        Ok(decoding_key) => decoding_key,
                        Err(err) => {
                            warn!("unusable RSA signing key: {err}");
                            continue;
                        }
                    }
                }
                _ => continue,
            };
            match decode::<Claims>(token, &decoding_key, &validation) {
                Ok(data) => {
                    return Ok(Verified {
                        user_id: data.claims.sub,
                        display_name: data.claims.name,
                    })
                }
                Err(err) => match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        return Err(AuthError::Expired)
                    }
                    _ => continue,
                },
            }
        }
        Err(AuthError::Failed("signature verification failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use jsonwebtoken::{encode, EncodingKey};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        iss: String,
        aud: String,
        exp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    }

    fn opaque_token(user_id: &str, display_name: &str, issued_at: u64) -> String {
        BASE64.encode(
            serde_json::json!({
                "display_name": display_name,
                "user_id": user_id,
                "issued_at": issued_at,
            })
            .to_string(),
        )
    }

    fn signed_token(secret: &str, sub: &str, exp: u64) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            iss: "https://auth.example".to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
            exp,
            name: Some("Alice".to_string()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn hs256_key(secret: &str) -> SigningKey {
        SigningKey {
            kid: None,
            algorithm: "HS256".to_string(),
            key_data: secret.to_string(),
        }
    }

    #[tokio::test]
    async fn test_opaque_token_accepted_when_enabled() {
        let verifier = CredentialVerifier::new(Arc::new(MemStore::new()), None, true);
        let token = opaque_token("u1", "Steve", get_timestamp_secs());
        let verified = verifier.verify(&token).await.unwrap();
        assert_eq!(verified.user_id, "u1");
        assert_eq!(verified.display_name.as_deref(), Some("Steve"));
    }

    #[tokio::test]
    async fn test_opaque_token_rejected_when_disabled() {
        let verifier = CredentialVerifier::new(Arc::new(MemStore::new()), None, false);
        let token = opaque_token("u1", "Steve", get_timestamp_secs());
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_opaque_token_age_limit() {
        let verifier = CredentialVerifier::new(Arc::new(MemStore::new()), None, true);
        let stale = get_timestamp_secs() - OPAQUE_TOKEN_MAX_AGE.as_secs() - 60;
        let token = opaque_token("u1", "Steve", stale);
        assert!(matches!(verifier.verify(&token).await, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_signed_token_roundtrip() {
        let store = Arc::new(MemStore::new());
        store.set_keys(vec![hs256_key("test-secret")]);
        let verifier = CredentialVerifier::new(store, None, false);

        let token = signed_token("test-secret", "u1", get_timestamp_secs() + 3600);
        let verified = verifier.verify(&token).await.unwrap();
        assert_eq!(verified.user_id, "u1");
        assert_eq!(verified.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_signed_token_expired() {
        let store = Arc::new(MemStore::new());
        store.set_keys(vec![hs256_key("test-secret")]);
        let verifier = CredentialVerifier::new(store, None, false);

        // Older than the clock-skew tolerance.
        let token = signed_token("test-secret", "u1", get_timestamp_secs() - 120);
        assert!(matches!(verifier.verify(&token).await, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_signed_token_wrong_secret() {
        let store = Arc::new(MemStore::new());
        store.set_keys(vec![hs256_key("other-secret")]);
        let verifier = CredentialVerifier::new(store, None, false);

        let token = signed_token("test-secret", "u1", get_timestamp_secs() + 3600);
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_key_rotation_refetches_once() {
        let store = Arc::new(MemStore::new());
        store.set_keys(vec![hs256_key("old-secret")]);
        let verifier = CredentialVerifier::new(store.clone(), None, false);

        // Prime the cache with the old key set.
        let old_token = signed_token("old-secret", "u1", get_timestamp_secs() + 3600);
        verifier.verify(&old_token).await.unwrap();

        // Rotate the key in the store; the cached set no longer matches, so
        // verification falls back to a refetch and succeeds.
        store.set_keys(vec![hs256_key("new-secret")]);
        let new_token = signed_token("new-secret", "u2", get_timestamp_secs() + 3600);
        let verified = verifier.verify(&new_token).await.unwrap();
        assert_eq!(verified.user_id, "u2");
    }

    #[tokio::test]
    async fn test_fallback_secret_is_part_of_key_set() {
        let verifier = CredentialVerifier::new(
            Arc::new(MemStore::new()),
            Some("service-secret".to_string()),
            false,
        );
        let token = signed_token("service-secret", "u1", get_timestamp_secs() + 3600);
        assert_eq!(verifier.verify(&token).await.unwrap().user_id, "u1");
    }
}
