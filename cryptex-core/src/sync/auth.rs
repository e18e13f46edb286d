//! Nonce-based challenge-response sign-in.
//!
//! The server hands out a single-use nonce, the device signs
//!
//! ```text
//! cryptex-auth-v1\n{USER_ID}\n{NONCE}
//! ```
//!
//! with its Ed25519 key, and the server verifies against the registered
//! public key before issuing a session token. No password or long-term secret
//! leaves the device. Every server-side failure is reported as the same
//! [`CryptexError::RelayAuth`].

use crate::sync::device::{DeviceIdentity, DeviceRegistry};
use crate::{CryptexError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

const AUTH_SCHEME: &str = "Cryptex-Ed25519";

/// Default lifetime of an unused nonce.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(120);

/// Default lifetime of a relay session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Opaque relay session credential.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// Account service sign-in endpoints.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Issue a fresh single-use nonce.
    async fn generate_auth_nonce(&self) -> Result<String>;

    async fn sign_in(&self, user_id: Uuid, nonce: &str, signature: &[u8]) -> Result<SessionToken>;
}

/// Format the string the device signs.
pub fn challenge_message(user_id: &Uuid, nonce: &str) -> String {
    format!("cryptex-auth-v1\n{}\n{}", user_id, nonce)
}

/// Sign a server nonce with the device's Ed25519 signing key.
pub fn sign_challenge(signing_key: &SigningKey, user_id: &Uuid, nonce: &str) -> Vec<u8> {
    let message = challenge_message(user_id, nonce);
    signing_key.sign(message.as_bytes()).to_bytes().to_vec()
}

/// Format the Authorization header value.
///
/// ```text
/// Cryptex-Ed25519 <user_id>:<nonce>:<base64(signature)>
/// ```
pub fn format_auth_header(user_id: &Uuid, nonce: &str, signature: &[u8]) -> String {
    format!(
        "{} {}:{}:{}",
        AUTH_SCHEME,
        user_id,
        nonce,
        STANDARD.encode(signature)
    )
}

/// Split an Authorization header into `(user_id, nonce, signature)`.
pub fn parse_auth_header(header: &str) -> Result<(Uuid, String, Vec<u8>)> {
    let stripped = header
        .strip_prefix(AUTH_SCHEME)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or(CryptexError::RelayAuth)?;

    let parts: Vec<&str> = stripped.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(CryptexError::RelayAuth);
    }

    let user_id = Uuid::parse_str(parts[0]).map_err(|_| CryptexError::RelayAuth)?;
    let signature = STANDARD
        .decode(parts[2])
        .map_err(|_| CryptexError::RelayAuth)?;
    Ok((user_id, parts[1].to_string(), signature))
}

/// Run the full sign-in: fetch a nonce, sign it, exchange it for a session.
pub async fn authenticate(
    service: &dyn AuthService,
    user_id: Uuid,
    identity: &DeviceIdentity,
) -> Result<SessionToken> {
    let nonce = service.generate_auth_nonce().await?;
    let signature = sign_challenge(identity.signing_key(), &user_id, &nonce);
    let token = service.sign_in(user_id, &nonce, &signature).await?;
    debug!(user = %user_id, "Signed in to relay");
    Ok(token)
}

/// Reasons a sign-in is refused. Logged, never returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    UnknownNonce,
    ExpiredNonce,
    UnknownDevice,
    MalformedKey,
    InvalidSignature,
}

/// In-memory server side of the challenge-response flow.
///
/// Nonces are consumed by the first sign-in that presents them, whatever the
/// outcome, and expire after `nonce_ttl` if never used. Sessions expire
/// `session_ttl` after issue and are pruned whenever a new one is issued.
pub struct ChallengeVerifier {
    registry: Arc<dyn DeviceRegistry>,
    nonce_ttl: Duration,
    session_ttl: Duration,
    nonces: Mutex<HashMap<String, Instant>>,
    sessions: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl ChallengeVerifier {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self::with_nonce_ttl(registry, DEFAULT_NONCE_TTL)
    }

    pub fn with_nonce_ttl(registry: Arc<dyn DeviceRegistry>, nonce_ttl: Duration) -> Self {
        Self {
            registry,
            nonce_ttl,
            session_ttl: DEFAULT_SESSION_TTL,
            nonces: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_session_ttl(mut self, session_ttl: Duration) -> Self {
        self.session_ttl = session_ttl;
        self
    }

    /// Resolve a session token to its device. Expired sessions are dropped.
    pub fn validate_session(&self, token: &SessionToken) -> Result<Uuid> {
        let mut sessions = self.sessions.lock().map_err(|_| CryptexError::RelayAuth)?;
        let (user_id, issued) = sessions
            .get(token.as_str())
            .copied()
            .ok_or(CryptexError::RelayAuth)?;
        if issued.elapsed() > self.session_ttl {
            sessions.remove(token.as_str());
            return Err(CryptexError::RelayAuth);
        }
        Ok(user_id)
    }

    /// Drop every session held by a device.
    pub fn revoke_sessions(&self, user_id: Uuid) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.retain(|_, (id, _)| *id != user_id);
        }
    }

    /// Sessions currently held, expired ones included until the next prune.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Verify an Authorization header produced by [`format_auth_header`].
    pub async fn sign_in_with_header(&self, header: &str) -> Result<SessionToken> {
        let (user_id, nonce, signature) = parse_auth_header(header)?;
        self.sign_in(user_id, &nonce, &signature).await
    }

    /// Remove `nonce` from the outstanding set and prune expired ones.
    fn take_nonce(&self, nonce: &str) -> std::result::Result<(), Rejection> {
        let mut nonces = self.nonces.lock().map_err(|_| Rejection::UnknownNonce)?;
        let issued = nonces.remove(nonce).ok_or(Rejection::UnknownNonce)?;
        let now = Instant::now();
        nonces.retain(|_, t| now.duration_since(*t) <= self.nonce_ttl);
        if now.duration_since(issued) > self.nonce_ttl {
            return Err(Rejection::ExpiredNonce);
        }
        Ok(())
    }

    async fn verify(
        &self,
        user_id: Uuid,
        nonce: &str,
        signature: &[u8],
    ) -> std::result::Result<(), Rejection> {
        // Consumed before any other check: a nonce is never usable twice.
        self.take_nonce(nonce)?;

        let public_key = self
            .registry
            .device_public_key(user_id)
            .await
            .ok()
            .flatten()
            .ok_or(Rejection::UnknownDevice)?;
        let key_bytes: [u8; 32] = public_key
            .as_slice()
            .try_into()
            .map_err(|_| Rejection::MalformedKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| Rejection::MalformedKey)?;

        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| Rejection::InvalidSignature)?;
        verifying_key
            .verify(
                challenge_message(&user_id, nonce).as_bytes(),
                &Signature::from_bytes(&signature),
            )
            .map_err(|_| Rejection::InvalidSignature)
    }
}

#[async_trait]
impl AuthService for ChallengeVerifier {
    async fn generate_auth_nonce(&self) -> Result<String> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);

        let mut nonces = self
            .nonces
            .lock()
            .map_err(|_| CryptexError::Relay("nonce store poisoned".to_string()))?;
        nonces.insert(nonce.clone(), Instant::now());
        Ok(nonce)
    }

    async fn sign_in(&self, user_id: Uuid, nonce: &str, signature: &[u8]) -> Result<SessionToken> {
        if let Err(reason) = self.verify(user_id, nonce, signature).await {
            debug!(user = %user_id, ?reason, "Rejected sign-in");
            return Err(CryptexError::RelayAuth);
        }

        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let now = Instant::now();
        let mut sessions = self.sessions.lock().map_err(|_| CryptexError::RelayAuth)?;
        sessions.retain(|_, (_, issued)| now.duration_since(*issued) <= self.session_ttl);
        sessions.insert(token.clone(), (user_id, now));
        drop(sessions);

        debug!(user = %user_id, "Issued relay session");
        Ok(SessionToken(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::MemoryDeviceRegistry;

    async fn setup() -> (Arc<MemoryDeviceRegistry>, ChallengeVerifier, DeviceIdentity, Uuid) {
        let registry = Arc::new(MemoryDeviceRegistry::new());
        let identity = DeviceIdentity::generate();
        let user_id = registry
            .register_device(&identity.public_key_bytes())
            .await
            .unwrap();
        let verifier = ChallengeVerifier::new(registry.clone());
        (registry, verifier, identity, user_id)
    }

    #[tokio::test]
    async fn authenticate_roundtrip() {
        let (_registry, verifier, identity, user_id) = setup().await;
        let token = authenticate(&verifier, user_id, &identity).await.unwrap();
        assert_eq!(verifier.validate_session(&token).unwrap(), user_id);

        verifier.revoke_sessions(user_id);
        assert!(verifier.validate_session(&token).is_err());
    }

    #[tokio::test]
    async fn nonce_is_single_use() {
        let (_registry, verifier, identity, user_id) = setup().await;
        let nonce = verifier.generate_auth_nonce().await.unwrap();
        let signature = sign_challenge(identity.signing_key(), &user_id, &nonce);

        assert!(verifier.sign_in(user_id, &nonce, &signature).await.is_ok());
        assert!(matches!(
            verifier.sign_in(user_id, &nonce, &signature).await,
            Err(CryptexError::RelayAuth)
        ));
    }

    #[tokio::test]
    async fn failed_attempt_burns_nonce() {
        let (_registry, verifier, identity, user_id) = setup().await;
        let nonce = verifier.generate_auth_nonce().await.unwrap();
        let wrong = DeviceIdentity::generate();
        let bad = sign_challenge(wrong.signing_key(), &user_id, &nonce);
        assert!(verifier.sign_in(user_id, &nonce, &bad).await.is_err());

        let good = sign_challenge(identity.signing_key(), &user_id, &nonce);
        assert!(verifier.sign_in(user_id, &nonce, &good).await.is_err());
    }

    #[tokio::test]
    async fn wrong_key_and_unknown_device_look_the_same() {
        let (_registry, verifier, _identity, user_id) = setup().await;
        let stranger = DeviceIdentity::generate();

        let err_wrong_key = authenticate(&verifier, user_id, &stranger).await.unwrap_err();
        let err_unknown = authenticate(&verifier, Uuid::new_v4(), &stranger)
            .await
            .unwrap_err();
        assert_eq!(err_wrong_key.to_string(), "unauthenticated");
        assert_eq!(err_unknown.to_string(), "unauthenticated");
    }

    #[tokio::test]
    async fn removed_device_rejected() {
        let (registry, verifier, identity, user_id) = setup().await;
        registry.remove_device(user_id).await.unwrap();
        assert!(authenticate(&verifier, user_id, &identity).await.is_err());
    }

    #[tokio::test]
    async fn missing_or_forged_nonce_rejected() {
        let (_registry, verifier, identity, user_id) = setup().await;
        let forged = "00".repeat(32);
        let signature = sign_challenge(identity.signing_key(), &user_id, &forged);
        assert!(verifier.sign_in(user_id, &forged, &signature).await.is_err());
        assert!(verifier.sign_in(user_id, "", &[]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_expires() {
        let registry = Arc::new(MemoryDeviceRegistry::new());
        let identity = DeviceIdentity::generate();
        let user_id = registry
            .register_device(&identity.public_key_bytes())
            .await
            .unwrap();
        let verifier = ChallengeVerifier::with_nonce_ttl(registry, Duration::from_secs(30));

        let nonce = verifier.generate_auth_nonce().await.unwrap();
        let signature = sign_challenge(identity.signing_key(), &user_id, &nonce);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(verifier.sign_in(user_id, &nonce, &signature).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_and_are_pruned() {
        let (_registry, verifier, identity, user_id) = setup().await;
        let verifier = verifier.with_session_ttl(Duration::from_secs(60));

        let old = authenticate(&verifier, user_id, &identity).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(verifier.validate_session(&old).unwrap(), user_id);

        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = authenticate(&verifier, user_id, &identity).await.unwrap();
        assert_eq!(verifier.session_count(), 1);
        assert!(matches!(
            verifier.validate_session(&old),
            Err(CryptexError::RelayAuth)
        ));
        assert_eq!(verifier.validate_session(&fresh).unwrap(), user_id);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(verifier.validate_session(&fresh).is_err());
        assert_eq!(verifier.session_count(), 0);
    }

    #[tokio::test]
    async fn header_roundtrip() {
        let (_registry, verifier, identity, user_id) = setup().await;
        let nonce = verifier.generate_auth_nonce().await.unwrap();
        let signature = sign_challenge(identity.signing_key(), &user_id, &nonce);
        let header = format_auth_header(&user_id, &nonce, &signature);
        assert!(header.starts_with("Cryptex-Ed25519 "));

        let token = verifier.sign_in_with_header(&header).await.unwrap();
        assert_eq!(verifier.validate_session(&token).unwrap(), user_id);

        assert!(parse_auth_header("Bearer abc").is_err());
        assert!(parse_auth_header("Cryptex-Ed25519 not-a-uuid:n:AAAA").is_err());
    }
}
