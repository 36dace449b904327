//! Stateless signed identity tokens.
//!
//! Identity lives entirely in a signed token held by the client; the server
//! keeps no session table. Every request verifies the presented token and
//! reissues it with refreshed expiry, so the service stays stateless and
//! horizontally scalable. The tradeoff is that revocation needs a blocklist
//! and a client can discard its token to shed its cooldown, which is why
//! registration is itself rate limited and fraud checked.
//!
//! Verification failure and "no token presented" are distinct conditions but
//! both mean "no identity" - a bad token is never interpreted as a different
//! identity, and malformed input never panics.

use std::io::Write;
use std::path::Path;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::names;

/// Token lifetime: roughly one year.
pub const TOKEN_VALIDITY_SECS: i64 = 31_556_926;

/// Length of the generated signing key, in bytes.
const KEY_LEN: usize = 32;

/// Errors raised by token operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Signature, expiry, issuer or claim-shape verification failed. The
    /// caller must treat this as "no identity".
    #[error("invalid identity token")]
    Invalid,

    /// A token could not be signed. This is a server-side fault, not a
    /// property of the client's input.
    #[error("failed to sign identity token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// The claims carried in an identity token.
///
/// `sub` is assigned once at registration and never changes across reissues.
/// `lst` (last accepted write) is the value the cooldown gate trusts; it is
/// only ever advanced server-side after an accepted write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Immutable subject id (uuid).
    pub sub: String,
    /// Epoch seconds of the most recent accepted write.
    pub lst: i64,
    /// Count of accepted writes.
    pub cnt: u64,
    /// Generated display name; absent on tokens minted before registration
    /// handed out names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nme: Option<String>,
    /// Last-seen client IP. An anomaly signal for logging only - never an
    /// authorization input, since mobile clients roam.
    pub ip: String,
    pub iss: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs, verifies and mints identity tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    cooldown_secs: i64,
}

impl TokenService {
    /// Builds a service from raw key bytes.
    #[must_use]
    pub fn new(secret: &[u8], issuer: &str, cooldown_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer: issuer.to_string(),
            cooldown_secs,
        }
    }

    /// Loads the signing key from `path`, generating a fresh random key
    /// (mode 0600 on unix) if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be read or created.
    pub fn from_key_file(path: &Path, issuer: &str, cooldown_secs: i64) -> std::io::Result<Self> {
        let secret = if path.exists() {
            std::fs::read(path)?
        } else {
            let mut secret = vec![0u8; KEY_LEN];
            rand::rngs::OsRng.fill_bytes(&mut secret);

            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            options.open(path)?.write_all(&secret)?;
            info!(path = %path.display(), "generated new identity signing key");
            secret
        };
        Ok(Self::new(&secret, issuer, cooldown_secs))
    }

    /// Verifies a raw token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` on any mismatch: bad signature, expired, wrong
    /// issuer, or missing claims.
    pub fn verify(&self, raw: &str) -> Result<Claims, IdentityError> {
        match jsonwebtoken::decode::<Claims>(raw, &self.decoding, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => {
                debug!(error = %e, "token verification failed");
                Err(IdentityError::Invalid)
            },
        }
    }

    /// Mints claims for a brand-new identity.
    ///
    /// `lst` starts at `now - cooldown`, so a fresh identity may write
    /// immediately. When a client re-registers with a surviving (but
    /// name-less) token, `existing_subject` keeps its subject id stable.
    #[must_use]
    pub fn register(&self, existing_subject: Option<&str>, ip: &str, now: i64) -> Claims {
        let sub = existing_subject
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Claims {
            sub,
            lst: now - self.cooldown_secs,
            cnt: 0,
            nme: Some(names::generate()),
            ip: ip.to_string(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + TOKEN_VALIDITY_SECS,
        }
    }

    /// Re-signs claims for the response cookie.
    ///
    /// Refreshes `ip`, `jti`, `iat` and replaces any stale `exp` with a
    /// fresh full validity window, so a long-lived identity never truncates
    /// its own expiry by carrying an old claim forward. `sub` is untouched.
    ///
    /// # Errors
    ///
    /// Returns `Signing` if encoding fails.
    pub fn reissue(&self, claims: &Claims, ip: &str, now: i64) -> Result<(Claims, String), IdentityError> {
        let reissued = Claims {
            ip: ip.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + TOKEN_VALIDITY_SECS,
            ..claims.clone()
        };
        let token = jsonwebtoken::encode(&Header::default(), &reissued, &self.encoding)?;
        Ok((reissued, token))
    }

    /// The configured per-identity cooldown, in seconds.
    #[must_use]
    pub const fn cooldown_secs(&self) -> i64 {
        self.cooldown_secs
    }
}

/// Canonical compact form of a subject id: uuid without dashes.
///
/// The history store keys users this way, and pixel provenance exposes a
/// fragment of it rather than the full id.
#[must_use]
pub fn strip_uuid(id: &str) -> String {
    id.replace('-', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: i64 = 60;

    fn service() -> TokenService {
        TokenService::new(b"test-secret-key-32-bytes-long!!!", "https://mosaic.test", COOLDOWN)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn register_then_verify_round_trips() {
        let service = service();
        let now = now();

        let claims = service.register(None, "203.0.113.9", now);
        assert_eq!(claims.cnt, 0);
        assert_eq!(claims.lst, now - COOLDOWN, "fresh identity may write immediately");
        assert!(claims.nme.is_some());

        let (_, token) = service.reissue(&claims, "203.0.113.9", now).unwrap();
        let verified = service.verify(&token).unwrap();
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.lst, claims.lst);
        assert_eq!(verified.nme, claims.nme);
    }

    #[test]
    fn register_keeps_existing_subject() {
        let service = service();
        let claims = service.register(Some("keep-me"), "192.0.2.1", now());
        assert_eq!(claims.sub, "keep-me");
    }

    #[test]
    fn reissue_preserves_subject_and_extends_expiry() {
        let service = service();
        let t0 = now();
        let claims = service.register(None, "192.0.2.1", t0);

        // Simulate a token carried around for a while, then reissued.
        let (reissued, _) = service.reissue(&claims, "192.0.2.7", t0 + 1000).unwrap();
        assert_eq!(reissued.sub, claims.sub);
        assert_eq!(reissued.ip, "192.0.2.7");
        assert_eq!(reissued.exp, t0 + 1000 + TOKEN_VALIDITY_SECS);
        assert_ne!(reissued.jti, claims.jti);
    }

    #[test]
    fn tampered_token_is_invalid() {
        let service = service();
        let claims = service.register(None, "192.0.2.1", now());
        let (_, token) = service.reissue(&claims, "192.0.2.1", now()).unwrap();

        let mut tampered = token.into_bytes();
        let mid = tampered.len() / 2;
        tampered[mid] = if tampered[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        assert!(matches!(
            service.verify(&tampered),
            Err(IdentityError::Invalid)
        ));
    }

    #[test]
    fn wrong_issuer_is_invalid() {
        let issuer_a = service();
        let issuer_b =
            TokenService::new(b"test-secret-key-32-bytes-long!!!", "https://evil.test", COOLDOWN);

        let claims = issuer_b.register(None, "192.0.2.1", now());
        let (_, token) = issuer_b.reissue(&claims, "192.0.2.1", now()).unwrap();
        assert!(matches!(issuer_a.verify(&token), Err(IdentityError::Invalid)));
    }

    #[test]
    fn expired_token_is_invalid() {
        let service = service();
        let long_ago = now() - 2 * TOKEN_VALIDITY_SECS;
        let mut claims = service.register(None, "192.0.2.1", long_ago);
        claims.exp = long_ago + 10;

        let token =
            jsonwebtoken::encode(&Header::default(), &claims, &service.encoding).unwrap();
        assert!(matches!(service.verify(&token), Err(IdentityError::Invalid)));
    }

    #[test]
    fn garbage_input_is_invalid_not_a_panic() {
        let service = service();
        for raw in ["", "not.a.jwt", "a.b", "....", "\u{1f300}"] {
            assert!(matches!(service.verify(raw), Err(IdentityError::Invalid)));
        }
    }

    #[test]
    fn key_file_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");

        let first = TokenService::from_key_file(&path, "https://mosaic.test", COOLDOWN).unwrap();
        assert!(path.exists());
        let second = TokenService::from_key_file(&path, "https://mosaic.test", COOLDOWN).unwrap();

        // Tokens signed by the first instance verify under the second.
        let claims = first.register(None, "192.0.2.1", now());
        let (_, token) = first.reissue(&claims, "192.0.2.1", now()).unwrap();
        assert!(second.verify(&token).is_ok());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn strip_uuid_removes_dashes() {
        assert_eq!(
            strip_uuid("123e4567-e89b-12d3-a456-426614174000"),
            "123e4567e89b12d3a456426614174000"
        );
    }
}
