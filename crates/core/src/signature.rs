use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Result of authenticating an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The claimed signature matched the computed digest.
    Verified,
    /// No shared secret is configured; the payload was not checked. Only
    /// reachable through the explicit unsigned mode, never as a silent
    /// default.
    Skipped,
}

/// Authentication failures for inbound payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("payload digest header is missing")]
    MissingSignature,
    #[error("payload digest does not match the computed signature")]
    SignatureMismatch,
}

/// Authenticates raw webhook payloads against the provider's shared secret.
///
/// The digest is HMAC-SHA256 over the exact bytes received on the wire,
/// hex-encoded and compared in constant time.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Arc<[u8]>>,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Some(Arc::from(secret.into().into_boxed_slice())),
        }
    }

    /// Builds a verifier that accepts all traffic. This is a loud, explicit
    /// configuration choice; the config layer refuses it in production
    /// unless `WEBHOOK_ALLOW_UNSIGNED=1` is set.
    pub fn unsigned() -> Self {
        Self { secret: None }
    }

    pub fn is_unsigned(&self) -> bool {
        self.secret.is_none()
    }

    /// Verifies `claimed` against the digest of `payload`.
    ///
    /// Comparison never short-circuits on the first differing byte; a length
    /// mismatch is compared against a zero-filled buffer of the computed
    /// digest's length and always fails.
    pub fn verify(
        &self,
        payload: &[u8],
        claimed: Option<&str>,
    ) -> Result<Verification, SignatureError> {
        let Some(secret) = &self.secret else {
            return Ok(Verification::Skipped);
        };
        let claimed = claimed.ok_or(SignatureError::MissingSignature)?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|_| SignatureError::SignatureMismatch)?;
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());
        let expected_bytes = expected.as_bytes();

        // Hex digits carry no secret information, so case folding the claim
        // before the constant-time compare is safe.
        let claimed_bytes = claimed.to_ascii_lowercase().into_bytes();

        let matched: bool = if claimed_bytes.len() == expected_bytes.len() {
            expected_bytes.ct_eq(&claimed_bytes).into()
        } else {
            let zeroes = vec![0u8; expected_bytes.len()];
            let _: bool = expected_bytes.ct_eq(&zeroes).into();
            false
        };

        if matched {
            Ok(Verification::Verified)
        } else {
            Err(SignatureError::SignatureMismatch)
        }
    }
}

/// Computes the hex digest a well-behaved provider would attach to `payload`.
pub fn compute_digest(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
