//! Detached signatures over work orders.
//!
//! Under PBFT the head signs every work order so that replicas can prove
//! the order originated from the request's head node and not from a
//! Byzantine member replaying or forging traffic. The signature covers a
//! SHA-256 digest of the order's identifying fields; the digest is
//! length-prefixed per field so no two field sequences collide.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::execution::ExecuteRequest;

#[derive(Debug, Error)]
pub enum WorkOrderSignatureError {
    #[error("malformed signature: {0}")]
    Malformed(#[source] ed25519_dalek::SignatureError),
    #[error("signature verification failed: {0}")]
    Verification(#[source] ed25519_dalek::SignatureError),
}

/// Digest of the fields a work-order signature commits to.
pub fn work_order_digest(
    request_id: &str,
    request: &ExecuteRequest,
    timestamp_ms: u64,
) -> [u8; 32] {
    let mut hasher = Sha256::new();

    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(request_id.as_bytes());
    field(request.function_id.as_bytes());
    field(request.method.as_bytes());
    for arg in &request.arguments {
        field(arg.as_bytes());
    }
    field(&timestamp_ms.to_le_bytes());

    hasher.finalize().into()
}

pub fn sign_work_order(
    key: &SigningKey,
    request_id: &str,
    request: &ExecuteRequest,
    timestamp_ms: u64,
) -> Vec<u8> {
    let digest = work_order_digest(request_id, request, timestamp_ms);
    key.sign(&digest).to_bytes().to_vec()
}

pub fn verify_work_order(
    key: &VerifyingKey,
    request_id: &str,
    request: &ExecuteRequest,
    timestamp_ms: u64,
    signature: &[u8],
) -> Result<(), WorkOrderSignatureError> {
    let signature = Signature::from_slice(signature).map_err(WorkOrderSignatureError::Malformed)?;
    let digest = work_order_digest(request_id, request, timestamp_ms);
    key.verify(&digest, &signature)
        .map_err(WorkOrderSignatureError::Verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            function_id: "bafy123".to_string(),
            method: "main.wasm".to_string(),
            arguments: vec!["--level".to_string(), "3".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn sign_and_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let req = request();

        let sig = sign_work_order(&key, "req-1", &req, 1234);
        verify_work_order(&key.verifying_key(), "req-1", &req, 1234, &sig).unwrap();
    }

    #[test]
    fn tampered_order_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let req = request();

        let sig = sign_work_order(&key, "req-1", &req, 1234);

        let mut tampered = req.clone();
        tampered.arguments.push("--extra".to_string());
        assert!(matches!(
            verify_work_order(&key.verifying_key(), "req-1", &tampered, 1234, &sig),
            Err(WorkOrderSignatureError::Verification(_))
        ));

        // A different request id also breaks the signature.
        assert!(
            verify_work_order(&key.verifying_key(), "req-2", &req, 1234, &sig).is_err()
        );
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let req = request();
        assert!(matches!(
            verify_work_order(&key.verifying_key(), "req-1", &req, 1234, &[0u8; 7]),
            Err(WorkOrderSignatureError::Malformed(_))
        ));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        // ["ab", "c"] and ["a", "bc"] must not hash identically.
        let mut a = request();
        a.arguments = vec!["ab".to_string(), "c".to_string()];
        let mut b = request();
        b.arguments = vec!["a".to_string(), "bc".to_string()];

        assert_ne!(
            work_order_digest("req-1", &a, 0),
            work_order_digest("req-1", &b, 0)
        );
    }
}
