//! Payload signing and verification.
//!
//! The gateway contract is a detached signature over the inner XML document,
//! carried in the envelope's trailing `signature` element. The concrete
//! scheme is deployment-specific; the trait keeps it swappable.

use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::utils::signature::{sign_payload, verify_payload};

pub trait PayloadSigner: Send + Sync {
    /// Sign the serialized inner document, returning the encoded signature.
    fn sign(&self, payload: &str) -> Result<String, AppError>;

    /// Verify an inbound document against its claimed signature.
    fn verify(&self, payload: &str, signature: &str) -> Result<bool, AppError>;
}

/// HMAC-SHA256 signer over the exact inner-document bytes.
pub struct HmacSigner {
    secret: Secret<String>,
}

impl HmacSigner {
    pub fn new(secret: Secret<String>) -> Self {
        Self { secret }
    }
}

impl PayloadSigner for HmacSigner {
    fn sign(&self, payload: &str) -> Result<String, AppError> {
        sign_payload(self.secret.expose_secret(), payload)
            .map_err(AppError::InternalError)
    }

    fn verify(&self, payload: &str, signature: &str) -> Result<bool, AppError> {
        verify_payload(self.secret.expose_secret(), payload, signature)
            .map_err(AppError::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_round_trip() {
        let signer = HmacSigner::new(Secret::new("gepg-secret".to_string()));
        let signature = signer.sign("<billSubReq>x</billSubReq>").unwrap();
        assert!(signer.verify("<billSubReq>x</billSubReq>", &signature).unwrap());
        assert!(!signer.verify("<billSubReq>y</billSubReq>", &signature).unwrap());
    }
}
