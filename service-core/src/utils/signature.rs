use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Generate a base64-encoded HMAC-SHA256 signature over a payload.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    mac.update(payload.as_bytes());
    let result = mac.finalize();

    Ok(BASE64.encode(result.into_bytes()))
}

/// Verify a payload signature using constant-time comparison.
pub fn verify_payload(secret: &str, payload: &str, signature: &str) -> Result<bool, anyhow::Error> {
    let expected = sign_payload(secret, payload)?;

    let expected_bytes = expected.as_bytes();
    let signature_bytes = signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let signature = sign_payload("secret", "<Gepg>payload</Gepg>").unwrap();
        assert!(verify_payload("secret", "<Gepg>payload</Gepg>", &signature).unwrap());
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let signature = sign_payload("secret", "<Gepg>payload</Gepg>").unwrap();
        assert!(!verify_payload("secret", "<Gepg>tampered</Gepg>", &signature).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_length_signature() {
        assert!(!verify_payload("secret", "payload", "short").unwrap());
    }
}
