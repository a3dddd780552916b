//! GitHub webhook signature verification

use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{DeployError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify `signature_header` against the HMAC-SHA256 of the raw `payload`.
///
/// The secret is checked first so a misconfigured service never compares
/// against an undefined key. The digest comparison goes through
/// `Mac::verify_slice`, which is constant time over the full digest.
pub fn verify_github_signature(
    secret: Option<&str>,
    payload: &[u8],
    signature_header: Option<&str>,
) -> Result<()> {
    let secret = secret.ok_or(DeployError::ConfigurationError)?;
    let signature_header = signature_header.ok_or(DeployError::MissingSignature)?;

    let Some(git_signature) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        warn!("Signature header does not start with '{}'", SIGNATURE_PREFIX);
        return Err(DeployError::SignatureMismatch);
    };

    let git_signature_bytes = hex_decode(git_signature.trim()).map_err(|_| {
        warn!("Signature header is not valid hex");
        DeployError::SignatureMismatch
    })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeployError::ConfigurationError)?;
    mac.update(payload);

    match mac.verify_slice(&git_signature_bytes) {
        Ok(()) => {
            debug!("Webhook signature verified");
            Ok(())
        }
        Err(_) => Err(DeployError::SignatureMismatch),
    }
}

/// Compute the `sha256=<hex>` header value GitHub would send for `payload`.
pub fn sign(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeployError::ConfigurationError)?;
    mac.update(payload);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "It's a Secret to Everybody";
    const BODY: &[u8] = b"Hello, World!";

    #[test]
    fn accepts_github_reference_signature() {
        // Test vector from GitHub's "Validating webhook deliveries" documentation.
        let signature =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify_github_signature(Some(SECRET), BODY, Some(signature)).is_ok());
        assert_eq!(sign(SECRET, BODY).unwrap(), signature);
    }

    #[test]
    fn missing_secret_fails_before_looking_at_signature() {
        let err = verify_github_signature(None, BODY, None).unwrap_err();
        assert!(matches!(err, DeployError::ConfigurationError));
    }

    #[test]
    fn missing_header_is_reported() {
        let err = verify_github_signature(Some(SECRET), BODY, None).unwrap_err();
        assert!(matches!(err, DeployError::MissingSignature));
    }

    #[test]
    fn any_body_byte_mutation_is_rejected() {
        let signature = sign(SECRET, BODY).unwrap();
        for i in 0..BODY.len() {
            let mut mutated = BODY.to_vec();
            mutated[i] ^= 0x01;
            let err = verify_github_signature(Some(SECRET), &mutated, Some(&signature)).unwrap_err();
            assert!(matches!(err, DeployError::SignatureMismatch), "byte {}", i);
        }
    }

    #[test]
    fn any_secret_byte_mutation_is_rejected() {
        let signature = sign(SECRET, BODY).unwrap();
        for i in 0..SECRET.len() {
            let mut mutated = SECRET.as_bytes().to_vec();
            mutated[i] ^= 0x01;
            let secret = String::from_utf8(mutated).unwrap();
            assert!(verify_github_signature(Some(&secret), BODY, Some(&signature)).is_err());
        }
    }

    #[test]
    fn malformed_headers_are_mismatches() {
        for header in ["sha1=abcdef", "sha256=not-hex", "757107ea0e", "sha256="] {
            let err = verify_github_signature(Some(SECRET), BODY, Some(header)).unwrap_err();
            assert!(matches!(err, DeployError::SignatureMismatch), "{}", header);
        }
    }

    #[test]
    fn truncated_digest_is_rejected() {
        let signature = sign(SECRET, BODY).unwrap();
        let truncated = &signature[..signature.len() - 2];
        assert!(verify_github_signature(Some(SECRET), BODY, Some(truncated)).is_err());
    }
}
