use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the triggering event name.
pub const EVENT_HEADER: &str = "X-Para-Event";

/// Text encoding of the raw HMAC bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Base64,
    Hex,
}

fn mac_for(secret: &[u8]) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts keys of any length")
}

/// Compute the HMAC-SHA256 signature of a webhook payload.
pub fn compute_signature(secret: &[u8], payload: &[u8], encoding: SignatureEncoding) -> String {
    let mut mac = mac_for(secret);
    mac.update(payload);
    let bytes = mac.finalize().into_bytes();
    match encoding {
        SignatureEncoding::Base64 => STANDARD.encode(bytes),
        SignatureEncoding::Hex => hex::encode(bytes),
    }
}

/// Verify a received signature. Comparison is constant-time.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    signature: &str,
    encoding: SignatureEncoding,
) -> bool {
    let decoded = match encoding {
        SignatureEncoding::Base64 => STANDARD.decode(signature.trim()).ok(),
        SignatureEncoding::Hex => hex::decode(signature.trim()).ok(),
    };
    let Some(expected) = decoded else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub event: Option<String>,
}

/// Pull the signature and event headers out of a header list.
/// Header names are matched case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let sig_key = SIGNATURE_HEADER.to_ascii_lowercase();
    let event_key = EVENT_HEADER.to_ascii_lowercase();

    let mut signature = None;
    let mut event = None;

    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        if key == sig_key {
            signature = Some(value.to_string());
        } else if key == event_key {
            event = Some(value.to_string());
        }
    }

    ParsedSignature { signature, event }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call, for receivers.
///
/// `payload` is the JSON payload string: the raw body for JSON webhooks,
/// or the decoded `payload` form field for url-encoded ones.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    encoding: SignatureEncoding,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;

    if verify_signature(secret, payload, &signature, encoding) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = compute_signature(b"secret", b"{\"a\":1}", SignatureEncoding::Base64);
        let b = compute_signature(b"secret", b"{\"a\":1}", SignatureEncoding::Base64);
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_payload_or_secret() {
        let base = compute_signature(b"secret", b"{\"a\":1}", SignatureEncoding::Hex);
        assert_ne!(base, compute_signature(b"secret", b"{\"a\":2}", SignatureEncoding::Hex));
        assert_ne!(base, compute_signature(b"other", b"{\"a\":1}", SignatureEncoding::Hex));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let sig = compute_signature(
            b"Jefe",
            b"what do ya want for nothing?",
            SignatureEncoding::Hex,
        );
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_accepts_both_encodings() {
        for encoding in [SignatureEncoding::Base64, SignatureEncoding::Hex] {
            let sig = compute_signature(b"k", b"body", encoding);
            assert!(verify_signature(b"k", b"body", &sig, encoding));
            assert!(!verify_signature(b"k", b"tampered", &sig, encoding));
        }
    }

    #[test]
    fn verify_request_reads_headers() {
        let sig = compute_signature(b"k", b"body", SignatureEncoding::Base64);
        let headers = vec![("x-webhook-signature", sig.as_str()), ("X-Para-Event", "create")];
        assert_eq!(
            verify_webhook_request(headers, b"body", b"k", SignatureEncoding::Base64),
            Ok(())
        );

        let empty: Vec<(&str, &str)> = Vec::new();
        assert_eq!(
            verify_webhook_request(empty, b"body", b"k", SignatureEncoding::Base64),
            Err(VerificationError::MissingSignature)
        );
    }
}
