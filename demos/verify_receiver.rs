use para_river::{compute_signature, verify_webhook_request, SignatureEncoding, EVENT_HEADER, SIGNATURE_HEADER};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"timestamp":1700000000000,"appid":"app1","event":"create","items":[]}"#;
    let signature = compute_signature(secret, payload, SignatureEncoding::Base64);

    let headers = vec![
        (SIGNATURE_HEADER, signature.as_str()),
        (EVENT_HEADER, "create"),
    ];

    match verify_webhook_request(headers.iter().map(|(k, v)| (*k, *v)), payload, secret, SignatureEncoding::Base64) {
        Ok(()) => println!("signature ok"),
        Err(e) => println!("rejected: {:?}", e),
    }
}
