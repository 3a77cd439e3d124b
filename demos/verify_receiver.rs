use hook_engine::{
    compute_signature, verify_delivery, DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER,
};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"orderId":123}"#;
    let timestamp = "1700000000";

    // What a signed listener would have sent.
    let signature = match compute_signature(secret, payload, Some(timestamp)) {
        Ok(signature) => signature,
        Err(err) => {
            eprintln!("cannot sign: {}", err);
            return;
        }
    };
    let headers = vec![
        format!("{}: {}", DEFAULT_SIGNATURE_HEADER, signature),
        format!("{}: {}", DEFAULT_TIMESTAMP_HEADER, timestamp),
    ];

    let now_secs = 1_700_000_200;
    match verify_delivery(
        &headers,
        payload,
        secret,
        DEFAULT_SIGNATURE_HEADER,
        DEFAULT_TIMESTAMP_HEADER,
        Some(300),
        now_secs,
    ) {
        Ok(()) => println!("signature accepted"),
        Err(err) => println!("signature rejected: {}", err),
    }
}
