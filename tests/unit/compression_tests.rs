use context_relay::persistence::compression;
use context_relay::AppError;

#[test]
fn compressed_payload_inflates_to_original() {
    let payload = serde_json::json!({
        "session": "s-1",
        "notes": "zone ranking ".repeat(200),
    })
    .to_string();

    let packed = compression::compress(payload.as_bytes()).expect("compress");
    assert!(packed.len() < payload.len(), "repetitive text should shrink");

    let unpacked = compression::decompress(&packed).expect("decompress");
    assert_eq!(unpacked, payload.as_bytes());
}

#[test]
fn garbage_input_is_a_codec_error() {
    let err = compression::decompress(b"definitely not gzip").expect_err("must fail");
    assert!(matches!(err, AppError::Codec(_)));
}
