//! Display format and conversions of `AppError`.

use context_relay::AppError;

#[test]
fn display_prefixes_identify_the_variant() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Db("locked".into()), "db: locked"),
        (AppError::Codec("truncated".into()), "codec: truncated"),
        (AppError::NotFound("checkpoint x".into()), "not found: checkpoint x"),
        (AppError::Dependency("a failed".into()), "dependency: a failed"),
        (AppError::Execution("timed out".into()), "execution: timed out"),
        (AppError::Delegation("depth".into()), "delegation: depth"),
        (AppError::Unauthorized("agent-1".into()), "unauthorized: agent-1"),
        (AppError::Io("closed".into()), "io: closed"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn json_errors_convert_to_codec() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{not json")
        .expect_err("invalid json")
        .into();
    assert!(matches!(err, AppError::Codec(_)));
}

#[test]
fn io_errors_convert_to_io() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("pipe")));
}

#[test]
fn toml_errors_convert_to_config() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .expect_err("invalid toml")
        .into();
    assert!(matches!(err, AppError::Config(_)));
}
