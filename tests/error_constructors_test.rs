use gridflux::error::GridfluxError;

#[test]
fn constructors_produce_matching_variants() {
    assert!(matches!(
        GridfluxError::config("x"),
        GridfluxError::Config { .. }
    ));
    assert!(matches!(
        GridfluxError::transport("x"),
        GridfluxError::Transport { .. }
    ));
    assert!(matches!(
        GridfluxError::sink("x"),
        GridfluxError::Sink { .. }
    ));
    assert!(matches!(GridfluxError::api("x"), GridfluxError::Api { .. }));
    assert!(matches!(GridfluxError::io("x"), GridfluxError::Io { .. }));
    assert!(matches!(
        GridfluxError::timeout("x"),
        GridfluxError::Timeout { .. }
    ));
    assert!(matches!(
        GridfluxError::generic("x"),
        GridfluxError::Generic { .. }
    ));
}

#[test]
fn display_messages_carry_context() {
    assert_eq!(
        GridfluxError::transport("link down").to_string(),
        "Transport error: link down"
    );
    assert_eq!(
        GridfluxError::validation("sink.url", "cannot be empty").to_string(),
        "Validation error: sink.url - cannot be empty"
    );
    assert_eq!(
        GridfluxError::timeout("refresh").to_string(),
        "Timeout error: refresh"
    );
}

#[test]
fn io_errors_convert() {
    let err: GridfluxError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(err, GridfluxError::Io { .. }));
    assert!(err.to_string().contains("gone"));
}

#[test]
fn serde_errors_convert() {
    let parse_err = serde_yaml::from_str::<gridflux::Config>("devices: 5").unwrap_err();
    let err: GridfluxError = parse_err.into();
    assert!(matches!(err, GridfluxError::Serialization { .. }));
}
