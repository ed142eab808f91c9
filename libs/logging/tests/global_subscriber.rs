#![allow(clippy::unwrap_used)]

#[test]
fn installs_global_subscriber_once() {
    let handle = logging::setup_global_subscriber("debug", true).unwrap();

    assert!(tracing::enabled!(tracing::Level::DEBUG));

    handle.reload("info").unwrap();
    assert!(!tracing::enabled!(tracing::Level::DEBUG));
    assert!(tracing::enabled!(tracing::Level::INFO));

    let error = logging::setup_global_subscriber("debug", false).unwrap_err();
    assert!(format!("{error:#}").contains("Could not set global default"));
}
