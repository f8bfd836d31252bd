//! Default-instance fall-back behavior
//!
//! Kept in their own binary: no test here ever sets a default instance,
//! so the empty-slot path stays observable.

use torbind::{ConnectError, ConnectOptions, HiddenServiceSocket, RegistryError, TorStream};

#[tokio::test]
async fn connect_without_an_instance_fails_fast() {
    let result = TorStream::connect("example.onion", 80).await;
    match result {
        Err(ConnectError::NoInstance) => {},
        Err(other) => panic!("expected NoInstance, got {other}"),
        Ok(_) => panic!("connected without an instance"),
    }
}

#[tokio::test]
async fn connect_with_options_still_requires_an_instance() {
    let result = TorStream::connect_with(
        "example.onion",
        80,
        ConnectOptions {
            stream_token: Some("token".to_string()),
            max_attempts: 1,
            tor: None,
        },
    )
    .await;
    assert!(matches!(result, Err(ConnectError::NoInstance)));
}

#[tokio::test]
async fn open_without_an_instance_fails_fast() {
    let result = HiddenServiceSocket::open(10024, "test").await;
    match result {
        Err(RegistryError::NoInstance) => {},
        Err(other) => panic!("expected NoInstance, got {other}"),
        Ok(_) => panic!("published without an instance"),
    }
}
