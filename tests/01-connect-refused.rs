// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

use spacetime_client::{
    CallReducerFlags, ConnectOptions, ErrorKind, RetryPolicy, Session, SessionState,
    SubscriptionCallbacks,
};

fn unreachable_options() -> ConnectOptions {
    let mut options = ConnectOptions::new("demo");
    // Port 1 on localhost is almost certainly closed.
    options
        .set_host("127.0.0.1")
        .set_port(Some(1))
        .set_connect_timeout(Duration::from_secs(5))
        .set_retry_policy(RetryPolicy::no_retry());
    options
}

#[tokio::test]
async fn test_connect_to_closed_port_fails_fast() {
    let session = Session::new(unreachable_options());
    let err = session.connect().await.unwrap_err();
    assert!(
        matches!(
            err.kind(),
            ErrorKind::ServerNotAvailable | ErrorKind::ConnectionTimeout
        ),
        "unexpected error: {err}"
    );
    assert_eq!(session.state(), SessionState::Disconnected);

    // The session is reusable: a second connect attempt fails the same
    // way instead of complaining about state.
    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::ServerNotAvailable | ErrorKind::ConnectionTimeout
    ));
}

#[tokio::test]
async fn test_outbound_calls_require_connection() {
    let session = Session::new(unreachable_options());
    let err = session
        .call_reducer(
            "create_user",
            bytes::Bytes::new(),
            CallReducerFlags::FullUpdate,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    let err = session
        .subscribe_single("SELECT * FROM users", SubscriptionCallbacks::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn test_disconnect_is_terminal() {
    let session = Session::new(unreachable_options());
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);
    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTerminated);
}
