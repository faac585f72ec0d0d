// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;

use tern::{Code, EndpointConfig, Session, Status};
use tern_plugins::auth::{Bearer, Checker};

use common::{echo_server, endpoint, wait_until};

#[tokio::test]
async fn test_matching_token_connects() {
    let (server, addr) = echo_server(vec![Arc::new(Checker::with_token("letmein"))]).await;
    let client = endpoint(
        EndpointConfig::default(),
        vec![Arc::new(Bearer::new("letmein"))],
    );

    let session = client.dial(&addr).await.unwrap();
    let cmd = session.call("/echo", "hi", vec![]).await;
    assert_eq!(cmd.result::<String>().unwrap(), "hi");
    assert!(wait_until(|| server.count_session() == 1).await);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_mismatching_token_fails_dial() {
    let (server, addr) = echo_server(vec![Arc::new(Checker::with_token("letmein"))]).await;
    let client = endpoint(
        EndpointConfig::default(),
        vec![Arc::new(Bearer::new("guess"))],
    );

    let err = client.dial(&addr).await.unwrap_err();
    assert_eq!(err.code(), Code::UNAUTHORIZED);
    assert_eq!(err.msg(), "invalid token");
    assert_eq!(client.count_session(), 0);

    // the server dropped the connection as well
    assert!(wait_until(|| server.count_session() == 0).await);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_checker_sees_session_and_answers() {
    let checker = Checker::new(Arc::new(
        |session: &Session, token: &str| -> Result<String, Status> {
            let user = token
                .strip_prefix("user:")
                .ok_or_else(|| Status::new(Code::UNAUTHORIZED, "malformed token"))?;
            session.set_id(format!("user-{}", user));
            Ok(format!("welcome {}", user))
        },
    ));
    let (server, addr) = echo_server(vec![Arc::new(checker)]).await;

    let client = endpoint(
        EndpointConfig::default(),
        vec![Arc::new(Bearer::new("user:ada"))],
    );
    let session = client.dial(&addr).await.unwrap();
    assert!(session.health());
    assert!(wait_until(|| server.get_session("user-ada").is_some()).await);

    let rejected = endpoint(
        EndpointConfig::default(),
        vec![Arc::new(Bearer::new("ada"))],
    );
    let err = rejected.dial(&addr).await.unwrap_err();
    assert_eq!(err.msg(), "malformed token");

    rejected.close().await.unwrap();
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_bearer_without_checker_is_refused() {
    let (server, addr) = echo_server(vec![]).await;
    let client = endpoint(
        EndpointConfig::default(),
        vec![Arc::new(Bearer::new("letmein"))],
    );

    let err = client.dial(&addr).await.unwrap_err();
    assert_eq!(err.code(), Code::MTYPE_NOT_ALLOWED);

    client.close().await.unwrap();
    server.close().await.unwrap();
}
