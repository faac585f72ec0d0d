// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tern::message::with_meta;
use tern::{Endpoint, EndpointConfig, Payload, Session, SessionState};
use tern_plugins::heartbeat::{
    HEARTBEAT_SERVICE_METHOD, META_HEARTBEAT, Ping, Pong, heartbeat_state,
};
use tracing_test::traced_test;

use common::{echo_server, endpoint, wait_until};

fn first_session(endpoint: &Endpoint) -> Option<Session> {
    let mut found = None;
    endpoint.range_session(|s| {
        found = Some(s.clone());
        false
    });
    found
}

async fn announced_rate(server: &Endpoint, rate: Duration) -> Session {
    let mut accepted = None;
    let learned = wait_until(|| {
        accepted = first_session(server);
        accepted
            .as_ref()
            .and_then(heartbeat_state)
            .is_some_and(|st| st.rate() == Some(rate))
    })
    .await;
    assert!(learned, "server never saw the heartbeat rate");
    accepted.unwrap()
}

#[tokio::test]
#[traced_test]
async fn test_pong_expires_silent_peer() {
    let pong = Arc::new(Pong::new());
    let (server, addr) = echo_server(vec![pong.clone()]).await;
    let client = endpoint(EndpointConfig::default(), vec![]);
    let session = client.dial(&addr).await.unwrap();

    session
        .push_payload(
            HEARTBEAT_SERVICE_METHOD,
            Payload::empty(),
            vec![with_meta(META_HEARTBEAT, "3")],
        )
        .await
        .unwrap();
    let accepted = announced_rate(&server, Duration::from_secs(3)).await;
    let last = heartbeat_state(&accepted).unwrap().last();

    assert_eq!(pong.check(&server, last + Duration::from_secs(5)).await, 0);
    assert!(accepted.health());

    assert_eq!(pong.check(&server, last + Duration::from_secs(7)).await, 1);
    assert!(!accepted.health());
    assert!(logs_contain("heartbeat expired"));

    // the peer notices the dropped connection
    assert!(wait_until(|| session.state() == SessionState::Closed).await);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_sessions_without_rate_never_expire() {
    let pong = Arc::new(Pong::new());
    let (server, addr) = echo_server(vec![pong.clone()]).await;
    let client = endpoint(EndpointConfig::default(), vec![]);
    let session = client.dial(&addr).await.unwrap();

    let cmd = session.call("/echo", "hi", vec![]).await;
    assert_eq!(cmd.result::<String>().unwrap(), "hi");
    let far = Instant::now() + Duration::from_secs(3600);
    assert_eq!(pong.check(&server, far).await, 0);
    assert!(session.health());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_ping_sends_due_heartbeats() {
    let (server, addr) = echo_server(vec![Arc::new(Pong::new())]).await;
    let ping = Arc::new(Ping::new(Duration::from_secs(3), true));
    let client = endpoint(EndpointConfig::default(), vec![ping.clone()]);
    let session = client.dial(&addr).await.unwrap();

    let now = Instant::now();
    assert_eq!(ping.tick(&client, now), 0);

    let later = now + Duration::from_secs(4);
    assert_eq!(ping.tick(&client, later), 1);
    // just sent
    assert_eq!(ping.tick(&client, later), 0);

    let accepted = announced_rate(&server, Duration::from_secs(3)).await;
    assert!(accepted.health());
    assert!(session.health());

    client.close().await.unwrap();
    server.close().await.unwrap();
}
