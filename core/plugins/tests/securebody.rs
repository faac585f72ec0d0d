// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use tern::plugin::{AfterReadReplyHeader, AfterWriteCall};
use tern::{Code, Codec, Endpoint, EndpointConfig, Hooks, Plugin, ReadCtx, Status, WriteCtx};
use tern_plugins::securebody::{
    META_SECURE_BODY, SecureBody, with_reply_secure_body, with_secure_body,
};

use common::{echo_server, endpoint};

const KEY: &[u8; 16] = b"0123456789abcdef";
const OTHER_KEY: &[u8; 16] = b"fedcba9876543210";

/// Records what went over the wire on the client side.
#[derive(Default)]
struct Wire {
    calls: Mutex<Vec<(u8, bool)>>,
    replies: Mutex<Vec<(u8, bool)>>,
}

impl Plugin for Wire {
    fn name(&self) -> &str {
        "wire"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks
            .after_write_call(self.clone())
            .after_read_reply_header(self);
    }
}

impl AfterWriteCall for Wire {
    fn after_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        let msg = ctx.output();
        let marked = msg.meta().get(META_SECURE_BODY) == Some("true");
        self.calls.lock().push((msg.body_codec(), marked));
        Ok(())
    }
}

impl AfterReadReplyHeader for Wire {
    fn after_read_reply_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        let marked = ctx.peek_meta(META_SECURE_BODY) == Some("true");
        self.replies.lock().push((ctx.input().body_codec(), marked));
        Ok(())
    }
}

fn client(key: &[u8], wire: &Arc<Wire>) -> Endpoint {
    let plugins: Vec<Arc<dyn Plugin>> = vec![wire.clone(), Arc::new(SecureBody::new(key).unwrap())];
    endpoint(EndpointConfig::default(), plugins)
}

async fn secure_server(key: &[u8]) -> (Endpoint, String) {
    echo_server(vec![Arc::new(SecureBody::new(key).unwrap())]).await
}

#[tokio::test]
async fn test_encrypted_round_trip() {
    let (server, addr) = secure_server(KEY).await;
    let wire = Arc::new(Wire::default());
    let client = client(KEY, &wire);
    let session = client.dial(&addr).await.unwrap();

    let cmd = session.call("/echo", "top secret", vec![with_secure_body()]).await;
    assert_eq!(cmd.result::<String>().unwrap(), "top secret");
    assert_eq!(*wire.calls.lock(), vec![(Codec::Binary.id(), true)]);
    assert_eq!(*wire.replies.lock(), vec![(Codec::Binary.id(), true)]);

    // unmarked calls stay in the clear
    let cmd = session.call("/echo", "public", vec![]).await;
    assert_eq!(cmd.result::<String>().unwrap(), "public");
    assert_eq!(wire.calls.lock()[1], (Codec::Json.id(), false));
    assert_eq!(wire.replies.lock()[1], (Codec::Json.id(), false));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_reply_only_encryption() {
    let (server, addr) = secure_server(KEY).await;
    let wire = Arc::new(Wire::default());
    let client = client(KEY, &wire);
    let session = client.dial(&addr).await.unwrap();

    let cmd = session
        .call("/echo", "plain in", vec![with_reply_secure_body(true)])
        .await;
    assert_eq!(cmd.result::<String>().unwrap(), "plain in");
    assert_eq!(*wire.calls.lock(), vec![(Codec::Json.id(), false)]);
    assert_eq!(*wire.replies.lock(), vec![(Codec::Binary.id(), true)]);

    let cmd = session
        .call(
            "/echo",
            "sealed in",
            vec![with_secure_body(), with_reply_secure_body(false)],
        )
        .await;
    assert_eq!(cmd.result::<String>().unwrap(), "sealed in");
    assert_eq!(wire.calls.lock()[1], (Codec::Binary.id(), true));
    assert_eq!(wire.replies.lock()[1], (Codec::Json.id(), false));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_key_fails() {
    let (server, addr) = secure_server(OTHER_KEY).await;
    let wire = Arc::new(Wire::default());
    let client = client(KEY, &wire);
    let session = client.dial(&addr).await.unwrap();

    let cmd = session.call("/echo", "top secret", vec![with_secure_body()]).await;
    let st = cmd.status();
    assert_eq!(st.code(), Code::BAD_MESSAGE);
    assert!(st.cause().unwrap().contains("open failed"));
    assert!(session.health());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_plaintext_reply_rejected() {
    // the server does not know about secure bodies
    let (server, addr) = echo_server(vec![]).await;
    let wire = Arc::new(Wire::default());
    let client = client(KEY, &wire);
    let session = client.dial(&addr).await.unwrap();

    let cmd = session
        .call("/echo", "plain in", vec![with_reply_secure_body(true)])
        .await;
    let st = cmd.status();
    assert_eq!(st.code(), Code::BAD_MESSAGE);
    assert_eq!(st.cause(), Some("reply body is not encrypted"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}
