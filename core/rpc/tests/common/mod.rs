// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tern::proto::ProtoFunc;
use tern::{CallCtx, Endpoint, EndpointConfig, Plugin, Session, Status};

pub fn server_config() -> EndpointConfig {
    EndpointConfig::default().with_listen("127.0.0.1", 0)
}

pub fn build(
    config: EndpointConfig,
    proto_func: Option<ProtoFunc>,
    plugins: Vec<Arc<dyn Plugin>>,
) -> Endpoint {
    let mut builder = Endpoint::builder(config);
    if let Some(pf) = proto_func {
        builder = builder.proto_func(pf);
    }
    for plugin in plugins {
        builder = builder.plugin(plugin);
    }
    builder.build().expect("failed to build endpoint")
}

/// Register `/math/add` summing a list of integers.
pub fn route_math(server: &Endpoint) {
    server
        .router()
        .route_call(
            "/math/add",
            |ctx: CallCtx, args: Vec<i64>| async move {
                if ctx.peek_meta("author") != Some("clownfish") {
                    return Err(Status::new(1, "missing author"));
                }
                ctx.set_reply_meta("handled-by", "math");
                Ok(args.iter().sum::<i64>())
            },
            vec![],
        )
        .expect("failed to register /math/add");
}

/// Server listening on a free local port and a client session dialed to it.
pub async fn connected(
    proto_func: Option<ProtoFunc>,
    server_plugins: Vec<Arc<dyn Plugin>>,
    client_plugins: Vec<Arc<dyn Plugin>>,
) -> (Endpoint, Endpoint, Session) {
    let server = build(server_config(), proto_func.clone(), server_plugins);
    route_math(&server);
    let addr = server.listen().await.expect("listen failed");

    let client = build(EndpointConfig::default(), proto_func, client_plugins);
    let session = client.dial(&addr).await.expect("dial failed");
    (server, client, session)
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}
