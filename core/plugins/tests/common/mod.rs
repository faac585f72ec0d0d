// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tern::{CallCtx, Endpoint, EndpointConfig, Plugin, Status};

pub fn endpoint(config: EndpointConfig, plugins: Vec<Arc<dyn Plugin>>) -> Endpoint {
    let mut builder = Endpoint::builder(config);
    for plugin in plugins {
        builder = builder.plugin(plugin);
    }
    builder.build().expect("failed to build endpoint")
}

/// Server with `/echo` returning its string argument, listening on a free
/// local port.
pub async fn echo_server(plugins: Vec<Arc<dyn Plugin>>) -> (Endpoint, String) {
    let server = endpoint(EndpointConfig::default().with_listen("127.0.0.1", 0), plugins);
    server
        .router()
        .route_call(
            "/echo",
            |_ctx: CallCtx, text: String| async move { Ok::<_, Status>(text) },
            vec![],
        )
        .expect("failed to register /echo");
    let addr = server.listen().await.expect("listen failed");
    (server, addr)
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}
