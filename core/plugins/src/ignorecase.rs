// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Case-insensitive routing: incoming paths are lower-cased before lookup,
//! so routes must be registered in lower case.

use std::sync::Arc;

use tern::plugin::{AfterReadCallHeader, AfterReadPushHeader, AfterRegRouter};
use tern::router::HandlerInfo;
use tern::{Hooks, Plugin, ReadCtx, Status};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct IgnoreCase;

impl IgnoreCase {
    pub fn new() -> Self {
        IgnoreCase
    }

    fn lower(&self, ctx: &mut ReadCtx<'_>) {
        let path = ctx.input().path();
        if path.bytes().any(|b| b.is_ascii_uppercase()) {
            let lowered = path.to_ascii_lowercase();
            ctx.reset_service_method(&lowered);
        }
    }
}

impl Plugin for IgnoreCase {
    fn name(&self) -> &str {
        "ignore-case"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks
            .after_reg_router(self.clone())
            .after_read_call_header(self.clone())
            .after_read_push_header(self);
    }
}

impl AfterRegRouter for IgnoreCase {
    fn after_reg_router(&self, handler: &HandlerInfo) -> Result<(), Status> {
        if handler.name().bytes().any(|b| b.is_ascii_uppercase()) {
            warn!(route = %handler.name(), "route has upper-case letters and can never match");
        }
        Ok(())
    }
}

impl AfterReadCallHeader for IgnoreCase {
    fn after_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.lower(ctx);
        Ok(())
    }
}

impl AfterReadPushHeader for IgnoreCase {
    fn after_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.lower(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern::transport::Conn;
    use tern::{Endpoint, EndpointConfig, Message};

    #[tokio::test]
    async fn test_lowers_path_keeps_query() {
        let endpoint = Endpoint::builder(EndpointConfig::default()).build().unwrap();
        let (a, _b) = tokio::io::duplex(1024);
        let session = endpoint.serve_conn(Conn::from_stream(a)).await.unwrap();

        let plugin = IgnoreCase::new();
        let mut msg = Message::new();
        msg.set_service_method("/Math/ADD?Author=Clownfish");
        plugin
            .after_read_call_header(&mut ReadCtx::new(&session, &mut msg, None))
            .unwrap();
        assert_eq!(msg.service_method(), "/math/add?Author=Clownfish");
        assert_eq!(msg.path(), "/math/add");

        msg.set_service_method("/already/lower");
        plugin
            .after_read_push_header(&mut ReadCtx::new(&session, &mut msg, None))
            .unwrap();
        assert_eq!(msg.service_method(), "/already/lower");

        endpoint.close().await.unwrap();
    }
}
