// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Explicit routing table of call and push handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::codec::{Codec, Payload};
use crate::message::{Message, Meta};
use crate::plugin::{Plugin, PluginContainer};
use crate::session::Session;
use crate::status::{Code, Status};

pub type CallHandlerFn =
    Arc<dyn Fn(CallCtx) -> BoxFuture<'static, Result<Payload, Status>> + Send + Sync>;

pub type PushHandlerFn = Arc<dyn Fn(PushCtx) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Call,
    Push,
    UnknownCall,
    UnknownPush,
}

/// Registered handler as seen by `AfterRegRouter` hooks.
pub struct HandlerInfo {
    name: String,
    kind: HandlerKind,
    plugins: Arc<PluginContainer>,
}

impl fmt::Debug for HandlerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerInfo")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("plugins", &self.plugins.names())
            .finish()
    }
}

impl HandlerInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Endpoint plugins followed by the plugins given at registration.
    pub fn plugins(&self) -> &Arc<PluginContainer> {
        &self.plugins
    }
}

pub(crate) struct CallHandler {
    pub(crate) info: HandlerInfo,
    pub(crate) func: CallHandlerFn,
}

pub(crate) struct PushHandler {
    pub(crate) info: HandlerInfo,
    pub(crate) func: PushHandlerFn,
}

struct Input {
    session: Session,
    seq: i32,
    service_method: String,
    meta: Meta,
    payload: Payload,
}

impl Input {
    fn new(session: Session, msg: &Message) -> Arc<Self> {
        Arc::new(Input {
            session,
            seq: msg.seq(),
            service_method: msg.service_method().to_string(),
            meta: msg.meta().clone(),
            payload: msg.payload(),
        })
    }

    fn path(&self) -> &str {
        match self.service_method.split_once('?') {
            Some((path, _)) => path,
            None => &self.service_method,
        }
    }

    fn query(&self) -> Meta {
        match self.service_method.split_once('?') {
            Some((_, q)) => Meta::decode(q.as_bytes()),
            None => Meta::new(),
        }
    }
}

#[derive(Default)]
struct ReplyState {
    meta: Meta,
    codec: Option<Codec>,
}

/// Context handed to call handlers.
#[derive(Clone)]
pub struct CallCtx {
    input: Arc<Input>,
    reply: Arc<Mutex<ReplyState>>,
    default_codec: Codec,
}

impl CallCtx {
    pub(crate) fn new(session: Session, msg: &Message, default_codec: Codec) -> Self {
        CallCtx {
            input: Input::new(session, msg),
            reply: Arc::new(Mutex::new(ReplyState::default())),
            default_codec,
        }
    }

    pub fn session(&self) -> &Session {
        &self.input.session
    }

    pub fn seq(&self) -> i32 {
        self.input.seq
    }

    pub fn service_method(&self) -> &str {
        &self.input.service_method
    }

    pub fn path(&self) -> &str {
        self.input.path()
    }

    pub fn query(&self) -> Meta {
        self.input.query()
    }

    pub fn peek_meta(&self, key: &str) -> Option<&str> {
        self.input.meta.get(key)
    }

    pub fn input_meta(&self) -> &Meta {
        &self.input.meta
    }

    pub fn input_payload(&self) -> &Payload {
        &self.input.payload
    }

    pub fn peer_addr(&self) -> Option<String> {
        self.input.session.peer_addr()
    }

    pub fn set_reply_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.reply.lock().meta.set(key, value);
    }

    pub fn add_reply_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.reply.lock().meta.add(key, value);
    }

    pub fn set_reply_body_codec(&self, codec: Codec) {
        self.reply.lock().codec = Some(codec);
    }

    /// Codec used to encode typed replies: the one set by the handler, else
    /// the request codec when it is not protobuf, else the endpoint default
    /// when it is not protobuf, else JSON.
    pub fn reply_codec(&self) -> Codec {
        if let Some(codec) = self.reply.lock().codec {
            return codec;
        }
        match self.input.payload.codec() {
            Some(c @ (Codec::Json | Codec::Plain | Codec::Binary)) => c,
            _ if self.default_codec != Codec::Protobuf => self.default_codec,
            _ => Codec::Json,
        }
    }

    pub(crate) fn take_reply_meta(&self) -> Meta {
        std::mem::take(&mut self.reply.lock().meta)
    }
}

/// Context handed to push handlers.
#[derive(Clone)]
pub struct PushCtx {
    input: Arc<Input>,
}

impl PushCtx {
    pub(crate) fn new(session: Session, msg: &Message) -> Self {
        PushCtx {
            input: Input::new(session, msg),
        }
    }

    pub fn session(&self) -> &Session {
        &self.input.session
    }

    pub fn seq(&self) -> i32 {
        self.input.seq
    }

    pub fn service_method(&self) -> &str {
        &self.input.service_method
    }

    pub fn path(&self) -> &str {
        self.input.path()
    }

    pub fn query(&self) -> Meta {
        self.input.query()
    }

    pub fn peek_meta(&self, key: &str) -> Option<&str> {
        self.input.meta.get(key)
    }

    pub fn input_meta(&self) -> &Meta {
        &self.input.meta
    }

    pub fn input_payload(&self) -> &Payload {
        &self.input.payload
    }

    pub fn peer_addr(&self) -> Option<String> {
        self.input.session.peer_addr()
    }
}

#[derive(Default)]
struct RouteTable {
    calls: HashMap<String, Arc<CallHandler>>,
    pushes: HashMap<String, Arc<PushHandler>>,
    unknown_call: Option<Arc<CallHandler>>,
    unknown_push: Option<Arc<PushHandler>>,
}

/// Handle on the routing table. Clones share the table; sub-routes add a
/// path prefix and extra plugins.
#[derive(Clone)]
pub struct Router {
    prefix: String,
    plugins: Arc<PluginContainer>,
    table: Arc<RwLock<RouteTable>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("prefix", &self.prefix)
            .field("routes", &self.routes())
            .finish()
    }
}

fn check_path(path: &str) -> Result<(), Status> {
    if !path.starts_with('/') || path.contains('?') {
        return Err(Status::bad_message(format!("invalid route path {:?}", path)));
    }
    Ok(())
}

fn conflict(path: &str) -> Status {
    Status::with_code(Code::CONFLICT).with_cause(format!("route {} already registered", path))
}

impl Router {
    pub(crate) fn new(plugins: Arc<PluginContainer>) -> Self {
        Router {
            prefix: String::new(),
            plugins,
            table: Arc::new(RwLock::new(RouteTable::default())),
        }
    }

    /// Router registering under `prefix`, with `plugins` added to every
    /// handler registered through it.
    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> Result<Router, Status> {
        check_path(prefix)?;
        Ok(Router {
            prefix: self.full_path(prefix),
            plugins: Arc::new(self.plugins.with_extra(plugins)?),
            table: self.table.clone(),
        })
    }

    fn full_path(&self, path: &str) -> String {
        let path = path.trim_end_matches('/');
        let path = if path.is_empty() { "/" } else { path };
        match (self.prefix.as_str(), path) {
            ("", p) => p.to_string(),
            (prefix, "/") => prefix.to_string(),
            (prefix, p) => format!("{}{}", prefix, p),
        }
    }

    fn handler_info(
        &self,
        name: String,
        kind: HandlerKind,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<HandlerInfo, Status> {
        let plugins = if plugins.is_empty() {
            self.plugins.clone()
        } else {
            Arc::new(self.plugins.with_extra(plugins)?)
        };
        let info = HandlerInfo {
            name,
            kind,
            plugins,
        };
        info.plugins.after_reg_router(&info)?;
        Ok(info)
    }

    /// Register a call handler exchanging raw payloads.
    pub fn route_call_payload<F, Fut>(
        &self,
        path: &str,
        handler: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(), Status>
    where
        F: Fn(CallCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Status>> + Send + 'static,
    {
        check_path(path)?;
        let name = self.full_path(path);
        if self.table.read().calls.contains_key(&name) {
            return Err(conflict(&name));
        }
        let info = self.handler_info(name.clone(), HandlerKind::Call, plugins)?;
        let func: CallHandlerFn = Arc::new(move |ctx| handler(ctx).boxed());

        let mut table = self.table.write();
        if table.calls.contains_key(&name) {
            return Err(conflict(&name));
        }
        debug!(route = %name, "registered call handler");
        table.calls.insert(name, Arc::new(CallHandler { info, func }));
        Ok(())
    }

    /// Register a call handler taking and returning serde values, encoded
    /// with the request codec.
    pub fn route_call<A, R, F, Fut>(
        &self,
        path: &str,
        handler: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(), Status>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.route_call_payload(
            path,
            move |ctx: CallCtx| {
                let handler = handler.clone();
                async move {
                    let arg: A = ctx.input_payload().decode()?;
                    let codec = ctx.reply_codec();
                    let reply = handler(ctx, arg).await?;
                    Payload::encode(codec, &reply)
                }
            },
            plugins,
        )
    }

    pub fn route_push_payload<F, Fut>(
        &self,
        path: &str,
        handler: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(), Status>
    where
        F: Fn(PushCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        check_path(path)?;
        let name = self.full_path(path);
        if self.table.read().pushes.contains_key(&name) {
            return Err(conflict(&name));
        }
        let info = self.handler_info(name.clone(), HandlerKind::Push, plugins)?;
        let func: PushHandlerFn = Arc::new(move |ctx| handler(ctx).boxed());

        let mut table = self.table.write();
        if table.pushes.contains_key(&name) {
            return Err(conflict(&name));
        }
        debug!(route = %name, "registered push handler");
        table.pushes.insert(name, Arc::new(PushHandler { info, func }));
        Ok(())
    }

    pub fn route_push<A, F, Fut>(
        &self,
        path: &str,
        handler: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(), Status>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.route_push_payload(
            path,
            move |ctx: PushCtx| {
                let handler = handler.clone();
                async move {
                    let arg: A = ctx.input_payload().decode()?;
                    handler(ctx, arg).await
                }
            },
            plugins,
        )
    }

    /// Handler for calls to unregistered paths.
    pub fn set_unknown_call<F, Fut>(
        &self,
        handler: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(), Status>
    where
        F: Fn(CallCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Status>> + Send + 'static,
    {
        let info = self.handler_info(self.full_path("/*"), HandlerKind::UnknownCall, plugins)?;
        let func: CallHandlerFn = Arc::new(move |ctx| handler(ctx).boxed());
        self.table.write().unknown_call = Some(Arc::new(CallHandler { info, func }));
        Ok(())
    }

    /// Handler for pushes to unregistered paths.
    pub fn set_unknown_push<F, Fut>(
        &self,
        handler: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<(), Status>
    where
        F: Fn(PushCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let info = self.handler_info(self.full_path("/*"), HandlerKind::UnknownPush, plugins)?;
        let func: PushHandlerFn = Arc::new(move |ctx| handler(ctx).boxed());
        self.table.write().unknown_push = Some(Arc::new(PushHandler { info, func }));
        Ok(())
    }

    /// Registered call and push paths, sorted.
    pub fn routes(&self) -> Vec<String> {
        let table = self.table.read();
        let mut out: Vec<String> = table
            .calls
            .keys()
            .chain(table.pushes.keys())
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub(crate) fn lookup_call(&self, path: &str) -> Result<Arc<CallHandler>, Status> {
        let table = self.table.read();
        table
            .calls
            .get(path)
            .or(table.unknown_call.as_ref())
            .cloned()
            .ok_or_else(|| Status::not_found(path.to_string()))
    }

    pub(crate) fn lookup_push(&self, path: &str) -> Result<Arc<PushHandler>, Status> {
        let table = self.table.read();
        table
            .pushes
            .get(path)
            .or(table.unknown_push.as_ref())
            .cloned()
            .ok_or_else(|| Status::not_found(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{AfterRegRouter, Hooks};

    struct Named(&'static str);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn register(self: Arc<Self>, _hooks: &mut Hooks) {}
    }

    struct Veto;

    impl Plugin for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        fn register(self: Arc<Self>, hooks: &mut Hooks) {
            hooks.after_reg_router(self);
        }
    }

    impl AfterRegRouter for Veto {
        fn after_reg_router(&self, handler: &HandlerInfo) -> Result<(), Status> {
            if handler.name().contains("forbidden") {
                return Err(Status::with_code(Code::CONFLICT).with_cause("vetoed"));
            }
            Ok(())
        }
    }

    async fn add(_ctx: CallCtx, args: Vec<i32>) -> Result<i32, Status> {
        Ok(args.iter().sum())
    }

    #[test]
    fn test_paths_and_conflicts() {
        let router = Router::new(Arc::new(PluginContainer::new()));
        router.route_call("/math/add", add, vec![]).unwrap();
        let err = router.route_call("/math/add", add, vec![]).unwrap_err();
        assert_eq!(err.code(), Code::CONFLICT);

        // a call and a push may share a path
        router
            .route_push("/math/add", |_ctx: PushCtx, _n: i32| async { Ok(()) }, vec![])
            .unwrap();

        assert!(router.route_call("math/sub", add, vec![]).is_err());
        assert!(router.route_call("/a?b=1", add, vec![]).is_err());

        let sub = router.sub_route("/home", vec![]).unwrap();
        sub.route_call("/test", add, vec![]).unwrap();
        sub.sub_route("/deep", vec![])
            .unwrap()
            .route_call("/x/", add, vec![])
            .unwrap();

        assert_eq!(
            router.routes(),
            vec!["/home/deep/x", "/home/test", "/math/add"]
        );
        assert!(router.lookup_call("/home/test").is_ok());
        assert_eq!(
            router.lookup_call("/nope").err().map(|e| e.code()),
            Some(Code::NOT_FOUND)
        );
    }

    #[test]
    fn test_unknown_fallback() {
        let router = Router::new(Arc::new(PluginContainer::new()));
        assert!(router.lookup_push("/x").is_err());
        router
            .set_unknown_push(|_ctx: PushCtx| async { Ok(()) }, vec![])
            .unwrap();
        let handler = router.lookup_push("/x").ok().unwrap();
        assert_eq!(handler.info.kind(), HandlerKind::UnknownPush);
    }

    #[test]
    fn test_route_plugins() {
        let mut base = PluginContainer::new();
        base.append_right(Arc::new(Named("base"))).unwrap();
        base.append_right(Arc::new(Veto)).unwrap();
        let router = Router::new(Arc::new(base));

        router
            .route_call("/plain", add, vec![Arc::new(Named("route"))])
            .unwrap();
        let handler = router.lookup_call("/plain").ok().unwrap();
        assert_eq!(handler.info.plugins().names(), vec!["base", "veto", "route"]);

        let sub = router.sub_route("/group", vec![Arc::new(Named("group"))]).unwrap();
        sub.route_call("/x", add, vec![]).unwrap();
        let handler = router.lookup_call("/group/x").ok().unwrap();
        assert_eq!(handler.info.plugins().names(), vec!["base", "veto", "group"]);

        let err = router.route_call("/forbidden", add, vec![]).unwrap_err();
        assert_eq!(err.cause(), Some("vetoed"));
        assert!(router.lookup_call("/forbidden").is_err());

        // plugin names stay unique along the route
        assert!(
            router
                .route_call("/dup", add, vec![Arc::new(Named("base"))])
                .is_err()
        );
    }
}
