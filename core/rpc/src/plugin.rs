// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Plugin hooks and the container running them.
//!
//! A plugin declares the hooks it implements when it is registered. Hooks run
//! in container order and the first failure stops the pipeline. A panicking
//! hook is turned into an internal error naming the plugin.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use crate::endpoint::Endpoint;
use crate::message::{Message, Meta};
use crate::router::HandlerInfo;
use crate::session::Session;
use crate::status::{Code, Status};

/// Context of the write hooks.
pub struct WriteCtx<'a> {
    session: &'a Session,
    output: &'a mut Message,
    input_meta: Option<&'a Meta>,
}

impl<'a> WriteCtx<'a> {
    pub fn new(session: &'a Session, output: &'a mut Message, input_meta: Option<&'a Meta>) -> Self {
        WriteCtx {
            session,
            output,
            input_meta,
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn output(&self) -> &Message {
        self.output
    }

    pub fn output_mut(&mut self) -> &mut Message {
        self.output
    }

    /// Meta of the request being answered; only set for replies.
    pub fn input_meta(&self) -> Option<&Meta> {
        self.input_meta
    }
}

/// Context of the read hooks.
pub struct ReadCtx<'a> {
    session: &'a Session,
    input: &'a mut Message,
    call_meta: Option<&'a Meta>,
}

impl<'a> ReadCtx<'a> {
    pub fn new(session: &'a Session, input: &'a mut Message, call_meta: Option<&'a Meta>) -> Self {
        ReadCtx {
            session,
            input,
            call_meta,
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn input(&self) -> &Message {
        self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        self.input
    }

    pub fn peek_meta(&self, key: &str) -> Option<&str> {
        self.input.meta().get(key)
    }

    /// Meta sent with the call a reply answers; only set for replies.
    pub fn call_meta(&self) -> Option<&Meta> {
        self.call_meta
    }

    /// Rewrite the routed service method, keeping the query string.
    pub fn reset_service_method(&mut self, path: &str) {
        let svc = match self.input.service_method().split_once('?') {
            Some((_, query)) => format!("{}?{}", path, query),
            None => path.to_string(),
        };
        self.input.set_service_method(svc);
    }
}

pub trait AfterNewEndpoint: Send + Sync {
    fn after_new_endpoint(&self, endpoint: &Endpoint) -> Result<(), Status>;
}

pub trait AfterRegRouter: Send + Sync {
    fn after_reg_router(&self, handler: &HandlerInfo) -> Result<(), Status>;
}

#[async_trait]
pub trait AfterListen: Send + Sync {
    async fn after_listen(&self, addr: &str) -> Result<(), Status>;
}

#[async_trait]
pub trait AfterDial: Send + Sync {
    async fn after_dial(&self, session: &Session, is_redial: bool) -> Result<(), Status>;
}

#[async_trait]
pub trait AfterAccept: Send + Sync {
    async fn after_accept(&self, session: &Session) -> Result<(), Status>;
}

#[async_trait]
pub trait AfterDisconnect: Send + Sync {
    async fn after_disconnect(&self, session: &Session) -> Result<(), Status>;
}

#[async_trait]
pub trait BeforeCloseEndpoint: Send + Sync {
    async fn before_close_endpoint(&self, endpoint: &Endpoint) -> Result<(), Status>;
}

pub trait Plugin: Send + Sync + 'static {
    /// Unique name inside a container.
    fn name(&self) -> &str;

    /// Declare the hooks this plugin implements.
    fn register(self: Arc<Self>, hooks: &mut Hooks);
}

pub(crate) fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panic_status(plugin: &str, hook: &str, payload: &(dyn Any + Send)) -> Status {
    let cause = format!("plugin {} panicked in {}: {}", plugin, hook, panic_text(payload));
    error!(%plugin, %hook, "{}", cause);
    Status::with_code(Code::INTERNAL_SERVER_ERROR).with_cause(cause)
}

fn guard_sync<F>(plugin: &str, hook: &str, f: F) -> Result<(), Status>
where
    F: FnOnce() -> Result<(), Status>,
{
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(panic_status(plugin, hook, payload.as_ref())))
}

async fn guard_async<F>(plugin: &str, hook: &str, fut: F) -> Result<(), Status>
where
    F: Future<Output = Result<(), Status>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panic_status(plugin, hook, payload.as_ref())))
}

macro_rules! hooks {
    (
        message { $( $mtrait:ident :: $mmethod:ident ( $ctx:ident ) ),* $(,)? }
        lifecycle { $( $ltrait:ident :: $lmethod:ident ),* $(,)? }
    ) => {
        $(
            pub trait $mtrait: Send + Sync {
                fn $mmethod(&self, ctx: &mut $ctx<'_>) -> Result<(), Status>;
            }
        )*

        /// Hooks declared by one plugin.
        #[derive(Default, Clone)]
        pub struct Hooks {
            $( $mmethod: Option<Arc<dyn $mtrait>>, )*
            $( $lmethod: Option<Arc<dyn $ltrait>>, )*
        }

        impl Hooks {
            $(
                pub fn $mmethod(&mut self, hook: Arc<dyn $mtrait>) -> &mut Self {
                    self.$mmethod = Some(hook);
                    self
                }
            )*
            $(
                pub fn $lmethod(&mut self, hook: Arc<dyn $ltrait>) -> &mut Self {
                    self.$lmethod = Some(hook);
                    self
                }
            )*

            /// Names of the declared hooks.
            pub fn declared(&self) -> Vec<&'static str> {
                let mut out = Vec::new();
                $( if self.$mmethod.is_some() { out.push(stringify!($mtrait)); } )*
                $( if self.$lmethod.is_some() { out.push(stringify!($ltrait)); } )*
                out
            }
        }

        impl PluginContainer {
            $(
                pub fn $mmethod(&self, ctx: &mut $ctx<'_>) -> Result<(), Status> {
                    for entry in &self.entries {
                        if let Some(hook) = &entry.hooks.$mmethod {
                            guard_sync(&entry.name, stringify!($mtrait), || hook.$mmethod(ctx))?;
                        }
                    }
                    Ok(())
                }
            )*
        }
    };
}

hooks! {
    message {
        BeforeWriteCall::before_write_call(WriteCtx),
        AfterWriteCall::after_write_call(WriteCtx),
        BeforeWritePush::before_write_push(WriteCtx),
        AfterWritePush::after_write_push(WriteCtx),
        BeforeWriteReply::before_write_reply(WriteCtx),
        AfterWriteReply::after_write_reply(WriteCtx),
        AfterReadCallHeader::after_read_call_header(ReadCtx),
        BeforeReadCallBody::before_read_call_body(ReadCtx),
        AfterReadCallBody::after_read_call_body(ReadCtx),
        AfterReadPushHeader::after_read_push_header(ReadCtx),
        BeforeReadPushBody::before_read_push_body(ReadCtx),
        AfterReadPushBody::after_read_push_body(ReadCtx),
        AfterReadReplyHeader::after_read_reply_header(ReadCtx),
        BeforeReadReplyBody::before_read_reply_body(ReadCtx),
        AfterReadReplyBody::after_read_reply_body(ReadCtx),
    }
    lifecycle {
        AfterNewEndpoint::after_new_endpoint,
        AfterRegRouter::after_reg_router,
        AfterListen::after_listen,
        AfterDial::after_dial,
        AfterAccept::after_accept,
        AfterDisconnect::after_disconnect,
        BeforeCloseEndpoint::before_close_endpoint,
    }
}

struct PluginEntry {
    name: String,
    plugin: Arc<dyn Plugin>,
    hooks: Hooks,
}

/// Ordered set of uniquely named plugins.
#[derive(Default, Clone)]
pub struct PluginContainer {
    entries: Vec<Arc<PluginEntry>>,
}

impl fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContainer")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginContainer {
    pub fn new() -> Self {
        PluginContainer::default()
    }

    fn entry(&self, plugin: Arc<dyn Plugin>) -> Result<Arc<PluginEntry>, Status> {
        let name = plugin.name().to_string();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Status::with_code(Code::CONFLICT)
                .with_cause(format!("plugin {} already registered", name)));
        }
        let mut hooks = Hooks::default();
        plugin.clone().register(&mut hooks);
        Ok(Arc::new(PluginEntry {
            name,
            plugin,
            hooks,
        }))
    }

    /// Add `plugin` after the registered ones.
    pub fn append_right(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), Status> {
        let entry = self.entry(plugin)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Add `plugin` before the registered ones.
    pub fn append_left(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), Status> {
        let entry = self.entry(plugin)?;
        self.entries.insert(0, entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Plugin>> {
        let pos = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(pos).plugin.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.plugin.clone())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of this container followed by `extra`.
    pub fn with_extra(&self, extra: Vec<Arc<dyn Plugin>>) -> Result<PluginContainer, Status> {
        let mut out = self.clone();
        for plugin in extra {
            out.append_right(plugin)?;
        }
        Ok(out)
    }

    pub fn after_new_endpoint(&self, endpoint: &Endpoint) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.after_new_endpoint {
                guard_sync(&entry.name, "AfterNewEndpoint", || {
                    hook.after_new_endpoint(endpoint)
                })?;
            }
        }
        Ok(())
    }

    pub fn after_reg_router(&self, handler: &HandlerInfo) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.after_reg_router {
                guard_sync(&entry.name, "AfterRegRouter", || hook.after_reg_router(handler))?;
            }
        }
        Ok(())
    }

    pub async fn after_listen(&self, addr: &str) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.after_listen {
                guard_async(&entry.name, "AfterListen", hook.after_listen(addr)).await?;
            }
        }
        Ok(())
    }

    pub async fn after_dial(&self, session: &Session, is_redial: bool) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.after_dial {
                guard_async(&entry.name, "AfterDial", hook.after_dial(session, is_redial)).await?;
            }
        }
        Ok(())
    }

    pub async fn after_accept(&self, session: &Session) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.after_accept {
                guard_async(&entry.name, "AfterAccept", hook.after_accept(session)).await?;
            }
        }
        Ok(())
    }

    pub async fn after_disconnect(&self, session: &Session) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.after_disconnect {
                guard_async(&entry.name, "AfterDisconnect", hook.after_disconnect(session))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn before_close_endpoint(&self, endpoint: &Endpoint) -> Result<(), Status> {
        for entry in &self.entries {
            if let Some(hook) = &entry.hooks.before_close_endpoint {
                guard_async(
                    &entry.name,
                    "BeforeCloseEndpoint",
                    hook.before_close_endpoint(endpoint),
                )
                .await?;
            }
        }
        Ok(())
    }
}
