// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Sessions: one logical connection with call bookkeeping.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tern_config::backoff::Strategy;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Codec, Payload};
use crate::endpoint::{Endpoint, EndpointInner};
use crate::message::{Message, MessageSetting, MessageType, Meta};
use crate::plugin::{PluginContainer, ReadCtx, WriteCtx, panic_text};
use crate::proto::{Proto, ProtoFunc};
use crate::router::{CallCtx, PushCtx};
use crate::status::{Code, Status, is_conn_error};
use crate::transport::Conn;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens a new connection for a dialed session.
pub(crate) type Redialer = Arc<dyn Fn() -> BoxFuture<'static, Result<Conn, Status>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Preparing = 0,
    Active = 1,
    Redialing = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Preparing,
            1 => SessionState::Active,
            2 => SessionState::Redialing,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

struct CallOutcome {
    status: Status,
    payload: Payload,
    meta: Meta,
    cost: Duration,
}

struct CallCmdInner {
    seq: i32,
    service_method: String,
    output_meta: Mutex<Meta>,
    outcome: Mutex<Option<CallOutcome>>,
    done: watch::Sender<bool>,
    notify: Option<mpsc::Sender<CallCmd>>,
    start: Instant,
}

/// Handle on an outgoing call. Completes exactly once.
#[derive(Clone)]
pub struct CallCmd {
    inner: Arc<CallCmdInner>,
}

impl fmt::Debug for CallCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCmd")
            .field("seq", &self.inner.seq)
            .field("service_method", &self.inner.service_method)
            .field("done", &self.is_done())
            .finish()
    }
}

impl CallCmd {
    fn new(seq: i32, service_method: &str, notify: Option<mpsc::Sender<CallCmd>>) -> Self {
        let (done, _) = watch::channel(false);
        CallCmd {
            inner: Arc::new(CallCmdInner {
                seq,
                service_method: service_method.to_string(),
                output_meta: Mutex::new(Meta::new()),
                outcome: Mutex::new(None),
                done,
                notify,
                start: Instant::now(),
            }),
        }
    }

    fn failed(seq: i32, service_method: &str, notify: Option<mpsc::Sender<CallCmd>>, st: Status) -> Self {
        let cmd = CallCmd::new(seq, service_method, notify);
        cmd.complete(st, Payload::empty(), Meta::new());
        cmd
    }

    /// Record the outcome; later completions are ignored.
    pub(crate) fn complete(&self, status: Status, payload: Payload, meta: Meta) -> bool {
        {
            let mut outcome = self.inner.outcome.lock();
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(CallOutcome {
                status,
                payload,
                meta,
                cost: self.inner.start.elapsed(),
            });
        }
        self.inner.done.send_replace(true);

        if let Some(notify) = &self.inner.notify {
            match notify.try_send(self.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(seq = self.inner.seq, "async call done channel is full, dropping notification")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(seq = self.inner.seq, "async call done channel closed")
                }
            }
        }
        true
    }

    pub fn seq(&self) -> i32 {
        self.inner.seq
    }

    pub fn service_method(&self) -> &str {
        &self.inner.service_method
    }

    /// Meta of the call as written, after the write hooks ran.
    pub fn output_meta(&self) -> Meta {
        self.inner.output_meta.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    /// Wait for completion.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn status(&self) -> Status {
        match &*self.inner.outcome.lock() {
            Some(outcome) => outcome.status.clone(),
            None => Status::with_code(Code::UNKNOWN_ERROR).with_cause("call not done"),
        }
    }

    /// Decode the reply body, or return the failure status.
    pub fn result<T: DeserializeOwned>(&self) -> Result<T, Status> {
        let status = self.status();
        if !status.is_ok() {
            return Err(status);
        }
        self.reply_payload().decode()
    }

    pub fn reply_payload(&self) -> Payload {
        self.inner
            .outcome
            .lock()
            .as_ref()
            .map(|o| o.payload.clone())
            .unwrap_or_default()
    }

    pub fn reply_meta(&self) -> Meta {
        self.inner
            .outcome
            .lock()
            .as_ref()
            .map(|o| o.meta.clone())
            .unwrap_or_default()
    }

    /// Time from creation to completion.
    pub fn cost(&self) -> Option<Duration> {
        self.inner.outcome.lock().as_ref().map(|o| o.cost)
    }
}

#[derive(Clone)]
struct Link {
    proto: Arc<dyn Proto>,
    generation: u64,
    token: CancellationToken,
}

pub(crate) struct SessionInner {
    id: RwLock<String>,
    endpoint: Arc<EndpointInner>,
    proto_func: ProtoFunc,
    link: RwLock<Option<Link>>,
    generation: AtomicU64,
    local_addr: RwLock<Option<String>>,
    peer_addr: RwLock<Option<String>>,
    seq: AtomicI32,
    pending: Mutex<HashMap<i32, CallCmd>>,
    swap: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    state: AtomicU8,
    redial_lock: tokio::sync::Mutex<()>,
    redialer: Option<Redialer>,
    early_sent: AtomicBool,
    early_received: AtomicBool,
    close_token: CancellationToken,
    created: Instant,
}

/// One logical connection. Clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        endpoint: Arc<EndpointInner>,
        proto_func: ProtoFunc,
        conn: Conn,
        redialer: Option<Redialer>,
    ) -> Result<Session, Status> {
        let local = conn.local_addr().map(String::from);
        let peer = conn.peer_addr().map(String::from);
        let proto: Arc<dyn Proto> = Arc::from(proto_func(conn)?);

        Ok(Session {
            inner: Arc::new(SessionInner {
                id: RwLock::new(peer.clone().unwrap_or_default()),
                endpoint,
                proto_func,
                link: RwLock::new(Some(Link {
                    proto,
                    generation: 0,
                    token: CancellationToken::new(),
                })),
                generation: AtomicU64::new(0),
                local_addr: RwLock::new(local),
                peer_addr: RwLock::new(peer),
                seq: AtomicI32::new(0),
                pending: Mutex::new(HashMap::new()),
                swap: RwLock::new(HashMap::new()),
                state: AtomicU8::new(SessionState::Preparing as u8),
                redial_lock: tokio::sync::Mutex::new(()),
                redialer,
                early_sent: AtomicBool::new(false),
                early_received: AtomicBool::new(false),
                close_token: CancellationToken::new(),
                created: Instant::now(),
            }),
        })
    }

    pub fn id(&self) -> String {
        self.inner.id.read().clone()
    }

    /// Rename the session, keeping the endpoint index in sync.
    pub fn set_id(&self, id: impl Into<String>) {
        let id = id.into();
        let old = std::mem::replace(&mut *self.inner.id.write(), id.clone());
        if old != id {
            self.inner.endpoint.rename_session(&old, self);
        }
    }

    pub(crate) fn set_id_unindexed(&self, id: String) {
        *self.inner.id.write() = id;
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_inner(self.inner.endpoint.clone())
    }

    pub fn local_addr(&self) -> Option<String> {
        self.inner.local_addr.read().clone()
    }

    pub fn peer_addr(&self) -> Option<String> {
        self.inner.peer_addr.read().clone()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// True while the session is active.
    pub fn health(&self) -> bool {
        self.state() == SessionState::Active
    }

    fn is_closing(&self) -> bool {
        self.state() >= SessionState::Closing
    }

    /// Token cancelled when the session closes.
    pub fn close_notify(&self) -> CancellationToken {
        self.inner.close_token.clone()
    }

    /// Protocol id and name of the current connection.
    pub fn proto_version(&self) -> Option<(u8, &'static str)> {
        self.inner.link.read().as_ref().map(|l| l.proto.version())
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.inner.created.elapsed()
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn swap_store<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.swap.write().insert(key.into(), Arc::new(value));
    }

    pub fn swap_load<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.swap.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Value under `key`, storing `init()` first when the key is empty, in
    /// one step. `None` when the key holds a value of another type.
    pub fn swap_get_or_insert_with<T: Any + Send + Sync>(
        &self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Option<Arc<T>> {
        let value = self
            .inner
            .swap
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>)
            .clone();
        value.downcast::<T>().ok()
    }

    pub fn swap_remove(&self, key: &str) -> bool {
        self.inner.swap.write().remove(key).is_some()
    }

    pub fn swap_len(&self) -> usize {
        self.inner.swap.read().len()
    }

    fn plugins(&self) -> &Arc<PluginContainer> {
        &self.inner.endpoint.plugins
    }

    fn current_link(&self) -> Option<Link> {
        self.inner.link.read().clone()
    }

    /// Current connection, waiting out a redial in progress including its
    /// handshake. The link is only missing while `redial_lock` is held or
    /// once the session is closing, so `None` means closed.
    async fn wait_link(&self) -> Option<Link> {
        let missing = || self.current_link().is_none() && !self.is_closing();
        if self.state() == SessionState::Redialing || missing() {
            drop(self.inner.redial_lock.lock().await);
        }
        self.current_link()
    }

    fn closed_status() -> Status {
        Status::conn_closed("session closed")
    }

    fn next_seq(&self) -> i32 {
        let pending = self.inner.pending.lock();
        loop {
            let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if !pending.contains_key(&seq) {
                return seq;
            }
        }
    }

    fn build_message(
        &self,
        mtype: MessageType,
        service_method: &str,
        settings: Vec<MessageSetting>,
    ) -> Message {
        let mut msg = self.inner.endpoint.pool.acquire();
        msg.set_mtype(mtype);
        msg.set_service_method(service_method);
        for setting in settings {
            setting(&mut msg);
        }
        msg
    }

    fn encode_arg<A: Serialize + ?Sized>(&self, msg: &mut Message, arg: &A) -> Result<(), Status> {
        msg.encode_body(arg, self.inner.endpoint.default_codec)
    }

    /// Call and wait for the reply.
    pub async fn call<A: Serialize + Sync + ?Sized>(
        &self,
        service_method: &str,
        arg: &A,
        settings: Vec<MessageSetting>,
    ) -> CallCmd {
        let cmd = self.async_call(service_method, arg, settings, None).await;
        cmd.done().await;
        cmd
    }

    pub async fn call_payload(
        &self,
        service_method: &str,
        payload: Payload,
        settings: Vec<MessageSetting>,
    ) -> CallCmd {
        let cmd = self
            .async_call_payload(service_method, payload, settings, None)
            .await;
        cmd.done().await;
        cmd
    }

    /// Send a call and return once it is written. The command completes
    /// later and, when given, is also sent on `notify`.
    pub async fn async_call<A: Serialize + Sync + ?Sized>(
        &self,
        service_method: &str,
        arg: &A,
        settings: Vec<MessageSetting>,
        notify: Option<mpsc::Sender<CallCmd>>,
    ) -> CallCmd {
        let mut msg = self.build_message(MessageType::Call, service_method, settings);
        if let Err(st) = self.encode_arg(&mut msg, arg) {
            self.inner.endpoint.pool.release(msg);
            return CallCmd::failed(0, service_method, notify, st);
        }
        self.send_call(msg, notify).await
    }

    pub async fn async_call_payload(
        &self,
        service_method: &str,
        payload: Payload,
        settings: Vec<MessageSetting>,
        notify: Option<mpsc::Sender<CallCmd>>,
    ) -> CallCmd {
        let mut msg = self.build_message(MessageType::Call, service_method, settings);
        msg.set_payload(payload);
        self.send_call(msg, notify).await
    }

    async fn send_call(&self, mut msg: Message, notify: Option<mpsc::Sender<CallCmd>>) -> CallCmd {
        let seq = self.next_seq();
        msg.set_seq(seq);
        let service_method = msg.service_method().to_string();
        let context_age = msg
            .context_age()
            .or_else(|| self.inner.endpoint.config.context_age());

        if self.is_closing() {
            self.inner.endpoint.pool.release(msg);
            return CallCmd::failed(seq, &service_method, notify, Self::closed_status());
        }

        let cmd = CallCmd::new(seq, &service_method, notify);
        let plugins = self.plugins().clone();

        let before = {
            let mut ctx = WriteCtx::new(self, &mut msg, None);
            plugins.before_write_call(&mut ctx)
        };
        if let Err(st) = before {
            self.inner.endpoint.pool.release(msg);
            cmd.complete(st, Payload::empty(), Meta::new());
            return cmd;
        }

        *cmd.inner.output_meta.lock() = msg.meta().clone();
        self.inner.pending.lock().insert(seq, cmd.clone());

        let written = match self.write_message(&mut msg, Some(seq)).await {
            Ok(()) => {
                let mut ctx = WriteCtx::new(self, &mut msg, None);
                plugins.after_write_call(&mut ctx)
            }
            Err(st) => Err(st),
        };
        self.inner.endpoint.pool.release(msg);

        if let Err(st) = written {
            self.inner.pending.lock().remove(&seq);
            cmd.complete(st, Payload::empty(), Meta::new());
            return cmd;
        }

        if let Some(age) = context_age {
            let session = self.clone();
            let timed = cmd.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timed.done() => {}
                    _ = tokio::time::sleep(age) => {
                        if session.inner.pending.lock().remove(&seq).is_some() {
                            let st = Status::with_code(Code::HANDLE_TIMEOUT)
                                .with_cause(format!("no reply within {:?}", age));
                            timed.complete(st, Payload::empty(), Meta::new());
                        }
                    }
                }
            });
        }
        cmd
    }

    /// Send a message without waiting for any reply.
    pub async fn push<A: Serialize + Sync + ?Sized>(
        &self,
        service_method: &str,
        arg: &A,
        settings: Vec<MessageSetting>,
    ) -> Result<(), Status> {
        let mut msg = self.build_message(MessageType::Push, service_method, settings);
        let res = match self.encode_arg(&mut msg, arg) {
            Ok(()) => self.send_push(&mut msg).await,
            Err(st) => Err(st),
        };
        self.inner.endpoint.pool.release(msg);
        res
    }

    pub async fn push_payload(
        &self,
        service_method: &str,
        payload: Payload,
        settings: Vec<MessageSetting>,
    ) -> Result<(), Status> {
        let mut msg = self.build_message(MessageType::Push, service_method, settings);
        msg.set_payload(payload);
        let res = self.send_push(&mut msg).await;
        self.inner.endpoint.pool.release(msg);
        res
    }

    async fn send_push(&self, msg: &mut Message) -> Result<(), Status> {
        if self.is_closing() {
            return Err(Self::closed_status());
        }
        msg.set_seq(self.next_seq());
        let plugins = self.plugins().clone();
        plugins.before_write_push(&mut WriteCtx::new(self, msg, None))?;
        self.write_message(msg, None).await?;
        plugins.after_write_push(&mut WriteCtx::new(self, msg, None))
    }

    /// Write a handshake message before the session is active. Allowed once
    /// per connection.
    pub async fn early_send(
        &self,
        mtype: MessageType,
        service_method: &str,
        payload: Payload,
        settings: Vec<MessageSetting>,
    ) -> Result<(), Status> {
        if !matches!(mtype, MessageType::AuthCall | MessageType::AuthReply) {
            return Err(Status::with_code(Code::MTYPE_NOT_ALLOWED)
                .with_cause(format!("early send does not carry {}", mtype)));
        }
        self.check_early()?;
        if self.inner.early_sent.swap(true, Ordering::SeqCst) {
            return Err(Status::with_code(Code::CONFLICT).with_cause("early send: multiple call"));
        }

        let link = self.current_link().ok_or_else(Self::closed_status)?;
        let mut msg = self.inner.endpoint.pool.acquire();
        msg.set_seq(self.next_seq());
        msg.set_mtype(mtype);
        msg.set_service_method(service_method);
        msg.set_payload(payload);
        for setting in settings {
            setting(&mut msg);
        }
        let res = link.proto.pack(&mut msg).await;
        self.inner.endpoint.pool.release(msg);
        res
    }

    /// Read the next message before the session is active; it must be of
    /// type `mtype`. Allowed once per connection.
    pub async fn early_receive(&self, mtype: MessageType) -> Result<Message, Status> {
        self.check_early()?;
        if self.inner.early_received.swap(true, Ordering::SeqCst) {
            return Err(
                Status::with_code(Code::CONFLICT).with_cause("early receive: multiple call")
            );
        }

        let link = self.current_link().ok_or_else(Self::closed_status)?;
        let mut msg = self.inner.endpoint.pool.acquire();
        let timeout = self.inner.endpoint.config.dial_timeout;
        let res = tokio::select! {
            _ = self.inner.close_token.cancelled() => Err(Self::closed_status()),
            _ = link.token.cancelled() => Err(Self::closed_status()),
            r = tokio::time::timeout(timeout, link.proto.unpack(&mut msg)) => match r {
                Ok(r) => r,
                Err(_) => Err(Status::with_code(Code::HANDLE_TIMEOUT)
                    .with_cause(format!("no handshake message within {:?}", timeout))),
            },
        };
        if let Err(st) = res {
            self.inner.endpoint.pool.release(msg);
            return Err(st);
        }
        if msg.mtype() != mtype {
            let st = Status::bad_message(format!(
                "unexpected message type: want {}, got {}",
                mtype,
                msg.mtype()
            ));
            self.inner.endpoint.pool.release(msg);
            return Err(st);
        }
        Ok(msg)
    }

    fn check_early(&self) -> Result<(), Status> {
        match self.state() {
            SessionState::Preparing | SessionState::Redialing => Ok(()),
            SessionState::Active => Err(Status::with_code(Code::CONFLICT)
                .with_cause("handshake messages are only allowed before the session is active")),
            _ => Err(Self::closed_status()),
        }
    }

    /// Pack `msg` on the current connection. A transport failure on a
    /// dialed session triggers one redial and one retry; `keep` names a
    /// pending call the redial must not fail.
    async fn write_message(&self, msg: &mut Message, keep: Option<i32>) -> Result<(), Status> {
        let link = self.wait_link().await.ok_or_else(Self::closed_status)?;
        match link.proto.pack(msg).await {
            Err(st) if is_conn_error(&st) && self.inner.redialer.is_some() && !self.is_closing() => {
                debug!(session = %self.id(), error = %st, "write failed, redialing");
                self.redial(link.generation, keep).await?;
                let link = self.wait_link().await.ok_or_else(Self::closed_status)?;
                link.proto.pack(msg).await
            }
            res => res,
        }
    }

    fn fail_pending(&self, status: &Status, keep: Option<i32>) {
        let failed: Vec<CallCmd> = {
            let mut pending = self.inner.pending.lock();
            let seqs: Vec<i32> = pending
                .keys()
                .copied()
                .filter(|seq| Some(*seq) != keep)
                .collect();
            seqs.iter().filter_map(|seq| pending.remove(seq)).collect()
        };
        for cmd in failed {
            cmd.complete(status.clone(), Payload::empty(), Meta::new());
        }
    }

    /// Replace a broken connection. Returns once a new connection is
    /// active, or fails and closes the session when attempts run out.
    async fn redial(&self, failed_generation: u64, keep: Option<i32>) -> Result<(), Status> {
        let redialer = self
            .inner
            .redialer
            .clone()
            .ok_or_else(|| Status::conn_closed("session was not dialed"))?;

        let guard = self.inner.redial_lock.lock().await;
        if self.is_closing() {
            return Err(Self::closed_status());
        }
        if self.current_link().map(|l| l.generation) != Some(failed_generation) {
            // replaced while waiting for the lock
            return Ok(());
        }

        self.set_state(SessionState::Redialing);
        self.fail_pending(&Status::conn_closed("connection lost, redialing"), keep);
        let old = self.inner.link.write().take();
        if let Some(old) = old {
            old.token.cancel();
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, old.proto.close()).await;
        }

        let config = &self.inner.endpoint.config;
        for (attempt, delay) in config.redial_strategy().get_strategy().enumerate() {
            tokio::select! {
                _ = self.inner.close_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.reconnect(&redialer).await {
                Ok(()) => {
                    self.set_state(SessionState::Active);
                    info!(session = %self.id(), attempt = attempt + 1, "session redialed");
                    return Ok(());
                }
                Err(st) => {
                    warn!(session = %self.id(), attempt = attempt + 1, error = %st, "redial failed")
                }
            }
        }

        let st = Status::conn_closed("redial attempts exhausted");
        warn!(session = %self.id(), "{}", st);
        // waiters must never see a live session without a link
        self.close().await;
        drop(guard);
        Err(st)
    }

    async fn reconnect(&self, redialer: &Redialer) -> Result<(), Status> {
        let conn = redialer().await?;
        let local = conn.local_addr().map(String::from);
        let peer = conn.peer_addr().map(String::from);
        let proto: Arc<dyn Proto> = Arc::from((self.inner.proto_func)(conn)?);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.inner.link.write() = Some(Link {
            proto,
            generation,
            token: CancellationToken::new(),
        });
        *self.inner.local_addr.write() = local;
        *self.inner.peer_addr.write() = peer;
        self.inner.early_sent.store(false, Ordering::SeqCst);
        self.inner.early_received.store(false, Ordering::SeqCst);

        if let Err(st) = self.plugins().after_dial(self, true).await {
            let link = self.inner.link.write().take();
            if let Some(link) = link {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, link.proto.close()).await;
            }
            return Err(st);
        }
        Ok(())
    }

    /// Close the session: fail pending calls, close the transport, leave the
    /// endpoint and run the disconnect hooks. Idempotent.
    pub async fn close(&self) {
        let closing = self
            .inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if s >= SessionState::Closing as u8 {
                    None
                } else {
                    Some(SessionState::Closing as u8)
                }
            });
        if closing.is_err() {
            return;
        }

        self.inner.close_token.cancel();
        self.fail_pending(&Self::closed_status(), None);
        let link = self.inner.link.write().take();
        if let Some(link) = link {
            link.token.cancel();
            match tokio::time::timeout(CLOSE_TIMEOUT, link.proto.close()).await {
                Ok(Err(st)) => debug!(session = %self.id(), error = %st, "error closing transport"),
                Err(_) => debug!(session = %self.id(), "timeout closing transport"),
                Ok(Ok(())) => {}
            }
        }
        self.inner.endpoint.remove_session(self);
        self.set_state(SessionState::Closed);

        if let Err(st) = self.plugins().after_disconnect(self).await {
            warn!(session = %self.id(), error = %st, "disconnect hook failed");
        }
        info!(session = %self.id(), "session closed");
    }

    /// Mark the session active and start serving it.
    pub(crate) fn activate(&self, watch: drain::Watch) {
        self.set_state(SessionState::Active);

        if let Some(age) = self.inner.endpoint.config.session_age() {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = session.inner.close_token.cancelled() => {}
                    _ = tokio::time::sleep(age) => {
                        debug!(session = %session.id(), ?age, "session age reached");
                        session.close().await;
                    }
                }
            });
        }

        let session = self.clone();
        tokio::spawn(async move { session.read_loop(watch).await });
    }

    async fn read_loop(self, watch: drain::Watch) {
        let mut shutdown = std::pin::pin!(watch.signaled());

        loop {
            let Some(link) = self.wait_link().await else {
                break;
            };

            let mut msg = self.inner.endpoint.pool.acquire();
            let res = tokio::select! {
                _ = self.inner.close_token.cancelled() => break,
                _ = &mut shutdown => {
                    debug!(session = %self.id(), "endpoint shutting down");
                    self.close().await;
                    break;
                }
                _ = link.token.cancelled() => continue,
                res = link.proto.unpack(&mut msg) => res,
            };

            match res {
                Ok(()) => self.dispatch(msg),
                Err(st) => {
                    self.inner.endpoint.pool.release(msg);
                    if self.is_closing() {
                        break;
                    }
                    if is_conn_error(&st) {
                        if self.inner.redialer.is_some()
                            && self.inner.endpoint.config.redial_enabled()
                            && self.redial(link.generation, None).await.is_ok()
                        {
                            continue;
                        }
                        debug!(session = %self.id(), error = %st, "connection lost");
                    } else {
                        warn!(session = %self.id(), error = %st, "unreadable message, closing session");
                    }
                    self.close().await;
                    break;
                }
            }
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.mtype() {
            MessageType::Reply => self.handle_reply(msg),
            MessageType::Call => self.handle_call(msg),
            MessageType::Push => self.handle_push(msg),
            MessageType::AuthCall => {
                let st = Status::with_code(Code::MTYPE_NOT_ALLOWED)
                    .with_cause("handshake already completed");
                self.spawn_status_reply(msg, MessageType::AuthReply, st);
            }
            other => {
                debug!(session = %self.id(), mtype = %other, seq = msg.seq(), "dropping unexpected message");
                self.inner.endpoint.pool.release(msg);
            }
        }
    }

    fn handle_reply(&self, mut msg: Message) {
        let cmd = self.inner.pending.lock().remove(&msg.seq());
        let Some(cmd) = cmd else {
            debug!(session = %self.id(), seq = msg.seq(), "reply without pending call, dropped");
            self.inner.endpoint.pool.release(msg);
            return;
        };

        let call_meta = cmd.output_meta();
        let plugins = self.plugins().clone();
        let hooks = {
            let mut ctx = ReadCtx::new(self, &mut msg, Some(&call_meta));
            plugins
                .after_read_reply_header(&mut ctx)
                .and_then(|_| plugins.before_read_reply_body(&mut ctx))
                .and_then(|_| plugins.after_read_reply_body(&mut ctx))
        };
        let status = match hooks {
            Ok(()) => msg.take_status(),
            Err(st) => st,
        };

        cmd.complete(status, msg.payload(), msg.meta().clone());
        self.inner.endpoint.pool.release(msg);
        self.log_call("call", &cmd);
    }

    fn spawn_status_reply(&self, msg: Message, mtype: MessageType, status: Status) {
        let session = self.clone();
        let plugins = self.plugins().clone();
        tokio::spawn(async move {
            session
                .write_reply(
                    msg.seq(),
                    mtype,
                    msg.service_method(),
                    Meta::new(),
                    Err(status),
                    msg.meta(),
                    &plugins,
                )
                .await;
            session.inner.endpoint.pool.release(msg);
        });
    }

    fn handle_call(&self, mut msg: Message) {
        let ep = self.inner.endpoint.clone();
        let header = {
            let mut ctx = ReadCtx::new(self, &mut msg, None);
            ep.plugins.after_read_call_header(&mut ctx)
        };
        let handler = match header.and_then(|_| ep.router.lookup_call(msg.path())) {
            Ok(handler) => handler,
            Err(st) => {
                debug!(session = %self.id(), path = %msg.path(), error = %st, "call rejected");
                self.spawn_status_reply(msg, MessageType::Reply, st);
                return;
            }
        };

        let plugins = handler.info.plugins().clone();
        let body = {
            let mut ctx = ReadCtx::new(self, &mut msg, None);
            plugins
                .before_read_call_body(&mut ctx)
                .and_then(|_| plugins.after_read_call_body(&mut ctx))
        };
        if let Err(st) = body {
            self.spawn_status_reply(msg, MessageType::Reply, st);
            return;
        }

        let ctx = CallCtx::new(self.clone(), &msg, ep.default_codec);
        let seq = msg.seq();
        let service_method = msg.service_method().to_string();
        let input_meta = msg.meta().clone();
        ep.pool.release(msg);

        let session = self.clone();
        let age = ep.config.context_age();
        tokio::spawn(async move {
            let start = Instant::now();
            let name = handler.info.name();
            let result = run_handler(name, (handler.func)(ctx.clone()), age).await;
            let meta = ctx.take_reply_meta();
            session
                .write_reply(
                    seq,
                    MessageType::Reply,
                    &service_method,
                    meta,
                    result,
                    &input_meta,
                    &plugins,
                )
                .await;
            session.log_handled(seq, &service_method, start.elapsed());
        });
    }

    fn handle_push(&self, mut msg: Message) {
        let ep = self.inner.endpoint.clone();
        let header = {
            let mut ctx = ReadCtx::new(self, &mut msg, None);
            ep.plugins.after_read_push_header(&mut ctx)
        };
        let handler = match header.and_then(|_| ep.router.lookup_push(msg.path())) {
            Ok(handler) => handler,
            Err(st) => {
                debug!(session = %self.id(), path = %msg.path(), error = %st, "push dropped");
                ep.pool.release(msg);
                return;
            }
        };

        let plugins = handler.info.plugins().clone();
        let body = {
            let mut ctx = ReadCtx::new(self, &mut msg, None);
            plugins
                .before_read_push_body(&mut ctx)
                .and_then(|_| plugins.after_read_push_body(&mut ctx))
        };
        if let Err(st) = body {
            debug!(session = %self.id(), path = %msg.path(), error = %st, "push dropped");
            ep.pool.release(msg);
            return;
        }

        let ctx = PushCtx::new(self.clone(), &msg);
        let seq = msg.seq();
        let service_method = msg.service_method().to_string();
        ep.pool.release(msg);

        let session = self.clone();
        let age = ep.config.context_age();
        tokio::spawn(async move {
            let start = Instant::now();
            if let Err(st) = run_handler(handler.info.name(), (handler.func)(ctx), age).await {
                warn!(session = %session.id(), %service_method, error = %st, "push handler failed");
            }
            session.log_handled(seq, &service_method, start.elapsed());
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_reply(
        &self,
        seq: i32,
        mtype: MessageType,
        service_method: &str,
        meta: Meta,
        result: Result<Payload, Status>,
        input_meta: &Meta,
        plugins: &PluginContainer,
    ) {
        let mut msg = self.inner.endpoint.pool.acquire();
        msg.set_seq(seq);
        msg.set_mtype(mtype);
        msg.set_service_method(service_method);
        msg.set_meta(meta);
        match result {
            Ok(payload) => msg.set_payload(payload),
            Err(st) => msg.set_status(&st),
        }

        let before = plugins.before_write_reply(&mut WriteCtx::new(self, &mut msg, Some(input_meta)));
        if let Err(st) = before {
            // the caller still gets an answer
            msg.set_body_codec(0);
            msg.set_body(Bytes::new());
            msg.pipe_mut().reset();
            msg.set_status(&st);
        }

        let res = match self.write_message(&mut msg, None).await {
            Ok(()) => plugins.after_write_reply(&mut WriteCtx::new(self, &mut msg, Some(input_meta))),
            Err(st) => Err(st),
        };
        if let Err(st) = res {
            warn!(session = %self.id(), seq, %service_method, error = %st, "failed to write reply");
        }
        self.inner.endpoint.pool.release(msg);
    }

    fn log_handled(&self, seq: i32, service_method: &str, cost: Duration) {
        let config = &self.inner.endpoint.config;
        if config.print_detail {
            info!(session = %self.id(), seq, %service_method, ?cost, "handled");
        }
        if let Some(slow) = config.slow_cost() {
            if cost > slow {
                warn!(session = %self.id(), seq, %service_method, ?cost, "slow handler");
            }
        }
    }

    fn log_call(&self, kind: &str, cmd: &CallCmd) {
        let config = &self.inner.endpoint.config;
        let cost = cmd.cost().unwrap_or_default();
        if config.print_detail {
            info!(
                session = %self.id(),
                seq = cmd.seq(),
                service_method = %cmd.service_method(),
                status = %cmd.status(),
                ?cost,
                "{} done",
                kind
            );
        }
        if let Some(slow) = config.slow_cost() {
            if cost > slow {
                warn!(session = %self.id(), seq = cmd.seq(), service_method = %cmd.service_method(), ?cost, "slow {}", kind);
            }
        }
    }
}

/// Run a handler future, turning panics and context age overruns into
/// statuses.
async fn run_handler<T>(
    name: &str,
    fut: BoxFuture<'static, Result<T, Status>>,
    age: Option<Duration>,
) -> Result<T, Status> {
    let guarded = AssertUnwindSafe(fut).catch_unwind();
    let outcome = match age {
        Some(age) => match tokio::time::timeout(age, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(Status::with_code(Code::HANDLE_TIMEOUT)
                    .with_cause(format!("{} did not finish within {:?}", name, age)));
            }
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|payload| {
        Err(Status::internal(format!(
            "handler {} panicked: {}",
            name,
            panic_text(payload.as_ref())
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_config::EndpointConfig;

    #[tokio::test]
    async fn test_call_cmd_completes_once() {
        let (tx, mut rx) = mpsc::channel(1);
        let cmd = CallCmd::new(7, "/a", Some(tx));
        assert!(!cmd.is_done());
        assert_eq!(cmd.status().code(), Code::UNKNOWN_ERROR);

        assert!(cmd.complete(Status::ok(), Payload::json(&3).unwrap(), Meta::new()));
        assert!(!cmd.complete(Status::conn_closed("late"), Payload::empty(), Meta::new()));

        cmd.done().await;
        assert!(cmd.status().is_ok());
        assert_eq!(cmd.result::<i32>().unwrap(), 3);
        assert!(cmd.cost().is_some());

        let notified = rx.recv().await.unwrap();
        assert_eq!(notified.seq(), 7);
    }

    #[tokio::test]
    async fn test_full_notify_channel_does_not_block() {
        let (tx, _rx) = mpsc::channel(1);
        let a = CallCmd::new(1, "/a", Some(tx.clone()));
        let b = CallCmd::new(2, "/a", Some(tx));
        a.complete(Status::ok(), Payload::empty(), Meta::new());
        b.complete(Status::ok(), Payload::empty(), Meta::new());
        b.done().await;
    }

    #[tokio::test]
    async fn test_run_handler_guards() {
        let res: Result<(), Status> = run_handler(
            "/boom",
            async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), Status>(())
            }
            .boxed(),
            None,
        )
        .await;
        let st = res.unwrap_err();
        assert_eq!(st.code(), Code::INTERNAL_SERVER_ERROR);
        assert_eq!(st.cause(), Some("handler /boom panicked: handler exploded"));

        let res: Result<(), Status> = run_handler(
            "/slow",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), Status>(())
            }
            .boxed(),
            Some(Duration::from_millis(20)),
        )
        .await;
        assert_eq!(res.unwrap_err().code(), Code::HANDLE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_wait_link_follows_redial() {
        let endpoint = Endpoint::builder(EndpointConfig::default()).build().unwrap();
        let (a, _b) = tokio::io::duplex(64);
        let session = endpoint.serve_conn(Conn::from_stream(a)).await.unwrap();
        assert_eq!(session.wait_link().await.map(|l| l.generation), Some(0));

        // a redial in progress: lock held, link taken
        let guard = session.inner.redial_lock.lock().await;
        session.set_state(SessionState::Redialing);
        let old = session.inner.link.write().take().unwrap();

        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.wait_link().await.map(|l| l.generation) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        *session.inner.link.write() = Some(Link { generation: 1, ..old });
        session.set_state(SessionState::Active);
        drop(guard);
        assert_eq!(waiter.await.unwrap(), Some(1));

        session.close().await;
        assert!(session.wait_link().await.is_none());
        endpoint.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_swap_get_or_insert_runs_init_once() {
        let endpoint = Endpoint::builder(EndpointConfig::default()).build().unwrap();
        let (a, _b) = tokio::io::duplex(64);
        let session = endpoint.serve_conn(Conn::from_stream(a)).await.unwrap();
        let inits = Arc::new(AtomicU64::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                let inits = inits.clone();
                tokio::spawn(async move {
                    session
                        .swap_get_or_insert_with("counter", || {
                            inits.fetch_add(1, Ordering::SeqCst);
                            AtomicU64::new(0)
                        })
                        .unwrap()
                        .fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        let counter = session.swap_load::<AtomicU64>("counter").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(session.swap_get_or_insert_with("counter", || "text").is_none());

        session.close().await;
        endpoint.close().await.unwrap();
    }
}
