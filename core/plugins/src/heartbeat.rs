// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Keep-alive between a pinging and a ponging endpoint.
//!
//! [`Ping`] sends a heartbeat on sessions that were quiet for its rate.
//! [`Pong`] answers heartbeats and closes sessions that stayed quiet for
//! twice the rate announced by the peer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tern::message::with_meta;
use tern::plugin::{
    AfterAccept, AfterDial, AfterNewEndpoint, AfterReadCallHeader, AfterReadPushHeader,
    AfterReadReplyHeader, AfterWriteCall, AfterWritePush, AfterWriteReply,
};
use tern::{CallCtx, Endpoint, Hooks, Payload, Plugin, PushCtx, ReadCtx, Session, Status, WriteCtx};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub const HEARTBEAT_SERVICE_METHOD: &str = "/heartbeat";
/// Meta key carrying the sender's rate in seconds.
pub const META_HEARTBEAT: &str = "X-Heartbeat";
pub const MIN_RATE: Duration = Duration::from_secs(3);

const SWAP_KEY: &str = "heartbeat";
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct StateInner {
    rate: Option<Duration>,
    last: Instant,
}

/// Heartbeat bookkeeping kept in the session swap.
#[derive(Debug)]
pub struct HeartbeatState {
    inner: Mutex<StateInner>,
}

impl HeartbeatState {
    fn new(rate: Option<Duration>) -> Self {
        HeartbeatState {
            inner: Mutex::new(StateInner {
                rate,
                last: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> Option<Duration> {
        self.inner.lock().rate
    }

    /// Last time a message went through the session.
    pub fn last(&self) -> Instant {
        self.inner.lock().last
    }

    fn set_rate(&self, rate: Duration) {
        self.inner.lock().rate = Some(rate);
    }

    fn touch(&self) {
        self.touch_at(Instant::now());
    }

    fn touch_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if now > inner.last {
            inner.last = now;
        }
    }

    /// `last + factor * rate` is at or before `now`.
    fn elapsed(&self, now: Instant, factor: u32) -> bool {
        let inner = self.inner.lock();
        match inner.rate {
            Some(rate) => inner.last + rate * factor <= now,
            None => false,
        }
    }
}

/// State of `session`, if a heartbeat plugin saw it.
pub fn heartbeat_state(session: &Session) -> Option<Arc<HeartbeatState>> {
    session.swap_load::<HeartbeatState>(SWAP_KEY)
}

fn state(session: &Session, rate: Option<Duration>) -> Arc<HeartbeatState> {
    session
        .swap_get_or_insert_with(SWAP_KEY, || HeartbeatState::new(rate))
        .unwrap_or_else(|| Arc::new(HeartbeatState::new(rate)))
}

fn clamp_rate(rate: Duration) -> Duration {
    if rate < MIN_RATE {
        warn!(?rate, min = ?MIN_RATE, "heartbeat rate too low, using the minimum");
        MIN_RATE
    } else {
        rate
    }
}

/// Client side: sends heartbeats.
#[derive(Debug, Clone)]
pub struct Ping {
    rate: Duration,
    use_call: bool,
}

impl Ping {
    /// Heartbeat every `rate` (at least [`MIN_RATE`]), as a call when
    /// `use_call` is set and as a push otherwise.
    pub fn new(rate: Duration, use_call: bool) -> Self {
        Ping {
            rate: clamp_rate(rate),
            use_call,
        }
    }

    pub fn rate(&self) -> Duration {
        self.rate
    }

    /// Send a heartbeat on every healthy session quiet since `now - rate`.
    /// Returns the number of heartbeats started.
    pub fn tick(&self, endpoint: &Endpoint, now: Instant) -> usize {
        let mut due = Vec::new();
        endpoint.range_session(|session| {
            if session.health() && state(session, Some(self.rate)).elapsed(now, 1) {
                due.push(session.clone());
            }
            true
        });

        for session in &due {
            state(session, Some(self.rate)).touch_at(now);
            let ping = self.clone();
            let session = session.clone();
            tokio::spawn(async move { ping.send(&session).await });
        }
        due.len()
    }

    async fn send(&self, session: &Session) {
        let rate = self.rate.as_secs().to_string();
        let settings = vec![with_meta(META_HEARTBEAT, rate)];
        let res = if self.use_call {
            let status = session
                .call_payload(HEARTBEAT_SERVICE_METHOD, Payload::empty(), settings)
                .await
                .status();
            if status.is_ok() {
                Ok(())
            } else {
                Err(status)
            }
        } else {
            session
                .push_payload(HEARTBEAT_SERVICE_METHOD, Payload::empty(), settings)
                .await
        };
        match res {
            Ok(()) => debug!(session = %session.id(), "heartbeat sent"),
            Err(st) => warn!(session = %session.id(), error = %st, "heartbeat failed"),
        }
    }

    fn touch(&self, session: &Session) {
        state(session, Some(self.rate)).touch();
    }
}

impl Plugin for Ping {
    fn name(&self) -> &str {
        "heartbeat-ping"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks
            .after_new_endpoint(self.clone())
            .after_dial(self.clone())
            .after_accept(self.clone())
            .after_write_call(self.clone())
            .after_write_push(self.clone())
            .after_write_reply(self.clone())
            .after_read_call_header(self.clone())
            .after_read_push_header(self.clone())
            .after_read_reply_header(self);
    }
}

impl AfterNewEndpoint for Ping {
    fn after_new_endpoint(&self, endpoint: &Endpoint) -> Result<(), Status> {
        let ping = self.clone();
        start_background(endpoint, "ping", move |endpoint| {
            ping.tick(&endpoint, Instant::now());
        })
    }
}

#[async_trait]
impl AfterDial for Ping {
    async fn after_dial(&self, session: &Session, _is_redial: bool) -> Result<(), Status> {
        self.touch(session);
        Ok(())
    }
}

#[async_trait]
impl AfterAccept for Ping {
    async fn after_accept(&self, session: &Session) -> Result<(), Status> {
        self.touch(session);
        Ok(())
    }
}

/// Server side: answers heartbeats and drops silent peers.
#[derive(Debug, Clone, Default)]
pub struct Pong;

impl Pong {
    pub fn new() -> Self {
        Pong
    }

    /// Close every healthy session whose peer announced a rate and stayed
    /// quiet for twice that rate as of `now`. Returns the number closed.
    pub async fn check(&self, endpoint: &Endpoint, now: Instant) -> usize {
        let mut expired = Vec::new();
        endpoint.range_session(|session| {
            if session.health() && heartbeat_state(session).is_some_and(|s| s.elapsed(now, 2)) {
                expired.push(session.clone());
            }
            true
        });

        for session in &expired {
            info!(session = %session.id(), peer = ?session.peer_addr(), "heartbeat expired, closing session");
            session.close().await;
        }
        expired.len()
    }

    fn observe(&self, ctx: &ReadCtx<'_>) {
        let state = state(ctx.session(), None);
        if let Some(value) = ctx.peek_meta(META_HEARTBEAT) {
            match value.parse::<u64>() {
                Ok(secs) => state.set_rate(clamp_rate(Duration::from_secs(secs))),
                Err(_) => debug!(session = %ctx.session().id(), %value, "ignoring malformed heartbeat rate"),
            }
        }
        state.touch();
    }
}

impl Plugin for Pong {
    fn name(&self) -> &str {
        "heartbeat-pong"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks
            .after_new_endpoint(self.clone())
            .after_write_reply(self.clone())
            .after_write_push(self.clone())
            .after_read_call_header(self.clone())
            .after_read_push_header(self);
    }
}

impl AfterNewEndpoint for Pong {
    fn after_new_endpoint(&self, endpoint: &Endpoint) -> Result<(), Status> {
        let router = endpoint.router();
        router.route_call_payload(
            HEARTBEAT_SERVICE_METHOD,
            |_ctx: CallCtx| async move { Ok(Payload::empty()) },
            vec![],
        )?;
        router.route_push_payload(
            HEARTBEAT_SERVICE_METHOD,
            |_ctx: PushCtx| async move { Ok(()) },
            vec![],
        )?;

        let pong = self.clone();
        start_background(endpoint, "pong", move |endpoint| {
            let pong = pong.clone();
            tokio::spawn(async move {
                pong.check(&endpoint, Instant::now()).await;
            });
        })
    }
}

/// Run `tick` every second until the endpoint shuts down.
fn start_background<F>(endpoint: &Endpoint, side: &'static str, tick: F) -> Result<(), Status>
where
    F: Fn(Endpoint) + Send + 'static,
{
    let Ok(handle) = Handle::try_current() else {
        warn!(%side, "no tokio runtime, heartbeat task not started");
        return Ok(());
    };
    let endpoint = endpoint.clone();
    let shutdown = endpoint.shutdown_token();
    handle.spawn(async move {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick(endpoint.clone()),
            }
        }
        debug!(%side, "heartbeat task stopped");
    });
    Ok(())
}

impl AfterWriteCall for Ping {
    fn after_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.touch(ctx.session());
        Ok(())
    }
}

impl AfterWritePush for Ping {
    fn after_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.touch(ctx.session());
        Ok(())
    }
}

impl AfterWriteReply for Ping {
    fn after_write_reply(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.touch(ctx.session());
        Ok(())
    }
}

impl AfterReadCallHeader for Ping {
    fn after_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.touch(ctx.session());
        Ok(())
    }
}

impl AfterReadPushHeader for Ping {
    fn after_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.touch(ctx.session());
        Ok(())
    }
}

impl AfterReadReplyHeader for Ping {
    fn after_read_reply_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.touch(ctx.session());
        Ok(())
    }
}

impl AfterWriteReply for Pong {
    fn after_write_reply(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        state(ctx.session(), None).touch();
        Ok(())
    }
}

impl AfterWritePush for Pong {
    fn after_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        state(ctx.session(), None).touch();
        Ok(())
    }
}

impl AfterReadCallHeader for Pong {
    fn after_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.observe(ctx);
        Ok(())
    }
}

impl AfterReadPushHeader for Pong {
    fn after_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.observe(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_elapsed() {
        let state = HeartbeatState::new(None);
        let later = state.last() + Duration::from_secs(3600);
        assert!(!state.elapsed(later, 2));

        state.set_rate(Duration::from_secs(3));
        let last = state.last();
        assert!(!state.elapsed(last + Duration::from_secs(5), 2));
        assert!(state.elapsed(last + Duration::from_secs(6), 2));
        assert!(state.elapsed(last + Duration::from_secs(3), 1));

        // touching never moves the clock backwards
        state.touch_at(last - Duration::from_millis(1));
        assert_eq!(state.last(), last);
        state.touch_at(last + Duration::from_secs(10));
        assert!(!state.elapsed(last + Duration::from_secs(15), 2));
    }

    #[tokio::test]
    async fn test_state_is_shared() {
        let endpoint = Endpoint::builder(tern::EndpointConfig::default())
            .build()
            .unwrap();
        let (a, _b) = tokio::io::duplex(64);
        let session = endpoint
            .serve_conn(tern::transport::Conn::from_stream(a))
            .await
            .unwrap();

        let first = state(&session, None);
        let second = state(&session, Some(Duration::from_secs(9)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.rate(), None);

        first.set_rate(Duration::from_secs(4));
        let seen = heartbeat_state(&session).unwrap();
        assert_eq!(seen.rate(), Some(Duration::from_secs(4)));

        session.close().await;
        endpoint.close().await.unwrap();
    }

    #[test]
    #[traced_test]
    fn test_min_rate() {
        assert_eq!(Ping::new(Duration::from_secs(1), false).rate(), MIN_RATE);
        assert!(logs_contain("heartbeat rate too low"));
        assert_eq!(
            Ping::new(Duration::from_secs(10), true).rate(),
            Duration::from_secs(10)
        );
    }
}
