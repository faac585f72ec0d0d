// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Token handshake run before a connection carries any call.
//!
//! The dialing side installs [`Bearer`], which sends one `AuthCall` with its
//! token and waits for the `AuthReply`. The accepting side installs
//! [`Checker`], which validates the token and answers. A failed check fails
//! the dial on one side and drops the connection on the other.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tern::message::with_seq;
use tern::plugin::{AfterAccept, AfterDial};
use tern::{Code, Hooks, Message, MessageType, Payload, Plugin, Session, Status};
use tracing::{debug, info, warn};

pub const AUTH_SERVICE_METHOD: &str = "/auth/bearer";

/// Validates a token for a session. The returned string is sent back as the
/// reply body.
pub type CheckFn = Arc<dyn Fn(&Session, &str) -> Result<String, Status> + Send + Sync>;

/// Client side of the token handshake.
pub struct Bearer {
    token: String,
    skip_on_redial: bool,
}

impl fmt::Debug for Bearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bearer")
            .field("token", &"<redacted>")
            .field("skip_on_redial", &self.skip_on_redial)
            .finish()
    }
}

impl Bearer {
    pub fn new(token: impl Into<String>) -> Self {
        Bearer {
            token: token.into(),
            skip_on_redial: false,
        }
    }

    /// Do not authenticate again when a session reconnects.
    pub fn skip_on_redial(mut self, skip: bool) -> Self {
        self.skip_on_redial = skip;
        self
    }
}

impl Plugin for Bearer {
    fn name(&self) -> &str {
        "auth-bearer"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks.after_dial(self);
    }
}

#[async_trait]
impl AfterDial for Bearer {
    async fn after_dial(&self, session: &Session, is_redial: bool) -> Result<(), Status> {
        if is_redial && self.skip_on_redial {
            return Ok(());
        }
        session
            .early_send(
                MessageType::AuthCall,
                AUTH_SERVICE_METHOD,
                Payload::plain(self.token.as_str()),
                vec![],
            )
            .await?;

        let mut reply = session.early_receive(MessageType::AuthReply).await?;
        let status = reply.take_status();
        if !status.is_ok() {
            warn!(session = %session.id(), error = %status, "authentication rejected");
            return Err(status);
        }
        debug!(session = %session.id(), "authenticated");
        Ok(())
    }
}

/// Server side of the token handshake.
pub struct Checker {
    check: CheckFn,
}

impl fmt::Debug for Checker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checker").finish_non_exhaustive()
    }
}

impl Checker {
    pub fn new(check: CheckFn) -> Self {
        Checker { check }
    }

    /// Accept exactly `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Checker::new(Arc::new(move |_session: &Session, got: &str| {
            if got == token {
                Ok(String::new())
            } else {
                Err(Status::new(Code::UNAUTHORIZED, "invalid token"))
            }
        }))
    }

    fn verify(&self, session: &Session, msg: &Message) -> Result<String, Status> {
        if msg.service_method() != AUTH_SERVICE_METHOD {
            return Err(Status::new(Code::UNAUTHORIZED, "unknown authentication method")
                .with_cause(msg.service_method().to_string()));
        }
        let token: String = msg
            .payload()
            .decode()
            .map_err(|st| Status::new(Code::UNAUTHORIZED, "unreadable token").with_cause(st.to_string()))?;
        (self.check)(session, &token)
    }
}

impl Plugin for Checker {
    fn name(&self) -> &str {
        "auth-checker"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks.after_accept(self);
    }
}

#[async_trait]
impl AfterAccept for Checker {
    async fn after_accept(&self, session: &Session) -> Result<(), Status> {
        let msg = session.early_receive(MessageType::AuthCall).await?;
        let seq = msg.seq();
        let outcome = self.verify(session, &msg);

        let (payload, status) = match &outcome {
            Ok(body) => (Payload::plain(body.as_str()), Status::ok()),
            Err(st) => (Payload::empty(), st.clone()),
        };
        let reply_status = status.clone();
        session
            .early_send(
                MessageType::AuthReply,
                AUTH_SERVICE_METHOD,
                payload,
                vec![
                    with_seq(seq),
                    Box::new(move |m: &mut Message| m.set_status(&reply_status)),
                ],
            )
            .await?;

        match outcome {
            Ok(_) => {
                info!(session = %session.id(), peer = ?session.peer_addr(), "peer authenticated");
                Ok(())
            }
            Err(st) => {
                warn!(session = %session.id(), peer = ?session.peer_addr(), error = %st, "peer rejected");
                Err(st)
            }
        }
    }
}
