// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! AES-GCM encryption of message bodies.
//!
//! A call or push carrying `X-Secure-Body: true` is sealed before it is
//! written and opened on the receiving side. The reply follows the request
//! unless `X-Reply-Secure-Body` says otherwise. Sealed bodies are
//! `nonce || ciphertext || tag`, where the plaintext is the original codec
//! id followed by the original body.

use std::fmt;
use std::sync::Arc;

use aws_lc_rs::aead::{AES_128_GCM, AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use bytes::Bytes;
use tern::message::with_meta;
use tern::plugin::{
    BeforeReadCallBody, BeforeReadPushBody, BeforeReadReplyBody, BeforeWriteCall,
    BeforeWritePush, BeforeWriteReply,
};
use tern::{Codec, Hooks, Message, MessageSetting, Meta, Plugin, ReadCtx, Status, WriteCtx};
use tracing::debug;

use crate::errors::SecureBodyError;

pub const META_SECURE_BODY: &str = "X-Secure-Body";
pub const META_REPLY_SECURE_BODY: &str = "X-Reply-Secure-Body";

/// Encrypt the body of this call or push.
pub fn with_secure_body() -> MessageSetting {
    with_meta(META_SECURE_BODY, "true")
}

/// Force reply encryption on or off regardless of the request.
pub fn with_reply_secure_body(secure: bool) -> MessageSetting {
    with_meta(META_REPLY_SECURE_BODY, if secure { "true" } else { "false" })
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn reply_wanted(request: &Meta) -> bool {
    match request.get(META_REPLY_SECURE_BODY) {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => is_true(request.get(META_SECURE_BODY)),
    }
}

struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Cipher {
    fn new(key: &[u8]) -> Result<Self, SecureBodyError> {
        let algorithm = match key.len() {
            16 => &AES_128_GCM,
            32 => &AES_256_GCM,
            n => return Err(SecureBodyError::InvalidKeyLength(n)),
        };
        let unbound =
            UnboundKey::new(algorithm, key).map_err(|_| SecureBodyError::InvalidKeyLength(key.len()))?;
        Ok(Cipher {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    fn seal(&self, codec: u8, body: &[u8]) -> Result<Bytes, SecureBodyError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| SecureBodyError::RandomFailure)?;

        let mut in_out = Vec::with_capacity(1 + body.len() + self.key.algorithm().tag_len());
        in_out.push(codec);
        in_out.extend_from_slice(body);
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| SecureBodyError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&in_out);
        Ok(Bytes::from(out))
    }

    fn open(&self, data: &[u8]) -> Result<(u8, Bytes), SecureBodyError> {
        if data.len() < NONCE_LEN + self.key.algorithm().tag_len() + 1 {
            return Err(SecureBodyError::CiphertextTooShort(data.len()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| SecureBodyError::OpenFailed)?;
        let mut in_out = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SecureBodyError::OpenFailed)?;
        let (codec, body) = plain
            .split_first()
            .ok_or(SecureBodyError::CiphertextTooShort(data.len()))?;
        Ok((*codec, Bytes::copy_from_slice(body)))
    }
}

/// Body encryption plugin shared by both ends of a connection.
#[derive(Clone)]
pub struct SecureBody {
    cipher: Arc<Cipher>,
}

impl fmt::Debug for SecureBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBody")
            .field("algorithm", self.cipher.key.algorithm())
            .finish()
    }
}

impl SecureBody {
    /// `key` must be 16 (AES-128-GCM) or 32 (AES-256-GCM) bytes.
    pub fn new(key: &[u8]) -> Result<Self, SecureBodyError> {
        Ok(SecureBody {
            cipher: Arc::new(Cipher::new(key)?),
        })
    }

    fn encrypt(&self, msg: &mut Message) -> Result<(), SecureBodyError> {
        let sealed = self.cipher.seal(msg.body_codec(), msg.body())?;
        msg.set_body_codec(Codec::Binary.id());
        msg.set_body(sealed);
        msg.meta_mut().set(META_SECURE_BODY, "true");
        Ok(())
    }

    /// Open a marked body in place. Returns false for plaintext bodies.
    fn decrypt(&self, msg: &mut Message) -> Result<bool, SecureBodyError> {
        if !is_true(msg.meta().get(META_SECURE_BODY)) {
            return Ok(false);
        }
        let (codec, body) = self.cipher.open(msg.body())?;
        msg.set_body_codec(codec);
        msg.set_body(body);
        Ok(true)
    }

    fn encrypt_marked(&self, msg: &mut Message) -> Result<(), Status> {
        if is_true(msg.meta().get(META_SECURE_BODY)) {
            self.encrypt(msg)?;
        }
        Ok(())
    }

    fn decrypt_request(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        match self.decrypt(ctx.input_mut()) {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(
                    session = %ctx.session().id(),
                    service_method = %ctx.input().service_method(),
                    error = %e,
                    "cannot open body"
                );
                Err(e.into())
            }
        }
    }
}

impl Plugin for SecureBody {
    fn name(&self) -> &str {
        "secure-body"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks
            .before_write_call(self.clone())
            .before_write_push(self.clone())
            .before_write_reply(self.clone())
            .before_read_call_body(self.clone())
            .before_read_push_body(self.clone())
            .before_read_reply_body(self);
    }
}

impl BeforeWriteCall for SecureBody {
    fn before_write_call(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.encrypt_marked(ctx.output_mut())
    }
}

impl BeforeWritePush for SecureBody {
    fn before_write_push(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        self.encrypt_marked(ctx.output_mut())
    }
}

impl BeforeWriteReply for SecureBody {
    fn before_write_reply(&self, ctx: &mut WriteCtx<'_>) -> Result<(), Status> {
        let wanted = ctx.input_meta().is_some_and(reply_wanted);
        // failed replies carry no body
        if !wanted || !ctx.output().status().is_ok() {
            return Ok(());
        }
        self.encrypt(ctx.output_mut())?;
        Ok(())
    }
}

impl BeforeReadCallBody for SecureBody {
    fn before_read_call_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.decrypt_request(ctx)
    }
}

impl BeforeReadPushBody for SecureBody {
    fn before_read_push_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        self.decrypt_request(ctx)
    }
}

impl BeforeReadReplyBody for SecureBody {
    fn before_read_reply_body(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        let expected = ctx.call_meta().is_some_and(reply_wanted);
        let opened = self.decrypt(ctx.input_mut())?;
        if expected && !opened && ctx.input().status().is_ok() {
            return Err(SecureBodyError::PlaintextReply.into());
        }
        Ok(())
    }
}
