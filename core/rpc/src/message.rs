// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use url::form_urlencoded;

use crate::codec::{Codec, NIL_CODEC_ID, Payload};
use crate::status::Status;
use crate::tfilter::{FilterRegistry, PipeTFilter};

/// Reserved meta key carrying the JSON encoded status of a reply.
pub const META_STATUS: &str = "X-Status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Undefined = 0,
    Call = 1,
    Reply = 2,
    Push = 3,
    AuthCall = 4,
    AuthReply = 5,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::Undefined),
            1 => Some(MessageType::Call),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::Push),
            4 => Some(MessageType::AuthCall),
            5 => Some(MessageType::AuthReply),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Undefined => "UNDEFINED",
            MessageType::Call => "CALL",
            MessageType::Reply => "REPLY",
            MessageType::Push => "PUSH",
            MessageType::AuthCall => "AUTH_CALL",
            MessageType::AuthReply => "AUTH_REPLY",
        }
    }

    /// Reply-like types travel as responses on request/response protocols.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Reply | MessageType::AuthReply)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered string multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    entries: Vec<(String, String)>,
}

impl Meta {
    pub fn new() -> Self {
        Meta::default()
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Replace every value of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = 0;
                self.entries.retain(|(k, _)| {
                    let keep = idx <= pos || *k != key;
                    idx += 1;
                    keep
                });
            }
            None => self.entries.push((key, value)),
        }
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Remove every value of `key`, returning the first one.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let first = self
            .entries
            .iter()
            .position(|(k, _)| k == key)
            .map(|pos| self.entries[pos].1.clone());
        self.entries.retain(|(k, _)| k != key);
        first
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Encode as a url query string.
    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.entries.iter())
            .finish()
    }

    pub fn decode(data: &[u8]) -> Meta {
        Meta {
            entries: form_urlencoded::parse(data).into_owned().collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Meta {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Meta {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// One RPC unit as seen by protocols, plugins and sessions.
pub struct Message {
    seq: i32,
    mtype: MessageType,
    service_method: String,
    meta: Meta,
    body_codec: u8,
    body: Bytes,
    pipe: PipeTFilter,
    filters: Arc<FilterRegistry>,
    size: u32,
    size_limit: u32,
    context_age: Option<Duration>,
}

impl Default for Message {
    fn default() -> Self {
        Message::with_filters(FilterRegistry::shared_default())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("seq", &self.seq)
            .field("mtype", &self.mtype)
            .field("service_method", &self.service_method)
            .field("meta", &self.meta)
            .field("body_codec", &self.body_codec)
            .field("body_len", &self.body.len())
            .field("pipe", &self.pipe)
            .field("size", &self.size)
            .finish()
    }
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    pub fn with_filters(filters: Arc<FilterRegistry>) -> Self {
        Message {
            seq: 0,
            mtype: MessageType::Undefined,
            service_method: String::new(),
            meta: Meta::new(),
            body_codec: NIL_CODEC_ID,
            body: Bytes::new(),
            pipe: PipeTFilter::new(),
            filters,
            size: 0,
            size_limit: 0,
            context_age: None,
        }
    }

    /// Clear every per-message field, keeping the filter registry and limit.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.mtype = MessageType::Undefined;
        self.service_method.clear();
        self.meta.clear();
        self.body_codec = NIL_CODEC_ID;
        self.body = Bytes::new();
        self.pipe.reset();
        self.size = 0;
        self.context_age = None;
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: i32) {
        self.seq = seq;
    }

    pub fn mtype(&self) -> MessageType {
        self.mtype
    }

    pub fn set_mtype(&mut self, mtype: MessageType) {
        self.mtype = mtype;
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    pub fn set_service_method(&mut self, service_method: impl Into<String>) {
        self.service_method = service_method.into();
    }

    /// Service method without the query string.
    pub fn path(&self) -> &str {
        match self.service_method.split_once('?') {
            Some((path, _)) => path,
            None => &self.service_method,
        }
    }

    pub fn query(&self) -> Meta {
        match self.service_method.split_once('?') {
            Some((_, q)) => Meta::decode(q.as_bytes()),
            None => Meta::new(),
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    pub fn set_meta(&mut self, meta: Meta) {
        self.meta = meta;
    }

    pub fn body_codec(&self) -> u8 {
        self.body_codec
    }

    pub fn set_body_codec(&mut self, codec: u8) {
        self.body_codec = codec;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replace the encoded body, keeping the codec.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn payload(&self) -> Payload {
        Payload::new(self.body_codec, self.body.clone())
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.body_codec = payload.codec_id();
        self.body = payload.into_bytes();
    }

    /// Encode `value` with the message codec, or `default` if none is set.
    pub fn encode_body<T: serde::Serialize + ?Sized>(
        &mut self,
        value: &T,
        default: Codec,
    ) -> Result<(), Status> {
        let codec = Codec::from_id(self.body_codec).unwrap_or(default);
        self.set_payload(Payload::encode(codec, value)?);
        Ok(())
    }

    pub fn pipe(&self) -> &PipeTFilter {
        &self.pipe
    }

    pub fn pipe_mut(&mut self) -> &mut PipeTFilter {
        &mut self.pipe
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) -> Result<(), Status> {
        self.check_size(size)?;
        self.size = size;
        Ok(())
    }

    pub fn size_limit(&self) -> u32 {
        self.size_limit
    }

    pub fn set_size_limit(&mut self, limit: u32) {
        self.size_limit = limit;
    }

    /// Fails when `size` exceeds a non-zero size limit.
    pub fn check_size(&self, size: u32) -> Result<(), Status> {
        if self.size_limit > 0 && size > self.size_limit {
            return Err(Status::bad_message(format!(
                "message size {} exceeds limit {}",
                size, self.size_limit
            )));
        }
        Ok(())
    }

    pub fn context_age(&self) -> Option<Duration> {
        self.context_age
    }

    pub fn set_context_age(&mut self, age: Option<Duration>) {
        self.context_age = age;
    }

    /// Body bytes as produced by the codec.
    pub fn marshal_body(&self) -> Result<Bytes, Status> {
        if self.body_codec == NIL_CODEC_ID && !self.body.is_empty() {
            return Err(Status::bad_message("body without codec"));
        }
        Ok(self.body.clone())
    }

    pub fn unmarshal_body(&mut self, data: Bytes) {
        self.body = data;
    }

    /// Marshaled body with the filter chain applied, ready for the wire.
    pub fn pack_body(&self) -> Result<Bytes, Status> {
        let body = self.marshal_body()?;
        self.pipe.on_pack(&self.filters, body)
    }

    /// Undo the filter chain on wire bytes and store the result as body.
    /// The restored body is held to the size limit as well.
    pub fn unpack_body(&mut self, data: Bytes) -> Result<(), Status> {
        let body = self
            .pipe
            .on_unpack(&self.filters, data, self.size_limit as usize)?;
        self.unmarshal_body(body);
        Ok(())
    }

    /// Status carried by a reply, OK when absent.
    pub fn status(&self) -> Status {
        match self.meta.get(META_STATUS) {
            Some(s) => Status::from_json(s.as_bytes()).unwrap_or_else(|e| e),
            None => Status::ok(),
        }
    }

    pub fn set_status(&mut self, status: &Status) {
        if status.is_ok() {
            self.meta.remove(META_STATUS);
        } else {
            self.meta.set(META_STATUS, status.to_json());
        }
    }

    /// Remove and return the reply status.
    pub fn take_status(&mut self) -> Status {
        let status = self.status();
        self.meta.remove(META_STATUS);
        status
    }
}

/// Adjusts an outgoing message before it is written.
pub type MessageSetting = Box<dyn FnOnce(&mut Message) + Send>;

pub fn with_meta(key: impl Into<String>, value: impl Into<String>) -> MessageSetting {
    let (key, value) = (key.into(), value.into());
    Box::new(move |m: &mut Message| m.meta_mut().set(key, value))
}

pub fn with_add_meta(key: impl Into<String>, value: impl Into<String>) -> MessageSetting {
    let (key, value) = (key.into(), value.into());
    Box::new(move |m: &mut Message| m.meta_mut().add(key, value))
}

pub fn with_body_codec(codec: Codec) -> MessageSetting {
    Box::new(move |m: &mut Message| m.set_body_codec(codec.id()))
}

pub fn with_tfilter(id: u8) -> MessageSetting {
    Box::new(move |m: &mut Message| m.pipe_mut().append(id))
}

pub fn with_context_age(age: Duration) -> MessageSetting {
    Box::new(move |m: &mut Message| m.set_context_age(Some(age)))
}

pub fn with_seq(seq: i32) -> MessageSetting {
    Box::new(move |m: &mut Message| m.set_seq(seq))
}

/// Recycles messages to avoid reallocating meta and buffers.
pub struct MessagePool {
    filters: Arc<FilterRegistry>,
    size_limit: u32,
    capacity: usize,
    free: Mutex<Vec<Message>>,
}

impl MessagePool {
    pub fn new(filters: Arc<FilterRegistry>, size_limit: u32, capacity: usize) -> Self {
        MessagePool {
            filters,
            size_limit,
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Message {
        match self.free.lock().pop() {
            Some(msg) => msg,
            None => {
                let mut msg = Message::with_filters(self.filters.clone());
                msg.set_size_limit(self.size_limit);
                msg
            }
        }
    }

    pub fn release(&self, mut msg: Message) {
        msg.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(msg);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_meta_multimap() {
        let mut meta = Meta::new();
        meta.add("a", "1");
        meta.add("b", "2");
        meta.add("a", "3");
        assert_eq!(meta.get("a"), Some("1"));
        assert_eq!(meta.get_all("a").collect::<Vec<_>>(), vec!["1", "3"]);

        meta.set("a", "9");
        assert_eq!(
            meta.iter().collect::<Vec<_>>(),
            vec![("a", "9"), ("b", "2")]
        );

        assert_eq!(meta.remove("b"), Some("2".to_string()));
        assert_eq!(meta.remove("b"), None);
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn test_meta_query_encoding() {
        let meta: Meta = [("author", "clown fish"), ("k", "a&b=c"), ("k", "")]
            .into_iter()
            .collect();
        let encoded = meta.encode();
        assert_eq!(encoded, "author=clown+fish&k=a%26b%3Dc&k=");
        assert_eq!(Meta::decode(encoded.as_bytes()), meta);
        assert!(Meta::decode(b"").is_empty());
    }

    #[test]
    fn test_path_and_query() {
        let mut msg = Message::new();
        msg.set_service_method("/home/test?endpoint_id=110&x=1");
        assert_eq!(msg.path(), "/home/test");
        assert_eq!(msg.query().get("endpoint_id"), Some("110"));

        msg.set_service_method("/math/add");
        assert_eq!(msg.path(), "/math/add");
        assert!(msg.query().is_empty());
    }

    #[test]
    fn test_reply_status_in_meta() {
        let mut msg = Message::new();
        assert!(msg.status().is_ok());

        msg.set_status(&Status::new(1, "test error"));
        assert_eq!(msg.status(), Status::new(1, "test error"));

        let st = msg.take_status();
        assert_eq!(st.code(), Code::new(1));
        assert!(!msg.meta().contains(META_STATUS));
    }

    #[test]
    fn test_settings_and_size_limit() {
        let mut msg = Message::new();
        for s in [
            with_meta("k", "v"),
            with_add_meta("k", "w"),
            with_body_codec(Codec::Plain),
            with_tfilter(b'g'),
            with_context_age(Duration::from_secs(1)),
        ] {
            s(&mut msg);
        }
        assert_eq!(msg.meta().get_all("k").count(), 2);
        assert_eq!(msg.body_codec(), Codec::Plain.id());
        assert_eq!(msg.pipe().ids(), b"g");
        assert_eq!(msg.context_age(), Some(Duration::from_secs(1)));

        msg.set_size_limit(10);
        assert!(msg.set_size(10).is_ok());
        assert_eq!(msg.set_size(11).unwrap_err().code(), Code::BAD_MESSAGE);
    }

    #[test]
    fn test_marshal_requires_codec() {
        let mut msg = Message::new();
        msg.set_body(Bytes::from_static(b"x"));
        assert!(msg.marshal_body().is_err());

        msg.encode_body(&"x", Codec::Json).unwrap();
        assert_eq!(msg.marshal_body().unwrap().as_ref(), b"\"x\"");
    }

    #[test]
    fn test_pool_reuse() {
        let pool = MessagePool::new(FilterRegistry::shared_default(), 64, 1);
        let mut a = pool.acquire();
        assert_eq!(a.size_limit(), 64);
        a.set_seq(7);
        a.meta_mut().add("k", "v");
        pool.release(a);
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire();
        assert_eq!(b.seq(), 0);
        assert!(b.meta().is_empty());
        assert_eq!(b.size_limit(), 64);

        pool.release(b);
        pool.release(Message::new());
        assert_eq!(pool.idle(), 1);
    }
}
