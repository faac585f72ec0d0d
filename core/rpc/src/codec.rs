// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Body codecs and the encoded body carried by messages.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::status::{Code, Status};

/// Codec id of a message without body.
pub const NIL_CODEC_ID: u8 = 0;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("plain codec only carries scalar values")]
    NotScalar,
    #[error("binary codec only carries bytes or strings")]
    NotBytes,
    #[error("body is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("{0} bodies must be built with the protobuf helpers")]
    ProtobufOnly(&'static str),
    #[error("unsupported codec id {0}")]
    UnsupportedId(u8),
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedId(_) => {
                Status::with_code(Code::UNSUPPORTED_CODEC_TYPE).with_cause(err.to_string())
            }
            _ => Status::bad_message(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Binary,
    Json,
    Protobuf,
    Plain,
}

impl Codec {
    pub const fn id(&self) -> u8 {
        match self {
            Codec::Binary => b'b',
            Codec::Json => b'j',
            Codec::Protobuf => b'p',
            Codec::Plain => b's',
        }
    }

    pub fn from_id(id: u8) -> Option<Codec> {
        match id {
            b'b' => Some(Codec::Binary),
            b'j' => Some(Codec::Json),
            b'p' => Some(Codec::Protobuf),
            b's' => Some(Codec::Plain),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Binary => "binary",
            Codec::Json => "json",
            Codec::Protobuf => "protobuf",
            Codec::Plain => "plain",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "binary" => Some(Codec::Binary),
            "json" => Some(Codec::Json),
            "protobuf" => Some(Codec::Protobuf),
            "plain" => Some(Codec::Plain),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Binary => "application/octet-stream",
            Codec::Json => "application/json;charset=utf-8",
            Codec::Protobuf => "application/x-protobuf",
            Codec::Plain => "text/plain;charset=utf-8",
        }
    }

    /// Codec for an HTTP Content-Type; parameters are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Codec> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/octet-stream" => Some(Codec::Binary),
            "application/json" => Some(Codec::Json),
            "application/x-protobuf" | "application/protobuf" => Some(Codec::Protobuf),
            "text/plain" => Some(Codec::Plain),
            _ => None,
        }
    }

    /// Bodies of these codecs are valid UTF-8 text.
    pub fn is_textual(&self) -> bool {
        matches!(self, Codec::Json | Codec::Plain)
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Codec::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
            Codec::Plain => match serde_json::to_value(value)? {
                Value::String(s) => Ok(Bytes::from(s)),
                Value::Null => Ok(Bytes::new()),
                v @ (Value::Bool(_) | Value::Number(_)) => Ok(Bytes::from(v.to_string())),
                _ => Err(CodecError::NotScalar),
            },
            Codec::Binary => match serde_json::to_value(value)? {
                Value::String(s) => Ok(Bytes::from(s)),
                Value::Null => Ok(Bytes::new()),
                Value::Array(items) => items
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or(CodecError::NotBytes)
                    })
                    .collect::<Result<Vec<u8>, _>>()
                    .map(Bytes::from),
                _ => Err(CodecError::NotBytes),
            },
            Codec::Protobuf => Err(CodecError::ProtobufOnly("protobuf")),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => {
                if data.is_empty() {
                    Ok(serde_json::from_value(Value::Null)?)
                } else {
                    Ok(serde_json::from_slice(data)?)
                }
            }
            Codec::Plain => {
                let text = std::str::from_utf8(data)?;
                // numbers and booleans first, then the raw text
                match serde_json::from_str(text) {
                    Ok(v) => Ok(v),
                    Err(_) => Ok(serde_json::from_value(Value::String(text.to_string()))?),
                }
            }
            Codec::Binary => {
                if let Ok(text) = std::str::from_utf8(data) {
                    if let Ok(v) = serde_json::from_value(Value::String(text.to_string())) {
                        return Ok(v);
                    }
                }
                let items = data.iter().map(|b| Value::from(*b)).collect();
                Ok(serde_json::from_value(Value::Array(items))?)
            }
            Codec::Protobuf => Err(CodecError::ProtobufOnly("protobuf")),
        }
    }
}

/// Encoded body together with the id of the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    codec: u8,
    bytes: Bytes,
}

impl Payload {
    pub fn new(codec: u8, bytes: impl Into<Bytes>) -> Self {
        Payload {
            codec,
            bytes: bytes.into(),
        }
    }

    pub fn empty() -> Self {
        Payload::default()
    }

    pub fn encode<T: Serialize + ?Sized>(codec: Codec, value: &T) -> Result<Self, Status> {
        Ok(Payload::new(codec.id(), codec.encode(value)?))
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Status> {
        Payload::encode(Codec::Json, value)
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Payload::new(Codec::Plain.id(), text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::new(Codec::Binary.id(), data)
    }

    pub fn from_protobuf<M: prost::Message>(msg: &M) -> Self {
        Payload::new(Codec::Protobuf.id(), msg.encode_to_vec())
    }

    pub fn codec_id(&self) -> u8 {
        self.codec
    }

    pub fn codec(&self) -> Option<Codec> {
        Codec::from_id(self.codec)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Status> {
        if self.codec == NIL_CODEC_ID {
            return Ok(Codec::Json.decode(&[])?);
        }
        let codec = Codec::from_id(self.codec).ok_or(CodecError::UnsupportedId(self.codec))?;
        Ok(codec.decode(&self.bytes)?)
    }

    pub fn to_protobuf<M: prost::Message + Default>(&self) -> Result<M, Status> {
        match self.codec {
            NIL_CODEC_ID => Ok(M::default()),
            id if id == Codec::Protobuf.id() => {
                Ok(M::decode(self.bytes.clone()).map_err(CodecError::from)?)
            }
            id => Err(CodecError::UnsupportedId(id).into()),
        }
    }
}
