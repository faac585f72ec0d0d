// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Protobuf framing: a length prefix followed by one `Payload` message.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message as _;

use super::{Proto, ProtoError, ProtoFunc, StreamIo, length_prefixed};
use crate::message::{Message, MessageType, Meta};
use crate::status::Status;
use crate::tfilter::PipeTFilter;
use crate::transport::Conn;

pub const PB_PROTO_ID: u8 = b'p';

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct PbFrame {
    #[prost(int32, tag = "1")]
    pub seq: i32,
    #[prost(int32, tag = "2")]
    pub mtype: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub service_method: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub meta: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub body_codec: i32,
    #[prost(bytes = "bytes", tag = "6")]
    pub body: Bytes,
    #[prost(bytes = "vec", tag = "7")]
    pub pipe_tfilter: Vec<u8>,
}

pub struct PbProto {
    io: StreamIo,
}

pub fn pb_proto_func() -> ProtoFunc {
    Arc::new(|conn: Conn| {
        let stream = conn.into_stream("protobuf")?;
        Ok(Box::new(PbProto {
            io: StreamIo::new(stream),
        }) as Box<dyn Proto>)
    })
}

fn malformed(what: String) -> Status {
    ProtoError::Malformed(format!("protobuf frame: {}", what)).into()
}

pub(crate) fn encode_frame(msg: &Message) -> Result<Vec<u8>, Status> {
    let frame = PbFrame {
        seq: msg.seq(),
        mtype: msg.mtype().as_u8() as i32,
        service_method: msg.service_method().as_bytes().to_vec(),
        meta: msg.meta().encode().into_bytes(),
        body_codec: msg.body_codec() as i32,
        body: msg.pack_body()?,
        pipe_tfilter: msg.pipe().ids().to_vec(),
    };
    length_prefixed(&frame.encode_to_vec())
}

pub(crate) fn decode_frame(data: Bytes, msg: &mut Message) -> Result<(), Status> {
    let frame = PbFrame::decode(data).map_err(|e| malformed(e.to_string()))?;

    msg.set_seq(frame.seq);
    let mtype = u8::try_from(frame.mtype)
        .ok()
        .and_then(MessageType::from_u8)
        .ok_or_else(|| malformed(format!("unknown message type {}", frame.mtype)))?;
    msg.set_mtype(mtype);
    msg.set_service_method(
        String::from_utf8(frame.service_method)
            .map_err(|_| malformed("service method is not utf-8".to_string()))?,
    );
    msg.set_meta(Meta::decode(&frame.meta));
    msg.set_body_codec(
        u8::try_from(frame.body_codec)
            .map_err(|_| malformed(format!("body codec {} out of range", frame.body_codec)))?,
    );
    *msg.pipe_mut() = PipeTFilter::from_ids(&frame.pipe_tfilter);
    msg.unpack_body(frame.body)
}

#[async_trait]
impl Proto for PbProto {
    fn version(&self) -> (u8, &'static str) {
        (PB_PROTO_ID, "protobuf")
    }

    async fn pack(&self, msg: &mut Message) -> Result<(), Status> {
        let buf = encode_frame(msg)?;
        msg.set_size(buf.len() as u32)?;
        self.io.write_all(&buf).await
    }

    async fn unpack(&self, msg: &mut Message) -> Result<(), Status> {
        let frame = self.io.read_frame(msg).await?;
        decode_frame(frame, msg)
    }

    async fn close(&self) -> Result<(), Status> {
        self.io.shutdown().await
    }
}
