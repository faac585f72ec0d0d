// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Default length prefixed binary framing.
//!
//! ```text
//! u32 frame length | i32 seq | u8 mtype | u16 len + service method
//! | u32 len + meta | u8 body codec | u8 len + filter ids | body
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Proto, ProtoError, ProtoFunc, StreamIo};
use crate::message::{Message, MessageType, Meta};
use crate::status::Status;
use crate::tfilter::PipeTFilter;
use crate::transport::Conn;

pub const RAW_PROTO_ID: u8 = b'r';

pub struct RawProto {
    io: StreamIo,
}

pub fn raw_proto_func() -> ProtoFunc {
    Arc::new(|conn: Conn| {
        let stream = conn.into_stream("raw")?;
        Ok(Box::new(RawProto {
            io: StreamIo::new(stream),
        }) as Box<dyn Proto>)
    })
}

fn malformed(what: &str) -> Status {
    ProtoError::Malformed(format!("raw frame: {}", what)).into()
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), Status> {
    if buf.remaining() < n {
        return Err(malformed(&format!("truncated {}", what)));
    }
    Ok(())
}

pub(crate) fn encode_frame(msg: &Message) -> Result<BytesMut, Status> {
    let body = msg.pack_body()?;
    let svc = msg.service_method().as_bytes();
    let meta = msg.meta().encode();
    let ids = msg.pipe().ids();

    let svc_len = u16::try_from(svc.len()).map_err(|_| malformed("service method too long"))?;
    let meta_len = u32::try_from(meta.len()).map_err(|_| malformed("meta too long"))?;
    let ids_len = u8::try_from(ids.len()).map_err(|_| malformed("too many filters"))?;

    let frame_len = 4 + 1 + 2 + svc.len() + 4 + meta.len() + 1 + 1 + ids.len() + body.len();
    let frame_len = u32::try_from(frame_len).map_err(|_| malformed("frame too long"))?;

    let mut buf = BytesMut::with_capacity(frame_len as usize + 4);
    buf.put_u32(frame_len);
    buf.put_i32(msg.seq());
    buf.put_u8(msg.mtype().as_u8());
    buf.put_u16(svc_len);
    buf.put_slice(svc);
    buf.put_u32(meta_len);
    buf.put_slice(meta.as_bytes());
    buf.put_u8(msg.body_codec());
    buf.put_u8(ids_len);
    buf.put_slice(ids);
    buf.put_slice(&body);
    Ok(buf)
}

pub(crate) fn decode_frame(mut frame: Bytes, msg: &mut Message) -> Result<(), Status> {
    need(&frame, 4 + 1 + 2, "header")?;
    msg.set_seq(frame.get_i32());
    let mtype = frame.get_u8();
    msg.set_mtype(
        MessageType::from_u8(mtype)
            .ok_or_else(|| malformed(&format!("unknown message type {}", mtype)))?,
    );

    let svc_len = frame.get_u16() as usize;
    need(&frame, svc_len, "service method")?;
    let svc = frame.split_to(svc_len);
    msg.set_service_method(
        std::str::from_utf8(&svc).map_err(|_| malformed("service method is not utf-8"))?,
    );

    need(&frame, 4, "meta length")?;
    let meta_len = frame.get_u32() as usize;
    need(&frame, meta_len, "meta")?;
    msg.set_meta(Meta::decode(&frame.split_to(meta_len)));

    need(&frame, 2, "codec")?;
    msg.set_body_codec(frame.get_u8());
    let ids_len = frame.get_u8() as usize;
    need(&frame, ids_len, "filter ids")?;
    *msg.pipe_mut() = PipeTFilter::from_ids(&frame.split_to(ids_len));

    msg.unpack_body(frame)
}

#[async_trait]
impl Proto for RawProto {
    fn version(&self) -> (u8, &'static str) {
        (RAW_PROTO_ID, "raw")
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
