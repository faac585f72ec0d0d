// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! JSON framing: a length prefix followed by one JSON object.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use super::{Proto, ProtoError, ProtoFunc, StreamIo, length_prefixed};
use crate::codec::Codec;
use crate::message::{Message, MessageType, Meta};
use crate::status::Status;
use crate::tfilter::PipeTFilter;
use crate::transport::Conn;

pub const JSON_PROTO_ID: u8 = b'j';

pub struct JsonProto {
    io: StreamIo,
}

pub fn json_proto_func() -> ProtoFunc {
    Arc::new(|conn: Conn| {
        let stream = conn.into_stream("json")?;
        Ok(Box::new(JsonProto {
            io: StreamIo::new(stream),
        }) as Box<dyn Proto>)
    })
}

#[derive(Deserialize)]
struct Frame {
    seq: i32,
    mtype: u8,
    #[serde(rename = "serviceMethod")]
    service_method: String,
    meta: String,
    #[serde(rename = "bodyCodec")]
    body_codec: u8,
    body: String,
    ptf: Vec<u8>,
}

// Textual bodies without filters are carried as text, anything else maps
// each byte to the char of the same value.
fn body_is_text(body_codec: u8, pipe: &PipeTFilter) -> bool {
    pipe.is_empty() && Codec::from_id(body_codec).is_some_and(|c| c.is_textual())
}

fn json_string(s: &str) -> String {
    // serializing a str cannot fail
    serde_json::to_string(s).unwrap_or_default()
}

pub(crate) fn encode_frame(msg: &Message) -> Result<Vec<u8>, Status> {
    let body = msg.pack_body()?;
    let body = if body_is_text(msg.body_codec(), msg.pipe()) {
        match std::str::from_utf8(&body) {
            Ok(text) => text.to_string(),
            Err(_) => return Err(Status::bad_message("textual body is not valid utf-8")),
        }
    } else {
        body.iter().map(|b| *b as char).collect()
    };

    let ptf: Vec<String> = msg.pipe().ids().iter().map(|id| id.to_string()).collect();
    let frame = format!(
        r#"{{"seq":{},"mtype":{},"serviceMethod":{},"meta":{},"bodyCodec":{},"body":{},"ptf":[{}]}}"#,
        msg.seq(),
        msg.mtype().as_u8(),
        json_string(msg.service_method()),
        json_string(&msg.meta().encode()),
        msg.body_codec(),
        json_string(&body),
        ptf.join(","),
    );
    length_prefixed(frame.as_bytes())
}

pub(crate) fn decode_frame(data: &[u8], msg: &mut Message) -> Result<(), Status> {
    let frame: Frame = serde_json::from_slice(data)
        .map_err(|e| ProtoError::Malformed(format!("json frame: {}", e)))?;

    msg.set_seq(frame.seq);
    msg.set_mtype(MessageType::from_u8(frame.mtype).ok_or_else(|| {
        ProtoError::Malformed(format!("unknown message type {}", frame.mtype))
    })?);
    msg.set_service_method(frame.service_method);
    msg.set_meta(Meta::decode(frame.meta.as_bytes()));
    msg.set_body_codec(frame.body_codec);
    *msg.pipe_mut() = PipeTFilter::from_ids(&frame.ptf);

    let body = if body_is_text(frame.body_codec, msg.pipe()) {
        Bytes::from(frame.body)
    } else {
        frame
            .body
            .chars()
            .map(u8::try_from)
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from)
            .map_err(|_| ProtoError::Malformed("json frame: body char above U+00FF".to_string()))?
    };
    msg.unpack_body(body)
}

#[async_trait]
impl Proto for JsonProto {
    fn version(&self) -> (u8, &'static str) {
        (JSON_PROTO_ID, "json")
    }

    async fn pack(&self, msg: &mut Message) -> Result<(), Status> {
        let buf = encode_frame(msg)?;
        msg.set_size(buf.len() as u32)?;
        self.io.write_all(&buf).await
    }

    async fn unpack(&self, msg: &mut Message) -> Result<(), Status> {
        let frame = self.io.read_frame(msg).await?;
        decode_frame(&frame, msg)
    }

    async fn close(&self) -> Result<(), Status> {
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;
    use crate::proto::testutil;
    use crate::status::Code;

    #[tokio::test]
    async fn test_round_trip() {
        testutil::round_trip(json_proto_func(), true).await;
    }

    #[test]
    fn test_exact_layout() {
        let mut msg = Message::new();
        msg.set_seq(7);
        msg.set_mtype(MessageType::Call);
        msg.set_service_method("/math/add");
        msg.meta_mut().add("author", "clownfish");
        msg.set_payload(Payload::json(&vec![1, 2]).unwrap());

        let frame = encode_frame(&msg).unwrap();
        assert_eq!(
            std::str::from_utf8(&frame[4..]).unwrap(),
            r#"{"seq":7,"mtype":1,"serviceMethod":"/math/add","meta":"author=clownfish","bodyCodec":106,"body":"[1,2]","ptf":[]}"#
        );
        assert_eq!(
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize,
            frame.len() - 4
        );
    }

    #[test]
    fn test_binary_body_maps_bytes_to_chars() {
        let mut msg = Message::new();
        msg.set_mtype(MessageType::Push);
        msg.set_payload(Payload::binary(vec![0u8, 0x7f, 0x80, 0xff]));

        let frame = encode_frame(&msg).unwrap();
        let text = std::str::from_utf8(&frame[4..]).unwrap();
        assert!(text.contains(r#""body":"\u0000"#));

        let mut got = Message::new();
        decode_frame(&frame[4..], &mut got).unwrap();
        assert_eq!(got.body().as_ref(), &[0u8, 0x7f, 0x80, 0xff]);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let err = decode_frame(b"{not json", &mut Message::new()).unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);

        let wide = r#"{"seq":1,"mtype":1,"serviceMethod":"/a","meta":"","bodyCodec":98,"body":"Ā","ptf":[]}"#;
        let err = decode_frame(wide.as_bytes(), &mut Message::new()).unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);
    }
}
