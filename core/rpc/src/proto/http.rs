// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! HTTP/1.1 compatible framing. Calls and pushes travel as `POST` requests,
//! replies as responses; plain HTTP clients can talk to an endpoint using it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use super::{Proto, ProtoError, ProtoFunc, StreamIo, read_exact_bytes};
use crate::codec::{Codec, NIL_CODEC_ID};
use crate::message::{META_STATUS, Message, MessageType};
use crate::status::{Code, Status};
use crate::tfilter::{GZIP_ID, PipeTFilter};
use crate::transport::Conn;

pub const HTTP_PROTO_ID: u8 = b'h';

const HEADER_SEQ: &str = "X-Seq";
const HEADER_MTYPE: &str = "X-MType";
const HEADER_CONTENT_ENCODING: &str = "X-Content-Encoding";

const STATUS_OK: u16 = 200;
const STATUS_BUSINESS_ERROR: u16 = 299;

const MAX_LINE: u64 = 64 * 1024;

// headers owned by the framing, never copied into meta
const RESERVED_HEADERS: &[&str] = &[
    "Host",
    "Connection",
    "User-Agent",
    "Accept",
    "Accept-Encoding",
    "Transfer-Encoding",
    "Content-Type",
    "Content-Length",
    "Content-Encoding",
    HEADER_SEQ,
    HEADER_MTYPE,
    HEADER_CONTENT_ENCODING,
];

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
        || name
            .get(..8)
            .is_some_and(|p| p.eq_ignore_ascii_case("Content-"))
}

fn malformed(what: impl Into<String>) -> Status {
    ProtoError::Malformed(format!("http: {}", what.into())).into()
}

fn check_header_text(s: &str) -> Result<(), Status> {
    if s.contains(['\r', '\n']) {
        return Err(malformed(format!("line break in header {:?}", s)));
    }
    Ok(())
}

pub struct HttpProto {
    io: StreamIo,
}

pub fn http_proto_func() -> ProtoFunc {
    Arc::new(|conn: Conn| {
        let stream = conn.into_stream("http")?;
        Ok(Box::new(HttpProto {
            io: StreamIo::new(stream),
        }) as Box<dyn Proto>)
    })
}

fn gzip_only(pipe: &PipeTFilter) -> Result<bool, Status> {
    match pipe.ids() {
        [] => Ok(false),
        [GZIP_ID] => Ok(true),
        ids => Err(ProtoError::UnsupportedFilter(format!(
            "http only supports a single gzip filter, got {:?}",
            String::from_utf8_lossy(ids)
        ))
        .into()),
    }
}

pub(crate) fn encode_frame(msg: &Message) -> Result<Vec<u8>, Status> {
    let gzip = gzip_only(msg.pipe())?;
    check_header_text(msg.service_method())?;

    let status = msg.status();
    let business_error = msg.mtype().is_reply() && !status.is_ok();

    let (body, content_type, gzip) = if business_error {
        let body = Bytes::from(status.to_json());
        (body, Some(Codec::Json.content_type()), false)
    } else {
        let content_type = match msg.body_codec() {
            NIL_CODEC_ID => None,
            id => Some(
                Codec::from_id(id)
                    .map(|c| c.content_type())
                    .ok_or_else(|| {
                        Status::with_code(Code::UNSUPPORTED_CODEC_TYPE)
                            .with_cause(format!("codec id {}", id))
                    })?,
            ),
        };
        (msg.pack_body()?, content_type, gzip)
    };

    let mut head = if msg.mtype().is_reply() {
        if business_error {
            format!("HTTP/1.1 {} Business Error\r\n", STATUS_BUSINESS_ERROR)
        } else {
            format!("HTTP/1.1 {} OK\r\n", STATUS_OK)
        }
    } else {
        let target = if msg.service_method().is_empty() {
            "/"
        } else {
            msg.service_method()
        };
        format!("POST {} HTTP/1.1\r\n", target)
    };

    head.push_str(&format!("{}: {}\r\n", HEADER_SEQ, msg.seq()));
    head.push_str(&format!("{}: {}\r\n", HEADER_MTYPE, msg.mtype().as_u8()));
    for (k, v) in msg.meta().iter() {
        if k == META_STATUS {
            continue;
        }
        check_header_text(k)?;
        check_header_text(v)?;
        if k.is_empty() || k.contains(':') || is_reserved(k) {
            return Err(malformed(format!("meta key {:?} cannot be a header", k)));
        }
        head.push_str(&format!("{}: {}\r\n", k, v));
    }
    if let Some(ct) = content_type {
        head.push_str(&format!("Content-Type: {}\r\n", ct));
    }
    if gzip {
        head.push_str("Content-Encoding: gzip\r\n");
        head.push_str(&format!("{}: gzip\r\n", HEADER_CONTENT_ENCODING));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut out = head.into_bytes();
    out.extend_from_slice(&body);
    Ok(out)
}

async fn read_line<R>(reader: &mut R, msg: &Message, total: &mut u32) -> Result<String, Status>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_LINE)
        .read_until(b'\n', &mut line)
        .await
        .map_err(ProtoError::read)?;
    if n == 0 {
        return Err(ProtoError::Closed.into());
    }
    if line.last() != Some(&b'\n') {
        if n as u64 >= MAX_LINE {
            return Err(malformed("header line too long"));
        }
        return Err(ProtoError::Closed.into());
    }
    *total = total.saturating_add(n as u32);
    msg.check_size(*total)?;

    let line = String::from_utf8(line).map_err(|_| malformed("header is not utf-8"))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[async_trait]
impl Proto for HttpProto {
    fn version(&self) -> (u8, &'static str) {
        (HTTP_PROTO_ID, "http")
    }

    async fn pack(&self, msg: &mut Message) -> Result<(), Status> {
        let buf = encode_frame(msg)?;
        msg.set_size(buf.len() as u32)?;
        self.io.write_all(&buf).await
    }

    async fn unpack(&self, msg: &mut Message) -> Result<(), Status> {
        let mut reader = self.io.reader().lock().await;
        let mut total = 0u32;

        let first = read_line(&mut *reader, msg, &mut total).await?;
        let response = first.starts_with("HTTP/");
        let mut http_status = (STATUS_OK, String::new());
        if response {
            let mut parts = first.splitn(3, ' ');
            let _version = parts.next();
            let code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| malformed(format!("bad status line {:?}", first)))?;
            http_status = (code, parts.next().unwrap_or_default().to_string());
            msg.set_mtype(MessageType::Reply);
        } else {
            let mut parts = first.split(' ');
            let (_method, target) = match (parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => (m, t),
                _ => return Err(malformed(format!("bad request line {:?}", first))),
            };
            msg.set_service_method(target);
            msg.set_mtype(MessageType::Call);
        }
        msg.set_seq(0);

        let mut content_length = 0u64;
        let mut codec = None;
        let mut gzip = false;
        loop {
            let line = read_line(&mut *reader, msg, &mut total).await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(format!("bad header line {:?}", line)))?;
            let (name, value) = (name.trim(), value.trim());

            if name.eq_ignore_ascii_case(HEADER_SEQ) {
                msg.set_seq(value.parse().map_err(|_| malformed("bad X-Seq"))?);
            } else if name.eq_ignore_ascii_case(HEADER_MTYPE) {
                let mtype = value
                    .parse::<u8>()
                    .ok()
                    .and_then(MessageType::from_u8)
                    .ok_or_else(|| malformed("bad X-MType"))?;
                msg.set_mtype(mtype);
            } else if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse().map_err(|_| malformed("bad Content-Length"))?;
            } else if name.eq_ignore_ascii_case("Content-Type") {
                codec = Some(Codec::from_content_type(value).unwrap_or(Codec::Binary));
            } else if name.eq_ignore_ascii_case("Content-Encoding")
                || name.eq_ignore_ascii_case(HEADER_CONTENT_ENCODING)
            {
                if value.eq_ignore_ascii_case("gzip") {
                    gzip = true;
                } else if !value.eq_ignore_ascii_case("identity") {
                    return Err(ProtoError::UnsupportedFilter(value.to_string()).into());
                }
            } else if !is_reserved(name) {
                msg.meta_mut().add(name, value);
            }
        }

        let frame_size = u64::from(total) + content_length;
        let frame_size =
            u32::try_from(frame_size).map_err(|_| malformed("Content-Length too large"))?;
        msg.set_size(frame_size)?;
        let body = read_exact_bytes(&mut *reader, content_length).await?;
        drop(reader);

        match http_status {
            (STATUS_OK, _) => {}
            (STATUS_BUSINESS_ERROR, _) => {
                let status = Status::from_json(&body)?;
                msg.set_status(&status);
                return Ok(());
            }
            (code, reason) => {
                msg.set_status(&Status::new(i32::from(code), reason));
                return Ok(());
            }
        }

        if gzip {
            msg.pipe_mut().append(GZIP_ID);
        }
        let codec = match codec {
            Some(c) => c.id(),
            None if body.is_empty() => NIL_CODEC_ID,
            None => Codec::Binary.id(),
        };
        msg.set_body_codec(codec);
        msg.unpack_body(body)
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
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_round_trip() {
        let pf = http_proto_func();
        let (client, server) = testutil::pair(&pf);
        for mut sample in testutil::samples(false) {
            client.pack(&mut sample).await.unwrap();

            let mut got = Message::new();
            server.unpack(&mut got).await.unwrap();
            if sample.mtype().is_reply() {
                // responses carry no target
                got.set_service_method(sample.service_method());
            }
            testutil::assert_same(&sample, &got);
            assert_eq!(sample.size(), got.size());
        }
    }

    #[test]
    fn test_request_layout() {
        let mut msg = Message::new();
        msg.set_seq(9);
        msg.set_mtype(MessageType::Call);
        msg.set_service_method("/home/test?endpoint_id=110");
        msg.meta_mut().add("author", "liuzhiming");
        msg.set_payload(Payload::json(&1).unwrap());

        let text = String::from_utf8(encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(
            text,
            "POST /home/test?endpoint_id=110 HTTP/1.1\r\n\
             X-Seq: 9\r\n\
             X-MType: 1\r\n\
             author: liuzhiming\r\n\
             Content-Type: application/json;charset=utf-8\r\n\
             Content-Length: 1\r\n\r\n1"
        );
    }

    #[tokio::test]
    async fn test_business_error_reply() {
        let mut reply = Message::new();
        reply.set_seq(2);
        reply.set_mtype(MessageType::Reply);
        reply.set_payload(Payload::json(&"ignored").unwrap());
        reply.set_status(&Status::new(1, "test error"));

        let frame = String::from_utf8(encode_frame(&reply).unwrap()).unwrap();
        assert!(frame.starts_with("HTTP/1.1 299 Business Error\r\n"));
        assert!(frame.ends_with(r#"{"code":1,"msg":"test error","cause":""}"#));
        assert!(!frame.contains(META_STATUS));

        let pf = http_proto_func();
        let (client, server) = testutil::pair(&pf);
        client.pack(&mut reply).await.unwrap();
        let mut got = Message::new();
        server.unpack(&mut got).await.unwrap();
        assert_eq!(got.seq(), 2);
        assert_eq!(got.status(), Status::new(1, "test error"));
        assert!(got.body().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_peers() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let proto = http_proto_func()(Conn::from_stream(b)).unwrap();

        // plain client request without framework headers
        raw.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\nTrace: abc\r\n\r\n")
            .await
            .unwrap();
        let mut msg = Message::new();
        proto.unpack(&mut msg).await.unwrap();
        assert_eq!(msg.mtype(), MessageType::Call);
        assert_eq!(msg.seq(), 0);
        assert_eq!(msg.service_method(), "/ping");
        assert_eq!(msg.meta().get("Trace"), Some("abc"));
        assert!(!msg.meta().contains("Host"));
        assert_eq!(msg.body_codec(), NIL_CODEC_ID);

        // upstream failure reported by a proxy
        raw.write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy")
            .await
            .unwrap();
        let mut msg = Message::new();
        proto.unpack(&mut msg).await.unwrap();
        assert_eq!(msg.mtype(), MessageType::Reply);
        let st = msg.status();
        assert_eq!(st.code(), Code::new(503));
        assert_eq!(st.msg(), "Service Unavailable");
    }

    #[test]
    fn test_filter_and_header_checks() {
        let mut msg = Message::new();
        msg.set_mtype(MessageType::Push);
        msg.set_service_method("/a");
        msg.pipe_mut().append(GZIP_ID);
        msg.pipe_mut().append(GZIP_ID);
        let err = encode_frame(&msg).unwrap_err();
        assert_eq!(err.code(), Code::UNSUPPORTED_TX);

        msg.pipe_mut().reset();
        msg.meta_mut().add("k", "a\r\nInjected: 1");
        let err = encode_frame(&msg).unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);
    }

    #[tokio::test]
    async fn test_size_limit() {
        let (mut raw, b) = tokio::io::duplex(4096);
        let proto = http_proto_func()(Conn::from_stream(b)).unwrap();
        raw.write_all(b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\n")
            .await
            .unwrap();
        let mut msg = Message::new();
        msg.set_size_limit(64);
        let err = proto.unpack(&mut msg).await.unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);
    }
}
