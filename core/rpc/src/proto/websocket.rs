// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Runs any stream protocol over WebSocket messages.
//!
//! The sub-protocol runs against an in-memory virtual connection. The bytes
//! one `pack` produces travel as one binary WebSocket message; one received
//! message must hold exactly one frame and is decoded by a fresh sub-protocol
//! instance.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::trace;

use super::{Proto, ProtoError, ProtoFunc};
use crate::message::Message;
use crate::status::{Code, Status};
use crate::transport::{BoxedStream, Conn, ConnKind};

pub const WEBSOCKET_PROTO_ID: u8 = b'w';

#[derive(Default)]
struct VirtualBufs {
    inbound: BytesMut,
    outbound: BytesMut,
}

/// In-memory byte stream: reads drain `inbound`, writes append to
/// `outbound`. Reading past the end yields EOF.
#[derive(Clone, Default)]
struct VirtualConn {
    bufs: Arc<Mutex<VirtualBufs>>,
}

impl VirtualConn {
    fn fill(&self, data: &[u8]) {
        let mut bufs = self.bufs.lock();
        bufs.inbound.clear();
        bufs.inbound.extend_from_slice(data);
    }

    fn take_written(&self) -> Bytes {
        self.bufs.lock().outbound.split().freeze()
    }

    fn clear_written(&self) {
        self.bufs.lock().outbound.clear();
    }
}

impl AsyncRead for VirtualConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut bufs = self.bufs.lock();
        let n = bufs.inbound.len().min(buf.remaining());
        buf.put_slice(&bufs.inbound.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VirtualConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bufs.lock().outbound.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct WriteSide {
    ws: SplitSink<WebSocketStream<BoxedStream>, WsMessage>,
    conn: VirtualConn,
    proto: Box<dyn Proto>,
}

struct ReadSide {
    ws: SplitStream<WebSocketStream<BoxedStream>>,
    sub: ProtoFunc,
}

pub struct WebSocketProto {
    sub_name: &'static str,
    writer: AsyncMutex<WriteSide>,
    reader: AsyncMutex<ReadSide>,
}

impl WebSocketProto {
    fn new(ws: WebSocketStream<BoxedStream>, sub: &ProtoFunc) -> Result<Self, Status> {
        let (sink, stream) = ws.split();

        let wconn = VirtualConn::default();
        let wproto = sub(Conn::from_stream(wconn.clone()))?;
        let (_, sub_name) = wproto.version();

        Ok(WebSocketProto {
            sub_name,
            writer: AsyncMutex::new(WriteSide {
                ws: sink,
                conn: wconn,
                proto: wproto,
            }),
            reader: AsyncMutex::new(ReadSide {
                ws: stream,
                sub: sub.clone(),
            }),
        })
    }

    /// Name of the protocol carried inside the WebSocket messages.
    pub fn sub_name(&self) -> &'static str {
        self.sub_name
    }
}

/// Protocol factory bridging `sub` over WebSocket connections. Byte stream
/// connections are handed to `sub` unchanged.
pub fn websocket_proto_func(sub: ProtoFunc) -> ProtoFunc {
    Arc::new(move |conn: Conn| {
        let local = conn.local_addr().map(String::from);
        let peer = conn.peer_addr().map(String::from);
        match conn.into_kind() {
            ConnKind::WebSocket(ws) => {
                Ok(Box::new(WebSocketProto::new(*ws, &sub)?) as Box<dyn Proto>)
            }
            ConnKind::Stream(stream) => sub(Conn::from_stream(stream).with_addrs(local, peer)),
        }
    })
}

#[async_trait]
impl Proto for WebSocketProto {
    fn version(&self) -> (u8, &'static str) {
        (WEBSOCKET_PROTO_ID, "websocket")
    }

    async fn pack(&self, msg: &mut Message) -> Result<(), Status> {
        let mut side = self.writer.lock().await;
        side.conn.clear_written();
        side.proto.pack(msg).await?;
        let data = side.conn.take_written();
        side.ws
            .send(WsMessage::Binary(data))
            .await
            .map_err(|e| ProtoError::Write(io::Error::other(e)))?;
        Ok(())
    }

    async fn unpack(&self, msg: &mut Message) -> Result<(), Status> {
        let mut side = self.reader.lock().await;
        let data = loop {
            let frame = side
                .ws
                .next()
                .await
                .ok_or(ProtoError::Closed)?
                .map_err(|e| ProtoError::WebSocket(e.to_string()))?;
            match frame {
                WsMessage::Binary(data) => break data,
                WsMessage::Text(text) => break Bytes::copy_from_slice(text.as_bytes()),
                WsMessage::Close(_) => return Err(ProtoError::Closed.into()),
                other => trace!(kind = ?other, "skipping websocket control frame"),
            }
        };

        let conn = VirtualConn::default();
        conn.fill(&data);
        let proto = (side.sub)(Conn::from_stream(conn))?;
        match proto.unpack(msg).await {
            Ok(()) if msg.size() as usize >= data.len() => Ok(()),
            Ok(()) => Err(ProtoError::Malformed(format!(
                "{} bytes after the frame in one websocket message",
                data.len() - msg.size() as usize
            ))
            .into()),
            // a short message, not a lost peer
            Err(st) if st.code() == Code::CONN_CLOSED => Err(ProtoError::Malformed(format!(
                "websocket message of {} bytes ends inside a frame",
                data.len()
            ))
            .into()),
            Err(st) => Err(st),
        }
    }

    async fn close(&self) -> Result<(), Status> {
        let mut side = self.writer.lock().await;
        side.ws
            .close()
            .await
            .map_err(|e| ProtoError::Write(io::Error::other(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{json_proto_func, testutil};

    async fn ws_pair() -> (WebSocketStream<BoxedStream>, WebSocketStream<BoxedStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (a, b): (BoxedStream, BoxedStream) = (Box::new(a), Box::new(b));
        let (client, server) = tokio::join!(
            async {
                tokio_tungstenite::client_async("ws://localhost/", a)
                    .await
                    .expect("client handshake failed")
                    .0
            },
            async {
                tokio_tungstenite::accept_async(b)
                    .await
                    .expect("server handshake failed")
            }
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_round_trip_over_websocket() {
        let pf = websocket_proto_func(json_proto_func());
        let (a, b) = ws_pair().await;
        let client = pf(Conn::from_websocket(a)).unwrap();
        let server = pf(Conn::from_websocket(b)).unwrap();
        assert_eq!(client.version(), (WEBSOCKET_PROTO_ID, "websocket"));

        for mut sample in testutil::samples(true) {
            client.pack(&mut sample).await.unwrap();
            let mut got = Message::new();
            server.unpack(&mut got).await.unwrap();
            testutil::assert_same(&sample, &got);
        }
    }

    #[tokio::test]
    async fn test_same_bytes_same_message() {
        let sample = testutil::samples(false).remove(0);
        let frame = crate::proto::json::encode_frame(&sample).unwrap();

        // the sub-protocol directly over a byte stream
        let (mut raw, b) = tokio::io::duplex(1 << 16);
        let direct = json_proto_func()(Conn::from_stream(b)).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut raw, &frame)
            .await
            .unwrap();
        let mut from_stream = Message::new();
        direct.unpack(&mut from_stream).await.unwrap();

        // the same bytes as one websocket message
        let (mut peer, b) = ws_pair().await;
        let bridged = websocket_proto_func(json_proto_func())(Conn::from_websocket(b)).unwrap();
        peer.send(WsMessage::Ping(Bytes::new())).await.unwrap();
        peer.send(WsMessage::Binary(Bytes::from(frame))).await.unwrap();
        let mut from_ws = Message::new();
        bridged.unpack(&mut from_ws).await.unwrap();

        testutil::assert_same(&from_stream, &from_ws);
        assert_eq!(from_stream.size(), from_ws.size());
    }

    #[tokio::test]
    async fn test_malformed_messages() {
        let sample = testutil::samples(false).remove(0);
        let frame = crate::proto::json::encode_frame(&sample).unwrap().to_vec();

        let (mut peer, b) = ws_pair().await;
        let bridged = websocket_proto_func(json_proto_func())(Conn::from_websocket(b)).unwrap();

        let truncated = frame[..frame.len() - 3].to_vec();
        peer.send(WsMessage::Binary(Bytes::from(truncated))).await.unwrap();
        let err = bridged.unpack(&mut Message::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);

        let mut padded = frame.clone();
        padded.extend_from_slice(b"junk");
        peer.send(WsMessage::Binary(Bytes::from(padded))).await.unwrap();
        let err = bridged.unpack(&mut Message::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);
        assert!(err.cause().unwrap().contains("4 bytes after the frame"));

        // earlier garbage does not shift later messages
        peer.send(WsMessage::Binary(Bytes::from(frame))).await.unwrap();
        let mut got = Message::new();
        bridged.unpack(&mut got).await.unwrap();
        testutil::assert_same(&sample, &got);
    }

    #[tokio::test]
    async fn test_close_and_fallthrough() {
        let (mut peer, b) = ws_pair().await;
        let bridged = websocket_proto_func(json_proto_func())(Conn::from_websocket(b)).unwrap();
        peer.close(None).await.unwrap();
        let err = bridged.unpack(&mut Message::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::CONN_CLOSED);

        let (a, _b) = tokio::io::duplex(64);
        let direct = websocket_proto_func(json_proto_func())(Conn::from_stream(a)).unwrap();
        assert_eq!(direct.version().1, "json");
    }
}
