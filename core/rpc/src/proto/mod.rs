// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Wire protocols. A protocol owns one connection and turns messages into
//! frames and back.

mod binary;
mod http;
mod json;
mod pb;
mod websocket;

pub use binary::{RawProto, raw_proto_func};
pub use http::{HttpProto, http_proto_func};
pub use json::{JsonProto, json_proto_func};
pub use pb::{PbProto, pb_proto_func};
pub use websocket::{WebSocketProto, websocket_proto_func};

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::message::Message;
use crate::status::{Code, Status};
use crate::transport::{BoxedStream, Conn};

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("connection closed")]
    Closed,
    #[error("read error: {0}")]
    Read(io::Error),
    #[error("write error: {0}")]
    Write(io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl From<ProtoError> for Status {
    fn from(err: ProtoError) -> Self {
        let code = match err {
            ProtoError::Closed | ProtoError::Read(_) | ProtoError::WebSocket(_) => {
                Code::CONN_CLOSED
            }
            ProtoError::Write(_) => Code::WRITE_FAILED,
            ProtoError::Malformed(_) => Code::BAD_MESSAGE,
            ProtoError::UnsupportedFilter(_) => Code::UNSUPPORTED_TX,
        };
        Status::with_code(code).with_cause(err.to_string())
    }
}

impl ProtoError {
    pub(crate) fn read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProtoError::Closed,
            _ => ProtoError::Read(err),
        }
    }
}

/// Framing contract between a session and its connection.
///
/// `pack` and `unpack` may run concurrently with each other; concurrent
/// `pack` calls must not interleave their frames.
#[async_trait]
pub trait Proto: Send + Sync {
    /// Protocol id and name.
    fn version(&self) -> (u8, &'static str);

    /// Write `msg` as one frame and record its wire size.
    async fn pack(&self, msg: &mut Message) -> Result<(), Status>;

    /// Read the next frame into `msg`.
    async fn unpack(&self, msg: &mut Message) -> Result<(), Status>;

    async fn close(&self) -> Result<(), Status>;
}

/// Builds a protocol instance for a connection.
pub type ProtoFunc = Arc<dyn Fn(Conn) -> Result<Box<dyn Proto>, Status> + Send + Sync>;

/// Split byte stream shared by the stream based protocols.
pub(crate) struct StreamIo {
    reader: AsyncMutex<BufReader<ReadHalf<BoxedStream>>>,
    writer: AsyncMutex<WriteHalf<BoxedStream>>,
}

impl StreamIo {
    pub(crate) fn new(stream: BoxedStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        StreamIo {
            reader: AsyncMutex::new(BufReader::new(r)),
            writer: AsyncMutex::new(w),
        }
    }

    pub(crate) fn reader(&self) -> &AsyncMutex<BufReader<ReadHalf<BoxedStream>>> {
        &self.reader
    }

    /// Read one `u32` big endian length prefixed frame, checking the limit
    /// of `msg` before buffering the payload.
    pub(crate) async fn read_frame(&self, msg: &mut Message) -> Result<Bytes, Status> {
        let mut reader = self.reader.lock().await;
        let len = reader.read_u32().await.map_err(ProtoError::read)?;
        msg.set_size(len.saturating_add(4))?;
        read_exact_bytes(&mut *reader, len as u64).await
    }

    pub(crate) async fn write_all(&self, data: &[u8]) -> Result<(), Status> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.map_err(ProtoError::Write)?;
        writer.flush().await.map_err(ProtoError::Write)?;
        Ok(())
    }

    pub(crate) async fn shutdown(&self) -> Result<(), Status> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(ProtoError::Write)?;
        Ok(())
    }
}

/// Read exactly `len` bytes, growing the buffer as data arrives.
pub(crate) async fn read_exact_bytes<R>(reader: &mut R, len: u64) -> Result<Bytes, Status>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(len.min(64 * 1024) as usize);
    let n = reader
        .take(len)
        .read_to_end(&mut buf)
        .await
        .map_err(ProtoError::read)?;
    if (n as u64) < len {
        return Err(ProtoError::Closed.into());
    }
    Ok(Bytes::from(buf))
}

/// Prefix `frame` with its `u32` big endian length.
pub(crate) fn length_prefixed(frame: &[u8]) -> Result<Vec<u8>, Status> {
    let len = u32::try_from(frame.len())
        .map_err(|_| ProtoError::Malformed(format!("frame of {} bytes", frame.len())))?;
    let mut out = Vec::with_capacity(frame.len() + 4);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(frame);
    Ok(out)
}
