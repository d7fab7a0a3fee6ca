//! Length-prefixed JSON codecs for the two request-response protocols.
//!
//! Frames are `u32-le length || json`. A frame longer than [`MAX_PAYLOAD`]
//! drops the stream; each header read, body read and write races a
//! [`TIMEOUT_READ_WRITE`] deadline.

use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response::Codec;
use libp2p::StreamProtocol;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::messages::{JoinPartyRequest, JoinPartyResponse, TssAck, WrappedMessage};
use crate::{MAX_PAYLOAD, TIMEOUT_READ_WRITE};

const LENGTH_HEADER: usize = 4;

async fn read_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut header = [0u8; LENGTH_HEADER];
    tokio::time::timeout(TIMEOUT_READ_WRITE, io.read_exact(&mut header))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read header deadline"))??;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds max payload {}", len, MAX_PAYLOAD),
        ));
    }

    let mut body = vec![0u8; len];
    tokio::time::timeout(TIMEOUT_READ_WRITE, io.read_exact(&mut body))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read body deadline"))??;

    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<T, M>(io: &mut T, msg: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let body = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing to write {} byte frame", body.len()),
        ));
    }

    let mut frame = Vec::with_capacity(LENGTH_HEADER + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    tokio::time::timeout(TIMEOUT_READ_WRITE, async {
        io.write_all(&frame).await?;
        io.close().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write deadline"))?
}

/// Codec for `/p2p/tss`: a wrapped message in, an empty ack back.
#[derive(Debug, Clone, Default)]
pub struct WireCodec;

#[async_trait]
impl Codec for WireCodec {
    type Protocol = StreamProtocol;
    type Request = WrappedMessage;
    type Response = TssAck;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<WrappedMessage>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<TssAck>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: WrappedMessage,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &req).await
    }

    async fn write_response<T>(&mut self, _: &StreamProtocol, io: &mut T, res: TssAck) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &res).await
    }
}

/// Codec for `/p2p/join-party`.
#[derive(Debug, Clone, Default)]
pub struct JoinPartyCodec;

#[async_trait]
impl Codec for JoinPartyCodec {
    type Protocol = StreamProtocol;
    type Request = JoinPartyRequest;
    type Response = JoinPartyResponse;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<JoinPartyRequest>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<JoinPartyResponse>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: JoinPartyRequest,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        res: JoinPartyResponse,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &res).await
    }
}
