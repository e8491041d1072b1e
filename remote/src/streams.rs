use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::instrument;

use crate::protocol::{Message, RawFrame};

/// Largest frame either fabric accepts, a data chunk plus its header must fit.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn codec() -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Framed send stream for length-delimited messages.
///
/// Generic over the underlying writer type - works with TCP, Unix sockets, or any AsyncWrite.
#[derive(Debug)]
pub struct SendStream<W> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        Self {
            framed: tokio_util::codec::FramedWrite::new(stream, codec()),
        }
    }

    /// Writes an already encoded frame, used by the broker to relay without re-encoding.
    pub async fn send_raw(&mut self, frame: &RawFrame) -> anyhow::Result<()> {
        self.framed.send(frame.as_bytes().clone()).await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, message), fields(command = %message.command()))]
    pub async fn send(&mut self, address: &str, message: &Message) -> anyhow::Result<()> {
        let frame = RawFrame::new(address, message)?;
        self.send_raw(&frame).await
    }

    /// Sends a bincode-encoded object, used by the store protocol.
    pub async fn send_object<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited messages.
#[derive(Debug)]
pub struct RecvStream<R> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        Self {
            framed: tokio_util::codec::FramedRead::new(stream, codec()),
        }
    }

    /// Next frame, `None` once the peer closed the stream.
    pub async fn recv_raw(&mut self) -> anyhow::Result<Option<RawFrame>> {
        match futures::StreamExt::next(&mut self.framed).await {
            Some(frame) => {
                let bytes = frame?.freeze();
                Ok(Some(RawFrame::parse(bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Next frame decoded into a typed message, paired with its address.
    pub async fn recv(&mut self) -> anyhow::Result<Option<(String, Message)>> {
        match self.recv_raw().await? {
            Some(frame) => {
                let message = frame.message()?;
                Ok(Some((frame.address().to_string(), message)))
            }
            None => Ok(None),
        }
    }

    /// Like [`Self::recv`] but gives up after `timeout`.
    pub async fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<(String, Message)>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::Error::new(ReplyTimeout(timeout))),
        }
    }

    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bincode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }
}

/// No reply arrived within the bounded wait.
#[derive(Debug, thiserror::Error)]
#[error("no reply within {0:?}")]
pub struct ReplyTimeout(pub std::time::Duration);

pub type NetworkSendStream = SendStream<tokio::net::tcp::OwnedWriteHalf>;
pub type NetworkRecvStream = RecvStream<tokio::net::tcp::OwnedReadHalf>;
pub type LocalSendStream = SendStream<tokio::net::unix::OwnedWriteHalf>;
pub type LocalRecvStream = RecvStream<tokio::net::unix::OwnedReadHalf>;
