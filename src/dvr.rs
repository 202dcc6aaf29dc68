//! Downstream source trait (spec §6): a byte-stream device yielding aligned
//! 188-byte TS packets.

use crate::error::{EngineError, Result};
use crate::packet::PACKET_SIZE;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// A source of aligned TS packets. The core requires only a bounded,
/// timing-out batched read — `read(buf, max, timeout_ms) -> n_bytes` in
/// spec §6's words.
#[async_trait]
pub trait DvrSource: Send {
    /// Reads up to `max_packets` packets, waiting at most `timeout` for the
    /// first byte. Returns a buffer whose length is a multiple of
    /// [`PACKET_SIZE`]; an empty buffer means the read timed out with no
    /// data, which is not an error.
    async fn read_batch(&mut self, max_packets: usize, timeout: Duration) -> Result<Vec<u8>>;
}

/// Wraps any `AsyncRead` device (e.g. a DVB adapter's demux character
/// device opened with `tokio::fs::File`) as a [`DvrSource`].
pub struct DeviceDvrSource<R> {
    device: R,
}

impl<R: AsyncRead + Unpin + Send> DeviceDvrSource<R> {
    pub fn new(device: R) -> Self {
        Self { device }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> DvrSource for DeviceDvrSource<R> {
    async fn read_batch(&mut self, max_packets: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_packets * PACKET_SIZE];
        let read = tokio::time::timeout(timeout, self.device.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                buf.truncate(n - (n % PACKET_SIZE));
                Ok(buf)
            }
            Ok(Err(err)) => Err(EngineError::Io(err)),
            Err(_) => Ok(Vec::new()), // timed out, no data this batch
        }
    }
}

/// An in-memory source fed by a channel of pre-built packet batches, used by
/// tests and the integration test's synthetic pipeline.
pub struct ChannelDvrSource {
    batches: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelDvrSource {
    pub fn new() -> (mpsc::UnboundedSender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { batches: rx })
    }
}

#[async_trait]
impl DvrSource for ChannelDvrSource {
    async fn read_batch(&mut self, _max_packets: usize, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.batches.recv()).await {
            Ok(Some(batch)) => Ok(batch),
            Ok(None) => Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "dvr channel closed",
            ))),
            Err(_) => Ok(Vec::new()),
        }
    }
}
