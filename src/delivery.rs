//! Delivery sink trait and MRL parsing (spec §6).
//!
//! The core only ever calls through this trait; concrete UDP/file/RTP
//! backends are out of scope (spec §1) and are left to be implemented
//! downstream. [`MemorySink`] is provided as the in-process default, used
//! by tests and anywhere a caller wants packets buffered rather than sent
//! over the network.

use crate::error::{EngineError, Result};
use crate::packet::{PACKET_SIZE, PID_NULL};
use parking_lot::Mutex;

/// A delivery backend for one service filter's output stream.
///
/// `destroy()` from the original API is not part of this trait — `Drop`
/// already gives every implementation the same "release resources when
/// done" hook without a separate virtual call.
pub trait DeliverySink: Send + Sync {
    fn output_packet(&self, packet: &[u8; PACKET_SIZE]) -> Result<()>;
    fn output_block(&self, data: &[u8]) -> Result<()>;
    /// Reserves `n` packet slots at the start of the output stream for a
    /// header (PAT+PMT) installed later via [`DeliverySink::set_header`].
    /// Slots carry stuffing (null) packets until installed.
    fn reserve_header_space(&self, n: usize);
    /// Installs up to the reserved number of header packets, overwriting
    /// the stuffing slots in place.
    fn set_header(&self, packets: Vec<[u8; PACKET_SIZE]>);
}

fn stuffing_packet() -> [u8; PACKET_SIZE] {
    let mut packet = [0xFFu8; PACKET_SIZE];
    packet[0] = crate::packet::SYNC_BYTE;
    packet[1] = (PID_NULL >> 8) as u8 & 0x1F;
    packet[2] = (PID_NULL & 0xFF) as u8;
    packet[3] = 0x10;
    packet
}

#[derive(Default)]
struct SinkState {
    buffer: Vec<u8>,
    header_reserved: usize,
}

/// An in-process sink that buffers every packet it receives.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> Vec<u8> {
        self.state.lock().buffer.clone()
    }
}

impl DeliverySink for MemorySink {
    fn output_packet(&self, packet: &[u8; PACKET_SIZE]) -> Result<()> {
        self.state.lock().buffer.extend_from_slice(packet);
        Ok(())
    }

    fn output_block(&self, data: &[u8]) -> Result<()> {
        self.state.lock().buffer.extend_from_slice(data);
        Ok(())
    }

    fn reserve_header_space(&self, n: usize) {
        let mut state = self.state.lock();
        state.header_reserved = n;
        for _ in 0..n {
            state.buffer.extend_from_slice(&stuffing_packet());
        }
    }

    fn set_header(&self, packets: Vec<[u8; PACKET_SIZE]>) {
        let mut state = self.state.lock();
        let n = packets.len().min(state.header_reserved);
        for (i, packet) in packets.into_iter().take(n).enumerate() {
            let start = i * PACKET_SIZE;
            state.buffer[start..start + PACKET_SIZE].copy_from_slice(&packet);
        }
    }
}

/// A parsed Media Resource Locator: `scheme://host[:port][,opt=val,...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mrl {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub options: Vec<(String, String)>,
}

impl Mrl {
    pub fn parse(text: &str) -> Result<Self> {
        let (url_part, options_part) = match text.find(',') {
            Some(idx) => (&text[..idx], Some(&text[idx + 1..])),
            None => (text, None),
        };
        let url = url::Url::parse(url_part)
            .map_err(|e| EngineError::InvalidArgument(format!("invalid MRL {text:?}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::InvalidArgument(format!("MRL missing host: {text:?}")))?
            .to_string();

        let mut options = Vec::new();
        if let Some(options_part) = options_part {
            for pair in options_part.split(',') {
                if let Some((k, v)) = pair.split_once('=') {
                    options.push((k.to_string(), v.to_string()));
                }
            }
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            options,
        })
    }
}
