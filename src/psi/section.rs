//! Section reassembly and table-id routing (spec §4.4, component C5).
//!
//! Operates per PID: watches the continuity counter, reassembles section
//! bytes across packet boundaries starting at `payload_unit_start`, validates
//! length/CRC, and routes completed sections by `(table_id, extension)` to
//! handlers registered with [`Demultiplexer::attach`].

use crate::packet::Packet;
use crate::utils::Crc32Mpeg2;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A fully reassembled and CRC-validated PSI/SI section.
#[derive(Debug, Clone)]
pub struct Section {
    pub table_id: u8,
    pub table_id_extension: u16,
    pub version: u8,
    pub current_next: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    /// Bytes after the 8-byte common section header, up to but excluding CRC.
    pub payload: Vec<u8>,
    /// The complete section including header and trailing CRC, for decoders
    /// (e.g. the service filter) that need to re-derive the raw bytes.
    pub raw: Vec<u8>,
}

/// Handle returned by [`Demultiplexer::attach`]; pass to [`Demultiplexer::detach`]
/// to remove the registration. Dropping the handle does not detach — detach
/// is explicit, matching the original subtable processor's registration API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachHandle(u64);

type Handler = Arc<dyn Fn(&Section) + Send + Sync>;

struct Registration {
    id: u64,
    extension: Option<u16>,
    handler: Handler,
}

#[derive(Default)]
struct PidAssembler {
    buffer: Vec<u8>,
    expected_len: Option<usize>,
    last_continuity: Option<u8>,
    last_version: HashMap<(u8, u16), u8>,
}

impl PidAssembler {
    fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = None;
    }
}

/// Demultiplexes PSI/SI sections from one or more PIDs and routes completed
/// sections to registered handlers.
pub struct Demultiplexer {
    pids: HashMap<u16, PidAssembler>,
    handlers: HashMap<u8, Vec<Registration>>,
    next_id: AtomicU64,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self {
            pids: HashMap::new(),
            handlers: HashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for sections with the given `table_id`, optionally
    /// restricted to one `table_id_extension` (e.g. a specific program number
    /// for PMT-like tables with per-extension versioning).
    pub fn attach(
        &mut self,
        table_id: u8,
        extension: Option<u16>,
        handler: impl Fn(&Section) + Send + Sync + 'static,
    ) -> AttachHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.entry(table_id).or_default().push(Registration {
            id,
            extension,
            handler: Arc::new(handler),
        });
        AttachHandle(id)
    }

    /// Removes a previously attached handler. No-op if already detached.
    pub fn detach(&mut self, handle: AttachHandle) {
        for regs in self.handlers.values_mut() {
            regs.retain(|r| r.id != handle.0);
        }
    }

    /// Drops all reassembly state for `pid`, forcing the next
    /// `payload_unit_start` to begin a fresh section. Used when the TS
    /// structure change flag (§4.6) is set.
    pub fn reset_pid(&mut self, pid: u16) {
        if let Some(state) = self.pids.get_mut(&pid) {
            state.reset();
        }
    }

    /// Feeds one packet on `pid` into its reassembler, firing any handlers
    /// whose section(s) complete as a result.
    pub fn push_packet(&mut self, pid: u16, packet: &Packet<'_>) {
        if packet.pid() != pid {
            return;
        }

        let state = self.pids.entry(pid).or_default();

        let discontinuity_flagged = packet
            .adaptation_field()
            .map(|af| af.discontinuity)
            .unwrap_or(false);

        if let Some(last) = state.last_continuity {
            let expected = (last + 1) & 0x0F;
            if packet.continuity_counter() != expected && !discontinuity_flagged {
                state.reset();
            }
        }
        state.last_continuity = Some(packet.continuity_counter());

        if discontinuity_flagged {
            state.reset();
        }

        if packet.payload_unit_start() {
            let Some(section_start) = packet.section_start() else {
                return;
            };
            state.buffer.clear();
            state.buffer.extend_from_slice(section_start);
        } else {
            let Some(payload) = packet.payload() else {
                return;
            };
            if state.expected_len.is_none() && state.buffer.is_empty() {
                // Mid-section arrival with no prior payload_unit_start seen; wait.
                return;
            }
            state.buffer.extend_from_slice(payload);
        }

        loop {
            if state.expected_len.is_none() {
                if state.buffer.len() < 3 {
                    break;
                }
                let section_length = (((state.buffer[1] & 0x0F) as usize) << 8)
                    | state.buffer[2] as usize;
                state.expected_len = Some(3 + section_length);
            }
            let total = state.expected_len.unwrap();
            if state.buffer.len() < total {
                break;
            }
            if total > 4096 {
                state.reset();
                break;
            }

            let raw = state.buffer[..total].to_vec();
            state.buffer.drain(..total);
            state.expected_len = None;

            if let Some(section) = Self::parse_section(&raw) {
                let key = (section.table_id, section.table_id_extension);
                let seen_version = state.last_version.get(&key).copied();
                if seen_version == Some(section.version) {
                    // Idempotent re-delivery of an already-seen version still
                    // fires handlers (callers rely on this for §8's "applying
                    // the same PAT twice changes no field" idempotence law),
                    // but does not reset assembly state.
                } else {
                    state.last_version.insert(key, section.version);
                }
                if let Some(regs) = self.handlers.get(&section.table_id) {
                    for reg in regs {
                        if reg.extension.is_none() || reg.extension == Some(section.table_id_extension) {
                            (reg.handler)(&section);
                        }
                    }
                }
            }
        }
    }

    fn parse_section(raw: &[u8]) -> Option<Section> {
        if raw.len() < 8 {
            return None;
        }
        let table_id = raw[0];
        let section_syntax_indicator = raw[1] & 0x80 != 0;
        if !section_syntax_indicator {
            return None;
        }
        let table_id_extension = ((raw[3] as u16) << 8) | raw[4] as u16;
        let version = (raw[5] >> 1) & 0x1F;
        let current_next = raw[5] & 0x01 != 0;
        let section_number = raw[6];
        let last_section_number = raw[7];

        let crc = Crc32Mpeg2::new();
        let without_crc = &raw[..raw.len() - 4];
        let computed = crc.calculate(without_crc);
        let stored = u32::from_be_bytes(raw[raw.len() - 4..].try_into().ok()?);
        if computed != stored {
            return None;
        }

        Some(Section {
            table_id,
            table_id_extension,
            version,
            current_next,
            section_number,
            last_section_number,
            payload: raw[8..raw.len() - 4].to_vec(),
            raw: raw.to_vec(),
        })
    }
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a complete section (header + payload + CRC) the way the service
/// filter's PAT/PMT rewriter needs — given the already-encoded table body
/// (everything after `last_section_number`), this fills in
/// `section_length` and appends the MPEG-2 CRC32.
pub fn encode_section(table_id: u8, extension: u16, version: u8, current_next: bool, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4; // extension..body + CRC, excluding the 3-byte header up to length field
    let mut out = Vec::with_capacity(3 + section_length);
    out.push(table_id);
    out.push(0x80 | 0x30 | (((section_length >> 8) & 0x0F) as u8));
    out.push((section_length & 0xFF) as u8);
    out.push((extension >> 8) as u8);
    out.push((extension & 0xFF) as u8);
    out.push(0xC0 | (version << 1) | if current_next { 0x01 } else { 0x00 });
    out.push(0x00); // section_number
    out.push(0x00); // last_section_number
    out.extend_from_slice(body);
    let crc = Crc32Mpeg2::new().calculate(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}
