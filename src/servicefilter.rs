//! Service filter (spec §4.8, component C9): rewrites a multiplex's PAT/PMT
//! down to a single service and passes its elementary/PCR packets through
//! unchanged, so a [`crate::delivery::DeliverySink`] downstream sees a
//! self-contained single-program transport stream.

use crate::delivery::DeliverySink;
use crate::dispatch::PacketHandler;
use crate::packet::{Packet, PACKET_SIZE, PID_PAT, SYNC_BYTE};
use crate::psi::pat::{Pat, TABLE_ID_PAT};
use crate::psi::pmt::{Pmt, PmtStream, TABLE_ID_PMT};
use crate::psi::encode_section;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// MPEG/H.26x video stream types recognized for the `avs_only` video pick.
const VIDEO_STREAM_TYPES: &[u8] = &[0x01, 0x02, 0x10, 0x1B, 0x24];
/// Audio stream types (MPEG-1/2, AC-3, AAC/LATM, ...) for the `avs_only` audio pick.
const AUDIO_STREAM_TYPES: &[u8] = &[0x03, 0x04, 0x0F, 0x11, 0x81];
/// DVB subtitle/teletext-as-subtitle stream type.
const SUBTITLE_STREAM_TYPE: u8 = 0x06;

#[derive(Default)]
struct FilterState {
    pmt_pid: Option<u16>,
    pcr_pid: Option<u16>,
    elementary_pids: HashSet<u16>,
    pat_cc: u8,
    pmt_cc: u8,
    last_pat_version: Option<u8>,
}

/// Rewrites PAT/PMT for `target_service_id` and forwards everything else for
/// that service unchanged. Feed it completed tables via [`ServiceFilter::on_pat`]
/// / [`ServiceFilter::on_pmt`] (typically from handlers attached to the source
/// multiplex's own PAT/PMT assemblers) and register it as a packet filter for
/// the service's elementary and PCR PIDs to get pass-through.
pub struct ServiceFilter {
    sink: Arc<dyn DeliverySink>,
    target_service_id: u16,
    avs_only: bool,
    state: Mutex<FilterState>,
}

impl ServiceFilter {
    pub fn new(sink: Arc<dyn DeliverySink>, target_service_id: u16, avs_only: bool) -> Self {
        Self {
            sink,
            target_service_id,
            avs_only,
            state: Mutex::new(FilterState::default()),
        }
    }

    /// The elementary/PCR PIDs currently being passed through, for a caller
    /// that needs to (re)register packet filters as the PMT changes.
    pub fn passthrough_pids(&self) -> HashSet<u16> {
        let state = self.state.lock();
        let mut pids = state.elementary_pids.clone();
        if let Some(pcr_pid) = state.pcr_pid {
            pids.insert(pcr_pid);
        }
        pids
    }

    pub fn pmt_pid(&self) -> Option<u16> {
        self.state.lock().pmt_pid
    }

    /// Rewrites a source PAT down to one entry for the target service (plus
    /// the NIT entry, if the original carried one) and emits it immediately.
    /// No-op if the target service is not present in this PAT, or if this
    /// PAT's version has already been rewritten (spec §4.8(3): rewrite on
    /// version change only, so feeding the same PAT twice is a no-op).
    pub fn on_pat(&self, pat: &Pat) {
        let Some(pmt_pid) = pat
            .entries
            .iter()
            .find(|e| e.program_number == self.target_service_id)
            .map(|e| e.pid)
        else {
            return;
        };

        if self.state.lock().last_pat_version == Some(pat.version) {
            return;
        }

        let mut body = Vec::new();
        if let Some(nit_pid) = pat.nit_pid() {
            body.push(0x00);
            body.push(0x00);
            body.push(0xE0 | ((nit_pid >> 8) as u8 & 0x1F));
            body.push((nit_pid & 0xFF) as u8);
        }
        body.push((self.target_service_id >> 8) as u8);
        body.push((self.target_service_id & 0xFF) as u8);
        body.push(0xE0 | ((pmt_pid >> 8) as u8 & 0x1F));
        body.push((pmt_pid & 0xFF) as u8);

        let section = encode_section(TABLE_ID_PAT, pat.transport_stream_id, pat.version, true, &body);

        let mut state = self.state.lock();
        state.pmt_pid = Some(pmt_pid);
        state.last_pat_version = Some(pat.version);
        let packets = pack_section(PID_PAT, &section, &mut state.pat_cc);
        drop(state);

        for packet in &packets {
            if let Err(err) = self.sink.output_packet(packet) {
                log::warn!("service filter: failed to output rewritten PAT packet: {err}");
            }
        }
    }

    /// Rewrites a source PMT for the target service, optionally narrowed to
    /// the first video/audio/subtitle stream when `avs_only` is set, and
    /// emits it immediately. No-op for any other program's PMT, or if
    /// [`ServiceFilter::on_pat`] has not yet established the output PMT PID.
    pub fn on_pmt(&self, pmt: &Pmt) {
        if pmt.program_number != self.target_service_id {
            return;
        }

        let mut state = self.state.lock();
        let Some(pmt_pid) = state.pmt_pid else {
            return;
        };

        let streams: Vec<&PmtStream> = if self.avs_only {
            select_avs(&pmt.streams)
        } else {
            pmt.streams.iter().collect()
        };

        state.elementary_pids = streams.iter().map(|s| s.elementary_pid).collect();
        state.pcr_pid = Some(pmt.pcr_pid);

        let mut body = Vec::with_capacity(4 + streams.len() * 5);
        body.push(0xE0 | ((pmt.pcr_pid >> 8) as u8 & 0x1F));
        body.push((pmt.pcr_pid & 0xFF) as u8);
        body.push(0xF0);
        body.push(0x00); // program descriptors dropped in the rewritten output
        for stream in &streams {
            body.push(stream.stream_type);
            body.push(0xE0 | ((stream.elementary_pid >> 8) as u8 & 0x1F));
            body.push((stream.elementary_pid & 0xFF) as u8);
            body.push(0xF0);
            body.push(0x00); // per-stream descriptors dropped too
        }

        let section = encode_section(TABLE_ID_PMT, pmt.program_number, pmt.version, true, &body);
        let packets = pack_section(pmt_pid, &section, &mut state.pmt_cc);
        drop(state);

        for packet in &packets {
            if let Err(err) = self.sink.output_packet(packet) {
                log::warn!("service filter: failed to output rewritten PMT packet: {err}");
            }
        }
    }
}

impl PacketHandler for ServiceFilter {
    /// Passes raw elementary/PCR packets for the target service straight to
    /// the sink. PAT and PMT packets are never forwarded this way — they are
    /// only ever emitted as rewritten sections from [`ServiceFilter::on_pat`]
    /// / [`ServiceFilter::on_pmt`].
    fn on_packet(&self, _group: &str, packet: &Packet<'_>) {
        let pid = packet.pid();
        let passthrough = {
            let state = self.state.lock();
            state.elementary_pids.contains(&pid) || state.pcr_pid == Some(pid)
        };
        if !passthrough {
            return;
        }
        if let Ok(raw) = <[u8; PACKET_SIZE]>::try_from(packet.raw()) {
            if let Err(err) = self.sink.output_packet(&raw) {
                log::warn!("service filter: failed to pass through packet on pid {pid}: {err}");
            }
        }
    }
}

fn select_avs(streams: &[PmtStream]) -> Vec<&PmtStream> {
    let mut picked = Vec::new();
    if let Some(video) = streams.iter().find(|s| VIDEO_STREAM_TYPES.contains(&s.stream_type)) {
        picked.push(video);
    }
    if let Some(audio) = streams.iter().find(|s| AUDIO_STREAM_TYPES.contains(&s.stream_type)) {
        picked.push(audio);
    }
    if let Some(subtitle) = streams.iter().find(|s| s.stream_type == SUBTITLE_STREAM_TYPE) {
        picked.push(subtitle);
    }
    picked
}

/// Packs a complete section (with pointer field) into one or more 188-byte
/// packets, advancing `cc` for each packet emitted.
fn pack_section(pid: u16, section: &[u8], cc: &mut u8) -> Vec<[u8; PACKET_SIZE]> {
    let mut with_pointer = Vec::with_capacity(section.len() + 1);
    with_pointer.push(0x00);
    with_pointer.extend_from_slice(section);

    let mut out = Vec::new();
    let mut pos = 0;
    let mut first = true;
    while pos < with_pointer.len() {
        let mut packet = [0xFFu8; PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F);
        packet[2] = (pid & 0xFF) as u8;
        packet[3] = 0x10 | (*cc & 0x0F);
        *cc = (*cc + 1) & 0x0F;

        let avail = PACKET_SIZE - 4;
        let n = (with_pointer.len() - pos).min(avail);
        packet[4..4 + n].copy_from_slice(&with_pointer[pos..pos + n]);
        pos += n;
        out.push(packet);
        first = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MemorySink;
    use crate::psi::pat::PatEntry;

    fn sample_pat() -> Pat {
        Pat {
            transport_stream_id: 1,
            version: 3,
            entries: vec![
                PatEntry { program_number: 0, pid: 0x10 },
                PatEntry { program_number: 0x64, pid: 0x100 },
                PatEntry { program_number: 0x65, pid: 0x200 },
            ],
        }
    }

    fn sample_pmt(streams: Vec<PmtStream>) -> Pmt {
        Pmt {
            program_number: 0x64,
            version: 2,
            pcr_pid: 0x101,
            program_descriptors: Vec::new(),
            streams,
        }
    }

    #[test]
    fn rewritten_pat_contains_only_target_service_and_nit() {
        let sink = Arc::new(MemorySink::new());
        let filter = ServiceFilter::new(sink.clone(), 0x64, false);
        filter.on_pat(&sample_pat());

        let bytes = sink.buffered();
        let captured: Arc<Mutex<Option<crate::psi::pat::Pat>>> = Arc::new(Mutex::new(None));
        let captured2 = captured.clone();
        let mut demux = crate::psi::section::Demultiplexer::new();
        let pat_asm = Mutex::new(crate::psi::pat::PatAssembler::new());
        demux.attach(TABLE_ID_PAT, None, move |section| {
            if let Some(pat) = pat_asm.lock().accept(section) {
                *captured2.lock() = Some(pat);
            }
        });
        for chunk in bytes.chunks_exact(PACKET_SIZE) {
            demux.push_packet(PID_PAT, &Packet::parse(chunk).unwrap());
        }

        let pat = captured.lock().take().expect("decoded rewritten PAT");
        assert_eq!(pat.entries.len(), 2);
        assert_eq!(pat.nit_pid(), Some(0x10));
        assert_eq!(
            pat.entries.iter().find(|e| e.program_number == 0x64).unwrap().pid,
            0x100
        );
    }

    #[test]
    fn avs_only_pmt_keeps_first_video_audio_subtitle() {
        let sink = Arc::new(MemorySink::new());
        let filter = ServiceFilter::new(sink.clone(), 0x64, true);
        filter.on_pat(&sample_pat());

        let streams = vec![
            PmtStream { stream_type: 0x1B, elementary_pid: 0x201, descriptors: vec![] },
            PmtStream { stream_type: 0x81, elementary_pid: 0x202, descriptors: vec![] },
            PmtStream { stream_type: 0x81, elementary_pid: 0x203, descriptors: vec![] },
            PmtStream { stream_type: 0x06, elementary_pid: 0x204, descriptors: vec![] },
        ];
        filter.on_pmt(&sample_pmt(streams));

        let pids = filter.passthrough_pids();
        assert_eq!(pids.len(), 4); // video + audio + subtitle + pcr
        assert!(pids.contains(&0x201));
        assert!(pids.contains(&0x202));
        assert!(!pids.contains(&0x203)); // second audio dropped
        assert!(pids.contains(&0x204));
        assert!(pids.contains(&0x101)); // pcr
    }

    #[test]
    fn non_target_pmt_is_ignored() {
        let sink = Arc::new(MemorySink::new());
        let filter = ServiceFilter::new(sink.clone(), 0x64, false);
        filter.on_pat(&sample_pat());
        let mut other = sample_pmt(vec![]);
        other.program_number = 0x65;
        filter.on_pmt(&other);
        assert!(filter.passthrough_pids().is_empty());
    }

    #[test]
    fn elementary_packets_for_target_service_pass_through() {
        let sink = Arc::new(MemorySink::new());
        let filter = ServiceFilter::new(sink.clone(), 0x64, false);
        filter.on_pat(&sample_pat());
        filter.on_pmt(&sample_pmt(vec![PmtStream {
            stream_type: 0x1B,
            elementary_pid: 0x201,
            descriptors: vec![],
        }]));

        let before = sink.buffered().len();
        let mut data = vec![0u8; PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = (0x201 >> 8) as u8 & 0x1F;
        data[2] = (0x201 & 0xFF) as u8;
        data[3] = 0x10;
        filter.on_packet("test", &Packet::parse(&data).unwrap());

        assert_eq!(sink.buffered().len(), before + PACKET_SIZE);

        // A PID that isn't part of the service is dropped.
        let mut other = data.clone();
        other[2] = 0xFF;
        filter.on_packet("test", &Packet::parse(&other).unwrap());
        assert_eq!(sink.buffered().len(), before + PACKET_SIZE);
    }

    #[test]
    fn repeated_identical_pat_is_rewritten_only_once() {
        let sink = Arc::new(MemorySink::new());
        let filter = ServiceFilter::new(sink.clone(), 0x64, false);
        filter.on_pat(&sample_pat());
        let after_first = sink.buffered();

        filter.on_pat(&sample_pat());
        let after_second = sink.buffered();

        assert_eq!(after_first, after_second, "unchanged PAT version must not re-emit");
    }

    #[test]
    fn pat_version_bump_is_rewritten_again() {
        let sink = Arc::new(MemorySink::new());
        let filter = ServiceFilter::new(sink.clone(), 0x64, false);
        filter.on_pat(&sample_pat());
        let after_first = sink.buffered();

        let mut bumped = sample_pat();
        bumped.version = bumped.version.wrapping_add(1);
        filter.on_pat(&bumped);
        let after_second = sink.buffered();

        assert!(after_second.len() > after_first.len(), "version bump must re-emit");
    }
}
