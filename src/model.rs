//! Persistent entities: multiplexes, services, and elementary-stream PIDs.
//!
//! These mirror the shape of a tuned multiplex as understood by the engine,
//! independent of where they are stored. [`crate::store`] persists them;
//! [`crate::cache`] mirrors one multiplex's worth in memory for the reader
//! thread to mutate without blocking on I/O.

use std::collections::BTreeMap;
use std::fmt;

/// Delivery system a multiplex is broadcast over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliverySystem {
    DvbT,
    DvbC,
    DvbS,
    DvbS2,
    Atsc,
    IsdbT,
}

/// Opaque key/value tuning parameter document (frequency, modulation,
/// polarisation, symbol rate, ...). Recognized keys vary by [`DeliverySystem`]
/// and are interpreted only by the front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuningParams(BTreeMap<String, String>);

impl TuningParams {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses a YAML-like `key: value` mapping, one pair per line.
    pub fn parse(text: &str) -> Self {
        let mut params = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                params.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self(params)
    }
}

impl fmt::Display for TuningParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.0 {
            writeln!(f, "{key}: {value}")?;
        }
        Ok(())
    }
}

/// A single modulated RF channel, identified by a locally assigned UID that
/// stays stable across renames of `network_id`/`transport_stream_id`.
#[derive(Debug, Clone)]
pub struct Multiplex {
    pub uid: u32,
    pub delivery_system: DeliverySystem,
    pub tuning_params: TuningParams,
    pub network_id: Option<u16>,
    pub transport_stream_id: Option<u16>,
    pub pat_version: Option<u8>,
}

impl Multiplex {
    pub fn new(uid: u32, delivery_system: DeliverySystem, tuning_params: TuningParams) -> Self {
        Self {
            uid,
            delivery_system,
            tuning_params,
            network_id: None,
            transport_stream_id: None,
            pat_version: None,
        }
    }

    /// `(network_id, transport_stream_id)` once both are known; this pair is
    /// unique across the store.
    pub fn ids(&self) -> Option<(u16, u16)> {
        match (self.network_id, self.transport_stream_id) {
            (Some(n), Some(t)) => Some((n, t)),
            _ => None,
        }
    }
}

/// TV/Radio/Data classification carried by SDT/VCT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Tv,
    Radio,
    Data,
    Unknown,
}

impl Default for ServiceType {
    fn default() -> Self {
        ServiceType::Unknown
    }
}

/// SDT/VCT running status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningStatus {
    Undefined,
    NotRunning,
    StartsInSeconds,
    Pausing,
    Running,
}

impl Default for RunningStatus {
    fn default() -> Self {
        RunningStatus::Undefined
    }
}

impl RunningStatus {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => RunningStatus::NotRunning,
            2 => RunningStatus::StartsInSeconds,
            3 => RunningStatus::Pausing,
            4 => RunningStatus::Running,
            _ => RunningStatus::Undefined,
        }
    }
}

/// Maximum byte length of a [`Service`] name, matching the source database's
/// `SERVICE_MAX_NAME_LEN`.
pub const SERVICE_MAX_NAME_LEN: usize = 256;

/// A program (TV channel, radio station, data service) carried within a
/// multiplex. A service exists only while at least one of `seen_in_pat` /
/// `seen_in_sdt` is set; see [`Service::exists`].
#[derive(Debug, Clone)]
pub struct Service {
    pub mux_uid: u32,
    pub service_id: u16,
    pub name: String,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub pmt_version: Option<u8>,
    pub service_type: ServiceType,
    pub source_id: u16,
    pub conditional_access: bool,
    pub running_status: RunningStatus,
    pub eit_present_following: bool,
    pub eit_schedule: bool,
    pub seen_in_pat: bool,
    pub seen_in_sdt: bool,
}

impl Service {
    pub fn new(mux_uid: u32, service_id: u16) -> Self {
        Self {
            mux_uid,
            service_id,
            name: String::new(),
            pmt_pid: 0,
            pcr_pid: 0,
            pmt_version: None,
            service_type: ServiceType::Unknown,
            source_id: 0,
            conditional_access: false,
            running_status: RunningStatus::Undefined,
            eit_present_following: false,
            eit_schedule: false,
            seen_in_pat: false,
            seen_in_sdt: false,
        }
    }

    /// A service with neither seen bit set is deletable at the next writeback.
    pub fn exists(&self) -> bool {
        self.seen_in_pat || self.seen_in_sdt
    }

    /// Sets `name`, truncating to [`SERVICE_MAX_NAME_LEN`] bytes at a char
    /// boundary and normalizing whitespace/control characters first.
    pub fn set_name(&mut self, raw: &str) {
        self.name = normalize_service_name(raw);
    }
}

/// Collapses runs of whitespace to a single space, strips control
/// characters, and trims the ends. Applied to every service name decoded
/// from SDT or VCT before storage.
pub fn normalize_service_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = false;
    for ch in raw.chars() {
        if ch.is_control() {
            continue;
        }
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    let trimmed = out.trim_end().to_string();
    if trimmed.len() <= SERVICE_MAX_NAME_LEN {
        return trimmed;
    }
    let mut end = SERVICE_MAX_NAME_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// A descriptor in a PMT's program- or stream-level descriptor loop.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

/// Conditional-access descriptor tag (ISO/IEC 13818-1 table 2-39); a service
/// is CA-controlled if this tag appears anywhere in its PMT, program-level or
/// per-stream.
pub const DESCRIPTOR_TAG_CA: u8 = 0x09;

/// One elementary stream belonging to a service, as carried in its PMT.
#[derive(Debug, Clone)]
pub struct PidInfo {
    pub pid: u16,
    pub stream_type: u8,
    pub subtype: Option<String>,
    pub pmt_version: u8,
    pub descriptors: Vec<Descriptor>,
}

/// The elementary-stream layout of one service as last decoded from its PMT.
#[derive(Debug, Clone, Default)]
pub struct ProgramInfo {
    pub pids: Vec<PidInfo>,
}

impl ProgramInfo {
    pub fn pid_set(&self) -> std::collections::BTreeSet<u16> {
        self.pids.iter().map(|p| p.pid).collect()
    }

    pub fn first_of_type(&self, is_match: impl Fn(u8) -> bool) -> Option<&PidInfo> {
        self.pids.iter().find(|p| is_match(p.stream_type))
    }
}

/// Parses a `net.ts.svc` fully qualified service id, all three fields hex.
pub fn parse_fqid(text: &str) -> Option<(u16, u16, u16)> {
    let mut parts = text.split('.');
    let net = u16::from_str_radix(parts.next()?, 16).ok()?;
    let ts = u16::from_str_radix(parts.next()?, 16).ok()?;
    let svc = u16::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((net, ts, svc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_exists_until_both_seen_bits_clear() {
        let mut svc = Service::new(1, 0x64);
        assert!(!svc.exists());
        svc.seen_in_pat = true;
        assert!(svc.exists());
        svc.seen_in_sdt = true;
        svc.seen_in_pat = false;
        assert!(svc.exists());
        svc.seen_in_sdt = false;
        assert!(!svc.exists());
    }

    #[test]
    fn name_normalization_collapses_whitespace_and_strips_control_chars() {
        let normalized = normalize_service_name("BBC\u{0}  ONE\t\tHD ");
        assert_eq!(normalized, "BBC ONE HD");
    }

    #[test]
    fn fqid_parses_hex_triple() {
        assert_eq!(parse_fqid("1.2.64"), Some((1, 2, 0x64)));
        assert_eq!(parse_fqid("not-an-fqid"), None);
    }

    #[test]
    fn tuning_params_round_trip_through_text() {
        let mut params = TuningParams::new();
        params.set("Frequency", "474000000").set("Modulation", "QAM64");
        let text = params.to_string();
        let parsed = TuningParams::parse(&text);
        assert_eq!(parsed.get("Frequency"), Some("474000000"));
        assert_eq!(parsed.get("Modulation"), Some("QAM64"));
    }
}
