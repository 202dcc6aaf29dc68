//! ATSC PSIP table decoders: MGT, VCT, STT (spec §4.5).

use crate::model::ServiceType;
use crate::psi::section::Section;
use std::collections::HashMap;

/// Table id for the Master Guide Table.
pub const TABLE_ID_MGT: u8 = 0xC7;
/// Table id for the Terrestrial Virtual Channel Table.
pub const TABLE_ID_TVCT: u8 = 0xC8;
/// Table id for the Cable Virtual Channel Table.
pub const TABLE_ID_CVCT: u8 = 0xC9;
/// Table id for the System Time Table.
pub const TABLE_ID_STT: u8 = 0xCD;

/// One EIT/ETT (or other PSIP) directory entry from the MGT.
#[derive(Debug, Clone)]
pub struct MgtTableEntry {
    pub table_type: u16,
    pub pid: u16,
    pub version: u8,
    pub number_bytes: u32,
}

#[derive(Debug, Clone)]
pub struct Mgt {
    pub version: u8,
    pub tables: Vec<MgtTableEntry>,
}

fn parse_mgt_payload(version: u8, payload: &[u8]) -> Option<Mgt> {
    if payload.len() < 3 {
        return None;
    }
    let tables_defined = ((payload[1] as usize) << 8) | payload[2] as usize;
    let mut pos = 3;
    let mut tables = Vec::with_capacity(tables_defined);
    for _ in 0..tables_defined {
        if pos + 11 > payload.len() {
            break;
        }
        let table_type = ((payload[pos] as u16) << 8) | payload[pos + 1] as u16;
        let pid = (((payload[pos + 2] & 0x1F) as u16) << 8) | payload[pos + 3] as u16;
        let version = payload[pos + 4] & 0x1F;
        let number_bytes = u32::from_be_bytes(payload[pos + 5..pos + 9].try_into().ok()?);
        let descriptors_length = (((payload[pos + 9] & 0x0F) as usize) << 8) | payload[pos + 10] as usize;
        pos += 11 + descriptors_length;
        tables.push(MgtTableEntry {
            table_type,
            pid,
            version,
            number_bytes,
        });
    }
    Some(Mgt { version, tables })
}

/// Accumulates MGT sections (the MGT is always a single section in practice
/// but the assembler handles the general multi-section case).
#[derive(Default)]
pub struct MgtAssembler {
    version: Option<u8>,
    last_section_number: Option<u8>,
    sections: HashMap<u8, Vec<u8>>,
}

impl MgtAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, section: &Section) -> Option<Mgt> {
        if section.table_id != TABLE_ID_MGT {
            return None;
        }
        if self.version != Some(section.version) {
            self.sections.clear();
            self.version = Some(section.version);
        }
        self.last_section_number = Some(section.last_section_number);
        self.sections.insert(section.section_number, section.payload.clone());
        let last = self.last_section_number?;
        if (0..=last).all(|n| self.sections.contains_key(&n)) {
            let mut payload = Vec::new();
            for n in 0..=last {
                payload.extend(self.sections[&n].clone());
            }
            parse_mgt_payload(self.version?, &payload)
        } else {
            None
        }
    }
}

/// One channel record from TVCT/CVCT.
#[derive(Debug, Clone)]
pub struct VctChannel {
    pub short_name: String,
    pub major_channel_number: u16,
    pub minor_channel_number: u16,
    pub channel_tsid: u16,
    pub program_number: u16,
    pub source_id: u16,
    pub service_type: ServiceType,
}

#[derive(Debug, Clone)]
pub struct Vct {
    pub version: u8,
    pub cable: bool,
    pub channels: Vec<VctChannel>,
}

fn decode_utf16be_name(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn atsc_service_type(code: u8) -> ServiceType {
    match code & 0x3F {
        0x01 => ServiceType::Tv,
        0x02 => ServiceType::Radio,
        0x03 | 0x04 => ServiceType::Data,
        _ => ServiceType::Unknown,
    }
}

const VCT_CHANNEL_RECORD_FIXED_LEN: usize = 32;

fn parse_vct_payload(cable: bool, version: u8, payload: &[u8]) -> Option<Vct> {
    if payload.is_empty() {
        return None;
    }
    let num_channels = payload[1] as usize;
    let mut pos = 2;
    let mut channels = Vec::with_capacity(num_channels);
    for _ in 0..num_channels {
        if pos + VCT_CHANNEL_RECORD_FIXED_LEN > payload.len() {
            break;
        }
        let record = &payload[pos..pos + VCT_CHANNEL_RECORD_FIXED_LEN];
        let short_name = decode_utf16be_name(&record[0..14]);
        let major_minor = ((record[14] as u32) << 16) | ((record[15] as u32) << 8) | record[16] as u32;
        let major_channel_number = ((major_minor >> 10) & 0x3FF) as u16;
        let minor_channel_number = (major_minor & 0x3FF) as u16;
        let channel_tsid = ((record[18] as u16) << 8) | record[19] as u16;
        let program_number = ((record[20] as u16) << 8) | record[21] as u16;
        let service_type = atsc_service_type(record[23]);
        let source_id = ((record[24] as u16) << 8) | record[25] as u16;
        let descriptors_length = (((record[26] & 0x0F) as usize) << 8) | record[27] as usize;
        pos += VCT_CHANNEL_RECORD_FIXED_LEN + descriptors_length;

        channels.push(VctChannel {
            short_name,
            major_channel_number,
            minor_channel_number,
            channel_tsid,
            program_number,
            source_id,
            service_type,
        });
    }
    Some(Vct {
        version,
        cable,
        channels,
    })
}

/// Accumulates VCT sections, restarting on version change.
#[derive(Default)]
pub struct VctAssembler {
    version: Option<u8>,
    last_section_number: Option<u8>,
    sections: HashMap<u8, Vec<u8>>,
    cable: bool,
}

impl VctAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, section: &Section) -> Option<Vct> {
        let cable = match section.table_id {
            TABLE_ID_TVCT => false,
            TABLE_ID_CVCT => true,
            _ => return None,
        };
        if self.version != Some(section.version) {
            self.sections.clear();
            self.version = Some(section.version);
            self.cable = cable;
        }
        self.last_section_number = Some(section.last_section_number);
        self.sections.insert(section.section_number, section.payload.clone());
        let last = self.last_section_number?;
        if (0..=last).all(|n| self.sections.contains_key(&n)) {
            let mut payload = Vec::new();
            for n in 0..=last {
                payload.extend(self.sections[&n].clone());
            }
            parse_vct_payload(self.cable, self.version?, &payload)
        } else {
            None
        }
    }
}

/// GPS-time system clock from the STT. `gps_seconds` counts from the GPS
/// epoch (1980-01-06T00:00:00Z); `gps_utc_offset` is the leap-second offset
/// to subtract to get UTC.
#[derive(Debug, Clone, Copy)]
pub struct Stt {
    pub gps_seconds: u32,
    pub gps_utc_offset: u8,
}

/// STT is a single, unversioned (current_next always true) section; no
/// assembler state is needed.
pub fn decode_stt(section: &Section) -> Option<Stt> {
    if section.table_id != TABLE_ID_STT || section.payload.len() < 6 {
        return None;
    }
    let gps_seconds = u32::from_be_bytes(section.payload[1..5].try_into().ok()?);
    let gps_utc_offset = section.payload[5];
    Some(Stt {
        gps_seconds,
        gps_utc_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mgt_table_directory() {
        let payload = vec![
            0x00, // protocol_version
            0x00, 0x01, // tables_defined = 1
            0x00, 0x04, // table_type = EIT-0
            0xE3, 0x00, // PID 0x300
            0x00, // version 0
            0x00, 0x00, 0x01, 0x00, // number_bytes
            0xF0, 0x00, // no descriptors
        ];
        let section = Section {
            table_id: TABLE_ID_MGT,
            table_id_extension: 0,
            version: 0,
            current_next: true,
            section_number: 0,
            last_section_number: 0,
            payload,
            raw: Vec::new(),
        };
        let mut asm = MgtAssembler::new();
        let mgt = asm.accept(&section).unwrap();
        assert_eq!(mgt.tables.len(), 1);
        assert_eq!(mgt.tables[0].pid, 0x300);
    }

    #[test]
    fn decodes_stt_gps_time() {
        let section = Section {
            table_id: TABLE_ID_STT,
            table_id_extension: 0,
            version: 0,
            current_next: true,
            section_number: 0,
            last_section_number: 0,
            payload: vec![0x00, 0x00, 0x00, 0x00, 0x0A, 37],
            raw: Vec::new(),
        };
        let stt = decode_stt(&section).unwrap();
        assert_eq!(stt.gps_seconds, 0x0A);
        assert_eq!(stt.gps_utc_offset, 37);
    }

    fn vct_channel_record(name: &str, major: u16, minor: u16, program: u16, source_id: u16) -> Vec<u8> {
        let mut record = vec![0u8; VCT_CHANNEL_RECORD_FIXED_LEN];
        let name_units: Vec<u16> = name.encode_utf16().collect();
        for (i, unit) in name_units.iter().take(7).enumerate() {
            record[i * 2] = (unit >> 8) as u8;
            record[i * 2 + 1] = (unit & 0xFF) as u8;
        }
        let major_minor = ((major as u32 & 0x3FF) << 10) | (minor as u32 & 0x3FF);
        record[14] = ((major_minor >> 16) & 0xFF) as u8;
        record[15] = ((major_minor >> 8) & 0xFF) as u8;
        record[16] = (major_minor & 0xFF) as u8;
        record[20] = (program >> 8) as u8;
        record[21] = (program & 0xFF) as u8;
        record[23] = 0x01; // Tv
        record[24] = (source_id >> 8) as u8;
        record[25] = (source_id & 0xFF) as u8;
        record // descriptors_length bytes already zero
    }

    #[test]
    fn decodes_vct_channel_record() {
        let mut payload = vec![0x00, 0x01];
        payload.extend(vct_channel_record("KABC", 7, 1, 3, 0x1234));
        let section = Section {
            table_id: TABLE_ID_TVCT,
            table_id_extension: 0,
            version: 0,
            current_next: true,
            section_number: 0,
            last_section_number: 0,
            payload,
            raw: Vec::new(),
        };
        let mut asm = VctAssembler::new();
        let vct = asm.accept(&section).unwrap();
        assert_eq!(vct.channels.len(), 1);
        assert_eq!(vct.channels[0].short_name, "KABC");
        assert_eq!(vct.channels[0].major_channel_number, 7);
        assert_eq!(vct.channels[0].minor_channel_number, 1);
        assert_eq!(vct.channels[0].source_id, 0x1234);
        assert_eq!(vct.channels[0].service_type, ServiceType::Tv);
    }
}
