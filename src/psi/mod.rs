//! Program-Specific Information / Service Information: section reassembly
//! (C5) and table decoders (C6).

pub mod atsc;
pub mod descriptor;
pub mod nit;
pub mod pat;
pub mod pmt;
pub mod sdt;
pub mod section;

pub use atsc::{Mgt, MgtAssembler, Stt, Vct, VctAssembler};
pub use nit::{Nit, NitAssembler};
pub use pat::{Pat, PatAssembler};
pub use pmt::{Pmt, PmtAssembler};
pub use sdt::{Sdt, SdtAssembler};
pub use section::{encode_section, AttachHandle, Demultiplexer, Section};
