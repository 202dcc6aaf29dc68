#![doc(html_root_url = "https://docs.rs/tsengine/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsengine - a digital television streaming engine
//!
//! `tsengine` reads an MPEG-2 transport stream from a tuner or file, demuxes
//! and decodes its PSI/SI tables (PAT, PMT, SDT, NIT, and the ATSC PSIP
//! tables MGT/VCT/STT), maintains a cache of services and multiplexes backed
//! by a pluggable store, and rewrites a single selected service's PAT/PMT
//! onto an output delivery sink. A tuner controller sequences front-end
//! retunes and a scan state machine walks a channel scan to completion.
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tsengine = "0.1.0"
//! ```
//!
//! ### Minimal engine example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsengine::delivery::MemorySink;
//! use tsengine::dvr::ChannelDvrSource;
//! use tsengine::engine::{Engine, EngineConfig};
//! use tsengine::frontend::SimulatedFrontend;
//! use tsengine::store::InMemoryStore;
//!
//! # fn main() {
//! let store = Arc::new(InMemoryStore::new());
//! let frontend = Arc::new(SimulatedFrontend::new(16));
//! let (_tx, dvr) = ChannelDvrSource::new();
//! let sink = Arc::new(MemorySink::new());
//!
//! let engine = Engine::start(store, frontend, dvr, sink, 0x64, EngineConfig::default());
//! assert_eq!(engine.total_packets(), 0);
//! # }
//! ```
//!
//! ## Module overview
//!
//! - [`packet`]: 188-byte transport packet parsing (component C4).
//! - [`psi`]: PSI/SI section reassembly and table decoders (C5/C6).
//! - [`dispatch`]: PID filter group dispatch (C7).
//! - [`dvr`]: raw byte sources a reader can pull batches from.
//! - [`reader`]: the TS reader task and its control handle (C8).
//! - [`servicefilter`]: single-service PAT/PMT rewrite (C9).
//! - [`delivery`]: output sinks and MRL parsing.
//! - [`frontend`]: tunable hardware (or simulated) front-end abstraction.
//! - [`tuner`]: retune sequencing and current-service/multiplex authority (C10).
//! - [`events`]: the `source.event` notification bus (C11).
//! - [`scan`]: the channel scan state machine (C12).
//! - [`engine`]: wires all of the above into one owned context.
//! - [`model`]: persistent entity types shared by [`store`] and [`cache`].
//! - [`store`]: the multiplex/service persistence trait.
//! - [`cache`]: the in-memory mirror of one tuned multiplex.
//! - [`object`]: per-class reference-counted allocation limits.
//! - [`config`]: process-wide engine configuration.
//! - [`utils`]: bitstream reading and MPEG-2 CRC32.
//! - [`error`]: the engine's error and result types.

/// Error types and utilities
pub mod error;

/// Process-wide engine configuration
pub mod config;

/// Bitstream reading and CRC32 utilities
pub mod utils;

/// Per-class reference-counted allocation limits
pub mod object;

/// Persistent entity types: multiplexes, services, elementary PIDs
pub mod model;

/// Multiplex/service persistence trait and in-memory implementation
pub mod store;

/// In-memory mirror of one tuned multiplex
pub mod cache;

/// 188-byte transport stream packet parsing
pub mod packet;

/// PSI/SI section reassembly and table decoders
pub mod psi;

/// PID filter group dispatch
pub mod dispatch;

/// Raw byte sources for the reader task
pub mod dvr;

/// The TS reader task and its control handle
pub mod reader;

/// Single-service PAT/PMT rewrite
pub mod servicefilter;

/// Output delivery sinks and MRL parsing
pub mod delivery;

/// Tunable front-end abstraction
pub mod frontend;

/// Retune sequencing and current-service/multiplex authority
pub mod tuner;

/// Hierarchical `source.event` notification bus
pub mod events;

/// The channel scan state machine
pub mod scan;

/// Wires the cache, store, event bus, reader, tuner and scan together
pub mod engine;

pub use error::{EngineError, Result};
