//! # Error Types
//!
//! This module provides the error types used throughout the tsengine library.
//! It defines a central error type `EngineError` that encapsulates all possible
//! errors that can occur while demultiplexing, decoding, caching, and tuning.
//!
//! ## Example Usage
//!
//! ```rust
//! use tsengine::error::{EngineError, Result};
//!
//! fn validate_section(data: &[u8]) -> Result<()> {
//!     if data.len() > 4096 {
//!         return Err(EngineError::Parse { table: "generic", reason: "section too long".into() });
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the tsengine library.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O errors surfaced by the DVR source, store, or sink.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The object allocator ran out of memory for a class, or a dispatch batch
    /// could not be completed.
    #[error("out of memory")]
    OutOfMemory,

    /// A lookup (service, multiplex, PID, event) found nothing matching.
    #[error("not found: {0}")]
    NotFound(String),

    /// The persistent store reported a failure during a read or writeback.
    #[error("store error: {0}")]
    Store(String),

    /// A PSI/SI section or table failed to parse.
    #[error("parse error in {table}: {reason}")]
    Parse {
        /// Name of the table being decoded (e.g. "PAT", "PMT", "SDT").
        table: &'static str,
        /// Human readable description of what went wrong.
        reason: String,
    },

    /// The front-end failed to lock on the requested tuning parameters.
    #[error("tune failed: {reason}")]
    TuneFailed {
        /// Reason reported by the front-end, if any.
        reason: String,
    },

    /// An operation exceeded its allotted time.
    #[error("timeout waiting for {scope}")]
    Timeout {
        /// What the caller was waiting for (e.g. "front-end lock", "table set").
        scope: String,
    },

    /// The requested operation conflicts with one already in progress
    /// (a scan running, a service locked).
    #[error("busy: {0}")]
    Busy(String),

    /// A caller-supplied argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation requires authorization the caller does not have.
    #[error("authorization required")]
    AuthRequired,

    /// An unregistered object class was requested from the allocator.
    #[error("unknown object class: {0}")]
    UnknownClass(String),
}

/// A specialized Result type for tsengine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
