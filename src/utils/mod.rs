//! # Utility Functions and Types
//!
//! Common helpers shared across the PSI/SI decoders and the rewriting service
//! filter.
//!
//! ## Bit Operations
//!
//! ```rust
//! use tsengine::utils::BitReader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = vec![0b10110011u8];
//! let mut reader = BitReader::new(&data);
//! let value = reader.read_bits(3)?;
//! assert_eq!(value, 0b101);
//! # Ok(())
//! # }
//! ```
//!
//! ## CRC Calculation
//!
//! ```rust
//! use tsengine::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let checksum = crc.calculate(b"Hello, world!");
//! println!("CRC32: {:08x}", checksum);
//! ```

/// Bit manipulation and bitstream reading utilities.
pub mod bits;

/// CRC calculation implementations.
pub mod crc;

pub use bits::BitReader;
pub use crc::Crc32Mpeg2;
