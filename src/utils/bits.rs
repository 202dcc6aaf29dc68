use crate::error::EngineError;
use crate::Result;

/// MSB-first bit-level reader over a byte slice.
///
/// PSI/SI fields below byte granularity (reserved bits, running status,
/// descriptor flag bits) are read with this rather than hand-rolled masks
/// when more than a couple of fields are packed into one byte run.
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
    bit_position: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            bit_position: 0,
        }
    }

    pub fn read_bits(&mut self, count: u8) -> Result<u32> {
        if count > 32 {
            return Err(EngineError::InvalidArgument(
                "cannot read more than 32 bits".into(),
            ));
        }

        let mut result = 0u32;
        let mut bits_left = count;

        while bits_left > 0 {
            if self.position >= self.data.len() {
                return Err(EngineError::Parse {
                    table: "bitreader",
                    reason: "reached end of data".into(),
                });
            }

            let byte = self.data[self.position];
            let bits_in_byte = 8 - self.bit_position;
            let bits_to_read = bits_in_byte.min(bits_left);

            let mask = ((1u16 << bits_to_read) - 1) as u8;
            let shifted = (byte >> (8 - self.bit_position - bits_to_read)) & mask;

            result = (result << bits_to_read) | shifted as u32;

            self.bit_position += bits_to_read;
            if self.bit_position >= 8 {
                self.position += 1;
                self.bit_position = 0;
            }

            bits_left -= bits_to_read;
        }

        Ok(result)
    }

    pub fn skip_bits(&mut self, count: u32) -> Result<()> {
        let new_pos = self.position * 8 + self.bit_position as usize + count as usize;
        self.position = new_pos / 8;
        self.bit_position = (new_pos % 8) as u8;

        if self.position > self.data.len() || (self.position == self.data.len() && self.bit_position > 0) {
            return Err(EngineError::Parse {
                table: "bitreader",
                reason: "attempted to skip past end of data".into(),
            });
        }

        Ok(())
    }

    pub fn align_to_byte(&mut self) {
        if self.bit_position > 0 {
            self.position += 1;
            self.bit_position = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_packed_fields() {
        // 1011_0011
        let data = [0b1011_0011u8];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(5).unwrap(), 0b10011);
    }

    #[test]
    fn errors_past_end_of_data() {
        let data = [0xffu8];
        let mut reader = BitReader::new(&data);
        assert!(reader.read_bits(8).is_ok());
        assert!(reader.read_bits(1).is_err());
    }
}
