//! Bounds-checked little-endian reader over an event body

use crate::error::{PipelineError, Result};

/// Cursor over a borrowed byte slice.
///
/// Every read checks the remaining length first, so a truncated body
/// surfaces as [`PipelineError::ProtocolDecode`] instead of a panic.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `n` bytes
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(PipelineError::malformed(format!(
                "truncated binlog body: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Borrow everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Read one byte
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a little-endian u16
    pub fn u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a little-endian u32
    pub fn u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read a little-endian u64
    pub fn u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Read an unsigned little-endian integer of `n` bytes (n <= 8)
    pub fn uint_le(&mut self, n: usize) -> Result<u64> {
        let bytes = self.bytes(n.min(8))?;
        Ok(bytes
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i))))
    }

    /// Read an unsigned big-endian integer of `n` bytes (n <= 8)
    pub fn uint_be(&mut self, n: usize) -> Result<u64> {
        let bytes = self.bytes(n.min(8))?;
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Read a little-endian f32
    pub fn f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// Read a little-endian f64
    pub fn f64_le(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Read a 6-byte table id
    pub fn table_id(&mut self) -> Result<u64> {
        self.uint_le(6)
    }

    /// Read a length-encoded integer
    pub fn packed_int(&mut self) -> Result<u64> {
        match self.u8()? {
            n @ 0..=0xfa => Ok(u64::from(n)),
            0xfc => self.uint_le(2),
            0xfd => self.uint_le(3),
            0xfe => self.u64_le(),
            other => Err(PipelineError::malformed(format!(
                "invalid length-encoded integer prefix 0x{:02x}",
                other
            ))),
        }
    }

    /// Read a NUL-terminated string, consuming the terminator
    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PipelineError::malformed("missing NUL terminator"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }
}
