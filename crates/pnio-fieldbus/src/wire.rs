//! Big-endian cursor over received bytes.

use pnio_common::error::{PnioError, PnioResult};
use pnio_common::mac::MacAddress;
use uuid::Uuid;

/// Bounds-checked reader; every short read is a `Malformed` error naming `what`.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    /// Start reading `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    /// Bytes left.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Take `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> PnioResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len()).ok_or_else(|| {
            PnioError::Malformed(format!(
                "{}: need {n} bytes at offset {}, have {}",
                self.what,
                self.pos,
                self.remaining()
            ))
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> PnioResult<()> {
        self.bytes(n).map(|_| ())
    }

    /// One octet.
    pub fn u8(&mut self) -> PnioResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Big-endian u16.
    pub fn u16(&mut self) -> PnioResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Big-endian u32.
    pub fn u32(&mut self) -> PnioResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// UUID in canonical (big-endian) byte order.
    pub fn uuid(&mut self) -> PnioResult<Uuid> {
        let b = self.bytes(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    /// Six-octet hardware address.
    pub fn mac(&mut self) -> PnioResult<MacAddress> {
        let b = self.bytes(6)?;
        Ok(MacAddress::from_slice(b).unwrap_or(MacAddress::ZERO))
    }
}
