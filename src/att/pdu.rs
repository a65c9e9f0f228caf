use structbuf::{Pack, StructBuf, Unpacker};

use super::*;

type Result<T> = std::result::Result<T, NoResources>;

/// Outbound PDU writer with a fixed byte budget. Every write either fits
/// completely or fails with [`NoResources`] without modifying the buffer.
#[derive(Clone, Debug)]
pub struct PduWriter(StructBuf);

impl PduWriter {
    /// Creates a PDU writer limited to `mtu` bytes and writes the opcode.
    #[must_use]
    pub fn new(op: Opcode, mtu: u16) -> Self {
        let mut b = StructBuf::new(usize::from(mtu.max(1)));
        b.append().u8(u8::from(op));
        Self(b)
    }

    /// Returns the number of bytes written, including the opcode.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether only the opcode has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.len() <= 1
    }

    /// Returns the number of bytes that can still be written.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.0.lim() - self.0.len()
    }

    /// Writes a `u8`.
    #[inline]
    pub fn u8(&mut self, v: u8) -> Result<&mut Self> {
        self.reserve(1)?.0.append().u8(v);
        Ok(self)
    }

    /// Writes a little-endian `u16`.
    #[inline]
    pub fn u16(&mut self, v: u16) -> Result<&mut Self> {
        self.reserve(2)?.0.append().u16(v);
        Ok(self)
    }

    /// Writes a little-endian attribute handle.
    #[inline]
    pub fn handle(&mut self, h: Handle) -> Result<&mut Self> {
        self.u16(u16::from(h))
    }

    /// Writes a byte slice.
    #[inline]
    pub fn put(&mut self, v: &[u8]) -> Result<&mut Self> {
        self.reserve(v.len())?.0.append().put(v);
        Ok(self)
    }

    /// Writes a UUID in its 2- or 16-byte wire format.
    #[inline]
    pub fn uuid(&mut self, u: Uuid) -> Result<&mut Self> {
        self.put(&u.to_bytes())
    }

    /// Writes as much of `v` as fits and returns the number of bytes written.
    #[inline]
    pub fn put_trunc(&mut self, v: &[u8]) -> usize {
        let n = v.len().min(self.remaining());
        self.0.append().put(&v[..n]);
        n
    }

    /// Overwrites a previously written byte at index `i`.
    #[inline]
    pub fn set_u8(&mut self, i: usize, v: u8) -> Result<&mut Self> {
        if i >= self.0.len() {
            return Err(NoResources);
        }
        self.0.put_at(i, &[v]);
        Ok(self)
    }

    /// Returns the encoded PDU.
    #[inline]
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.0.as_ref().to_vec()
    }

    /// Ensures that `n` more bytes can be written.
    #[inline]
    fn reserve(&mut self, n: usize) -> Result<&mut Self> {
        if n <= self.remaining() {
            Ok(self)
        } else {
            Err(NoResources)
        }
    }
}

impl AsRef<[u8]> for PduWriter {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// Returns the bytes remaining in the unpacker.
pub fn unpack_rest<'a>(p: &mut Unpacker<'a>) -> &'a [u8] {
    p.take().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget() {
        let mut w = PduWriter::new(Opcode::ReadRsp, 5);
        assert_eq!(w.remaining(), 4);
        assert!(w.is_empty());
        w.u16(0x0201).unwrap();
        assert!(w.put(&[1, 2, 3]).is_err());
        assert_eq!(w.len(), 3);
        assert_eq!(w.put_trunc(&[7, 8, 9]), 2);
        assert_eq!(w.u8(0).err(), Some(NoResources));
        assert_eq!(w.as_ref(), &[0x0B, 0x01, 0x02, 7, 8]);
        w.set_u8(1, 0xFF).unwrap();
        assert!(w.set_u8(5, 0).is_err());
        assert_eq!(w.into_vec(), [0x0B, 0xFF, 0x02, 7, 8]);
    }

    #[test]
    fn uuid() {
        let mut w = PduWriter::new(Opcode::FindInformationRsp, 23);
        w.uuid(Uuid::Uuid32(0x0001_0000)).unwrap();
        assert_eq!(w.len(), 17);
        w.uuid(Uuid::Uuid16(0x2902)).unwrap();
        assert_eq!(&w.as_ref()[17..], &[0x02, 0x29]);
        assert!(w.uuid(Uuid::Uuid128(1)).is_err());
    }

    #[test]
    fn rest() {
        let mut p = Unpacker::new(&[0x01, 0x00, 0xFF]);
        assert_eq!(p.u16(), 1);
        assert_eq!(unpack_rest(&mut p), &[0xFF]);
        assert!(unpack_rest(&mut p).is_empty());
    }
}
