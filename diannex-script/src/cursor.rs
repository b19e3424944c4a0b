//! Bounds-checked little-endian reads over a byte buffer.
//!
//! Both the container decoder and the instruction fetch path read through
//! [`ByteCursor`]; every read is checked against the end of the buffer so a
//! truncated or corrupt file surfaces as an error instead of a panic.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Sequential reader with random access over a borrowed byte slice.
#[derive(Clone, Debug)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Move the read position. Seeking to exactly the end of the buffer is
    /// allowed; seeking past it is not.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            bail!(
                "seek to {} past end of buffer (len {})",
                pos,
                self.buf.len()
            );
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!(
                "unexpected EOF: {} bytes at offset {} (len {})",
                n,
                self.pos,
                self.buf.len()
            );
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// The unread tail of the buffer; consumes it.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Read a null-terminated UTF-8 string, consuming the terminator.
    pub fn read_cstring(&mut self) -> Result<String> {
        let start = self.pos;
        let Some(rel) = self.buf[self.pos..].iter().position(|&b| b == 0) else {
            bail!("unterminated string at offset {}", start);
        };
        let raw = &self.buf[start..start + rel];
        self.pos = start + rel + 1;
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => {
                log::warn!("invalid UTF-8 in string at offset {}", start);
                Ok(String::from_utf8_lossy(raw).into_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_primitives_in_order() {
        let buf = [0x01, 0x02, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut cur = ByteCursor::new(&buf);
        assert_eq!(cur.read_u8().unwrap(), 1);
        assert_eq!(cur.read_u16().unwrap(), 2);
        assert_eq!(cur.read_i32().unwrap(), -1);
        assert!(cur.at_end());
    }

    #[test]
    fn f64_is_little_endian() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1.5f64.to_le_bytes());
        let mut cur = ByteCursor::new(&buf);
        assert_eq!(cur.read_f64().unwrap(), 1.5);
    }

    #[test]
    fn cstring_stops_at_null() {
        let buf = b"hello\0world\0";
        let mut cur = ByteCursor::new(buf);
        assert_eq!(cur.read_cstring().unwrap(), "hello");
        assert_eq!(cur.read_cstring().unwrap(), "world");
        assert!(cur.at_end());
    }

    #[test]
    fn unterminated_cstring_fails() {
        let mut cur = ByteCursor::new(b"oops");
        assert!(cur.read_cstring().is_err());
    }

    #[test]
    fn read_past_end_fails() {
        let mut cur = ByteCursor::new(&[0x01]);
        assert!(cur.read_u32().is_err());
        // A failed read must not advance.
        assert_eq!(cur.position(), 0);
    }

    #[test]
    fn seek_bounds() {
        let mut cur = ByteCursor::new(&[0, 0, 0]);
        assert!(cur.seek(3).is_ok());
        assert!(cur.seek(4).is_err());
    }
}
