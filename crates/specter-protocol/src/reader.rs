use byteorder::ByteOrder;
use byteorder::{BigEndian, LittleEndian};
use memchr::memchr;

/// Cursor-based reader over a possibly-truncated payload.
///
/// Every read returns `None` when the buffer ends before the value does
/// and leaves the cursor where it was, so a decoder can bail out with
/// "need more bytes" and re-run from scratch once the tracker has
/// appended the next chunk. No read ever succeeds past the end of the
/// buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let v = self.peek_u8()?;
        self.pos += 1;
        Some(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }

    fn read_int<T: ByteOrder>(&mut self, n: usize) -> Option<u64> {
        if self.remaining() < n {
            return None;
        }
        let v = T::read_uint(&self.data[self.pos..], n);
        self.pos += n;
        Some(v)
    }

    pub fn read_u16_be(&mut self) -> Option<u16> {
        self.read_int::<BigEndian>(2).map(|v| v as u16)
    }

    pub fn read_u32_be(&mut self) -> Option<u32> {
        self.read_int::<BigEndian>(4).map(|v| v as u32)
    }

    pub fn read_u64_be(&mut self) -> Option<u64> {
        self.read_int::<BigEndian>(8)
    }

    pub fn read_i16_be(&mut self) -> Option<i16> {
        self.read_u16_be().map(|v| v as i16)
    }

    pub fn read_i32_be(&mut self) -> Option<i32> {
        self.read_u32_be().map(|v| v as i32)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_int::<LittleEndian>(2).map(|v| v as u16)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.read_int::<LittleEndian>(3).map(|v| v as u32)
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_int::<LittleEndian>(4).map(|v| v as u32)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_int::<LittleEndian>(8)
    }

    /// Bytes up to (not including) `delim`; the cursor lands one past
    /// the delimiter. `None` if the delimiter is not in the buffer.
    pub fn read_until(&mut self, delim: u8) -> Option<&'a [u8]> {
        let at = memchr(delim, &self.data[self.pos..])?;
        let out = &self.data[self.pos..self.pos + at];
        self.pos += at + 1;
        Some(out)
    }

    /// A big-endian length prefix of `prefix_width` bytes (1, 2 or 4)
    /// followed by that many bytes.
    pub fn read_length_prefixed(&mut self, prefix_width: usize) -> Option<&'a [u8]> {
        let start = self.pos;
        let len = match self.read_int::<BigEndian>(prefix_width) {
            Some(v) => v as usize,
            None => return None,
        };
        match self.read_bytes(len) {
            Some(bytes) => Some(bytes),
            None => {
                self.pos = start;
                None
            }
        }
    }

    /// MySQL length-encoded integer: one byte below 0xfb, otherwise a
    /// marker selecting a 2/3/8-byte little-endian value. 0xfb encodes
    /// NULL and yields `Some(None)`.
    pub fn read_lenenc_uint(&mut self) -> Option<Option<u64>> {
        let start = self.pos;
        let out = match self.read_u8()? {
            v @ 0x00..=0xfa => Some(v as u64),
            0xfb => None,
            0xfc => match self.read_u16_le() {
                Some(v) => Some(v as u64),
                None => {
                    self.pos = start;
                    return None;
                }
            },
            0xfd => match self.read_u24_le() {
                Some(v) => Some(v as u64),
                None => {
                    self.pos = start;
                    return None;
                }
            },
            0xfe => match self.read_u64_le() {
                Some(v) => Some(v),
                None => {
                    self.pos = start;
                    return None;
                }
            },
            0xff => {
                self.pos = start;
                return None;
            }
        };
        Some(out)
    }

    /// Everything from the cursor to the end of the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_do_not_advance_on_underrun() {
        let mut r = ByteReader::new(b"\x01\x02\x03");
        assert_eq!(r.read_u16_be(), Some(0x0102));
        assert_eq!(r.read_u32_be(), None);
        assert_eq!(r.pos(), 2);
        assert_eq!(r.read_u8(), Some(0x03));
        assert_eq!(r.read_u8(), None);
    }

    #[test]
    fn test_endianness() {
        let mut r = ByteReader::new(b"\x01\x00\x00\x00");
        assert_eq!(r.read_u24_le(), Some(1));
        let mut r = ByteReader::new(b"\x00\x00\x00\x01");
        assert_eq!(r.read_u32_be(), Some(1));
    }

    #[test]
    fn test_read_until() {
        let mut r = ByteReader::new(b"abc\r\ndef");
        assert_eq!(r.read_until(b'\r'), Some(&b"abc"[..]));
        assert_eq!(r.pos(), 4);
        assert_eq!(r.read_until(b'\x00'), None);
        assert_eq!(r.pos(), 4);
    }

    #[test]
    fn test_length_prefixed() {
        let mut r = ByteReader::new(b"\x00\x03abcx");
        assert_eq!(r.read_length_prefixed(2), Some(&b"abc"[..]));
        assert_eq!(r.pos(), 5);

        // Prefix present but payload short: cursor stays put.
        let mut r = ByteReader::new(b"\x00\x09abc");
        assert_eq!(r.read_length_prefixed(2), None);
        assert_eq!(r.pos(), 0);
    }

    #[test]
    fn test_lenenc_uint() {
        let mut r = ByteReader::new(b"\x05");
        assert_eq!(r.read_lenenc_uint(), Some(Some(5)));

        let mut r = ByteReader::new(b"\xfc\x10\x27");
        assert_eq!(r.read_lenenc_uint(), Some(Some(10_000)));

        let mut r = ByteReader::new(b"\xfb");
        assert_eq!(r.read_lenenc_uint(), Some(None));

        // Marker promises more bytes than the buffer holds.
        let mut r = ByteReader::new(b"\xfe\x01\x02");
        assert_eq!(r.read_lenenc_uint(), None);
        assert_eq!(r.pos(), 0);
    }
}
