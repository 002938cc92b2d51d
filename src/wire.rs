//! Wire codec: variable-length integers, fixed big-endian fields and
//! length-prefixed byte runs, as used by every frame and object payload.
//!
//! Multi-byte forms are big-endian throughout. A varint encodes values
//! below 0xfd in one byte; larger values use a marker byte (0xfd/0xfe/0xff)
//! followed by a 2/4/8-byte big-endian integer. Decoding rejects
//! non-minimal encodings.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended in the middle of a field.
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// A length prefix exceeds the bound the caller allows.
    #[error("field too large: {len} exceeds limit {limit}")]
    TooLarge { len: u64, limit: u64 },

    /// An impossible encoding, e.g. a non-minimal varint or invalid UTF-8.
    #[error("invalid encoding: {0}")]
    Invalid(&'static str),
}

pub fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_varint(out: &mut Vec<u8>, v: u64) {
    if v < 0xfd {
        out.push(v as u8);
    } else if v <= 0xffff {
        out.push(0xfd);
        write_u16(out, v as u16);
    } else if v <= 0xffff_ffff {
        out.push(0xfe);
        write_u32(out, v as u32);
    } else {
        out.push(0xff);
        write_u64(out, v);
    }
}

/// varint length prefix followed by the raw bytes.
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_var_str(out: &mut Vec<u8>, s: &str) {
    write_var_bytes(out, s.as_bytes());
}

/// varint element count followed by each element as a varint.
pub fn write_varint_list(out: &mut Vec<u8>, values: &[u64]) {
    write_varint(out, values.len() as u64);
    for v in values {
        write_varint(out, *v);
    }
}

/// Bounds-checked cursor over a received byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consume everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let slice = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn varint(&mut self) -> Result<u64, WireError> {
        let marker = self.u8()?;
        let value = match marker {
            0xfd => {
                let v = self.u16()? as u64;
                if v < 0xfd {
                    return Err(WireError::Invalid("non-minimal varint"));
                }
                v
            }
            0xfe => {
                let v = self.u32()? as u64;
                if v <= 0xffff {
                    return Err(WireError::Invalid("non-minimal varint"));
                }
                v
            }
            0xff => {
                let v = self.u64()?;
                if v <= 0xffff_ffff {
                    return Err(WireError::Invalid("non-minimal varint"));
                }
                v
            }
            b => b as u64,
        };
        Ok(value)
    }

    /// varint count bounded by `limit`; protects collection decodes.
    pub fn varint_count(&mut self, limit: u64) -> Result<u64, WireError> {
        let count = self.varint()?;
        if count > limit {
            return Err(WireError::TooLarge { len: count, limit });
        }
        Ok(count)
    }

    pub fn var_bytes(&mut self, limit: u64) -> Result<&'a [u8], WireError> {
        let len = self.varint()?;
        if len > limit {
            return Err(WireError::TooLarge { len, limit });
        }
        self.bytes(len as usize)
    }

    pub fn var_str(&mut self, limit: u64) -> Result<&'a str, WireError> {
        let bytes = self.var_bytes(limit)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::Invalid("non-UTF-8 string"))
    }

    pub fn varint_list(&mut self, limit: u64) -> Result<Vec<u64>, WireError> {
        let count = self.varint_count(limit)?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.varint()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, v);
        let mut r = Reader::new(&out);
        assert_eq!(r.varint().unwrap(), v);
        assert!(r.is_empty());
        out
    }

    #[test]
    fn varint_widths() {
        assert_eq!(roundtrip(0).len(), 1);
        assert_eq!(roundtrip(0xfc).len(), 1);
        assert_eq!(roundtrip(0xfd).len(), 3);
        assert_eq!(roundtrip(0xffff).len(), 3);
        assert_eq!(roundtrip(0x1_0000).len(), 5);
        assert_eq!(roundtrip(0xffff_ffff).len(), 5);
        assert_eq!(roundtrip(0x1_0000_0000).len(), 9);
        assert_eq!(roundtrip(u64::MAX).len(), 9);
    }

    #[test]
    fn varint_rejects_non_minimal() {
        // 0xfc must be encoded in one byte, not as 0xfd 0x00 0xfc.
        let bytes = [0xfdu8, 0x00, 0xfc];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.varint(), Err(WireError::Invalid("non-minimal varint")));

        let bytes = [0xfeu8, 0x00, 0x00, 0xff, 0xff];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.varint(), Err(WireError::Invalid("non-minimal varint")));

        let bytes = [0xffu8, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.varint(), Err(WireError::Invalid("non-minimal varint")));
    }

    #[test]
    fn truncated_fields_report_shortfall() {
        let mut r = Reader::new(&[0x01, 0x02]);
        assert_eq!(r.u64(), Err(WireError::Truncated { needed: 6 }));

        let mut out = Vec::new();
        write_varint(&mut out, 100);
        out.extend_from_slice(&[0u8; 10]); // 90 bytes short
        let mut r = Reader::new(&out);
        assert_eq!(r.var_bytes(1000), Err(WireError::Truncated { needed: 90 }));
    }

    #[test]
    fn var_bytes_enforces_limit() {
        let mut out = Vec::new();
        write_var_bytes(&mut out, &[1u8; 64]);
        let mut r = Reader::new(&out);
        assert_eq!(r.var_bytes(32), Err(WireError::TooLarge { len: 64, limit: 32 }));
    }

    #[test]
    fn var_str_roundtrip_and_utf8_guard() {
        let mut out = Vec::new();
        write_var_str(&mut out, "/bmnet:0.3/");
        let mut r = Reader::new(&out);
        assert_eq!(r.var_str(100).unwrap(), "/bmnet:0.3/");

        let bad = [1u8, 0xff];
        let mut r = Reader::new(&bad);
        assert_eq!(r.var_str(100), Err(WireError::Invalid("non-UTF-8 string")));
    }

    #[test]
    fn fixed_ints_are_big_endian() {
        let mut out = Vec::new();
        write_u32(&mut out, 0x0102_0304);
        assert_eq!(out, [1, 2, 3, 4]);
        write_i64(&mut out, -2);
        let mut r = Reader::new(&out);
        assert_eq!(r.u32().unwrap(), 0x0102_0304);
        assert_eq!(r.i64().unwrap(), -2);
    }

    #[test]
    fn varint_list_roundtrip() {
        let streams = vec![1u64, 2, 700];
        let mut out = Vec::new();
        write_varint_list(&mut out, &streams);
        let mut r = Reader::new(&out);
        assert_eq!(r.varint_list(10).unwrap(), streams);
    }
}
