//! Compressed, checksummed blocks of encoded values.
//!
//! On disk a block is:
//!
//! ```text
//! <payload len>  // 8 bytes
//! <crc32>        // 4 bytes, over the payload
//! <payload>      // lz4 compressed encoded values, uncompressed size prepended
//! ```
use bytes::{Buf, BufMut, Bytes};
use framestore_error::{Result, corrupt};

use crate::value::encoding::{Decodeable, Encodeable};
use crate::value::Value;

/// Size of the header preceding each block payload.
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Location and metadata for a single block within a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    /// Number of values in the block.
    pub count: u64,
    /// Byte offset of the block header in the segment file.
    pub offset: u64,
    /// Length in bytes of the block including its header.
    pub length: u64,
    pub stats: BlockStats,
}

/// Skip metadata for a block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockStats {
    pub has_undefined: bool,
    /// Min/max of defined values. Only tracked for types where a range check
    /// is meaningful.
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl BlockStats {
    pub fn update(&mut self, value: &Value) {
        if value.is_undefined() {
            self.has_undefined = true;
            return;
        }
        if !value.value_type().has_block_stats() {
            return;
        }
        match &self.min {
            Some(min) if min <= value => (),
            _ => self.min = Some(value.clone()),
        }
        match &self.max {
            Some(max) if max >= value => (),
            _ => self.max = Some(value.clone()),
        }
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.has_undefined as u8);
        self.min.clone().unwrap_or_default().encode(dst);
        self.max.clone().unwrap_or_default().encode(dst);
    }

    pub(crate) fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        if src.remaining() < 1 {
            return Err(corrupt!("truncated block stats"));
        }
        let has_undefined = src.get_u8() != 0;
        let min = Value::decode(src)?;
        let max = Value::decode(src)?;
        let as_opt = |v: Value| if v.is_undefined() { None } else { Some(v) };
        Ok(BlockStats {
            has_undefined,
            min: as_opt(min),
            max: as_opt(max),
        })
    }
}

/// Compress an encoded block, returning the bytes to write including the
/// header.
pub fn seal_block(raw: &[u8]) -> Vec<u8> {
    let payload = lz4_flex::compress_prepend_size(raw);
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    out.put_u64(payload.len() as u64);
    out.put_u32(crc);
    out.put_slice(&payload);
    out
}

/// Verify and decode a block read from disk.
///
/// `buf` must contain the full block including its header. Errors if the
/// header, checksum, or number of decoded values don't match.
pub fn open_block(buf: &[u8], expected_count: u64) -> Result<Vec<Value>> {
    if buf.len() < BLOCK_HEADER_SIZE {
        return Err(corrupt!("block shorter than header: {} bytes", buf.len()));
    }
    let mut header = &buf[..BLOCK_HEADER_SIZE];
    let payload_len = header.get_u64() as usize;
    let crc = header.get_u32();

    let payload = &buf[BLOCK_HEADER_SIZE..];
    if payload.len() != payload_len {
        return Err(corrupt!(
            "block length mismatch, header says {payload_len}, have {}",
            payload.len()
        ));
    }
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Err(corrupt!(
            "block checksum mismatch, expected {crc:#010x}, got {actual:#010x}"
        ));
    }

    let raw = lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| corrupt!("failed to decompress block: {e}"))?;
    let mut raw = Bytes::from(raw);

    let mut values = Vec::with_capacity(expected_count as usize);
    for _ in 0..expected_count {
        values.push(Value::decode(&mut raw)?);
    }
    if raw.has_remaining() {
        return Err(corrupt!(
            "{} trailing bytes after {expected_count} values in block",
            raw.remaining()
        ));
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn encode_values(vals: &[Value]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for v in vals {
            v.encode(&mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn seal_open() {
        let vals = vec![Value::Integer(1), Value::Undefined, Value::Integer(3)];
        let block = seal_block(&encode_values(&vals));
        let got = open_block(&block, 3).unwrap();
        assert_eq!(vals, got);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let vals = vec![Value::from("abc"); 10];
        let mut block = seal_block(&encode_values(&vals));
        let last = block.len() - 1;
        block[last] ^= 0xff;
        let err = open_block(&block, 10).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
    }

    #[test]
    fn wrong_count_is_corrupt() {
        let vals = vec![Value::Integer(1), Value::Integer(2)];
        let block = seal_block(&encode_values(&vals));
        assert!(open_block(&block, 1).is_err());
        assert!(open_block(&block, 3).is_err());
    }

    #[test]
    fn stats() {
        let mut stats = BlockStats::default();
        for v in [Value::Integer(4), Value::Undefined, Value::Integer(-2)] {
            stats.update(&v);
        }
        assert!(stats.has_undefined);
        assert_eq!(Some(Value::Integer(-2)), stats.min);
        assert_eq!(Some(Value::Integer(4)), stats.max);

        let mut strings = BlockStats::default();
        strings.update(&Value::from("b"));
        strings.update(&Value::from("a"));
        assert_eq!(Some(Value::from("a")), strings.min);
    }
}
