//! Stable binary encoding for values.
//!
//! Every value is a one byte type tag followed by a type specific payload.
//! All integers are big endian.
//!
//! ```text
//! Undefined  <0>
//! Integer    <1> <i64>
//! Float      <2> <f64 bits>
//! String     <3> <u64 len> <utf8 bytes>
//! Vector     <4> <u64 n> <f64>*n
//! List       <5> <u64 n> <value>*n
//! Dict       <6> <u64 n> (<value> <value>)*n
//! DateTime   <7> <i64 micros since epoch> <i32 utc offset seconds>
//! Image      <8> <u32 width> <u32 height> <u8 channels> <u8 format> <u64 len> <bytes>
//! ```
use bytes::{Buf, BufMut};
use chrono::{DateTime, FixedOffset};
use framestore_error::{Result, corrupt};

use super::{Image, ImageFormat, Value, ValueType};

/// Encode self to some byte buffer.
pub trait Encodeable {
    /// Get the exact number of bytes that this instance will encode to.
    fn encode_size(&self) -> usize;

    /// Encode self to `dst`.
    fn encode<B: BufMut>(&self, dst: &mut B);
}

/// Decode self from some byte buffer.
///
/// Unlike encoding, decoding can fail since the bytes may come from a
/// corrupted file.
pub trait Decodeable: Sized {
    fn decode<B: Buf>(src: &mut B) -> Result<Self>;
}

fn ensure_remaining<B: Buf>(src: &B, n: usize) -> Result<()> {
    if src.remaining() < n {
        return Err(corrupt!(
            "unexpected end of value data, need {n} bytes, have {}",
            src.remaining()
        ));
    }
    Ok(())
}

fn get_len<B: Buf>(src: &mut B) -> Result<usize> {
    ensure_remaining(src, 8)?;
    let len = src.get_u64();
    // A length can't exceed what's left in the buffer for any of our types,
    // catch garbage lengths before trying to allocate.
    if len > src.remaining() as u64 {
        return Err(corrupt!("length prefix {len} exceeds remaining bytes"));
    }
    Ok(len as usize)
}

impl Encodeable for Value {
    fn encode_size(&self) -> usize {
        1 + match self {
            Value::Undefined => 0,
            Value::Integer(_) | Value::Float(_) => 8,
            Value::String(s) => 8 + s.len(),
            Value::Vector(v) => 8 + v.len() * 8,
            Value::List(v) => 8 + v.iter().map(|v| v.encode_size()).sum::<usize>(),
            Value::Dict(v) => {
                8 + v
                    .iter()
                    .map(|(k, v)| k.encode_size() + v.encode_size())
                    .sum::<usize>()
            }
            Value::DateTime(_) => 12,
            Value::Image(img) => 4 + 4 + 1 + 1 + 8 + img.data.len(),
        }
    }

    fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.value_type().tag());
        match self {
            Value::Undefined => (),
            Value::Integer(v) => dst.put_i64(*v),
            Value::Float(v) => dst.put_f64(*v),
            Value::String(s) => {
                dst.put_u64(s.len() as u64);
                dst.put_slice(s.as_bytes());
            }
            Value::Vector(v) => {
                dst.put_u64(v.len() as u64);
                for f in v {
                    dst.put_f64(*f);
                }
            }
            Value::List(v) => {
                dst.put_u64(v.len() as u64);
                for val in v {
                    val.encode(dst);
                }
            }
            Value::Dict(v) => {
                dst.put_u64(v.len() as u64);
                for (k, val) in v {
                    k.encode(dst);
                    val.encode(dst);
                }
            }
            Value::DateTime(dt) => {
                dst.put_i64(dt.timestamp_micros());
                dst.put_i32(dt.offset().local_minus_utc());
            }
            Value::Image(img) => {
                dst.put_u32(img.width);
                dst.put_u32(img.height);
                dst.put_u8(img.channels);
                dst.put_u8(img.format as u8);
                dst.put_u64(img.data.len() as u64);
                dst.put_slice(&img.data);
            }
        }
    }
}

impl Decodeable for Value {
    fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        ensure_remaining(src, 1)?;
        let tag = src.get_u8();
        let ty = ValueType::from_tag(tag).ok_or_else(|| corrupt!("invalid value tag {tag}"))?;

        let value = match ty {
            ValueType::Undefined => Value::Undefined,
            ValueType::Integer => {
                ensure_remaining(src, 8)?;
                Value::Integer(src.get_i64())
            }
            ValueType::Float => {
                ensure_remaining(src, 8)?;
                Value::Float(src.get_f64())
            }
            ValueType::String => {
                let len = get_len(src)?;
                let mut buf = vec![0; len];
                src.copy_to_slice(&mut buf);
                let s = String::from_utf8(buf).map_err(|e| corrupt!("invalid utf8 string: {e}"))?;
                Value::String(s)
            }
            ValueType::Vector => {
                let len = get_len(src)?;
                ensure_remaining(src, len * 8)?;
                Value::Vector((0..len).map(|_| src.get_f64()).collect())
            }
            ValueType::List => {
                let len = get_len(src)?;
                let mut vals = Vec::with_capacity(len);
                for _ in 0..len {
                    vals.push(Value::decode(src)?);
                }
                Value::List(vals)
            }
            ValueType::Dict => {
                let len = get_len(src)?;
                let mut vals = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = Value::decode(src)?;
                    let v = Value::decode(src)?;
                    vals.push((k, v));
                }
                Value::Dict(vals)
            }
            ValueType::DateTime => {
                ensure_remaining(src, 12)?;
                let micros = src.get_i64();
                let offset = src.get_i32();
                let offset = FixedOffset::east_opt(offset)
                    .ok_or_else(|| corrupt!("invalid utc offset {offset}"))?;
                let dt = DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| corrupt!("timestamp out of range: {micros}"))?;
                Value::DateTime(dt.with_timezone(&offset))
            }
            ValueType::Image => {
                ensure_remaining(src, 10)?;
                let width = src.get_u32();
                let height = src.get_u32();
                let channels = src.get_u8();
                let format = src.get_u8();
                let format = ImageFormat::from_u8(format)
                    .ok_or_else(|| corrupt!("invalid image format {format}"))?;
                let len = get_len(src)?;
                let data = src.copy_to_bytes(len);
                Value::Image(Image {
                    width,
                    height,
                    channels,
                    format,
                    data,
                })
            }
        };

        Ok(value)
    }
}
