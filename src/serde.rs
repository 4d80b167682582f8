//! Serialization seam between caller types and entry bytes.
//!
//! The table never interprets key or value bytes itself. A [`Serializer`]
//! declares the exact size of a value, writes it through [`DataOutput`] and
//! reads it back through [`DataInput`]. Multi-byte values are big-endian.

use crate::error::{Error, Result};

/// Sequential sink for serialized bytes.
///
/// Implementations reject writes past their declared capacity with
/// [`Error::BufferOverrun`] instead of truncating.
pub trait DataOutput {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()>;

    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_be_bytes())
    }

    fn write_i8(&mut self, v: i8) -> Result<()> {
        self.write_u8(v as u8)
    }

    fn write_i16(&mut self, v: i16) -> Result<()> {
        self.write_u16(v as u16)
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_u32(v as u32)
    }

    fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_u64(v as u64)
    }

    fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_u32(v.to_bits())
    }

    fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_u64(v.to_bits())
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }
}

/// Growable in-memory sink, for serialized bytes that never go off-heap.
impl DataOutput for Vec<u8> {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.extend_from_slice(src);
        Ok(())
    }
}

/// Cursor over serialized bytes.
pub struct DataInput<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DataInput<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Codec(format!(
                "unexpected end of input: {} bytes requested, {} left",
                len,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Everything not consumed yet.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_be_bytes)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_u8().map(|v| v as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_array().map(i16::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_u32().map(f32::from_bits)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_u64().map(f64::from_bits)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_u8().map(|v| v != 0)
    }
}

/// Caller-supplied encoding of keys or values.
///
/// Must be deterministic: equal values serialize to equal bytes, and
/// `serialize` must write exactly `serialized_size` bytes.
pub trait Serializer<T>: Send + Sync + 'static {
    fn serialized_size(&self, value: &T) -> usize;

    fn serialize(&self, value: &T, out: &mut dyn DataOutput) -> Result<()>;

    fn deserialize(&self, input: &mut DataInput<'_>) -> Result<T>;
}

/// Raw bytes, stored as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialized_size(&self, value: &Vec<u8>) -> usize {
        value.len()
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut dyn DataOutput) -> Result<()> {
        out.write_bytes(value)
    }

    fn deserialize(&self, input: &mut DataInput<'_>) -> Result<Vec<u8>> {
        Ok(input.read_remaining().to_vec())
    }
}

/// UTF-8 strings, stored without a length prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialized_size(&self, value: &String) -> usize {
        value.len()
    }

    fn serialize(&self, value: &String, out: &mut dyn DataOutput) -> Result<()> {
        out.write_bytes(value.as_bytes())
    }

    fn deserialize(&self, input: &mut DataInput<'_>) -> Result<String> {
        String::from_utf8(input.read_remaining().to_vec()).map_err(|e| Error::Codec(e.to_string()))
    }
}

macro_rules! primitive_serializers {
    ($($name:ident, $ty:ty, $write:ident, $read:ident;)+) => {
        $(
            #[doc = concat!("Fixed-width big-endian `", stringify!($ty), "`.")]
            #[derive(Debug, Default, Clone, Copy)]
            pub struct $name;

            impl Serializer<$ty> for $name {
                fn serialized_size(&self, _: &$ty) -> usize {
                    std::mem::size_of::<$ty>()
                }

                fn serialize(&self, value: &$ty, out: &mut dyn DataOutput) -> Result<()> {
                    out.$write(*value)
                }

                fn deserialize(&self, input: &mut DataInput<'_>) -> Result<$ty> {
                    input.$read()
                }
            }
        )+
    };
}

primitive_serializers! {
    U32Serializer, u32, write_u32, read_u32;
    U64Serializer, u64, write_u64, read_u64;
    I64Serializer, i64, write_i64, read_i64;
    F64Serializer, f64, write_f64, read_f64;
}
