//! TLS-presentation-language serialization: fixed-width integers in network
//! byte order, variable-length fields behind a length prefix of declared
//! width (1, 2, or 4 bytes), `optional<T>` as a presence octet, and variants
//! as a selector octet followed by the body.

use crate::common::{Error, Result};
use crate::io::{CountWriter, Read, Write};

pub trait Serialize {
    /// Serialize the provided object to the stream.
    fn serialize(&self, writer: &mut impl Write) -> Result<()>;

    /// Serialize into a fresh byte vector.
    fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.serialize(&mut buffer)?;
        Ok(buffer)
    }
}

pub trait Deserialize: Sized {
    /// Read an object of this type from the stream.
    fn deserialize(reader: &mut impl Read) -> Result<Self>;

    /// Decode an object from a complete encoding; trailing bytes are an
    /// error, so `from_slice(to_vec(x)) == x` is exact.
    fn from_slice(mut data: &[u8]) -> Result<Self> {
        let value = Self::deserialize(&mut data)?;
        if !data.is_empty() {
            return Err(Error::Protocol("trailing bytes after encoded value"));
        }
        Ok(value)
    }
}

// Serialization by reference
impl<T> Serialize for &T
where
    T: Serialize,
{
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        Serialize::serialize(*self, writer)
    }
}

macro_rules! impl_primitive_serde {
    ($t:ty) => {
        impl Serialize for $t {
            fn serialize(&self, writer: &mut impl Write) -> Result<()> {
                writer.write(&self.to_be_bytes())
            }
        }

        impl Deserialize for $t {
            fn deserialize(reader: &mut impl Read) -> Result<Self> {
                const N: usize = core::mem::size_of::<$t>();
                let mut bytes = [0; N];
                bytes.copy_from_slice(reader.read(N)?);
                Ok(Self::from_be_bytes(bytes))
            }
        }
    };
}

impl_primitive_serde!(u8);
impl_primitive_serde!(u16);
impl_primitive_serde!(u32);
impl_primitive_serde!(u64);

impl<const N: usize> Serialize for [u8; N] {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        writer.write(self)
    }
}

impl<const N: usize> Deserialize for [u8; N] {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        let mut arr = [0; N];
        arr.copy_from_slice(reader.read(N)?);
        Ok(arr)
    }
}

// optional<T> = u8 present || T?
impl<T> Serialize for Option<T>
where
    T: Serialize,
{
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        match self {
            Some(val) => {
                writer.write(&[1])?;
                val.serialize(writer)
            }
            None => writer.write(&[0]),
        }
    }
}

impl<T> Deserialize for Option<T>
where
    T: Deserialize,
{
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        match u8::deserialize(reader)? {
            0 => Ok(None),
            1 => Ok(Some(T::deserialize(reader)?)),
            _ => Err(Error::Protocol("invalid optional marker")),
        }
    }
}

fn write_length(len: usize, width: usize, writer: &mut impl Write) -> Result<()> {
    match width {
        1 => {
            let len = u8::try_from(len)
                .map_err(|_| Error::InvalidParameter("value too long for length prefix"))?;
            len.serialize(writer)
        }
        2 => {
            let len = u16::try_from(len)
                .map_err(|_| Error::InvalidParameter("value too long for length prefix"))?;
            len.serialize(writer)
        }
        4 => {
            let len = u32::try_from(len)
                .map_err(|_| Error::InvalidParameter("value too long for length prefix"))?;
            len.serialize(writer)
        }
        _ => Err(Error::InvalidParameter("invalid length prefix width")),
    }
}

fn read_length(width: usize, reader: &mut impl Read) -> Result<usize> {
    match width {
        1 => Ok(usize::from(u8::deserialize(reader)?)),
        2 => Ok(usize::from(u16::deserialize(reader)?)),
        4 => Ok(u32::deserialize(reader)? as usize),
        _ => Err(Error::InvalidParameter("invalid length prefix width")),
    }
}

/// `opaque data<0..2^(8W)-1>`
pub fn serialize_opaque<const W: usize>(data: &[u8], writer: &mut impl Write) -> Result<()> {
    write_length(data.len(), W, writer)?;
    writer.write(data)
}

pub fn deserialize_opaque<const W: usize>(reader: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_length(W, reader)?;
    Ok(reader.read(len)?.to_vec())
}

/// `T items<0..2^(8W)-1>`, length prefix counting bytes, not elements.
pub fn serialize_vector<const W: usize, T: Serialize>(
    items: &[T],
    writer: &mut impl Write,
) -> Result<()> {
    let mut counter = CountWriter::default();
    for item in items {
        item.serialize(&mut counter)?;
    }

    write_length(counter.len(), W, writer)?;
    for item in items {
        item.serialize(writer)?;
    }

    Ok(())
}

pub fn deserialize_vector<const W: usize, T: Deserialize>(
    reader: &mut impl Read,
) -> Result<Vec<T>> {
    let len = read_length(W, reader)?;
    let mut content = reader.take(len)?;

    let mut items = Vec::new();
    while !content.is_empty() {
        items.push(T::deserialize(&mut content)?);
    }

    Ok(items)
}

#[cfg(test)]
mod test {
    use super::*;

    use hex_literal::hex;

    fn serde_test<T>(val: T, enc: &[u8])
    where
        T: Serialize + Deserialize + PartialEq + core::fmt::Debug,
    {
        assert_eq!(val.to_vec().unwrap().as_slice(), enc);
        assert_eq!(T::from_slice(enc).unwrap(), val);
    }

    #[test]
    fn primitive() {
        serde_test(0xa0_u8, &hex!("a0"));
        serde_test(0xa0a1_u16, &hex!("a0a1"));
        serde_test(0xa0a1a2a3_u32, &hex!("a0a1a2a3"));
        serde_test(0xa0a1a2a3a4a5a6a7_u64, &hex!("a0a1a2a3a4a5a6a7"));
    }

    #[test]
    fn optional() {
        serde_test(Some(0xa0a1a2a3_u32), &hex!("01a0a1a2a3"));
        serde_test(None::<u32>, &hex!("00"));
        assert!(Option::<u32>::from_slice(&hex!("02a0a1a2a3")).is_err());
    }

    #[test]
    fn opaque() {
        let data = hex!("000102030405060708090a0b0c0d0e0f");

        let mut enc = Vec::new();
        serialize_opaque::<1>(&data, &mut enc).unwrap();
        assert_eq!(enc, hex!("10000102030405060708090a0b0c0d0e0f"));

        let mut enc = Vec::new();
        serialize_opaque::<2>(&data, &mut enc).unwrap();
        assert_eq!(enc, hex!("0010000102030405060708090a0b0c0d0e0f"));

        let mut reader: &[u8] = &enc;
        assert_eq!(deserialize_opaque::<2>(&mut reader).unwrap(), data);
        assert!(reader.is_empty());
    }

    #[test]
    fn opaque_overflow() {
        let data = vec![0; 256];
        let mut enc = Vec::new();
        assert!(serialize_opaque::<1>(&data, &mut enc).is_err());
    }

    #[test]
    fn vector() {
        let items = [0x0a0b_u16, 0x0c0d, 0x0e0f];

        let mut enc = Vec::new();
        serialize_vector::<4, _>(&items, &mut enc).unwrap();
        assert_eq!(enc, hex!("000000060a0b0c0d0e0f"));

        let mut reader: &[u8] = &enc;
        let out: Vec<u16> = deserialize_vector::<4, _>(&mut reader).unwrap();
        assert_eq!(out, items);
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert!(u16::from_slice(&hex!("a0a1a2")).is_err());
    }
}
