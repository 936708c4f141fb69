//! Binary codec shared by the log, the manifest and the table files.
//!
//! Every persistent structure (write batches, version edits, table cells,
//! table footers) implements [`Encode`] and [`Decode`]. Keeping the codec
//! in-crate pins the on-disk bytes to this source tree.
//!
//! Layout of the primitive types:
//!
//! - integers are fixed width, little-endian (`u8`, `u32`, `u64`);
//! - `bool` is one byte, `0` or `1`, anything else is rejected;
//! - `[u8; N]` is written raw;
//! - byte strings and `String` carry a `u32` length prefix;
//! - `Option<T>` is a one-byte tag (`0` none, `1` some) followed by `T`;
//! - sequences of structs use [`encode_vec`] / [`decode_vec`], a `u32`
//!   count followed by the elements.
//!
//! A decoded length above [`MAX_BYTE_LEN`] or a count above
//! [`MAX_VEC_ELEMENTS`] is an error, checked before anything is allocated.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Upper bound on a decoded byte string, 256 MiB.
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Upper bound on the element count read by [`decode_vec`].
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("buffer too short: wanted {needed} bytes, {available} left")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("unknown tag {tag} while decoding {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    #[error("bool encoded as 0x{0:02X}")]
    InvalidBool(u8),

    #[error("string is not UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("length out of range: {0}")]
    LengthOverflow(String),

    /// Raised by composite decoders for content that parses but makes no sense.
    #[error("{0}")]
    Custom(String),
}

/// Appends a deterministic byte form of `self` to a buffer.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Reads a value from the start of a slice and reports how many bytes it
/// took, so several values can be read back to back.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::new();
    value.encode_to(&mut out)?;
    Ok(out)
}

pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Sequential decoder over one buffer, for structs with several fields.
///
/// ```rust,ignore
/// let mut r = Reader::new(buf);
/// let level = r.read::<u32>()?;
/// let number = r.read::<u64>()?;
/// Ok((Self { level, number }, r.consumed()))
/// ```
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read<T: Decode>(&mut self) -> Result<T, EncodingError> {
        let (value, used) = T::decode_from(self.rest())?;
        self.pos += used;
        Ok(value)
    }

    #[cfg(test)]
    pub fn read_vec<T: Decode>(&mut self) -> Result<Vec<T>, EncodingError> {
        let (values, used) = decode_vec::<T>(self.rest())?;
        self.pos += used;
        Ok(values)
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }
}

fn take(buf: &[u8], n: usize) -> Result<&[u8], EncodingError> {
    buf.get(..n).ok_or(EncodingError::UnexpectedEof {
        needed: n,
        available: buf.len(),
    })
}

fn write_len(len: usize, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    let len = u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("{len} does not fit in u32")))?;
    len.encode_to(buf)
}

/// Reads a `u32` length prefix and checks it against `limit`.
fn read_len(buf: &[u8], limit: u32, what: &str) -> Result<(usize, usize), EncodingError> {
    let (len, used) = u32::decode_from(buf)?;
    if len > limit {
        return Err(EncodingError::LengthOverflow(format!(
            "{what} {len} is above the limit of {limit}"
        )));
    }
    Ok((len as usize, used))
}

macro_rules! fixed_width_int {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(take(buf, WIDTH)?);
                Ok((<$ty>::from_le_bytes(raw), WIDTH))
            }
        }
    )*};
}

fixed_width_int!(u8, u32, u64);

impl Encode for bool {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        u8::from(*self).encode_to(buf)
    }
}

impl Decode for bool {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        match u8::decode_from(buf)? {
            (0, n) => Ok((false, n)),
            (1, n) => Ok((true, n)),
            (byte, _) => Err(EncodingError::InvalidBool(byte)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(take(buf, N)?);
        Ok((out, N))
    }
}

impl Encode for &[u8] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        write_len(self.len(), buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, header) = read_len(buf, MAX_BYTE_LEN, "byte string length")?;
        let body = take(&buf[header..], len)?;
        Ok((body.to_vec(), header + len))
    }
}

impl Encode for String {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Decode for String {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, used) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(bytes)?, used))
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Some(inner) => {
                buf.push(1);
                inner.encode_to(buf)
            }
            None => {
                buf.push(0);
                Ok(())
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, _) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((None, 1)),
            1 => T::decode_from(&buf[1..]).map(|(inner, used)| (Some(inner), used + 1)),
            _ => Err(EncodingError::InvalidTag {
                tag: u32::from(tag),
                type_name: "Option",
            }),
        }
    }
}

// `Vec<u8>` is the byte-string form, so element vectors cannot have a
// blanket impl and go through these two functions instead.

pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    write_len(items.len(), buf)?;
    items.iter().try_for_each(|item| item.encode_to(buf))
}

pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut pos) = read_len(buf, MAX_VEC_ELEMENTS, "element count")?;
    // Elements are at least one byte wide.
    let mut items = Vec::with_capacity(count.min(buf.len() - pos));
    for _ in 0..count {
        let (item, used) = T::decode_from(&buf[pos..])?;
        pos += used;
        items.push(item);
    }
    Ok((items, pos))
}
