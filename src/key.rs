//! Key instantiations supported by the tree and their snapshot encoding.
//!
//! The snapshot header records which instantiation produced a file as a
//! small integer tag, so a tree loading a snapshot can reject files written
//! for a different key type instead of misreading them.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Key-type tag for 32-bit signed integer keys.
pub const KEY_TYPE_I32: i32 = 0;
/// Key-type tag for variable-length byte-string keys.
pub const KEY_TYPE_BYTES: i32 = 1;

/// An ordered key type the tree can index and snapshot.
///
/// Two instantiations ship: `i32` and `Vec<u8>`. The encoding must be
/// self-delimiting so records can be read back without padding or framing.
pub trait IndexKey: Ord + Eq + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Tag written into the snapshot header.
    const KEY_TYPE: i32;

    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut impl Buf) -> Result<Self>;
}

impl IndexKey for i32 {
    const KEY_TYPE: i32 = KEY_TYPE_I32;

    #[inline]
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(*self);
    }

    #[inline]
    fn decode(buf: &mut impl Buf) -> Result<i32> {
        if buf.remaining() < 4 {
            return Err(Error::Truncated);
        }
        Ok(buf.get_i32_le())
    }
}

impl IndexKey for Vec<u8> {
    const KEY_TYPE: i32 = KEY_TYPE_BYTES;

    #[inline]
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len() as i32);
        buf.put_slice(self);
    }

    fn decode(buf: &mut impl Buf) -> Result<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(Error::Truncated);
        }
        let len = buf.get_i32_le();
        if len < 0 {
            return Err(Error::Corrupted("negative key length"));
        }
        let len = len as usize;
        if buf.remaining() < len {
            return Err(Error::Truncated);
        }
        let mut key = vec![0u8; len];
        buf.copy_to_slice(&mut key);
        Ok(key)
    }
}
