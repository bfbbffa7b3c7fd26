//! Typed cursor over a message run
//!
//! A [`Message`] carries independent read and write positions over the
//! payload of one arena run. Every access is bounds checked against the end
//! of the run and fails with [`ShmError::MessageOverflow`] without touching
//! memory. Values use native byte order: both peers run on the same host.
//! There is no schema; peers agree on field order and types out of band.

use crate::arena::{Arena, BlockRef};
use crate::error::{ShmError, ShmResult};

/// Cursor pair over the payload of an allocated or received run
pub struct Message<'a> {
    arena: &'a Arena,
    block: BlockRef,
    read_pos: usize,
    write_pos: usize,
    end: usize,
}

macro_rules! impl_scalar_accessors {
    ($($ty:ty => $write:ident, $read:ident;)+) => {
        $(
            #[doc = concat!("Append a `", stringify!($ty), "` at the write cursor")]
            pub fn $write(&mut self, value: $ty) -> ShmResult<()> {
                self.write_bytes(&value.to_ne_bytes())
            }

            #[doc = concat!("Read a `", stringify!($ty), "` at the read cursor")]
            pub fn $read(&mut self) -> ShmResult<$ty> {
                let mut raw = [0u8; size_of::<$ty>()];
                self.read_into(&mut raw)?;
                Ok(<$ty>::from_ne_bytes(raw))
            }
        )+
    };
}

impl<'a> Message<'a> {
    pub(crate) fn new(arena: &'a Arena, block: BlockRef) -> Self {
        Self {
            arena,
            block,
            read_pos: 0,
            write_pos: 0,
            end: block.payload_capacity(),
        }
    }

    pub fn block(&self) -> BlockRef {
        self.block
    }

    /// Arena the run lives in
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Tag stored in the run's header
    pub fn message_id(&self) -> u32 {
        self.arena.message_id(&self.block)
    }

    /// Payload bytes the run can hold
    pub fn capacity(&self) -> usize {
        self.end
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    pub fn write_position(&self) -> usize {
        self.write_pos
    }

    /// Bytes left before the write cursor hits the end of the run
    pub fn remaining_write(&self) -> usize {
        self.end - self.write_pos
    }

    /// Bytes left before the read cursor hits the end of the run
    pub fn remaining_read(&self) -> usize {
        self.end - self.read_pos
    }

    /// Move the read cursor back to the start of the payload
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    impl_scalar_accessors! {
        u8 => write_u8, read_u8;
        i8 => write_i8, read_i8;
        u16 => write_u16, read_u16;
        i16 => write_i16, read_i16;
        u32 => write_u32, read_u32;
        i32 => write_i32, read_i32;
        u64 => write_u64, read_u64;
        i64 => write_i64, read_i64;
        f32 => write_f32, read_f32;
        f64 => write_f64, read_f64;
    }

    /// Append a bool as one byte
    pub fn write_bool(&mut self, value: bool) -> ShmResult<()> {
        self.write_u8(u8::from(value))
    }

    /// Read a one-byte bool; any non-zero byte is true
    pub fn read_bool(&mut self) -> ShmResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Append a single-byte character (U+0000 to U+00FF)
    pub fn write_char(&mut self, value: char) -> ShmResult<()> {
        let byte = u8::try_from(value).map_err(|_| ShmError::ValueOutOfRange {
            value: i64::from(u32::from(value)),
            min: 0,
            max: 0xFF,
        })?;
        self.write_u8(byte)
    }

    /// Read a single-byte character
    pub fn read_char(&mut self) -> ShmResult<char> {
        Ok(char::from(self.read_u8()?))
    }

    /// Append an `i32` that must lie in `[min, max]`
    pub fn write_i32_in(&mut self, value: i32, min: i32, max: i32) -> ShmResult<()> {
        check_range(value, min, max)?;
        self.write_i32(value)
    }

    /// Read an `i32` and require it to lie in `[min, max]`.
    ///
    /// The cursor advances even when the value is rejected.
    pub fn read_i32_in(&mut self, min: i32, max: i32) -> ShmResult<i32> {
        let value = self.read_i32()?;
        check_range(value, min, max)?;
        Ok(value)
    }

    /// Append a fixed-length byte range
    pub fn write_bytes(&mut self, bytes: &[u8]) -> ShmResult<()> {
        let at = self.reserve(self.write_pos, bytes.len())?;
        self.arena.write_payload(&self.block, at, bytes);
        self.write_pos = at + bytes.len();
        Ok(())
    }

    /// Read `len` bytes into a new buffer
    pub fn read_bytes(&mut self, len: usize) -> ShmResult<Vec<u8>> {
        // Check before allocating so a bogus length cannot balloon memory.
        self.reserve(self.read_pos, len)?;
        let mut out = vec![0u8; len];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Borrow the next `len` bytes in place, without copying
    pub fn read_slice(&mut self, len: usize) -> ShmResult<&[u8]> {
        let at = self.reserve(self.read_pos, len)?;
        self.read_pos = at + len;
        Ok(self.arena.payload(&self.block, at, len))
    }

    /// Fill `out` from the read cursor
    pub fn read_into(&mut self, out: &mut [u8]) -> ShmResult<()> {
        let at = self.reserve(self.read_pos, out.len())?;
        self.arena.read_payload(&self.block, at, out);
        self.read_pos = at + out.len();
        Ok(())
    }

    fn reserve(&self, at: usize, len: usize) -> ShmResult<usize> {
        let remaining = self.end - at;
        if len > remaining {
            return Err(ShmError::MessageOverflow {
                requested: len,
                remaining,
            });
        }
        Ok(at)
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("block", &self.block)
            .field("message_id", &self.message_id())
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("end", &self.end)
            .finish()
    }
}

fn check_range(value: i32, min: i32, max: i32) -> ShmResult<()> {
    if value < min || value > max {
        return Err(ShmError::ValueOutOfRange {
            value: value.into(),
            min: min.into(),
            max: max.into(),
        });
    }
    Ok(())
}
