//! Unaligned integer accessors.
//!
//! All on-disk / in-memory structures parsed by this crate are described as
//! `#[repr(C)]` structs whose fields are these byte-array wrappers. They have
//! alignment 1, so [`zerocopy::LayoutVerified`] can overlay them onto any
//! offset of a mapped buffer, and reads go through explicit byte-order
//! conversion instead of native loads.

use zerocopy::{AsBytes, FromBytes};

/// Byte order of a parsed image.
///
/// Images record their byte order in the Mach-O magic; everything downstream
/// (load commands, ObjC metadata) is swapped through the image's descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(transparent)]
pub struct U16(pub [u8; 2]);

#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(transparent)]
pub struct U32(pub [u8; 4]);

#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(transparent)]
pub struct U64(pub [u8; 8]);

impl U16 {
    pub fn get(self, bo: ByteOrder) -> u16 {
        match bo {
            ByteOrder::LittleEndian => u16::from_le_bytes(self.0),
            ByteOrder::BigEndian => u16::from_be_bytes(self.0),
        }
    }
}

impl U32 {
    pub fn get(self, bo: ByteOrder) -> u32 {
        match bo {
            ByteOrder::LittleEndian => u32::from_le_bytes(self.0),
            ByteOrder::BigEndian => u32::from_be_bytes(self.0),
        }
    }
}

impl U64 {
    pub fn get(self, bo: ByteOrder) -> u64 {
        match bo {
            ByteOrder::LittleEndian => u64::from_le_bytes(self.0),
            ByteOrder::BigEndian => u64::from_be_bytes(self.0),
        }
    }
}

/// The `__unwind_info` format is only emitted for little-endian targets, so
/// its reader uses the infallible conversions below.
impl From<U16> for u16 {
    fn from(v: U16) -> u16 {
        u16::from_le_bytes(v.0)
    }
}

impl From<U32> for u32 {
    fn from(v: U32) -> u32 {
        u32::from_le_bytes(v.0)
    }
}

impl From<U64> for u64 {
    fn from(v: U64) -> u64 {
        u64::from_le_bytes(v.0)
    }
}
