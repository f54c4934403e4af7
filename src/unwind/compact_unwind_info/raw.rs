//! Raw structure definitions for the `__unwind_info` section.
//!
//! The section is a two-level lookup structure: a header pointing at a
//! sorted array of first-level [`PageEntry`]s, each of which points at a
//! second-level page ([`RegularPage`] or [`CompressedPage`]) mapping
//! instruction addresses to 32-bit opcodes. Opcodes for compressed pages
//! come from a global or per-page palette.

use std::fmt::Debug;

use zerocopy::FromBytes;

use crate::display_utils::HexNum;
use crate::mobject::ReadStruct;
use crate::unaligned::{U16, U32};

#[derive(FromBytes, Debug, Clone, Copy)]
#[repr(C)]
pub struct CompactUnwindInfoHeader {
    /// Only version 1 is defined.
    pub version: U32,

    /// The array of u32 global opcodes (offset relative to section start).
    ///
    /// These may be indexed by "compressed" second-level pages.
    pub global_opcodes_offset: U32,
    pub global_opcodes_len: U32,

    /// The array of u32 global personality codes (offset relative to section
    /// start). Stored by the compiler for landing-pad dispatch; report
    /// generation never consults them.
    pub personalities_offset: U32,
    pub personalities_len: U32,

    /// The array of [`PageEntry`]s (offset relative to section start).
    pub pages_offset: U32,
    pub pages_len: U32,
    // Several dynamically-sized arrays follow; they are only ever reached
    // through the offsets above.
}

impl CompactUnwindInfoHeader {
    pub fn parse(data: &[u8]) -> Option<&Self> {
        data.read_at::<CompactUnwindInfoHeader>(0)
    }

    pub fn version(&self) -> u32 {
        self.version.into()
    }

    /// Return the list of global opcodes.
    pub fn global_opcodes<'data>(&self, data: &'data [u8]) -> Option<&'data [U32]> {
        data.read_slice_at::<U32>(
            u32::from(self.global_opcodes_offset).into(),
            u32::from(self.global_opcodes_len) as usize,
        )
    }

    /// Return the list of first-level pages.
    pub fn pages<'data>(&self, data: &'data [u8]) -> Option<&'data [PageEntry]> {
        data.read_slice_at::<PageEntry>(
            u32::from(self.pages_offset).into(),
            u32::from(self.pages_len) as usize,
        )
    }
}

#[derive(FromBytes, Clone, Copy)]
#[repr(C)]
pub struct PageEntry {
    /// The first instruction address mapped by this page, relative to the
    /// image base. The array is sorted by this field, which is what the
    /// first-level binary search runs on.
    pub first_address: U32,

    /// Offset of the second-level page. Zero marks the sentinel entry whose
    /// `first_address` is the end of the covered range.
    pub page_offset: U32,

    /// Base offset into the lsda index for entries of this page. Unused
    /// here.
    pub lsda_index_offset: U32,
}

impl PageEntry {
    pub fn first_address(&self) -> u32 {
        self.first_address.into()
    }

    pub fn page_offset(&self) -> u32 {
        self.page_offset.into()
    }

    pub fn is_sentinel(&self) -> bool {
        self.page_offset() == 0
    }

    pub fn page_kind(&self, data: &[u8]) -> Option<u32> {
        let kind: &U32 = data.read_at(self.page_offset().into())?;
        Some(u32::from(*kind))
    }
}

impl Debug for PageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageEntry")
            .field("first_address", &HexNum(self.first_address()))
            .field("page_offset", &HexNum(self.page_offset()))
            .finish()
    }
}

pub const PAGE_KIND_REGULAR: u32 = 2;
pub const PAGE_KIND_COMPRESSED: u32 = 3;

#[derive(FromBytes, Debug, Clone, Copy)]
#[repr(C)]
pub struct RegularPage {
    /// Always 2 (distinguishes from CompressedPage).
    pub kind: U32,

    /// The array of [`RegularEntry`]s (offset relative to page start).
    pub entries_offset: U16,
    pub entries_len: U16,
}

impl RegularPage {
    pub fn parse(data: &[u8], page_offset: u64) -> Option<&Self> {
        data.read_at::<Self>(page_offset)
    }

    pub fn entries<'data>(&self, data: &'data [u8], page_offset: u32) -> Option<&'data [RegularEntry]> {
        let offset = page_offset as u64 + u16::from(self.entries_offset) as u64;
        data.read_slice_at::<RegularEntry>(offset, u16::from(self.entries_len) as usize)
    }
}

#[derive(FromBytes, Debug, Clone, Copy)]
#[repr(C)]
pub struct CompressedPage {
    /// Always 3 (distinguishes from RegularPage).
    pub kind: U32,

    /// The array of compressed u32 entries (offset relative to page start).
    ///
    /// Each entry packs an 8-bit opcode palette index over a 24-bit
    /// instruction address relative to the page's `first_address`.
    pub entries_offset: U16,
    pub entries_len: U16,

    /// The per-page opcode palette (offset relative to page start).
    pub local_opcodes_offset: U16,
    pub local_opcodes_len: U16,
}

impl CompressedPage {
    pub fn parse(data: &[u8], page_offset: u64) -> Option<&Self> {
        data.read_at::<Self>(page_offset)
    }

    pub fn entries<'data>(&self, data: &'data [u8], page_offset: u32) -> Option<&'data [U32]> {
        let offset = page_offset as u64 + u16::from(self.entries_offset) as u64;
        data.read_slice_at::<U32>(offset, u16::from(self.entries_len) as usize)
    }

    pub fn local_opcodes<'data>(&self, data: &'data [u8], page_offset: u32) -> Option<&'data [U32]> {
        let offset = page_offset as u64 + u16::from(self.local_opcodes_offset) as u64;
        data.read_slice_at::<U32>(offset, u16::from(self.local_opcodes_len) as usize)
    }
}

#[derive(FromBytes, Debug, Clone, Copy)]
#[repr(C)]
pub struct RegularEntry {
    /// The instruction address for this entry, relative to the image base.
    pub instruction_address: U32,

    /// The opcode for this address.
    pub opcode: U32,
}

impl RegularEntry {
    pub fn instruction_address(&self) -> u32 {
        self.instruction_address.into()
    }

    pub fn opcode(&self) -> u32 {
        self.opcode.into()
    }
}
