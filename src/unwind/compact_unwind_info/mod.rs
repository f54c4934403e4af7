//! Two-level `__unwind_info` lookup.
//!
//! [`lookup`] maps an image-relative instruction address to the function
//! that covers it and that function's 32-bit unwind opcode. The address
//! falling into no second-level page is not an error; it comes back as
//! `Ok(None)` so the caller can fall through to the next frame reader.

mod raw;

use std::fmt::Debug;

use crate::display_utils::{BinNum, HexNum};
use crate::error::Error;

use raw::{
    CompactUnwindInfoHeader, CompressedPage, RegularPage, PAGE_KIND_COMPRESSED, PAGE_KIND_REGULAR,
};

/// One function's worth of unwind description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Function {
    /// Image-relative start address.
    pub start_address: u32,
    /// Image-relative end address (exclusive).
    pub end_address: u32,
    pub opcode: u32,
}

/// Find the function covering the image-relative address `pc`.
pub fn lookup(data: &[u8], pc: u32) -> Result<Option<Function>, Error> {
    let header = CompactUnwindInfoHeader::parse(data).ok_or(Error::InvalidData)?;
    if header.version() != 1 {
        return Err(Error::InvalidData);
    }
    let pages = header.pages(data).ok_or(Error::InvalidData)?;
    if pages.is_empty() {
        return Ok(None);
    }

    // First level: find the last page whose first_address <= pc. The final
    // entry is a sentinel carrying the end address of the covered range.
    let page_index = match pages.binary_search_by_key(&pc, |page| page.first_address()) {
        Ok(i) => i,
        Err(0) => return Ok(None),
        Err(i) => i - 1,
    };
    let page = &pages[page_index];
    if page.is_sentinel() {
        return Ok(None);
    }
    let range_end = pages
        .get(page_index + 1)
        .map(|next| next.first_address())
        .unwrap_or(u32::MAX);

    let page_offset = page.page_offset();
    match page.page_kind(data).ok_or(Error::InvalidData)? {
        PAGE_KIND_REGULAR => {
            let second = RegularPage::parse(data, page_offset.into()).ok_or(Error::InvalidData)?;
            let entries = second.entries(data, page_offset).ok_or(Error::InvalidData)?;
            let index = match entries.binary_search_by_key(&pc, |e| e.instruction_address()) {
                Ok(i) => i,
                Err(0) => return Ok(None),
                Err(i) => i - 1,
            };
            let entry = &entries[index];
            let end_address = entries
                .get(index + 1)
                .map(|e| e.instruction_address())
                .unwrap_or(range_end);
            Ok(Some(Function {
                start_address: entry.instruction_address(),
                end_address,
                opcode: entry.opcode(),
            }))
        }
        PAGE_KIND_COMPRESSED => {
            let second =
                CompressedPage::parse(data, page_offset.into()).ok_or(Error::InvalidData)?;
            let entries = second.entries(data, page_offset).ok_or(Error::InvalidData)?;
            let rel_pc = pc - page.first_address();
            let index = match entries.binary_search_by_key(&rel_pc, |e| {
                CompressedEntryBitfield::new((*e).into()).relative_instruction_address()
            }) {
                Ok(i) => i,
                Err(0) => return Ok(None),
                Err(i) => i - 1,
            };
            let entry = CompressedEntryBitfield::new(entries[index].into());
            let end_address = entries
                .get(index + 1)
                .map(|e| {
                    page.first_address()
                        + CompressedEntryBitfield::new((*e).into()).relative_instruction_address()
                })
                .unwrap_or(range_end);

            // Palette resolution: indexes below the global palette length
            // select a global opcode, the rest select per-page opcodes.
            let global = header.global_opcodes(data).ok_or(Error::InvalidData)?;
            let opcode_index = entry.opcode_index() as usize;
            let opcode = if opcode_index < global.len() {
                global[opcode_index].into()
            } else {
                let local = second.local_opcodes(data, page_offset).ok_or(Error::InvalidData)?;
                let local_index = opcode_index - global.len();
                u32::from(*local.get(local_index).ok_or(Error::InvalidData)?)
            };
            Ok(Some(Function {
                start_address: page.first_address() + entry.relative_instruction_address(),
                end_address,
                opcode,
            }))
        }
        _ => Err(Error::InvalidData),
    }
}

/// The architecture-independent bits of an unwind opcode: the high nibble
/// selects a mode, the low 24 bits are mode-specific.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OpcodeBitfield(pub u32);

impl OpcodeBitfield {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// The architecture-specific kind of opcode this is, specifying how to
    /// interpret the remaining 24 bits.
    pub fn kind(&self) -> u8 {
        ((self.0 >> 24) & 0b1111) as u8
    }

    pub fn specific_bits(&self) -> u32 {
        self.0 & 0xff_ffff
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl Debug for OpcodeBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opcode")
            .field("kind", &self.kind())
            .field("specific_bits", &BinNum(self.specific_bits()))
            .finish()
    }
}

/// Entries of a compressed page: 8 bits of opcode palette index over a
/// 24-bit page-relative instruction address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CompressedEntryBitfield(pub u32);

impl CompressedEntryBitfield {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn opcode_index(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn relative_instruction_address(&self) -> u32 {
        self.0 & 0xff_ffff
    }
}

impl Debug for CompressedEntryBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedEntryBitfield")
            .field("opcode_index", &HexNum(self.opcode_index()))
            .field(
                "relative_instruction_address",
                &HexNum(self.relative_instruction_address()),
            )
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Serialize a minimal one-page `__unwind_info` section. `entries` are
    /// `(image_relative_address, opcode)` pairs, sorted; `range_end` is the
    /// first address past the covered range (the sentinel page).
    pub fn synth_unwind_info(entries: &[(u32, u32)], range_end: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let header_size = 7 * 4;
        let pages_offset = header_size;
        let page_offset = pages_offset + 2 * 12;

        // Header: version 1, no global opcodes, no personalities, two page
        // entries (one regular, one sentinel).
        for v in [1u32, header_size, 0, header_size, 0, pages_offset, 2] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        // First-level entries.
        for v in [entries.first().map(|e| e.0).unwrap_or(0), page_offset, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in [range_end, 0, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        // Regular second-level page.
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes()); // entries at page + 8
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (addr, opcode) in entries {
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&opcode.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regular_page_lookup() {
        let data = test_support::synth_unwind_info(
            &[(0x1000, 0x0400_0010), (0x1800, 0x0200_0020)],
            0x2000,
        );

        assert_eq!(lookup(&data, 0xfff).unwrap(), None);
        assert_eq!(
            lookup(&data, 0x1000).unwrap(),
            Some(Function {
                start_address: 0x1000,
                end_address: 0x1800,
                opcode: 0x0400_0010
            })
        );
        assert_eq!(
            lookup(&data, 0x17ff).unwrap().unwrap().opcode,
            0x0400_0010
        );
        assert_eq!(
            lookup(&data, 0x1fff).unwrap(),
            Some(Function {
                start_address: 0x1800,
                end_address: 0x2000,
                opcode: 0x0200_0020
            })
        );
        // Past the sentinel: uncovered.
        assert_eq!(lookup(&data, 0x2000).unwrap(), None);
        assert_eq!(lookup(&data, 0x9000).unwrap(), None);
    }

    #[test]
    fn compressed_page_lookup() {
        // Hand-built section with one compressed page: global palette
        // [0xAAAA], local palette [0xBBBB]; functions at +0x10 (global
        // opcode 0) and +0x30 (local opcode 1).
        let mut out = Vec::new();
        let header_size = 7 * 4u32;
        let global_offset = header_size;
        let pages_offset = global_offset + 4;
        let page_offset = pages_offset + 2 * 12;
        for v in [1u32, global_offset, 1, header_size, 0, pages_offset, 2] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&0xAAAAu32.to_le_bytes());
        for v in [0x5000u32, page_offset, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0x6000u32, 0, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        // Compressed page header: kind, entries at +12, 2 entries, local
        // opcodes at +20, 1 local opcode.
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&12u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&((0u32 << 24) | 0x10).to_le_bytes());
        out.extend_from_slice(&((1u32 << 24) | 0x30).to_le_bytes());
        out.extend_from_slice(&0xBBBBu32.to_le_bytes());

        assert_eq!(lookup(&out, 0x4fff).unwrap(), None);
        assert_eq!(
            lookup(&out, 0x5020).unwrap(),
            Some(Function {
                start_address: 0x5010,
                end_address: 0x5030,
                opcode: 0xAAAA
            })
        );
        assert_eq!(
            lookup(&out, 0x5fff).unwrap(),
            Some(Function {
                start_address: 0x5030,
                end_address: 0x6000,
                opcode: 0xBBBB
            })
        );
        assert_eq!(lookup(&out, 0x6000).unwrap(), None);
    }
}
