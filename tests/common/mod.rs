//! Shared fixtures for the integration suites: a synthetic task address
//! space, a Mach-O image builder, and an `__eh_frame` assembler. The tests
//! drive the real unwind/symbolication/report pipeline against these
//! hand-built images, the same way the crash path would walk a live
//! process.

#![allow(dead_code)]

use crashsite::macho::{self, MachImage};
use crashsite::{Error, TaskMemory};

/// A sparse fake address space made of disjoint regions.
#[derive(Default)]
pub struct SparseTask {
    regions: Vec<(u64, Vec<u8>)>,
}

impl SparseTask {
    pub fn new() -> Self {
        SparseTask::default()
    }

    pub fn add_region(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }

    pub fn add_words64(&mut self, base: u64, words: &[u64]) {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.add_region(base, bytes);
    }

    pub fn add_words32(&mut self, base: u64, words: &[u32]) {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        self.add_region(base, bytes);
    }
}

impl TaskMemory for SparseTask {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        for (base, bytes) in &self.regions {
            if let Some(off) = addr.checked_sub(*base) {
                let off = off as usize;
                if let Some(src) = bytes.get(off..off.saturating_add(buf.len())) {
                    buf.copy_from_slice(src);
                    return Ok(());
                }
            }
        }
        Err(Error::Access)
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);
}

struct SectionSpec {
    segname: String,
    sectname: String,
    addr: u64,
    content: Vec<u8>,
}

/// Assembles a loadable Mach-O image: header, `__TEXT` segment, additional
/// segments inferred from the sections added, optional LC_UUID.
pub struct ImageBuilder {
    base: u64,
    text_vmsize: u64,
    cputype: u32,
    is_64: bool,
    sections: Vec<SectionSpec>,
    uuid: Option<[u8; 16]>,
}

impl ImageBuilder {
    pub fn new64(base: u64, text_vmsize: u64) -> Self {
        ImageBuilder {
            base,
            text_vmsize,
            cputype: macho::CPU_TYPE_X86_64,
            is_64: true,
            sections: Vec::new(),
            uuid: None,
        }
    }

    pub fn new32(base: u64, text_vmsize: u64, cputype: u32) -> Self {
        ImageBuilder {
            base,
            text_vmsize,
            cputype,
            is_64: false,
            sections: Vec::new(),
            uuid: None,
        }
    }

    pub fn section(mut self, segname: &str, sectname: &str, addr: u64, content: Vec<u8>) -> Self {
        self.sections.push(SectionSpec {
            segname: segname.into(),
            sectname: sectname.into(),
            addr,
            content,
        });
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn build(self, task: &mut SparseTask, path: &str) -> MachImage {
        let (seg_size, sect_size) = if self.is_64 { (72, 80) } else { (56, 68) };

        let mut segnames: Vec<&str> = vec![macho::SEG_TEXT];
        for s in &self.sections {
            if !segnames.iter().any(|n| *n == s.segname) {
                segnames.push(&s.segname);
            }
        }

        let mut cmds = Vec::new();
        let mut ncmds = 0u32;
        for segname in &segnames {
            let sections: Vec<&SectionSpec> = self
                .sections
                .iter()
                .filter(|s| s.segname == *segname)
                .collect();
            let (vmaddr, vmsize) = if *segname == macho::SEG_TEXT {
                (self.base, self.text_vmsize)
            } else {
                let lo = sections.iter().map(|s| s.addr).min().unwrap();
                let hi = sections
                    .iter()
                    .map(|s| s.addr + s.content.len() as u64)
                    .max()
                    .unwrap();
                (lo, hi - lo)
            };

            push_u32(
                &mut cmds,
                if self.is_64 { macho::LC_SEGMENT_64 } else { macho::LC_SEGMENT },
            );
            push_u32(&mut cmds, (seg_size + sect_size * sections.len()) as u32);
            push_name(&mut cmds, segname);
            if self.is_64 {
                push_u64(&mut cmds, vmaddr);
                push_u64(&mut cmds, vmsize);
                push_u64(&mut cmds, 0);
                push_u64(&mut cmds, vmsize);
            } else {
                push_u32(&mut cmds, vmaddr as u32);
                push_u32(&mut cmds, vmsize as u32);
                push_u32(&mut cmds, 0);
                push_u32(&mut cmds, vmsize as u32);
            }
            push_u32(&mut cmds, 7);
            push_u32(&mut cmds, 5);
            push_u32(&mut cmds, sections.len() as u32);
            push_u32(&mut cmds, 0);

            for s in sections {
                push_name(&mut cmds, &s.sectname);
                push_name(&mut cmds, segname);
                if self.is_64 {
                    push_u64(&mut cmds, s.addr);
                    push_u64(&mut cmds, s.content.len() as u64);
                } else {
                    push_u32(&mut cmds, s.addr as u32);
                    push_u32(&mut cmds, s.content.len() as u32);
                }
                for _ in 0..if self.is_64 { 8 } else { 7 } {
                    push_u32(&mut cmds, 0);
                }
            }
            ncmds += 1;
        }

        if let Some(uuid) = self.uuid {
            push_u32(&mut cmds, macho::LC_UUID);
            push_u32(&mut cmds, 24);
            cmds.extend_from_slice(&uuid);
            ncmds += 1;
        }

        let mut header = Vec::new();
        push_u32(
            &mut header,
            if self.is_64 { macho::MH_MAGIC_64 } else { macho::MH_MAGIC },
        );
        push_u32(&mut header, self.cputype);
        push_u32(&mut header, 3);
        push_u32(&mut header, 2);
        push_u32(&mut header, ncmds);
        push_u32(&mut header, cmds.len() as u32);
        push_u32(&mut header, 0);
        if self.is_64 {
            push_u32(&mut header, 0);
        }
        header.extend_from_slice(&cmds);

        for s in &self.sections {
            task.add_region(s.addr, s.content.clone());
        }
        task.add_region(self.base, header);

        MachImage::new(&*task, self.base, 0, path).expect("synthetic image must parse")
    }
}

/// Serialize a one-page `__unwind_info` section from image-relative
/// `(address, opcode)` pairs; `range_end` is the first uncovered address.
pub fn build_unwind_info(entries: &[(u32, u32)], range_end: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let header_size = 7 * 4u32;
    let pages_offset = header_size;
    let page_offset = pages_offset + 2 * 12;

    for v in [1u32, header_size, 0, header_size, 0, pages_offset, 2] {
        push_u32(&mut out, v);
    }
    for v in [entries.first().map(|e| e.0).unwrap_or(0), page_offset, 0] {
        push_u32(&mut out, v);
    }
    for v in [range_end, 0, 0] {
        push_u32(&mut out, v);
    }
    push_u32(&mut out, 2); // regular page
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (addr, opcode) in entries {
        push_u32(&mut out, *addr);
        push_u32(&mut out, *opcode);
    }
    out
}

/// Compact-unwind opcode constructors (x86-family encodings).
pub mod opcodes {
    /// Frame-based: `regs` are compact register numbers for the five save
    /// slots (0 = unused), stored starting `offset` pointer-words below the
    /// frame pointer.
    pub fn frame_based(offset: u32, regs: [u32; 5]) -> u32 {
        let mut packed = 0u32;
        for (i, r) in regs.iter().enumerate() {
            packed |= r << (3 * i);
        }
        (1 << 24) | (offset << 16) | packed
    }

    /// Frameless immediate: `stack_size_words` pointer-words of stack,
    /// `reg_count` registers pushed in the order encoded by `permutation`.
    pub fn frameless_immd(stack_size_words: u32, reg_count: u32, permutation: u32) -> u32 {
        (2 << 24) | (stack_size_words << 16) | (reg_count << 10) | permutation
    }

    /// Defer to the FDE at `fde_offset` within `__eh_frame`.
    pub fn dwarf(fde_offset: u32) -> u32 {
        (4 << 24) | fde_offset
    }
}

/// DWARF call-frame instruction bytes.
pub mod cfi {
    pub fn uleb(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    pub fn def_cfa(out: &mut Vec<u8>, reg: u64, offset: u64) {
        out.push(0x0c);
        uleb(out, reg);
        uleb(out, offset);
    }

    pub fn def_cfa_offset(out: &mut Vec<u8>, offset: u64) {
        out.push(0x0e);
        uleb(out, offset);
    }

    /// `DW_CFA_offset`: register saved at CFA minus `factored` data units.
    pub fn offset(out: &mut Vec<u8>, reg: u8, factored: u64) {
        out.push(0x80 | reg);
        uleb(out, factored);
    }

    pub fn advance_loc(out: &mut Vec<u8>, delta: u8) {
        out.push(0x40 | delta);
    }
}

/// Assembles an `__eh_frame` section: CIEs, FDEs, and the terminator.
pub struct EhFrameBuilder {
    bytes: Vec<u8>,
}

impl EhFrameBuilder {
    pub fn new() -> Self {
        EhFrameBuilder { bytes: Vec::new() }
    }

    /// Append a CIE and return its section offset. `data_align` is the
    /// factored-data multiplier (-8 for x86_64), `ra_register` the DWARF
    /// return-address column.
    pub fn cie(&mut self, data_align: i64, ra_register: u8, initial: &[u8]) -> u32 {
        let offset = self.bytes.len() as u32;
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        body.push(1); // version
        body.push(0); // empty augmentation
        cfi::uleb(&mut body, 1); // code alignment
        sleb(&mut body, data_align);
        body.push(ra_register);
        body.extend_from_slice(initial);
        while (body.len() + 4) % 4 != 0 {
            body.push(0); // DW_CFA_nop
        }
        self.bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&body);
        offset
    }

    /// Append an FDE covering `[initial_location, initial_location + len)`
    /// and return its section offset.
    pub fn fde(&mut self, cie_offset: u32, initial_location: u64, len: u64, instrs: &[u8]) -> u32 {
        let offset = self.bytes.len() as u32;
        let mut body = Vec::new();
        // The CIE pointer counts back from its own field position.
        let cie_pointer = (offset + 4) - cie_offset;
        body.extend_from_slice(&cie_pointer.to_le_bytes());
        body.extend_from_slice(&initial_location.to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(instrs);
        while (body.len() + 4) % 4 != 0 {
            body.push(0);
        }
        self.bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&body);
        offset
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
        self.bytes
    }
}

fn sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign = byte & 0x40 != 0;
        if (value == 0 && !sign) || (value == -1 && sign) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}
