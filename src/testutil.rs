//! Shared unit-test fixtures: a synthetic task address space and a minimal
//! Mach-O image builder.

use crate::error::Error;
use crate::macho::{self, MachImage};
use crate::task::TaskMemory;

/// A sparse fake address space made of disjoint regions.
pub(crate) struct FakeTask {
    regions: Vec<(u64, Vec<u8>)>,
}

impl FakeTask {
    pub fn new() -> Self {
        FakeTask {
            regions: Vec::new(),
        }
    }

    pub fn add_region(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }
}

impl TaskMemory for FakeTask {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        for (base, bytes) in &self.regions {
            if let Some(off) = addr.checked_sub(*base) {
                let off = off as usize;
                if let Some(src) = bytes.get(off..off.saturating_add(buf.len())) {
                    if src.len() == buf.len() {
                        buf.copy_from_slice(src);
                        return Ok(());
                    }
                }
            }
        }
        Err(Error::Access)
    }
}

struct SectionSpec {
    segname: String,
    sectname: String,
    addr: u64,
    content: Vec<u8>,
}

/// Builds just enough of a Mach-O image for the parsers under test:
/// a header, a `__TEXT` segment, optional extra segments inferred from the
/// sections added, and an optional LC_UUID.
pub(crate) struct MachBuilder {
    base: u64,
    text_vmsize: u64,
    cputype: u32,
    is_64: bool,
    sections: Vec<SectionSpec>,
    uuid: Option<[u8; 16]>,
}

impl MachBuilder {
    pub fn new64(base: u64, text_vmsize: u64) -> Self {
        MachBuilder {
            base,
            text_vmsize,
            cputype: macho::CPU_TYPE_X86_64,
            is_64: true,
            sections: Vec::new(),
            uuid: None,
        }
    }

    pub fn new32(base: u64, text_vmsize: u64, cputype: u32) -> Self {
        MachBuilder {
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

    pub fn build(self, task: &mut FakeTask, path: &str) -> MachImage {
        let (seg_size, sect_size) = if self.is_64 { (72, 80) } else { (56, 68) };

        // Group sections under their segment, __TEXT first.
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

            let cmdsize = (seg_size + sect_size * sections.len()) as u32;
            push_u32(&mut cmds, if self.is_64 { macho::LC_SEGMENT_64 } else { macho::LC_SEGMENT });
            push_u32(&mut cmds, cmdsize);
            push_name(&mut cmds, segname);
            if self.is_64 {
                push_u64(&mut cmds, vmaddr);
                push_u64(&mut cmds, vmsize);
                push_u64(&mut cmds, 0); // fileoff
                push_u64(&mut cmds, vmsize); // filesize
            } else {
                push_u32(&mut cmds, vmaddr as u32);
                push_u32(&mut cmds, vmsize as u32);
                push_u32(&mut cmds, 0);
                push_u32(&mut cmds, vmsize as u32);
            }
            push_u32(&mut cmds, 7); // maxprot
            push_u32(&mut cmds, 5); // initprot
            push_u32(&mut cmds, sections.len() as u32);
            push_u32(&mut cmds, 0); // flags

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
                push_u32(&mut cmds, 0); // offset
                push_u32(&mut cmds, 0); // align
                push_u32(&mut cmds, 0); // reloff
                push_u32(&mut cmds, 0); // nreloc
                push_u32(&mut cmds, 0); // flags
                push_u32(&mut cmds, 0); // reserved1
                push_u32(&mut cmds, 0); // reserved2
                if self.is_64 {
                    push_u32(&mut cmds, 0); // reserved3
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
        push_u32(&mut header, 3); // cpusubtype
        push_u32(&mut header, 2); // MH_EXECUTE
        push_u32(&mut header, ncmds);
        push_u32(&mut header, cmds.len() as u32);
        push_u32(&mut header, 0); // flags
        if self.is_64 {
            push_u32(&mut header, 0); // reserved
        }
        header.extend_from_slice(&cmds);

        for s in &self.sections {
            task.add_region(s.addr, s.content.clone());
        }
        task.add_region(self.base, header);

        MachImage::new(&*task, self.base, 0, path).expect("synthetic image must parse")
    }
}

pub(crate) fn synth_image(base: u64, text_vmsize: u64, path: &str) -> MachImage {
    let mut task = FakeTask::new();
    MachBuilder::new64(base, text_vmsize).build(&mut task, path)
}

pub(crate) fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);
}
