//! ELF images built in memory for host-side tests.

use crate::header::{EHDR_SIZE, ELF_MAGIC, ELFCLASS32, ELFDATA2LSB, EM_386, ET_EXEC, EV_CURRENT, PHDR_SIZE};
use crate::program::PFlags;
use alloc::vec::Vec;

/// Builds a minimal executable image: header, program headers, payload.
pub struct ImageBuilder {
    pub entry: u32,
    pub segments: Vec<(u32, u32, u32, u32, Vec<u8>, u32)>,
}

impl ImageBuilder {
    pub const fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// `(p_type, vaddr, memsz, flags, file bytes, paddr)`
    pub fn segment(mut self, p_type: u32, vaddr: u32, memsz: u32, flags: PFlags, data: &[u8]) -> Self {
        self.segments
            .push((p_type, vaddr, memsz, flags.into_bits(), data.to_vec(), vaddr));
        self
    }

    pub fn at_physical(mut self, paddr: u32) -> Self {
        if let Some(last) = self.segments.last_mut() {
            last.5 = paddr;
        }
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut data_off = phoff + self.segments.len() * PHDR_SIZE;
        let mut out = alloc::vec![0u8; data_off];
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = EV_CURRENT;
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_386.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..28].copy_from_slice(&self.entry.to_le_bytes());
        out[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        out[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[44..46].copy_from_slice(&(self.segments.len() as u16).to_le_bytes());

        for (i, (p_type, vaddr, memsz, flags, bytes, paddr)) in self.segments.iter().enumerate() {
            let at = phoff + i * PHDR_SIZE;
            let fields = [
                *p_type,
                data_off as u32,
                *vaddr,
                *paddr,
                bytes.len() as u32,
                *memsz,
                *flags,
                0x1000,
            ];
            for (j, v) in fields.iter().enumerate() {
                out[at + j * 4..at + j * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
            data_off += bytes.len();
        }
        for (.., bytes, _) in &self.segments {
            out.extend_from_slice(bytes);
        }
        out
    }
}

pub fn rx() -> PFlags {
    PFlags::new().with_read(true).with_execute(true)
}

pub fn rw() -> PFlags {
    PFlags::new().with_read(true).with_write(true)
}
