//! Minimal ELF64 reading.
//!
//! The loader needs exactly the entry point, the program-header table and
//! the `PT_LOAD` entries; nothing else of the format is interpreted.
//! Fields are read from the byte slice directly, so a truncated or
//! corrupt image surfaces as an error instead of an out-of-bounds access.

use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::PteFlags;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELFCLASS64 in `e_ident[4]`.
const ELF_CLASS_64: u8 = 2;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

/// Size of one Elf64_Phdr.
const PHENTSIZE: usize = 56;

const E_ENTRY: usize = 24;
const E_PHOFF: usize = 32;
const E_PHENTSIZE: usize = 54;
const E_PHNUM: usize = 56;

/// One `PT_LOAD`-relevant view of a program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: usize,
    pub p_vaddr: usize,
    pub p_filesz: usize,
    pub p_memsz: usize,
}

/// A validated in-memory ELF image.
#[derive(Clone, Copy)]
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    phoff: usize,
    phnum: usize,
}

fn read_u16(b: &[u8], off: usize) -> KernelResult<u16> {
    let raw = b
        .get(off..off + 2)
        .ok_or(KernelError::BadElf { reason: "truncated" })?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(b: &[u8], off: usize) -> KernelResult<u32> {
    let raw = b
        .get(off..off + 4)
        .ok_or(KernelError::BadElf { reason: "truncated" })?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(b: &[u8], off: usize) -> KernelResult<u64> {
    let raw = b
        .get(off..off + 8)
        .ok_or(KernelError::BadElf { reason: "truncated" })?;
    let mut out = [0u8; 8];
    out.copy_from_slice(raw);
    Ok(u64::from_le_bytes(out))
}

impl<'a> ElfImage<'a> {
    /// Validate the header: magic, 64-bit class, and the expected
    /// program-header entry size.
    pub fn parse(bytes: &'a [u8]) -> KernelResult<Self> {
        if bytes.len() < 64 || bytes[..4] != ELF_MAGIC {
            return Err(KernelError::BadElf { reason: "bad magic" });
        }
        if bytes[4] != ELF_CLASS_64 {
            return Err(KernelError::BadElf { reason: "not 64-bit" });
        }
        if read_u16(bytes, E_PHENTSIZE)? as usize != PHENTSIZE {
            return Err(KernelError::BadElf {
                reason: "unexpected phentsize",
            });
        }
        let phoff = read_u64(bytes, E_PHOFF)? as usize;
        let phnum = read_u16(bytes, E_PHNUM)? as usize;
        if phoff + phnum * PHENTSIZE > bytes.len() {
            return Err(KernelError::BadElf {
                reason: "phdr table out of range",
            });
        }
        Ok(Self {
            bytes,
            phoff,
            phnum,
        })
    }

    pub fn entry(&self) -> usize {
        // parse() checked the header is at least 64 bytes
        read_u64(self.bytes, E_ENTRY).unwrap_or(0) as usize
    }

    pub fn phnum(&self) -> usize {
        self.phnum
    }

    /// The `i`-th program header.
    pub fn ph(&self, i: usize) -> KernelResult<ProgramHeader> {
        if i >= self.phnum {
            return Err(KernelError::BadElf {
                reason: "phdr index out of range",
            });
        }
        let base = self.phoff + i * PHENTSIZE;
        Ok(ProgramHeader {
            p_type: read_u32(self.bytes, base)?,
            p_flags: read_u32(self.bytes, base + 4)?,
            p_offset: read_u64(self.bytes, base + 8)? as usize,
            p_vaddr: read_u64(self.bytes, base + 16)? as usize,
            p_filesz: read_u64(self.bytes, base + 32)? as usize,
            p_memsz: read_u64(self.bytes, base + 40)? as usize,
        })
    }
}

/// PTE permissions for a program header: PF_R/W/X map straight onto
/// R/W/X (user mode is implicit for load segments).
pub fn flags_to_pte(p_flags: u32) -> PteFlags {
    let mut flags = PteFlags::empty();
    if p_flags & PF_R != 0 {
        flags |= PteFlags::R;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::W;
    }
    if p_flags & PF_X != 0 {
        flags |= PteFlags::X;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    /// A header-only image with `phnum` zeroed program headers.
    fn image(phnum: u16) -> Vec<u8> {
        let mut b = vec![0u8; 64 + phnum as usize * PHENTSIZE];
        b[..4].copy_from_slice(&ELF_MAGIC);
        b[4] = ELF_CLASS_64;
        b[E_ENTRY..E_ENTRY + 8].copy_from_slice(&0x1000u64.to_le_bytes());
        b[E_PHOFF..E_PHOFF + 8].copy_from_slice(&64u64.to_le_bytes());
        b[E_PHENTSIZE..E_PHENTSIZE + 2].copy_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        b[E_PHNUM..E_PHNUM + 2].copy_from_slice(&phnum.to_le_bytes());
        b
    }

    fn set_ph(b: &mut [u8], i: usize, ph: &ProgramHeader) {
        let base = 64 + i * PHENTSIZE;
        b[base..base + 4].copy_from_slice(&ph.p_type.to_le_bytes());
        b[base + 4..base + 8].copy_from_slice(&ph.p_flags.to_le_bytes());
        b[base + 8..base + 16].copy_from_slice(&(ph.p_offset as u64).to_le_bytes());
        b[base + 16..base + 24].copy_from_slice(&(ph.p_vaddr as u64).to_le_bytes());
        b[base + 32..base + 40].copy_from_slice(&(ph.p_filesz as u64).to_le_bytes());
        b[base + 40..base + 48].copy_from_slice(&(ph.p_memsz as u64).to_le_bytes());
    }

    #[test]
    fn parse_round_trip() {
        let mut b = image(1);
        let ph = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0x200,
            p_vaddr: 0x1000,
            p_filesz: 0x80,
            p_memsz: 0x3080,
        };
        set_ph(&mut b, 0, &ph);

        let img = ElfImage::parse(&b).unwrap();
        assert_eq!(img.entry(), 0x1000);
        assert_eq!(img.phnum(), 1);
        assert_eq!(img.ph(0).unwrap(), ph);
        assert!(img.ph(1).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut b = image(0);
        b[0] = 0x7e;
        assert!(ElfImage::parse(&b).is_err());
    }

    #[test]
    fn rejects_32_bit() {
        let mut b = image(0);
        b[4] = 1;
        assert!(ElfImage::parse(&b).is_err());
    }

    #[test]
    fn rejects_truncated_phdr_table() {
        let mut b = image(1);
        b[E_PHNUM..E_PHNUM + 2].copy_from_slice(&9u16.to_le_bytes());
        assert!(ElfImage::parse(&b).is_err());
    }

    #[test]
    fn flag_mapping() {
        assert_eq!(flags_to_pte(PF_R), PteFlags::R);
        assert_eq!(
            flags_to_pte(PF_R | PF_W | PF_X),
            PteFlags::R | PteFlags::W | PteFlags::X
        );
        assert_eq!(flags_to_pte(0), PteFlags::empty());
    }
}
