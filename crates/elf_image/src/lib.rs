//! ELF64 decoding over memory-mapped object files.
//!
//! An [`ElfImage`] wraps the raw bytes of an object file that has been mapped
//! into the address space (either the whole file, or the runtime image of an
//! already-loaded object) and offers typed access to the structures the
//! loader needs at runtime: the header, program headers, the dynamic section,
//! the dynamic symbol table with its SysV and GNU hash tables, the symbol
//! version tables, relocation tables, and the GNU build-id note.
//!
//! The structures are *not* copied out of the mapping; accessors hand out
//! references into it, so an `ElfImage` must never outlive the mapping it
//! was created over.

pub mod defs;
mod dynamic;
mod notes;
mod symbols;
mod versions;

pub use dynamic::DynamicInfo;
pub use symbols::{elf_hash, gnu_hash, SymbolTable};
pub use versions::{VersionEntry, VersionTable};

use goblin::elf::header::{ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, SELFMAG};
use goblin::elf64::header::Header;
use goblin::elf64::program_header::ProgramHeader;
use goblin::elf64::reloc::Rela;
use goblin::elf64::section_header::SectionHeader;
use goblin::elf64::sym::Sym;

use defs::{ELFOSABI_LINUX, ELFOSABI_NONE, EI_ABIVERSION, EI_CLASS, EI_DATA, EI_OSABI, EI_VERSION};

/// A decoded view over the raw bytes of an ELF64 object.
///
/// `addr` is the address of the ELF header; `size` bounds all accesses.
#[derive(Debug, Clone, Copy)]
pub struct ElfImage {
    addr: usize,
    size: usize,
}

impl ElfImage {
    /// Wraps the mapping at `addr` spanning `size` bytes.
    ///
    /// Validates the identification bytes, class, data encoding, OS ABI and
    /// machine so that every later accessor can rely on a well-formed header.
    pub fn new(addr: usize, size: usize) -> Result<ElfImage, &'static str> {
        if size < core::mem::size_of::<Header>() {
            return Err("file too small for an ELF header");
        }
        let image = ElfImage { addr, size };
        let header = image.header();
        if header.e_ident[..SELFMAG] != ELFMAG[..] {
            return Err("no valid ELF identification header");
        }
        if header.e_ident[EI_CLASS] != ELFCLASS64 || header.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err("only little-endian ELF64 objects are supported");
        }
        if header.e_ident[EI_VERSION] != 1 {
            return Err("unsupported ELF version");
        }
        match header.e_ident[EI_OSABI] {
            ELFOSABI_NONE | ELFOSABI_LINUX => {}
            _ => return Err("unsupported OS ABI"),
        }
        if header.e_machine != EM_X86_64 {
            return Err("unsupported machine");
        }
        Ok(image)
    }

    /// Start address of the mapping this image was created over.
    #[inline]
    pub fn address(&self) -> usize {
        self.addr
    }

    /// Size in bytes of the mapping this image was created over.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The ELF file header.
    #[inline]
    pub fn header(&self) -> &Header {
        // Size was checked in `new`; the header lives at offset 0.
        unsafe { &*(self.addr as *const Header) }
    }

    /// The first three identification bytes after the magic (class, data,
    /// version) plus OS ABI and ABI version, used for update compatibility
    /// checks between two versions of the same file.
    pub fn identification(&self) -> [u8; 5] {
        let ident = &self.header().e_ident;
        [
            ident[EI_CLASS],
            ident[EI_DATA],
            ident[EI_VERSION],
            ident[EI_OSABI],
            ident[EI_ABIVERSION],
        ]
    }

    /// ELF type (`ET_EXEC`, `ET_DYN`, `ET_REL`).
    #[inline]
    pub fn etype(&self) -> u16 {
        self.header().e_type
    }

    /// Program headers.
    pub fn program_headers(&self) -> &[ProgramHeader] {
        let header = self.header();
        let offset = header.e_phoff as usize;
        let count = header.e_phnum as usize;
        if offset == 0 || offset + count * core::mem::size_of::<ProgramHeader>() > self.size {
            return &[];
        }
        unsafe { core::slice::from_raw_parts((self.addr + offset) as *const ProgramHeader, count) }
    }

    /// Section headers (present in the file mapping; not available for
    /// premapped runtime images whose section headers were not loaded).
    pub fn section_headers(&self) -> &[SectionHeader] {
        let header = self.header();
        let offset = header.e_shoff as usize;
        let count = header.e_shnum as usize;
        if offset == 0 || offset + count * core::mem::size_of::<SectionHeader>() > self.size {
            return &[];
        }
        unsafe { core::slice::from_raw_parts((self.addr + offset) as *const SectionHeader, count) }
    }

    /// Name of the given section from the section header string table.
    pub fn section_name(&self, section: &SectionHeader) -> Option<&str> {
        let shstrndx = self.header().e_shstrndx as usize;
        let strtab = self.section_headers().get(shstrndx)?;
        let offset = strtab.sh_offset as usize + section.sh_name as usize;
        self.str_at(offset)
    }

    /// Raw contents of the given section within the file mapping.
    pub fn section_bytes(&self, section: &SectionHeader) -> Option<&[u8]> {
        let offset = section.sh_offset as usize;
        let len = section.sh_size as usize;
        self.bytes_at(offset, len)
    }

    /// A bounded byte slice of the mapping.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset.checked_add(len)? > self.size {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts((self.addr + offset) as *const u8, len) })
    }

    /// A NUL-terminated string at the given offset of the mapping.
    pub fn str_at(&self, offset: usize) -> Option<&str> {
        if offset >= self.size {
            return None;
        }
        let start = (self.addr + offset) as *const u8;
        let max = self.size - offset;
        let mut len = 0;
        unsafe {
            while len < max && *start.add(len) != 0 {
                len += 1;
            }
            core::str::from_utf8(core::slice::from_raw_parts(start, len)).ok()
        }
    }

    /// Translates a virtual address from the file's program headers into an
    /// offset within the file mapping (for images that are *not* loaded at
    /// their runtime addresses yet).
    pub fn vaddr_to_offset(&self, vaddr: usize) -> Option<usize> {
        for phdr in self.program_headers() {
            if phdr.p_type == goblin::elf::program_header::PT_LOAD
                && vaddr >= phdr.p_vaddr as usize
                && vaddr < (phdr.p_vaddr + phdr.p_filesz) as usize
            {
                return Some(vaddr - phdr.p_vaddr as usize + phdr.p_offset as usize);
            }
        }
        None
    }

    /// Virtual address of the first `PT_LOAD` segment; the delta between a
    /// premapped image's location and this value is the load bias.
    pub fn virt_offset(&self) -> usize {
        for phdr in self.program_headers() {
            if phdr.p_type == goblin::elf::program_header::PT_LOAD {
                return phdr.p_vaddr as usize;
            }
        }
        0
    }

    /// Total size of the file derived from the section header table location,
    /// used when the image was handed over as a bare memory address.
    pub fn derived_size(&self) -> usize {
        let header = self.header();
        let section_end = header.e_shoff as usize
            + header.e_shnum as usize * core::mem::size_of::<SectionHeader>();
        let mut end = section_end;
        for phdr in self.program_headers() {
            let phdr_end = (phdr.p_offset + phdr.p_filesz) as usize;
            if phdr_end > end {
                end = phdr_end;
            }
        }
        end
    }

    /// The dynamic section, resolved against this mapping.
    ///
    /// With `loaded == false` the dynamic pointers (vaddrs) are translated
    /// through the program headers into file offsets; with `loaded == true`
    /// the image is assumed to sit at its runtime location and the pointers
    /// are used relative to the load bias.
    pub fn dynamic(&self, loaded: bool) -> Option<DynamicInfo> {
        DynamicInfo::parse(self, loaded)
    }

    /// The GNU build-id as a lowercase hex string, if the file carries one.
    pub fn build_id(&self) -> Option<String> {
        notes::build_id(self)
    }

    /// A relocation-with-addend table at the given absolute address.
    pub fn rela_table(addr: usize, size_bytes: usize) -> &'static [Rela] {
        let count = size_bytes / core::mem::size_of::<Rela>();
        if addr == 0 || count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(addr as *const Rela, count) }
    }

    /// A symbol table at the given absolute address with `count` entries.
    pub fn sym_table(addr: usize, count: usize) -> &'static [Sym] {
        if addr == 0 || count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(addr as *const Sym, count) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> Vec<u8> {
        let mut bytes = vec![0u8; core::mem::size_of::<Header>()];
        bytes[..4].copy_from_slice(&ELFMAG[..]);
        bytes[EI_CLASS] = ELFCLASS64;
        bytes[EI_DATA] = ELFDATA2LSB;
        bytes[EI_VERSION] = 1;
        bytes[EI_OSABI] = ELFOSABI_NONE;
        // e_type = ET_DYN (3) at offset 16, e_machine = EM_X86_64 (62) at 18
        bytes[16] = 3;
        bytes[18] = 62;
        // e_version = 1 at offset 20
        bytes[20] = 1;
        bytes
    }

    #[test]
    fn accepts_minimal_dyn_header() {
        let bytes = minimal_header();
        let image = ElfImage::new(bytes.as_ptr() as usize, bytes.len()).unwrap();
        assert_eq!(image.etype(), goblin::elf::header::ET_DYN);
        assert!(image.program_headers().is_empty());
    }

    #[test]
    fn rejects_short_file() {
        let bytes = [0u8; 16];
        assert!(ElfImage::new(bytes.as_ptr() as usize, bytes.len()).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = minimal_header();
        bytes[0] = b'Z';
        assert!(ElfImage::new(bytes.as_ptr() as usize, bytes.len()).is_err());
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut bytes = minimal_header();
        bytes[18] = 40; // EM_ARM
        assert!(ElfImage::new(bytes.as_ptr() as usize, bytes.len()).is_err());
    }

    #[test]
    fn str_at_is_bounded() {
        let bytes = minimal_header();
        let image = ElfImage::new(bytes.as_ptr() as usize, bytes.len()).unwrap();
        assert!(image.str_at(bytes.len() + 10).is_none());
    }
}
