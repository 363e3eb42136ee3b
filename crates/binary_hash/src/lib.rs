//! Per-symbol content fingerprints.
//!
//! A [`BinaryHash`] summarizes every defined symbol of an object file as a
//! 64-bit digest over the bytes backing it, together with a coarse
//! classification of the section it lives in. Comparing the summaries of two
//! versions of the same file yields the set of changed symbols, which drives
//! both the patchability decision (disruptive data-layout changes reject an
//! update) and the installation of code redirections for changed functions.

use std::collections::HashMap;

use elf_image::ElfImage;
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_TLS, SHF_WRITE, SHT_NOBITS, SHT_SYMTAB};
use goblin::elf64::section_header::SectionHeader;
use goblin::elf64::sym::Sym;
use log::debug;
use xxhash_rust::xxh64::xxh64;

/// Coarse classification of the section a symbol lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Executable code.
    Code,
    /// Read-only data.
    Rodata,
    /// Writable data (including BSS).
    Data,
    /// Relocation-read-only data (write-protected after relocation).
    Relro,
    /// Thread-local data or BSS.
    Tls,
    /// Unwinding tables.
    EhFrame,
    /// Linking machinery (.dynamic, GOT, PLT, symbol/hash tables).
    Dynamic,
    /// Anything else (notes, debug info, ...).
    Other,
}

impl SectionKind {
    fn classify(name: &str, section: &SectionHeader, in_relro: bool) -> SectionKind {
        let flags = section.sh_flags as u32;
        if flags & SHF_TLS != 0 {
            SectionKind::Tls
        } else if name == ".eh_frame" || name == ".eh_frame_hdr" || name == ".gcc_except_table" {
            SectionKind::EhFrame
        } else if name == ".dynamic"
            || name == ".got"
            || name == ".got.plt"
            || name.starts_with(".plt")
            || name == ".dynsym"
            || name == ".dynstr"
            || name == ".hash"
            || name.starts_with(".gnu.hash")
            || name.starts_with(".gnu.version")
        {
            SectionKind::Dynamic
        } else if in_relro {
            SectionKind::Relro
        } else if flags & SHF_EXECINSTR != 0 {
            SectionKind::Code
        } else if flags & SHF_WRITE != 0 {
            SectionKind::Data
        } else if flags & SHF_ALLOC != 0 {
            SectionKind::Rodata
        } else {
            SectionKind::Other
        }
    }

    /// Whether a change in this kind of section is ignorable for
    /// patchability (rewritten by the loader anyway).
    pub fn ignorable(&self) -> bool {
        matches!(self, SectionKind::Relro | SectionKind::EhFrame | SectionKind::Dynamic | SectionKind::Other)
    }
}

/// Fingerprint of one defined symbol.
#[derive(Debug, Clone)]
pub struct SymbolHash {
    /// Symbol name.
    pub name: String,
    /// Virtual address (file-relative).
    pub value: u64,
    /// Size in bytes.
    pub size: u64,
    /// Classification of the containing section.
    pub section: SectionKind,
    /// xxh64 over the bytes backing the symbol (0 for BSS-like symbols).
    pub hash: u64,
    /// `STT_FUNC` or `STT_GNU_IFUNC`.
    pub function: bool,
}

/// Fingerprints of every defined symbol of one object file.
#[derive(Debug, Default)]
pub struct BinaryHash {
    symbols: HashMap<String, SymbolHash>,
}

/// How one symbol differs between two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present only in the new version.
    Added,
    /// Present only in the old version.
    Removed,
    /// Content or size differs.
    Changed,
}

/// One entry of a version diff.
#[derive(Debug, Clone)]
pub struct SymbolChange {
    pub name: String,
    pub kind: ChangeKind,
    pub section: SectionKind,
    pub function: bool,
    /// Address in the old version (for Removed/Changed).
    pub old_value: Option<u64>,
    /// Address in the new version (for Added/Changed).
    pub new_value: Option<u64>,
    /// Size in the old version.
    pub old_size: Option<u64>,
}

impl BinaryHash {
    /// Builds the fingerprint table from a file mapping.
    ///
    /// The symbol table of choice is `.symtab` (full view); stripped objects
    /// fall back to `.dynsym`.
    pub fn new(image: &ElfImage, seed: u64) -> BinaryHash {
        let sections = image.section_headers();

        // RELRO range for classification.
        let relro = image
            .program_headers()
            .iter()
            .find(|phdr| phdr.p_type == goblin::elf::program_header::PT_GNU_RELRO)
            .map(|phdr| (phdr.p_vaddr, phdr.p_vaddr + phdr.p_memsz));

        let mut symtab: Option<(&SectionHeader, &SectionHeader)> = None;
        let mut dynsym: Option<(&SectionHeader, &SectionHeader)> = None;
        for section in sections {
            match section.sh_type {
                SHT_SYMTAB => {
                    if let Some(strtab) = sections.get(section.sh_link as usize) {
                        symtab = Some((section, strtab));
                    }
                }
                goblin::elf::section_header::SHT_DYNSYM => {
                    if let Some(strtab) = sections.get(section.sh_link as usize) {
                        dynsym = Some((section, strtab));
                    }
                }
                _ => {}
            }
        }

        let mut symbols = HashMap::new();
        if let Some((table, strtab)) = symtab.or(dynsym) {
            let entry_size = core::mem::size_of::<Sym>();
            let count = table.sh_size as usize / entry_size;
            for index in 1..count {
                let offset = table.sh_offset as usize + index * entry_size;
                let sym = match image.bytes_at(offset, entry_size) {
                    Some(bytes) => unsafe {
                        core::ptr::read_unaligned(bytes.as_ptr() as *const Sym)
                    },
                    None => continue,
                };
                let stype = sym.st_info & 0xf;
                // Only named, defined functions and objects carry content.
                if sym.st_shndx == 0 || sym.st_shndx as usize >= sections.len() {
                    continue;
                }
                if stype != goblin::elf::sym::STT_FUNC
                    && stype != goblin::elf::sym::STT_OBJECT
                    && stype != goblin::elf::sym::STT_GNU_IFUNC
                    && stype != goblin::elf::sym::STT_TLS
                {
                    continue;
                }
                let name = match image.str_at(strtab.sh_offset as usize + sym.st_name as usize) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => continue,
                };

                let section = &sections[sym.st_shndx as usize];
                let section_name = image.section_name(section).unwrap_or("");
                let in_relro = relro
                    .map(|(start, end)| sym.st_value >= start && sym.st_value < end)
                    .unwrap_or(false);
                let kind = SectionKind::classify(section_name, section, in_relro);

                // Hash the bytes backing the symbol; NOBITS sections have no
                // file content, their fingerprint is the size alone.
                let hash = if section.sh_type == SHT_NOBITS || sym.st_size == 0 {
                    0
                } else {
                    let file_offset = section.sh_offset + (sym.st_value - section.sh_addr);
                    match image.bytes_at(file_offset as usize, sym.st_size as usize) {
                        Some(bytes) => xxh64(bytes, seed),
                        None => 0,
                    }
                };

                symbols.insert(
                    name.clone(),
                    SymbolHash {
                        name,
                        value: sym.st_value,
                        size: sym.st_size,
                        section: kind,
                        hash,
                        function: stype == goblin::elf::sym::STT_FUNC
                            || stype == goblin::elf::sym::STT_GNU_IFUNC,
                    },
                );
            }
        }
        debug!("fingerprinted {} symbols", symbols.len());
        BinaryHash { symbols }
    }

    /// Number of fingerprinted symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Fingerprint of a symbol by name.
    pub fn get(&self, name: &str) -> Option<&SymbolHash> {
        self.symbols.get(name)
    }

    /// Compares `self` (the *new* version) against `old`, returning every
    /// added, removed or changed symbol.
    pub fn diff(&self, old: &BinaryHash) -> Vec<SymbolChange> {
        let mut changes = Vec::new();
        for (name, new_sym) in &self.symbols {
            match old.symbols.get(name) {
                Some(old_sym) => {
                    if old_sym.hash != new_sym.hash || old_sym.size != new_sym.size {
                        changes.push(SymbolChange {
                            name: name.clone(),
                            kind: ChangeKind::Changed,
                            section: new_sym.section,
                            function: new_sym.function,
                            old_value: Some(old_sym.value),
                            new_value: Some(new_sym.value),
                            old_size: Some(old_sym.size),
                        });
                    }
                }
                None => changes.push(SymbolChange {
                    name: name.clone(),
                    kind: ChangeKind::Added,
                    section: new_sym.section,
                    function: new_sym.function,
                    old_value: None,
                    new_value: Some(new_sym.value),
                    old_size: None,
                }),
            }
        }
        for (name, old_sym) in &old.symbols {
            if !self.symbols.contains_key(name) {
                changes.push(SymbolChange {
                    name: name.clone(),
                    kind: ChangeKind::Removed,
                    section: old_sym.section,
                    function: old_sym.function,
                    old_value: Some(old_sym.value),
                    new_value: None,
                    old_size: Some(old_sym.size),
                });
            }
        }
        changes
    }
}

/// Whether a diff is free of disruptive changes: only code-section symbols
/// may change or disappear; data-layout changes (outside RELRO, unwinding
/// tables and linking machinery, which the loader rewrites anyway) reject
/// the update.
pub fn patchable(diff: &[SymbolChange]) -> bool {
    for change in diff {
        if change.section.ignorable() {
            continue;
        }
        match change.kind {
            // New symbols of any kind are fine: nothing references them yet.
            ChangeKind::Added => {}
            ChangeKind::Changed | ChangeKind::Removed => {
                if !matches!(change.section, SectionKind::Code) {
                    debug!(
                        "non-trivial change of {} in {:?} section",
                        change.name, change.section
                    );
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(name: &str, section: SectionKind, hash: u64, size: u64) -> SymbolHash {
        SymbolHash {
            name: name.to_string(),
            value: 0x1000,
            size,
            section,
            hash,
            function: section == SectionKind::Code,
        }
    }

    fn table(symbols: Vec<SymbolHash>) -> BinaryHash {
        BinaryHash {
            symbols: symbols.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    #[test]
    fn identical_tables_diff_empty() {
        let old = table(vec![symbol("answer", SectionKind::Code, 1, 16)]);
        let new = table(vec![symbol("answer", SectionKind::Code, 1, 16)]);
        assert!(new.diff(&old).is_empty());
    }

    #[test]
    fn changed_code_symbol_is_patchable() {
        let old = table(vec![symbol("answer", SectionKind::Code, 1, 16)]);
        let new = table(vec![symbol("answer", SectionKind::Code, 2, 16)]);
        let diff = new.diff(&old);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].kind, ChangeKind::Changed);
        assert!(patchable(&diff));
    }

    #[test]
    fn changed_data_symbol_rejects_update() {
        let old = table(vec![symbol("state", SectionKind::Data, 1, 8)]);
        let new = table(vec![symbol("state", SectionKind::Data, 1, 16)]);
        let diff = new.diff(&old);
        assert!(!patchable(&diff));
    }

    #[test]
    fn relro_and_dynamic_changes_are_ignored() {
        let old = table(vec![
            symbol("vtable", SectionKind::Relro, 1, 32),
            symbol("_GLOBAL_OFFSET_TABLE_", SectionKind::Dynamic, 5, 64),
        ]);
        let new = table(vec![
            symbol("vtable", SectionKind::Relro, 2, 32),
            symbol("_GLOBAL_OFFSET_TABLE_", SectionKind::Dynamic, 6, 64),
        ]);
        assert!(patchable(&new.diff(&old)));
    }

    #[test]
    fn added_symbols_are_patchable() {
        let old = table(vec![symbol("answer", SectionKind::Code, 1, 16)]);
        let new = table(vec![
            symbol("answer", SectionKind::Code, 1, 16),
            symbol("extra", SectionKind::Data, 3, 8),
        ]);
        assert!(patchable(&new.diff(&old)));
    }

    #[test]
    fn removed_data_symbol_rejects_update() {
        let old = table(vec![symbol("state", SectionKind::Data, 1, 8)]);
        let new = table(vec![]);
        assert!(!patchable(&new.diff(&old)));
    }
}
