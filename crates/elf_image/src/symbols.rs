//! Dynamic symbol table access with SysV and GNU hash lookup.

use goblin::elf::sym::STB_LOCAL;
use goblin::elf64::sym::Sym;

/// `STV_DEFAULT` visibility in the low bits of `st_other`.
const VISIBILITY_DEFAULT: u8 = 0;

use crate::defs::{VERSYM_HIDDEN, VER_NDX_GLOBAL, VER_NDX_LOCAL};
use crate::DynamicInfo;

/// Classic SysV ELF hash of a symbol name.
pub fn elf_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in name.bytes() {
        hash = (hash << 4).wrapping_add(byte as u32);
        let high = hash & 0xf000_0000;
        if high != 0 {
            hash ^= high >> 24;
        }
        hash &= !high;
    }
    hash
}

/// GNU hash of a symbol name.
pub fn gnu_hash(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Raw layout of the SysV hash section: two counters followed by the bucket
/// and chain arrays.
struct SysvHash {
    nbucket: usize,
    buckets: *const u32,
    chains: *const u32,
    nchain: usize,
}

/// Raw layout of the GNU hash section.
struct GnuHash {
    nbuckets: usize,
    symoffset: usize,
    bloom_size: usize,
    bloom_shift: u32,
    bloom: *const u64,
    buckets: *const u32,
    chains: *const u32,
}

/// A view over an object's dynamic symbol table.
///
/// The table is resolved once from the object's [`DynamicInfo`]; lookups use
/// the GNU hash table when available and fall back to the SysV table.
pub struct SymbolTable {
    syms: *const Sym,
    count: usize,
    strtab: usize,
    strsz: usize,
    versym: *const u16,
    sysv: Option<SysvHash>,
    gnu: Option<GnuHash>,
}

// The table only reads from the (immutable) file mapping.
unsafe impl Send for SymbolTable {}
unsafe impl Sync for SymbolTable {}

impl SymbolTable {
    /// Builds the table from a parsed dynamic section.
    pub fn new(dynamic: &DynamicInfo) -> SymbolTable {
        let sysv = if dynamic.hash != 0 {
            let words = dynamic.hash as *const u32;
            unsafe {
                let nbucket = *words as usize;
                let nchain = *words.add(1) as usize;
                Some(SysvHash {
                    nbucket,
                    buckets: words.add(2),
                    chains: words.add(2 + nbucket),
                    nchain,
                })
            }
        } else {
            None
        };

        let gnu = if dynamic.gnu_hash != 0 {
            let words = dynamic.gnu_hash as *const u32;
            unsafe {
                let nbuckets = *words as usize;
                let symoffset = *words.add(1) as usize;
                let bloom_size = *words.add(2) as usize;
                let bloom_shift = *words.add(3);
                let bloom = words.add(4) as *const u64;
                let buckets = bloom.add(bloom_size) as *const u32;
                Some(GnuHash {
                    nbuckets,
                    symoffset,
                    bloom_size,
                    bloom_shift,
                    bloom,
                    buckets,
                    chains: buckets.add(nbuckets),
                })
            }
        } else {
            None
        };

        // The symbol count is explicit in the SysV chain array; with only a
        // GNU hash table it is the end of the longest chain.
        let count = if let Some(ref sysv) = sysv {
            sysv.nchain
        } else if let Some(ref gnu) = gnu {
            let mut max_index = 0;
            unsafe {
                for bucket in 0..gnu.nbuckets {
                    let start = *gnu.buckets.add(bucket) as usize;
                    if start < gnu.symoffset {
                        continue;
                    }
                    let mut index = start;
                    loop {
                        let entry = *gnu.chains.add(index - gnu.symoffset);
                        if index > max_index {
                            max_index = index;
                        }
                        if entry & 1 != 0 {
                            break;
                        }
                        index += 1;
                    }
                }
            }
            if max_index == 0 {
                0
            } else {
                max_index + 1
            }
        } else {
            0
        };

        SymbolTable {
            syms: dynamic.symtab as *const Sym,
            count,
            strtab: dynamic.strtab,
            strsz: dynamic.strsz,
            versym: dynamic.versym as *const u16,
            sysv,
            gnu,
        }
    }

    /// Number of entries in the table.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The symbol at `index`, if in bounds.
    pub fn at(&self, index: usize) -> Option<&Sym> {
        if self.syms.is_null() || index >= self.count {
            None
        } else {
            Some(unsafe { &*self.syms.add(index) })
        }
    }

    /// Name of the symbol at `index`.
    pub fn name(&self, index: usize) -> Option<&str> {
        let sym = self.at(index)?;
        self.string(sym.st_name as usize)
    }

    /// A string from the dynamic string table.
    pub fn string(&self, offset: usize) -> Option<&str> {
        if self.strtab == 0 || offset >= self.strsz {
            return None;
        }
        let start = (self.strtab + offset) as *const u8;
        let max = self.strsz - offset;
        let mut len = 0;
        unsafe {
            while len < max && *start.add(len) != 0 {
                len += 1;
            }
            core::str::from_utf8(core::slice::from_raw_parts(start, len)).ok()
        }
    }

    /// The version index of the symbol at `index` (without the hidden bit),
    /// or `VER_NDX_GLOBAL` if the object carries no `versym` table.
    pub fn version_index(&self, index: usize) -> u16 {
        if self.versym.is_null() || index >= self.count {
            VER_NDX_GLOBAL
        } else {
            unsafe { *self.versym.add(index) & !VERSYM_HIDDEN }
        }
    }

    /// Looks up a defined symbol by name, precomputed hashes and a version
    /// predicate. Returns the symbol table index.
    ///
    /// `version_matches` receives the candidate's version index; passing
    /// `|_| true` performs an unversioned lookup.
    pub fn index_of<F: Fn(u16) -> bool>(
        &self,
        name: &str,
        hash: u32,
        gnu_hash_value: u32,
        version_matches: F,
    ) -> Option<usize> {
        if let Some(ref gnu) = self.gnu {
            return self.gnu_lookup(gnu, name, gnu_hash_value, &version_matches);
        }
        if let Some(ref sysv) = self.sysv {
            return self.sysv_lookup(sysv, name, hash, &version_matches);
        }
        None
    }

    fn accept<F: Fn(u16) -> bool>(&self, index: usize, name: &str, version_matches: &F) -> bool {
        match self.at(index) {
            Some(sym) => {
                sym.st_shndx != 0 // defined here
                    && self.name(index) == Some(name)
                    && {
                        let vndx = self.version_index(index);
                        vndx == VER_NDX_LOCAL || vndx == VER_NDX_GLOBAL || version_matches(vndx)
                    }
            }
            None => false,
        }
    }

    fn gnu_lookup<F: Fn(u16) -> bool>(
        &self,
        gnu: &GnuHash,
        name: &str,
        hash: u32,
        version_matches: &F,
    ) -> Option<usize> {
        if gnu.nbuckets == 0 || gnu.bloom_size == 0 {
            return None;
        }
        unsafe {
            let word = *gnu
                .bloom
                .add((hash as usize / 64) % gnu.bloom_size);
            let mask: u64 =
                (1u64 << (hash as u64 % 64)) | (1u64 << ((hash >> gnu.bloom_shift) as u64 % 64));
            if word & mask != mask {
                return None;
            }

            let mut index = *gnu.buckets.add(hash as usize % gnu.nbuckets) as usize;
            if index < gnu.symoffset {
                return None;
            }
            loop {
                let entry = *gnu.chains.add(index - gnu.symoffset);
                if (entry | 1) == (hash | 1) && self.accept(index, name, version_matches) {
                    return Some(index);
                }
                if entry & 1 != 0 {
                    return None;
                }
                index += 1;
            }
        }
    }

    fn sysv_lookup<F: Fn(u16) -> bool>(
        &self,
        sysv: &SysvHash,
        name: &str,
        hash: u32,
        version_matches: &F,
    ) -> Option<usize> {
        if sysv.nbucket == 0 {
            return None;
        }
        unsafe {
            let mut index = *sysv.buckets.add(hash as usize % sysv.nbucket) as usize;
            while index != 0 {
                if self.accept(index, name, version_matches) {
                    return Some(index);
                }
                if index >= sysv.nchain {
                    return None;
                }
                index = *sysv.chains.add(index) as usize;
            }
        }
        None
    }

    /// Finds the symbol whose value range covers `offset` (an address
    /// relative to the object's base), preferring non-local definitions.
    pub fn find_by_offset(&self, offset: u64) -> Option<usize> {
        let mut best: Option<usize> = None;
        for index in 1..self.count {
            let sym = self.at(index)?;
            if sym.st_shndx == 0 {
                continue;
            }
            if offset >= sym.st_value && offset < sym.st_value + sym.st_size.max(1) {
                let bind = sym.st_info >> 4;
                if bind != STB_LOCAL {
                    return Some(index);
                }
                best.get_or_insert(index);
            }
        }
        best
    }

    /// Whether the symbol at `index` is exportable: defined, non-local and
    /// with default visibility.
    pub fn exportable(&self, index: usize) -> bool {
        match self.at(index) {
            Some(sym) => {
                sym.st_shndx != 0
                    && (sym.st_info >> 4) != STB_LOCAL
                    && (sym.st_other & 0x3) == VISIBILITY_DEFAULT
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_hash_known_values() {
        // Reference values from the System V ABI hash function.
        assert_eq!(elf_hash(""), 0);
        assert_eq!(elf_hash("printf"), 0x077905a6);
        assert_eq!(elf_hash("exit"), 0x0006cf04);
    }

    #[test]
    fn gnu_hash_known_values() {
        assert_eq!(gnu_hash(""), 5381);
        assert_eq!(gnu_hash("a"), 0x0002b606);
        assert_eq!(gnu_hash("printf"), 0x156b2bb8);
    }

    #[test]
    fn empty_table_finds_nothing() {
        let table = SymbolTable::new(&crate::DynamicInfo::default());
        assert_eq!(table.count(), 0);
        assert!(table
            .index_of("answer", elf_hash("answer"), gnu_hash("answer"), |_| true)
            .is_none());
    }
}
