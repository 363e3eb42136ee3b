//! Versioned symbols: lookup requests and resolutions.

use elf_image::{elf_hash, gnu_hash};
use relocate_x86_64::SymbolPlacement;

use crate::object::ObjectRef;

/// A symbol version constraint.
#[derive(Debug, Clone)]
pub struct SymbolVersion {
    /// Version name, e.g. `LIBX_1.0` (`None` matches the base version).
    pub name: Option<String>,
    /// File the requirement refers to, if known.
    pub file: Option<String>,
    /// SysV hash of the version name.
    pub hash: u32,
    /// Weak version requirement.
    pub weak: bool,
    /// An invalid version matches only local/unversioned definitions.
    pub valid: bool,
}

impl SymbolVersion {
    /// Matches any version (unversioned lookup).
    pub fn any() -> SymbolVersion {
        SymbolVersion {
            name: None,
            file: None,
            hash: 0,
            weak: false,
            valid: true,
        }
    }

    /// Requires the given version name.
    pub fn named(name: &str) -> SymbolVersion {
        SymbolVersion {
            hash: elf_hash(name),
            name: Some(name.to_string()),
            file: None,
            weak: false,
            valid: true,
        }
    }

    /// Requires the given version name from the given file.
    pub fn named_in(name: &str, file: &str, weak: bool) -> SymbolVersion {
        SymbolVersion {
            hash: elf_hash(name),
            name: Some(name.to_string()),
            file: Some(file.to_string()),
            weak,
            valid: true,
        }
    }

    /// Whether the two constraints denote the same version.
    pub fn matches(&self, other: &SymbolVersion) -> bool {
        if !self.valid || !other.valid {
            return false;
        }
        match (&self.name, &other.name) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => {
                self.hash == other.hash
                    && a == b
                    && match (&self.file, &other.file) {
                        (Some(fa), Some(fb)) => fa == fb,
                        _ => true,
                    }
            }
        }
    }
}

/// A symbol lookup request with precomputed hashes.
#[derive(Debug, Clone)]
pub struct VersionedSymbol {
    pub name: String,
    /// SysV hash of the name.
    pub hash: u32,
    /// GNU hash of the name.
    pub gnu_hash: u32,
    pub version: SymbolVersion,
}

impl VersionedSymbol {
    pub fn new(name: &str, version: SymbolVersion) -> VersionedSymbol {
        VersionedSymbol {
            hash: elf_hash(name),
            gnu_hash: gnu_hash(name),
            name: name.to_string(),
            version,
        }
    }

    /// Unversioned request.
    pub fn unversioned(name: &str) -> VersionedSymbol {
        VersionedSymbol::new(name, SymbolVersion::any())
    }
}

impl PartialEq for VersionedSymbol {
    fn eq(&self, other: &Self) -> bool {
        self.gnu_hash == other.gnu_hash
            && self.name == other.name
            && (self.version.matches(&other.version)
                || (!self.version.valid && !other.version.valid))
    }
}
impl Eq for VersionedSymbol {}

/// A successfully resolved symbol: the definition within a concrete object
/// version.
#[derive(Debug, Clone)]
pub struct SymbolDefinition {
    /// The object version providing the definition.
    pub object: ObjectRef,
    /// Index within the object's dynamic symbol table.
    pub index: usize,
    /// `st_value` of the definition.
    pub value: u64,
    /// `st_size` of the definition.
    pub size: u64,
    /// `STB_*` binding.
    pub bind: u8,
    /// `STT_*` type.
    pub sym_type: u8,
    /// Name/version of the definition.
    pub symbol: VersionedSymbol,
}

impl SymbolDefinition {
    /// Runtime address of the definition.
    pub fn pointer(&self) -> usize {
        self.object.base.wrapping_add(self.value as usize)
    }

    /// Whether the definition binds weakly.
    pub fn weak(&self) -> bool {
        self.bind == goblin::elf::sym::STB_WEAK
    }

    /// Placement data for the relocation formulas.
    pub fn placement(&self) -> SymbolPlacement {
        let (tls_module_id, tls_offset) = match self.object.identity() {
            Some(identity) => (identity.tls_module_id(), identity.tls_offset()),
            None => (0, 0),
        };
        SymbolPlacement {
            value: self.value,
            size: self.size,
            base: self.object.base as u64,
            tls_module_id,
            tls_offset,
        }
    }
}
