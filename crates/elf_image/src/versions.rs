//! Symbol version tables (`.gnu.version_r` / `.gnu.version_d`).

use crate::defs::{Verdaux, Verdef, Vernaux, Verneed, VER_FLG_BASE, VER_FLG_WEAK, VER_NDX_GLOBAL};
use crate::{DynamicInfo, SymbolTable};

/// One known symbol version of an object: either a requirement against a
/// needed file or a definition provided by the object itself.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    /// The version index used by the `versym` table.
    pub index: u16,
    /// Version name, e.g. `GLIBC_2.2.5`.
    pub name: String,
    /// SysV hash of the version name.
    pub hash: u32,
    /// File the requirement refers to (`None` for definitions).
    pub file: Option<String>,
    /// Weak version requirement.
    pub weak: bool,
}

/// All version requirements and definitions of one object, decoded once at
/// load time so later lookups need no pointer walking.
#[derive(Debug, Default, Clone)]
pub struct VersionTable {
    entries: Vec<VersionEntry>,
}

impl VersionTable {
    pub fn new(dynamic: &DynamicInfo, symbols: &SymbolTable) -> VersionTable {
        let mut entries = Vec::new();

        if dynamic.verneed != 0 {
            let mut need_ptr = dynamic.verneed;
            for _ in 0..dynamic.verneed_num {
                let need = unsafe { &*(need_ptr as *const Verneed) };
                let file = symbols.string(need.vn_file as usize).map(|s| s.to_string());
                let mut aux_ptr = need_ptr + need.vn_aux as usize;
                for _ in 0..need.vn_cnt {
                    let aux = unsafe { &*(aux_ptr as *const Vernaux) };
                    if let Some(name) = symbols.string(aux.vna_name as usize) {
                        entries.push(VersionEntry {
                            index: aux.vna_other & 0x7fff,
                            name: name.to_string(),
                            hash: aux.vna_hash,
                            file: file.clone(),
                            weak: aux.vna_flags & VER_FLG_WEAK != 0,
                        });
                    }
                    if aux.vna_next == 0 {
                        break;
                    }
                    aux_ptr += aux.vna_next as usize;
                }
                if need.vn_next == 0 {
                    break;
                }
                need_ptr += need.vn_next as usize;
            }
        }

        if dynamic.verdef != 0 {
            let mut def_ptr = dynamic.verdef;
            for _ in 0..dynamic.verdef_num {
                let def = unsafe { &*(def_ptr as *const Verdef) };
                if def.vd_flags & VER_FLG_BASE == 0 && def.vd_cnt > 0 {
                    let aux = unsafe { &*((def_ptr + def.vd_aux as usize) as *const Verdaux) };
                    if let Some(name) = symbols.string(aux.vda_name as usize) {
                        entries.push(VersionEntry {
                            index: def.vd_ndx & 0x7fff,
                            name: name.to_string(),
                            hash: def.vd_hash,
                            file: None,
                            weak: false,
                        });
                    }
                }
                if def.vd_next == 0 {
                    break;
                }
                def_ptr += def.vd_next as usize;
            }
        }

        VersionTable { entries }
    }

    /// The entry registered for the given `versym` index.
    pub fn by_index(&self, index: u16) -> Option<&VersionEntry> {
        if index <= VER_NDX_GLOBAL {
            return None;
        }
        self.entries.iter().find(|entry| entry.index == index)
    }

    /// The version index this object uses for the given version name hash
    /// and name, or `VER_NDX_GLOBAL` when the version is unknown here.
    pub fn index_of(&self, name: &str, hash: u32) -> u16 {
        self.entries
            .iter()
            .find(|entry| entry.hash == hash && entry.name == name)
            .map(|entry| entry.index)
            .unwrap_or(VER_NDX_GLOBAL)
    }

    /// All decoded entries.
    pub fn entries(&self) -> &[VersionEntry] {
        &self.entries
    }
}
