//! One loaded version of an object file.

use std::sync::{Arc, Weak};

use binary_hash::BinaryHash;
use elf_image::{DynamicInfo, ElfImage, SymbolTable, VersionTable};
use goblin::elf::sym::{STB_LOCAL, STB_WEAK};
use log::trace;
use memory_segment::MemorySegment;
use relocate_x86_64::Relocation;
use spin::Mutex;

use crate::identity::ObjectIdentity;
use crate::symbol::{SymbolDefinition, SymbolVersion, VersionedSymbol};

/// A strong reference to a loaded object version.
pub type ObjectRef = Arc<Object>;

/// How the object entered the address space, by ELF type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// `ET_DYN`, or `ET_EXEC` with a `PT_DYNAMIC` segment.
    Dynamic { position_independent: bool },
    /// `ET_EXEC` without dynamic linking information.
    Executable,
    /// `ET_REL` (static-link mode).
    Relocatable,
}

/// Preparation state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Segments are mapped; relocations not applied yet.
    Mapped,
    /// Relocation in progress (guards dependency cycles).
    Preparing,
    /// Relocated and published.
    Prepared,
}

/// Version-specific facts about the file bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectData {
    /// Address of the file mapping.
    pub addr: usize,
    /// Size of the file in bytes.
    pub size: usize,
    /// Modification time (seconds, nanoseconds).
    pub mtime: (i64, i64),
    /// File descriptor of the open file (-1 when copied to memory).
    pub fd: i32,
    /// Seeded xxh64 over the file contents (0 when dedup is off).
    pub hash: u64,
}

/// One loaded instance of an ELF file at a given version.
///
/// Immutable once published except for the interior-mutable segment list,
/// dependency edges and the relocation provenance log.
pub struct Object {
    /// The identity this version belongs to.
    pub identity: Weak<ObjectIdentity>,
    /// File bytes backing this version.
    pub data: ObjectData,
    /// Decoded view over `data`.
    pub elf: ElfImage,
    /// Object flavor by ELF type.
    pub kind: ObjectKind,
    /// Runtime load base.
    pub base: usize,
    /// File-relative virtual address of the global offset table (0 = none).
    pub global_offset_table: usize,
    /// Decoded dynamic section (dynamic objects only).
    pub dynamic_info: Option<DynamicInfo>,
    /// Dynamic symbol table view (dynamic objects only).
    pub symbols: Option<SymbolTable>,
    /// Symbol version requirements/definitions.
    pub version_table: Option<VersionTable>,
    /// GNU build-id, if the file carries one.
    pub build_id: Option<String>,
    /// Per-symbol content fingerprints (updatable identities only).
    pub binary_hash: Option<BinaryHash>,
    /// The next older version of the same file.
    pub file_previous: Option<ObjectRef>,

    /// Mapped segments of this version.
    pub segments: Mutex<Vec<MemorySegment>>,
    /// Identities this version depends on (`DT_NEEDED` order).
    pub dependencies: Mutex<Vec<Arc<ObjectIdentity>>>,
    /// Provenance log: every externally-resolved relocation together with
    /// the definition it was bound to, replayed by the update cascade.
    pub relocations: Mutex<Vec<(Relocation, SymbolDefinition)>>,
    /// Preparation state.
    pub status: Mutex<ObjectStatus>,
}

impl Object {
    /// The owning identity (`None` only during teardown).
    pub fn identity(&self) -> Option<Arc<ObjectIdentity>> {
        self.identity.upgrade()
    }

    /// Whether this is the newest version of its file.
    pub fn is_latest_version(self: &Arc<Self>) -> bool {
        match self.identity() {
            Some(identity) => match identity.current() {
                Some(current) => Arc::ptr_eq(&current, self),
                None => false,
            },
            None => false,
        }
    }

    /// Position of this version in the chain (0 = first ever loaded).
    pub fn version(&self) -> usize {
        let mut count = 0;
        let mut previous = self.file_previous.clone();
        while let Some(object) = previous {
            count += 1;
            previous = object.file_previous.clone();
        }
        count
    }

    /// Page-aligned virtual range covered by this version's segments.
    pub fn memory_range(&self) -> Option<(usize, usize)> {
        let segments = self.segments.lock();
        let first = segments.first()?;
        let last = segments.last()?;
        Some((first.target.page_start(), last.target.page_end()))
    }

    /// Whether `addr` falls into one of this version's segments.
    pub fn contains(&self, addr: usize) -> bool {
        self.segments
            .lock()
            .iter()
            .any(|segment| segment.target.contains(addr))
    }

    /// Runtime address of the `_DYNAMIC` array (0 for non-dynamic objects).
    pub fn dynamic_address(&self) -> usize {
        match &self.dynamic_info {
            Some(info) => match self.kind {
                ObjectKind::Dynamic {
                    position_independent: false,
                } => info.dynamic_vaddr,
                _ => self.base + info.dynamic_vaddr,
            },
            None => 0,
        }
    }

    /// Translates a live address inside this version to its compose-buffer
    /// alias, so the caller can write without flipping page protections.
    pub fn compose_pointer(&self, addr: usize) -> Option<usize> {
        let mut segments = self.segments.lock();
        for segment in segments.iter_mut() {
            if segment.target.contains(addr) {
                return segment.compose_pointer(addr);
            }
        }
        None
    }

    /// Whether `addr` lies in a writable (data) segment of this version.
    pub fn in_writable_segment(&self, addr: usize) -> bool {
        self.segments
            .lock()
            .iter()
            .any(|segment| segment.target.contains(addr) && segment.target.writable())
    }

    /// Maps all segments.
    pub fn map(&self) -> Result<(), &'static str> {
        for segment in self.segments.lock().iter_mut() {
            segment.map()?;
        }
        Ok(())
    }

    /// Publishes all segments with their declared protections.
    pub fn finalize(&self) -> Result<(), &'static str> {
        for segment in self.segments.lock().iter_mut() {
            segment.finalize()?;
        }
        Ok(())
    }

    /// Turns the executable segments `PROT_NONE` (retired version).
    pub fn disable(&self) -> Result<(), &'static str> {
        for segment in self.segments.lock().iter_mut() {
            if segment.target.executable() {
                segment.disable()?;
            }
        }
        Ok(())
    }

    /// Re-enables previously disabled executable segments.
    pub fn enable(&self) -> Result<(), &'static str> {
        for segment in self.segments.lock().iter_mut() {
            if segment.target.executable() {
                segment.enable()?;
            }
        }
        Ok(())
    }

    /// Unmaps all segments.
    pub fn unmap(&self) {
        for segment in self.segments.lock().iter_mut() {
            segment.unmap();
        }
    }

    /// The version index this object uses for the given constraint, as a
    /// predicate over `versym` entries.
    fn version_predicate<'a>(&'a self, version: &'a SymbolVersion) -> impl Fn(u16) -> bool + 'a {
        move |index: u16| match (&self.version_table, &version.name) {
            // Unversioned request or unversioned object: anything goes.
            (None, _) | (_, None) => true,
            (Some(table), Some(_)) => match table.by_index(index) {
                Some(entry) => entry.hash == version.hash
                    && version.name.as_deref() == Some(entry.name.as_str()),
                // An index the object does not define (base/global).
                None => true,
            },
        }
    }

    /// The version constraint attached to the symbol at `index` here.
    pub fn version_of(&self, index: usize) -> SymbolVersion {
        let versym = match &self.symbols {
            Some(symbols) => symbols.version_index(index),
            None => return SymbolVersion::any(),
        };
        match &self.version_table {
            Some(table) => match table.by_index(versym) {
                Some(entry) => match &entry.file {
                    Some(file) => SymbolVersion::named_in(&entry.name, file, entry.weak),
                    None => SymbolVersion {
                        name: Some(entry.name.clone()),
                        file: None,
                        hash: entry.hash,
                        weak: entry.weak,
                        valid: true,
                    },
                },
                None => SymbolVersion::any(),
            },
            None => SymbolVersion::any(),
        }
    }

    /// Finds an externally visible definition of the requested symbol in
    /// this version.
    pub fn resolve_symbol(
        self: &Arc<Self>,
        name: &str,
        hash: u32,
        gnu_hash: u32,
        version: &SymbolVersion,
    ) -> Option<SymbolDefinition> {
        let symbols = self.symbols.as_ref()?;
        let index = symbols.index_of(name, hash, gnu_hash, self.version_predicate(version))?;
        if !symbols.exportable(index) {
            return None;
        }
        let sym = symbols.at(index)?;
        Some(SymbolDefinition {
            object: self.clone(),
            index,
            value: sym.st_value,
            size: sym.st_size,
            bind: sym.st_info >> 4,
            sym_type: sym.st_info & 0xf,
            symbol: VersionedSymbol {
                name: name.to_string(),
                hash,
                gnu_hash,
                version: self.version_of(index),
            },
        })
    }

    /// Finds the definition covering the given runtime address.
    pub fn resolve_address(self: &Arc<Self>, addr: usize) -> Option<SymbolDefinition> {
        if addr < self.base {
            return None;
        }
        let symbols = self.symbols.as_ref()?;
        let index = symbols.find_by_offset((addr - self.base) as u64)?;
        let sym = symbols.at(index)?;
        let name = symbols.name(index)?.to_string();
        Some(SymbolDefinition {
            object: self.clone(),
            index,
            value: sym.st_value,
            size: sym.st_size,
            bind: sym.st_info >> 4,
            sym_type: sym.st_info & 0xf,
            symbol: VersionedSymbol::new(&name, self.version_of(index)),
        })
    }

    /// Hashed lookup used by the resolution scope walk.
    ///
    /// A strong match is stored in `result` and ends the walk (`true`); a
    /// weak match is remembered in `result` but the walk continues. Weak
    /// handling is gated by `dynamic_weak`: without it every match counts as
    /// strong, as the traditional resolver behaves.
    pub fn has_symbol(
        self: &Arc<Self>,
        name: &str,
        hash: u32,
        gnu_hash: u32,
        version: &SymbolVersion,
        dynamic_weak: bool,
        result: &mut Option<SymbolDefinition>,
    ) -> bool {
        if let Some(definition) = self.resolve_symbol(name, hash, gnu_hash, version) {
            debug_assert!(definition.bind != STB_LOCAL);
            let strong = definition.bind != STB_WEAK || !dynamic_weak;
            trace!(
                "found {} ({}) in {:?}",
                name,
                if strong { "strong" } else { "weak" },
                self.identity().map(|identity| identity.name())
            );
            if strong || result.is_none() {
                *result = Some(definition);
                return strong;
            }
        }
        false
    }

    /// Records an externally-resolved relocation in the provenance log,
    /// replacing a previous record for the same site.
    pub fn record_relocation(&self, relocation: Relocation, definition: SymbolDefinition) {
        let mut log = self.relocations.lock();
        for entry in log.iter_mut() {
            if entry.0.offset == relocation.offset && entry.0.in_plt == relocation.in_plt {
                *entry = (relocation, definition);
                return;
            }
        }
        log.push((relocation, definition));
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        // Only dropped when no version chain references this object any
        // more (failed loads, torn-down namespaces).
        self.unmap();
        let premapped = self
            .identity()
            .map(|identity| identity.flag(crate::ObjectFlags::PREMAPPED))
            .unwrap_or(false);
        if self.data.addr != 0 && !premapped {
            unsafe {
                libc::munmap(self.data.addr as *mut libc::c_void, self.data.size);
            }
        }
        if self.data.fd >= 0 {
            unsafe {
                libc::close(self.data.fd);
            }
        }
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("Object");
        if let Some(identity) = self.identity() {
            debug.field("file", &identity.name());
        }
        debug
            .field("version", &self.version())
            .field("base", &format_args!("{:#x}", self.base))
            .finish_non_exhaustive()
    }
}
