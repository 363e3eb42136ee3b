//! Static-link mode: loading `ET_REL` objects.
//!
//! Relocatable files carry no segments; the loader allocates their
//! `SHF_ALLOC` sections itself (grouped by protection class), applies the
//! section-relative `.rela.*` tables against `.symtab`, and synthesizes a
//! small GOT for the GOT-mediated relocation types. Such objects do not
//! export dynamic symbols; they are self-contained programs.

use std::collections::HashMap;

use goblin::elf::reloc::*;
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_TLS, SHF_WRITE, SHT_NOBITS, SHT_RELA, SHT_SYMTAB};
use goblin::elf::sym::STB_WEAK;
use goblin::elf64::reloc::Rela;
use goblin::elf64::sym::Sym;
use log::{debug, error, warn};
use memory_segment::{MemorySegment, SegmentSource};
use object_metadata::{IdentityRef, ObjectRef};
use page_util::PAGE_SIZE;

use crate::{Loader, ResolveMode};

/// Section index of absolute symbols.
const SHN_ABS: u16 = 0xfff1;

/// Where one allocated section ended up, relative to the object base.
#[derive(Debug, Clone, Copy)]
struct Placement {
    offset: usize,
    /// Protection class: 0 = text, 1 = rodata, 2 = data/bss.
    class: u8,
}

/// Span of the image a relocatable object needs: `(got_offset, total)`.
/// Called before the object exists to reserve its base address.
pub fn span_of(elf: &elf_image::ElfImage) -> (usize, usize) {
    let (_, got_offset, span) = layout_sections(elf);
    (got_offset, span)
}

/// Deterministic section layout; recomputed instead of stored so the
/// object metadata stays format-agnostic.
fn layout_sections(elf: &elf_image::ElfImage) -> (HashMap<usize, Placement>, usize, usize) {
    let sections = elf.section_headers();
    let mut placements = HashMap::new();
    let mut cursor = 0usize;

    for class in 0u8..3 {
        cursor = page_util::align_up(cursor);
        for (shndx, section) in sections.iter().enumerate() {
            let flags = section.sh_flags as u32;
            if flags & SHF_ALLOC == 0 || flags & SHF_TLS != 0 {
                continue;
            }
            let section_class = if flags & SHF_EXECINSTR != 0 {
                0
            } else if flags & SHF_WRITE != 0 {
                2
            } else {
                1
            };
            if section_class != class {
                continue;
            }
            let align = (section.sh_addralign as usize).max(1);
            cursor = page_util::align_up_to(cursor, align);
            placements.insert(
                shndx,
                Placement {
                    offset: cursor,
                    class,
                },
            );
            cursor += section.sh_size as usize;
        }
    }

    // Synthetic GOT page at the end of the image.
    let got_offset = page_util::align_up(cursor);
    (placements, got_offset, got_offset + PAGE_SIZE)
}

/// Allocates the sections of a relocatable object into fresh segments and
/// registers its TLS sections.
pub fn preload(loader: &Loader, identity: &IdentityRef, object: &ObjectRef) -> bool {
    let sections = object.elf.section_headers();
    if sections.is_empty() {
        error!("{:?} carries no sections", identity);
        return false;
    }
    let (placements, got_offset, _) = layout_sections(&object.elf);
    let base = object.base;

    let mut segments = Vec::new();
    for class in 0u8..3 {
        let mut start: Option<usize> = None;
        let mut end = 0usize;
        for (shndx, placement) in &placements {
            if placement.class != class {
                continue;
            }
            let section = &sections[*shndx];
            let section_end = placement.offset + section.sh_size as usize;
            start = Some(start.map_or(placement.offset, |s: usize| s.min(placement.offset)));
            if section_end > end {
                end = section_end;
            }
        }
        let start = match start {
            Some(start) => start,
            None => continue,
        };
        let protection = match class {
            0 => libc::PROT_READ | libc::PROT_EXEC,
            1 => libc::PROT_READ,
            _ => libc::PROT_READ | libc::PROT_WRITE,
        };
        segments.push(MemorySegment::new(
            SegmentSource {
                file_addr: 0,
                offset: 0,
                size: 0,
            },
            base,
            start,
            end - start,
            protection,
            false,
        ));
    }
    // The GOT page.
    segments.push(MemorySegment::new(
        SegmentSource {
            file_addr: 0,
            offset: 0,
            size: 0,
        },
        base,
        got_offset,
        PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        false,
    ));
    *object.segments.lock() = segments;

    // TLS sections form the module image.
    let mut tls_size = 0usize;
    let mut tls_image_size = 0usize;
    let mut tls_align = 1usize;
    for section in sections {
        let flags = section.sh_flags as u32;
        if flags & SHF_TLS != 0 && flags & SHF_ALLOC != 0 {
            tls_align = tls_align.max(section.sh_addralign as usize);
            tls_size += section.sh_size as usize;
            if section.sh_type != SHT_NOBITS {
                tls_image_size += section.sh_size as usize;
            }
        }
    }
    if tls_size > 0 && identity.tls_module_id() == 0 {
        // The image points into the file mapping (`.tdata` content).
        let image = sections
            .iter()
            .find(|section| {
                let flags = section.sh_flags as u32;
                flags & SHF_TLS != 0 && section.sh_type != SHT_NOBITS
            })
            .map(|section| object.data.addr + section.sh_offset as usize)
            .unwrap_or(0);
        let (module_id, offset) = loader.tls.add_module(
            std::sync::Arc::as_ptr(identity) as usize,
            tls_size,
            tls_align,
            image,
            tls_image_size,
            !loader
                .process_started
                .load(core::sync::atomic::Ordering::Acquire),
        );
        identity.set_tls_module(module_id, offset);
    }
    true
}

/// Address of a named symbol of a relocatable object (from `.symtab`).
pub fn symbol_address(object: &ObjectRef, name: &str) -> Option<usize> {
    let sections = object.elf.section_headers();
    let table = sections
        .iter()
        .find(|section| section.sh_type == SHT_SYMTAB)?;
    let strtab = sections.get(table.sh_link as usize)?;
    let count = table.sh_size as usize / core::mem::size_of::<Sym>();
    let symbols =
        elf_image::ElfImage::sym_table(object.data.addr + table.sh_offset as usize, count);
    let (placements, _, _) = layout_sections(&object.elf);
    for sym in symbols {
        if sym.st_shndx == 0 || sym.st_shndx as usize >= sections.len() {
            continue;
        }
        if object.elf.str_at(strtab.sh_offset as usize + sym.st_name as usize) == Some(name) {
            let placement = placements.get(&(sym.st_shndx as usize))?;
            return Some(object.base + placement.offset + sym.st_value as usize);
        }
    }
    None
}

/// Copies section contents into the allocated segments and applies every
/// `.rela.*` table.
pub fn prepare(loader: &Loader, object: &ObjectRef) -> bool {
    let identity = match object.identity() {
        Some(identity) => identity,
        None => return false,
    };
    let sections = object.elf.section_headers();
    let (placements, got_offset, _) = layout_sections(&object.elf);
    let base = object.base;

    // Populate the image from the file bytes (NOBITS stays zeroed).
    for (shndx, placement) in &placements {
        let section = &sections[*shndx];
        if section.sh_type == SHT_NOBITS {
            continue;
        }
        if let Some(bytes) = object.elf.section_bytes(section) {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    (base + placement.offset) as *mut u8,
                    bytes.len(),
                );
            }
        }
    }

    // The (single) symbol table of the file.
    let symtab = sections
        .iter()
        .find(|section| section.sh_type == SHT_SYMTAB);
    let (symbols, strtab_offset): (&[Sym], usize) = match symtab {
        Some(table) => {
            let count = table.sh_size as usize / core::mem::size_of::<Sym>();
            let strtab = &sections[table.sh_link as usize];
            (
                elf_image::ElfImage::sym_table(object.data.addr + table.sh_offset as usize, count),
                strtab.sh_offset as usize,
            )
        }
        None => (&[], 0),
    };

    // Address of the symbol `index` resolves to (0 for undefined weak).
    let mut got_slots: HashMap<u32, usize> = HashMap::new();
    let mut next_got_slot = 0usize;
    let got_base = base + got_offset;

    let resolve = |index: u32| -> Option<(usize, u64)> {
        if index == 0 {
            return Some((0, 0));
        }
        let sym = symbols.get(index as usize)?;
        if sym.st_shndx != 0 && (sym.st_shndx as usize) < sections.len() {
            let placement = placements.get(&(sym.st_shndx as usize))?;
            Some((base + placement.offset + sym.st_value as usize, sym.st_size))
        } else if sym.st_shndx == SHN_ABS {
            Some((sym.st_value as usize, sym.st_size))
        } else {
            // Undefined: look through the loader's scope.
            let name = object.elf.str_at(strtab_offset + sym.st_name as usize)?;
            match loader.resolve_symbol(name, None, identity.ns, Some(&identity), ResolveMode::Default) {
                Some(definition) => Some((definition.pointer(), definition.size)),
                None if (sym.st_info >> 4) == STB_WEAK => Some((0, 0)),
                None => {
                    error!("unable to resolve symbol {} in {:?}", name, object);
                    None
                }
            }
        }
    };

    // Apply each relocation table targeting an allocated section.
    for section in sections {
        if section.sh_type != SHT_RELA {
            continue;
        }
        let target = match placements.get(&(section.sh_info as usize)) {
            Some(placement) => placement.offset,
            None => continue,
        };
        let count = section.sh_size as usize / core::mem::size_of::<Rela>();
        let table =
            elf_image::ElfImage::rela_table(object.data.addr + section.sh_offset as usize, count * core::mem::size_of::<Rela>());
        for rela in table {
            let rtype = (rela.r_info & 0xffff_ffff) as u32;
            let sym_index = (rela.r_info >> 32) as u32;
            let (s, _size) = match resolve(sym_index) {
                Some(resolved) => resolved,
                None => return false,
            };
            let p = base + target + rela.r_offset as usize;
            let a = rela.r_addend;

            // GOT-mediated types get a slot in the synthetic table.
            let g = match rtype {
                R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX
                | R_X86_64_GOTTPOFF => {
                    let slot = *got_slots.entry(sym_index).or_insert_with(|| {
                        let slot = got_base + next_got_slot * 8;
                        next_got_slot += 1;
                        slot
                    });
                    slot
                }
                _ => 0,
            };

            unsafe {
                match rtype {
                    R_X86_64_NONE => {}
                    R_X86_64_64 => {
                        *(p as *mut u64) = (s as u64).wrapping_add(a as u64);
                    }
                    R_X86_64_32 | R_X86_64_32S => {
                        *(p as *mut u32) = (s as u64).wrapping_add(a as u64) as u32;
                    }
                    R_X86_64_PC32 | R_X86_64_PLT32 => {
                        *(p as *mut u32) =
                            (s as u64).wrapping_add(a as u64).wrapping_sub(p as u64) as u32;
                    }
                    R_X86_64_PC64 => {
                        *(p as *mut u64) =
                            (s as u64).wrapping_add(a as u64).wrapping_sub(p as u64);
                    }
                    R_X86_64_TPOFF32 => {
                        // Static TLS: the symbol value is an offset within
                        // this object's TLS block.
                        let offset = identity.tls_offset();
                        let sym = &symbols[sym_index as usize];
                        *(p as *mut u32) =
                            (offset as u64)
                                .wrapping_add(sym.st_value)
                                .wrapping_add(a as u64) as u32;
                    }
                    R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                        *(g as *mut u64) = s as u64;
                        *(p as *mut u32) =
                            (g as u64).wrapping_add(a as u64).wrapping_sub(p as u64) as u32;
                    }
                    R_X86_64_GOTTPOFF => {
                        let offset = identity.tls_offset();
                        let sym = &symbols[sym_index as usize];
                        *(g as *mut u64) = (offset as u64).wrapping_add(sym.st_value);
                        *(p as *mut u32) =
                            (g as u64).wrapping_add(a as u64).wrapping_sub(p as u64) as u32;
                    }
                    other => {
                        warn!(
                            "unsupported relocation type {} in static-link mode",
                            other
                        );
                        return false;
                    }
                }
            }
        }
    }
    debug!("prepared relocatable {:?} at {:#x}", object, base);
    true
}
