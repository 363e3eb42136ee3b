//! ELF constants that are not (reliably) re-exported by `goblin`, plus the
//! raw symbol versioning structures.

/// Identification indices within `e_ident`.
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;
pub const EI_ABIVERSION: usize = 8;

/// OS ABI values accepted by the loader.
pub const ELFOSABI_NONE: u8 = 0;
pub const ELFOSABI_LINUX: u8 = 3;

/// Dynamic tags for the GNU extensions consumed at load time.
pub const DT_FLAGS: u64 = 30;
pub const DT_GNU_HASH: u64 = 0x6fff_fef5;
pub const DT_RELACOUNT: u64 = 0x6fff_fff9;
pub const DT_FLAGS_1: u64 = 0x6fff_fffb;
pub const DT_VERDEF: u64 = 0x6fff_fffc;
pub const DT_VERDEFNUM: u64 = 0x6fff_fffd;
pub const DT_VERSYM: u64 = 0x6fff_fff0;
pub const DT_VERNEED: u64 = 0x6fff_fffe;
pub const DT_VERNEEDNUM: u64 = 0x6fff_ffff;

/// `DT_FLAGS` bits.
pub const DF_BIND_NOW: u64 = 0x8;
pub const DF_STATIC_TLS: u64 = 0x10;

/// `DT_FLAGS_1` bits.
pub const DF_1_NOW: u64 = 0x1;
pub const DF_1_GLOBAL: u64 = 0x2;
pub const DF_1_NODELETE: u64 = 0x8;

/// Reserved symbol version indices.
pub const VER_NDX_LOCAL: u16 = 0;
pub const VER_NDX_GLOBAL: u16 = 1;
/// Hidden bit in a `versym` entry.
pub const VERSYM_HIDDEN: u16 = 0x8000;

/// Note type of the GNU build-id.
pub const NT_GNU_BUILD_ID: u32 = 3;

/// Version definition header (`.gnu.version_d`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Verdef {
    pub vd_version: u16,
    pub vd_flags: u16,
    pub vd_ndx: u16,
    pub vd_cnt: u16,
    pub vd_hash: u32,
    pub vd_aux: u32,
    pub vd_next: u32,
}

/// Auxiliary entry of a version definition (carries the version name).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Verdaux {
    pub vda_name: u32,
    pub vda_next: u32,
}

/// Version requirement header (`.gnu.version_r`), one per needed file.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Verneed {
    pub vn_version: u16,
    pub vn_cnt: u16,
    pub vn_file: u32,
    pub vn_aux: u32,
    pub vn_next: u32,
}

/// Auxiliary entry of a version requirement (one per needed version).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Vernaux {
    pub vna_hash: u32,
    pub vna_flags: u16,
    pub vna_other: u16,
    pub vna_name: u32,
    pub vna_next: u32,
}

/// `vna_flags` bit marking a weak version requirement.
pub const VER_FLG_WEAK: u16 = 0x2;
/// `vd_flags` bit marking the base version definition (the file itself).
pub const VER_FLG_BASE: u16 = 0x1;

/// Note header preceding each entry in a `SHT_NOTE` section.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Nhdr {
    pub n_namesz: u32,
    pub n_descsz: u32,
    pub n_type: u32,
}
