//! GNU note parsing (build-id).

use goblin::elf::section_header::SHT_NOTE;

use crate::defs::{Nhdr, NT_GNU_BUILD_ID};
use crate::ElfImage;

/// Extracts the GNU build-id from the image's note sections as a lowercase
/// hex string.
pub(crate) fn build_id(image: &ElfImage) -> Option<String> {
    for section in image.section_headers() {
        if section.sh_type != SHT_NOTE {
            continue;
        }
        let bytes = match image.section_bytes(section) {
            Some(bytes) => bytes,
            None => continue,
        };
        let mut offset = 0;
        while offset + core::mem::size_of::<Nhdr>() <= bytes.len() {
            let nhdr = unsafe { &*(bytes.as_ptr().add(offset) as *const Nhdr) };
            let name_start = offset + core::mem::size_of::<Nhdr>();
            let name_end = name_start + nhdr.n_namesz as usize;
            let desc_start = (name_end + 3) & !3;
            let desc_end = desc_start + nhdr.n_descsz as usize;
            if desc_end > bytes.len() {
                break;
            }
            if nhdr.n_type == NT_GNU_BUILD_ID
                && nhdr.n_namesz == 4
                && &bytes[name_start..name_start + 4] == b"GNU\0"
            {
                let mut id = String::with_capacity(nhdr.n_descsz as usize * 2);
                for byte in &bytes[desc_start..desc_end] {
                    id.push_str(&format!("{:02x}", byte));
                }
                return Some(id);
            }
            offset = (desc_end + 3) & !3;
        }
    }
    None
}
