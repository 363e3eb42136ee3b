//! Redirection tests against real executable pages.

use core::convert::TryInto;

use super::*;

/// Maps one anonymous RWX page for hand-written code.
fn code_page() -> usize {
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED);
    addr as usize
}

/// `mov eax, imm32; ret`
fn write_return_constant(addr: usize, value: u32) {
    unsafe {
        let code = addr as *mut u8;
        *code = 0xb8;
        core::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), code.add(1), 4);
        *code.add(5) = 0xc3;
    }
}

#[test]
fn add_and_remove_restore_original_bytes() {
    let page = code_page();
    write_return_constant(page, 1);
    let before: [u8; 6] = unsafe { *(page as *const [u8; 6]) };

    // The page is writable, so it is its own compose alias.
    add_at(page, page, page + 0x100, 0, false).unwrap();
    assert_eq!(unsafe { *(page as *const u8) }, 0xcc);
    assert_eq!(target_of(page), Some(page + 0x100));

    assert!(remove(page));
    let after: [u8; 6] = unsafe { *(page as *const [u8; 6]) };
    assert_eq!(before, after);
    assert_eq!(target_of(page), None);
}

#[test]
fn trap_forwards_execution_to_replacement() {
    setup(TrapMode::Breakpoint).unwrap();

    let page = code_page();
    let old_fn = page;
    let new_fn = page + 0x80;
    write_return_constant(old_fn, 1);
    write_return_constant(new_fn, 2);

    add_at(old_fn, old_fn, new_fn, 0, false).unwrap();

    let call: extern "C" fn() -> u32 = unsafe { core::mem::transmute(old_fn) };
    assert_eq!(call(), 2);

    // Removing the redirection restores the old behavior.
    assert!(remove(old_fn));
    assert_eq!(call(), 1);
}

#[test]
fn unsupported_trap_modes_are_rejected() {
    assert!(setup(TrapMode::Debug).is_err());
    assert!(setup(TrapMode::InvalidOpcode).is_err());
    assert!(setup(TrapMode::Halt).is_err());
    assert!(setup(TrapMode::None).is_ok());
}

#[test]
fn jump_encoding_short_and_long() {
    // Near target: 5-byte relative jump.
    let (code, len) = jump_code(0x40_0000, 0x40_1000);
    assert_eq!(len, 5);
    assert_eq!(code[0], 0xe9);
    let displacement = i32::from_le_bytes([code[1], code[2], code[3], code[4]]);
    assert_eq!(displacement, 0x1000 - 5);

    // Far target: absolute indirect jump through the trailing pool.
    let far = 0x7fff_0000_0000usize;
    let (code, len) = jump_code(0x40_0000, far);
    assert_eq!(len, 14);
    assert_eq!(&code[..6], &[0xff, 0x25, 0, 0, 0, 0]);
    assert_eq!(u64::from_le_bytes(code[6..14].try_into().unwrap()), far as u64);
}

#[test]
fn readding_same_redirection_is_idempotent() {
    let page = code_page();
    write_return_constant(page, 1);
    add_at(page, page, page + 0x40, 0, false).unwrap();
    add_at(page, page, page + 0x40, 0, false).unwrap();
    assert_eq!(target_of(page), Some(page + 0x40));
    assert!(remove(page));
    assert!(!remove(page));
}
