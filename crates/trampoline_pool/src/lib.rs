//! Stable callable stubs for `dlsym` results.
//!
//! User code may store the address a `dlsym` call returned in arbitrary
//! places the loader can never find again. Handing out a *stub* address
//! instead keeps such saved pointers valid across dynamic updates: each
//! 16-byte stub jumps through a writable target slot that the loader
//! refreshes whenever the providing object is replaced.
//!
//! A pool block is one executable page of 256 stubs
//! (`endbr64; jmp *slot(%rip); nopw`) followed by one writable page holding
//! the 256 target slots.

use log::{error, trace, warn};
use object_metadata::VersionedSymbol;
use page_util::PAGE_SIZE;
use spin::Mutex;

const STUB_BYTES: usize = 16;
const ENTRIES_PER_BLOCK: usize = PAGE_SIZE / core::mem::size_of::<usize>();
/// Code page(s) of a block, holding `ENTRIES_PER_BLOCK` stubs.
const CODE_BYTES: usize = page_util::align_up(ENTRIES_PER_BLOCK * STUB_BYTES);

struct Pool {
    /// Start address of every allocated block.
    blocks: Vec<usize>,
    /// Assigned symbols; the vector index is the stub index.
    symbols: Vec<VersionedSymbol>,
}

/// The trampoline pool.
pub struct Trampoline {
    pool: Mutex<Pool>,
}

/// Landing site for stubs whose target was never assigned.
extern "C" fn undefined_trampoline() {
    error!("jumped to unassigned trampoline function");
    std::process::abort();
}

impl Trampoline {
    pub const fn new() -> Trampoline {
        Trampoline {
            pool: Mutex::new(Pool {
                blocks: Vec::new(),
                symbols: Vec::new(),
            }),
        }
    }

    /// Address of the stub assigned to `symbol`, if one exists.
    pub fn get(&self, symbol: &VersionedSymbol) -> Option<usize> {
        let pool = self.pool.lock();
        let index = pool.symbols.iter().position(|entry| entry == symbol)?;
        Some(Self::stub_address(&pool, index))
    }

    /// Assigns (or reuses) a stub for `symbol`, points it at `target` and
    /// returns the stub address.
    pub fn set(&self, symbol: &VersionedSymbol, target: usize) -> Result<usize, &'static str> {
        let mut pool = self.pool.lock();
        let index = match pool.symbols.iter().position(|entry| entry == symbol) {
            Some(index) => index,
            None => {
                let index = pool.symbols.len();
                if index / ENTRIES_PER_BLOCK >= pool.blocks.len() {
                    Self::grow(&mut pool)?;
                }
                pool.symbols.push(symbol.clone());
                index
            }
        };
        unsafe {
            *(Self::slot_address(&pool, index) as *mut usize) = target;
        }
        trace!(
            "trampoline for {} at {:#x} targets {:#x}",
            symbol.name,
            Self::stub_address(&pool, index),
            target
        );
        Ok(Self::stub_address(&pool, index))
    }

    /// Refreshes every stub's target after an update via the given
    /// resolver (name/version → current address).
    pub fn update<F: Fn(&VersionedSymbol) -> Option<usize>>(&self, resolve: F) {
        let pool = self.pool.lock();
        for (index, symbol) in pool.symbols.iter().enumerate() {
            match resolve(symbol) {
                Some(target) => unsafe {
                    *(Self::slot_address(&pool, index) as *mut usize) = target;
                },
                None => warn!(
                    "symbol {} could not be found in its current object on update",
                    symbol.name
                ),
            }
        }
    }

    /// Number of assigned stubs.
    pub fn len(&self) -> usize {
        self.pool.lock().symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stub_address(pool: &Pool, index: usize) -> usize {
        pool.blocks[index / ENTRIES_PER_BLOCK] + (index % ENTRIES_PER_BLOCK) * STUB_BYTES
    }

    fn slot_address(pool: &Pool, index: usize) -> usize {
        pool.blocks[index / ENTRIES_PER_BLOCK] + CODE_BYTES + (index % ENTRIES_PER_BLOCK) * core::mem::size_of::<usize>()
    }

    /// Maps a fresh block: stub code page(s) plus the slot page.
    fn grow(pool: &mut Pool) -> Result<(), &'static str> {
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                CODE_BYTES + PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err("requesting trampoline memory failed");
        }
        let base = addr as usize;

        unsafe {
            let slots = (base + CODE_BYTES) as *mut usize;
            let mut code = base as *mut u8;
            for index in 0..ENTRIES_PER_BLOCK {
                *slots.add(index) = undefined_trampoline as usize;

                // Displacement from the end of the jmp to this stub's slot.
                let displacement = (CODE_BYTES + index * core::mem::size_of::<usize>()
                    - (index * STUB_BYTES + 0xa)) as u32;

                // endbr64
                *code = 0xf3;
                code = code.add(1);
                *code = 0x0f;
                code = code.add(1);
                *code = 0x1e;
                code = code.add(1);
                *code = 0xfa;
                code = code.add(1);

                // jmp *displacement(%rip)
                *code = 0xff;
                code = code.add(1);
                *code = 0x25;
                code = code.add(1);
                for byte in displacement.to_le_bytes().iter() {
                    *code = *byte;
                    code = code.add(1);
                }

                // 6-byte nop
                for byte in [0x66u8, 0x0f, 0x1f, 0x44, 0x00, 0x00].iter() {
                    *code = *byte;
                    code = code.add(1);
                }
            }

            if libc::mprotect(base as *mut libc::c_void, CODE_BYTES, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(base as *mut libc::c_void, CODE_BYTES + PAGE_SIZE);
                return Err("protecting trampoline code page failed");
            }
        }
        pool.blocks.push(base);
        trace!("new trampoline block at {:#x}", base);
        Ok(())
    }
}

impl Default for Trampoline {
    fn default() -> Self {
        Trampoline::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn forty_two() -> u64 {
        42
    }

    extern "C" fn forty_three() -> u64 {
        43
    }

    #[test]
    fn stub_calls_current_target() {
        let trampoline = Trampoline::new();
        let symbol = VersionedSymbol::unversioned("answer");
        let stub = trampoline.set(&symbol, forty_two as usize).unwrap();

        let call: extern "C" fn() -> u64 = unsafe { core::mem::transmute(stub) };
        assert_eq!(call(), 42);

        // Updating keeps the stub address stable but changes the behavior.
        let updated = trampoline.set(&symbol, forty_three as usize).unwrap();
        assert_eq!(stub, updated);
        assert_eq!(call(), 43);
    }

    #[test]
    fn get_returns_assigned_stub_only() {
        let trampoline = Trampoline::new();
        let symbol = VersionedSymbol::unversioned("answer");
        assert!(trampoline.get(&symbol).is_none());
        let stub = trampoline.set(&symbol, forty_two as usize).unwrap();
        assert_eq!(trampoline.get(&symbol), Some(stub));
    }

    #[test]
    fn update_refreshes_all_targets() {
        let trampoline = Trampoline::new();
        let first = VersionedSymbol::unversioned("one");
        let second = VersionedSymbol::unversioned("two");
        let stub_one = trampoline.set(&first, forty_two as usize).unwrap();
        let stub_two = trampoline.set(&second, forty_two as usize).unwrap();

        trampoline.update(|_| Some(forty_three as usize));

        let call_one: extern "C" fn() -> u64 = unsafe { core::mem::transmute(stub_one) };
        let call_two: extern "C" fn() -> u64 = unsafe { core::mem::transmute(stub_two) };
        assert_eq!(call_one(), 43);
        assert_eq!(call_two(), 43);
    }

    #[test]
    fn stubs_are_sixteen_bytes_apart() {
        let trampoline = Trampoline::new();
        let mut previous = None;
        for index in 0..4 {
            let symbol = VersionedSymbol::unversioned(&format!("symbol_{}", index));
            let stub = trampoline.set(&symbol, forty_two as usize).unwrap();
            if let Some(previous) = previous {
                assert_eq!(stub - previous, STUB_BYTES);
            }
            previous = Some(stub);
        }
    }
}
