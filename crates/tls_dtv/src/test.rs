//! DTV lifecycle tests (no thread-pointer switching; the control blocks are
//! plain heap structures here).

use super::*;

#[test]
fn initial_module_lands_in_static_block() {
    let registry = TlsRegistry::new();
    let image = [7u8, 0, 0, 0];
    let (module_id, tp_offset) =
        registry.add_module(0x1000, 4, 4, image.as_ptr() as usize, 4, true);
    assert_eq!(module_id, 1);
    assert!(tp_offset < 0);

    unsafe {
        let tcb = registry.allocate_thread(false);
        registry.dtv_setup(tcb);

        let addr = registry.get_addr(tcb, module_id, true);
        assert_eq!(addr, (tcb as i64 + tp_offset) as usize);
        assert_eq!(*(addr as *const i32), 7);

        registry.free_thread(tcb, true);
    }
}

#[test]
fn dynamic_module_is_lazily_allocated() {
    let registry = TlsRegistry::new();
    unsafe {
        let tcb = registry.allocate_thread(false);
        registry.dtv_setup(tcb);

        let image = 42u64;
        let (module_id, tp_offset) =
            registry.add_module(0x2000, 8, 8, &image as *const u64 as usize, 8, false);
        assert_eq!(tp_offset, 0);

        // Not yet materialized: a non-allocating access returns 0.
        assert_eq!(registry.get_addr(tcb, module_id, false), 0);

        let addr = registry.get_addr(tcb, module_id, true);
        assert_ne!(addr, 0);
        assert_eq!(addr % 8, 0);
        assert_eq!(*(addr as *const u64), 42);

        // The second access sees the same block.
        assert_eq!(registry.get_addr(tcb, module_id, true), addr);

        registry.free_thread(tcb, true);
    }
}

#[test]
fn generation_catches_up_after_new_modules() {
    let registry = TlsRegistry::new();
    unsafe {
        let tcb = registry.allocate_thread(false);
        registry.dtv_setup(tcb);
        let initial_generation = registry.generation();

        let images: Vec<u32> = (0..20).collect();
        let mut ids = Vec::new();
        for image in &images {
            let (id, _) =
                registry.add_module(image as *const u32 as usize, 4, 4, image as *const u32 as usize, 4, false);
            ids.push(id);
        }
        assert_eq!(registry.generation(), initial_generation + images.len());

        // Accessing the last module grows the DTV past its initial capacity
        // and refreshes the generation slot.
        let last = *ids.last().unwrap();
        let addr = registry.get_addr(tcb, last, true);
        assert_eq!(*(addr as *const u32), images[images.len() - 1]);
        assert_eq!((*(*tcb).dtv).counter, registry.generation());
        assert!((*(*tcb).dtv.offset(-1)).counter >= registry.module_count());

        registry.free_thread(tcb, true);
    }
}

#[test]
fn new_image_only_affects_fresh_threads() {
    let registry = TlsRegistry::new();
    unsafe {
        let old_image = 7i32;
        let (module_id, _) =
            registry.add_module(0x3000, 4, 4, &old_image as *const i32 as usize, 4, false);

        let first = registry.allocate_thread(false);
        registry.dtv_setup(first);
        let first_addr = registry.get_addr(first, module_id, true);
        assert_eq!(*(first_addr as *const i32), 7);

        // An update replaces the initialization image.
        let new_image = 8i32;
        registry.set_image(module_id, &new_image as *const i32 as usize);

        // Existing threads keep their materialized value.
        assert_eq!(*(registry.get_addr(first, module_id, true) as *const i32), 7);

        // A fresh thread sees the new initializer.
        let second = registry.allocate_thread(false);
        registry.dtv_setup(second);
        let second_addr = registry.get_addr(second, module_id, true);
        assert_eq!(*(second_addr as *const i32), 8);

        registry.free_thread(second, true);
        registry.free_thread(first, true);
    }
}
