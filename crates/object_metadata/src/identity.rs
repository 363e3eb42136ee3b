//! File-level identities and their version chains.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use spin::{Mutex, RwLock};

use crate::object::ObjectRef;

/// A symbol-resolution scope tag. Distinct namespaces never share symbols.
pub type Namespace = i64;

/// The default namespace of the executable and its dependencies.
pub const NAMESPACE_BASE: Namespace = 0;
/// Request for a fresh namespace (`dlmopen(LM_ID_NEWLM)`).
pub const NAMESPACE_NEW: Namespace = -1;

bitflags::bitflags! {
    /// Per-file behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Resolve all relocations at load time instead of lazily.
        const BIND_NOW         = 1 << 0;
        /// Do not patch the GOT (debugging aid).
        const BIND_NOT         = 1 << 1;
        /// Definitions take part in global symbol lookup.
        const BIND_GLOBAL      = 1 << 2;
        /// Look up symbols in the object's own scope first.
        const BIND_DEEP        = 1 << 3;
        /// Cannot be unloaded.
        const PERSISTENT       = 1 << 4;
        /// May be replaced by newer versions at runtime.
        const UPDATABLE        = 1 << 5;
        /// On update, rewrite relocations in outdated versions as well.
        const UPDATE_OUTDATED  = 1 << 6;
        /// The file bytes will not change during runtime.
        const IMMUTABLE_SOURCE = 1 << 7;
        /// Ignore the modification time when checking for identical files.
        const IGNORE_MTIME     = 1 << 8;
        /// Skip an update whose content matches a loaded version.
        const SKIP_IDENTICAL   = 1 << 9;
        /// Constructors have run (do not run them again).
        const INITIALIZED      = 1 << 10;
        /// Already mapped at its target address (vDSO, the loader itself).
        const PREMAPPED        = 1 << 11;
        /// The binary the kernel executed (special watch handling).
        const EXECUTED_BINARY  = 1 << 12;
    }
}

/// A strong reference to an identity.
pub type IdentityRef = Arc<ObjectIdentity>;

/// One file known to the loader, owning the chain of loaded versions.
pub struct ObjectIdentity {
    /// Short name (SONAME once known, file name before that).
    name: RwLock<String>,
    /// Normalized absolute path (empty for memory-only objects).
    pub path: PathBuf,
    /// Resolution scope this identity belongs to.
    pub ns: Namespace,
    /// Behavior flags.
    pub flags: RwLock<ObjectFlags>,

    /// Newest version, or `None` before the first successful load.
    current: RwLock<Option<ObjectRef>>,

    /// TLS module id assigned to this file (0 = no TLS).
    tls_module_id: AtomicUsize,
    /// Static TLS offset from the thread pointer (0 for dynamic TLS).
    tls_offset: AtomicI64,
    /// inotify watch descriptor (-1 = not watched).
    pub watch_descriptor: AtomicI32,
    /// Base address mirrored into the link map.
    pub link_base: AtomicUsize,
    /// `_DYNAMIC` address mirrored into the link map.
    pub link_dynamic: AtomicUsize,
    /// Stale code of a retired version was executed.
    pub accessed_after_retirement: AtomicBool,
    /// Remembered values of data-section relocations, keyed by segment fd
    /// and offset, to detect user modifications before an update rewrite.
    pub datarel_content: Mutex<HashMap<(i32, usize), u64>>,
}

impl ObjectIdentity {
    pub fn new(path: PathBuf, name: Option<&str>, ns: Namespace, flags: ObjectFlags) -> IdentityRef {
        debug_assert!(ns != NAMESPACE_NEW);
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        Arc::new(ObjectIdentity {
            name: RwLock::new(name),
            path,
            ns,
            flags: RwLock::new(flags),
            current: RwLock::new(None),
            tls_module_id: AtomicUsize::new(0),
            tls_offset: AtomicI64::new(0),
            watch_descriptor: AtomicI32::new(-1),
            link_base: AtomicUsize::new(0),
            link_dynamic: AtomicUsize::new(0),
            accessed_after_retirement: AtomicBool::new(false),
            datarel_content: Mutex::new(HashMap::new()),
        })
    }

    /// Short name (SONAME) of this identity.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Replaces the short name (when the SONAME differs from the file name).
    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    /// The newest version.
    pub fn current(&self) -> Option<ObjectRef> {
        self.current.read().clone()
    }

    /// Splices a freshly created version in as the newest one. The caller
    /// must have linked `object.file_previous` to the old current.
    pub fn set_current(&self, object: ObjectRef) {
        self.link_base.store(object.base, Ordering::Release);
        self.link_dynamic
            .store(object.dynamic_address(), Ordering::Release);
        *self.current.write() = Some(object);
    }

    /// Drops the newest version (failed load rollback).
    pub fn rollback(&self) {
        let mut current = self.current.write();
        let previous = current
            .as_ref()
            .and_then(|object| object.file_previous.clone());
        *current = previous;
    }

    /// All versions, newest first.
    pub fn versions(&self) -> Vec<ObjectRef> {
        let mut versions = Vec::new();
        let mut object = self.current();
        while let Some(current) = object {
            object = current.file_previous.clone();
            versions.push(current);
        }
        versions
    }

    /// Whether any loaded version matches the given modification time and
    /// file size.
    pub fn has_version_with_mtime(&self, mtime: (i64, i64), size: usize) -> bool {
        self.versions()
            .iter()
            .any(|object| object.data.mtime == mtime && object.data.size == size)
    }

    /// Whether any loaded version matches the given content hash and size.
    pub fn has_version_with_hash(&self, hash: u64, size: usize) -> bool {
        self.versions()
            .iter()
            .any(|object| object.data.hash == hash && object.data.size == size)
    }

    /// Set of flags, read.
    pub fn flag(&self, flag: ObjectFlags) -> bool {
        self.flags.read().contains(flag)
    }

    /// Sets (or clears) flags.
    pub fn set_flag(&self, flag: ObjectFlags, value: bool) {
        let mut flags = self.flags.write();
        flags.set(flag, value);
    }

    /// TLS module id of this file (0 = none).
    pub fn tls_module_id(&self) -> usize {
        self.tls_module_id.load(Ordering::Acquire)
    }

    /// Static TLS offset from the thread pointer.
    pub fn tls_offset(&self) -> i64 {
        self.tls_offset.load(Ordering::Acquire)
    }

    /// Registers the TLS module assigned to this file (once).
    pub fn set_tls_module(&self, module_id: usize, offset: i64) {
        debug!(
            "identity {} uses TLS module {} (offset {})",
            self.name(),
            module_id,
            offset
        );
        self.tls_module_id.store(module_id, Ordering::Release);
        self.tls_offset.store(offset, Ordering::Release);
    }
}

impl core::fmt::Debug for ObjectIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{} ({})", self.name(), self.path.display())
    }
}
