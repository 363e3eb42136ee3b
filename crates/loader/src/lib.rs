//! The loader core.
//!
//! A single [`Loader`] instance coordinates everything: it owns the ordered
//! list of [`ObjectIdentity`]s (the resolution scope), the TLS registry, the
//! `dlsym` trampoline pool and the configuration. Program start walks
//! [`Loader::open`] / [`Loader::library`] to populate the list, then
//! [`Loader::relocate_all`] prepares every object and
//! [`run`](crate::process::start_program) transfers control.
//!
//! During execution a helper thread ([`watch`]) observes file modification
//! events; a changed updatable file is reloaded as a fresh version of its
//! identity, validated for compatibility, relocated, and spliced in front of
//! the old version, after which the [`update`] cascade re-points every
//! reference that used to target the outdated code.

pub mod dl;
mod load;
pub mod process;
mod relocatable;
mod resolve;
mod resolver_entry;
mod prepare;
mod update;
pub mod watch;

pub use load::load_object;
pub use resolve::ResolveMode;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};

use code_redirect::TrapMode;
use log::{debug, error, info, warn};
use object_metadata::{
    IdentityRef, Info, Namespace, ObjectFlags, ObjectIdentity, ObjectRef, SymbolDefinition,
    NAMESPACE_BASE, NAMESPACE_NEW,
};
use spin::{Mutex, Once, RwLock};
use tls_dtv::TlsRegistry;
use trampoline_pool::Trampoline;

/// How updates rewrite references to outdated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateMode {
    /// Only rewrite the global offset tables.
    Got,
    /// Additionally redirect changed functions reached without the PLT.
    CodeRel,
    /// Additionally intercept local intra-object branches.
    CodeRelLocalInt,
}

/// How accesses to retired code are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectOutdated {
    Disabled,
    Userfaultfd,
    Uprobes,
    UprobesDeps,
    Ptrace,
}

/// Loader-wide configuration, assembled by the frontend before
/// [`Loader::initialize`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Enable dynamic updates.
    pub dynamic_update: bool,
    /// Keep `dlsym` results updatable via the trampoline pool.
    pub dynamic_dlupdate: bool,
    /// Resolve all relocations at load time.
    pub bind_now: bool,
    /// Force updates even when they seem incompatible.
    pub force_update: bool,
    /// Skip updates identical to already-loaded versions.
    pub skip_identical: bool,
    /// Honor weak dynamic linkage during resolution.
    pub dynamic_weak: bool,
    /// Stop all threads while mutating instructions.
    pub stop_on_update: bool,
    /// Use the modification time to detect identical files.
    pub use_mtime: bool,
    /// Detect user modifications of relocated data values before rewriting.
    pub check_relocation_content: bool,
    /// Rewrite relocations in outdated versions as well.
    pub update_outdated_relocations: bool,
    pub update_mode: UpdateMode,
    pub detect_outdated: DetectOutdated,
    /// Delay in seconds between an update and disabling the old version.
    pub detect_outdated_delay: u64,
    pub trap_mode: TrapMode,
    /// Additional library search paths (`--library-path`).
    pub library_path: Vec<String>,
    /// Additional libraries to exclude from dependency loading.
    pub exclude: Vec<String>,
    /// Emit status info before the target gains control as well.
    pub early_statusinfo: bool,
    /// Fingerprint from separate debug-symbol files when available.
    pub find_debug_symbols: bool,
    /// Root directory for debug symbols (system root when unset).
    pub debug_symbols_root: Option<String>,
    /// Debug-hash oracle URI (unix:/path or tcp:host:port), if any.
    pub debug_hash: Option<String>,
    pub show_args: bool,
    pub show_env: bool,
    pub show_auxv: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            dynamic_update: false,
            dynamic_dlupdate: false,
            bind_now: false,
            force_update: false,
            skip_identical: false,
            dynamic_weak: false,
            stop_on_update: false,
            use_mtime: false,
            check_relocation_content: false,
            update_outdated_relocations: false,
            update_mode: UpdateMode::Got,
            detect_outdated: DetectOutdated::Disabled,
            detect_outdated_delay: 1,
            trap_mode: TrapMode::Breakpoint,
            library_path: Vec::new(),
            exclude: Vec::new(),
            early_statusinfo: false,
            find_debug_symbols: false,
            debug_symbols_root: None,
            debug_hash: None,
            show_args: false,
            show_env: false,
            show_auxv: false,
        }
    }
}

/// Lowest address handed out to position-independent objects.
const LIBRARY_ADDRESS: usize = 0x7800_0000_0000;

static INSTANCE: Once<&'static Loader> = Once::new();

/// The global coordinator.
pub struct Loader {
    pub config: Config,

    /// Search paths from `--library-path` / `LD_LIBRARY_PATH`.
    pub library_path_runtime: Vec<String>,
    /// Search paths from the configuration file.
    pub library_path_config: Vec<String>,
    /// Conventional default search paths.
    pub library_path_default: Vec<String>,
    /// Libraries excluded from dependency loading.
    pub library_exclude: Vec<String>,

    /// Every known identity, in resolution order (target binary first,
    /// preloads, then dependencies). Guarded by the primary lookup lock.
    pub lookup: RwLock<Vec<IdentityRef>>,

    /// Serializes mutation phases against each other: dynamic updates,
    /// `dlopen` and first-call resolution take this lock; plain lookups run
    /// under `lookup` reader access only.
    pub update_sync: Mutex<()>,

    /// Thread-local storage engine.
    pub tls: TlsRegistry,
    /// Stable stubs for `dlsym` results.
    pub symbol_trampoline: Trampoline,

    /// The executed binary.
    pub target: RwLock<Option<IdentityRef>>,

    /// Default flags for newly opened identities.
    pub default_flags: ObjectFlags,

    /// Main thread's control block (set during TLS setup).
    pub main_thread: core::sync::atomic::AtomicUsize,

    next_namespace: AtomicI64,
    next_library_address: Mutex<usize>,

    /// Status info stream (-1 = disabled).
    pub statusinfo_fd: AtomicI32,
    /// inotify descriptor of the helper thread (-1 = not watching).
    pub inotify_fd: AtomicI32,
    /// userfaultfd descriptor (-1 = disabled).
    pub userfault_fd: AtomicI32,
    /// Debug-hash oracle socket (-1 = not connected).
    pub debug_hash_fd: AtomicI32,

    /// Whether the target program gained control already.
    pub process_started: AtomicBool,
}

impl Loader {
    /// Creates and installs the process-wide instance.
    pub fn initialize(config: Config) -> &'static Loader {
        let mut default_flags = ObjectFlags::BIND_GLOBAL;
        if config.dynamic_update {
            default_flags |= ObjectFlags::UPDATABLE;
            if config.update_outdated_relocations {
                default_flags |= ObjectFlags::UPDATE_OUTDATED;
            }
        } else {
            default_flags |= ObjectFlags::IMMUTABLE_SOURCE;
        }
        if config.bind_now {
            default_flags |= ObjectFlags::BIND_NOW;
        }
        if config.skip_identical {
            default_flags |= ObjectFlags::SKIP_IDENTICAL;
        }

        let library_path_runtime = config.library_path.clone();
        let mut library_exclude = vec![
            "ld-linux-x86-64.so.2".to_string(),
            "libdl.so.2".to_string(),
        ];
        library_exclude.extend(config.exclude.iter().cloned());

        let loader: &'static Loader = Box::leak(Box::new(Loader {
            config,
            library_path_runtime,
            library_path_config: Vec::new(),
            library_path_default: vec![
                "/lib".to_string(),
                "/usr/lib".to_string(),
                "/lib64".to_string(),
                "/usr/lib64".to_string(),
            ],
            library_exclude,
            lookup: RwLock::new(Vec::new()),
            update_sync: Mutex::new(()),
            tls: TlsRegistry::new(),
            symbol_trampoline: Trampoline::new(),
            target: RwLock::new(None),
            default_flags,
            main_thread: core::sync::atomic::AtomicUsize::new(0),
            next_namespace: AtomicI64::new(1),
            next_library_address: Mutex::new(0),
            statusinfo_fd: AtomicI32::new(-1),
            inotify_fd: AtomicI32::new(-1),
            userfault_fd: AtomicI32::new(-1),
            debug_hash_fd: AtomicI32::new(-1),
            process_started: AtomicBool::new(false),
        }));

        INSTANCE.call_once(|| loader);

        if loader.config.dynamic_update {
            if let Err(message) = code_redirect::setup(loader.config.trap_mode) {
                warn!("configuring redirection failed: {}", message);
            }
        }
        loader
    }

    /// The process-wide instance.
    pub fn instance() -> &'static Loader {
        INSTANCE.get().expect("loader not initialized")
    }

    /// Searches for a library by name (or path) and loads it with its
    /// dependencies unless it is already known in the namespace.
    pub fn library(
        &self,
        file: &str,
        flags: ObjectFlags,
        rpath: &[String],
        runpath: &[String],
        ns: Namespace,
    ) -> Option<IdentityRef> {
        let name = file.rsplit('/').next().unwrap_or(file);
        if ns != NAMESPACE_NEW {
            for identity in self.lookup.read().iter() {
                if identity.ns == ns && identity.name() == name {
                    return Some(identity.clone());
                }
            }
        }

        if file.contains('/') {
            return self.open(Path::new(file), flags, ns, None);
        }
        let search: [&[String]; 5] = [
            rpath,
            &self.library_path_runtime,
            runpath,
            &self.library_path_config,
            &self.library_path_default,
        ];
        for paths in search.iter() {
            for directory in paths.iter() {
                let path = Path::new(directory).join(file);
                if path.exists() {
                    if let Some(identity) = self.open(&path, flags, ns, None) {
                        return Some(identity);
                    }
                }
            }
        }
        error!("library '{}' cannot be found", file);
        None
    }

    /// Opens the file at `path` as a new identity and loads its first
    /// version (dropping the identity again if that fails).
    pub fn open(
        &self,
        path: &Path,
        mut flags: ObjectFlags,
        ns: Namespace,
        altname: Option<&str>,
    ) -> Option<IdentityRef> {
        if !path.exists() {
            return None;
        }
        // Updatable identities may also rewrite the relocations of their
        // outdated versions when configured to.
        if flags.contains(ObjectFlags::UPDATABLE) && self.config.update_outdated_relocations {
            flags |= ObjectFlags::UPDATE_OUTDATED;
        }
        let ns = if ns == NAMESPACE_NEW {
            self.next_namespace.fetch_add(1, Ordering::AcqRel)
        } else {
            ns
        };
        let normalized = path
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(path));
        debug!("loading {}...", normalized.display());

        let identity = ObjectIdentity::new(normalized, altname, ns, flags);
        // A symbolic link is updated by being re-pointed, not by having its
        // target rewritten in place.
        if identity.flag(ObjectFlags::UPDATABLE)
            && path
                .symlink_metadata()
                .map(|metadata| metadata.file_type().is_symlink())
                .unwrap_or(false)
        {
            debug!(
                "{} is a symbolic link, not expecting changes to the binary itself",
                path.display()
            );
            identity.set_flag(ObjectFlags::IMMUTABLE_SOURCE, true);
        }
        self.lookup.write().push(identity.clone());

        let (object, info) = load::load_object(self, &identity, 0);
        self.status(&identity, info);
        if object.is_some() {
            watch::watch_identity(self, &identity, false);
            Some(identity)
        } else {
            error!("unable to open {}", path.display());
            let mut lookup = self.lookup.write();
            if let Some(position) = lookup
                .iter()
                .position(|entry| std::sync::Arc::ptr_eq(entry, &identity))
            {
                lookup.remove(position);
            }
            None
        }
    }

    /// Loads a library during runtime (the `dlopen` path): search, load,
    /// prepare and initialize.
    pub fn dlopen(
        &self,
        file: Option<&str>,
        flags: ObjectFlags,
        ns: Namespace,
    ) -> Option<IdentityRef> {
        let _update_guard = self.update_sync.lock();
        let identity = match file {
            None => self.target.read().clone(),
            Some(file) => {
                let mut flags = flags;
                flags.set(ObjectFlags::UPDATABLE, self.config.dynamic_dlupdate);
                self.library(file, flags, &[], &[], ns)
            }
        }?;

        if !prepare::prepare_identity(self, &identity) {
            warn!("preparation of {:?} failed", identity);
            return None;
        }
        if let Some(object) = identity.current() {
            let _ = object.finalize();
        }
        if !prepare::initialize_identity(self, &identity) {
            warn!("initialization of {:?} failed", identity);
            return None;
        }
        Some(identity)
    }

    /// Applies relocations to every loaded object (and, with `update`,
    /// replays the provenance logs against new versions), then protects
    /// all segments.
    pub fn relocate_all(&self, update: bool) -> Result<(), &'static str> {
        let identities: Vec<IdentityRef> = self.lookup.read().iter().rev().cloned().collect();
        for identity in identities.iter() {
            if !prepare::prepare_identity(self, identity) {
                return Err("preparing relocations failed");
            }
        }
        if update {
            for identity in identities.iter() {
                update::update_identity(self, identity);
            }
            self.symbol_trampoline.update(|symbol| {
                self.resolve_symbol(symbol.name.as_str(), Some(&symbol.version), NAMESPACE_BASE, None, ResolveMode::Default)
                    .map(|definition| definition.pointer())
            });
        }
        for identity in identities.iter() {
            for object in identity.versions() {
                object.finalize()?;
            }
        }
        Ok(())
    }

    /// Next page-aligned base address for a position-independent object.
    pub fn next_address(&self, size: usize) -> usize {
        let mut next_address = self.next_library_address.lock();
        let mut next = *next_address;
        for identity in self.lookup.read().iter() {
            for object in identity.versions() {
                if let Some((_, end)) = object.memory_range() {
                    if end > next {
                        next = end;
                    }
                }
            }
        }
        if next == 0 {
            next = LIBRARY_ADDRESS;
        }
        next = page_util::align_up(next);
        *next_address = page_util::align_up(next + size);
        next
    }

    /// Rewinds the bump allocator after an aborted load.
    pub fn reset_address(&self, addr: usize) {
        if addr == 0 {
            return;
        }
        let mut next_address = self.next_library_address.lock();
        if page_util::align_up(addr) < *next_address {
            *next_address = page_util::align_up(addr);
        }
    }

    /// The object version whose segments cover `addr`.
    pub fn resolve_object(&self, addr: usize, ns: Namespace) -> Option<ObjectRef> {
        for identity in self.lookup.read().iter() {
            if identity.ns != ns {
                continue;
            }
            for object in identity.versions() {
                if object.contains(addr) {
                    return Some(object);
                }
            }
        }
        None
    }

    /// The symbol covering `addr`.
    pub fn resolve_symbol_by_address(
        &self,
        addr: usize,
        ns: Namespace,
    ) -> Option<SymbolDefinition> {
        self.resolve_object(addr, ns)
            .and_then(|object| object.resolve_address(addr))
    }

    /// Emits one line to the status-info stream for a load attempt.
    pub fn status(&self, identity: &IdentityRef, info: Info) {
        let fd = self.statusinfo_fd.load(Ordering::Acquire);
        if fd < 0 || !(self.config.early_statusinfo || self.target.read().is_some()) {
            return;
        }
        let mut timestamp = [0u8; 32];
        let timestamp = format_timestamp(&mut timestamp);
        let line = format!(
            "{} for {} [{}] in PID {} at {}\n",
            info,
            identity.name(),
            identity.path.display(),
            unsafe { libc::getpid() },
            timestamp,
        );
        unsafe {
            libc::write(fd, line.as_ptr() as *const libc::c_void, line.len());
        }
    }

    /// Whether the identity is still part of the lookup list.
    pub fn is_loaded(&self, identity: &IdentityRef) -> bool {
        self.lookup
            .read()
            .iter()
            .any(|entry| std::sync::Arc::ptr_eq(entry, identity))
    }

    /// Moves the target binary to the front of the resolution order.
    pub fn set_target(&self, identity: &IdentityRef) {
        let mut lookup = self.lookup.write();
        if let Some(position) = lookup
            .iter()
            .position(|entry| std::sync::Arc::ptr_eq(entry, identity))
        {
            let target = lookup.remove(position);
            lookup.insert(0, target);
        }
        *self.target.write() = Some(identity.clone());
        info!("target binary is {:?}", identity);
    }
}

/// Formats the current wall-clock time as `YYYY-MM-DD HH:MM:SS`.
fn format_timestamp(buffer: &mut [u8; 32]) -> &str {
    unsafe {
        let mut now: libc::time_t = 0;
        libc::time(&mut now);
        let mut tm: libc::tm = core::mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        let written = libc::strftime(
            buffer.as_mut_ptr() as *mut libc::c_char,
            buffer.len(),
            b"%Y-%m-%d %H:%M:%S\0".as_ptr() as *const libc::c_char,
            &tm,
        );
        core::str::from_utf8(&buffer[..written]).unwrap_or("?")
    }
}

#[cfg(test)]
mod test;
