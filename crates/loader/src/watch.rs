//! The helper thread: file-modification detection and userfault handling.
//!
//! One loader-owned thread polls an inotify instance (watching every
//! updatable identity's file) and, optionally, a `userfaultfd` descriptor
//! that observes accesses to the disabled pages of retired versions.
//!
//! Modification events are debounced: the reload is scheduled one second
//! out, and a duplicate event before the deadline re-arms the timer (text
//! editors produce bursts of writes). After a successful reload the retired
//! version is queued for protection at `now + detect_outdated_delay`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use object_metadata::{IdentityRef, Info, ObjectFlags, ObjectRef};

use crate::{load, DetectOutdated, Loader};

const SECOND_NS: u64 = 1_000_000_000;

/// userfaultfd ioctls (x86_64).
const UFFDIO_API: libc::c_ulong = 0xc018_aa3f;
const UFFDIO_REGISTER: libc::c_ulong = 0xc020_aa00;
const UFFDIO_COPY: libc::c_ulong = 0xc028_aa03;
const UFFD_API: u64 = 0xaa;
const UFFDIO_REGISTER_MODE_MISSING: u64 = 1;
const UFFD_EVENT_PAGEFAULT: u8 = 0x12;

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

#[repr(C)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    /// Pagefault payload: flags, address, feature data.
    arg: [u64; 3],
}

/// Creates the inotify instance (and userfaultfd, when configured) and
/// spawns the helper thread. Returns `false` when the machinery could not
/// be established.
pub fn start_handler_thread(loader: &'static Loader) -> bool {
    if !loader.config.dynamic_update {
        info!("not starting file modification handler thread (no dynamic updates)");
        return true;
    }

    let mut success = true;

    if loader.config.detect_outdated == DetectOutdated::Userfaultfd {
        let fd = unsafe {
            libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC | libc::O_NONBLOCK) as i32
        };
        if fd < 0 {
            error!("initializing userfaultfd failed");
            success = false;
        } else {
            let mut api = UffdioApi {
                api: UFFD_API,
                features: 0,
                ioctls: 0,
            };
            if unsafe { libc::ioctl(fd, UFFDIO_API, &mut api) } != 0 {
                error!("enabling userfault failed");
                unsafe { libc::close(fd) };
                success = false;
            } else {
                loader.userfault_fd.store(fd, Ordering::Release);
            }
        }
    }

    let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
    if fd < 0 {
        error!("initializing file modification watch failed");
        return false;
    }
    loader.inotify_fd.store(fd, Ordering::Release);

    for identity in loader.lookup.read().iter() {
        watch_identity(loader, identity, false);
    }

    std::thread::Builder::new()
        .name("luci-watch".to_string())
        .spawn(move || helper_loop(loader))
        .map(|_| ())
        .map_err(|_| error!("creating file modification handler thread failed"))
        .is_ok()
        && success
}

/// Adds (or re-arms) the inotify watch for one identity.
pub fn watch_identity(loader: &Loader, identity: &IdentityRef, force: bool) -> bool {
    if !identity.flag(ObjectFlags::UPDATABLE) {
        return true;
    }
    let inotify_fd = loader.inotify_fd.load(Ordering::Acquire);
    if inotify_fd < 0 {
        return false;
    }
    let existing = identity.watch_descriptor.load(Ordering::Acquire);
    if existing != -1 && !force {
        return true;
    }
    if existing != -1 {
        unsafe { libc::inotify_rm_watch(inotify_fd, existing) };
    }

    let path = match std::ffi::CString::new(identity.path.to_string_lossy().into_owned()) {
        Ok(path) => path,
        Err(_) => return false,
    };
    let mut mask = libc::IN_MODIFY | libc::IN_DELETE_SELF | libc::IN_MOVE_SELF | libc::IN_DONT_FOLLOW;
    if identity.flag(ObjectFlags::EXECUTED_BINARY) {
        mask |= libc::IN_ATTRIB;
    }
    let wd = unsafe { libc::inotify_add_watch(inotify_fd, path.as_ptr(), mask) };
    if wd < 0 {
        info!("cannot watch for modification of {:?}", identity);
        identity.watch_descriptor.store(-1, Ordering::Release);
        false
    } else {
        debug!("watching for modifications at {:?}", identity);
        identity.watch_descriptor.store(wd, Ordering::Release);
        true
    }
}

/// Registers the pages of a retired version with the userfault descriptor
/// right before they are disabled.
fn userfault_register(loader: &Loader, object: &ObjectRef) {
    let fd = loader.userfault_fd.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    for segment in object.segments.lock().iter() {
        if !segment.target.executable() {
            continue;
        }
        let mut register = UffdioRegister {
            range: UffdioRange {
                start: segment.target.page_start() as u64,
                len: segment.target.page_size() as u64,
            },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        if unsafe { libc::ioctl(fd, UFFDIO_REGISTER, &mut register) } != 0 {
            warn!(
                "registering {:#x} with userfaultfd failed",
                segment.target.page_start()
            );
        }
    }
}

fn monotonic_now() -> u64 {
    let mut time = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_COARSE, &mut time) };
    time.tv_sec as u64 * SECOND_NS + time.tv_nsec as u64
}

extern "C" fn helper_signal(signum: libc::c_int) {
    // Leave only this thread; the process keeps running.
    unsafe {
        libc::syscall(libc::SYS_exit, if signum == libc::SIGTERM { 0 } else { 128 + signum });
    }
}

/// The helper thread body.
fn helper_loop(loader: &'static Loader) {
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = helper_signal;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGTERM, libc::SIGSEGV, libc::SIGILL, libc::SIGABRT].iter() {
            libc::sigaction(*signal, &action, core::ptr::null_mut());
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
            warn!("unable to set helper loop death signal");
        }

        let tid = libc::syscall(libc::SYS_gettid) as i32;
        code_redirect::exclude_thread(tid);
    }

    let inotify_fd = loader.inotify_fd.load(Ordering::Acquire);
    let userfault_fd = loader.userfault_fd.load(Ordering::Acquire);

    let mut fds = [
        libc::pollfd {
            fd: inotify_fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: userfault_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let nfds = if userfault_fd == -1 { 1 } else { 2 };

    // Worklists: (deadline, identity to reload) and (deadline, version to
    // protect), kept sorted by deadline.
    let mut worklist_load: Vec<(u64, IdentityRef)> = Vec::new();
    let mut worklist_protect: Vec<(u64, ObjectRef)> = Vec::new();

    loop {
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), nfds, 1000) };
        if ready < 0 {
            error!("poll of helper loop failed");
            break;
        }
        let now = monotonic_now();
        if ready > 0 && fds[0].revents & libc::POLLIN != 0 {
            detect_modifications(loader, now, &mut worklist_load);
        }
        if ready > 0 && nfds > 1 && fds[1].revents & libc::POLLIN != 0 {
            handle_userfault(loader, userfault_fd);
        }
        if !worklist_load.is_empty() {
            drain_load_worklist(loader, now, &mut worklist_load, &mut worklist_protect);
        }
        if !worklist_protect.is_empty() {
            drain_protect_worklist(loader, now, &mut worklist_protect);
        }
    }
    info!("file helper loop thread ends");
}

/// Reads inotify events and schedules debounced reloads.
fn detect_modifications(loader: &Loader, now: u64, worklist_load: &mut Vec<(u64, IdentityRef)>) {
    let inotify_fd = loader.inotify_fd.load(Ordering::Acquire);
    let mut buffer = [0u8; 4096];
    let length = unsafe {
        libc::read(
            inotify_fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        )
    };
    if length <= 0 {
        return;
    }

    let mut offset = 0usize;
    while offset < length as usize {
        let event = unsafe { &*(buffer.as_ptr().add(offset) as *const libc::inotify_event) };
        offset += core::mem::size_of::<libc::inotify_event>() + event.len as usize;

        let check_all = event.mask & libc::IN_Q_OVERFLOW != 0;
        if check_all {
            warn!("notification event queue overflow, checking all objects");
        }
        if event.wd == -1 && !check_all {
            continue;
        }

        for identity in loader.lookup.read().iter() {
            if check_all {
                schedule_load(worklist_load, now + SECOND_NS, identity);
            } else if event.wd == identity.watch_descriptor.load(Ordering::Acquire) {
                if event.mask & libc::IN_IGNORED != 0 {
                    // The watched inode went away (replaced file): re-arm.
                    if !watch_identity(loader, identity, true) {
                        info!("unable to watch for updates of {:?}", identity);
                    }
                } else {
                    debug!("notification for file modification in {:?}", identity);
                    schedule_load(worklist_load, now + SECOND_NS, identity);
                }
            }
        }
    }
}

/// Inserts or re-arms a pending reload.
fn schedule_load(worklist: &mut Vec<(u64, IdentityRef)>, deadline: u64, identity: &IdentityRef) {
    for entry in worklist.iter_mut() {
        if Arc::ptr_eq(&entry.1, identity) {
            if entry.0 != deadline {
                trace!("re-arming reload of {:?}", identity);
                entry.0 = deadline;
            }
            return;
        }
    }
    worklist.push((deadline, identity.clone()));
}

/// Loads every identity whose debounce deadline expired, then updates the
/// relocations of all loaded objects in one pass.
fn drain_load_worklist(
    loader: &'static Loader,
    now: u64,
    worklist_load: &mut Vec<(u64, IdentityRef)>,
    worklist_protect: &mut Vec<(u64, ObjectRef)>,
) {
    let mut updated = false;
    let _update_guard = loader.update_sync.lock();
    worklist_load.sort_by_key(|entry| entry.0);
    while let Some((deadline, identity)) = worklist_load.first().cloned() {
        if deadline > now {
            break;
        }
        worklist_load.remove(0);
        info!("loading {:?}", identity);
        let (object, info) = load::load_object(loader, &identity, 0);
        loader.status(&identity, info);
        if let Some(object) = object {
            updated = true;
            watch_identity(loader, &identity, false);
            if loader.config.detect_outdated != DetectOutdated::Disabled {
                if let Some(previous) = object.file_previous.clone() {
                    worklist_protect.push((
                        now + loader.config.detect_outdated_delay * SECOND_NS,
                        previous,
                    ));
                }
            }
        } else if info == Info::ErrorOpen || info == Info::ErrorStat {
            // The file may have been replaced rather than rewritten.
            watch_identity(loader, &identity, true);
        }
    }

    if updated {
        let quiesce = if loader.config.stop_on_update {
            Some(crate::update::ProcessQuiescence::stop(unsafe {
                libc::syscall(libc::SYS_gettid) as i32
            }))
        } else {
            None
        };
        if loader.relocate_all(true).is_err() {
            error!("updating relocations failed");
        }
        drop(quiesce);
    }
}

/// Disables the executable pages of retired versions whose grace period
/// expired.
fn drain_protect_worklist(
    loader: &Loader,
    now: u64,
    worklist_protect: &mut Vec<(u64, ObjectRef)>,
) {
    worklist_protect.sort_by_key(|entry| entry.0);
    while let Some((deadline, object)) = worklist_protect.first().cloned() {
        if deadline > now {
            break;
        }
        worklist_protect.remove(0);
        info!("protecting {:?}", object);
        userfault_register(loader, &object);
        if object.disable().is_err() {
            warn!("disabling retired version {:?} failed", object);
        }
    }
}

/// Handles one userfault event: an access to a disabled page of a retired
/// version. The content is copied back as a best-effort compatibility
/// fallback and the incident is reported.
fn handle_userfault(loader: &Loader, userfault_fd: i32) {
    let mut message: UffdMsg = unsafe { core::mem::zeroed() };
    let length = unsafe {
        libc::read(
            userfault_fd,
            &mut message as *mut UffdMsg as *mut libc::c_void,
            core::mem::size_of::<UffdMsg>(),
        )
    };
    if length <= 0 {
        return;
    }
    if message.event != UFFD_EVENT_PAGEFAULT {
        debug!("ignoring userfault event {:#x}", message.event);
        return;
    }
    let address = message.arg[1] as usize;
    debug!("pagefault at {:#x}", address);

    // Find the faulting segment across every version of every object.
    let mut copy: Option<(UffdioCopy, IdentityRef, ObjectRef)> = None;
    for identity in loader.lookup.read().iter() {
        for object in identity.versions() {
            let mut segments = object.segments.lock();
            for segment in segments.iter_mut() {
                if address >= segment.target.page_start() && address < segment.target.page_end() {
                    warn!(
                        "detected reuse of retired memory at {:#x} ({} bytes) in {:?}",
                        segment.target.address(),
                        segment.target.size,
                        object
                    );
                    let source = segment.compose();
                    let source = if source != 0 {
                        source
                    } else {
                        warn!(
                            "no back buffer for {:#x}, copying from file source",
                            segment.target.page_start()
                        );
                        segment.source.file_addr + segment.source.offset
                            - (segment.target.address() - segment.target.page_start())
                    };
                    copy = Some((
                        UffdioCopy {
                            dst: segment.target.page_start() as u64,
                            src: source as u64,
                            len: segment.target.page_size() as u64,
                            mode: 0,
                            copy: 0,
                        },
                        identity.clone(),
                        object.clone(),
                    ));
                    segment.reactivated();
                    break;
                }
            }
            if copy.is_some() {
                break;
            }
        }
        if copy.is_some() {
            break;
        }
    }

    if let Some((mut request, identity, _object)) = copy {
        identity
            .accessed_after_retirement
            .store(true, Ordering::Release);
        loader.status(&identity, Info::FailedReuse);
        loop {
            if unsafe { libc::ioctl(userfault_fd, UFFDIO_COPY, &mut request) } == 0 {
                debug!(
                    "userfault copied {} bytes from {:#x} to {:#x}",
                    request.copy, request.src, request.dst
                );
                break;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN {
                continue;
            }
            error!(
                "userfault copy of {} bytes to {:#x} failed",
                request.len, request.dst
            );
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_metadata::ObjectIdentity;
    use std::path::PathBuf;

    fn identity(name: &str) -> IdentityRef {
        ObjectIdentity::new(
            PathBuf::from(format!("/tmp/{}", name)),
            None,
            object_metadata::NAMESPACE_BASE,
            ObjectFlags::UPDATABLE,
        )
    }

    #[test]
    fn duplicate_events_rearm_the_debounce_timer() {
        let first = identity("liba.so");
        let second = identity("libb.so");
        let mut worklist = Vec::new();

        schedule_load(&mut worklist, 100, &first);
        schedule_load(&mut worklist, 150, &second);
        assert_eq!(worklist.len(), 2);
        assert_eq!(worklist[0].0, 100);

        // A burst of events for the same file pushes its deadline out
        // instead of queueing it twice.
        schedule_load(&mut worklist, 200, &first);
        assert_eq!(worklist.len(), 2);
        let entry = worklist
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.1, &first))
            .unwrap();
        assert_eq!(entry.0, 200);
    }
}
