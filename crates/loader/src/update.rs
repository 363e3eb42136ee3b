//! The update cascade: re-pointing references after a new version landed.

use binary_hash::ChangeKind;
use log::{debug, info, trace, warn};
use object_metadata::{IdentityRef, ObjectFlags, ObjectRef};
use relocate_x86_64::Relocator;

use crate::{prepare, Loader, UpdateMode};

/// Replays the provenance logs of every version of `identity`: entries
/// bound to an object that is no longer the newest version of its file are
/// re-resolved and their sites rewritten.
///
/// Only the newest version of `identity` rewrites data-section sites;
/// outdated versions share their data pages with the newest one and are
/// only touched when `UPDATE_OUTDATED` asks for it.
pub fn update_identity(loader: &Loader, identity: &IdentityRef) {
    let update_outdated = identity.flag(ObjectFlags::UPDATE_OUTDATED);
    for object in identity.versions() {
        debug!("updating relocations of {:?}", object);
        update_object(loader, &object);
        if !update_outdated {
            break;
        }
    }

    if loader.config.update_mode >= UpdateMode::CodeRel {
        if let Some(current) = identity.current() {
            install_redirections(&current);
        }
    }
}

/// Rewrites the provenance entries of one version that point into outdated
/// code.
fn update_object(loader: &Loader, object: &ObjectRef) {
    let is_latest = object.is_latest_version();
    let stale: Vec<relocate_x86_64::Relocation> = {
        let log = object.relocations.lock();
        log.iter()
            .filter(|(relocation, definition)| {
                if definition.object.is_latest_version() {
                    return false;
                }
                // Data sites of outdated versions are handled by the newest
                // version, which owns the shared data pages.
                let relocator = Relocator::new(relocation, object.global_offset_table as u64);
                is_latest || !object.in_writable_segment(relocator.address(object.base))
            })
            .map(|(relocation, _)| *relocation)
            .collect()
    };

    for relocation in stale {
        let fix = !object
            .identity()
            .map(|identity| identity.flag(ObjectFlags::BIND_NOT))
            .unwrap_or(false);
        if let Err(message) = prepare::relocate_one(loader, object, &relocation, fix) {
            warn!(
                "re-relocating site {:#x} of {:?} failed: {}",
                relocation.offset, object, message
            );
        }
    }
}

/// Installs trap redirections from every changed function of the outdated
/// versions to its replacement in `current`. Covers callers that reach the
/// old code without going through the PLT (direct calls, stale function
/// pointers).
fn install_redirections(current: &ObjectRef) {
    let new_hash = match &current.binary_hash {
        Some(hash) => hash,
        None => return,
    };

    let mut previous = current.file_previous.clone();
    while let Some(old) = previous {
        if let Some(old_hash) = &old.binary_hash {
            for change in new_hash.diff(old_hash) {
                if !change.function || change.kind != ChangeKind::Changed {
                    continue;
                }
                let (old_value, new_value) = match (change.old_value, change.new_value) {
                    (Some(old_value), Some(new_value)) => (old_value, new_value),
                    _ => continue,
                };
                let from = old.base + old_value as usize;
                let to = current.base + new_value as usize;
                let size = change.old_size.unwrap_or(0) as usize;
                match code_redirect::add(&old, from, to, size, size > 0) {
                    Ok(()) => info!(
                        "redirecting {} in {:?} at {:#x} to {:#x}",
                        change.name, old, from, to
                    ),
                    Err(message) => warn!(
                        "redirect of {} in {:?} at {:#x} failed: {}",
                        change.name, old, from, message
                    ),
                }
            }
        }
        previous = old.file_previous.clone();
    }
}

/// Stops every other task of the process around instruction patching, for
/// CPUs that require a serializing event before executing modified code.
pub struct ProcessQuiescence {
    stopped: Vec<i32>,
}

impl ProcessQuiescence {
    /// Sends SIGSTOP to every task except the caller and the helper thread.
    pub fn stop(helper_tid: i32) -> ProcessQuiescence {
        let own = unsafe { libc::syscall(libc::SYS_gettid) as i32 };
        let mut stopped = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/proc/self/task") {
            for entry in entries.flatten() {
                if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
                    if tid != own && tid != helper_tid {
                        unsafe {
                            libc::syscall(
                                libc::SYS_tgkill,
                                libc::getpid(),
                                tid,
                                libc::SIGSTOP,
                            );
                        }
                        stopped.push(tid);
                    }
                }
            }
        }
        trace!("stopped {} tasks for code modification", stopped.len());
        ProcessQuiescence { stopped }
    }
}

impl Drop for ProcessQuiescence {
    fn drop(&mut self) {
        for tid in &self.stopped {
            unsafe {
                libc::syscall(libc::SYS_tgkill, libc::getpid(), *tid, libc::SIGCONT);
            }
        }
    }
}
