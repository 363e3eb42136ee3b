//! Load outcome reporting.

use core::fmt;

/// Closed enumeration of the outcome of one `load` attempt of an identity.
///
/// Everything except [`Info::SuccessLoad`]/[`Info::SuccessUpdate`] leaves
/// the previously current version (if any) in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Info {
    /// Opening the file failed.
    ErrorOpen,
    /// Retrieving the file status failed.
    ErrorStat,
    /// Mapping the whole file into memory failed.
    ErrorMap,
    /// Not able to create the object.
    ErrorCreate,
    /// Unsupported object format.
    ErrorElf,
    /// Not able to watch for file modifications.
    ErrorInotify,
    /// The new version has the same modification time as a loaded one.
    IdenticalTime,
    /// The new version has the same content hash as a loaded one.
    IdenticalHash,
    /// Dynamic updates are disabled for this identity.
    UpdateDisabled,
    /// The new version cannot patch the current one.
    UpdateIncompatible,
    /// Relocated data was altered by the running program.
    UpdateModified,
    /// Preloading (segment/dependency discovery) was unsuccessful.
    FailedPreloading,
    /// Mapping the segments was unsuccessful.
    FailedMapping,
    /// Outdated code of a retired version was used.
    FailedReuse,
    /// Loaded the initial version.
    SuccessLoad,
    /// Updated to a new version.
    SuccessUpdate,
}

impl Info {
    /// Whether the attempt installed a new version.
    pub fn success(&self) -> bool {
        matches!(self, Info::SuccessLoad | Info::SuccessUpdate)
    }
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Info::ErrorOpen => "ERROR (opening file failed)",
            Info::ErrorStat => "ERROR (retrieving file status failed)",
            Info::ErrorMap => "ERROR (mapping whole file into memory failed)",
            Info::ErrorCreate => "ERROR (not able to create object)",
            Info::ErrorElf => "ERROR (unsupported format)",
            Info::ErrorInotify => "ERROR (not able to watch for file modifications)",
            Info::IdenticalTime => "IGNORED (new version has same modification time)",
            Info::IdenticalHash => "IGNORED (new version has same hash)",
            Info::UpdateDisabled => "FAILED (dynamic updates are disabled)",
            Info::UpdateIncompatible => "FAILED (new version is incompatible)",
            Info::UpdateModified => "FAILED (relocated data was altered)",
            Info::FailedPreloading => "FAILED (preload was unsuccessful)",
            Info::FailedMapping => "FAILED (mapping of segments was unsuccessful)",
            Info::FailedReuse => "FAILED (reusing outdated code)",
            Info::SuccessLoad => "SUCCESS (loaded initial version)",
            Info::SuccessUpdate => "SUCCESS (updated to new version)",
        };
        f.write_str(text)
    }
}
