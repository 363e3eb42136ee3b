//! Metadata of loaded objects.
//!
//! ## Identities and versions
//! An [`ObjectIdentity`] is a file-level entity with a stable name: one per
//! normalized path. The successive loaded instances of that file's bytes are
//! [`Object`] versions, linked newest-first through
//! [`Object::file_previous`]; the identity points at the newest version.
//! Identities live until process exit (there is no reference counting of
//! identities, only of the version objects hanging off them).
//!
//! ## Symbols
//! A [`VersionedSymbol`] is a lookup request (name, precomputed hashes,
//! required version); a [`SymbolDefinition`] is a successful resolution
//! carrying the defining object. Every externally-resolved relocation is
//! remembered as a `(Relocation, SymbolDefinition)` pair in the owning
//! object's provenance log, which is what the update cascade replays when a
//! new version of the defining file is installed.

mod identity;
mod info;
mod object;
mod symbol;

pub use identity::{IdentityRef, Namespace, ObjectFlags, ObjectIdentity, NAMESPACE_BASE, NAMESPACE_NEW};
pub use info::Info;
pub use object::{Object, ObjectData, ObjectKind, ObjectRef, ObjectStatus};
pub use symbol::{SymbolDefinition, SymbolVersion, VersionedSymbol};

#[cfg(test)]
mod test;
