//! Symbol resolution scopes.

use object_metadata::{IdentityRef, Namespace, ObjectFlags, SymbolDefinition, SymbolVersion};

use crate::Loader;

/// Candidate order of a symbol lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Global scope, then the caller's dependencies, then the caller.
    Default,
    /// Skip every object up to and including the requesting one.
    AfterObject,
    /// Like [`ResolveMode::Default`] but never match the requesting object
    /// (copy relocations).
    ExceptObject,
    /// The requesting object first (deep binding).
    ObjectFirst,
    /// Only the caller and the global scope.
    NoDependencies,
}

impl Loader {
    /// Finds a definition for `name` within the namespace, walking
    /// candidates in the order the `mode` dictates. A strong match wins
    /// immediately; the first weak match is kept as fallback (gated by
    /// `config.dynamic_weak`).
    pub fn resolve_symbol(
        &self,
        name: &str,
        version: Option<&SymbolVersion>,
        ns: Namespace,
        requesting: Option<&IdentityRef>,
        mode: ResolveMode,
    ) -> Option<SymbolDefinition> {
        debug_assert!(requesting.is_some() || mode == ResolveMode::Default);
        let hash = elf_image::elf_hash(name);
        let gnu_hash = elf_image::gnu_hash(name);
        let any = SymbolVersion::any();
        let version = version.unwrap_or(&any);
        let dynamic_weak = self.config.dynamic_weak;
        let mut best: Option<SymbolDefinition> = None;

        let same = |a: &IdentityRef, b: &IdentityRef| std::sync::Arc::ptr_eq(a, b);

        // Deep binding: the requesting object shadows the global scope.
        if mode == ResolveMode::ObjectFirst {
            if let Some(current) = requesting.and_then(|identity| identity.current()) {
                if current.has_symbol(name, hash, gnu_hash, version, dynamic_weak, &mut best) {
                    return best;
                }
            }
        }

        // Global scope: objects with global binding, in load order.
        let mut after = mode == ResolveMode::AfterObject;
        for identity in self.lookup.read().iter() {
            if identity.ns != ns || !identity.flag(ObjectFlags::BIND_GLOBAL) {
                continue;
            }
            let current = match identity.current() {
                Some(current) => current,
                None => continue,
            };
            if after {
                if requesting.map(|requesting| same(requesting, identity)) == Some(true) {
                    after = false;
                }
            } else if mode != ResolveMode::ExceptObject
                || requesting.map(|requesting| same(requesting, identity)) != Some(true)
            {
                if current.has_symbol(name, hash, gnu_hash, version, dynamic_weak, &mut best) {
                    return best;
                }
            }
        }

        if let Some(requesting) = requesting {
            // The caller's direct dependencies.
            if mode != ResolveMode::NoDependencies {
                if let Some(current) = requesting.current() {
                    let dependencies = current.dependencies.lock().clone();
                    for dependency in dependencies {
                        if mode != ResolveMode::AfterObject
                            && dependency.ns == ns
                            && dependency.flag(ObjectFlags::BIND_GLOBAL)
                        {
                            // Already visited in the global scope.
                            continue;
                        }
                        if mode == ResolveMode::ExceptObject && same(requesting, &dependency) {
                            continue;
                        }
                        if let Some(target) = dependency.current() {
                            if target.has_symbol(
                                name,
                                hash,
                                gnu_hash,
                                version,
                                dynamic_weak,
                                &mut best,
                            ) {
                                return best;
                            }
                        }
                    }
                }
            }
            // The caller itself, unless it was first in line already.
            if mode != ResolveMode::ObjectFirst && mode != ResolveMode::ExceptObject {
                if let Some(current) = requesting.current() {
                    if current.has_symbol(name, hash, gnu_hash, version, dynamic_weak, &mut best) {
                        return best;
                    }
                }
            }
        }

        // Fall back to the first weak definition found along the way.
        best
    }
}
