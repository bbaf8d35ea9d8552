//! Recoon schema: the kind <-> version/kind registry and compose manifest validation.

#![forbid(unsafe_code)]

use recoon_core::{Object, ObjectKind, Project, Repository, Resource, VersionKind};
use rustc_hash::FxHashMap;
use thiserror::Error;

pub mod compose;

/// Static identity table for every object variant.
pub const BUILTIN: &[(ObjectKind, &str, &str)] = &[
    (ObjectKind::Repository, "v1", "Repository"),
    (ObjectKind::Project, "v1", "Project"),
];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("decoding {vk}: {source}")]
    Decode { vk: VersionKind, #[source] source: serde_json::Error },
}

/// Bidirectional mapping between object kinds and their registered identity.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    by_kind: FxHashMap<ObjectKind, VersionKind>,
    by_vk: FxHashMap<VersionKind, ObjectKind>,
}

impl Schema {
    pub fn new() -> Self { Self::default() }

    /// Registry holding every entry of [`BUILTIN`].
    pub fn builtin() -> Self {
        let mut s = Self::new();
        for (kind, version, name) in BUILTIN {
            s.register(*kind, VersionKind::new(*version, *name));
        }
        s
    }

    /// Startup-only. Panics on an empty identity or a duplicate registration.
    pub fn register(&mut self, kind: ObjectKind, vk: VersionKind) {
        assert!(!vk.is_empty(), "schema: empty version/kind for {kind}");
        assert!(!self.by_kind.contains_key(&kind), "schema: {kind} registered twice");
        assert!(!self.by_vk.contains_key(&vk), "schema: {vk} registered twice");
        self.by_vk.insert(vk.clone(), kind);
        self.by_kind.insert(kind, vk);
    }

    pub fn version_kind(&self, kind: ObjectKind) -> Result<VersionKind, SchemaError> {
        self.by_kind.get(&kind).cloned().ok_or_else(|| SchemaError::UnknownType(kind.to_string()))
    }

    pub fn version_kind_of<T: Resource>(&self) -> Result<VersionKind, SchemaError> { self.version_kind(T::KIND) }

    pub fn kind_of(&self, vk: &VersionKind) -> Result<ObjectKind, SchemaError> {
        self.by_vk.get(vk).copied().ok_or_else(|| SchemaError::UnknownType(vk.to_string()))
    }

    /// Kinds with no registration; empty for a complete registry.
    pub fn missing(&self) -> Vec<ObjectKind> {
        ObjectKind::ALL.iter().copied().filter(|k| !self.by_kind.contains_key(k)).collect()
    }

    /// Decode stored bytes into the variant registered for `vk`.
    pub fn decode(&self, vk: &VersionKind, bytes: &[u8]) -> Result<Object, SchemaError> {
        let decode_err = |source| SchemaError::Decode { vk: vk.clone(), source };
        match self.kind_of(vk)? {
            ObjectKind::Repository => serde_json::from_slice::<Repository>(bytes).map(Object::Repository).map_err(decode_err),
            ObjectKind::Project => serde_json::from_slice::<Project>(bytes).map(Object::Project).map_err(decode_err),
        }
    }
}
