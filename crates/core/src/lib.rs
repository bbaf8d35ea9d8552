//! Recoon core types: object identity, resources, store events and errors.

#![forbid(unsafe_code)]

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod object;

pub use condition::{Condition, ConditionType, Conditions};
pub use config::Config;
pub use error::StoreError;
pub use event::{Event, EventType};
pub use object::{
    GenericObject, Object, Project, ProjectSpec, ProjectStatus, Repository, RepositorySpec,
    RepositoryStatus,
};

/// Separator used in bucket and object keys. Never allowed inside a name or namespace.
pub const KEY_SEPARATOR: char = '/';

pub const DEFAULT_NAMESPACE: &str = "default";
pub const SYSTEM_NAMESPACE: &str = "recoon-system";
pub const CONFIG_REPO_NAME: &str = "config-repo";
pub const PROJECT_NAMESPACE_PREFIX: &str = "project-";

/// Namespace holding the `Project` derived from a repository's project name.
pub fn project_namespace(project_name: &str) -> String {
    format!("{PROJECT_NAMESPACE_PREFIX}{project_name}")
}

/// Registered type identity of an object, rendered as `version/kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct VersionKind {
    pub version: String,
    pub kind: String,
}

impl VersionKind {
    pub fn new(version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { version: version.into(), kind: kind.into() }
    }

    pub fn is_empty(&self) -> bool { self.version.is_empty() || self.kind.is_empty() }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.version, KEY_SEPARATOR, self.kind)
    }
}

/// Unique identity of an object within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NamespaceName {
    pub namespace: String,
    pub name: String,
}

impl NamespaceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TypeMeta {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl TypeMeta {
    pub fn version_kind(&self) -> VersionKind { VersionKind::new(&self.version, &self.kind) }

    pub fn set_version_kind(&mut self, vk: &VersionKind) {
        self.version = vk.version.clone();
        self.kind = vk.kind.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: i64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), resource_version: 0 }
    }

    pub fn namespace_name(&self) -> NamespaceName {
        NamespaceName::new(&self.namespace, &self.name)
    }
}

/// Typed pointer from one object to another (a project's repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectRef {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn to<T: Resource>(obj: &T) -> Self {
        Self {
            type_meta: obj.type_meta().clone(),
            namespace: obj.metadata().namespace.clone(),
            name: obj.metadata().name.clone(),
        }
    }

    pub fn namespace_name(&self) -> NamespaceName { NamespaceName::new(&self.namespace, &self.name) }
}

/// Closed set of object kinds the store knows how to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Repository,
    Project,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 2] = [ObjectKind::Repository, ObjectKind::Project];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Repository => "Repository",
            ObjectKind::Project => "Project",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Typed access to one variant of [`Object`].
pub trait Resource: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ObjectKind;

    fn type_meta(&self) -> &TypeMeta;
    fn type_meta_mut(&mut self) -> &mut TypeMeta;
    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn into_object(self) -> Object;
    /// Returns `None` when the object is a different variant.
    fn from_object(obj: Object) -> Option<Self>;

    fn namespace_name(&self) -> NamespaceName { self.metadata().namespace_name() }
}

pub mod prelude {
    pub use super::{
        Condition, ConditionType, Conditions, Event, EventType, GenericObject, NamespaceName,
        Object, ObjectKind, ObjectMeta, ObjectRef, Project, ProjectSpec, ProjectStatus,
        Repository, RepositorySpec, RepositoryStatus, Resource, StoreError, TypeMeta,
        VersionKind,
    };
}
