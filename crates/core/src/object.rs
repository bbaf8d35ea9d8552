//! Stored object variants and the tombstone carried by delete events.

use serde::{Deserialize, Serialize};

use crate::condition::Conditions;
use crate::{NamespaceName, ObjectKind, ObjectMeta, ObjectRef, Resource, TypeMeta, VersionKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    #[serde(default)]
    pub project_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    /// Subdirectory of the checkout holding the compose file.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Repository {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<RepositorySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RepositoryStatus>,
}

impl Repository {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: RepositorySpec) -> Self {
        Self { type_meta: TypeMeta::default(), metadata: ObjectMeta::new(namespace, name), spec: Some(spec), status: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_path: String,
    #[serde(default)]
    pub repo: ObjectRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_id: String,
    #[serde(default)]
    pub compose_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    #[serde(default)]
    pub last_applied_commit_id: String,
    #[serde(default)]
    pub container_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Project {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ProjectSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
}

impl Project {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ProjectSpec) -> Self {
        Self { type_meta: TypeMeta::default(), metadata: ObjectMeta::new(namespace, name), spec: Some(spec), status: None }
    }
}

/// Last stored bytes of a deleted object, together with its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenericObject {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl GenericObject {
    /// Re-parse the tombstone bytes into the concrete type.
    pub fn decode<T: Resource>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

macro_rules! impl_resource {
    ($ty:ident) => {
        impl Resource for $ty {
            const KIND: ObjectKind = ObjectKind::$ty;

            fn type_meta(&self) -> &TypeMeta { &self.type_meta }
            fn type_meta_mut(&mut self) -> &mut TypeMeta { &mut self.type_meta }
            fn metadata(&self) -> &ObjectMeta { &self.metadata }
            fn metadata_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }

            fn into_object(self) -> Object { Object::$ty(self) }

            fn from_object(obj: Object) -> Option<Self> {
                match obj {
                    Object::$ty(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_resource!(Repository);
impl_resource!(Project);

/// Every value the store hands out: a typed resource or a delete tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Object {
    Repository(Repository),
    Project(Project),
    Tombstone(GenericObject),
}

impl Object {
    pub fn type_meta(&self) -> &TypeMeta {
        match self {
            Object::Repository(o) => &o.type_meta,
            Object::Project(o) => &o.type_meta,
            Object::Tombstone(o) => &o.type_meta,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Object::Repository(o) => &o.metadata,
            Object::Project(o) => &o.metadata,
            Object::Tombstone(o) => &o.metadata,
        }
    }

    pub fn version_kind(&self) -> VersionKind { self.type_meta().version_kind() }
    pub fn namespace_name(&self) -> NamespaceName { self.metadata().namespace_name() }

    pub fn as_tombstone(&self) -> Option<&GenericObject> {
        match self {
            Object::Tombstone(g) => Some(g),
            _ => None,
        }
    }

    /// Typed view of the object. Tombstones are decoded from their bytes.
    pub fn to_resource<T: Resource>(&self) -> Option<T> {
        match self {
            Object::Tombstone(g) => g.decode().ok(),
            other => T::from_object(other.clone()),
        }
    }
}
