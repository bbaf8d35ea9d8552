//! Recoon store: typed, versioned objects with optimistic concurrency.
//!
//! Every committed mutation emits exactly one [`Event`] on a bounded channel.
//! A full channel blocks the writer after its write has been persisted; this
//! is the store's only backpressure.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use recoon_core::{
    Event, GenericObject, NamespaceName, ObjectKind, Resource, StoreError, VersionKind, KEY_SEPARATOR,
};
use recoon_persist::SqliteKv;
use recoon_schema::{Schema, SchemaError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Restricts a list to keys starting with `namespace/` and then `name_prefix`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub name_prefix: Option<String>,
}

impl ListOptions {
    pub fn all() -> Self { Self::default() }

    pub fn in_namespace(ns: impl Into<String>) -> Self { Self { namespace: Some(ns.into()), name_prefix: None } }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn key_prefix(&self) -> String {
        let mut p = String::new();
        if let Some(ns) = &self.namespace {
            p.push_str(ns);
            p.push(KEY_SEPARATOR);
        }
        if let Some(n) = &self.name_prefix {
            p.push_str(n);
        }
        p
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    kv: SqliteKv,
    schema: Schema,
    events: mpsc::Sender<Event>,
    // Held across commit and send so events leave in commit order.
    write_order: Mutex<()>,
}

fn schema_err(e: SchemaError) -> StoreError {
    match e {
        SchemaError::UnknownType(t) => StoreError::UnknownType(t),
        SchemaError::Decode { source, .. } => StoreError::Codec(source),
    }
}

pub fn validate(nn: &NamespaceName) -> Result<(), StoreError> {
    if nn.name.is_empty() {
        return Err(StoreError::NameEmpty);
    }
    if nn.namespace.is_empty() {
        return Err(StoreError::NamespaceEmpty);
    }
    if nn.name.contains(KEY_SEPARATOR) || nn.namespace.contains(KEY_SEPARATOR) {
        return Err(StoreError::Invalid(format!("{nn}: name and namespace must not contain '{KEY_SEPARATOR}'")));
    }
    Ok(())
}

impl Store {
    /// Fails when the schema lacks a registration for any object kind.
    pub fn open(kv: SqliteKv, schema: Schema, event_capacity: usize) -> Result<(Store, mpsc::Receiver<Event>), StoreError> {
        if let Some(kind) = schema.missing().first() {
            return Err(StoreError::UnknownType(kind.to_string()));
        }
        let (tx, rx) = mpsc::channel(event_capacity.max(1));
        let inner = Inner { kv, schema, events: tx, write_order: Mutex::new(()) };
        Ok((Store { inner: Arc::new(inner) }, rx))
    }

    pub fn schema(&self) -> &Schema { &self.inner.schema }

    pub fn version_kind<T: Resource>(&self) -> Result<VersionKind, StoreError> {
        self.inner.schema.version_kind_of::<T>().map_err(schema_err)
    }

    /// Create the partition for `kind` if missing, so lists return empty instead of NotFound.
    pub fn ensure_partition(&self, kind: ObjectKind) -> Result<(), StoreError> {
        let bucket = self.inner.schema.version_kind(kind).map_err(schema_err)?.to_string();
        self.inner.kv.write(|tx| -> Result<(), StoreError> { Ok(tx.create_bucket(&bucket)?) })
    }

    pub async fn create<T: Resource>(&self, mut obj: T) -> Result<T, StoreError> {
        let started = Instant::now();
        let nn = obj.namespace_name();
        validate(&nn)?;
        let vk = self.version_kind::<T>()?;
        obj.type_meta_mut().set_version_kind(&vk);
        obj.metadata_mut().resource_version = 0;
        let bucket = vk.to_string();
        let key = nn.to_string();
        let data = serde_json::to_vec(&obj)?;

        let _order = self.inner.write_order.lock().await;
        self.inner.kv.write(|tx| -> Result<(), StoreError> {
            tx.create_bucket(&bucket)?;
            if tx.get(&bucket, &key)?.is_some() {
                return Err(StoreError::AlreadyExists(format!("{vk} {nn}")));
            }
            tx.put(&bucket, &key, &data)?;
            Ok(())
        })?;
        counter!("store_create_total", 1u64);
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(vk = %vk, object = %nn, "store: created");
        self.emit(Event::add(obj.clone().into_object())).await;
        Ok(obj)
    }

    pub fn get<T: Resource>(&self, nn: &NamespaceName) -> Result<T, StoreError> {
        let vk = self.version_kind::<T>()?;
        let bucket = vk.to_string();
        let key = nn.to_string();
        let data = self.inner.kv.read(|tx| -> Result<Option<Vec<u8>>, StoreError> {
            if !tx.bucket_exists(&bucket)? {
                return Ok(None);
            }
            Ok(tx.get(&bucket, &key)?)
        })?;
        match data {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(format!("{vk} {nn}"))),
        }
    }

    /// Succeeds only when `obj` carries the stored resource version; bumps it by one.
    pub async fn update<T: Resource>(&self, mut obj: T) -> Result<T, StoreError> {
        let started = Instant::now();
        let nn = obj.namespace_name();
        validate(&nn)?;
        let vk = self.version_kind::<T>()?;
        let bucket = vk.to_string();
        let key = nn.to_string();
        obj.type_meta_mut().set_version_kind(&vk);

        let _order = self.inner.write_order.lock().await;
        let previous = self.inner.kv.write(|tx| -> Result<T, StoreError> {
            let stored = match tx.bucket_exists(&bucket)? {
                true => tx.get(&bucket, &key)?,
                false => None,
            };
            let Some(stored) = stored else {
                return Err(StoreError::NotFound(format!("{vk} {nn}")));
            };
            let previous: T = serde_json::from_slice(&stored)?;
            let current = previous.metadata().resource_version;
            if current != obj.metadata().resource_version {
                return Err(StoreError::ObjectChanged(format!(
                    "{vk} {nn}: have {}, stored {current}",
                    obj.metadata().resource_version
                )));
            }
            obj.metadata_mut().resource_version = current + 1;
            tx.put(&bucket, &key, &serde_json::to_vec(&obj)?)?;
            Ok(previous)
        });
        let previous = match previous {
            Ok(p) => p,
            Err(e) => {
                if e.is_conflict() {
                    counter!("store_update_conflict_total", 1u64);
                }
                return Err(e);
            }
        };
        counter!("store_update_total", 1u64);
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(vk = %vk, object = %nn, rv = obj.metadata().resource_version, "store: updated");
        self.emit(Event::update(obj.clone().into_object(), previous.into_object())).await;
        Ok(obj)
    }

    /// Removing an absent object is a no-op and emits nothing.
    pub async fn delete(&self, vk: &VersionKind, nn: &NamespaceName) -> Result<(), StoreError> {
        let started = Instant::now();
        self.inner.schema.kind_of(vk).map_err(schema_err)?;
        let bucket = vk.to_string();
        let key = nn.to_string();

        let _order = self.inner.write_order.lock().await;
        let removed = self.inner.kv.write(|tx| -> Result<Option<Vec<u8>>, StoreError> {
            if !tx.bucket_exists(&bucket)? {
                return Ok(None);
            }
            let Some(bytes) = tx.get(&bucket, &key)? else {
                return Ok(None);
            };
            tx.delete(&bucket, &key)?;
            Ok(Some(bytes))
        })?;
        let Some(data) = removed else {
            debug!(vk = %vk, object = %nn, "store: delete of absent object");
            return Ok(());
        };
        let mut tombstone: GenericObject = serde_json::from_slice(&data)?;
        tombstone.data = data;
        counter!("store_delete_total", 1u64);
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(vk = %vk, object = %nn, "store: deleted");
        self.emit(Event::delete(recoon_core::Object::Tombstone(tombstone))).await;
        Ok(())
    }

    pub async fn delete_of<T: Resource>(&self, nn: &NamespaceName) -> Result<(), StoreError> {
        let vk = self.version_kind::<T>()?;
        self.delete(&vk, nn).await
    }

    /// NotFound when no object of this kind was ever created.
    pub fn list<T: Resource>(&self, opts: &ListOptions) -> Result<Vec<T>, StoreError> {
        let vk = self.version_kind::<T>()?;
        let bucket = vk.to_string();
        let prefix = opts.key_prefix();
        let rows = self.inner.kv.read(|tx| -> Result<Option<Vec<(String, Vec<u8>)>>, StoreError> {
            if !tx.bucket_exists(&bucket)? {
                return Ok(None);
            }
            Ok(Some(tx.scan_prefix(&bucket, &prefix)?))
        })?;
        let Some(rows) = rows else {
            return Err(StoreError::NotFound(vk.to_string()));
        };
        rows.iter().map(|(_, bytes)| serde_json::from_slice(bytes).map_err(StoreError::from)).collect()
    }

    /// Like [`Store::list`] but an absent partition is an empty list.
    pub fn list_or_empty<T: Resource>(&self, opts: &ListOptions) -> Result<Vec<T>, StoreError> {
        match self.list(opts) {
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn emit(&self, ev: Event) {
        let vk = ev.object.version_kind();
        if self.inner.events.send(ev).await.is_err() {
            warn!(vk = %vk, "store: event receiver gone; event not delivered");
        }
    }
}
