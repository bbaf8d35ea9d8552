use std::fmt;

use serde::Serialize;

use crate::object::Object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Delete => "delete",
        })
    }
}

/// One committed store mutation. `Clone` is a deep copy; nothing is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventType,
    /// Post-mutation object, or the tombstone for deletes.
    pub object: Object,
    /// Pre-mutation object for updates.
    pub previous: Option<Object>,
}

impl Event {
    pub fn add(object: Object) -> Self { Self { kind: EventType::Add, object, previous: None } }

    pub fn update(object: Object, previous: Object) -> Self {
        Self { kind: EventType::Update, object, previous: Some(previous) }
    }

    pub fn delete(tombstone: Object) -> Self { Self { kind: EventType::Delete, object: tombstone, previous: None } }
}
