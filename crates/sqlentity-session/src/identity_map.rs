//! Identity Map: one live instance per (entity type, identifier).
//!
//! Within a unit of work each persisted row corresponds to exactly one
//! [`EntityRef`]. Looking an identifier up twice returns the same handle, so
//! changes made through one reference are visible through every other.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let author = EntityRef::new(Author::new(1, "Ada"));
//! map.register("Author", Value::BigInt(1), author.clone())?;
//!
//! // Integer widths are normalized, so an `Int` key finds a `BigInt` entry.
//! assert_eq!(map.find("Author", &Value::Int(1)), Some(author));
//! ```

use indexmap::IndexMap;
use sqlentity_core::error::EntityErrorKind;
use sqlentity_core::{EntityRef, Error, Result, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Identity-map key: entity type plus normalized identifier.
#[derive(Debug, Clone)]
pub struct ObjectKey {
    pub entity_type: &'static str,
    pub id: Value,
}

impl ObjectKey {
    pub fn new(entity_type: &'static str, id: Value) -> Self {
        Self {
            entity_type,
            id: normalize(id),
        }
    }
}

/// Integer identifiers compare equal whatever their width.
fn normalize(id: Value) -> Value {
    match id {
        Value::TinyInt(v) => Value::BigInt(i64::from(v)),
        Value::SmallInt(v) => Value::BigInt(i64::from(v)),
        Value::Int(v) => Value::BigInt(i64::from(v)),
        other => other,
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && self.id == other.id
    }
}

// Identifiers are never NaN floats, so value equality is total for keys.
impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_type.hash(state);
        hash_single_value(&self.id, state);
    }
}

/// Hash a single Value into the hasher.
fn hash_single_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::TinyInt(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::SmallInt(i) => {
            3u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Int(i) => {
            4u8.hash(hasher);
            i.hash(hasher);
        }
        Value::BigInt(i) => {
            5u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Float(f) => {
            6u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Double(f) => {
            7u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            8u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            9u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            10u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            11u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Time(t) => {
            12u8.hash(hasher);
            t.hash(hasher);
        }
        Value::Timestamp(ts) => {
            13u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::TimestampTz(ts) => {
            14u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            15u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            16u8.hash(hasher);
            j.to_string().hash(hasher);
        }
        Value::Array(arr) => {
            17u8.hash(hasher);
            arr.len().hash(hasher);
            for item in arr {
                hash_single_value(item, hasher);
            }
        }
        Value::Default => {
            18u8.hash(hasher);
        }
    }
}

/// Map from [`ObjectKey`] to the live instance, with a reverse index from
/// handle to key. Iteration follows registration order.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: IndexMap<ObjectKey, EntityRef>,
    keys: HashMap<EntityRef, ObjectKey>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, entity_type: &'static str, id: &Value) -> Option<EntityRef> {
        if id.is_null() {
            return None;
        }
        self.entries
            .get(&ObjectKey::new(entity_type, id.clone()))
            .cloned()
    }

    /// Register `entity` under its key.
    ///
    /// Registering the handle that already occupies the key is a no-op. A
    /// different live instance under the same key is an
    /// [`IdentityConflict`](EntityErrorKind::IdentityConflict).
    pub fn register(
        &mut self,
        entity_type: &'static str,
        id: Value,
        entity: EntityRef,
    ) -> Result<()> {
        if id.is_null() {
            return Err(Error::entity(
                EntityErrorKind::MissingIdentifier,
                entity_type,
                format!("cannot register {entity_type} without an identifier"),
            ));
        }
        let key = ObjectKey::new(entity_type, id);
        if let Some(existing) = self.entries.get(&key) {
            if existing.ptr_eq(&entity) {
                return Ok(());
            }
            return Err(Error::entity(
                EntityErrorKind::IdentityConflict,
                entity_type,
                format!(
                    "another {entity_type} instance with identifier {:?} is already managed",
                    key.id
                ),
            ));
        }
        // A handle re-registered under a new identifier drops its old key.
        if let Some(previous) = self.keys.remove(&entity) {
            self.entries.shift_remove(&previous);
        }
        tracing::trace!(entity = entity_type, id = ?key.id, "Registered in identity map");
        self.keys.insert(entity.clone(), key.clone());
        self.entries.insert(key, entity);
        Ok(())
    }

    /// Remove the entry for `entity`, whichever key it is under.
    pub fn forget(&mut self, entity: &EntityRef) -> Option<ObjectKey> {
        let key = self.keys.remove(entity)?;
        self.entries.shift_remove(&key);
        Some(key)
    }

    pub fn contains_ref(&self, entity: &EntityRef) -> bool {
        self.keys.contains_key(entity)
    }

    pub fn key_of(&self, entity: &EntityRef) -> Option<&ObjectKey> {
        self.keys.get(entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.keys.clear();
    }

    /// Every registered handle, in registration order.
    pub fn handles(&self) -> Vec<EntityRef> {
        self.entries.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &EntityRef)> {
        self.entries.iter()
    }
}
