//! Identity Map: one live instance per (type, identifier) within a scope.
//!
//! A session installs a map for the duration of one top-level operation.
//! Every row that resolves to the same entity type and identifier, whether
//! it comes from the main query or from an association reached along the
//! way, yields the same [`EntityRef`]. This keeps instances unique and stops
//! the traversal of cyclic graphs such as `User.phones` / `Phone.owner`.
//!
//! Integer identifiers compare by value regardless of width, so a key read
//! back as `BigInt` finds an entry stored under `Int`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use relmodel_core::Value;

use crate::model::Model;
use crate::related::EntityRef;

/// Hash an identifier so that every integer width lands in the same bucket.
fn hash_id(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_single_value(value, &mut hasher);
    hasher.finish()
}

fn hash_single_value(v: &Value, hasher: &mut impl Hasher) {
    if let Some(i) = v.as_integer_key() {
        2u8.hash(hasher);
        i.hash(hasher);
        return;
    }
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Float(f) => {
            6u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Double(f) => {
            7u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Text(s) => {
            9u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            10u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Json(j) => {
            16u8.hash(hasher);
            j.to_string().hash(hasher);
        }
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {}
    }
}

/// A type-erased entry. `entity` holds an `EntityRef<T>` for the `T` of
/// the bucket's `TypeId`.
struct IdentityEntry {
    id: Value,
    entity: Box<dyn Any + Send + Sync>,
}

/// Map from (entity type, identifier) to the live instance.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<(TypeId, u64), Vec<IdentityEntry>>,
    len: usize,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance registered for `id`, if any.
    pub fn get<T: Model>(&self, id: &Value) -> Option<EntityRef<T>> {
        self.entries
            .get(&(TypeId::of::<T>(), hash_id(id)))?
            .iter()
            .find(|entry| entry.id.same_identity(id))?
            .entity
            .downcast_ref::<EntityRef<T>>()
            .cloned()
    }

    pub fn contains<T: Model>(&self, id: &Value) -> bool {
        self.get::<T>(id).is_some()
    }

    /// Register `entity` under `id`.
    ///
    /// If an instance is already registered for the same key it is returned
    /// unchanged and `entity` is dropped; otherwise `entity` is stored and
    /// handed back.
    pub fn insert<T: Model>(&mut self, id: Value, entity: EntityRef<T>) -> EntityRef<T> {
        if let Some(existing) = self.get::<T>(&id) {
            return existing;
        }
        let stored: Box<dyn Any + Send + Sync> = Box::new(entity.clone());
        self.entries
            .entry((TypeId::of::<T>(), hash_id(&id)))
            .or_default()
            .push(IdentityEntry { id, entity: stored });
        self.len += 1;
        entity
    }

    /// Drop the entry for `id`. Returns whether one was present.
    pub fn remove<T: Model>(&mut self, id: &Value) -> bool {
        let key = (TypeId::of::<T>(), hash_id(id));
        let Some(bucket) = self.entries.get_mut(&key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|entry| !entry.id.same_identity(id));
        let removed = before - bucket.len();
        if bucket.is_empty() {
            self.entries.remove(&key);
        }
        self.len -= removed;
        removed > 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Role, User};

    fn user(id: i64, name: &str) -> EntityRef<User> {
        EntityRef::new(User {
            id: Some(id),
            name: name.to_string(),
            ..User::default()
        })
    }

    #[test]
    fn test_insert_and_get_same_instance() {
        let mut map = IdentityMap::new();
        let stored = map.insert(Value::BigInt(1), user(1, "Alice"));
        let found = map.get::<User>(&Value::BigInt(1)).unwrap();
        assert!(stored.ptr_eq(&found));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_insert_existing_returns_first_instance() {
        let mut map = IdentityMap::new();
        let first = map.insert(Value::BigInt(1), user(1, "Alice"));
        let second = map.insert(Value::BigInt(1), user(1, "Changed"));
        assert!(first.ptr_eq(&second));
        assert_eq!(second.read().name, "Alice");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_modifications_visible() {
        let mut map = IdentityMap::new();
        let stored = map.insert(Value::BigInt(1), user(1, "Alice"));
        stored.write().name = "Bob".to_string();
        let found = map.get::<User>(&Value::BigInt(1)).unwrap();
        assert_eq!(found.read().name, "Bob");
    }

    #[test]
    fn test_integer_widths_share_identity() {
        let mut map = IdentityMap::new();
        map.insert(Value::Int(7), user(7, "Seven"));
        assert!(map.contains::<User>(&Value::BigInt(7)));
        assert!(map.contains::<User>(&Value::SmallInt(7)));
        assert!(!map.contains::<User>(&Value::Text("7".into())));
    }

    #[test]
    fn test_different_types_same_id() {
        let mut map = IdentityMap::new();
        map.insert(Value::BigInt(1), user(1, "Alice"));
        assert!(map.get::<Role>(&Value::BigInt(1)).is_none());
        map.insert(
            Value::BigInt(1),
            EntityRef::new(Role {
                id: Some(1),
                name: "admin".into(),
                ..Role::default()
            }),
        );
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = IdentityMap::new();
        map.insert(Value::BigInt(1), user(1, "a"));
        map.insert(Value::BigInt(2), user(2, "b"));
        assert!(map.remove::<User>(&Value::BigInt(1)));
        assert!(!map.remove::<User>(&Value::BigInt(1)));
        assert_eq!(map.len(), 1);
        map.clear();
        assert!(map.is_empty());
        assert!(map.get::<User>(&Value::BigInt(2)).is_none());
    }

    #[test]
    fn test_text_ids() {
        let mut map = IdentityMap::new();
        map.insert(Value::Text("abc".into()), user(0, "t"));
        assert!(map.contains::<User>(&Value::Text("abc".into())));
        assert!(!map.contains::<User>(&Value::Text("abd".into())));
    }
}
