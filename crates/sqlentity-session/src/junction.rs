//! Pending many-to-many link changes.
//!
//! Changes are keyed by owner handle rather than owner identifier: an owner
//! whose identifier is generated by the database has none until it has been
//! inserted. Identifiers are read when the flush executes the operations.

use indexmap::{IndexMap, IndexSet};
use sqlentity_core::{EntityRef, JunctionTable};

/// One owner's side of one junction table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JunctionKey {
    pub junction: JunctionTable,
    pub owner: EntityRef,
    /// The owning collection field on the owner
    pub field: &'static str,
}

impl JunctionKey {
    pub fn new(junction: JunctionTable, owner: &EntityRef, field: &'static str) -> Self {
        Self {
            junction,
            owner: owner.clone(),
            field,
        }
    }
}

/// Elements to link and unlink for one key.
#[derive(Debug, Clone, Default)]
pub struct JunctionChanges {
    pub inserts: IndexSet<EntityRef>,
    pub deletes: IndexSet<EntityRef>,
}

impl JunctionChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct JunctionChangeSet {
    entries: IndexMap<JunctionKey, JunctionChanges>,
}

impl JunctionChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a link row. Cancels a pending unlink of the same pair.
    pub fn schedule_insert(&mut self, key: JunctionKey, element: EntityRef) {
        let changes = self.entries.entry(key).or_default();
        if !changes.deletes.shift_remove(&element) {
            changes.inserts.insert(element);
        }
    }

    /// Schedule removal of a link row. Cancels a pending link of the same
    /// pair.
    pub fn schedule_delete(&mut self, key: JunctionKey, element: EntityRef) {
        let changes = self.entries.entry(key).or_default();
        if !changes.inserts.shift_remove(&element) {
            changes.deletes.insert(element);
        }
    }

    /// Drop everything pending for `owner`.
    pub fn forget_owner(&mut self, owner: &EntityRef) {
        self.entries.retain(|key, _| &key.owner != owner);
    }

    /// Drop every pending change that mentions `element` as a target.
    pub fn forget_element(&mut self, element: &EntityRef) {
        for changes in self.entries.values_mut() {
            changes.inserts.shift_remove(element);
            changes.deletes.shift_remove(element);
        }
        self.entries.retain(|_, changes| !changes.is_empty());
    }

    pub fn insert_count(&self) -> usize {
        self.entries.values().map(|c| c.inserts.len()).sum()
    }

    pub fn delete_count(&self) -> usize {
        self.entries.values().map(|c| c.deletes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(JunctionChanges::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JunctionKey, &JunctionChanges)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlentity_core::{Entity, Result, Value, unknown_field};
    use std::any::Any;

    #[derive(Debug)]
    struct Item;

    impl Entity for Item {
        fn entity_type(&self) -> &'static str {
            "Item"
        }

        fn get_field(&self, _field: &str) -> Option<Value> {
            None
        }

        fn set_field(&mut self, field: &str, _value: Value) -> Result<()> {
            Err(unknown_field("Item", field))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    const POST_TAGS: JunctionTable = JunctionTable::new("post_tags", "post_id", "tag_id");

    #[test]
    fn test_insert_and_delete_cancel_out() {
        let owner = EntityRef::new(Item);
        let tag = EntityRef::new(Item);
        let key = JunctionKey::new(POST_TAGS, &owner, "tags");
        let mut set = JunctionChangeSet::new();

        set.schedule_insert(key.clone(), tag.clone());
        set.schedule_insert(key.clone(), tag.clone());
        assert_eq!(set.insert_count(), 1);

        set.schedule_delete(key.clone(), tag.clone());
        assert_eq!(set.insert_count(), 0);
        assert_eq!(set.delete_count(), 0);
        assert!(set.is_empty());

        set.schedule_delete(key, tag);
        assert_eq!(set.delete_count(), 1);
    }

    #[test]
    fn test_keys_are_per_owner_handle() {
        let first = EntityRef::new(Item);
        let second = EntityRef::new(Item);
        let tag = EntityRef::new(Item);
        let mut set = JunctionChangeSet::new();
        set.schedule_insert(JunctionKey::new(POST_TAGS, &first, "tags"), tag.clone());
        set.schedule_insert(JunctionKey::new(POST_TAGS, &second, "tags"), tag.clone());
        assert_eq!(set.insert_count(), 2);
        assert_eq!(set.iter().count(), 2);

        set.forget_owner(&first);
        assert_eq!(set.insert_count(), 1);

        set.forget_element(&tag);
        assert!(set.is_empty());
        assert_eq!(set.iter().count(), 0);
    }
}
