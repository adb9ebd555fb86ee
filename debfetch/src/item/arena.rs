//! Storage for items, addressed by [`ItemId`].

use super::{Item, ItemId, ItemStatus};

/// Every item of a run. Ids are never reused.
///
/// The engine takes an item out while one of its handlers runs and puts it
/// back afterwards, so handlers see every *other* item through a shared
/// borrow of the arena and their own item mutably.
#[derive(Debug, Default)]
pub struct ItemArena {
    slots: Vec<Option<Item>>,
}

impl ItemArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next inserted item will get.
    pub fn next_id(&self) -> ItemId {
        ItemId(self.slots.len())
    }

    /// Store an item created with `next_id()`.
    pub fn insert(&mut self, item: Item) -> ItemId {
        let id = item.id();
        debug_assert_eq!(id.0, self.slots.len(), "items must be inserted in id order");
        if id.0 >= self.slots.len() {
            self.slots.resize_with(id.0 + 1, || None);
        }
        self.slots[id.0] = Some(item);
        id
    }

    /// Take an item out for mutation.
    pub fn take(&mut self, id: ItemId) -> Option<Item> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    /// Return an item taken with [`take`](Self::take).
    pub fn put(&mut self, item: Item) {
        let id = item.id();
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = Some(item);
        }
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Items currently in the arena, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Item> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of items in `status`.
    pub fn count(&self, status: ItemStatus) -> usize {
        self.iter().filter(|i| i.status() == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{FileState, ItemCore, ItemDesc, ItemKind};
    use crate::hashes::HashString;
    use std::path::PathBuf;

    fn item(id: usize) -> Item {
        Item {
            core: ItemCore::new(ItemId(id), ItemDesc::default(), PathBuf::from("/tmp/x")),
            kind: ItemKind::File(FileState {
                expected: HashString::default(),
                retries: 0,
                is_index: false,
            }),
        }
    }

    #[test]
    fn test_take_and_put() {
        let mut arena = ItemArena::new();
        let id = arena.insert(item(arena.next_id().0));
        assert_eq!(arena.next_id(), ItemId(1));

        let mut taken = arena.take(id).unwrap();
        assert!(arena.get(id).is_none());
        assert_eq!(arena.iter().count(), 0);

        taken.core.status = ItemStatus::Done;
        arena.put(taken);
        assert_eq!(arena.count(ItemStatus::Done), 1);
    }

    #[test]
    fn test_ids_not_reused() {
        let mut arena = ItemArena::new();
        arena.insert(item(0));
        arena.take(ItemId(0));
        assert_eq!(arena.next_id(), ItemId(1));
        assert_eq!(arena.len(), 1);
    }
}
