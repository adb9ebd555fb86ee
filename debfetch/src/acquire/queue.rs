//! Pending work for one host or scheme.

use std::collections::VecDeque;

use crate::item::{ItemDesc, ItemId};

use super::WorkerId;

/// One URI to fetch and the items waiting for it.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub desc: ItemDesc,
    /// Items sharing this transfer, first one owns the description.
    pub owners: Vec<ItemId>,
    /// Sent to the worker and not answered yet.
    pub in_flight: bool,
    /// Idle timeouts this entry has already survived.
    pub timeouts: u32,
}

/// FIFO of entries served by at most one worker.
#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub access: String,
    pub worker: Option<WorkerId>,
    entries: VecDeque<QueueEntry>,
}

impl Queue {
    pub fn new(name: impl Into<String>, access: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: access.into(),
            worker: None,
            entries: VecDeque::new(),
        }
    }

    /// Add `item` as a waiter for `desc.uri`.
    ///
    /// Returns false when the item already waits for that URI here. An
    /// entry for the same URI that is not yet in flight is shared.
    pub fn enqueue(&mut self, item: ItemId, desc: ItemDesc) -> bool {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.desc.uri == desc.uri && (!e.in_flight || e.owners.contains(&item)))
        {
            if entry.owners.contains(&item) {
                return false;
            }
            entry.owners.push(item);
            return true;
        }

        self.entries.push_back(QueueEntry {
            desc,
            owners: vec![item],
            in_flight: false,
            timeouts: 0,
        });
        true
    }

    /// Drop `item` from every entry. Returns how many entries it left.
    pub fn remove_owner(&mut self, item: ItemId) -> usize {
        let mut removed = 0;
        for entry in self.entries.iter_mut() {
            let before = entry.owners.len();
            entry.owners.retain(|o| *o != item);
            removed += before - entry.owners.len();
        }
        self.entries.retain(|e| !e.owners.is_empty());
        removed
    }

    /// The in-flight entry for `uri`.
    pub fn in_flight_entry(&self, uri: &str) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.in_flight && e.desc.uri == uri)
    }

    /// Remove and return the in-flight entry for `uri`.
    pub fn finish(&mut self, uri: &str) -> Option<QueueEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.in_flight && e.desc.uri == uri)?;
        self.entries.remove(pos)
    }

    /// First entry not yet handed to the worker.
    pub fn next_unsent(&mut self) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| !e.in_flight)
    }

    pub fn in_flight(&self) -> usize {
        self.entries.iter().filter(|e| e.in_flight).count()
    }

    /// Take every in-flight entry out of the queue.
    pub fn take_in_flight(&mut self) -> Vec<QueueEntry> {
        let (sent, waiting): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| e.in_flight);
        self.entries = waiting.into();
        sent
    }

    /// Put entries back at the front, unsent, keeping their order.
    pub fn requeue_front(&mut self, entries: Vec<QueueEntry>) {
        for mut entry in entries.into_iter().rev() {
            entry.in_flight = false;
            self.entries.push_front(entry);
        }
    }

    /// Take every entry out of the queue.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(uri: &str) -> ItemDesc {
        ItemDesc::new(uri, uri, uri)
    }

    #[test]
    fn test_enqueue_dedupes_and_shares() {
        let mut queue = Queue::new("http:h", "http");
        assert!(queue.enqueue(ItemId(0), desc("http://h/a")));
        assert!(!queue.enqueue(ItemId(0), desc("http://h/a")));
        assert!(queue.enqueue(ItemId(1), desc("http://h/a")));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.entries().next().unwrap().owners, vec![ItemId(0), ItemId(1)]);
    }

    #[test]
    fn test_in_flight_entry_is_not_shared() {
        let mut queue = Queue::new("http:h", "http");
        queue.enqueue(ItemId(0), desc("http://h/a"));
        queue.next_unsent().unwrap().in_flight = true;

        assert!(queue.enqueue(ItemId(1), desc("http://h/a")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.in_flight(), 1);

        let done = queue.finish("http://h/a").unwrap();
        assert_eq!(done.owners, vec![ItemId(0)]);
        assert_eq!(queue.next_unsent().unwrap().owners, vec![ItemId(1)]);
    }

    #[test]
    fn test_remove_owner_drops_empty_entries() {
        let mut queue = Queue::new("http:h", "http");
        queue.enqueue(ItemId(0), desc("http://h/a"));
        queue.enqueue(ItemId(1), desc("http://h/a"));
        queue.enqueue(ItemId(0), desc("http://h/b"));

        assert_eq!(queue.remove_owner(ItemId(0)), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove_owner(ItemId(1)), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let mut queue = Queue::new("http:h", "http");
        for (i, uri) in ["http://h/a", "http://h/b", "http://h/c"].iter().enumerate() {
            queue.enqueue(ItemId(i), desc(uri));
        }
        queue.next_unsent().unwrap().in_flight = true;
        queue.next_unsent().unwrap().in_flight = true;

        let sent = queue.take_in_flight();
        assert_eq!(sent.len(), 2);
        assert_eq!(queue.len(), 1);

        queue.requeue_front(sent);
        let order: Vec<_> = queue.entries().map(|e| e.desc.uri.as_str()).collect();
        assert_eq!(order, vec!["http://h/a", "http://h/b", "http://h/c"]);
        assert_eq!(queue.in_flight(), 0);
    }
}
