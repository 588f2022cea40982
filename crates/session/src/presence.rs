//! Presence Directory.
//!
//! One record per connected client. A record is written only by its owner;
//! the relay binds the owner from the connection, never from the payload.
//! Records vanish when the connection drops. There is no explicit leave.

use std::collections::BTreeMap;

use realmsync_doc::{ClientId, PresencePatch, PresenceRecord};

use crate::listeners::{Listeners, Subscription};

pub type PresenceMap = BTreeMap<ClientId, PresenceRecord>;

#[derive(Debug, Default)]
pub struct PresenceDirectory {
    records: PresenceMap,
    subscribers: Listeners<PresenceMap>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into `owner`'s own record, creating it on first write.
    pub fn set_local(&mut self, owner: &str, patch: &PresencePatch) {
        self.records
            .entry(owner.to_string())
            .or_insert_with(|| PresenceRecord::new(owner))
            .apply(patch);
        self.subscribers.notify(&self.records);
    }

    /// Drop `client`'s record (connection closed).
    pub fn remove(&mut self, client: &str) -> Option<PresenceRecord> {
        let removed = self.records.remove(client);
        if removed.is_some() {
            self.subscribers.notify(&self.records);
        }
        removed
    }

    /// Replace the whole map with an authoritative snapshot.
    pub fn replace_all(&mut self, records: PresenceMap) {
        self.records = records;
        self.subscribers.notify(&self.records);
    }

    pub fn records(&self) -> &PresenceMap {
        &self.records
    }

    pub fn get(&self, client: &str) -> Option<&PresenceRecord> {
        self.records.get(client)
    }

    pub fn subscribe(&mut self, handler: impl FnMut(&PresenceMap) + 'static) -> Subscription {
        self.subscribers.add(handler)
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.subscribers.remove(subscription)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.records)
    }

    pub fn map_from_json(bytes: &[u8]) -> Result<PresenceMap, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn wave(n: u64) -> PresencePatch {
        PresencePatch {
            wave_reached: Some(n),
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_writes_only_own_record() {
        let mut directory = PresenceDirectory::new();
        directory.set_local("a2", &wave(3));
        directory.set_local("b7", &wave(8));

        assert_eq!(directory.get("a2").unwrap().wave_reached, 3);
        assert_eq!(directory.get("b7").unwrap().wave_reached, 8);
        assert_eq!(directory.get("b7").unwrap().client_id, "b7");
    }

    #[test]
    fn test_subscribers_get_full_map_on_each_change() {
        let mut directory = PresenceDirectory::new();
        let sizes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&sizes);
        directory.subscribe(move |map| sink.borrow_mut().push(map.len()));

        directory.set_local("a2", &wave(1));
        directory.set_local("b7", &wave(1));
        directory.set_local("a2", &wave(2));
        directory.remove("b7");
        directory.remove("b7");

        assert_eq!(*sizes.borrow(), vec![1, 2, 2, 1]);
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let mut directory = PresenceDirectory::new();
        directory.set_local("a2", &wave(4));
        let map = PresenceDirectory::map_from_json(&directory.to_json().unwrap()).unwrap();
        assert_eq!(&map, directory.records());
    }
}
