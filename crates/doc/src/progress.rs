//! Local-only player progression.
//!
//! This state is never part of the shared document. It is persisted through
//! the external blob store and mutated only by the owning client.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Item, RealmId};

/// Default number of inventory slots.
pub const INVENTORY_SIZE: usize = 50;

/// Waves per realm.
pub const WAVES_PER_REALM: u64 = 10;

/// Fixed-size, slot-addressed item storage.
///
/// A slot can be held empty for an item that is away on an unconfirmed
/// write. `place` never fills a held slot, so the item always has a way back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    slots: Vec<Option<Item>>,
    #[serde(skip)]
    held: BTreeSet<usize>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::with_size(INVENTORY_SIZE)
    }
}

impl Inventory {
    pub fn with_size(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            held: BTreeSet::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<&Item> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Place `item` in the first empty, unheld slot. Returns `Err(item)` when
    /// there is none.
    pub fn place(&mut self, item: Item) -> Result<usize, Item> {
        match self.first_free() {
            Some(slot) => {
                self.slots[slot] = Some(item);
                Ok(slot)
            }
            None => Err(item),
        }
    }

    fn first_free(&self) -> Option<usize> {
        (0..self.slots.len()).find(|slot| self.slots[*slot].is_none() && !self.held.contains(slot))
    }

    /// Remove and return the item in `slot`.
    pub fn take(&mut self, slot: usize) -> Option<Item> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Remove the item with the given id, wherever it is.
    pub fn remove_by_id(&mut self, id: &str) -> Option<Item> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|item| item.id == id))?;
        self.take(slot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items().any(|item| item.id == id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.slots.iter().flatten()
    }

    pub fn is_full(&self) -> bool {
        self.first_free().is_none()
    }

    /// Take the item in `slot` and hold the slot open for its return.
    pub fn take_held(&mut self, slot: usize) -> Option<Item> {
        let item = self.take(slot)?;
        self.held.insert(slot);
        Some(item)
    }

    /// Hold the first free slot for an item that has not arrived yet.
    pub fn reserve(&mut self) -> Option<usize> {
        let slot = self.first_free()?;
        self.held.insert(slot);
        Some(slot)
    }

    /// Stop holding `slot`.
    pub fn release(&mut self, slot: usize) {
        self.held.remove(&slot);
    }

    pub fn is_held(&self, slot: usize) -> bool {
        self.held.contains(&slot)
    }

    /// Put `item` into its held `slot` and release the hold.
    ///
    /// If the slot is unusable (progress was replaced meanwhile) the item
    /// goes to any free slot, growing the inventory when none is left.
    /// Returns the slot used.
    pub fn restore(&mut self, slot: usize, item: Item) -> usize {
        self.held.remove(&slot);
        if self.slots.get(slot).is_some_and(Option::is_none) {
            self.slots[slot] = Some(item);
            return slot;
        }
        match self.place(item) {
            Ok(slot) => slot,
            Err(item) => {
                self.slots.push(Some(item));
                self.slots.len() - 1
            }
        }
    }

    /// Resize to `size` slots. Never shrinks below an occupied or held slot.
    pub fn normalize(&mut self, size: usize) {
        let in_use = self
            .slots
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |slot| slot + 1)
            .max(self.held.iter().next_back().map_or(0, |slot| slot + 1));
        self.slots.resize(size.max(in_use), None);
    }
}

/// Realm reached at `wave`: waves 1..=9 are realm 1, wave 10 begins realm 2.
pub fn realm_for_wave(wave: u64) -> RealmId {
    RealmId::try_from(wave / WAVES_PER_REALM + 1).unwrap_or(RealmId::MAX)
}

/// The local player's progression snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerProgress {
    pub gold: u64,
    pub level: u32,
    pub xp: u64,
    pub wave: u64,
    pub realm: RealmId,
    pub enemies_defeated: u64,
    pub inventory: Inventory,
}

impl Default for PlayerProgress {
    fn default() -> Self {
        Self {
            gold: 0,
            level: 1,
            xp: 0,
            wave: 1,
            realm: 1,
            enemies_defeated: 0,
            inventory: Inventory::default(),
        }
    }
}

impl PlayerProgress {
    /// Debit `amount` gold. Returns false and leaves gold unchanged if short.
    pub fn try_spend(&mut self, amount: u64) -> bool {
        match self.gold.checked_sub(amount) {
            Some(rest) => {
                self.gold = rest;
                true
            }
            None => false,
        }
    }

    pub fn refund(&mut self, amount: u64) {
        self.gold = self.gold.saturating_add(amount);
    }

    /// Advance one wave, recomputing the realm on milestones.
    ///
    /// Returns the new realm if a realm boundary was crossed.
    pub fn advance_wave(&mut self) -> Option<RealmId> {
        self.wave += 1;
        if self.wave % WAVES_PER_REALM == 0 {
            self.realm = realm_for_wave(self.wave);
            Some(self.realm)
        } else {
            None
        }
    }
}
