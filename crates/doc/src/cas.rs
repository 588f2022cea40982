//! Conditional updates.
//!
//! A [`ConditionalPatch`] carries, for every slot it intends to write, the
//! occupant the writer last observed there. The patch may only be applied
//! when every slot still holds that occupant; otherwise the writer lost a
//! race and must rescan.
//!
//! Occupants are compared by item id. Items are immutable, so equal ids
//! imply equal values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ListingId, SessionDocument, SessionPatch};

/// Address of a single slot inside a shared container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "key")]
pub enum SlotRef {
    ChestSlot(u32),
    Listing(ListingId),
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChestSlot(index) => write!(f, "communityChest.items[{index}]"),
            Self::Listing(id) => write!(f, "marketplace.listings[{id}]"),
        }
    }
}

/// The occupant a writer expects to find in `slot` (`None` = empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotExpectation {
    pub slot: SlotRef,
    pub expected: Option<String>,
}

impl SlotExpectation {
    pub fn empty(slot: SlotRef) -> Self {
        Self {
            slot,
            expected: None,
        }
    }

    pub fn holding(slot: SlotRef, item_id: impl Into<String>) -> Self {
        Self {
            slot,
            expected: Some(item_id.into()),
        }
    }
}

/// A slot whose current occupant differs from the expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConflict {
    pub slot: SlotRef,
    pub expected: Option<String>,
    pub observed: Option<String>,
}

/// A patch guarded by slot expectations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalPatch {
    pub patch: SessionPatch,
    pub expectations: Vec<SlotExpectation>,
}

impl ConditionalPatch {
    pub fn new(patch: SessionPatch, expectations: Vec<SlotExpectation>) -> Self {
        Self {
            patch,
            expectations,
        }
    }
}

impl SessionDocument {
    /// Id of the item currently occupying `slot`.
    ///
    /// For listings the occupant is the listed item's id.
    pub fn occupant(&self, slot: &SlotRef) -> Option<&str> {
        match slot {
            SlotRef::ChestSlot(index) => self
                .community_chest
                .items
                .get(index)
                .map(|item| item.id.as_str()),
            SlotRef::Listing(id) => self
                .marketplace
                .listings
                .get(id)
                .map(|listing| listing.item.id.as_str()),
        }
    }

    /// Verify every expectation against the current document.
    pub fn check(&self, expectations: &[SlotExpectation]) -> Result<(), Vec<SlotConflict>> {
        let conflicts: Vec<SlotConflict> = expectations
            .iter()
            .filter_map(|exp| {
                let observed = self.occupant(&exp.slot);
                (observed != exp.expected.as_deref()).then(|| SlotConflict {
                    slot: exp.slot.clone(),
                    expected: exp.expected.clone(),
                    observed: observed.map(str::to_string),
                })
            })
            .collect();

        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(conflicts)
        }
    }

    /// Apply `conditional.patch` only if every expectation holds.
    pub fn apply_if(&mut self, conditional: &ConditionalPatch) -> Result<(), Vec<SlotConflict>> {
        self.check(&conditional.expectations)?;
        self.apply(&conditional.patch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::item;
    use crate::{Listing, Rarity};

    #[test]
    fn test_empty_expectation_on_empty_slot() {
        let mut doc = SessionDocument::default();
        let claim = ConditionalPatch::new(
            SessionPatch::new().with_chest_slot(4, Some(item("x", Rarity::Rare))),
            vec![SlotExpectation::empty(SlotRef::ChestSlot(4))],
        );
        assert!(doc.apply_if(&claim).is_ok());
        assert_eq!(doc.occupant(&SlotRef::ChestSlot(4)), Some("x"));
    }

    #[test]
    fn test_second_claim_on_same_slot_conflicts() {
        let mut doc = SessionDocument::default();
        let first = ConditionalPatch::new(
            SessionPatch::new().with_chest_slot(4, Some(item("x", Rarity::Rare))),
            vec![SlotExpectation::empty(SlotRef::ChestSlot(4))],
        );
        let second = ConditionalPatch::new(
            SessionPatch::new().with_chest_slot(4, Some(item("y", Rarity::Rare))),
            vec![SlotExpectation::empty(SlotRef::ChestSlot(4))],
        );

        doc.apply_if(&first).unwrap();
        let conflicts = doc.apply_if(&second).unwrap_err();

        assert_eq!(
            conflicts,
            vec![SlotConflict {
                slot: SlotRef::ChestSlot(4),
                expected: None,
                observed: Some("x".to_string()),
            }]
        );
        assert_eq!(doc.occupant(&SlotRef::ChestSlot(4)), Some("x"));
    }

    #[test]
    fn test_listing_expectation() {
        let mut doc = SessionDocument::default();
        doc.apply(&SessionPatch::new().with_listing(
            "l-1",
            Some(Listing {
                item: item("sword", Rarity::Common),
                price: 10,
                seller_id: "a2".to_string(),
            }),
        ));

        let slot = SlotRef::Listing("l-1".to_string());
        assert!(doc.check(&[SlotExpectation::holding(slot.clone(), "sword")]).is_ok());
        assert!(doc.check(&[SlotExpectation::empty(slot.clone())]).is_err());

        doc.apply(&SessionPatch::new().with_listing("l-1", None));
        assert!(doc.check(&[SlotExpectation::holding(slot, "sword")]).is_err());
    }

    #[test]
    fn test_slot_ref_display() {
        assert_eq!(SlotRef::ChestSlot(9).to_string(), "communityChest.items[9]");
        assert_eq!(
            SlotRef::Listing("l-1".to_string()).to_string(),
            "marketplace.listings[l-1]"
        );
    }
}
