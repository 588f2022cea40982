//! Slot Resource Allocator.
//!
//! Builds the document writes that move items between a client and the
//! shared containers. Two modes exist for the community chest:
//!
//! - `Legacy`: scan for a free slot, then write it unconditionally. Two
//!   clients that scan the same snapshot pick the same slot and the later
//!   write silently overwrites the earlier item.
//! - `CompareAndSet`: the write carries the occupant it expects. The loser
//!   of a race is rejected and nothing is overwritten.
//!
//! Marketplace writes always use compare-and-set.
//!
//! Every function here is pure: it inspects a document snapshot and returns
//! the write to submit. Nothing is applied.

use realmsync_doc::{
    ClientId, ConditionalPatch, Item, Listing, ListingId, Rarity, SessionDocument, SessionPatch,
    SlotExpectation, SlotRef,
};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::store::DocumentWrite;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClaimMode {
    Legacy,
    #[default]
    CompareAndSet,
}

/// A planned write to one chest slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChestWrite {
    pub index: u32,
    pub write: DocumentWrite,
}

// ============================================================================
// Community Chest
// ============================================================================

/// Legacy deposit: first empty slot, plain write.
pub fn claim_first_empty(doc: &SessionDocument, item: Item) -> Result<ChestWrite, SessionError> {
    let index = doc
        .community_chest
        .first_empty()
        .ok_or(SessionError::SlotUnavailable)?;
    Ok(ChestWrite {
        index,
        write: DocumentWrite::Plain(SessionPatch::new().with_chest_slot(index, Some(item))),
    })
}

/// Deposit guarded by "slot still empty".
pub fn claim_first_empty_cas(
    doc: &SessionDocument,
    item: Item,
) -> Result<ChestWrite, SessionError> {
    let index = doc
        .community_chest
        .first_empty()
        .ok_or(SessionError::SlotUnavailable)?;
    Ok(ChestWrite {
        index,
        write: DocumentWrite::Conditional(ConditionalPatch::new(
            SessionPatch::new().with_chest_slot(index, Some(item)),
            vec![SlotExpectation::empty(SlotRef::ChestSlot(index))],
        )),
    })
}

pub fn claim(
    doc: &SessionDocument,
    item: Item,
    mode: ClaimMode,
) -> Result<ChestWrite, SessionError> {
    match mode {
        ClaimMode::Legacy => claim_first_empty(doc, item),
        ClaimMode::CompareAndSet => claim_first_empty_cas(doc, item),
    }
}

/// Legacy withdrawal: clear the slot unconditionally.
pub fn release(index: u32) -> ChestWrite {
    ChestWrite {
        index,
        write: DocumentWrite::Plain(SessionPatch::new().with_chest_slot(index, None)),
    }
}

/// Withdrawal guarded by "slot still holds `expected_item_id`".
pub fn release_cas(index: u32, expected_item_id: &str) -> ChestWrite {
    ChestWrite {
        index,
        write: DocumentWrite::Conditional(ConditionalPatch::new(
            SessionPatch::new().with_chest_slot(index, None),
            vec![SlotExpectation::holding(
                SlotRef::ChestSlot(index),
                expected_item_id,
            )],
        )),
    }
}

/// Plan a withdrawal of whatever `doc` shows in slot `index`.
pub fn take(
    doc: &SessionDocument,
    index: u32,
    mode: ClaimMode,
) -> Result<(Item, ChestWrite), SessionError> {
    let item = doc
        .community_chest
        .items
        .get(&index)
        .cloned()
        .ok_or(SessionError::SlotEmpty(index))?;
    let write = match mode {
        ClaimMode::Legacy => release(index),
        ClaimMode::CompareAndSet => release_cas(index, &item.id),
    };
    Ok((item, write))
}

// ============================================================================
// Marketplace
// ============================================================================

/// Publish `item` under a fresh listing id.
///
/// `tradable` lists the rarities allowed on the marketplace. Prices below 1
/// are raised to 1.
pub fn create_listing(
    item: Item,
    price: u64,
    seller: &str,
    id: ListingId,
    tradable: &[Rarity],
) -> Result<ConditionalPatch, SessionError> {
    if !tradable.contains(&item.rarity) {
        return Err(SessionError::NotTradable(item.rarity));
    }
    let listing = Listing {
        item,
        price: price.max(1),
        seller_id: seller.to_string(),
    };
    Ok(ConditionalPatch::new(
        SessionPatch::new().with_listing(id.clone(), Some(listing)),
        vec![SlotExpectation::empty(SlotRef::Listing(id))],
    ))
}

fn listing<'a>(doc: &'a SessionDocument, id: &str) -> Result<&'a Listing, SessionError> {
    doc.marketplace
        .listings
        .get(id)
        .ok_or_else(|| SessionError::ListingGone(id.to_string()))
}

fn remove_listing(id: &str, listing: &Listing) -> ConditionalPatch {
    ConditionalPatch::new(
        SessionPatch::new().with_listing(id, None),
        vec![SlotExpectation::holding(
            SlotRef::Listing(id.to_string()),
            listing.item.id.clone(),
        )],
    )
}

/// Seller withdraws their own listing.
pub fn cancel_listing(
    doc: &SessionDocument,
    id: &str,
    caller: &ClientId,
) -> Result<(Listing, ConditionalPatch), SessionError> {
    let listing = listing(doc, id)?;
    if &listing.seller_id != caller {
        return Err(SessionError::NotSeller(id.to_string()));
    }
    Ok((listing.clone(), remove_listing(id, listing)))
}

/// Buyer removes a listing they are paying for.
///
/// Gold and inventory checks belong to the caller; this only validates the
/// shared side.
pub fn purchase_listing(
    doc: &SessionDocument,
    id: &str,
    buyer: &ClientId,
) -> Result<(Listing, ConditionalPatch), SessionError> {
    let listing = listing(doc, id)?;
    if &listing.seller_id == buyer {
        return Err(SessionError::OwnListing(id.to_string()));
    }
    Ok((listing.clone(), remove_listing(id, listing)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TRADABLE_RARITIES;
    use crate::store::PatchMergeStore;

    fn item(id: &str, rarity: Rarity) -> Item {
        Item {
            id: id.to_string(),
            name: format!("{rarity} Ring"),
            rarity,
            icon: "💍".to_string(),
            stats: Default::default(),
            season: None,
        }
    }

    fn full_but_one() -> SessionDocument {
        let mut doc = SessionDocument::default();
        let mut patch = SessionPatch::new();
        for index in 0..99 {
            let filler = item(&format!("filler-{index}"), Rarity::Common);
            patch = patch.with_chest_slot(index, Some(filler));
        }
        doc.apply(&patch);
        doc
    }

    #[test]
    fn test_legacy_race_overwrites_silently() {
        let mut store = PatchMergeStore::new();
        let snapshot = full_but_one();
        store.install(snapshot.clone(), 1);

        let x = claim_first_empty(&snapshot, item("x", Rarity::Rare)).unwrap();
        let y = claim_first_empty(&snapshot, item("y", Rarity::Rare)).unwrap();
        assert_eq!((x.index, y.index), (99, 99));

        store.submit(&x.write).unwrap();
        store.submit(&y.write).unwrap();

        let chest = &store.current().community_chest;
        assert_eq!(chest.items[&99].id, "y");
        assert!(chest.items.values().all(|i| i.id != "x"));
    }

    #[test]
    fn test_cas_race_has_one_winner() {
        let mut store = PatchMergeStore::new();
        let snapshot = full_but_one();
        store.install(snapshot.clone(), 1);

        let x = claim_first_empty_cas(&snapshot, item("x", Rarity::Rare)).unwrap();
        let y = claim_first_empty_cas(&snapshot, item("y", Rarity::Rare)).unwrap();

        assert!(store.submit(&x.write).is_ok());
        let rejected = store.submit(&y.write).unwrap_err();
        assert_eq!(rejected.conflicts[0].observed.as_deref(), Some("x"));

        // The loser rescans and finds the chest full.
        assert!(matches!(
            claim_first_empty_cas(store.current(), item("y", Rarity::Rare)),
            Err(SessionError::SlotUnavailable)
        ));
    }

    #[test]
    fn test_take_plans_by_mode() {
        let mut doc = SessionDocument::default();
        doc.apply(&SessionPatch::new().with_chest_slot(5, Some(item("gem", Rarity::Epic))));

        let (taken, legacy) = take(&doc, 5, ClaimMode::Legacy).unwrap();
        assert_eq!(taken.id, "gem");
        assert!(!legacy.write.is_conditional());

        let (_, guarded) = take(&doc, 5, ClaimMode::CompareAndSet).unwrap();
        let DocumentWrite::Conditional(conditional) = guarded.write else {
            panic!("expected conditional write");
        };
        assert_eq!(conditional.expectations[0].expected.as_deref(), Some("gem"));

        assert!(matches!(
            take(&doc, 6, ClaimMode::Legacy),
            Err(SessionError::SlotEmpty(6))
        ));
    }

    #[test]
    fn test_double_withdraw_cas_rejects_second() {
        let mut store = PatchMergeStore::new();
        store.apply(&SessionPatch::new().with_chest_slot(2, Some(item("gem", Rarity::Rare))));
        let snapshot = store.current().clone();

        let (_, first) = take(&snapshot, 2, ClaimMode::CompareAndSet).unwrap();
        let (_, second) = take(&snapshot, 2, ClaimMode::CompareAndSet).unwrap();
        assert!(store.submit(&first.write).is_ok());
        assert!(store.submit(&second.write).is_err());
    }

    #[test]
    fn test_listing_rules() {
        assert!(matches!(
            create_listing(item("e", Rarity::Epic), 10, "a2", "l-1".into(), &TRADABLE_RARITIES),
            Err(SessionError::NotTradable(Rarity::Epic))
        ));

        let listed =
            create_listing(item("r", Rarity::Rare), 0, "a2", "l-1".into(), &TRADABLE_RARITIES)
                .unwrap();
        let mut doc = SessionDocument::default();
        doc.apply_if(&listed).unwrap();
        assert_eq!(doc.marketplace.listings["l-1"].price, 1);

        // Listing ids are never reused.
        assert!(doc.apply_if(&listed).is_err());
    }

    #[test]
    fn test_cancel_and_purchase_checks() {
        let mut doc = SessionDocument::default();
        doc.apply_if(
            &create_listing(item("r", Rarity::Rare), 40, "a2", "l-1".into(), &TRADABLE_RARITIES)
                .unwrap(),
        )
        .unwrap();

        let seller = "a2".to_string();
        let buyer = "b7".to_string();

        assert!(matches!(
            cancel_listing(&doc, "l-1", &buyer),
            Err(SessionError::NotSeller(_))
        ));
        assert!(matches!(
            purchase_listing(&doc, "l-1", &seller),
            Err(SessionError::OwnListing(_))
        ));
        assert!(matches!(
            purchase_listing(&doc, "missing", &buyer),
            Err(SessionError::ListingGone(_))
        ));

        let (bought, purchase) = purchase_listing(&doc, "l-1", &buyer).unwrap();
        let (_, cancel) = cancel_listing(&doc, "l-1", &seller).unwrap();
        assert_eq!(bought.price, 40);

        // Seller cancels first; the buyer's removal then finds nothing.
        doc.apply_if(&cancel).unwrap();
        assert!(doc.apply_if(&purchase).is_err());
    }
}
