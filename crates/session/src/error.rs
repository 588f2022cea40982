//! Errors surfaced to callers of session operations.
//!
//! None of these are retried automatically. Callers rescan the document and
//! try again if they want to.

use realmsync_doc::{ListingId, Rarity};
use realmsync_persist::PersistError;
use realmsync_wire::WireError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no free slot is available")]
    SlotUnavailable,
    #[error("chest slot {0} is empty")]
    SlotEmpty(u32),
    #[error("not enough gold: need {needed}, have {available}")]
    InsufficientGold { needed: u64, available: u64 },
    #[error("inventory is full")]
    InventoryFull,
    #[error("no item in inventory slot {0}")]
    NoSuchItem(usize),
    #[error("item {0} is still waiting on an earlier write")]
    ItemInFlight(String),
    #[error("listing {0} is no longer available")]
    ListingGone(ListingId),
    #[error("only the seller may cancel listing {0}")]
    NotSeller(ListingId),
    #[error("cannot buy own listing {0}")]
    OwnListing(ListingId),
    #[error("{0} items cannot be traded")]
    NotTradable(Rarity),
    #[error("no world boss is active")]
    BossNotActive,
    #[error("not joined to a session yet")]
    NotJoined,
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("save failed: {0}")]
    Persist(#[from] PersistError),
}

impl SessionError {
    /// Failures caused by losing a race on shared state.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::SlotUnavailable | Self::ListingGone(_))
    }
}
