//! Realm Sync Session Document
//!
//! This crate contains the shared, multi-writer session document and the
//! rules by which partial updates are merged into it.
//!
//! # Constraints
//!
//! The document model MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time (timestamps are always supplied by the caller)
//! - Assume any single client owns the whole document
//!
//! Every top-level key is independently mergeable. Concurrent patches to
//! different keys never conflict; concurrent patches to the same leaf key
//! race and the last one applied wins.
//!
//! # Modules
//!
//! - [`patch`]: typed partial updates and their declared merge policies
//! - [`merge`]: generic structural merge over JSON values
//! - [`cas`]: slot expectations for conditional (compare-and-set) updates
//! - [`event`]: closed set of broadcast event kinds
//! - [`presence`]: self-owned per-client presence records
//! - [`progress`]: local-only player progression (never shared)

#![deny(unsafe_code)]

pub mod cas;
pub mod event;
pub mod merge;
pub mod patch;
pub mod presence;
pub mod progress;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cas::{ConditionalPatch, SlotConflict, SlotExpectation, SlotRef};
pub use event::SessionEvent;
pub use patch::{
    ChestPatch, FieldPolicy, MarketplacePatch, MergePolicy, RealmSeasonPatch, SessionPatch,
    WorldBossPatch,
};
pub use presence::{CharacterClass, ControlMode, Controls, PresencePatch, PresenceRecord};
pub use progress::{Inventory, PlayerProgress};

// ============================================================================
// Type Aliases
// ============================================================================

/// Connection-stable participant identifier. Ordered lexicographically.
pub type ClientId = String;

/// Identifier of a marketplace listing. Unbounded, never reused.
pub type ListingId = String;

/// Realm number (1-based).
pub type RealmId = u32;

/// Milliseconds since an arbitrary epoch, always supplied by the caller.
pub type Timestamp = u64;

// ============================================================================
// Document Defaults
// ============================================================================

/// Capacity of a freshly initialised community chest.
pub const DEFAULT_CHEST_CAPACITY: u32 = 100;

/// Boss health granted per realm when a session is first initialised.
pub const INITIAL_BOSS_HEALTH: u64 = 10_000;

/// Season period used when nothing else is configured (4 hours).
pub const DEFAULT_SEASON_PERIOD_MS: u64 = 4 * 60 * 60 * 1000;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while decoding document values.
#[derive(Debug, Error)]
pub enum DocError {
    #[error("unknown rarity `{0}`")]
    UnknownRarity(String),
    #[error("unknown season `{0}`")]
    UnknownSeason(String),
    #[error("failed to decode document json: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Item Model
// ============================================================================

/// Item rarity tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
    Mythical,
    Galactic,
}

impl Rarity {
    pub const ALL: [Rarity; 7] = [
        Rarity::Common,
        Rarity::Uncommon,
        Rarity::Rare,
        Rarity::Epic,
        Rarity::Legendary,
        Rarity::Mythical,
        Rarity::Galactic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "Common",
            Self::Uncommon => "Uncommon",
            Self::Rare => "Rare",
            Self::Epic => "Epic",
            Self::Legendary => "Legendary",
            Self::Mythical => "Mythical",
            Self::Galactic => "Galactic",
        }
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rarity {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rarity::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DocError::UnknownRarity(s.to_string()))
    }
}

/// Season cycle shared by every realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Spring,
    Summer,
    Autumn,
    Winter,
}

impl Season {
    pub const CYCLE: [Season; 4] = [
        Season::Spring,
        Season::Summer,
        Season::Autumn,
        Season::Winter,
    ];

    /// The season that follows this one (Winter wraps to Spring).
    pub fn next(self) -> Season {
        match self {
            Self::Spring => Self::Summer,
            Self::Summer => Self::Autumn,
            Self::Autumn => Self::Winter,
            Self::Winter => Self::Spring,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spring => "Spring",
            Self::Summer => "Summer",
            Self::Autumn => "Autumn",
            Self::Winter => "Winter",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Season {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Season::CYCLE
            .into_iter()
            .find(|season| season.as_str() == s)
            .ok_or_else(|| DocError::UnknownSeason(s.to_string()))
    }
}

/// An immutable item. Exactly one container slot holds a given `id` at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub name: String,
    pub rarity: Rarity,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<Season>,
}

/// An item offered for sale by `seller_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub item: Item,
    pub price: u64,
    pub seller_id: ClientId,
}

// ============================================================================
// Session Document
// ============================================================================

/// The single replicated world boss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldBoss {
    pub health: u64,
    pub max_health: u64,
    pub active: bool,
    #[serde(default)]
    pub spawned_at_wave: u64,
    #[serde(default)]
    pub spawned_at: Timestamp,
}

/// Fixed-capacity, index-addressed shared container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityChest {
    pub capacity: u32,
    #[serde(default)]
    pub items: BTreeMap<u32, Item>,
}

impl Default for CommunityChest {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHEST_CAPACITY,
            items: BTreeMap::new(),
        }
    }
}

impl CommunityChest {
    /// First index in `0..capacity` with no occupant.
    pub fn first_empty(&self) -> Option<u32> {
        (0..self.capacity).find(|index| !self.items.contains_key(index))
    }

    pub fn occupied(&self) -> usize {
        self.items.len()
    }
}

/// Id-keyed shared listing table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marketplace {
    #[serde(default)]
    pub listings: BTreeMap<ListingId, Listing>,
}

/// Per-realm season timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealmSeason {
    pub current: Season,
    pub next_change_at: Timestamp,
}

/// The shared mutable document for one session.
///
/// `world_boss == None` means no client has initialised the session yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionDocument {
    pub world_boss: Option<WorldBoss>,
    pub community_chest: CommunityChest,
    pub marketplace: Marketplace,
    pub chest_slot_purchases: BTreeMap<ClientId, u64>,
    pub realm_seasons: BTreeMap<RealmId, RealmSeason>,
    pub realm_top_score: u64,
}

impl SessionDocument {
    /// Has any client issued the initialisation patch yet?
    pub fn is_initialized(&self) -> bool {
        self.world_boss.is_some()
    }

    /// The currently active boss, if any.
    pub fn active_boss(&self) -> Option<&WorldBoss> {
        self.world_boss.as_ref().filter(|boss| boss.active)
    }

    /// Season for `realm`, defaulting to Spring for unknown realms.
    pub fn season_of(&self, realm: RealmId) -> Season {
        self.realm_seasons
            .get(&realm)
            .map(|s| s.current)
            .unwrap_or(Season::Spring)
    }

    /// Parse a document from its JSON encoding.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DocError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode the document as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, DocError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deterministic digest of the whole document.
    ///
    /// FNV-1a 64 over the canonical JSON encoding. Maps are `BTreeMap`s, so
    /// key order is sorted and two replicas with equal content hash equal.
    pub fn digest(&self) -> u64 {
        let mut hasher = Fnv1a64::new();
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        hasher.finish()
    }
}

// ============================================================================
// Digest
// ============================================================================

const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone)]
struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    fn finish(self) -> u64 {
        self.state
    }
}

// ============================================================================
// Tests
// ============================================================================
