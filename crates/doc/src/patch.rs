//! Typed partial updates for the session document.
//!
//! Every field of [`SessionDocument`] declares how an incoming value is
//! folded into the existing one (see [`FIELD_POLICIES`]). New fields must be
//! added to that table; nothing relies on generic structural merging.
//!
//! The JSON encoding of a [`SessionPatch`] is a merge patch: absent keys are
//! untouched, `null` deletes an entry from a keyed container.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ClientId, Item, Listing, ListingId, RealmId, RealmSeason, Season, SessionDocument, Timestamp,
    WorldBoss,
};

// ============================================================================
// Merge Policies
// ============================================================================

/// How an incoming patch value is folded into the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Incoming value replaces the current one outright.
    Replace,
    /// Nested fields are merged one by one with their own policies.
    Merge,
    /// Keyed entries: a value replaces, `null` removes the entry.
    DeleteOnNull,
    /// Keep the larger of current and incoming.
    Max,
    /// Subtract the incoming amount, saturating at zero.
    Deduct,
}

impl MergePolicy {
    /// Fold a scalar leaf.
    pub fn merge_scalar(self, current: u64, incoming: u64) -> u64 {
        match self {
            Self::Replace | Self::Merge | Self::DeleteOnNull => incoming,
            Self::Max => current.max(incoming),
            Self::Deduct => current.saturating_sub(incoming),
        }
    }

    /// Does applying the same value twice leave the document unchanged?
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::Deduct)
    }
}

/// A document path and the policy it is merged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPolicy {
    pub path: &'static str,
    pub policy: MergePolicy,
}

const fn field(path: &'static str, policy: MergePolicy) -> FieldPolicy {
    FieldPolicy { path, policy }
}

/// Declared merge policy of every patchable path.
pub const FIELD_POLICIES: &[FieldPolicy] = &[
    field("worldBoss", MergePolicy::Merge),
    field("worldBoss.health", MergePolicy::Replace),
    field("worldBoss.maxHealth", MergePolicy::Replace),
    field("worldBoss.active", MergePolicy::Replace),
    field("worldBoss.spawnedAtWave", MergePolicy::Replace),
    field("worldBoss.spawnedAt", MergePolicy::Replace),
    field("worldBoss.damage", MergePolicy::Deduct),
    field("communityChest", MergePolicy::Merge),
    field("communityChest.capacity", MergePolicy::Replace),
    field("communityChest.items", MergePolicy::DeleteOnNull),
    field("marketplace", MergePolicy::Merge),
    field("marketplace.listings", MergePolicy::DeleteOnNull),
    field("chestSlotPurchases", MergePolicy::Merge),
    field("chestSlotPurchases.*", MergePolicy::Replace),
    field("realmSeasons", MergePolicy::Merge),
    field("realmSeasons.*.current", MergePolicy::Replace),
    field("realmSeasons.*.nextChangeAt", MergePolicy::Replace),
    field("realmTopScore", MergePolicy::Replace),
    field("realmTopScoreAtLeast", MergePolicy::Max),
];

/// Look up the declared policy of `path`.
pub fn policy_for(path: &str) -> Option<MergePolicy> {
    FIELD_POLICIES
        .iter()
        .find(|f| f.path == path)
        .map(|f| f.policy)
}

// ============================================================================
// Patch Types
// ============================================================================

/// Partial world boss update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldBossPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_health: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_at_wave: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_at: Option<Timestamp>,
    /// Damage counter, deducted from the stored health on apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage: Option<u64>,
}

impl WorldBossPatch {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn merge(self, later: Self) -> Self {
        let damage = match (self.damage, later.damage) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            (a, b) => b.or(a),
        };
        // An absolute health write in `later` supersedes earlier damage.
        let damage = if later.health.is_some() {
            later.damage
        } else {
            damage
        };
        Self {
            health: later.health.or(self.health),
            max_health: later.max_health.or(self.max_health),
            active: later.active.or(self.active),
            spawned_at_wave: later.spawned_at_wave.or(self.spawned_at_wave),
            spawned_at: later.spawned_at.or(self.spawned_at),
            damage,
        }
    }
}

impl From<&WorldBoss> for WorldBossPatch {
    fn from(boss: &WorldBoss) -> Self {
        Self {
            health: Some(boss.health),
            max_health: Some(boss.max_health),
            active: Some(boss.active),
            spawned_at_wave: Some(boss.spawned_at_wave),
            spawned_at: Some(boss.spawned_at),
            damage: None,
        }
    }
}

/// Partial community chest update. `items[i] = None` clears slot `i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChestPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<u32, Option<Item>>,
}

/// Partial marketplace update. `listings[id] = None` removes the listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketplacePatch {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub listings: BTreeMap<ListingId, Option<Listing>>,
}

/// Partial season timer update for one realm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealmSeasonPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<Season>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_change_at: Option<Timestamp>,
}

impl From<RealmSeason> for RealmSeasonPatch {
    fn from(season: RealmSeason) -> Self {
        Self {
            current: Some(season.current),
            next_change_at: Some(season.next_change_at),
        }
    }
}

/// A partial, possibly nested update to a [`SessionDocument`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_boss: Option<WorldBossPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_chest: Option<ChestPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<MarketplacePatch>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub chest_slot_purchases: BTreeMap<ClientId, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub realm_seasons: BTreeMap<RealmId, RealmSeasonPatch>,
    /// Absolute overwrite of the high-water mark (can regress it).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm_top_score: Option<u64>,
    /// Raise the high-water mark to at least this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm_top_score_at_least: Option<u64>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch that seeds a brand-new session.
    pub fn initialize(
        now: Timestamp,
        season_period: u64,
        chest_capacity: u32,
        boss_health: u64,
    ) -> Self {
        let mut patch = Self::new()
            .with_boss(&WorldBoss {
                health: boss_health,
                max_health: boss_health,
                active: false,
                spawned_at_wave: 0,
                spawned_at: 0,
            })
            .with_top_score(1);
        patch.community_chest = Some(ChestPatch {
            capacity: Some(chest_capacity),
            items: BTreeMap::new(),
        });
        patch.marketplace = Some(MarketplacePatch::default());
        for (realm, season) in (1..).zip(Season::CYCLE) {
            patch = patch.with_realm_season(realm, season, now + season_period);
        }
        patch
    }

    pub fn with_boss(mut self, boss: &WorldBoss) -> Self {
        self.world_boss = Some(WorldBossPatch::from(boss));
        self
    }

    pub fn with_boss_patch(mut self, boss: WorldBossPatch) -> Self {
        self.world_boss = Some(match self.world_boss.take() {
            Some(existing) => existing.merge(boss),
            None => boss,
        });
        self
    }

    pub fn with_chest_slot(mut self, index: u32, item: Option<Item>) -> Self {
        self.community_chest
            .get_or_insert_with(ChestPatch::default)
            .items
            .insert(index, item);
        self
    }

    pub fn with_listing(mut self, id: impl Into<ListingId>, listing: Option<Listing>) -> Self {
        self.marketplace
            .get_or_insert_with(MarketplacePatch::default)
            .listings
            .insert(id.into(), listing);
        self
    }

    pub fn with_slot_purchases(mut self, client: impl Into<ClientId>, count: u64) -> Self {
        self.chest_slot_purchases.insert(client.into(), count);
        self
    }

    pub fn with_realm_season(mut self, realm: RealmId, season: Season, next: Timestamp) -> Self {
        self.realm_seasons.insert(
            realm,
            RealmSeasonPatch {
                current: Some(season),
                next_change_at: Some(next),
            },
        );
        self
    }

    pub fn with_top_score(mut self, score: u64) -> Self {
        self.realm_top_score = Some(score);
        self
    }

    pub fn with_top_score_at_least(mut self, score: u64) -> Self {
        self.realm_top_score_at_least = Some(score);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.world_boss.as_ref().is_none_or(WorldBossPatch::is_empty)
            && self
                .community_chest
                .as_ref()
                .is_none_or(|c| c.capacity.is_none() && c.items.is_empty())
            && self
                .marketplace
                .as_ref()
                .is_none_or(|m| m.listings.is_empty())
            && self.chest_slot_purchases.is_empty()
            && self.realm_seasons.is_empty()
            && self.realm_top_score.is_none()
            && self.realm_top_score_at_least.is_none()
    }

    /// Compose two patches; `later` wins on every leaf both touch.
    pub fn merge(mut self, later: SessionPatch) -> SessionPatch {
        if let Some(boss) = later.world_boss {
            self = self.with_boss_patch(boss);
        }
        if let Some(chest) = later.community_chest {
            let target = self.community_chest.get_or_insert_with(ChestPatch::default);
            target.capacity = chest.capacity.or(target.capacity);
            target.items.extend(chest.items);
        }
        if let Some(market) = later.marketplace {
            self.marketplace
                .get_or_insert_with(MarketplacePatch::default)
                .listings
                .extend(market.listings);
        }
        self.chest_slot_purchases.extend(later.chest_slot_purchases);
        for (realm, season) in later.realm_seasons {
            let target = self.realm_seasons.entry(realm).or_default();
            target.current = season.current.or(target.current);
            target.next_change_at = season.next_change_at.or(target.next_change_at);
        }
        // A later overwrite discards any earlier raise.
        let earlier_raise = if later.realm_top_score.is_some() {
            None
        } else {
            self.realm_top_score_at_least
        };
        self.realm_top_score = later.realm_top_score.or(self.realm_top_score);
        self.realm_top_score_at_least = match (earlier_raise, later.realm_top_score_at_least) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self
    }

    /// Encode as a JSON merge patch.
    pub fn to_json(&self) -> Result<Vec<u8>, crate::DocError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON merge patch.
    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::DocError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Apply
// ============================================================================

impl SessionDocument {
    /// Merge `patch` into the document.
    ///
    /// Never fails. Keys not mentioned in the patch are left untouched.
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(boss_patch) = &patch.world_boss {
            apply_boss(&mut self.world_boss, boss_patch);
        }

        if let Some(chest) = &patch.community_chest {
            if let Some(capacity) = chest.capacity {
                self.community_chest.capacity = capacity;
            }
            apply_entries(&mut self.community_chest.items, &chest.items);
        }

        if let Some(market) = &patch.marketplace {
            apply_entries(&mut self.marketplace.listings, &market.listings);
        }

        for (client, &count) in &patch.chest_slot_purchases {
            let slot = self.chest_slot_purchases.entry(client.clone()).or_default();
            *slot = MergePolicy::Replace.merge_scalar(*slot, count);
        }

        for (&realm, season_patch) in &patch.realm_seasons {
            let entry = self.realm_seasons.entry(realm).or_insert(RealmSeason {
                current: Season::Spring,
                next_change_at: 0,
            });
            if let Some(current) = season_patch.current {
                entry.current = current;
            }
            if let Some(next) = season_patch.next_change_at {
                entry.next_change_at = next;
            }
        }

        if let Some(score) = patch.realm_top_score {
            self.realm_top_score = MergePolicy::Replace.merge_scalar(self.realm_top_score, score);
        }
        if let Some(score) = patch.realm_top_score_at_least {
            self.realm_top_score = MergePolicy::Max.merge_scalar(self.realm_top_score, score);
        }
    }
}

fn apply_boss(slot: &mut Option<WorldBoss>, patch: &WorldBossPatch) {
    if patch.is_empty() {
        return;
    }
    let boss = slot.get_or_insert(WorldBoss {
        health: 0,
        max_health: 0,
        active: false,
        spawned_at_wave: 0,
        spawned_at: 0,
    });
    if let Some(health) = patch.health {
        boss.health = MergePolicy::Replace.merge_scalar(boss.health, health);
    }
    if let Some(max_health) = patch.max_health {
        boss.max_health = max_health;
    }
    if let Some(active) = patch.active {
        boss.active = active;
    }
    if let Some(wave) = patch.spawned_at_wave {
        boss.spawned_at_wave = wave;
    }
    if let Some(at) = patch.spawned_at {
        boss.spawned_at = at;
    }
    if let Some(damage) = patch.damage {
        boss.health = MergePolicy::Deduct.merge_scalar(boss.health, damage);
    }
}

fn apply_entries<K: Ord + Clone, V: Clone>(
    target: &mut BTreeMap<K, V>,
    entries: &BTreeMap<K, Option<V>>,
) {
    for (key, value) in entries {
        match value {
            Some(value) => {
                target.insert(key.clone(), value.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
