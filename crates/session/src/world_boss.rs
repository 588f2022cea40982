//! World-boss state machine.
//!
//! ```text
//!  Dormant --spawn--> Active --health hits 0--> DefeatPending --defeat--> Dormant
//! ```
//!
//! The phase is derived from the shared document, never stored separately.
//! Rewards are local: each client keeps a ledger of boss instances it has
//! already been paid for, so repeated defeat observations pay once.

use std::collections::BTreeSet;

use realmsync_doc::{RealmId, SessionDocument, SessionPatch, Timestamp, WorldBoss, WorldBossPatch};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BossPhase {
    Dormant,
    Active,
    /// Still flagged active but out of health; someone must issue the defeat.
    DefeatPending,
}

/// How a damage write is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DamageMode {
    /// Absolute health computed from the local view. Concurrent hits lose
    /// damage (last writer wins).
    Overwrite,
    /// A damage amount the merge subtracts from the stored health.
    #[default]
    Additive,
}

pub fn phase(doc: &SessionDocument) -> BossPhase {
    match doc.active_boss() {
        None => BossPhase::Dormant,
        Some(boss) if boss.health == 0 => BossPhase::DefeatPending,
        Some(_) => BossPhase::Active,
    }
}

/// Does clearing `wave` trigger a spawn attempt?
pub fn is_boss_wave(wave: u64, wave_interval: u64) -> bool {
    wave_interval > 0 && wave > 0 && wave % wave_interval == 0
}

/// Spawn a boss for `realm` unless one is already active.
///
/// The caller also broadcasts `WorldBossSpawned` with the returned boss.
pub fn spawn(
    doc: &SessionDocument,
    realm: RealmId,
    wave: u64,
    now: Timestamp,
    health_per_realm: u64,
) -> Option<(WorldBoss, SessionPatch)> {
    if doc.active_boss().is_some() {
        return None;
    }
    let health = health_per_realm.saturating_mul(u64::from(realm.max(1)));
    let boss = WorldBoss {
        health,
        max_health: health,
        active: true,
        spawned_at_wave: wave,
        spawned_at: now,
    };
    let patch = SessionPatch::new().with_boss(&boss);
    Some((boss, patch))
}

/// Damage write for `amount` against the locally observed `boss`.
pub fn damage(boss: &WorldBoss, amount: u64, mode: DamageMode) -> SessionPatch {
    let boss_patch = match mode {
        DamageMode::Overwrite => WorldBossPatch {
            health: Some(boss.health.saturating_sub(amount)),
            ..Default::default()
        },
        DamageMode::Additive => WorldBossPatch {
            damage: Some(amount),
            ..Default::default()
        },
    };
    SessionPatch::new().with_boss_patch(boss_patch)
}

/// Mark the boss defeated. Applying it any number of times is the same.
pub fn defeat() -> SessionPatch {
    SessionPatch::new().with_boss_patch(WorldBossPatch {
        health: Some(0),
        active: Some(false),
        ..Default::default()
    })
}

// ============================================================================
// Rewards
// ============================================================================

/// Identity of one spawned boss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BossInstance {
    pub spawned_at_wave: u64,
    pub spawned_at: Timestamp,
}

impl From<&WorldBoss> for BossInstance {
    fn from(boss: &WorldBoss) -> Self {
        Self {
            spawned_at_wave: boss.spawned_at_wave,
            spawned_at: boss.spawned_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BossReward {
    pub xp: u64,
    pub gold: u64,
}

impl BossReward {
    pub fn for_realm(realm: RealmId, config: &SessionConfig) -> Self {
        let realm = u64::from(realm.max(1));
        Self {
            xp: config.boss_xp_per_realm.saturating_mul(realm),
            gold: config.boss_gold_per_realm.saturating_mul(realm),
        }
    }
}

/// Boss instances this client has been rewarded for.
#[derive(Debug, Clone, Default)]
pub struct RewardLedger {
    claimed: BTreeSet<BossInstance>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per instance.
    pub fn try_claim(&mut self, instance: BossInstance) -> bool {
        self.claimed.insert(instance)
    }

    pub fn is_claimed(&self, instance: &BossInstance) -> bool {
        self.claimed.contains(instance)
    }
}
