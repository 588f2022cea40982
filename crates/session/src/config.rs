//! Session configuration.
//!
//! Defaults are embedded as JSON and may be overridden from a file. Missing
//! keys fall back to the compiled-in constants.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use realmsync_doc::progress::INVENTORY_SIZE;
use realmsync_doc::{DEFAULT_CHEST_CAPACITY, DEFAULT_SEASON_PERIOD_MS, INITIAL_BOSS_HEALTH, Rarity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator::ClaimMode;
use crate::world_boss::DamageMode;

pub const BUILTIN_SESSION_CONFIG: &str = include_str!("data/session_config.json");

// ============================================================================
// Defaults
// ============================================================================

/// How often the elected leader checks season deadlines.
pub const SEASON_CHECK_INTERVAL_MS: u64 = 60_000;

/// How often local progression is saved.
pub const AUTOSAVE_INTERVAL_MS: u64 = 120_000;

/// A world boss may spawn every this many waves.
pub const BOSS_WAVE_INTERVAL: u64 = 10;

pub const BOSS_XP_PER_REALM: u64 = 500;
pub const BOSS_GOLD_PER_REALM: u64 = 1_000;

/// Rarities allowed on the marketplace.
pub const TRADABLE_RARITIES: [Rarity; 3] = [Rarity::Common, Rarity::Uncommon, Rarity::Rare];

/// How a newly reached realm is folded into `realmTopScore`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TopScorePolicy {
    /// Absolute overwrite; concurrent writers can regress the mark.
    Replace,
    /// High-water mark; the stored value never decreases.
    #[default]
    Max,
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub chest_capacity: u32,
    pub inventory_size: usize,
    pub season_period_ms: u64,
    pub season_check_interval_ms: u64,
    pub autosave_interval_ms: u64,
    pub boss_health_per_realm: u64,
    pub boss_wave_interval: u64,
    pub boss_xp_per_realm: u64,
    pub boss_gold_per_realm: u64,
    pub claim_mode: ClaimMode,
    pub damage_mode: DamageMode,
    pub top_score_policy: TopScorePolicy,
    pub tradable_rarities: Vec<Rarity>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chest_capacity: DEFAULT_CHEST_CAPACITY,
            inventory_size: INVENTORY_SIZE,
            season_period_ms: DEFAULT_SEASON_PERIOD_MS,
            season_check_interval_ms: SEASON_CHECK_INTERVAL_MS,
            autosave_interval_ms: AUTOSAVE_INTERVAL_MS,
            boss_health_per_realm: INITIAL_BOSS_HEALTH,
            boss_wave_interval: BOSS_WAVE_INTERVAL,
            boss_xp_per_realm: BOSS_XP_PER_REALM,
            boss_gold_per_realm: BOSS_GOLD_PER_REALM,
            claim_mode: ClaimMode::default(),
            damage_mode: DamageMode::default(),
            top_score_policy: TopScorePolicy::default(),
            tradable_rarities: TRADABLE_RARITIES.to_vec(),
        }
    }
}

impl SessionConfig {
    /// The embedded configuration.
    pub fn builtin() -> Self {
        Self::from_json_str(BUILTIN_SESSION_CONFIG).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "builtin session config rejected, using defaults");
            Self::default()
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn is_tradable(&self, rarity: Rarity) -> bool {
        self.tradable_rarities.contains(&rarity)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("chestCapacity", u64::from(self.chest_capacity)),
            ("inventorySize", self.inventory_size as u64),
            ("seasonPeriodMs", self.season_period_ms),
            ("seasonCheckIntervalMs", self.season_check_interval_ms),
            ("autosaveIntervalMs", self.autosave_interval_ms),
            ("bossHealthPerRealm", self.boss_health_per_realm),
            ("bossWaveInterval", self.boss_wave_interval),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse session config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read session config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid session config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
