//! Per-client presence records.
//!
//! A record is owned by exactly one client. Only the owner writes it; the
//! directory removes it when the owner's connection drops.

use serde::{Deserialize, Serialize};

use crate::ClientId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterClass {
    #[default]
    Warrior,
    Mage,
    Archer,
    Paladin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Keyboard,
    Touch,
}

/// Last reported input state, shared for spectating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Controls {
    pub mode: ControlMode,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub username: String,
    pub avatar_url: String,
    pub damage_dealt: u64,
    pub wave_reached: u64,
    pub player_level: u32,
    pub current_class: CharacterClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controls: Option<Controls>,
}

impl PresenceRecord {
    /// Fresh record for a joining client.
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            username: "Player".to_string(),
            wave_reached: 1,
            player_level: 1,
            ..Default::default()
        }
    }

    /// Merge `patch` into this record. `client_id` is never patched.
    pub fn apply(&mut self, patch: &PresencePatch) {
        if let Some(username) = &patch.username {
            self.username.clone_from(username);
        }
        if let Some(avatar_url) = &patch.avatar_url {
            self.avatar_url.clone_from(avatar_url);
        }
        if let Some(damage) = patch.damage_dealt {
            self.damage_dealt = damage;
        }
        if let Some(wave) = patch.wave_reached {
            self.wave_reached = wave;
        }
        if let Some(level) = patch.player_level {
            self.player_level = level;
        }
        if let Some(class) = patch.current_class {
            self.current_class = class;
        }
        if let Some(controls) = patch.controls {
            self.controls = Some(controls);
        }
    }
}

/// Partial update of the caller's own presence record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresencePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage_dealt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_reached: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_class: Option<CharacterClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controls: Option<Controls>,
}

impl PresencePatch {
    pub fn to_json(&self) -> Result<Vec<u8>, crate::DocError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::DocError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_touches_only_named_fields() {
        let mut record = PresenceRecord::new("a2");
        record.apply(&PresencePatch {
            wave_reached: Some(12),
            ..Default::default()
        });
        assert_eq!(record.wave_reached, 12);
        assert_eq!(record.player_level, 1);
        assert_eq!(record.username, "Player");
        assert_eq!(record.client_id, "a2");
    }

    #[test]
    fn test_presence_json_field_names() {
        let patch = PresencePatch {
            current_class: Some(CharacterClass::Mage),
            damage_dealt: Some(50),
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_slice(&patch.to_json().unwrap()).unwrap();
        assert_eq!(json["currentClass"], "mage");
        assert_eq!(json["damageDealt"], 50);
        assert!(json.get("username").is_none());
    }
}
