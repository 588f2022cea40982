//! Fire-and-forget session events.
//!
//! Events carry no authoritative state. Anything an event describes can be
//! re-derived from the session document; payloads only hide latency.

use serde::{Deserialize, Serialize};

use crate::WorldBoss;

/// Every event kind that may travel on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum SessionEvent {
    /// Another player cast a skill.
    SkillUsed {
        #[serde(rename = "skillIndex")]
        skill_index: u32,
    },
    /// A world boss was spawned; `boss` is a hint, re-read the document.
    WorldBossSpawned { boss: WorldBoss },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SkillUsed { .. } => "skill-used",
            Self::WorldBossSpawned { .. } => "world-boss-spawned",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_serde_tag() {
        let event = SessionEvent::SkillUsed { skill_index: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }

    #[test]
    fn test_fields_are_camel_case() {
        let event = SessionEvent::SkillUsed { skill_index: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["skillIndex"], 2);
        assert!(json.get("skill_index").is_none());

        let back: SessionEvent =
            serde_json::from_str(r#"{"type":"skill-used","skillIndex":4}"#).unwrap();
        assert_eq!(back, SessionEvent::SkillUsed { skill_index: 4 });
    }
}
