//! Realm Sync Wire Protocol Types
//!
//! This crate defines the Protobuf frames exchanged between a room client and
//! the room relay over an opaque duplex transport. Both sides MUST depend on
//! this crate so the schema cannot drift.
//!
//! # Frame Categories
//!
//! - **Membership**: `ClientHello`, `ServerWelcome`
//! - **Document**: `DocumentPatch`, `PatchAck`, `PatchRejected`, `DocumentSnapshot`
//! - **Presence**: `PresenceUpdate`, `PresenceSnapshot`
//! - **Broadcast**: `EventEnvelope`
//!
//! Document and presence payloads are JSON merge patches carried as opaque
//! bytes; their schema lives in `realmsync-doc`. Slot expectations and
//! broadcast events are closed shapes and are modelled in Protobuf directly.

#![deny(unsafe_code)]

use prost::Message;
use realmsync_doc::{
    ConditionalPatch, DocError, SessionEvent, SessionPatch, SlotConflict, SlotExpectation,
    SlotRef, WorldBoss,
};
use thiserror::Error;

/// Protocol revision announced in `ClientHello`.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while decoding or converting frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("frame has no body")]
    EmptyFrame,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid json payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Doc(#[from] DocError),
}

// ============================================================================
// Membership Frames
// ============================================================================

/// Client announces itself after the transport opens.
#[derive(Clone, PartialEq, Message)]
pub struct ClientHello {
    #[prost(string, tag = "1")]
    pub username: String,

    #[prost(string, tag = "2")]
    pub avatar_url: String,

    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
}

/// Relay response carrying the current shared state.
#[derive(Clone, PartialEq, Message)]
pub struct ServerWelcome {
    /// Connection-stable identifier assigned by the transport.
    #[prost(string, tag = "1")]
    pub client_id: String,

    /// Document version at the time of joining.
    #[prost(uint64, tag = "2")]
    pub version: u64,

    /// JSON encoding of the full session document.
    #[prost(bytes = "vec", tag = "3")]
    pub document_json: Vec<u8>,

    /// JSON encoding of the full presence map.
    #[prost(bytes = "vec", tag = "4")]
    pub presence_json: Vec<u8>,
}

// ============================================================================
// Document Frames
// ============================================================================

/// Expected occupant of one slot.
#[derive(Clone, PartialEq, Message)]
pub struct SlotExpectationProto {
    #[prost(oneof = "slot_expectation_proto::Slot", tags = "1, 2")]
    pub slot: Option<slot_expectation_proto::Slot>,

    /// Expected occupant item id; absent means "expected empty".
    #[prost(string, optional, tag = "3")]
    pub expected: Option<String>,
}

pub mod slot_expectation_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Slot {
        #[prost(uint32, tag = "1")]
        ChestSlot(u32),
        #[prost(string, tag = "2")]
        ListingId(String),
    }
}

/// A slot whose occupant no longer matched at apply time.
#[derive(Clone, PartialEq, Message)]
pub struct SlotConflictProto {
    #[prost(message, optional, tag = "1")]
    pub expectation: Option<SlotExpectationProto>,

    #[prost(string, optional, tag = "2")]
    pub observed: Option<String>,
}

/// Client submits a partial document update.
///
/// A patch with one or more expectations is conditional: the relay applies
/// it only if every expectation still holds.
#[derive(Clone, PartialEq, Message)]
pub struct DocumentPatch {
    /// Client-chosen correlation id, echoed in `PatchAck`/`PatchRejected`.
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    /// JSON merge patch.
    #[prost(bytes = "vec", tag = "2")]
    pub patch_json: Vec<u8>,

    #[prost(message, repeated, tag = "3")]
    pub expectations: Vec<SlotExpectationProto>,
}

/// Relay accepted a patch.
#[derive(Clone, PartialEq, Message)]
pub struct PatchAck {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    /// Document version after the patch.
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

/// Relay rejected a conditional patch; nothing was applied.
#[derive(Clone, PartialEq, Message)]
pub struct PatchRejected {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    #[prost(message, repeated, tag = "2")]
    pub conflicts: Vec<SlotConflictProto>,
}

/// Merged document after an accepted patch.
#[derive(Clone, PartialEq, Message)]
pub struct DocumentSnapshot {
    #[prost(uint64, tag = "1")]
    pub version: u64,

    #[prost(bytes = "vec", tag = "2")]
    pub document_json: Vec<u8>,
}

// ============================================================================
// Presence Frames
// ============================================================================

/// Client patches its own presence record.
#[derive(Clone, PartialEq, Message)]
pub struct PresenceUpdate {
    #[prost(bytes = "vec", tag = "1")]
    pub patch_json: Vec<u8>,
}

/// Full presence map after any add/update/remove.
#[derive(Clone, PartialEq, Message)]
pub struct PresenceSnapshot {
    #[prost(bytes = "vec", tag = "1")]
    pub records_json: Vec<u8>,
}

// ============================================================================
// Broadcast Frames
// ============================================================================

/// World boss payload carried by the spawn hint.
#[derive(Clone, PartialEq, Message)]
pub struct WorldBossProto {
    #[prost(uint64, tag = "1")]
    pub health: u64,

    #[prost(uint64, tag = "2")]
    pub max_health: u64,

    #[prost(bool, tag = "3")]
    pub active: bool,

    #[prost(uint64, tag = "4")]
    pub spawned_at_wave: u64,

    #[prost(uint64, tag = "5")]
    pub spawned_at: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SkillUsedProto {
    #[prost(uint32, tag = "1")]
    pub skill_index: u32,
}

/// A broadcast event. The relay fills `sender_id`; clients leave it empty.
#[derive(Clone, PartialEq, Message)]
pub struct EventEnvelope {
    #[prost(string, tag = "1")]
    pub sender_id: String,

    #[prost(oneof = "event_envelope::Event", tags = "2, 3")]
    pub event: Option<event_envelope::Event>,
}

pub mod event_envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "2")]
        SkillUsed(super::SkillUsedProto),
        #[prost(message, tag = "3")]
        WorldBossSpawned(super::WorldBossProto),
    }
}

// ============================================================================
// Frame Envelope
// ============================================================================

/// Every message on the transport is exactly one `Frame`.
#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(oneof = "frame::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub body: Option<frame::Body>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Hello(super::ClientHello),
        #[prost(message, tag = "2")]
        Welcome(super::ServerWelcome),
        #[prost(message, tag = "3")]
        Patch(super::DocumentPatch),
        #[prost(message, tag = "4")]
        Ack(super::PatchAck),
        #[prost(message, tag = "5")]
        Rejected(super::PatchRejected),
        #[prost(message, tag = "6")]
        Snapshot(super::DocumentSnapshot),
        #[prost(message, tag = "7")]
        Presence(super::PresenceUpdate),
        #[prost(message, tag = "8")]
        PresenceSnapshot(super::PresenceSnapshot),
        #[prost(message, tag = "9")]
        Event(super::EventEnvelope),
    }
}

impl Frame {
    pub fn new(body: frame::Body) -> Self {
        Self { body: Some(body) }
    }
}

/// Encode a frame body for the transport.
pub fn encode_frame(body: frame::Body) -> Vec<u8> {
    Frame::new(body).encode_to_vec()
}

/// Decode transport bytes into a frame body.
pub fn decode_frame(bytes: &[u8]) -> Result<frame::Body, WireError> {
    Frame::decode(bytes)?.body.ok_or(WireError::EmptyFrame)
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&SlotRef> for slot_expectation_proto::Slot {
    fn from(slot: &SlotRef) -> Self {
        match slot {
            SlotRef::ChestSlot(index) => Self::ChestSlot(*index),
            SlotRef::Listing(id) => Self::ListingId(id.clone()),
        }
    }
}

impl From<slot_expectation_proto::Slot> for SlotRef {
    fn from(slot: slot_expectation_proto::Slot) -> Self {
        match slot {
            slot_expectation_proto::Slot::ChestSlot(index) => Self::ChestSlot(index),
            slot_expectation_proto::Slot::ListingId(id) => Self::Listing(id),
        }
    }
}

impl From<&SlotExpectation> for SlotExpectationProto {
    fn from(exp: &SlotExpectation) -> Self {
        Self {
            slot: Some((&exp.slot).into()),
            expected: exp.expected.clone(),
        }
    }
}

impl TryFrom<SlotExpectationProto> for SlotExpectation {
    type Error = WireError;

    fn try_from(proto: SlotExpectationProto) -> Result<Self, Self::Error> {
        let slot = proto.slot.ok_or(WireError::MissingField("slot"))?;
        Ok(Self {
            slot: slot.into(),
            expected: proto.expected,
        })
    }
}

impl From<&SlotConflict> for SlotConflictProto {
    fn from(conflict: &SlotConflict) -> Self {
        Self {
            expectation: Some(SlotExpectationProto {
                slot: Some((&conflict.slot).into()),
                expected: conflict.expected.clone(),
            }),
            observed: conflict.observed.clone(),
        }
    }
}

impl TryFrom<SlotConflictProto> for SlotConflict {
    type Error = WireError;

    fn try_from(proto: SlotConflictProto) -> Result<Self, Self::Error> {
        let expectation: SlotExpectation = proto
            .expectation
            .ok_or(WireError::MissingField("expectation"))?
            .try_into()?;
        Ok(Self {
            slot: expectation.slot,
            expected: expectation.expected,
            observed: proto.observed,
        })
    }
}

impl From<&WorldBoss> for WorldBossProto {
    fn from(boss: &WorldBoss) -> Self {
        Self {
            health: boss.health,
            max_health: boss.max_health,
            active: boss.active,
            spawned_at_wave: boss.spawned_at_wave,
            spawned_at: boss.spawned_at,
        }
    }
}

impl From<WorldBossProto> for WorldBoss {
    fn from(proto: WorldBossProto) -> Self {
        Self {
            health: proto.health,
            max_health: proto.max_health,
            active: proto.active,
            spawned_at_wave: proto.spawned_at_wave,
            spawned_at: proto.spawned_at,
        }
    }
}

impl From<&SessionEvent> for event_envelope::Event {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::SkillUsed { skill_index } => Self::SkillUsed(SkillUsedProto {
                skill_index: *skill_index,
            }),
            SessionEvent::WorldBossSpawned { boss } => Self::WorldBossSpawned(boss.into()),
        }
    }
}

impl From<event_envelope::Event> for SessionEvent {
    fn from(event: event_envelope::Event) -> Self {
        match event {
            event_envelope::Event::SkillUsed(skill) => Self::SkillUsed {
                skill_index: skill.skill_index,
            },
            event_envelope::Event::WorldBossSpawned(boss) => Self::WorldBossSpawned {
                boss: boss.into(),
            },
        }
    }
}

impl EventEnvelope {
    /// Envelope for an outgoing event (sender filled by the relay).
    pub fn outgoing(event: &SessionEvent) -> Self {
        Self {
            sender_id: String::new(),
            event: Some(event.into()),
        }
    }

    /// Decode the typed event.
    pub fn to_event(&self) -> Result<SessionEvent, WireError> {
        self.event
            .clone()
            .map(SessionEvent::from)
            .ok_or(WireError::MissingField("event"))
    }
}

impl DocumentPatch {
    /// Unconditional patch.
    pub fn plain(request_id: u64, patch: &SessionPatch) -> Result<Self, WireError> {
        Ok(Self {
            request_id,
            patch_json: patch.to_json()?,
            expectations: Vec::new(),
        })
    }

    /// Patch guarded by slot expectations.
    pub fn conditional(request_id: u64, conditional: &ConditionalPatch) -> Result<Self, WireError> {
        Ok(Self {
            request_id,
            patch_json: conditional.patch.to_json()?,
            expectations: conditional.expectations.iter().map(Into::into).collect(),
        })
    }

    pub fn is_conditional(&self) -> bool {
        !self.expectations.is_empty()
    }

    /// Decode into the typed patch plus its expectations.
    pub fn to_conditional(&self) -> Result<ConditionalPatch, WireError> {
        let patch = SessionPatch::from_json(&self.patch_json)?;
        let expectations = self
            .expectations
            .iter()
            .cloned()
            .map(SlotExpectation::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ConditionalPatch::new(patch, expectations))
    }
}

impl PatchRejected {
    pub fn new(request_id: u64, conflicts: &[SlotConflict]) -> Self {
        Self {
            request_id,
            conflicts: conflicts.iter().map(Into::into).collect(),
        }
    }

    pub fn to_conflicts(&self) -> Result<Vec<SlotConflict>, WireError> {
        self.conflicts
            .iter()
            .cloned()
            .map(SlotConflict::try_from)
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
