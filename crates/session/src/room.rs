//! Room relay.
//!
//! The relay owns the authoritative session document and presence map for
//! one room and fans frames out to connected members. It performs no game
//! validation: any member may write any key. Frames are processed strictly
//! in arrival order.
//!
//! Per-member outboxes stand in for the duplex transport; the embedding
//! runtime drains them with [`Room::take_outbox`].

use std::collections::{BTreeMap, VecDeque};

use realmsync_doc::{ClientId, PresencePatch};
use realmsync_wire::{
    DocumentPatch, DocumentSnapshot, EventEnvelope, PROTOCOL_VERSION, PatchAck, PatchRejected,
    PresenceSnapshot, PresenceUpdate, ServerWelcome, WireError, decode_frame, encode_frame, frame,
};

use crate::broadcast::BroadcastChannel;
use crate::presence::PresenceDirectory;
use crate::store::{PatchMergeStore, Version};

/// What the relay did with one incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Welcomed,
    /// Plain patch merged.
    Applied { version: Version },
    /// Conditional patch accepted.
    Acked { request_id: u64, version: Version },
    /// Conditional patch lost its race.
    Rejected { request_id: u64, conflicts: usize },
    PresenceUpdated,
    EventRelayed { recipients: usize },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownMember,
    Malformed,
    /// A server-to-client frame arrived from a client.
    Unexpected,
    ProtocolMismatch,
    NotGreeted,
}

#[derive(Debug, Default)]
struct Member {
    greeted: bool,
    outbox: VecDeque<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct Room {
    store: PatchMergeStore,
    presence: PresenceDirectory,
    members: BTreeMap<ClientId, Member>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport connection. Returns false if already connected.
    pub fn connect(&mut self, client_id: impl Into<ClientId>) -> bool {
        let client_id = client_id.into();
        if self.members.contains_key(&client_id) {
            return false;
        }
        tracing::debug!(client_id = %client_id, "member connected");
        self.members.insert(client_id, Member::default());
        true
    }

    /// Drop a connection and its presence record.
    pub fn disconnect(&mut self, client_id: &str) -> bool {
        if self.members.remove(client_id).is_none() {
            return false;
        }
        tracing::info!(client_id = %client_id, members = self.members.len(), "member left");
        if self.presence.remove(client_id).is_some() {
            self.fan_out_presence();
        }
        true
    }

    pub fn receive(&mut self, from: &str, bytes: &[u8]) -> RelayOutcome {
        if !self.members.contains_key(from) {
            tracing::warn!(client_id = %from, "frame from unknown member dropped");
            return RelayOutcome::Dropped(DropReason::UnknownMember);
        }
        let outcome = decode_frame(bytes).and_then(|body| self.dispatch(from, body));
        match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(client_id = %from, error = %err, "malformed frame dropped");
                RelayOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Take every frame queued for `client_id`, oldest first.
    pub fn take_outbox(&mut self, client_id: &str) -> Vec<Vec<u8>> {
        self.members
            .get_mut(client_id)
            .map(|member| member.outbox.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn members(&self) -> impl Iterator<Item = &ClientId> {
        self.members.keys()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn store(&self) -> &PatchMergeStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    // ========================================================================
    // Frame Handling
    // ========================================================================

    fn dispatch(&mut self, from: &str, body: frame::Body) -> Result<RelayOutcome, WireError> {
        let greeted = self.members.get(from).is_some_and(|m| m.greeted);
        match body {
            frame::Body::Hello(hello) => {
                if hello.protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        client_id = %from,
                        version = hello.protocol_version,
                        "protocol mismatch"
                    );
                    return Ok(RelayOutcome::Dropped(DropReason::ProtocolMismatch));
                }
                self.welcome(from, hello.username, hello.avatar_url)?;
                Ok(RelayOutcome::Welcomed)
            }
            _ if !greeted => Ok(RelayOutcome::Dropped(DropReason::NotGreeted)),
            frame::Body::Patch(patch) => self.on_patch(from, patch),
            frame::Body::Presence(update) => self.on_presence(from, update),
            frame::Body::Event(envelope) => self.on_event(from, envelope),
            frame::Body::Welcome(_)
            | frame::Body::Ack(_)
            | frame::Body::Rejected(_)
            | frame::Body::Snapshot(_)
            | frame::Body::PresenceSnapshot(_) => {
                tracing::warn!(client_id = %from, "server frame from client dropped");
                Ok(RelayOutcome::Dropped(DropReason::Unexpected))
            }
        }
    }

    fn welcome(
        &mut self,
        from: &str,
        username: String,
        avatar_url: String,
    ) -> Result<(), WireError> {
        self.presence.set_local(
            from,
            &PresencePatch {
                username: Some(username),
                avatar_url: Some(avatar_url),
                ..Default::default()
            },
        );

        let welcome = ServerWelcome {
            client_id: from.to_string(),
            version: self.store.version(),
            document_json: self.store.current().to_json()?,
            presence_json: self.presence.to_json()?,
        };
        if let Some(member) = self.members.get_mut(from) {
            member.greeted = true;
            member.outbox.push_back(encode_frame(frame::Body::Welcome(welcome)));
        }
        tracing::info!(client_id = %from, version = self.store.version(), "member joined");

        self.fan_out_presence();
        Ok(())
    }

    fn on_patch(&mut self, from: &str, patch: DocumentPatch) -> Result<RelayOutcome, WireError> {
        let request_id = patch.request_id;
        let conditional = patch.to_conditional()?;

        if !patch.is_conditional() {
            let before = self.store.version();
            let version = self.store.apply(&conditional.patch);
            self.send_to(from, frame::Body::Ack(PatchAck { request_id, version }));
            if version != before {
                self.fan_out_snapshot()?;
            }
            return Ok(RelayOutcome::Applied { version });
        }

        match self.store.apply_conditional(&conditional) {
            Ok(version) => {
                tracing::debug!(
                    client_id = %from,
                    request_id,
                    version,
                    "conditional patch accepted"
                );
                self.send_to(from, frame::Body::Ack(PatchAck { request_id, version }));
                self.fan_out_snapshot()?;
                Ok(RelayOutcome::Acked { request_id, version })
            }
            Err(rejected) => {
                tracing::debug!(
                    client_id = %from,
                    request_id,
                    conflicts = rejected.conflicts.len(),
                    "conditional patch rejected"
                );
                self.send_to(
                    from,
                    frame::Body::Rejected(PatchRejected::new(request_id, &rejected.conflicts)),
                );
                Ok(RelayOutcome::Rejected {
                    request_id,
                    conflicts: rejected.conflicts.len(),
                })
            }
        }
    }

    fn on_presence(
        &mut self,
        from: &str,
        update: PresenceUpdate,
    ) -> Result<RelayOutcome, WireError> {
        let patch = PresencePatch::from_json(&update.patch_json)?;
        // Owner is the connection, so a client can only ever touch its own record.
        self.presence.set_local(from, &patch);
        self.fan_out_presence();
        Ok(RelayOutcome::PresenceUpdated)
    }

    fn on_event(&mut self, from: &str, envelope: EventEnvelope) -> Result<RelayOutcome, WireError> {
        let event = envelope.to_event()?;
        let greeted: Vec<ClientId> = self
            .members
            .iter()
            .filter(|(_, member)| member.greeted)
            .map(|(id, _)| id.clone())
            .collect();

        let deliveries = BroadcastChannel::send(from, &event, &greeted);
        let recipients = deliveries.len();
        for delivery in deliveries {
            let mut outgoing = EventEnvelope::outgoing(&delivery.event);
            outgoing.sender_id = delivery.sender;
            self.send_to(&delivery.recipient, frame::Body::Event(outgoing));
        }
        Ok(RelayOutcome::EventRelayed { recipients })
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    fn send_to(&mut self, client_id: &str, body: frame::Body) {
        if let Some(member) = self.members.get_mut(client_id) {
            member.outbox.push_back(encode_frame(body));
        }
    }

    fn broadcast(&mut self, bytes: Vec<u8>) {
        for member in self.members.values_mut().filter(|m| m.greeted) {
            member.outbox.push_back(bytes.clone());
        }
    }

    fn fan_out_snapshot(&mut self) -> Result<(), WireError> {
        let snapshot = DocumentSnapshot {
            version: self.store.version(),
            document_json: self.store.current().to_json()?,
        };
        self.broadcast(encode_frame(frame::Body::Snapshot(snapshot)));
        Ok(())
    }

    fn fan_out_presence(&mut self) {
        match self.presence.to_json() {
            Ok(records_json) => {
                let bytes = encode_frame(frame::Body::PresenceSnapshot(PresenceSnapshot {
                    records_json,
                }));
                self.broadcast(bytes);
            }
            Err(err) => tracing::warn!(error = %err, "presence snapshot not encodable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmsync_doc::{SessionEvent, SessionPatch};
    use realmsync_wire::ClientHello;

    fn hello(name: &str) -> Vec<u8> {
        encode_frame(frame::Body::Hello(ClientHello {
            username: name.to_string(),
            avatar_url: String::new(),
            protocol_version: PROTOCOL_VERSION,
        }))
    }

    fn joined(ids: &[&str]) -> Room {
        let mut room = Room::new();
        for id in ids {
            room.connect(*id);
            assert_eq!(room.receive(id, &hello(id)), RelayOutcome::Welcomed);
        }
        for id in ids {
            room.take_outbox(id);
        }
        room
    }

    fn bodies(room: &mut Room, id: &str) -> Vec<frame::Body> {
        room.take_outbox(id)
            .iter()
            .map(|bytes| decode_frame(bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_hello_gets_welcome_and_presence() {
        let mut room = Room::new();
        room.connect("a2");
        room.receive("a2", &hello("alice"));

        let frames = bodies(&mut room, "a2");
        let frame::Body::Welcome(welcome) = &frames[0] else {
            panic!("expected welcome first");
        };
        assert_eq!(welcome.client_id, "a2");
        assert!(matches!(frames[1], frame::Body::PresenceSnapshot(_)));
        assert_eq!(room.presence().get("a2").unwrap().username, "alice");
    }

    #[test]
    fn test_plain_patch_fans_out_snapshot() {
        let mut room = joined(&["a2", "b7"]);
        let patch = DocumentPatch::plain(1, &SessionPatch::new().with_top_score(4)).unwrap();
        let outcome = room.receive("a2", &encode_frame(frame::Body::Patch(patch)));
        assert_eq!(outcome, RelayOutcome::Applied { version: 1 });

        let b_frames = bodies(&mut room, "b7");
        assert!(matches!(&b_frames[..], [frame::Body::Snapshot(s)] if s.version == 1));
        assert_eq!(room.store().current().realm_top_score, 4);
    }

    #[test]
    fn test_event_skips_sender() {
        let mut room = joined(&["a2", "b7", "c9"]);
        let envelope = EventEnvelope::outgoing(&SessionEvent::SkillUsed { skill_index: 2 });
        let outcome = room.receive("b7", &encode_frame(frame::Body::Event(envelope)));
        assert_eq!(outcome, RelayOutcome::EventRelayed { recipients: 2 });

        assert!(bodies(&mut room, "b7").is_empty());
        let frames = bodies(&mut room, "a2");
        let frame::Body::Event(received) = &frames[0] else {
            panic!("expected event");
        };
        assert_eq!(received.sender_id, "b7");
    }

    #[test]
    fn test_disconnect_drops_presence() {
        let mut room = joined(&["a2", "b7"]);
        assert!(room.disconnect("b7"));
        assert!(room.presence().get("b7").is_none());

        let frames = bodies(&mut room, "a2");
        let frame::Body::PresenceSnapshot(snapshot) = &frames[0] else {
            panic!("expected presence snapshot");
        };
        let map = PresenceDirectory::map_from_json(&snapshot.records_json).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a2"]);
        assert!(!room.disconnect("b7"));
    }

    #[test]
    fn test_malformed_and_unknown_frames_dropped() {
        let mut room = joined(&["a2"]);
        assert_eq!(
            room.receive("a2", &[0xff, 0x01]),
            RelayOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(
            room.receive("zz", &hello("zz")),
            RelayOutcome::Dropped(DropReason::UnknownMember)
        );

        let bogus = DocumentPatch {
            request_id: 9,
            patch_json: b"{not json".to_vec(),
            expectations: Vec::new(),
        };
        assert_eq!(
            room.receive("a2", &encode_frame(frame::Body::Patch(bogus))),
            RelayOutcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(room.store().version(), 0);
    }

    #[test]
    fn test_frames_before_hello_ignored() {
        let mut room = Room::new();
        room.connect("a2");
        let patch = DocumentPatch::plain(1, &SessionPatch::new().with_top_score(4)).unwrap();
        assert_eq!(
            room.receive("a2", &encode_frame(frame::Body::Patch(patch))),
            RelayOutcome::Dropped(DropReason::NotGreeted)
        );
    }

    #[test]
    fn test_presence_update_binds_sender() {
        let mut room = joined(&["a2", "b7"]);
        let update = PresenceUpdate {
            patch_json: PresencePatch {
                wave_reached: Some(30),
                ..Default::default()
            }
            .to_json()
            .unwrap(),
        };
        room.receive("b7", &encode_frame(frame::Body::Presence(update)));

        assert_eq!(room.presence().get("b7").unwrap().wave_reached, 30);
        assert_eq!(room.presence().get("a2").unwrap().wave_reached, 1);
    }
}
