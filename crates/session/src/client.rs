//! Room client.
//!
//! Keeps a local replica of the session document, a mirror of the presence
//! map and the player's local progression. Every shared mutation is sent to
//! the relay as a patch; the relay's snapshots are authoritative.
//!
//! # Optimistic operations
//!
//! Guarded operations (chest in compare-and-set mode, all marketplace
//! operations) change local state immediately and remember how to undo it
//! under the request id. A `PatchRejected` or a failed send undoes the
//! change; a `PatchAck` confirms it. Nothing is retried automatically.
//!
//! Results are queued as [`ClientOutcome`]s for the embedding game to drain.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use realmsync_doc::{
    ClientId, ConditionalPatch, Item, ListingId, PlayerProgress, PresencePatch, RealmId,
    SessionDocument, SessionEvent, SessionPatch, Timestamp, WorldBoss,
};
use realmsync_persist::{BlobStore, SaveKey};
use realmsync_wire::{
    ClientHello, DocumentPatch, DocumentSnapshot, EventEnvelope, PROTOCOL_VERSION, PatchAck,
    PatchRejected, PresenceUpdate, ServerWelcome, WireError, decode_frame, encode_frame, frame,
};

use crate::allocator;
use crate::broadcast::BroadcastChannel;
use crate::config::{SessionConfig, TopScorePolicy};
use crate::error::SessionError;
use crate::leader;
use crate::presence::{PresenceDirectory, PresenceMap};
use crate::schedule::{IntervalTimers, TimerKind};
use crate::store::{DocumentWrite, PatchMergeStore, Version};
use crate::transport::Transport;
use crate::world_boss::{self, BossInstance, BossPhase, BossReward, RewardLedger};

// ============================================================================
// Outcomes
// ============================================================================

/// Guarded operation kinds, reported with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Deposit,
    Withdraw,
    List,
    CancelListing,
    Purchase,
}

/// Something the game should react to.
#[derive(Debug)]
pub enum ClientOutcome {
    Joined { client_id: ClientId },
    /// This client seeded a brand-new session.
    SessionInitialized,
    Deposited { index: u32 },
    Withdrawn { item_id: String },
    Listed { listing_id: ListingId },
    ListingCancelled { listing_id: ListingId },
    Purchased { listing_id: ListingId, price: u64 },
    ChestSlotPurchased { owned: u64 },
    /// A guarded operation was undone.
    Failed { operation: Operation, error: SessionError },
    RealmReached { realm: RealmId },
    BossSpawned { boss: WorldBoss },
    BossDefeated { reward: BossReward },
    SkillUsed { by: ClientId, skill_index: u32 },
    SeasonsRotated { realms: usize },
    Saved { slot: u32 },
}

/// Undo information for an in-flight guarded write.
#[derive(Debug, Clone)]
enum PendingOp {
    /// Item left inventory slot `slot`, which stays held until the write
    /// settles; the item goes back there on rejection.
    Deposit { index: u32, slot: usize, item: Item },
    /// Item entered the inventory; remove it on rejection.
    Withdraw { item_id: String },
    List {
        listing_id: ListingId,
        slot: usize,
        item: Item,
    },
    /// Item enters the held `slot` only once the removal is acknowledged.
    Cancel {
        listing_id: ListingId,
        slot: usize,
        item: Item,
    },
    Purchase {
        listing_id: ListingId,
        item_id: String,
        price: u64,
    },
}

impl PendingOp {
    fn operation(&self) -> Operation {
        match self {
            Self::Deposit { .. } => Operation::Deposit,
            Self::Withdraw { .. } => Operation::Withdraw,
            Self::List { .. } => Operation::List,
            Self::Cancel { .. } => Operation::CancelListing,
            Self::Purchase { .. } => Operation::Purchase,
        }
    }
}

struct AutosaveTarget {
    store: Box<dyn BlobStore>,
    slot: u32,
}

// ============================================================================
// Client
// ============================================================================

pub struct RoomClient<T: Transport> {
    config: SessionConfig,
    transport: T,
    username: String,
    client_id: Option<ClientId>,
    replica: PatchMergeStore,
    presence: PresenceDirectory,
    events: BroadcastChannel,
    progress: PlayerProgress,
    pending: BTreeMap<u64, PendingOp>,
    next_request_id: u64,
    next_listing_seq: u64,
    rewards: RewardLedger,
    /// Boss instances this client has damaged.
    engaged: BTreeSet<BossInstance>,
    timers: IntervalTimers,
    autosave: Option<AutosaveTarget>,
    outcomes: VecDeque<ClientOutcome>,
}

impl<T: Transport> RoomClient<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let mut progress = PlayerProgress::default();
        progress.inventory.normalize(config.inventory_size);
        Self {
            config,
            transport,
            username: String::new(),
            client_id: None,
            replica: PatchMergeStore::new(),
            presence: PresenceDirectory::new(),
            events: BroadcastChannel::new(),
            progress,
            pending: BTreeMap::new(),
            next_request_id: 1,
            next_listing_seq: 0,
            rewards: RewardLedger::new(),
            engaged: BTreeSet::new(),
            timers: IntervalTimers::new(),
            autosave: None,
            outcomes: VecDeque::new(),
        }
    }

    pub fn with_progress(mut self, mut progress: PlayerProgress) -> Self {
        progress.inventory.normalize(self.config.inventory_size);
        self.progress = progress;
        self
    }

    /// Save progression to `store` every `autosave_interval_ms` once joined.
    pub fn with_autosave(mut self, store: Box<dyn BlobStore>, slot: u32) -> Self {
        self.autosave = Some(AutosaveTarget { store, slot });
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn document(&self) -> &SessionDocument {
        self.replica.current()
    }

    pub fn version(&self) -> Version {
        self.replica.version()
    }

    pub fn replica_mut(&mut self) -> &mut PatchMergeStore {
        &mut self.replica
    }

    pub fn presence(&self) -> &PresenceMap {
        self.presence.records()
    }

    pub fn presence_mut(&mut self) -> &mut PresenceDirectory {
        &mut self.presence
    }

    pub fn events_mut(&mut self) -> &mut BroadcastChannel {
        &mut self.events
    }

    pub fn progress(&self) -> &PlayerProgress {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut PlayerProgress {
        &mut self.progress
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_leader(&self) -> bool {
        self.client_id
            .as_deref()
            .is_some_and(|me| leader::is_leader(me, self.presence.records().keys()))
    }

    pub fn drain_outcomes(&mut self) -> Vec<ClientOutcome> {
        self.outcomes.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Announce this client to the relay.
    pub fn join(&mut self, username: &str, avatar_url: &str) -> Result<(), SessionError> {
        self.username = username.to_string();
        self.send(frame::Body::Hello(ClientHello {
            username: username.to_string(),
            avatar_url: avatar_url.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }))
    }

    /// Stop local timers. Shared state is untouched.
    pub fn leave(&mut self) {
        self.timers.cancel_all();
    }

    /// Process one frame from the relay.
    pub fn handle_frame(&mut self, bytes: &[u8], now: Timestamp) -> Result<(), SessionError> {
        match decode_frame(bytes)? {
            frame::Body::Welcome(welcome) => self.on_welcome(welcome, now),
            frame::Body::Ack(ack) => {
                self.on_ack(ack);
                Ok(())
            }
            frame::Body::Rejected(rejected) => {
                self.on_rejected(rejected);
                Ok(())
            }
            frame::Body::Snapshot(snapshot) => self.on_snapshot(snapshot),
            frame::Body::PresenceSnapshot(snapshot) => {
                let records = PresenceDirectory::map_from_json(&snapshot.records_json)
                    .map_err(WireError::from)?;
                self.presence.replace_all(records);
                Ok(())
            }
            frame::Body::Event(envelope) => self.on_event(envelope),
            frame::Body::Hello(_) | frame::Body::Patch(_) | frame::Body::Presence(_) => {
                tracing::debug!("client-bound frame of client kind ignored");
                Ok(())
            }
        }
    }

    /// Run local timers: the leader's season check and autosave.
    pub fn poll(&mut self, now: Timestamp) -> Result<(), SessionError> {
        for kind in self.timers.due(now) {
            match kind {
                TimerKind::SeasonCheck => self.season_check(now)?,
                TimerKind::Autosave => self.autosave(now)?,
            }
        }
        Ok(())
    }

    fn on_welcome(&mut self, welcome: ServerWelcome, now: Timestamp) -> Result<(), SessionError> {
        let document = SessionDocument::from_json(&welcome.document_json).map_err(WireError::from)?;
        let records =
            PresenceDirectory::map_from_json(&welcome.presence_json).map_err(WireError::from)?;

        tracing::info!(client_id = %welcome.client_id, version = welcome.version, "joined session");
        self.client_id = Some(welcome.client_id.clone());
        self.replica.install(document, welcome.version);
        self.presence.replace_all(records);
        self.outcomes.push_back(ClientOutcome::Joined {
            client_id: welcome.client_id,
        });

        if !self.replica.current().is_initialized() {
            let seed = SessionPatch::initialize(
                now,
                self.config.season_period_ms,
                self.config.chest_capacity,
                self.config.boss_health_per_realm,
            );
            self.send_plain(seed)?;
            self.outcomes.push_back(ClientOutcome::SessionInitialized);
        }

        self.update_presence(PresencePatch {
            wave_reached: Some(self.progress.wave),
            player_level: Some(self.progress.level),
            ..Default::default()
        })?;

        self.timers.schedule(
            TimerKind::SeasonCheck,
            self.config.season_check_interval_ms,
            now,
        );
        if self.autosave.is_some() {
            self.timers
                .schedule(TimerKind::Autosave, self.config.autosave_interval_ms, now);
        }
        Ok(())
    }

    fn on_snapshot(&mut self, snapshot: DocumentSnapshot) -> Result<(), SessionError> {
        let document =
            SessionDocument::from_json(&snapshot.document_json).map_err(WireError::from)?;
        if self.replica.install(document, snapshot.version) {
            self.settle_boss()?;
        }
        Ok(())
    }

    fn on_event(&mut self, envelope: EventEnvelope) -> Result<(), SessionError> {
        let event = envelope.to_event()?;
        let received = self.events.deliver(envelope.sender_id, event);
        match received.event {
            SessionEvent::SkillUsed { skill_index } => {
                self.outcomes.push_back(ClientOutcome::SkillUsed {
                    by: received.sender,
                    skill_index,
                });
            }
            // Only a hint; the document snapshot carries the real boss.
            SessionEvent::WorldBossSpawned { boss } => {
                self.outcomes.push_back(ClientOutcome::BossSpawned { boss });
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, ack: PatchAck) {
        let Some(op) = self.pending.remove(&ack.request_id) else {
            return;
        };
        tracing::debug!(request_id = ack.request_id, version = ack.version, "write confirmed");
        let outcome = match op {
            PendingOp::Deposit { index, slot, .. } => {
                self.progress.inventory.release(slot);
                ClientOutcome::Deposited { index }
            }
            PendingOp::Withdraw { item_id } => ClientOutcome::Withdrawn { item_id },
            PendingOp::List {
                listing_id, slot, ..
            } => {
                self.progress.inventory.release(slot);
                ClientOutcome::Listed { listing_id }
            }
            PendingOp::Cancel {
                listing_id,
                slot,
                item,
            } => {
                self.progress.inventory.restore(slot, item);
                ClientOutcome::ListingCancelled { listing_id }
            }
            PendingOp::Purchase {
                listing_id, price, ..
            } => ClientOutcome::Purchased { listing_id, price },
        };
        self.outcomes.push_back(outcome);
    }

    fn on_rejected(&mut self, rejected: PatchRejected) {
        let Some(op) = self.pending.remove(&rejected.request_id) else {
            return;
        };
        tracing::debug!(
            request_id = rejected.request_id,
            conflicts = rejected.conflicts.len(),
            "write rejected, rolling back"
        );
        let operation = op.operation();
        let error = self.roll_back(op);
        self.outcomes
            .push_back(ClientOutcome::Failed { operation, error });
    }

    /// Undo the local half of a guarded write and name the failure.
    fn roll_back(&mut self, op: PendingOp) -> SessionError {
        match op {
            PendingOp::Deposit { slot, item, .. } => {
                self.progress.inventory.restore(slot, item);
                SessionError::SlotUnavailable
            }
            PendingOp::Withdraw { item_id } => {
                self.progress.inventory.remove_by_id(&item_id);
                SessionError::SlotUnavailable
            }
            PendingOp::List {
                listing_id,
                slot,
                item,
            } => {
                self.progress.inventory.restore(slot, item);
                SessionError::ListingGone(listing_id)
            }
            PendingOp::Cancel {
                listing_id, slot, ..
            } => {
                self.progress.inventory.release(slot);
                SessionError::ListingGone(listing_id)
            }
            PendingOp::Purchase {
                listing_id,
                item_id,
                price,
            } => {
                self.progress.inventory.remove_by_id(&item_id);
                self.progress.refund(price);
                SessionError::ListingGone(listing_id)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Presence and Events
    // ------------------------------------------------------------------------

    /// Patch this client's own presence record.
    pub fn update_presence(&mut self, patch: PresencePatch) -> Result<(), SessionError> {
        let me = self.me()?;
        let patch_json = patch.to_json().map_err(WireError::from)?;
        self.send(frame::Body::Presence(PresenceUpdate { patch_json }))?;
        self.presence.set_local(&me, &patch);
        Ok(())
    }

    pub fn cast_skill(&mut self, skill_index: u32) -> Result<(), SessionError> {
        self.me()?;
        self.send_event(&SessionEvent::SkillUsed { skill_index })
    }

    // ------------------------------------------------------------------------
    // Community Chest
    // ------------------------------------------------------------------------

    /// Move the item in inventory slot `slot` into the first free chest slot.
    pub fn deposit_to_chest(&mut self, slot: usize) -> Result<u32, SessionError> {
        self.me()?;
        let item = self
            .progress
            .inventory
            .get(slot)
            .cloned()
            .ok_or(SessionError::NoSuchItem(slot))?;
        self.ensure_settled(&item.id)?;
        let planned = allocator::claim(self.replica.current(), item, self.config.claim_mode)?;
        let Some(item) = self.progress.inventory.take_held(slot) else {
            return Err(SessionError::NoSuchItem(slot));
        };

        let index = planned.index;
        let result = match planned.write {
            DocumentWrite::Plain(patch) => {
                self.progress.inventory.release(slot);
                self.send_plain(patch).map(|()| {
                    self.outcomes.push_back(ClientOutcome::Deposited { index });
                })
            }
            DocumentWrite::Conditional(conditional) => self.send_guarded(
                conditional,
                PendingOp::Deposit {
                    index,
                    slot,
                    item: item.clone(),
                },
            ),
        };
        if let Err(err) = result {
            self.progress.inventory.restore(slot, item);
            return Err(err);
        }
        Ok(index)
    }

    /// Move the item in chest slot `index` into the inventory.
    pub fn withdraw_from_chest(&mut self, index: u32) -> Result<(), SessionError> {
        self.me()?;
        if self.progress.inventory.is_full() {
            return Err(SessionError::InventoryFull);
        }
        let (item, planned) =
            allocator::take(self.replica.current(), index, self.config.claim_mode)?;
        self.ensure_settled(&item.id)?;
        let item_id = item.id.clone();
        self.progress
            .inventory
            .place(item)
            .map_err(|_| SessionError::InventoryFull)?;

        let result = match planned.write {
            DocumentWrite::Plain(patch) => self.send_plain(patch).map(|()| {
                self.outcomes.push_back(ClientOutcome::Withdrawn {
                    item_id: item_id.clone(),
                });
            }),
            DocumentWrite::Conditional(conditional) => self.send_guarded(
                conditional,
                PendingOp::Withdraw {
                    item_id: item_id.clone(),
                },
            ),
        };
        if result.is_err() {
            self.progress.inventory.remove_by_id(&item_id);
        }
        result
    }

    /// Buy one more personal chest slot for `price` gold.
    pub fn purchase_chest_slot(&mut self, price: u64) -> Result<u64, SessionError> {
        let me = self.me()?;
        self.spend(price)?;
        let owned = self
            .replica
            .current()
            .chest_slot_purchases
            .get(&me)
            .copied()
            .unwrap_or(0)
            + 1;
        if let Err(err) = self.send_plain(SessionPatch::new().with_slot_purchases(me, owned)) {
            self.progress.refund(price);
            return Err(err);
        }
        self.outcomes
            .push_back(ClientOutcome::ChestSlotPurchased { owned });
        Ok(owned)
    }

    // ------------------------------------------------------------------------
    // Marketplace
    // ------------------------------------------------------------------------

    /// List the item in inventory slot `slot`. Returns the new listing id.
    pub fn list_item(
        &mut self,
        slot: usize,
        price: u64,
        now: Timestamp,
    ) -> Result<ListingId, SessionError> {
        let me = self.me()?;
        let item = self
            .progress
            .inventory
            .get(slot)
            .cloned()
            .ok_or(SessionError::NoSuchItem(slot))?;

        self.ensure_settled(&item.id)?;

        let listing_id = format!("{me}-{now}-{}", self.next_listing_seq);
        let conditional = allocator::create_listing(
            item,
            price,
            &me,
            listing_id.clone(),
            &self.config.tradable_rarities,
        )?;
        self.next_listing_seq += 1;

        let Some(item) = self.progress.inventory.take_held(slot) else {
            return Err(SessionError::NoSuchItem(slot));
        };
        let op = PendingOp::List {
            listing_id: listing_id.clone(),
            slot,
            item: item.clone(),
        };
        if let Err(err) = self.send_guarded(conditional, op) {
            self.progress.inventory.restore(slot, item);
            return Err(err);
        }
        Ok(listing_id)
    }

    /// Withdraw one of this client's own listings.
    ///
    /// A slot is held for the returning item before the removal is sent, so
    /// the cancel fails locally when the inventory has no room.
    pub fn cancel_listing(&mut self, listing_id: &str) -> Result<(), SessionError> {
        let me = self.me()?;
        let (listing, conditional) =
            allocator::cancel_listing(self.replica.current(), listing_id, &me)?;
        let slot = self
            .progress
            .inventory
            .reserve()
            .ok_or(SessionError::InventoryFull)?;
        let op = PendingOp::Cancel {
            listing_id: listing_id.to_string(),
            slot,
            item: listing.item,
        };
        if let Err(err) = self.send_guarded(conditional, op) {
            self.progress.inventory.release(slot);
            return Err(err);
        }
        Ok(())
    }

    /// Buy another client's listing.
    ///
    /// Gold is debited and the item placed immediately; both are undone if
    /// the listing is gone by the time the relay applies the removal. The
    /// seller is not credited.
    pub fn buy_listing(&mut self, listing_id: &str) -> Result<(), SessionError> {
        let me = self.me()?;
        let (listing, conditional) =
            allocator::purchase_listing(self.replica.current(), listing_id, &me)?;
        if self.progress.inventory.is_full() {
            return Err(SessionError::InventoryFull);
        }
        self.spend(listing.price)?;
        let item_id = listing.item.id.clone();
        if self.progress.inventory.place(listing.item).is_err() {
            self.progress.refund(listing.price);
            return Err(SessionError::InventoryFull);
        }

        let op = PendingOp::Purchase {
            listing_id: listing_id.to_string(),
            item_id: item_id.clone(),
            price: listing.price,
        };
        if let Err(err) = self.send_guarded(conditional, op) {
            self.progress.inventory.remove_by_id(&item_id);
            self.progress.refund(listing.price);
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Combat and Progression
    // ------------------------------------------------------------------------

    /// Hit the active world boss for `amount`.
    pub fn deal_damage(&mut self, amount: u64) -> Result<(), SessionError> {
        self.me()?;
        let boss = self
            .replica
            .current()
            .active_boss()
            .cloned()
            .ok_or(SessionError::BossNotActive)?;

        self.send_plain(world_boss::damage(&boss, amount, self.config.damage_mode))?;
        self.engaged.insert(BossInstance::from(&boss));

        let dealt = self.own_record_damage().saturating_add(amount);
        self.update_presence(PresencePatch {
            damage_dealt: Some(dealt),
            ..Default::default()
        })?;

        self.settle_boss()
    }

    /// Advance one wave after the current enemy falls.
    ///
    /// Crossing a realm milestone raises the shared top score; landing on a
    /// boss wave spawns the world boss if none is active.
    pub fn record_wave_cleared(&mut self, now: Timestamp) -> Result<(), SessionError> {
        self.me()?;
        self.progress.enemies_defeated += 1;

        if let Some(realm) = self.progress.advance_wave() {
            self.outcomes.push_back(ClientOutcome::RealmReached { realm });
            self.raise_top_score(realm)?;
        }
        self.update_presence(PresencePatch {
            wave_reached: Some(self.progress.wave),
            ..Default::default()
        })?;

        if world_boss::is_boss_wave(self.progress.wave, self.config.boss_wave_interval) {
            let spawned = world_boss::spawn(
                self.replica.current(),
                self.progress.realm,
                self.progress.wave,
                now,
                self.config.boss_health_per_realm,
            );
            if let Some((boss, patch)) = spawned {
                tracing::info!(
                    wave = boss.spawned_at_wave,
                    health = boss.health,
                    "world boss spawned"
                );
                self.send_plain(patch)?;
                self.send_event(&SessionEvent::WorldBossSpawned { boss: boss.clone() })?;
                self.outcomes.push_back(ClientOutcome::BossSpawned { boss });
            }
        }
        Ok(())
    }

    fn raise_top_score(&mut self, realm: RealmId) -> Result<(), SessionError> {
        let realm = u64::from(realm);
        if realm <= self.replica.current().realm_top_score {
            return Ok(());
        }
        let patch = match self.config.top_score_policy {
            TopScorePolicy::Replace => SessionPatch::new().with_top_score(realm),
            TopScorePolicy::Max => SessionPatch::new().with_top_score_at_least(realm),
        };
        self.send_plain(patch)
    }

    /// Finish a boss this client helped bring to zero health.
    fn settle_boss(&mut self) -> Result<(), SessionError> {
        if world_boss::phase(self.replica.current()) != BossPhase::DefeatPending {
            return Ok(());
        }
        let Some(instance) = self.replica.current().active_boss().map(BossInstance::from) else {
            return Ok(());
        };
        if !self.engaged.contains(&instance) {
            return Ok(());
        }

        self.send_plain(world_boss::defeat())?;
        self.engaged.remove(&instance);

        if self.rewards.try_claim(instance) {
            let reward = BossReward::for_realm(self.progress.realm, &self.config);
            self.progress.xp = self.progress.xp.saturating_add(reward.xp);
            self.progress.refund(reward.gold);
            self.progress.advance_wave();
            tracing::info!(
                wave = instance.spawned_at_wave,
                xp = reward.xp,
                gold = reward.gold,
                "world boss defeated"
            );
            self.outcomes.push_back(ClientOutcome::BossDefeated { reward });
            self.update_presence(PresencePatch {
                wave_reached: Some(self.progress.wave),
                ..Default::default()
            })?;
        }
        Ok(())
    }

    fn own_record_damage(&self) -> u64 {
        self.client_id
            .as_deref()
            .and_then(|me| self.presence.get(me))
            .map(|record| record.damage_dealt)
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn save_progress(
        &mut self,
        store: &mut dyn BlobStore,
        slot: u32,
        now: Timestamp,
    ) -> Result<(), SessionError> {
        let key = SaveKey::new(slot, self.username.clone());
        realmsync_persist::save_progress(store, &key, &self.progress, now)?;
        self.outcomes.push_back(ClientOutcome::Saved { slot });
        Ok(())
    }

    /// Replace local progression with the save in `slot`. Returns false if
    /// the slot is empty.
    pub fn load_progress(
        &mut self,
        store: &dyn BlobStore,
        slot: u32,
    ) -> Result<bool, SessionError> {
        let key = SaveKey::new(slot, self.username.clone());
        match realmsync_persist::load_progress(store, &key)? {
            Some(mut progress) => {
                progress.inventory.normalize(self.config.inventory_size);
                self.progress = progress;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn autosave(&mut self, now: Timestamp) -> Result<(), SessionError> {
        let Some(target) = self.autosave.as_mut() else {
            return Ok(());
        };
        let key = SaveKey::new(target.slot, self.username.clone());
        realmsync_persist::save_progress(target.store.as_mut(), &key, &self.progress, now)?;
        self.outcomes
            .push_back(ClientOutcome::Saved { slot: target.slot });
        Ok(())
    }

    fn season_check(&mut self, now: Timestamp) -> Result<(), SessionError> {
        let Some(me) = self.client_id.clone() else {
            return Ok(());
        };
        let patch = leader::leader_tick(
            &me,
            self.presence.records().keys(),
            self.replica.current(),
            now,
            self.config.season_period_ms,
        );
        if let Some(patch) = patch {
            let realms = patch.realm_seasons.len();
            self.send_plain(patch)?;
            self.outcomes
                .push_back(ClientOutcome::SeasonsRotated { realms });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn me(&self) -> Result<ClientId, SessionError> {
        self.client_id.clone().ok_or(SessionError::NotJoined)
    }

    fn spend(&mut self, amount: u64) -> Result<(), SessionError> {
        let available = self.progress.gold;
        if self.progress.try_spend(amount) {
            Ok(())
        } else {
            Err(SessionError::InsufficientGold {
                needed: amount,
                available,
            })
        }
    }

    /// An item whose arrival is unconfirmed cannot be moved again; undoing
    /// the first write would otherwise duplicate it.
    fn ensure_settled(&self, item_id: &str) -> Result<(), SessionError> {
        let in_flight = self.pending.values().any(|op| match op {
            PendingOp::Withdraw { item_id: id } | PendingOp::Purchase { item_id: id, .. } => {
                id == item_id
            }
            _ => false,
        });
        if in_flight {
            return Err(SessionError::ItemInFlight(item_id.to_string()));
        }
        Ok(())
    }

    fn next_request(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn send(&mut self, body: frame::Body) -> Result<(), SessionError> {
        self.transport.send(encode_frame(body))?;
        Ok(())
    }

    fn send_event(&mut self, event: &SessionEvent) -> Result<(), SessionError> {
        self.send(frame::Body::Event(EventEnvelope::outgoing(event)))
    }

    /// Last-writer-wins write, applied to the replica right away.
    fn send_plain(&mut self, patch: SessionPatch) -> Result<(), SessionError> {
        let request_id = self.next_request();
        let frame = DocumentPatch::plain(request_id, &patch)?;
        self.send(frame::Body::Patch(frame))?;
        self.replica.apply_optimistic(&patch);
        Ok(())
    }

    /// Guarded write; the replica waits for the relay's snapshot.
    fn send_guarded(
        &mut self,
        conditional: ConditionalPatch,
        op: PendingOp,
    ) -> Result<(), SessionError> {
        let request_id = self.next_request();
        let frame = DocumentPatch::conditional(request_id, &conditional)?;
        self.send(frame::Body::Patch(frame))?;
        self.pending.insert(request_id, op);
        Ok(())
    }
}

impl<T: Transport> std::fmt::Debug for RoomClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("client_id", &self.client_id)
            .field("version", &self.replica.version())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
