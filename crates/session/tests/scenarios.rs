//! Multi-client sessions driven through a real relay.
//!
//! Client transports are pumped into `Room::receive` and room outboxes back
//! into `RoomClient::handle_frame` until the system is quiet. Clients are
//! pumped in id order, so within one pump the smaller id's writes land first.

use std::collections::BTreeMap;

use proptest::prelude::*;
use realmsync_doc::{Item, Rarity, Season};
use realmsync_session::{
    BossPhase, ClaimMode, ClientOutcome, Operation, QueueTransport, Room, RoomClient,
    SessionConfig, SessionError, TopScorePolicy, leader, world_boss,
};

const T0: u64 = 1_000;

struct Harness {
    room: Room,
    clients: BTreeMap<String, RoomClient<QueueTransport>>,
    now: u64,
}

impl Harness {
    fn new() -> Self {
        Self {
            room: Room::new(),
            clients: BTreeMap::new(),
            now: T0,
        }
    }

    fn join(&mut self, id: &str, config: SessionConfig) {
        assert!(self.room.connect(id));
        let mut client = RoomClient::new(QueueTransport::new(), config);
        client.join(id, "").unwrap();
        self.clients.insert(id.to_string(), client);
        self.pump();
    }

    fn leave(&mut self, id: &str) {
        if let Some(mut client) = self.clients.remove(id) {
            client.leave();
        }
        assert!(self.room.disconnect(id));
        self.pump();
    }

    fn client(&mut self, id: &str) -> &mut RoomClient<QueueTransport> {
        self.clients.get_mut(id).unwrap()
    }

    fn pump(&mut self) {
        loop {
            let mut moved = 0;
            for (id, client) in &mut self.clients {
                for bytes in client.transport_mut().drain() {
                    self.room.receive(id, &bytes);
                    moved += 1;
                }
            }
            for (id, client) in &mut self.clients {
                for bytes in self.room.take_outbox(id) {
                    client.handle_frame(&bytes, self.now).unwrap();
                    moved += 1;
                }
            }
            if moved == 0 {
                break;
            }
        }
    }

    fn poll_all(&mut self) {
        for client in self.clients.values_mut() {
            client.poll(self.now).unwrap();
        }
    }

    fn assert_converged(&self) {
        let relay = self.room.store();
        for (id, client) in &self.clients {
            assert_eq!(client.version(), relay.version(), "{id} version");
            assert_eq!(
                client.document().digest(),
                relay.current().digest(),
                "{id} digest"
            );
            assert_eq!(client.presence(), self.room.presence().records(), "{id} presence");
        }
    }
}

fn item(id: &str, rarity: Rarity) -> Item {
    Item {
        id: id.to_string(),
        name: format!("{rarity} Amulet"),
        rarity,
        icon: "📿".to_string(),
        stats: Default::default(),
        season: None,
    }
}

fn legacy() -> SessionConfig {
    SessionConfig {
        claim_mode: ClaimMode::Legacy,
        ..SessionConfig::default()
    }
}

/// Deposit `count` filler items through `filler`, one write per pump.
fn fill_chest(h: &mut Harness, filler: &str, count: usize) {
    for n in 0..count {
        let client = h.client(filler);
        client
            .progress_mut()
            .inventory
            .place(item(&format!("filler-{n}"), Rarity::Common))
            .unwrap();
        client.deposit_to_chest(0).unwrap();
        h.pump();
    }
    assert_eq!(h.room.store().current().community_chest.occupied(), count);
}

fn count_outcomes(
    client: &mut RoomClient<QueueTransport>,
    pred: impl Fn(&ClientOutcome) -> bool,
) -> usize {
    client.drain_outcomes().iter().filter(|o| pred(o)).count()
}

// ============================================================================
// Community Chest
// ============================================================================

#[test]
fn test_legacy_deposit_race_loses_an_item() {
    let mut h = Harness::new();
    h.join("f0", SessionConfig::default());
    h.join("x1", legacy());
    h.join("y1", legacy());
    fill_chest(&mut h, "f0", 99);

    for id in ["x1", "y1"] {
        let client = h.client(id);
        client
            .progress_mut()
            .inventory
            .place(item(&format!("{id}-item"), Rarity::Rare))
            .unwrap();
        assert_eq!(client.deposit_to_chest(0).unwrap(), 99);
    }
    h.pump();

    let chest = &h.room.store().current().community_chest;
    assert_eq!(chest.items[&99].id, "y1-item");
    assert!(chest.items.values().all(|i| i.id != "x1-item"));
    // Both clients were told they succeeded; x1's item is simply gone.
    assert!(!h.client("x1").progress().inventory.contains("x1-item"));
    assert_eq!(
        count_outcomes(h.client("x1"), |o| matches!(o, ClientOutcome::Deposited { index: 99 })),
        1
    );
    h.assert_converged();
}

#[test]
fn test_cas_deposit_race_has_one_winner() {
    let mut h = Harness::new();
    h.join("f0", SessionConfig::default());
    h.join("x1", SessionConfig::default());
    h.join("y1", SessionConfig::default());
    fill_chest(&mut h, "f0", 98);

    for id in ["x1", "y1"] {
        let client = h.client(id);
        client
            .progress_mut()
            .inventory
            .place(item(&format!("{id}-item"), Rarity::Rare))
            .unwrap();
        assert_eq!(client.deposit_to_chest(0).unwrap(), 98);
    }
    h.pump();

    assert_eq!(h.room.store().current().community_chest.items[&98].id, "x1-item");
    let y = h.client("y1");
    assert!(y.progress().inventory.contains("y1-item"));
    assert_eq!(
        count_outcomes(y, |o| matches!(
            o,
            ClientOutcome::Failed {
                operation: Operation::Deposit,
                error: SessionError::SlotUnavailable
            }
        )),
        1
    );

    // The loser rescans and lands in the next free slot.
    assert_eq!(h.client("y1").deposit_to_chest(0).unwrap(), 99);
    h.pump();
    let chest = &h.room.store().current().community_chest;
    assert_eq!(chest.items[&99].id, "y1-item");
    assert_eq!(chest.occupied(), 100);
    assert!(matches!(
        h.client("y1").deposit_to_chest(0),
        Err(SessionError::NoSuchItem(0))
    ));
    h.assert_converged();
}

#[test]
fn test_concurrent_withdraw_pays_out_once() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.join("b7", SessionConfig::default());
    h.client("a2")
        .progress_mut()
        .inventory
        .place(item("gem", Rarity::Epic))
        .unwrap();
    h.client("a2").deposit_to_chest(0).unwrap();
    h.pump();

    h.client("a2").withdraw_from_chest(0).unwrap();
    h.client("b7").withdraw_from_chest(0).unwrap();
    h.pump();

    assert!(h.client("a2").progress().inventory.contains("gem"));
    assert!(!h.client("b7").progress().inventory.contains("gem"));
    assert!(h.room.store().current().community_chest.items.is_empty());
    h.assert_converged();
}

// ============================================================================
// Leadership and Seasons
// ============================================================================

#[test]
fn test_leader_is_smallest_id_and_hands_over() {
    let mut h = Harness::new();
    for id in ["b7", "a2", "c9"] {
        h.join(id, SessionConfig::default());
    }
    assert!(h.client("a2").is_leader());
    assert!(!h.client("b7").is_leader());
    assert!(!h.client("c9").is_leader());

    h.leave("a2");
    assert!(h.client("b7").is_leader());
    assert!(!h.client("c9").is_leader());
    assert!(h.room.presence().get("a2").is_none());
}

#[test]
fn test_leader_rotates_seasons_once() {
    let period = SessionConfig::default().season_period_ms;
    let mut h = Harness::new();
    for id in ["a2", "b7", "c9"] {
        h.join(id, SessionConfig::default());
    }
    let seeded = h.room.store().current().realm_seasons[&1];
    assert_eq!(seeded.current, Season::Spring);
    assert_eq!(seeded.next_change_at, T0 + period);

    h.now = T0 + period;
    h.poll_all();
    h.pump();

    let rotated = h.room.store().current().realm_seasons[&1];
    assert_eq!(rotated.current, Season::Summer);
    assert_eq!(rotated.next_change_at, T0 + 2 * period);
    assert_eq!(h.room.store().current().season_of(4), Season::Spring);
    assert_eq!(
        count_outcomes(h.client("a2"), |o| matches!(
            o,
            ClientOutcome::SeasonsRotated { realms: 4 }
        )),
        1
    );
    assert_eq!(
        count_outcomes(h.client("b7"), |o| matches!(o, ClientOutcome::SeasonsRotated { .. })),
        0
    );

    // Nothing more until the new deadline.
    let version = h.room.store().version();
    h.now += SessionConfig::default().season_check_interval_ms;
    h.poll_all();
    h.pump();
    assert_eq!(h.room.store().version(), version);

    // A duplicate correction from a stale leader changes nothing.
    let mut doc = h.room.store().current().clone();
    let late = leader::season_rollover(&doc, T0 + 2 * period, period).unwrap();
    doc.apply(&late);
    let once = doc.clone();
    doc.apply(&late);
    assert_eq!(doc, once);

    // The next leader takes over the schedule.
    h.leave("a2");
    h.now = T0 + 2 * period;
    h.poll_all();
    h.pump();
    assert_eq!(h.room.store().current().season_of(1), Season::Autumn);
    h.assert_converged();
}

// ============================================================================
// World Boss
// ============================================================================

#[test]
fn test_boss_defeat_rewards_each_attacker_once() {
    let config = SessionConfig {
        boss_wave_interval: 5,
        ..SessionConfig::default()
    };
    let mut h = Harness::new();
    for id in ["a2", "b7", "c9"] {
        h.join(id, config.clone());
    }

    h.client("a2").progress_mut().wave = 4;
    let now = h.now;
    h.client("a2").record_wave_cleared(now).unwrap();
    h.pump();

    let boss = h.room.store().current().active_boss().cloned().unwrap();
    assert_eq!(boss.spawned_at_wave, 5);
    assert_eq!(boss.health, 10_000);
    assert_eq!(
        count_outcomes(h.client("b7"), |o| matches!(o, ClientOutcome::BossSpawned { .. })),
        1
    );

    h.client("a2").deal_damage(6_000).unwrap();
    h.pump();
    assert_eq!(h.room.store().current().active_boss().unwrap().health, 4_000);

    let gold_before = h.client("b7").progress().gold;
    h.client("b7").deal_damage(5_000).unwrap();
    h.pump();

    assert_eq!(world_boss::phase(h.room.store().current()), BossPhase::Dormant);
    for id in ["a2", "b7"] {
        assert_eq!(
            count_outcomes(h.client(id), |o| matches!(o, ClientOutcome::BossDefeated { .. })),
            1,
            "{id}"
        );
    }
    assert_eq!(
        count_outcomes(h.client("c9"), |o| matches!(o, ClientOutcome::BossDefeated { .. })),
        0
    );
    assert_eq!(h.client("b7").progress().gold, gold_before + 1_000);
    assert_eq!(h.client("b7").progress().xp, 500);
    assert_eq!(h.room.presence().get("b7").unwrap().damage_dealt, 5_000);
    h.assert_converged();
}

// ============================================================================
// Presence
// ============================================================================

#[test]
fn test_presence_is_self_owned() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.join("b7", SessionConfig::default());

    h.client("a2")
        .update_presence(realmsync_doc::PresencePatch {
            damage_dealt: Some(42),
            player_level: Some(9),
            ..Default::default()
        })
        .unwrap();
    h.pump();

    let a2 = h.room.presence().get("a2").unwrap();
    assert_eq!((a2.damage_dealt, a2.player_level), (42, 9));
    assert_eq!(h.room.presence().get("b7").unwrap().damage_dealt, 0);
    assert_eq!(h.client("b7").presence()["a2"].player_level, 9);
    assert_eq!(h.client("b7").presence()["b7"].username, "b7");
    h.assert_converged();
}

// ============================================================================
// Marketplace
// ============================================================================

#[test]
fn test_purchase_rolls_back_when_seller_cancels_first() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.join("b7", SessionConfig::default());

    h.client("a2")
        .progress_mut()
        .inventory
        .place(item("ring", Rarity::Common))
        .unwrap();
    let now = h.now;
    let listing_id = h.client("a2").list_item(0, 40, now).unwrap();
    h.pump();
    assert_eq!(h.room.store().current().marketplace.listings[&listing_id].price, 40);

    h.client("b7").progress_mut().gold = 100;
    h.client("b7").buy_listing(&listing_id).unwrap();
    assert_eq!(h.client("b7").progress().gold, 60);
    h.client("a2").cancel_listing(&listing_id).unwrap();
    h.pump();

    let buyer = h.client("b7");
    assert_eq!(buyer.progress().gold, 100);
    assert!(!buyer.progress().inventory.contains("ring"));
    assert_eq!(
        count_outcomes(buyer, |o| matches!(
            o,
            ClientOutcome::Failed {
                operation: Operation::Purchase,
                error: SessionError::ListingGone(_)
            }
        )),
        1
    );
    assert!(h.client("a2").progress().inventory.contains("ring"));
    assert!(h.room.store().current().marketplace.listings.is_empty());
    h.assert_converged();
}

#[test]
fn test_purchase_moves_item_but_does_not_pay_seller() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.join("b7", SessionConfig::default());

    h.client("a2")
        .progress_mut()
        .inventory
        .place(item("boots", Rarity::Uncommon))
        .unwrap();
    let now = h.now;
    let listing_id = h.client("a2").list_item(0, 25, now).unwrap();
    h.pump();

    h.client("b7").progress_mut().gold = 30;
    h.client("b7").buy_listing(&listing_id).unwrap();
    h.pump();

    assert!(h.client("b7").progress().inventory.contains("boots"));
    assert_eq!(h.client("b7").progress().gold, 5);
    assert_eq!(h.client("a2").progress().gold, 0);
    assert_eq!(
        count_outcomes(h.client("b7"), |o| matches!(o, ClientOutcome::Purchased { price: 25, .. })),
        1
    );
    h.assert_converged();
}

#[test]
fn test_purchase_rolls_back_on_send_failure() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.join("b7", SessionConfig::default());
    h.client("a2")
        .progress_mut()
        .inventory
        .place(item("cap", Rarity::Common))
        .unwrap();
    let now = h.now;
    let listing_id = h.client("a2").list_item(0, 10, now).unwrap();
    h.pump();

    let buyer = h.client("b7");
    buyer.progress_mut().gold = 10;
    buyer.transport_mut().set_failing(true);
    assert!(matches!(
        buyer.buy_listing(&listing_id),
        Err(SessionError::Transport(_))
    ));
    assert_eq!(buyer.progress().gold, 10);
    assert!(!buyer.progress().inventory.contains("cap"));
    assert_eq!(buyer.pending_count(), 0);
}

#[test]
fn test_untradable_rarity_stays_in_inventory() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.client("a2")
        .progress_mut()
        .inventory
        .place(item("crown", Rarity::Legendary))
        .unwrap();
    let now = h.now;
    assert!(matches!(
        h.client("a2").list_item(0, 500, now),
        Err(SessionError::NotTradable(Rarity::Legendary))
    ));
    assert!(h.client("a2").progress().inventory.contains("crown"));
}

// ============================================================================
// Realm Top Score
// ============================================================================

fn race_top_score(policy: TopScorePolicy) -> u64 {
    let config = SessionConfig {
        top_score_policy: policy,
        boss_wave_interval: 0,
        ..SessionConfig::default()
    };
    let mut h = Harness::new();
    h.join("a2", config.clone());
    h.join("b7", config);

    // Both cross a realm milestone from the same view of the score.
    h.client("a2").progress_mut().wave = 49;
    h.client("b7").progress_mut().wave = 29;
    let now = h.now;
    h.client("a2").record_wave_cleared(now).unwrap();
    h.client("b7").record_wave_cleared(now).unwrap();
    h.pump();
    h.assert_converged();
    h.room.store().current().realm_top_score
}

#[test]
fn test_top_score_never_regresses_under_max() {
    assert_eq!(race_top_score(TopScorePolicy::Max), 6);
}

#[test]
fn test_top_score_regresses_under_replace() {
    assert_eq!(race_top_score(TopScorePolicy::Replace), 4);
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn test_late_joiner_receives_current_state() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    h.client("a2")
        .progress_mut()
        .inventory
        .place(item("torch", Rarity::Common))
        .unwrap();
    h.client("a2").deposit_to_chest(0).unwrap();
    h.client("a2").purchase_chest_slot(0).unwrap();
    h.pump();

    h.join("z9", SessionConfig::default());
    let late = h.client("z9");
    assert_eq!(late.document().community_chest.items[&0].id, "torch");
    assert_eq!(late.document().chest_slot_purchases["a2"], 1);
    assert!(late.presence().contains_key("a2"));
    h.assert_converged();
}

#[test]
fn test_reinitialize_is_not_sent_by_late_joiners() {
    let mut h = Harness::new();
    h.join("a2", SessionConfig::default());
    let version = h.room.store().version();
    h.join("b7", SessionConfig::default());
    // Only presence traffic; the document is untouched.
    assert_eq!(h.room.store().version(), version);
    assert_eq!(
        count_outcomes(h.client("b7"), |o| matches!(o, ClientOutcome::SessionInitialized)),
        0
    );
}

#[derive(Debug, Clone)]
enum ChestAction {
    Deposit { client: usize, slot: usize },
    Withdraw { client: usize, index: u32 },
    Pump,
}

fn chest_action() -> impl Strategy<Value = ChestAction> {
    prop_oneof![
        (0..3usize, 0..4usize).prop_map(|(client, slot)| ChestAction::Deposit { client, slot }),
        (0..3usize, 0..8u32).prop_map(|(client, index)| ChestAction::Withdraw { client, index }),
        Just(ChestAction::Pump),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Under compare-and-set, racing chest traffic never creates or destroys items.
    #[test]
    fn test_cas_chest_conserves_items(actions in prop::collection::vec(chest_action(), 1..40)) {
        let ids = ["a2", "b7", "c9"];
        let mut h = Harness::new();
        let mut expected = Vec::new();
        for id in ids {
            h.join(id, SessionConfig::default());
            for n in 0..4 {
                let item_id = format!("{id}-{n}");
                h.client(id)
                    .progress_mut()
                    .inventory
                    .place(item(&item_id, Rarity::Common))
                    .unwrap();
                expected.push(item_id);
            }
        }

        for action in actions {
            match action {
                ChestAction::Deposit { client, slot } => {
                    let _ = h.client(ids[client]).deposit_to_chest(slot);
                }
                ChestAction::Withdraw { client, index } => {
                    let _ = h.client(ids[client]).withdraw_from_chest(index);
                }
                ChestAction::Pump => h.pump(),
            }
        }
        h.pump();

        let mut held: Vec<String> = h
            .room
            .store()
            .current()
            .community_chest
            .items
            .values()
            .map(|i| i.id.clone())
            .collect();
        for id in ids {
            held.extend(h.client(id).progress().inventory.items().map(|i| i.id.clone()));
        }
        held.sort();
        expected.sort();
        prop_assert_eq!(held, expected);
        h.assert_converged();
    }
}
