//! Realm Sync Session Coordination
//!
//! Everything between the shared document model and the game:
//!
//! - [`store`]: versioned patch-merge store with change notification
//! - [`presence`]: per-client presence directory
//! - [`broadcast`]: fire-and-forget session events
//! - [`leader`]: deterministic leader election and season rotation
//! - [`allocator`]: chest and marketplace writes (legacy and compare-and-set)
//! - [`world_boss`]: the shared boss lifecycle and local reward ledger
//! - [`room`]: the relay that serializes writes and fans out state
//! - [`client`]: one participant's replica and operations
//!
//! # Ordering
//!
//! The relay applies writes in arrival order and every client converges on
//! the relay's snapshots. There is no cross-client ordering beyond that.
//!
//! # Time
//!
//! Nothing in this crate reads the wall clock. Every operation that needs
//! time takes a caller-supplied millisecond timestamp.

#![deny(unsafe_code)]

pub mod allocator;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod leader;
mod listeners;
pub mod logging;
pub mod presence;
pub mod room;
pub mod schedule;
pub mod store;
pub mod transport;
pub mod world_boss;

pub use allocator::{ChestWrite, ClaimMode};
pub use broadcast::{BroadcastChannel, Delivery, Received};
pub use client::{ClientOutcome, Operation, RoomClient};
pub use config::{ConfigError, SessionConfig, TopScorePolicy};
pub use error::SessionError;
pub use listeners::Subscription;
pub use presence::{PresenceDirectory, PresenceMap};
pub use room::{DropReason, RelayOutcome, Room};
pub use schedule::{IntervalTimers, TimerKind};
pub use store::{DocumentWrite, PatchMergeStore, Rejected, Version};
pub use transport::{QueueTransport, Transport, TransportError};
pub use world_boss::{BossInstance, BossPhase, BossReward, DamageMode, RewardLedger};
