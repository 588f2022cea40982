//! Leader election and season rotation.
//!
//! The leader is never stored. Every client derives it from the membership
//! it currently observes: the lexicographically smallest client id. Views
//! may briefly disagree after a join or leave, so anything only the leader
//! does must be safe to do twice.

use realmsync_doc::{ClientId, SessionDocument, SessionPatch, Timestamp};

/// Smallest id among `members`, or `None` if there are none.
pub fn current_leader<'a>(members: impl IntoIterator<Item = &'a ClientId>) -> Option<&'a ClientId> {
    members.into_iter().min()
}

pub fn is_leader<'a>(me: &str, members: impl IntoIterator<Item = &'a ClientId>) -> bool {
    current_leader(members).is_some_and(|leader| leader == me)
}

/// Season correction for every realm whose deadline has passed.
///
/// Each expired realm advances one season and its deadline moves forward by
/// `period` from the stored deadline, not from `now`. Two leaders running
/// this on the same document therefore emit identical patches, and running
/// it again before the new deadline yields `None`.
pub fn season_rollover(doc: &SessionDocument, now: Timestamp, period: u64) -> Option<SessionPatch> {
    let patch = doc
        .realm_seasons
        .iter()
        .filter(|(_, season)| season.next_change_at <= now)
        .fold(SessionPatch::new(), |patch, (&realm, season)| {
            patch.with_realm_season(
                realm,
                season.current.next(),
                season.next_change_at.saturating_add(period),
            )
        });

    (!patch.is_empty()).then_some(patch)
}

/// The leader's periodic duty: rotate seasons if this client leads.
pub fn leader_tick<'a>(
    me: &str,
    members: impl IntoIterator<Item = &'a ClientId>,
    doc: &SessionDocument,
    now: Timestamp,
    period: u64,
) -> Option<SessionPatch> {
    if !is_leader(me, members) {
        return None;
    }
    let patch = season_rollover(doc, now, period)?;
    tracing::info!(client_id = %me, realms = patch.realm_seasons.len(), "rotating seasons");
    Some(patch)
}
