//! Patch-Merge Store.
//!
//! Holds one replica of the session document. Every accepted patch bumps the
//! version and notifies all subscribers with the merged document. There are
//! no vector clocks: for any leaf key the last patch applied wins.

use realmsync_doc::{ConditionalPatch, SessionDocument, SessionPatch, SlotConflict};
use thiserror::Error;

use crate::listeners::{Listeners, Subscription};

/// Document version. Zero means "never written".
pub type Version = u64;

/// A conditional patch lost its race; nothing was applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conditional patch rejected on {} slot(s)", .conflicts.len())]
pub struct Rejected {
    pub conflicts: Vec<SlotConflict>,
}

/// A write to submit to the store: plain last-writer-wins or guarded.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentWrite {
    Plain(SessionPatch),
    Conditional(ConditionalPatch),
}

impl DocumentWrite {
    pub fn patch(&self) -> &SessionPatch {
        match self {
            Self::Plain(patch) => patch,
            Self::Conditional(conditional) => &conditional.patch,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional(_))
    }
}

#[derive(Debug, Default)]
pub struct PatchMergeStore {
    document: SessionDocument,
    version: Version,
    subscribers: Listeners<SessionDocument>,
}

impl PatchMergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &SessionDocument {
        &self.document
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Merge `patch` into the document. Never fails.
    ///
    /// Empty patches are ignored and do not bump the version.
    pub fn apply(&mut self, patch: &SessionPatch) -> Version {
        if patch.is_empty() {
            return self.version;
        }
        self.document.apply(patch);
        self.commit()
    }

    /// Apply `conditional` only if every slot expectation still holds.
    pub fn apply_conditional(
        &mut self,
        conditional: &ConditionalPatch,
    ) -> Result<Version, Rejected> {
        self.document
            .apply_if(conditional)
            .map_err(|conflicts| Rejected { conflicts })?;
        Ok(self.commit())
    }

    pub fn submit(&mut self, write: &DocumentWrite) -> Result<Version, Rejected> {
        match write {
            DocumentWrite::Plain(patch) => Ok(self.apply(patch)),
            DocumentWrite::Conditional(conditional) => self.apply_conditional(conditional),
        }
    }

    /// Merge `patch` without claiming a new version.
    ///
    /// Replicas use this for their own writes ahead of the relay's snapshot;
    /// the next installed snapshot supersedes it.
    pub fn apply_optimistic(&mut self, patch: &SessionPatch) {
        if patch.is_empty() {
            return;
        }
        self.document.apply(patch);
        self.subscribers.notify(&self.document);
    }

    /// Install an authoritative snapshot.
    ///
    /// Stale snapshots (version not newer than ours) are ignored. Returns
    /// whether the snapshot was installed.
    pub fn install(&mut self, document: SessionDocument, version: Version) -> bool {
        if version <= self.version {
            return false;
        }
        self.document = document;
        self.version = version;
        self.subscribers.notify(&self.document);
        true
    }

    pub fn subscribe(&mut self, handler: impl FnMut(&SessionDocument) + 'static) -> Subscription {
        self.subscribers.add(handler)
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.subscribers.remove(subscription)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn commit(&mut self) -> Version {
        self.version += 1;
        tracing::trace!(version = self.version, "document updated");
        self.subscribers.notify(&self.document);
        self.version
    }
}
