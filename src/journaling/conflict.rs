use time::Date;

use super::{Entry, SaveConflict};

/// Result of comparing a freshly fetched entry with the in-memory one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Safe to replace local state with this entry.
    Adopt(Entry),
    /// Local edits disagree with the server; a decision is required.
    Conflict(SaveConflict),
}

/// What applying a conflict decision requires of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the in-memory and local state with the server's entry.
    AdoptRemote(Entry),
    /// Push the current local entry over the server's.
    PushLocal,
}

/// Holds at most one unresolved [`SaveConflict`].
#[derive(Debug, Default)]
pub struct ConflictResolver {
    pending: Option<SaveConflict>,
}

impl ConflictResolver {
    /// Compares `fetched` (`None` when the server has nothing for today) with
    /// `current` and records a conflict when they genuinely diverge.
    pub fn reconcile(&mut self, fetched: Option<Entry>, current: &Entry, today: Date) -> Reconciliation {
        let fetched = fetched.unwrap_or_else(|| {
            tracing::debug!("fetch returned no entry, defaulting to blank");
            Entry::blank(today)
        });

        if current.is_blank() || fetched.same_content(current) {
            return Reconciliation::Adopt(fetched);
        }

        tracing::warn!(
            remote_rating = fetched.emotion_scale,
            local_rating = current.emotion_scale,
            "conflict between local draft and fetched entry"
        );
        let conflict = SaveConflict {
            remote: fetched,
            local: current.clone(),
        };
        self.pending = Some(conflict.clone());
        Reconciliation::Conflict(conflict)
    }

    pub fn pending(&self) -> Option<&SaveConflict> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Consumes the pending conflict. Returns `None` when there is nothing to resolve.
    pub fn resolve(&mut self, keep_server: bool) -> Option<Resolution> {
        let conflict = self.pending.take()?;
        if keep_server {
            Some(Resolution::AdoptRemote(conflict.remote))
        } else {
            Some(Resolution::PushLocal)
        }
    }

    /// Drops the pending conflict without applying either side.
    pub fn discard(&mut self) -> Option<SaveConflict> {
        self.pending.take()
    }
}
