use std::time::Duration;

use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::journaling::Entry;

/// What the controller should do with the remote after an entry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    /// Nothing new to push.
    Skip,
    /// Push once the deadline passes, unless another change re-arms it first.
    Debounce(Instant),
    /// Push as soon as the write path is free.
    Immediate,
}

/// Turns a stream of entry mutations into a bounded rate of remote pushes.
///
/// The scheduler only decides; the controller owns the timer and performs the
/// push, reporting back through [`SaveScheduler::begin_push`],
/// [`SaveScheduler::mark_pushed`] and [`SaveScheduler::push_failed`].
#[derive(Debug)]
pub struct SaveScheduler {
    debounce: Duration,
    max_wait: Option<Duration>,
    cancelled_threshold: u32,
    last_pushed: Option<Entry>,
    cancelled_saves: u32,
    deadline: Option<Instant>,
    dirty_since: Option<Instant>,
}

impl SaveScheduler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce(),
            max_wait: config.max_wait(),
            cancelled_threshold: config.cancelled_save_threshold,
            last_pushed: None,
            cancelled_saves: 0,
            deadline: None,
            dirty_since: None,
        }
    }

    /// Re-evaluates the policy after `entry` was mutated.
    pub fn observe(&mut self, entry: &Entry, now: Instant) -> SaveDecision {
        if !self.has_changes(entry) {
            self.cancelled_saves += 1;
            if self.cancelled_threshold > 0 && self.cancelled_saves >= self.cancelled_threshold {
                tracing::debug!(
                    cancelled = self.cancelled_saves,
                    "too many cancelled saves, saving forcefully"
                );
                self.cancelled_saves = 0;
                self.deadline = Some(now);
                return SaveDecision::Immediate;
            }
            tracing::trace!(cancelled = self.cancelled_saves, "no changes, save cancelled");
            return SaveDecision::Skip;
        }

        let dirty_since = *self.dirty_since.get_or_insert(now);
        if let Some(max_wait) = self.max_wait {
            if now.saturating_duration_since(dirty_since) >= max_wait {
                self.deadline = Some(now);
                return SaveDecision::Immediate;
            }
        }

        let deadline = now + self.debounce;
        self.deadline = Some(deadline);
        SaveDecision::Debounce(deadline)
    }

    /// Whether `entry` differs from the last state known to be on the server.
    /// Without a known server state only a non-blank entry counts as a change.
    pub fn has_changes(&self, entry: &Entry) -> bool {
        match &self.last_pushed {
            Some(pushed) => !pushed.same_content(entry),
            None => !entry.is_blank(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub fn cancelled_saves(&self) -> u32 {
        self.cancelled_saves
    }

    pub fn last_pushed(&self) -> Option<&Entry> {
        self.last_pushed.as_ref()
    }

    /// A push is leaving: the pending timer is consumed.
    pub fn begin_push(&mut self) {
        self.deadline = None;
        self.cancelled_saves = 0;
    }

    /// The server accepted `pushed`. `current` is the entry as it stands now,
    /// which may already carry edits made while the push was in flight.
    pub fn mark_pushed(&mut self, pushed: &Entry, current: &Entry, now: Instant) {
        self.last_pushed = Some(pushed.clone());
        self.dirty_since = if self.has_changes(current) {
            Some(now)
        } else {
            None
        };
    }

    /// The push of `pushed` did not land. Changes stay pending until the next
    /// mutation, the cancelled-save valve or an explicit save retries them. An
    /// edit made while the push was in flight already counts as that next
    /// mutation, so the debounce is re-armed for it.
    pub fn push_failed(&mut self, pushed: &Entry, current: &Entry, now: Instant) {
        self.deadline = if pushed.same_content(current) {
            None
        } else {
            Some(now + self.debounce)
        };
    }

    /// Takes `entry` as the server state without pushing it.
    pub fn mark_synced(&mut self, entry: Option<&Entry>) {
        self.last_pushed = entry.cloned();
        self.deadline = None;
        self.dirty_since = None;
        self.cancelled_saves = 0;
    }

    /// Drops any pending timer.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Forgets everything; used when the day rolls over.
    pub fn reset(&mut self) {
        self.mark_synced(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn config() -> SyncConfig {
        SyncConfig {
            debounce_ms: 300,
            max_wait_ms: 2500,
            cancelled_save_threshold: 20,
            ..SyncConfig::default()
        }
    }

    fn entry(text: &str, rating: u8) -> Entry {
        let mut entry = Entry::blank(date!(2024 - 04 - 03));
        entry.text = Some(text.into());
        entry.emotion_scale = rating;
        entry
    }

    #[test]
    fn blank_entry_without_server_state_is_not_a_change() {
        let mut scheduler = SaveScheduler::new(&config());
        let start = Instant::now();
        let blank = Entry::blank(date!(2024 - 04 - 03));
        assert_eq!(scheduler.observe(&blank, start), SaveDecision::Skip);
        assert_eq!(scheduler.deadline(), None);
        assert_eq!(scheduler.cancelled_saves(), 1);
    }

    #[test]
    fn real_changes_rearm_the_debounce() {
        let mut scheduler = SaveScheduler::new(&config());
        let start = Instant::now();

        let first = scheduler.observe(&entry("a", 5), start);
        assert_eq!(first, SaveDecision::Debounce(start + Duration::from_millis(300)));

        let later = start + Duration::from_millis(200);
        let second = scheduler.observe(&entry("ab", 5), later);
        assert_eq!(second, SaveDecision::Debounce(later + Duration::from_millis(300)));
        assert!(!scheduler.is_due(start + Duration::from_millis(400)));
        assert!(scheduler.is_due(later + Duration::from_millis(300)));
    }

    #[test]
    fn twentieth_consecutive_noop_forces_a_save() {
        let mut scheduler = SaveScheduler::new(&config());
        let start = Instant::now();
        let synced = entry("slept well", 7);
        scheduler.mark_synced(Some(&synced));

        for _ in 0..19 {
            assert_eq!(scheduler.observe(&synced, start), SaveDecision::Skip);
        }
        assert_eq!(scheduler.cancelled_saves(), 19);
        assert_eq!(scheduler.observe(&synced, start), SaveDecision::Immediate);
        assert_eq!(scheduler.cancelled_saves(), 0);
        assert!(scheduler.is_due(start));
    }

    #[test]
    fn zero_threshold_disables_the_valve() {
        let mut scheduler = SaveScheduler::new(&SyncConfig {
            cancelled_save_threshold: 0,
            ..config()
        });
        let start = Instant::now();
        let synced = entry("x", 2);
        scheduler.mark_synced(Some(&synced));
        for _ in 0..50 {
            assert_eq!(scheduler.observe(&synced, start), SaveDecision::Skip);
        }
    }

    #[test]
    fn max_wait_caps_a_stream_that_never_quiesces() {
        let mut scheduler = SaveScheduler::new(&config());
        let start = Instant::now();
        let mut text = String::new();
        let mut now = start;
        let mut decision = SaveDecision::Skip;
        for _ in 0..30 {
            text.push('x');
            decision = scheduler.observe(&entry(&text, 5), now);
            if decision == SaveDecision::Immediate {
                break;
            }
            now += Duration::from_millis(100);
        }
        assert_eq!(decision, SaveDecision::Immediate);
        assert!(now.duration_since(start) >= Duration::from_millis(2500));
    }

    #[test]
    fn pushed_state_becomes_the_baseline() {
        let mut scheduler = SaveScheduler::new(&config());
        let start = Instant::now();
        let pushed = entry("draft", 3);
        scheduler.observe(&pushed, start);
        scheduler.begin_push();
        assert_eq!(scheduler.deadline(), None);

        scheduler.mark_pushed(&pushed, &pushed, start);
        assert!(!scheduler.has_changes(&pushed));

        let edited_during_flight = entry("draft!", 3);
        scheduler.mark_pushed(&pushed, &edited_during_flight, start);
        assert!(scheduler.has_changes(&edited_during_flight));
    }

    #[test]
    fn failed_push_rearms_only_for_edits_made_in_flight() {
        let mut scheduler = SaveScheduler::new(&config());
        let start = Instant::now();
        let pushed = entry("a", 5);
        scheduler.observe(&pushed, start);
        scheduler.begin_push();

        scheduler.push_failed(&pushed, &pushed, start);
        assert_eq!(scheduler.deadline(), None);
        assert!(scheduler.has_changes(&pushed));

        let later = start + Duration::from_millis(500);
        scheduler.push_failed(&pushed, &entry("ab", 5), later);
        assert_eq!(scheduler.deadline(), Some(later + Duration::from_millis(300)));
    }

    #[test]
    fn clearing_back_to_blank_after_a_push_is_a_change() {
        let mut scheduler = SaveScheduler::new(&config());
        let pushed = entry("draft", 3);
        scheduler.mark_synced(Some(&pushed));
        assert!(scheduler.has_changes(&Entry::blank(date!(2024 - 04 - 03))));

        scheduler.reset();
        assert!(!scheduler.has_changes(&Entry::blank(date!(2024 - 04 - 03))));
        assert!(scheduler.last_pushed().is_none());
    }
}
