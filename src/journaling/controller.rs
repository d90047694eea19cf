use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::remote::{RemoteEntryGateway, RemoteError, RemoteResult};
use crate::storage::{LocalEntryStore, LocalHistoryStore};

use super::autosave::{SaveDecision, SaveScheduler};
use super::conflict::{ConflictResolver, Reconciliation, Resolution};
use super::day::{self, Clock};
use super::entry::{Entry, SaveConflict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    LocalLoaded,
    RemoteReconciled,
    Editing,
    Saving,
    ConflictPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOperation {
    Fetch,
    Push,
}

/// Last remote failure, surfaced to the UI instead of being thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub operation: RemoteOperation,
    pub error: RemoteError,
    pub occurred_at: OffsetDateTime,
}

/// Everything the UI observes about today's entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TodaySnapshot {
    pub phase: SyncPhase,
    pub entry: Entry,
    pub last_saved: Option<OffsetDateTime>,
    pub unsaved_changes: bool,
    pub save_conflict: Option<SaveConflict>,
    pub last_error: Option<SyncFailure>,
    /// Set once the day has rolled over during this session.
    pub rolled_over_at: Option<OffsetDateTime>,
}

type EntryEdit = Box<dyn FnOnce(&mut Entry) + Send>;
type PendingCall<T> = Pin<Box<dyn Future<Output = T> + Send>>;

enum Command {
    Edit(EntryEdit),
    BeginFetch,
    ForceSave(oneshot::Sender<()>),
    ResolveConflict {
        keep_server: bool,
        done: oneshot::Sender<()>,
    },
    Settle(oneshot::Sender<()>),
    Shutdown,
}

struct PushOutcome {
    pushed: Entry,
    result: RemoteResult<Entry>,
}

/// Remote calls currently owned by the actor loop.
#[derive(Default)]
struct InFlight {
    fetch: Option<PendingCall<RemoteResult<Option<Entry>>>>,
    push: Option<PendingCall<PushOutcome>>,
}

/// Owns today's entry and keeps it reconciled between the local mirror and
/// the remote store. Runs as a single task; talk to it through
/// [`TodayEntryHandle`].
pub struct TodayEntryController<L, H, R, C> {
    config: SyncConfig,
    local: L,
    history: H,
    remote: Arc<R>,
    clock: C,
    entry: Entry,
    base_phase: SyncPhase,
    saving: bool,
    scheduler: SaveScheduler,
    conflicts: ConflictResolver,
    fetched: bool,
    fetch_requested: bool,
    next_midnight: OffsetDateTime,
    last_saved: Option<OffsetDateTime>,
    last_error: Option<SyncFailure>,
    rolled_over_at: Option<OffsetDateTime>,
    state: watch::Sender<TodaySnapshot>,
}

impl<L, H, R, C> TodayEntryController<L, H, R, C>
where
    L: LocalEntryStore,
    H: LocalHistoryStore,
    R: RemoteEntryGateway,
    C: Clock,
{
    pub fn new(config: SyncConfig, local: L, history: H, remote: Arc<R>, clock: C) -> Self {
        let now = clock.now();
        let entry = Entry::blank(now.date());
        let scheduler = SaveScheduler::new(&config);
        let (state, _) = watch::channel(TodaySnapshot {
            phase: SyncPhase::Uninitialized,
            entry: entry.clone(),
            last_saved: None,
            unsaved_changes: false,
            save_conflict: None,
            last_error: None,
            rolled_over_at: None,
        });
        Self {
            config,
            local,
            history,
            remote,
            clock,
            entry,
            base_phase: SyncPhase::Uninitialized,
            saving: false,
            scheduler,
            conflicts: ConflictResolver::default(),
            fetched: false,
            fetch_requested: false,
            next_midnight: day::next_midnight(now),
            last_saved: None,
            last_error: None,
            rolled_over_at: None,
            state,
        }
    }

    /// Starts the session on the current tokio runtime.
    pub fn spawn(self) -> TodayEntryHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let state = self.state.subscribe();
        let task = tokio::spawn(async move {
            let result = self.run(receiver).await;
            if let Err(err) = &result {
                tracing::error!(error = %format!("{err:#}"), "today entry controller stopped");
            }
            result
        });
        TodayEntryHandle {
            commands,
            state,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<()> {
        self.mount()?;

        let mut in_flight = InFlight::default();
        if self.config.fetch_on_mount {
            self.fetch_requested = true;
        }

        let mut rollover = interval(self.config.rollover_poll());
        rollover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rollover.tick().await;

        loop {
            if self.fetch_requested && in_flight.push.is_none() {
                self.start_fetch(&mut in_flight);
            }
            let write_path_free = in_flight.push.is_none() && self.push_allowed(&in_flight);
            if write_path_free && self.scheduler.is_due(Instant::now()) {
                self.start_push(&mut in_flight);
            }
            let debounce = self
                .scheduler
                .deadline()
                .filter(|_| in_flight.push.is_none() && self.push_allowed(&in_flight));

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command, &mut in_flight).await?,
                },
                result = await_slot(&mut in_flight.fetch) => self.finish_fetch(result)?,
                outcome = await_slot(&mut in_flight.push) => self.finish_push(outcome)?,
                () = wait_until(debounce) => {}
                _ = rollover.tick() => self.check_rollover(&mut in_flight).await?,
            }
        }

        self.teardown(in_flight).await
    }

    fn mount(&mut self) -> Result<()> {
        let now = self.clock.now();
        match self.local.load().context("loading cached today entry")? {
            Some(mut stored) if day::is_today(&stored.date, now) => {
                tracing::debug!(saved = stored.saved, "loading cached entry");
                stored.normalize();
                if stored.saved {
                    self.scheduler.mark_synced(Some(&stored));
                }
                self.entry = stored;
            }
            Some(stale) => {
                tracing::debug!(date = %stale.date, "resetting local entry, different day");
                if !stale.is_blank() {
                    self.history
                        .append(&stale)
                        .context("archiving stale cached entry")?;
                }
                self.entry = Entry::blank(now.date());
                self.local
                    .save(&self.entry)
                    .context("resetting cached today entry")?;
            }
            None => {
                tracing::debug!("no cached entry");
                self.entry = Entry::blank(now.date());
            }
        }
        self.next_midnight = day::next_midnight(now);
        self.base_phase = SyncPhase::LocalLoaded;
        self.publish();
        Ok(())
    }

    async fn handle(&mut self, command: Command, in_flight: &mut InFlight) -> Result<()> {
        match command {
            Command::Edit(edit) => self.apply_edit(edit)?,
            Command::BeginFetch => {
                if self.fetched {
                    tracing::debug!("already fetched, skipping");
                } else {
                    self.fetch_requested = true;
                }
            }
            Command::ForceSave(done) => {
                self.flush(in_flight, true).await?;
                let _ = done.send(());
            }
            Command::ResolveConflict { keep_server, done } => {
                self.resolve_conflict(keep_server).await?;
                let _ = done.send(());
            }
            Command::Settle(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => {}
        }
        Ok(())
    }

    fn apply_edit(&mut self, edit: EntryEdit) -> Result<()> {
        edit(&mut self.entry);
        self.entry.normalize();
        self.entry.saved = self
            .scheduler
            .last_pushed()
            .is_some_and(|pushed| pushed.same_content(&self.entry));

        self.local
            .save(&self.entry)
            .context("mirroring edit to local store")?;

        if self.base_phase != SyncPhase::Uninitialized {
            self.base_phase = SyncPhase::Editing;
        }
        match self.scheduler.observe(&self.entry, Instant::now()) {
            SaveDecision::Skip => {}
            SaveDecision::Debounce(deadline) => {
                tracing::trace!(?deadline, "debounced save armed");
            }
            SaveDecision::Immediate => {
                tracing::debug!("save requested without debounce");
            }
        }
        self.publish();
        Ok(())
    }

    fn push_allowed(&self, in_flight: &InFlight) -> bool {
        in_flight.fetch.is_none() && !self.fetch_requested && !self.conflicts.is_pending()
    }

    fn start_fetch(&mut self, in_flight: &mut InFlight) {
        self.fetch_requested = false;
        if self.fetched || in_flight.fetch.is_some() || self.conflicts.is_pending() {
            return;
        }
        tracing::debug!("fetching today's entry");
        let remote = Arc::clone(&self.remote);
        in_flight.fetch = Some(Box::pin(async move { remote.fetch_today().await }));
    }

    fn finish_fetch(&mut self, result: RemoteResult<Option<Entry>>) -> Result<()> {
        let fetched = match result {
            Ok(fetched) => fetched,
            Err(error) => {
                tracing::warn!(%error, "error fetching today");
                self.record_failure(RemoteOperation::Fetch, error);
                self.publish();
                return Ok(());
            }
        };

        self.fetched = true;
        if self
            .last_error
            .as_ref()
            .is_some_and(|failure| failure.operation == RemoteOperation::Fetch)
        {
            self.last_error = None;
        }

        let fetched = fetched.map(|mut entry| {
            entry.normalize();
            entry.saved = true;
            entry
        });
        let today = self.clock.now().date();
        match self
            .conflicts
            .reconcile(fetched.clone(), &self.entry, today)
        {
            Reconciliation::Adopt(entry) => {
                tracing::debug!("setting entry to fetched state");
                self.scheduler.mark_synced(fetched.as_ref());
                self.entry = entry;
                self.local
                    .save(&self.entry)
                    .context("caching fetched entry")?;
                self.base_phase = SyncPhase::RemoteReconciled;
            }
            Reconciliation::Conflict(_) => {
                self.scheduler.cancel();
            }
        }
        self.publish();
        Ok(())
    }

    fn start_push(&mut self, in_flight: &mut InFlight) {
        in_flight.push = Some(self.push_call());
    }

    fn push_call(&mut self) -> PendingCall<PushOutcome> {
        self.scheduler.begin_push();
        self.saving = true;
        self.publish();

        let pushed = self.entry.clone();
        let remote = Arc::clone(&self.remote);
        tracing::debug!(rating = pushed.emotion_scale, "pushing today's entry");
        Box::pin(async move {
            let result = remote
                .push_today(pushed.emotion_scale, pushed.text(), pushed.ephemeral)
                .await;
            PushOutcome { pushed, result }
        })
    }

    fn finish_push(&mut self, outcome: PushOutcome) -> Result<()> {
        let PushOutcome { pushed, result } = outcome;
        self.saving = false;
        match result {
            Ok(canonical) => {
                self.scheduler
                    .mark_pushed(&pushed, &self.entry, Instant::now());
                if !canonical.id.is_empty() {
                    self.entry.id = canonical.id;
                }
                if !canonical.author.is_empty() {
                    self.entry.author = canonical.author;
                }
                if !canonical.date.is_empty() {
                    self.entry.date = canonical.date;
                }
                self.entry.saved = !self.scheduler.has_changes(&self.entry);
                self.last_saved = Some(self.clock.now());
                self.last_error = None;
                tracing::debug!(saved = self.entry.saved, "saved entry");
            }
            Err(error) => {
                tracing::warn!(%error, "error saving entry");
                self.scheduler
                    .push_failed(&pushed, &self.entry, Instant::now());
                self.entry.saved = false;
                self.record_failure(RemoteOperation::Push, error);
            }
        }
        self.local
            .save(&self.entry)
            .context("caching pushed entry")?;
        if self.base_phase != SyncPhase::Uninitialized {
            self.base_phase = SyncPhase::Editing;
        }
        self.publish();
        Ok(())
    }

    /// Serialises behind any in-flight call, then pushes when there is
    /// something to push (or always, when `force` is set). Suppressed while a
    /// conflict is pending.
    async fn flush(&mut self, in_flight: &mut InFlight, force: bool) -> Result<()> {
        if let Some(pending) = in_flight.push.take() {
            let outcome = pending.await;
            self.finish_push(outcome)?;
        }
        if let Some(pending) = in_flight.fetch.take() {
            let result = pending.await;
            self.finish_fetch(result)?;
        }
        if self.conflicts.is_pending() {
            tracing::debug!("save suppressed while a conflict is pending");
            return Ok(());
        }
        if force || self.scheduler.has_changes(&self.entry) {
            let outcome = self.push_call().await;
            self.finish_push(outcome)?;
        }
        Ok(())
    }

    async fn resolve_conflict(&mut self, keep_server: bool) -> Result<()> {
        match self.conflicts.resolve(keep_server) {
            None => tracing::debug!("no conflict to resolve"),
            Some(Resolution::AdoptRemote(remote)) => {
                tracing::debug!("conflict resolved in favour of the server");
                let server_state = remote.saved.then(|| remote.clone());
                self.scheduler.mark_synced(server_state.as_ref());
                self.entry = remote;
                self.local
                    .save(&self.entry)
                    .context("caching server entry after conflict")?;
                self.base_phase = SyncPhase::RemoteReconciled;
                self.publish();
            }
            Some(Resolution::PushLocal) => {
                tracing::debug!("conflict resolved in favour of the local draft");
                let outcome = self.push_call().await;
                self.finish_push(outcome)?;
            }
        }
        Ok(())
    }

    async fn check_rollover(&mut self, in_flight: &mut InFlight) -> Result<()> {
        let now = self.clock.now();
        if now.offset() != self.next_midnight.offset() {
            // Local offset moved (DST): keep the same wall-clock midnight.
            let marker = self.next_midnight.replace_offset(now.offset());
            tracing::debug!(%marker, "local offset changed, moving rollover marker");
            self.next_midnight = marker;
        }
        if now < self.next_midnight {
            return Ok(());
        }

        tracing::info!(outgoing = %self.entry.date, "tripped daily reset");
        self.flush(in_flight, false).await?;
        if let Some(conflict) = self.conflicts.discard() {
            tracing::warn!(
                remote_rating = conflict.remote.emotion_scale,
                "unresolved conflict dropped at rollover, archiving local draft"
            );
        }

        let outgoing = std::mem::replace(&mut self.entry, Entry::blank(now.date()));
        self.history
            .append(&outgoing)
            .context("archiving outgoing entry")?;
        self.scheduler.reset();
        self.local
            .save(&self.entry)
            .context("resetting cached today entry")?;

        self.next_midnight = day::next_midnight(now);
        self.rolled_over_at = Some(now);
        self.base_phase = if self.fetched {
            SyncPhase::RemoteReconciled
        } else {
            SyncPhase::LocalLoaded
        };
        self.publish();
        Ok(())
    }

    async fn teardown(mut self, mut in_flight: InFlight) -> Result<()> {
        self.scheduler.cancel();
        // A fetch result can no longer be reconciled against anything useful.
        in_flight.fetch = None;
        self.fetch_requested = false;

        let budget = self.config.shutdown_flush();
        match timeout(budget, self.flush(&mut in_flight, false)).await {
            Ok(result) => result?,
            Err(_) => tracing::warn!(
                timeout_ms = budget.as_millis() as u64,
                "shutdown flush timed out with a save still in flight"
            ),
        }
        self.saving = false;
        self.local
            .save(&self.entry)
            .context("persisting entry at shutdown")?;
        self.publish();
        tracing::debug!("today entry controller stopped");
        Ok(())
    }

    fn record_failure(&mut self, operation: RemoteOperation, error: RemoteError) {
        if error.is_auth_expired() {
            tracing::warn!(?operation, "authentication expired, re-authentication required");
        }
        self.last_error = Some(SyncFailure {
            operation,
            error,
            occurred_at: self.clock.now(),
        });
    }

    fn phase(&self) -> SyncPhase {
        if self.conflicts.is_pending() {
            SyncPhase::ConflictPending
        } else if self.saving {
            SyncPhase::Saving
        } else {
            self.base_phase
        }
    }

    fn publish(&self) {
        self.state.send_replace(TodaySnapshot {
            phase: self.phase(),
            entry: self.entry.clone(),
            last_saved: self.last_saved,
            unsaved_changes: self.scheduler.has_changes(&self.entry),
            save_conflict: self.conflicts.pending().cloned(),
            last_error: self.last_error.clone(),
            rolled_over_at: self.rolled_over_at,
        });
    }
}

async fn await_slot<T>(slot: &mut Option<PendingCall<T>>) -> T {
    match slot {
        Some(call) => {
            let output = call.as_mut().await;
            *slot = None;
            output
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running [`TodayEntryController`]. Dropping it tears the
/// session down; [`TodayEntryHandle::shutdown`] also waits for the final save.
pub struct TodayEntryHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TodaySnapshot>,
    task: JoinHandle<Result<()>>,
}

impl TodayEntryHandle {
    pub fn snapshot(&self) -> TodaySnapshot {
        self.state.borrow().clone()
    }

    pub fn entry(&self) -> Entry {
        self.state.borrow().entry.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TodaySnapshot> {
        self.state.clone()
    }

    /// Queues a mutation of today's entry.
    pub fn edit<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Entry) + Send + 'static,
    {
        self.send(Command::Edit(Box::new(edit)))
    }

    pub fn set_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.edit(move |entry| entry.text = Some(text))
    }

    pub fn set_rating(&self, rating: u8) -> Result<()> {
        self.edit(move |entry| entry.set_emotion_scale(rating))
    }

    pub fn set_ephemeral(&self, ephemeral: bool) -> Result<()> {
        self.edit(move |entry| entry.ephemeral = ephemeral)
    }

    /// Fetches today's entry from the remote unless a fetch already succeeded.
    pub fn begin_fetch(&self) -> Result<()> {
        self.send(Command::BeginFetch)
    }

    /// Pushes the current entry now, after any in-flight call completes.
    pub async fn force_save(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::ForceSave(done))?;
        wait.await.map_err(|_| stopped())
    }

    pub async fn resolve_conflict(&self, keep_server: bool) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::ResolveConflict { keep_server, done })?;
        wait.await.map_err(|_| stopped())
    }

    /// Resolves once every command queued before it has been applied.
    pub async fn settled(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Settle(done))?;
        wait.await.map_err(|_| stopped())
    }

    /// Stops the session: timers are cancelled and unsaved changes get one
    /// last push. Returns the error that stopped the controller, if any.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.task
            .await
            .context("joining today entry controller")?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> anyhow::Error {
    anyhow!("today entry controller has stopped")
}
