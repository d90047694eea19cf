pub mod autosave;
pub mod conflict;
pub mod controller;
pub mod day;
pub mod entry;

pub use autosave::{SaveDecision, SaveScheduler};
pub use conflict::{ConflictResolver, Reconciliation, Resolution};
pub use controller::{
    RemoteOperation, SyncFailure, SyncPhase, TodayEntryController, TodayEntryHandle,
    TodaySnapshot,
};
pub use day::{Clock, SystemClock};
pub use entry::{Entry, SaveConflict};
