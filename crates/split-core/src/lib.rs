//! Settlement core: per-intent watchers, the snapshot bus and the bill
//! auto-timeout scheduler.

pub mod bus;
pub mod scheduler;
pub mod watcher;

#[cfg(test)]
pub(crate) mod support;

pub use bus::SnapshotBus;
pub use scheduler::{AutoTimeoutScheduler, SchedulerConfig};
pub use watcher::{IntentWatcher, WatcherConfig};
