//! Bill auto-timeout scheduler.
//!
//! Every bill gets a hard wall-clock TTL from its creation time. Timers are
//! armed on creation and re-armed from the database at startup, so the
//! timeout survives process restarts. Firing is best-effort; the store's
//! status-transition contract guarantees at most one transition.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use split_storage::BillStore;
use split_types::{Bill, BillStatus, Result};

use crate::bus::SnapshotBus;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	pub ttl: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(600),
		}
	}
}

pub struct AutoTimeoutScheduler {
	store: Arc<dyn BillStore>,
	bus: Arc<SnapshotBus>,
	config: SchedulerConfig,
	shutdown: watch::Receiver<bool>,
}

impl AutoTimeoutScheduler {
	pub fn new(
		store: Arc<dyn BillStore>,
		bus: Arc<SnapshotBus>,
		config: SchedulerConfig,
		shutdown: watch::Receiver<bool>,
	) -> Arc<Self> {
		Arc::new(Self {
			store,
			bus,
			config,
			shutdown,
		})
	}

	/// Re-arm timers for every ACTIVE bill. Called once at startup; bills
	/// already past their deadline fire immediately.
	pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
		let bills = self
			.store
			.list_bills_by_status(&[BillStatus::Active])
			.await?;
		let count = bills.len();
		for bill in &bills {
			self.arm_for(bill);
		}
		info!(count, "auto-timeout timers re-armed");
		Ok(())
	}

	/// Arm the timer for a bill, taking its age into account.
	pub fn arm_for(self: &Arc<Self>, bill: &Bill) {
		let elapsed = Utc::now()
			.signed_duration_since(bill.created_at)
			.to_std()
			.unwrap_or_default();
		let remaining = self.config.ttl.saturating_sub(elapsed);
		self.arm(bill.id, remaining);
	}

	pub fn arm(self: &Arc<Self>, bill_id: Uuid, delay: Duration) {
		debug!(%bill_id, ?delay, "auto-timeout timer armed");
		let scheduler = self.clone();
		let mut shutdown = self.shutdown.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(delay) => scheduler.fire(bill_id).await,
				_ = shutdown.changed() => {}
			}
		});
	}

	async fn fire(self: Arc<Self>, bill_id: Uuid) {
		let bill = match self.store.get_bill_with_intents(bill_id, None).await {
			Ok(bill) => bill,
			Err(e) => {
				warn!(%bill_id, error = %e, "auto-timeout fetch failed");
				return;
			}
		};

		if bill.status != BillStatus::Active {
			debug!(%bill_id, status = %bill.status, "auto-timeout skipped, bill finalized");
			return;
		}

		// Timer races and clock skew re-arm instead of firing early.
		let elapsed = Utc::now()
			.signed_duration_since(bill.created_at)
			.to_std()
			.unwrap_or_default();
		if elapsed < self.config.ttl {
			let remaining = self.config.ttl - elapsed;
			debug!(%bill_id, ?remaining, "auto-timeout re-armed, deadline not reached");
			self.arm(bill_id, remaining);
			return;
		}

		// The DONE transition is owned by the store's collected update.
		if bill.goal_met() {
			debug!(%bill_id, "auto-timeout skipped, goal met");
			return;
		}

		if let Err(e) = self.store.set_bill_status(bill_id, BillStatus::Timeout).await {
			warn!(%bill_id, error = %e, "auto-timeout status update failed");
			return;
		}
		info!(%bill_id, "auto-timeout applied, bill -> TIMEOUT");

		match self.store.get_bill_with_intents(bill_id, None).await {
			Ok(updated) => self.bus.broadcast(bill_id, &updated).await,
			Err(e) => warn!(%bill_id, error = %e, "auto-timeout snapshot fetch failed"),
		}
	}
}
