//! Command layer over the settlement core.
//!
//! Validates caller input, owns proxy derivation, and wires each new intent
//! to its watcher. Everything status-related is delegated to the store and
//! the core components.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use split_chain::derive_proxy;
use split_config::Config;
use split_core::{AutoTimeoutScheduler, IntentWatcher, SnapshotBus};
use split_storage::BillStore;
use split_types::address::addr_eq;
use split_types::{Bill, BillStatus, HistoryItem, Intent, IntentStatus, OpType, Result, SplitError};

pub struct SplitService {
	store: Arc<dyn BillStore>,
	bus: Arc<SnapshotBus>,
	watcher: Arc<IntentWatcher>,
	scheduler: Arc<AutoTimeoutScheduler>,
	config: Config,
}

impl SplitService {
	pub fn new(
		store: Arc<dyn BillStore>,
		bus: Arc<SnapshotBus>,
		watcher: Arc<IntentWatcher>,
		scheduler: Arc<AutoTimeoutScheduler>,
		config: Config,
	) -> Arc<Self> {
		Arc::new(Self {
			store,
			bus,
			watcher,
			scheduler,
			config,
		})
	}

	pub fn bus(&self) -> &Arc<SnapshotBus> {
		&self.bus
	}

	pub async fn create_bill(&self, goal: i64, destination: &str, creator: &str) -> Result<Bill> {
		if goal <= 0 {
			return Err(SplitError::validation(
				"goal must be a positive amount in base units",
			));
		}
		if destination.trim().is_empty() {
			return Err(SplitError::validation("destination_address is required"));
		}
		if creator.trim().is_empty() {
			return Err(SplitError::validation("creator wallet is required"));
		}

		// The fee collector comes from configuration and rides the
		// derivation call path; it is not read anywhere else.
		let proxy = derive_proxy(
			&self.config.smart_contract_hex,
			destination,
			creator,
			&self.config.fee_collector_address,
			goal,
		)?;

		let bill = self
			.store
			.create_bill(goal, creator, destination, &proxy)
			.await?;
		info!(
			bill_id = %bill.id,
			goal,
			destination,
			proxy = %bill.proxy_wallet,
			"bill created"
		);

		self.scheduler.arm_for(&bill);
		Ok(bill)
	}

	/// Record a pending intent and start its watcher. Watchers are spawned
	/// here and nowhere else, so each intent has exactly one.
	pub async fn create_intent(
		&self,
		bill_id: Uuid,
		amount: i64,
		sender: &str,
		op: OpType,
	) -> Result<Intent> {
		if amount <= 0 {
			return Err(SplitError::validation(
				"amount must be a positive amount in base units",
			));
		}
		if sender.trim().is_empty() {
			return Err(SplitError::validation("sender wallet is required"));
		}

		let intent = self.store.add_intent(bill_id, amount, sender, op).await?;
		info!(
			%bill_id,
			intent_id = %intent.id,
			amount,
			op = %op,
			"intent created (PENDING)"
		);

		self.watcher.spawn(bill_id, intent.id);
		Ok(intent)
	}

	/// Public bill read: only SUCCESS intents are exposed.
	pub async fn get_bill(&self, bill_id: Uuid) -> Result<Bill> {
		self.store
			.get_bill_with_intents(bill_id, Some(IntentStatus::Success))
			.await
	}

	pub async fn refund_bill(&self, bill_id: Uuid, by: &str) -> Result<()> {
		let bill = self.store.get_bill_with_intents(bill_id, None).await?;
		if !addr_eq(&bill.creator_address, by) {
			return Err(SplitError::validation(
				"refund denied: creator address mismatch",
			));
		}

		self.store
			.set_bill_status(bill_id, BillStatus::Refunded)
			.await?;
		info!(%bill_id, "bill refunded");

		if let Ok(updated) = self.store.get_bill_with_intents(bill_id, None).await {
			self.bus.broadcast(bill_id, &updated).await;
		}
		Ok(())
	}

	pub async fn history(
		&self,
		sender: &str,
		page: u32,
		page_size: u32,
	) -> Result<(Vec<HistoryItem>, i64)> {
		if sender.trim().is_empty() {
			return Err(SplitError::validation("sender wallet is required"));
		}
		self.store.history(sender, page, page_size).await
	}
}
