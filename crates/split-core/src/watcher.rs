//! Per-intent settlement watcher.
//!
//! One watcher exists per pending intent, spawned when the intent is
//! created and never on bill re-fetch. It waits on stream events for the
//! bill's proxy address, corroborates each trigger through the REST query,
//! and drives the intent to SUCCESS or FAILED. A 3-second polling fallback
//! re-derives state when stream events are dropped, and a hard timeout
//! fails the intent when nothing settles it.
//!
//! Persistence and query errors inside the loop are logged and retried on
//! the next trigger; only a completed transition, the hard timeout, or
//! process shutdown ends the watcher. The listener registration is released
//! on every exit path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use split_settlement::{MatchOutcome, Matcher};
use split_storage::BillStore;
use split_types::address::canonical;
use split_types::{AccountStream, Bill, Intent, IntentStatus};

use crate::bus::SnapshotBus;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
	/// Scan-match fallback cadence.
	pub poll_interval: Duration,
	/// Wall-clock limit before the intent is failed outright.
	pub hard_timeout: Duration,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(3),
			hard_timeout: Duration::from_secs(600),
		}
	}
}

/// Shared dependencies for all intent watchers.
pub struct IntentWatcher {
	store: Arc<dyn BillStore>,
	stream: Arc<dyn AccountStream>,
	matcher: Arc<Matcher>,
	bus: Arc<SnapshotBus>,
	config: WatcherConfig,
	shutdown: watch::Receiver<bool>,
}

impl IntentWatcher {
	pub fn new(
		store: Arc<dyn BillStore>,
		stream: Arc<dyn AccountStream>,
		matcher: Arc<Matcher>,
		bus: Arc<SnapshotBus>,
		config: WatcherConfig,
		shutdown: watch::Receiver<bool>,
	) -> Arc<Self> {
		Arc::new(Self {
			store,
			stream,
			matcher,
			bus,
			config,
			shutdown,
		})
	}

	/// Start watching one pending intent.
	pub fn spawn(self: &Arc<Self>, bill_id: Uuid, intent_id: Uuid) -> JoinHandle<()> {
		let watcher = self.clone();
		tokio::spawn(async move { watcher.watch(bill_id, intent_id).await })
	}

	async fn watch(&self, bill_id: Uuid, intent_id: Uuid) {
		let bill = match self.store.get_bill_with_intents(bill_id, None).await {
			Ok(bill) => bill,
			Err(e) => {
				warn!(%bill_id, error = %e, "watch aborted, bill not readable");
				return;
			}
		};
		let intent = match self.store.get_intent(intent_id).await {
			Ok(intent) => intent,
			Err(e) => {
				warn!(%intent_id, error = %e, "watch aborted, intent not readable");
				return;
			}
		};
		if intent.bill_id != bill.id {
			warn!(%bill_id, %intent_id, "watch aborted, intent belongs to another bill");
			return;
		}
		if intent.status != IntentStatus::Pending {
			debug!(%intent_id, status = %intent.status, "watch skipped, intent already settled");
			return;
		}
		if bill.proxy_wallet.is_empty() {
			warn!(%bill_id, "watch aborted, bill has no proxy address");
			return;
		}

		let proxy = canonical(&bill.proxy_wallet);
		let (rx, mut handle) = self.stream.register_listener(&proxy);
		if let Err(e) = self.stream.subscribe(std::slice::from_ref(&proxy)).await {
			handle.cancel();
			warn!(%bill_id, %intent_id, error = %e, "watch aborted, subscribe failed");
			return;
		}

		info!(%bill_id, %intent_id, address = %proxy, "watch started");
		self.run(bill, intent, proxy, rx, handle).await;
	}

	async fn run(
		&self,
		bill: Bill,
		intent: Intent,
		proxy: String,
		mut rx: tokio::sync::mpsc::Receiver<split_types::ChainEvent>,
		mut handle: split_types::ListenerHandle,
	) {
		let mut shutdown = self.shutdown.clone();
		let mut poll = tokio::time::interval_at(
			tokio::time::Instant::now() + self.config.poll_interval,
			self.config.poll_interval,
		);
		let hard_timeout = tokio::time::sleep(self.config.hard_timeout);
		tokio::pin!(hard_timeout);

		loop {
			tokio::select! {
				maybe_event = rx.recv() => match maybe_event {
					Some(event) => {
						debug!(bill_id = %bill.id, lt = event.lt, tx_hash = %event.tx_hash, "watch event received");
						match self.matcher.match_event(event.lt, &intent, &bill).await {
							Ok(MatchOutcome::Success { lt, amount }) => {
								if self.settle_success(&bill, &intent, lt, amount).await {
									return;
								}
							}
							Ok(MatchOutcome::Bounced { lt }) => {
								if self.settle_failed(&bill, &intent, lt).await {
									return;
								}
							}
							Ok(_) => {
								debug!(bill_id = %bill.id, lt = event.lt, "event not ours, continue");
							}
							Err(e) => {
								warn!(bill_id = %bill.id, lt = event.lt, error = %e, "event match failed");
							}
						}
					}
					// Channel closed: the stream is reconnecting or shutting
					// down. Re-register and keep waiting; the hard timeout
					// is deliberately not reset.
					None => {
						if *shutdown.borrow() {
							debug!(bill_id = %bill.id, intent_id = %intent.id, "watch stopped at shutdown");
							return;
						}
						warn!(bill_id = %bill.id, intent_id = %intent.id, "listener closed, re-registering");
						handle.cancel();
						let (new_rx, new_handle) = self.stream.register_listener(&proxy);
						rx = new_rx;
						handle = new_handle;
						if let Err(e) = self.stream.subscribe(std::slice::from_ref(&proxy)).await {
							warn!(bill_id = %bill.id, error = %e, "re-subscribe failed, relying on replay");
						}
					}
				},
				_ = poll.tick() => {
					match self.matcher.match_recent(&intent, &bill).await {
						Ok(MatchOutcome::Success { lt, amount }) => {
							if self.settle_success(&bill, &intent, lt, amount).await {
								return;
							}
						}
						Ok(_) => {}
						Err(e) => {
							debug!(bill_id = %bill.id, error = %e, "poll query failed, will retry");
						}
					}
				},
				_ = &mut hard_timeout => {
					warn!(bill_id = %bill.id, intent_id = %intent.id, "watch timeout, intent failed");
					if let Err(e) = self.store.set_intent_status(intent.id, IntentStatus::Failed).await {
						warn!(intent_id = %intent.id, error = %e, "timeout status update failed");
					}
					self.broadcast(bill.id).await;
					return;
				},
				_ = shutdown.changed() => {
					debug!(bill_id = %bill.id, intent_id = %intent.id, "watch stopped at shutdown");
					return;
				}
			}
		}
	}

	/// Apply a SUCCESS settlement. Returns `true` when the watcher is done;
	/// a persistence error keeps it alive so the next trigger retries.
	async fn settle_success(&self, bill: &Bill, intent: &Intent, lt: u64, amount: i64) -> bool {
		match self.store.apply_success(intent.id, bill.id, amount).await {
			Ok(transitioned) => {
				info!(
					bill_id = %bill.id,
					intent_id = %intent.id,
					lt,
					amount,
					transitioned,
					"intent matched -> SUCCESS"
				);
				self.broadcast(bill.id).await;
				true
			}
			Err(e) => {
				warn!(intent_id = %intent.id, error = %e, "success settlement write failed, retrying");
				false
			}
		}
	}

	async fn settle_failed(&self, bill: &Bill, intent: &Intent, lt: u64) -> bool {
		match self
			.store
			.set_intent_status(intent.id, IntentStatus::Failed)
			.await
		{
			Ok(_) => {
				info!(bill_id = %bill.id, intent_id = %intent.id, lt, "intent bounced -> FAILED");
				self.broadcast(bill.id).await;
				true
			}
			Err(e) => {
				warn!(intent_id = %intent.id, error = %e, "failed settlement write failed, retrying");
				false
			}
		}
	}

	async fn broadcast(&self, bill_id: Uuid) {
		match self.store.get_bill_with_intents(bill_id, None).await {
			Ok(updated) => self.bus.broadcast(bill_id, &updated).await,
			Err(e) => warn!(%bill_id, error = %e, "post-transition snapshot fetch failed"),
		}
	}
}
