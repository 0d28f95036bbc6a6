//! Per-bill snapshot fan-out.
//!
//! Sinks are registered by the transport layer (one per upgraded client
//! connection) and receive the JSON-encoded bill after every transition.
//! Delivery is best-effort: the snapshot is encoded once, each sink gets a
//! bounded send window, and a sink that cannot keep up is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use split_types::Bill;

const SINK_BUFFER: usize = 8;
const DEFAULT_SEND_DEADLINE: Duration = Duration::from_secs(2);

pub struct SnapshotBus {
	sinks: RwLock<HashMap<Uuid, HashMap<u64, mpsc::Sender<String>>>>,
	next_id: AtomicU64,
	send_deadline: Duration,
}

impl Default for SnapshotBus {
	fn default() -> Self {
		Self::new()
	}
}

impl SnapshotBus {
	pub fn new() -> Self {
		Self::with_send_deadline(DEFAULT_SEND_DEADLINE)
	}

	pub fn with_send_deadline(send_deadline: Duration) -> Self {
		Self {
			sinks: RwLock::new(HashMap::new()),
			next_id: AtomicU64::new(0),
			send_deadline,
		}
	}

	/// Register a sink for a bill. The returned id unsubscribes it.
	pub async fn subscribe(&self, bill_id: Uuid) -> (u64, mpsc::Receiver<String>) {
		let (tx, rx) = mpsc::channel(SINK_BUFFER);
		let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		self.sinks
			.write()
			.await
			.entry(bill_id)
			.or_default()
			.insert(id, tx);
		(id, rx)
	}

	pub async fn unsubscribe(&self, bill_id: Uuid, sink_id: u64) {
		let mut sinks = self.sinks.write().await;
		if let Some(set) = sinks.get_mut(&bill_id) {
			set.remove(&sink_id);
			if set.is_empty() {
				sinks.remove(&bill_id);
			}
		}
	}

	pub async fn subscriber_count(&self, bill_id: Uuid) -> usize {
		self.sinks
			.read()
			.await
			.get(&bill_id)
			.map_or(0, HashMap::len)
	}

	/// Publish a post-transition snapshot to every sink of the bill.
	/// Failed sinks (closed or over their send deadline) are removed.
	pub async fn broadcast(&self, bill_id: Uuid, bill: &Bill) {
		let payload = match serde_json::to_string(bill) {
			Ok(payload) => payload,
			Err(e) => {
				warn!(%bill_id, error = %e, "snapshot encode failed");
				return;
			}
		};

		let targets: Vec<(u64, mpsc::Sender<String>)> = self
			.sinks
			.read()
			.await
			.get(&bill_id)
			.map(|set| set.iter().map(|(id, tx)| (*id, tx.clone())).collect())
			.unwrap_or_default();
		if targets.is_empty() {
			return;
		}

		let mut failed = Vec::new();
		for (id, tx) in targets {
			let sent = tokio::time::timeout(self.send_deadline, tx.send(payload.clone())).await;
			if !matches!(sent, Ok(Ok(()))) {
				failed.push(id);
			}
		}

		if !failed.is_empty() {
			warn!(%bill_id, evicted = failed.len(), "slow or closed snapshot sinks removed");
			for id in failed {
				self.unsubscribe(bill_id, id).await;
			}
		}
		debug!(%bill_id, "snapshot broadcast");
	}
}
