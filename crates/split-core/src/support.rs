//! In-memory fakes of the storage and stream seams for core tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use split_storage::BillStore;
use split_types::address::{addr_eq, canonical};
use split_types::{
	AccountStream, Bill, BillStatus, ChainEvent, ChainQuery, HistoryItem, Intent, IntentStatus,
	ListenerHandle, OpType, ProxyInfo, Result, SplitError, TcInMsg, TcTransaction, TcTxId,
};

pub const PROXY: &str = "0:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
pub const SENDER: &str = "0:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

pub fn make_bill(goal: i64, created_at: DateTime<Utc>) -> Bill {
	Bill {
		id: Uuid::new_v4(),
		goal,
		collected: 0,
		creator_address: "0:bb".into(),
		destination_address: "0:dd".into(),
		proxy_wallet: PROXY.into(),
		state_init_hash: "init".into(),
		status: BillStatus::Active,
		created_at,
		ended_at: None,
		transactions: vec![],
	}
}

pub fn make_intent(bill_id: Uuid, amount: i64) -> Intent {
	Intent {
		id: Uuid::new_v4(),
		bill_id,
		amount,
		sender_address: SENDER.into(),
		op_type: OpType::Contribute,
		status: IntentStatus::Pending,
		created_at: Utc::now(),
	}
}

pub fn make_tx(lt: u64, source: &str, destination: &str, value: &str, bounced: bool) -> TcTransaction {
	TcTransaction {
		transaction_id: TcTxId {
			lt: lt.to_string(),
			to_lt: None,
			hash: format!("h{lt}"),
		},
		in_msg: TcInMsg {
			source: source.into(),
			destination: destination.into(),
			value: value.into(),
			message: None,
			msg_data: Default::default(),
			bounce: false,
			bounced,
		},
	}
}

#[derive(Default)]
struct StoreState {
	bills: HashMap<Uuid, Bill>,
	intents: HashMap<Uuid, Intent>,
}

/// In-memory [`BillStore`] honoring the same transition contracts as the
/// Postgres implementation.
#[derive(Default)]
pub struct MockStore {
	state: Mutex<StoreState>,
}

impl MockStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert_bill(&self, bill: Bill) {
		self.lock().bills.insert(bill.id, bill);
	}

	pub fn insert_intent(&self, intent: Intent) {
		self.lock().intents.insert(intent.id, intent);
	}

	pub fn bill(&self, id: Uuid) -> Bill {
		self.lock().bills.get(&id).cloned().expect("bill in store")
	}

	pub fn intent(&self, id: Uuid) -> Intent {
		self.lock()
			.intents
			.get(&id)
			.cloned()
			.expect("intent in store")
	}

	fn lock(&self) -> MutexGuard<'_, StoreState> {
		self.state.lock().expect("mock store lock")
	}

	fn increase(state: &mut StoreState, bill_id: Uuid, delta: i64) -> Result<i64> {
		let bill = state
			.bills
			.get_mut(&bill_id)
			.ok_or_else(|| SplitError::NotFound(format!("bill {bill_id} not found")))?;
		bill.collected += delta;
		if bill.collected >= bill.goal && bill.status == BillStatus::Active {
			bill.status = BillStatus::Done;
			bill.ended_at = Some(Utc::now());
		}
		Ok(bill.collected)
	}
}

#[async_trait]
impl BillStore for MockStore {
	async fn create_bill(
		&self,
		goal: i64,
		creator: &str,
		destination: &str,
		proxy: &ProxyInfo,
	) -> Result<Bill> {
		let mut bill = make_bill(goal, Utc::now());
		bill.creator_address = creator.to_string();
		bill.destination_address = destination.to_string();
		bill.proxy_wallet = proxy.address.clone();
		bill.state_init_hash = proxy.state_init_hash.clone();
		self.insert_bill(bill.clone());
		Ok(bill)
	}

	async fn add_intent(
		&self,
		bill_id: Uuid,
		amount: i64,
		sender: &str,
		op: OpType,
	) -> Result<Intent> {
		let mut state = self.lock();
		if !state.bills.contains_key(&bill_id) {
			return Err(SplitError::NotFound(format!("bill {bill_id} not found")));
		}
		let mut intent = make_intent(bill_id, amount);
		intent.sender_address = sender.to_string();
		intent.op_type = op;
		state.intents.insert(intent.id, intent.clone());
		Ok(intent)
	}

	async fn get_intent(&self, id: Uuid) -> Result<Intent> {
		self.lock()
			.intents
			.get(&id)
			.cloned()
			.ok_or_else(|| SplitError::NotFound(format!("intent {id} not found")))
	}

	async fn set_intent_status(&self, id: Uuid, status: IntentStatus) -> Result<bool> {
		let mut state = self.lock();
		let intent = state
			.intents
			.get_mut(&id)
			.ok_or_else(|| SplitError::NotFound(format!("intent {id} not found")))?;
		match intent.status {
			IntentStatus::Pending => {
				intent.status = status;
				Ok(true)
			}
			current if current == status => Ok(false),
			current => Err(SplitError::Validation(format!(
				"intent {id} is {current}, cannot transition to {status}"
			))),
		}
	}

	async fn increase_collected(&self, bill_id: Uuid, delta: i64) -> Result<i64> {
		Self::increase(&mut *self.lock(), bill_id, delta)
	}

	async fn apply_success(
		&self,
		intent_id: Uuid,
		bill_id: Uuid,
		onchain_amount: i64,
	) -> Result<bool> {
		let mut state = self.lock();
		let intent = state
			.intents
			.get_mut(&intent_id)
			.ok_or_else(|| SplitError::NotFound(format!("intent {intent_id} not found")))?;
		if intent.status != IntentStatus::Pending {
			return Ok(false);
		}
		intent.status = IntentStatus::Success;
		Self::increase(&mut *state, bill_id, onchain_amount)?;
		Ok(true)
	}

	async fn set_bill_status(&self, bill_id: Uuid, status: BillStatus) -> Result<()> {
		if !matches!(status, BillStatus::Timeout | BillStatus::Refunded) {
			return Err(SplitError::Validation(format!(
				"bill status {status} is not an explicit transition target"
			)));
		}
		let mut state = self.lock();
		let bill = state
			.bills
			.get_mut(&bill_id)
			.ok_or_else(|| SplitError::NotFound(format!("bill {bill_id} not found")))?;
		if bill.status != BillStatus::Active {
			return Err(SplitError::Validation(format!(
				"bill {bill_id} is {}, cannot transition to {status}",
				bill.status
			)));
		}
		bill.status = status;
		bill.ended_at = Some(Utc::now());
		Ok(())
	}

	async fn get_bill_with_intents(
		&self,
		bill_id: Uuid,
		filter: Option<IntentStatus>,
	) -> Result<Bill> {
		let state = self.lock();
		let mut bill = state
			.bills
			.get(&bill_id)
			.cloned()
			.ok_or_else(|| SplitError::NotFound(format!("bill {bill_id} not found")))?;
		let mut intents: Vec<Intent> = state
			.intents
			.values()
			.filter(|i| i.bill_id == bill_id && filter.map_or(true, |f| i.status == f))
			.cloned()
			.collect();
		intents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
		bill.transactions = intents;
		Ok(bill)
	}

	async fn list_bills_by_status(&self, statuses: &[BillStatus]) -> Result<Vec<Bill>> {
		Ok(self
			.lock()
			.bills
			.values()
			.filter(|b| statuses.contains(&b.status))
			.cloned()
			.collect())
	}

	async fn history(
		&self,
		sender: &str,
		page: u32,
		page_size: u32,
	) -> Result<(Vec<HistoryItem>, i64)> {
		let state = self.lock();
		let mut items: Vec<HistoryItem> = state
			.bills
			.values()
			.filter_map(|bill| {
				let amount: i64 = state
					.intents
					.values()
					.filter(|i| {
						i.bill_id == bill.id
							&& i.status == IntentStatus::Success
							&& addr_eq(&i.sender_address, sender)
					})
					.map(|i| i.amount)
					.sum();
				(amount > 0).then(|| HistoryItem {
					id: bill.id,
					amount,
					destination_address: bill.destination_address.clone(),
					status: bill.status,
					created_at: bill.created_at,
				})
			})
			.collect();
		items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

		let total = items.len() as i64;
		let start = ((page.max(1) - 1) * page_size) as usize;
		let page_items = items.into_iter().skip(start).take(page_size as usize).collect();
		Ok((page_items, total))
	}
}

#[derive(Default)]
struct StreamListeners {
	listeners: HashMap<String, HashMap<u64, mpsc::Sender<ChainEvent>>>,
	next_id: u64,
	subscribe_calls: Vec<Vec<String>>,
}

/// Scriptable [`AccountStream`] with the same listener lifecycle as the
/// real stream.
#[derive(Default)]
pub struct MockStream {
	state: Arc<Mutex<StreamListeners>>,
	pub fail_subscribe: AtomicBool,
}

impl MockStream {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn emit(&self, account: &str, lt: u64) {
		let key = canonical(account);
		let targets: Vec<mpsc::Sender<ChainEvent>> = self
			.lock()
			.listeners
			.get(&key)
			.map(|set| set.values().cloned().collect())
			.unwrap_or_default();
		for target in targets {
			let _ = target.try_send(ChainEvent {
				account: account.to_string(),
				tx_hash: format!("hash-{lt}"),
				lt,
			});
		}
	}

	pub fn listener_count(&self, account: &str) -> usize {
		let key = canonical(account);
		self.lock().listeners.get(&key).map_or(0, HashMap::len)
	}

	pub fn subscribe_calls(&self) -> usize {
		self.lock().subscribe_calls.len()
	}

	/// Simulate a stream teardown: every listener channel closes.
	pub fn close_all(&self) {
		self.lock().listeners.clear();
	}

	fn lock(&self) -> MutexGuard<'_, StreamListeners> {
		self.state.lock().expect("mock stream lock")
	}
}

#[async_trait]
impl AccountStream for MockStream {
	fn register_listener(&self, address: &str) -> (mpsc::Receiver<ChainEvent>, ListenerHandle) {
		let key = canonical(address);
		let (tx, rx) = mpsc::channel(16);
		let id = {
			let mut state = self.lock();
			state.next_id += 1;
			let id = state.next_id;
			state.listeners.entry(key.clone()).or_default().insert(id, tx);
			id
		};

		let state = self.state.clone();
		let handle = ListenerHandle::new(move || {
			let mut state = state.lock().expect("mock stream lock");
			if let Some(set) = state.listeners.get_mut(&key) {
				set.remove(&id);
			}
		});
		(rx, handle)
	}

	async fn subscribe(&self, addresses: &[String]) -> Result<()> {
		if self.fail_subscribe.load(Ordering::Relaxed) {
			return Err(SplitError::ChainStream("subscribe refused".to_string()));
		}
		self.lock().subscribe_calls.push(addresses.to_vec());
		Ok(())
	}
}

/// [`ChainQuery`] returning a programmable page.
#[derive(Default)]
pub struct ScriptedQuery {
	page: Mutex<Vec<TcTransaction>>,
}

impl ScriptedQuery {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_page(&self, page: Vec<TcTransaction>) {
		*self.page.lock().expect("query page lock") = page;
	}
}

#[async_trait]
impl ChainQuery for ScriptedQuery {
	async fn recent_transactions(&self, _address: &str, _limit: u32) -> Result<Vec<TcTransaction>> {
		Ok(self.page.lock().expect("query page lock").clone())
	}
}

// The fakes must honor the same transition contracts as the real store, or
// the watcher and scheduler tests prove nothing.
#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn apply_success_increments_exactly_once() {
		let store = MockStore::new();
		let bill = make_bill(1_000, Utc::now());
		let intent = make_intent(bill.id, 400);
		store.insert_bill(bill.clone());
		store.insert_intent(intent.clone());

		assert!(store.apply_success(intent.id, bill.id, 400).await.unwrap());
		assert!(!store.apply_success(intent.id, bill.id, 400).await.unwrap());
		assert_eq!(store.bill(bill.id).collected, 400);
	}

	#[tokio::test]
	async fn set_intent_status_only_transitions_out_of_pending() {
		let store = MockStore::new();
		let bill = make_bill(1_000, Utc::now());
		let intent = make_intent(bill.id, 400);
		store.insert_bill(bill.clone());
		store.insert_intent(intent.clone());

		assert!(store
			.set_intent_status(intent.id, IntentStatus::Failed)
			.await
			.unwrap());
		// Same target again: idempotent no-op.
		assert!(!store
			.set_intent_status(intent.id, IntentStatus::Failed)
			.await
			.unwrap());
		// Terminal to terminal: refused.
		assert!(store
			.set_intent_status(intent.id, IntentStatus::Success)
			.await
			.is_err());
	}

	#[tokio::test]
	async fn collected_upgrade_to_done_happens_with_the_increment() {
		let store = MockStore::new();
		let bill = make_bill(500, Utc::now());
		store.insert_bill(bill.clone());

		assert_eq!(store.increase_collected(bill.id, 499).await.unwrap(), 499);
		assert_eq!(store.bill(bill.id).status, BillStatus::Active);

		assert_eq!(store.increase_collected(bill.id, 1).await.unwrap(), 500);
		let done = store.bill(bill.id);
		assert_eq!(done.status, BillStatus::Done);
		assert!(done.ended_at.is_some());
	}

	#[tokio::test]
	async fn bill_status_transitions_are_single_shot() {
		let store = MockStore::new();
		let bill = make_bill(1_000, Utc::now());
		store.insert_bill(bill.clone());

		store
			.set_bill_status(bill.id, BillStatus::Refunded)
			.await
			.unwrap();
		assert!(store
			.set_bill_status(bill.id, BillStatus::Timeout)
			.await
			.is_err());
	}
}
