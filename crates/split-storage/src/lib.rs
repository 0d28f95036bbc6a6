//! Persistence store for bills and intents.
//!
//! The store exclusively owns persistence. Status-affecting operations run
//! one transaction each; the aggregate update is a single conditional UPDATE
//! so a concurrent watcher can never observe a torn increment, and the
//! ACTIVE→DONE upgrade happens in the same statement that crosses the goal.

use async_trait::async_trait;
use uuid::Uuid;

use split_types::{Bill, BillStatus, HistoryItem, Intent, IntentStatus, OpType, ProxyInfo, Result};

pub mod implementations {
	pub mod postgres;
}

pub use implementations::postgres::PgStorage;

/// Durable record of bills, intents and the collected aggregate.
///
/// Implemented by [`PgStorage`]; core components depend on the trait so their
/// tests can run against an in-memory fake.
#[async_trait]
pub trait BillStore: Send + Sync {
	/// Create an ACTIVE bill with `collected = 0`.
	async fn create_bill(
		&self,
		goal: i64,
		creator: &str,
		destination: &str,
		proxy: &ProxyInfo,
	) -> Result<Bill>;

	/// Record a PENDING intent. Fails with `NotFound` if the bill is absent.
	async fn add_intent(
		&self,
		bill_id: Uuid,
		amount: i64,
		sender: &str,
		op: OpType,
	) -> Result<Intent>;

	async fn get_intent(&self, id: Uuid) -> Result<Intent>;

	/// Transition an intent out of PENDING. Returns `true` if this call
	/// performed the transition, `false` if the target status was already
	/// set. Any other source status is an error; SUCCESS and FAILED are
	/// terminal.
	async fn set_intent_status(&self, id: Uuid, status: IntentStatus) -> Result<bool>;

	/// Atomically add `delta` to the bill's collected amount, upgrading
	/// ACTIVE→DONE (and stamping `ended_at`) in the same statement when the
	/// goal is reached. Returns the new collected value.
	async fn increase_collected(&self, bill_id: Uuid, delta: i64) -> Result<i64>;

	/// SUCCESS settlement applied in one transaction: the PENDING-guarded
	/// intent transition plus the conditional collected update. Returns
	/// `false` (and increments nothing) when the intent had already left
	/// PENDING.
	async fn apply_success(&self, intent_id: Uuid, bill_id: Uuid, onchain_amount: i64)
		-> Result<bool>;

	/// Transition ACTIVE→{TIMEOUT, REFUNDED}, stamping `ended_at`.
	async fn set_bill_status(&self, bill_id: Uuid, status: BillStatus) -> Result<()>;

	/// Bill with its intents ordered by creation time, newest first,
	/// optionally filtered by intent status.
	async fn get_bill_with_intents(
		&self,
		bill_id: Uuid,
		filter: Option<IntentStatus>,
	) -> Result<Bill>;

	async fn list_bills_by_status(&self, statuses: &[BillStatus]) -> Result<Vec<Bill>>;

	/// Bills where any SUCCESS intent was sent by `sender`, paged, newest
	/// matching intent first, with the per-bill sum of that sender's SUCCESS
	/// amounts. Returns the page and the total bill count.
	async fn history(
		&self,
		sender: &str,
		page: u32,
		page_size: u32,
	) -> Result<(Vec<HistoryItem>, i64)>;
}
