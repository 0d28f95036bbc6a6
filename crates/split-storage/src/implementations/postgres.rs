//! PostgreSQL-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use split_types::address::{addr_eq, canonical};
use split_types::{
	Bill, BillStatus, HistoryItem, Intent, IntentStatus, OpType, ProxyInfo, Result, SplitError,
};

use crate::BillStore;

const CONNECT_ATTEMPTS: u32 = 12;

pub struct PgStorage {
	pool: PgPool,
}

fn db_err(e: sqlx::Error) -> SplitError {
	match e {
		sqlx::Error::RowNotFound => SplitError::NotFound("row not found".to_string()),
		other => SplitError::Persistence(other.to_string()),
	}
}

#[derive(sqlx::FromRow)]
struct BillRow {
	id: Uuid,
	goal: i64,
	collected: i64,
	creator_address: String,
	destination_address: String,
	proxy_wallet: String,
	state_init_hash: String,
	status: String,
	created_at: DateTime<Utc>,
	ended_at: Option<DateTime<Utc>>,
}

impl BillRow {
	fn into_bill(self) -> Result<Bill> {
		Ok(Bill {
			id: self.id,
			goal: self.goal,
			collected: self.collected,
			creator_address: self.creator_address,
			destination_address: self.destination_address,
			proxy_wallet: self.proxy_wallet,
			state_init_hash: self.state_init_hash,
			status: BillStatus::from_str(&self.status)
				.map_err(|e| SplitError::Persistence(e.to_string()))?,
			created_at: self.created_at,
			ended_at: self.ended_at,
			transactions: Vec::new(),
		})
	}
}

#[derive(sqlx::FromRow)]
struct IntentRow {
	id: Uuid,
	bill_id: Uuid,
	amount: i64,
	sender_address: String,
	op_type: String,
	status: String,
	created_at: DateTime<Utc>,
}

impl IntentRow {
	fn into_intent(self) -> Result<Intent> {
		Ok(Intent {
			id: self.id,
			bill_id: self.bill_id,
			amount: self.amount,
			sender_address: self.sender_address,
			op_type: OpType::parse(&self.op_type)
				.map_err(|e| SplitError::Persistence(e.to_string()))?,
			status: IntentStatus::from_str(&self.status)
				.map_err(|e| SplitError::Persistence(e.to_string()))?,
			created_at: self.created_at,
		})
	}
}

impl PgStorage {
	/// Connect with a bounded retry loop (fresh deployments race the
	/// database container) and run pending migrations.
	pub async fn connect(database_url: &str) -> Result<Self> {
		let mut last_err = None;
		for attempt in 1..=CONNECT_ATTEMPTS {
			match PgPoolOptions::new()
				.max_connections(5)
				.acquire_timeout(Duration::from_secs(3))
				.connect(database_url)
				.await
			{
				Ok(pool) => {
					sqlx::migrate!("./migrations")
						.run(&pool)
						.await
						.map_err(|e| SplitError::Persistence(e.to_string()))?;
					info!("connected to PostgreSQL, migrations applied");
					return Ok(Self { pool });
				}
				Err(e) => {
					warn!(attempt, error = %e, "postgres not ready, retrying");
					last_err = Some(e);
					tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
				}
			}
		}
		Err(db_err(last_err.expect("at least one connect attempt")))
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	async fn fetch_bill(&self, bill_id: Uuid) -> Result<Bill> {
		let row: Option<BillRow> = sqlx::query_as(
			"SELECT id, goal, collected, creator_address, destination_address, proxy_wallet, \
			 state_init_hash, status, created_at, ended_at FROM bills WHERE id = $1",
		)
		.bind(bill_id)
		.fetch_optional(&self.pool)
		.await
		.map_err(db_err)?;

		row.ok_or_else(|| SplitError::NotFound(format!("bill {bill_id} not found")))?
			.into_bill()
	}
}

#[async_trait]
impl BillStore for PgStorage {
	async fn create_bill(
		&self,
		goal: i64,
		creator: &str,
		destination: &str,
		proxy: &ProxyInfo,
	) -> Result<Bill> {
		let bill = Bill {
			id: Uuid::new_v4(),
			goal,
			collected: 0,
			creator_address: creator.to_string(),
			destination_address: destination.to_string(),
			proxy_wallet: proxy.address.clone(),
			state_init_hash: proxy.state_init_hash.clone(),
			status: BillStatus::Active,
			created_at: Utc::now(),
			ended_at: None,
			transactions: Vec::new(),
		};

		sqlx::query(
			"INSERT INTO bills (id, goal, collected, creator_address, destination_address, \
			 proxy_wallet, state_init_hash, status, created_at) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
		)
		.bind(bill.id)
		.bind(bill.goal)
		.bind(bill.collected)
		.bind(&bill.creator_address)
		.bind(&bill.destination_address)
		.bind(&bill.proxy_wallet)
		.bind(&bill.state_init_hash)
		.bind(bill.status.as_str())
		.bind(bill.created_at)
		.execute(&self.pool)
		.await
		.map_err(db_err)?;

		Ok(bill)
	}

	async fn add_intent(
		&self,
		bill_id: Uuid,
		amount: i64,
		sender: &str,
		op: OpType,
	) -> Result<Intent> {
		let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM bills WHERE id = $1)")
			.bind(bill_id)
			.fetch_one(&self.pool)
			.await
			.map_err(db_err)?;
		if !exists {
			return Err(SplitError::NotFound(format!("bill {bill_id} not found")));
		}

		let intent = Intent {
			id: Uuid::new_v4(),
			bill_id,
			amount,
			sender_address: sender.to_string(),
			op_type: op,
			status: IntentStatus::Pending,
			created_at: Utc::now(),
		};

		sqlx::query(
			"INSERT INTO transactions (id, bill_id, amount, sender_address, op_type, status, \
			 created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
		)
		.bind(intent.id)
		.bind(intent.bill_id)
		.bind(intent.amount)
		.bind(&intent.sender_address)
		.bind(intent.op_type.as_str())
		.bind(intent.status.as_str())
		.bind(intent.created_at)
		.execute(&self.pool)
		.await
		.map_err(db_err)?;

		Ok(intent)
	}

	async fn get_intent(&self, id: Uuid) -> Result<Intent> {
		let row: Option<IntentRow> = sqlx::query_as(
			"SELECT id, bill_id, amount, sender_address, op_type, status, created_at \
			 FROM transactions WHERE id = $1",
		)
		.bind(id)
		.fetch_optional(&self.pool)
		.await
		.map_err(db_err)?;

		row.ok_or_else(|| SplitError::NotFound(format!("intent {id} not found")))?
			.into_intent()
	}

	async fn set_intent_status(&self, id: Uuid, status: IntentStatus) -> Result<bool> {
		let updated = sqlx::query(
			"UPDATE transactions SET status = $2 WHERE id = $1 AND status = 'PENDING'",
		)
		.bind(id)
		.bind(status.as_str())
		.execute(&self.pool)
		.await
		.map_err(db_err)?
		.rows_affected();

		if updated == 1 {
			return Ok(true);
		}

		let current: Option<String> =
			sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1")
				.bind(id)
				.fetch_optional(&self.pool)
				.await
				.map_err(db_err)?;

		match current {
			None => Err(SplitError::NotFound(format!("intent {id} not found"))),
			Some(s) if s == status.as_str() => Ok(false),
			Some(s) => Err(SplitError::Validation(format!(
				"intent {id} is {s}, cannot transition to {status}"
			))),
		}
	}

	async fn increase_collected(&self, bill_id: Uuid, delta: i64) -> Result<i64> {
		let collected: Option<i64> = sqlx::query_scalar(
			"UPDATE bills SET \
			   collected = collected + $2, \
			   status = CASE WHEN collected + $2 >= goal AND status = 'ACTIVE' \
			                 THEN 'DONE' ELSE status END, \
			   ended_at = CASE WHEN collected + $2 >= goal AND status = 'ACTIVE' \
			                   THEN now() ELSE ended_at END \
			 WHERE id = $1 \
			 RETURNING collected",
		)
		.bind(bill_id)
		.bind(delta)
		.fetch_optional(&self.pool)
		.await
		.map_err(db_err)?;

		collected.ok_or_else(|| SplitError::NotFound(format!("bill {bill_id} not found")))
	}

	async fn apply_success(
		&self,
		intent_id: Uuid,
		bill_id: Uuid,
		onchain_amount: i64,
	) -> Result<bool> {
		let mut tx = self.pool.begin().await.map_err(db_err)?;

		let transitioned = sqlx::query(
			"UPDATE transactions SET status = 'SUCCESS' WHERE id = $1 AND status = 'PENDING'",
		)
		.bind(intent_id)
		.execute(&mut *tx)
		.await
		.map_err(db_err)?
		.rows_affected() == 1;

		if transitioned {
			sqlx::query(
				"UPDATE bills SET \
				   collected = collected + $2, \
				   status = CASE WHEN collected + $2 >= goal AND status = 'ACTIVE' \
				                 THEN 'DONE' ELSE status END, \
				   ended_at = CASE WHEN collected + $2 >= goal AND status = 'ACTIVE' \
				                   THEN now() ELSE ended_at END \
				 WHERE id = $1",
			)
			.bind(bill_id)
			.bind(onchain_amount)
			.execute(&mut *tx)
			.await
			.map_err(db_err)?;
		}

		tx.commit().await.map_err(db_err)?;
		Ok(transitioned)
	}

	async fn set_bill_status(&self, bill_id: Uuid, status: BillStatus) -> Result<()> {
		if !matches!(status, BillStatus::Timeout | BillStatus::Refunded) {
			return Err(SplitError::Validation(format!(
				"bill status {status} is not an explicit transition target"
			)));
		}

		let updated = sqlx::query(
			"UPDATE bills SET status = $2, ended_at = now() \
			 WHERE id = $1 AND status = 'ACTIVE'",
		)
		.bind(bill_id)
		.bind(status.as_str())
		.execute(&self.pool)
		.await
		.map_err(db_err)?
		.rows_affected();

		if updated == 1 {
			return Ok(());
		}

		// Distinguish a missing bill from a lost transition race.
		let bill = self.fetch_bill(bill_id).await?;
		Err(SplitError::Validation(format!(
			"bill {bill_id} is {}, cannot transition to {status}",
			bill.status
		)))
	}

	async fn get_bill_with_intents(
		&self,
		bill_id: Uuid,
		filter: Option<IntentStatus>,
	) -> Result<Bill> {
		let mut bill = self.fetch_bill(bill_id).await?;

		let rows: Vec<IntentRow> = match filter {
			Some(status) => {
				sqlx::query_as(
					"SELECT id, bill_id, amount, sender_address, op_type, status, created_at \
					 FROM transactions WHERE bill_id = $1 AND status = $2 \
					 ORDER BY created_at DESC",
				)
				.bind(bill_id)
				.bind(status.as_str())
				.fetch_all(&self.pool)
				.await
			}
			None => {
				sqlx::query_as(
					"SELECT id, bill_id, amount, sender_address, op_type, status, created_at \
					 FROM transactions WHERE bill_id = $1 ORDER BY created_at DESC",
				)
				.bind(bill_id)
				.fetch_all(&self.pool)
				.await
			}
		}
		.map_err(db_err)?;

		bill.transactions = rows
			.into_iter()
			.map(IntentRow::into_intent)
			.collect::<Result<Vec<_>>>()?;
		Ok(bill)
	}

	async fn list_bills_by_status(&self, statuses: &[BillStatus]) -> Result<Vec<Bill>> {
		let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
		let rows: Vec<BillRow> = sqlx::query_as(
			"SELECT id, goal, collected, creator_address, destination_address, proxy_wallet, \
			 state_init_hash, status, created_at, ended_at FROM bills \
			 WHERE status = ANY($1::text[]) ORDER BY created_at",
		)
		.bind(&wanted)
		.fetch_all(&self.pool)
		.await
		.map_err(db_err)?;

		rows.into_iter().map(BillRow::into_bill).collect()
	}

	async fn history(
		&self,
		sender: &str,
		page: u32,
		page_size: u32,
	) -> Result<(Vec<HistoryItem>, i64)> {
		let page = page.max(1);
		let page_size = page_size.clamp(1, 100);
		let offset = (page - 1) as i64 * page_size as i64;

		let total: i64 = sqlx::query_scalar(
			"SELECT COUNT(DISTINCT b.id) FROM bills b \
			 JOIN transactions t ON t.bill_id = b.id \
			   AND t.sender_address = $1 AND t.status = 'SUCCESS'",
		)
		.bind(sender)
		.fetch_one(&self.pool)
		.await
		.map_err(db_err)?;

		let rows: Vec<BillRow> = sqlx::query_as(
			"SELECT b.id, b.goal, b.collected, b.creator_address, b.destination_address, \
			 b.proxy_wallet, b.state_init_hash, b.status, b.created_at, b.ended_at \
			 FROM bills b \
			 JOIN transactions t ON t.bill_id = b.id \
			   AND t.sender_address = $1 AND t.status = 'SUCCESS' \
			 GROUP BY b.id \
			 ORDER BY MAX(t.created_at) DESC \
			 LIMIT $2 OFFSET $3",
		)
		.bind(sender)
		.bind(page_size as i64)
		.bind(offset)
		.fetch_all(&self.pool)
		.await
		.map_err(db_err)?;

		let bills: Vec<Bill> = rows
			.into_iter()
			.map(BillRow::into_bill)
			.collect::<Result<Vec<_>>>()?;
		let bill_ids: Vec<Uuid> = bills.iter().map(|b| b.id).collect();

		let intent_rows: Vec<IntentRow> = sqlx::query_as(
			"SELECT id, bill_id, amount, sender_address, op_type, status, created_at \
			 FROM transactions WHERE bill_id = ANY($1) AND status = 'SUCCESS'",
		)
		.bind(&bill_ids)
		.fetch_all(&self.pool)
		.await
		.map_err(db_err)?;

		// Per-sender sums use canonical address equality; the join above is
		// exact-match, so friendly/raw aliases of the sender still count here.
		let sender_raw = canonical(sender);
		let mut sums: HashMap<Uuid, i64> = HashMap::new();
		for row in intent_rows {
			let intent = row.into_intent()?;
			if addr_eq(&intent.sender_address, &sender_raw) {
				*sums.entry(intent.bill_id).or_insert(0) += intent.amount;
			}
		}

		let items = bills
			.into_iter()
			.map(|b| HistoryItem {
				amount: sums.get(&b.id).copied().unwrap_or(0),
				id: b.id,
				destination_address: b.destination_address,
				status: b.status,
				created_at: b.created_at,
			})
			.collect();

		Ok((items, total))
	}
}
