//! Settlement matching.
//!
//! Correlates an on-chain transaction page with a pending intent. Both
//! matching modes are pure over `(intent, bill, page)`; [`Matcher`] binds
//! them to a [`ChainQuery`] so the watcher gets a single call per trigger.
//!
//! A transaction settles an intent when it pays the bill's proxy address,
//! comes from the intent's sender and carries at least the declared amount.
//! Bounced transactions at the event's logical time fail the intent; an
//! unrelated transaction is ignored and the watcher keeps waiting.

use std::sync::Arc;
use tracing::{debug, warn};

use split_types::address::addr_eq;
use split_types::{Bill, ChainQuery, Intent, Result, TcTransaction};

const EVENT_PAGE_LIMIT: u32 = 20;
const SCAN_PAGE_LIMIT: u32 = 30;

/// Decision for one matching attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
	/// The intent is settled by a transaction carrying `amount` at `lt`.
	Success { lt: u64, amount: i64 },
	/// The transaction at the event's logical time bounced back to its
	/// sender; the intent fails.
	Bounced { lt: u64 },
	/// A transaction was found at the logical time but does not settle this
	/// intent.
	Ignore,
	/// Nothing relevant in the fetched window.
	NotFound,
}

/// Exact-LT match: find the transaction the event points at and judge it.
pub fn match_by_lt(lt: u64, intent: &Intent, bill: &Bill, page: &[TcTransaction]) -> MatchOutcome {
	let wanted = lt.to_string();
	let Some(tx) = page.iter().find(|tx| tx.transaction_id.lt == wanted) else {
		return MatchOutcome::NotFound;
	};

	let amount = parse_amount(&tx.in_msg.value);
	let bounced = tx.in_msg.bounce || tx.in_msg.bounced;
	let matched = addr_eq(&tx.in_msg.destination, &bill.proxy_wallet)
		&& addr_eq(&tx.in_msg.source, &intent.sender_address)
		&& amount >= intent.amount;

	if bounced {
		MatchOutcome::Bounced { lt }
	} else if matched {
		MatchOutcome::Success { lt, amount }
	} else {
		MatchOutcome::Ignore
	}
}

/// Scan match: first transaction in the window that settles the intent.
pub fn match_any(intent: &Intent, bill: &Bill, page: &[TcTransaction]) -> MatchOutcome {
	for tx in page {
		if !addr_eq(&tx.in_msg.destination, &bill.proxy_wallet) {
			continue;
		}
		if !addr_eq(&tx.in_msg.source, &intent.sender_address) {
			continue;
		}
		if tx.in_msg.bounce || tx.in_msg.bounced {
			continue;
		}
		let amount = parse_amount(&tx.in_msg.value);
		if amount < intent.amount {
			continue;
		}

		let lt = tx.transaction_id.lt.parse::<u64>().unwrap_or_default();
		return MatchOutcome::Success { lt, amount };
	}
	MatchOutcome::NotFound
}

fn parse_amount(value: &str) -> i64 {
	match value.trim().parse::<i64>() {
		Ok(v) => v,
		Err(_) => {
			if !value.is_empty() {
				warn!(value, "unparseable transaction value, treating as zero");
			}
			0
		}
	}
}

/// Matcher bound to a transaction source.
pub struct Matcher {
	query: Arc<dyn ChainQuery>,
}

impl Matcher {
	pub fn new(query: Arc<dyn ChainQuery>) -> Self {
		Self { query }
	}

	/// Judge the stream event's transaction against the intent.
	pub async fn match_event(&self, lt: u64, intent: &Intent, bill: &Bill) -> Result<MatchOutcome> {
		let page = self
			.query
			.recent_transactions(&bill.proxy_wallet, EVENT_PAGE_LIMIT)
			.await?;
		let outcome = match_by_lt(lt, intent, bill, &page);
		debug!(bill_id = %bill.id, intent_id = %intent.id, lt, ?outcome, "event match");
		Ok(outcome)
	}

	/// Poll fallback: scan the recent window for anything settling the
	/// intent.
	pub async fn match_recent(&self, intent: &Intent, bill: &Bill) -> Result<MatchOutcome> {
		let page = self
			.query
			.recent_transactions(&bill.proxy_wallet, SCAN_PAGE_LIMIT)
			.await?;
		Ok(match_any(intent, bill, &page))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use split_types::{BillStatus, IntentStatus, OpType, TcInMsg, TcTxId};
	use uuid::Uuid;

	const PROXY: &str = "0:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
	const SENDER: &str = "0:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

	fn bill() -> Bill {
		Bill {
			id: Uuid::new_v4(),
			goal: 1_000,
			collected: 0,
			creator_address: "0:bb".into(),
			destination_address: "0:dd".into(),
			proxy_wallet: PROXY.into(),
			state_init_hash: "init".into(),
			status: BillStatus::Active,
			created_at: Utc::now(),
			ended_at: None,
			transactions: vec![],
		}
	}

	fn intent(amount: i64) -> Intent {
		Intent {
			id: Uuid::new_v4(),
			bill_id: Uuid::new_v4(),
			amount,
			sender_address: SENDER.into(),
			op_type: OpType::Contribute,
			status: IntentStatus::Pending,
			created_at: Utc::now(),
		}
	}

	fn tx(lt: u64, source: &str, destination: &str, value: &str, bounced: bool) -> TcTransaction {
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

	#[test]
	fn exact_lt_match_succeeds() {
		let page = vec![
			tx(41, "0:ee", PROXY, "999", false),
			tx(42, SENDER, PROXY, "400", false),
		];
		assert_eq!(
			match_by_lt(42, &intent(400), &bill(), &page),
			MatchOutcome::Success { lt: 42, amount: 400 }
		);
	}

	#[test]
	fn overpay_settles_with_onchain_amount() {
		let page = vec![tx(42, SENDER, PROXY, "750", false)];
		assert_eq!(
			match_by_lt(42, &intent(500), &bill(), &page),
			MatchOutcome::Success { lt: 42, amount: 750 }
		);
	}

	#[test]
	fn bounced_transaction_fails_the_intent() {
		let page = vec![tx(42, SENDER, PROXY, "400", true)];
		assert_eq!(
			match_by_lt(42, &intent(400), &bill(), &page),
			MatchOutcome::Bounced { lt: 42 }
		);
	}

	#[test]
	fn bounce_flag_alone_counts_as_bounced() {
		let mut page = vec![tx(42, SENDER, PROXY, "400", false)];
		page[0].in_msg.bounce = true;
		assert_eq!(
			match_by_lt(42, &intent(400), &bill(), &page),
			MatchOutcome::Bounced { lt: 42 }
		);
	}

	#[test]
	fn wrong_sender_is_ignored() {
		let page = vec![tx(42, "0:ee", PROXY, "400", false)];
		assert_eq!(match_by_lt(42, &intent(400), &bill(), &page), MatchOutcome::Ignore);
	}

	#[test]
	fn underpayment_is_ignored() {
		let page = vec![tx(42, SENDER, PROXY, "399", false)];
		assert_eq!(match_by_lt(42, &intent(400), &bill(), &page), MatchOutcome::Ignore);
	}

	#[test]
	fn missing_lt_is_not_found() {
		let page = vec![tx(41, SENDER, PROXY, "400", false)];
		assert_eq!(match_by_lt(42, &intent(400), &bill(), &page), MatchOutcome::NotFound);
	}

	#[test]
	fn sender_addresses_compare_canonically() {
		let page = vec![tx(42, &SENDER.to_uppercase(), &PROXY.to_uppercase(), "400", false)];
		assert_eq!(
			match_by_lt(42, &intent(400), &bill(), &page),
			MatchOutcome::Success { lt: 42, amount: 400 }
		);
	}

	#[test]
	fn scan_skips_non_settling_transactions() {
		let page = vec![
			tx(50, "0:ee", PROXY, "400", false),   // wrong sender
			tx(49, SENDER, "0:ee", "400", false),  // wrong destination
			tx(48, SENDER, PROXY, "400", true),    // bounced
			tx(47, SENDER, PROXY, "399", false),   // underpaid
			tx(46, SENDER, PROXY, "400", false),   // settles
		];
		assert_eq!(
			match_any(&intent(400), &bill(), &page),
			MatchOutcome::Success { lt: 46, amount: 400 }
		);
	}

	#[test]
	fn scan_over_empty_window_is_not_found() {
		assert_eq!(match_any(&intent(400), &bill(), &[]), MatchOutcome::NotFound);
	}

	#[test]
	fn garbage_value_never_settles() {
		let page = vec![tx(42, SENDER, PROXY, "not-a-number", false)];
		assert_eq!(match_any(&intent(400), &bill(), &page), MatchOutcome::NotFound);
	}

	struct FixedPage(Vec<TcTransaction>);

	#[async_trait::async_trait]
	impl ChainQuery for FixedPage {
		async fn recent_transactions(
			&self,
			_address: &str,
			limit: u32,
		) -> Result<Vec<TcTransaction>> {
			assert!(limit == EVENT_PAGE_LIMIT || limit == SCAN_PAGE_LIMIT);
			Ok(self.0.clone())
		}
	}

	#[tokio::test]
	async fn matcher_judges_fetched_page() {
		let matcher = Matcher::new(Arc::new(FixedPage(vec![tx(42, SENDER, PROXY, "400", false)])));
		let (b, i) = (bill(), intent(400));

		assert_eq!(
			matcher.match_event(42, &i, &b).await.unwrap(),
			MatchOutcome::Success { lt: 42, amount: 400 }
		);
		assert_eq!(
			matcher.match_recent(&i, &b).await.unwrap(),
			MatchOutcome::Success { lt: 42, amount: 400 }
		);
	}
}
