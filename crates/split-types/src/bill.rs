//! Bill and intent domain model.
//!
//! Amounts are indivisible base units of the chain currency (nanoton).
//! A bill collects funds at a derived proxy address until its goal is met,
//! the 10-minute timeout fires, or the creator refunds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::SplitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillStatus {
	#[serde(rename = "ACTIVE")]
	Active,
	#[serde(rename = "DONE")]
	Done,
	#[serde(rename = "TIMEOUT")]
	Timeout,
	#[serde(rename = "REFUNDED")]
	Refunded,
}

impl BillStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			BillStatus::Active => "ACTIVE",
			BillStatus::Done => "DONE",
			BillStatus::Timeout => "TIMEOUT",
			BillStatus::Refunded => "REFUNDED",
		}
	}

	/// A bill leaves ACTIVE at most once.
	pub fn is_terminal(&self) -> bool {
		!matches!(self, BillStatus::Active)
	}
}

impl fmt::Display for BillStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for BillStatus {
	type Err = SplitError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ACTIVE" => Ok(BillStatus::Active),
			"DONE" => Ok(BillStatus::Done),
			"TIMEOUT" => Ok(BillStatus::Timeout),
			"REFUNDED" => Ok(BillStatus::Refunded),
			other => Err(SplitError::Validation(format!(
				"unknown bill status: {other}"
			))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
	#[serde(rename = "PENDING")]
	Pending,
	#[serde(rename = "SUCCESS")]
	Success,
	#[serde(rename = "FAILED")]
	Failed,
}

impl IntentStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			IntentStatus::Pending => "PENDING",
			IntentStatus::Success => "SUCCESS",
			IntentStatus::Failed => "FAILED",
		}
	}
}

impl fmt::Display for IntentStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for IntentStatus {
	type Err = SplitError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(IntentStatus::Pending),
			"SUCCESS" => Ok(IntentStatus::Success),
			"FAILED" => Ok(IntentStatus::Failed),
			other => Err(SplitError::Validation(format!(
				"unknown intent status: {other}"
			))),
		}
	}
}

/// Declared purpose of an intent. REFUND intents are recorded and matched
/// exactly like CONTRIBUTE; no outbound refund is ever submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
	#[serde(rename = "CONTRIBUTE")]
	Contribute,
	#[serde(rename = "TRANSFER")]
	Transfer,
	#[serde(rename = "REFUND")]
	Refund,
}

impl OpType {
	pub fn as_str(&self) -> &'static str {
		match self {
			OpType::Contribute => "CONTRIBUTE",
			OpType::Transfer => "TRANSFER",
			OpType::Refund => "REFUND",
		}
	}

	/// Parse user input, case-insensitively and ignoring surrounding space.
	pub fn parse(s: &str) -> Result<Self, SplitError> {
		match s.trim().to_ascii_uppercase().as_str() {
			"CONTRIBUTE" => Ok(OpType::Contribute),
			"TRANSFER" => Ok(OpType::Transfer),
			"REFUND" => Ok(OpType::Refund),
			_ => Err(SplitError::Validation(
				"invalid op_type: use CONTRIBUTE|TRANSFER|REFUND".to_string(),
			)),
		}
	}
}

impl fmt::Display for OpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OpType {
	type Err = SplitError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

/// A collection target. `collected` is monotonically non-decreasing while
/// ACTIVE and records on-chain amounts, which may exceed the sum of the
/// declared intent amounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
	pub id: Uuid,
	pub goal: i64,
	pub collected: i64,
	pub creator_address: String,
	pub destination_address: String,
	pub proxy_wallet: String,
	pub state_init_hash: String,
	pub status: BillStatus,
	pub created_at: DateTime<Utc>,
	pub ended_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub transactions: Vec<Intent>,
}

impl Bill {
	pub fn goal_met(&self) -> bool {
		self.collected >= self.goal
	}
}

/// A declared off-chain commitment to send funds to a bill's proxy address.
/// PENDING is the only state transitions occur from; SUCCESS and FAILED are
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
	pub id: Uuid,
	pub bill_id: Uuid,
	pub amount: i64,
	pub sender_address: String,
	pub op_type: OpType,
	pub status: IntentStatus,
	pub created_at: DateTime<Utc>,
}

/// One row of a sender's settlement history: a bill they contributed to and
/// the summed SUCCESS amounts they declared toward it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
	pub id: Uuid,
	pub amount: i64,
	pub destination_address: String,
	pub status: BillStatus,
	pub created_at: DateTime<Utc>,
}
