//! Chain-facing wire types and the seams the core consumes them through.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;

use crate::errors::Result;

/// One `account_transaction` notification from the gateway stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
	#[serde(rename = "account_id")]
	pub account: String,
	pub tx_hash: String,
	#[serde(deserialize_with = "lt_from_string_or_number")]
	pub lt: u64,
}

/// The gateway encodes logical time either as a JSON number or a decimal
/// string; accept both.
fn lt_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Number(u64),
		Text(String),
	}

	match Raw::deserialize(deserializer)? {
		Raw::Number(n) => Ok(n),
		Raw::Text(s) => s.parse::<u64>().map_err(serde::de::Error::custom),
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcMsgData {
	#[serde(rename = "@type", default)]
	pub msg_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcInMsg {
	#[serde(default)]
	pub source: String,
	#[serde(default)]
	pub destination: String,
	/// Decimal string in indivisible base units.
	#[serde(default)]
	pub value: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default)]
	pub msg_data: TcMsgData,
	#[serde(default)]
	pub bounce: bool,
	#[serde(default)]
	pub bounced: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcTxId {
	#[serde(default)]
	pub lt: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to_lt: Option<String>,
	#[serde(default)]
	pub hash: String,
}

/// One transaction from the REST `getTransactions` page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcTransaction {
	pub transaction_id: TcTxId,
	pub in_msg: TcInMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcPrev {
	pub lt: String,
	pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcGetTxResponse {
	pub ok: bool,
	#[serde(default)]
	pub result: Vec<TcTransaction>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub previous_transaction: Option<TcPrev>,
}

/// Result of the opaque proxy-address derivation for a bill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
	pub address: String,
	pub state_init_hash: String,
}

/// REST lookup of recent transactions for an address.
#[async_trait]
pub trait ChainQuery: Send + Sync {
	async fn recent_transactions(&self, address: &str, limit: u32) -> Result<Vec<TcTransaction>>;
}

/// Cancels a stream listener registration. Cancellation is idempotent and
/// also runs on drop, so every watcher exit path releases its slot.
pub struct ListenerHandle {
	cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
	pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
		Self {
			cancel: Some(Box::new(cancel)),
		}
	}

	pub fn cancel(&mut self) {
		if let Some(f) = self.cancel.take() {
			f();
		}
	}
}

impl Drop for ListenerHandle {
	fn drop(&mut self) {
		self.cancel();
	}
}

/// Shared subscription stream of per-address transaction notifications.
#[async_trait]
pub trait AccountStream: Send + Sync {
	/// Register a buffered listener channel for an address. The channel
	/// closes when the stream shuts down; reconnects replay subscriptions
	/// without touching listeners.
	fn register_listener(&self, address: &str) -> (mpsc::Receiver<ChainEvent>, ListenerHandle);

	/// Ask the gateway for notifications on the given addresses. Idempotent;
	/// already-subscribed addresses produce no outbound frame.
	async fn subscribe(&self, addresses: &[String]) -> Result<()>;
}
