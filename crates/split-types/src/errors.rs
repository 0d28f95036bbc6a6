//! Error types for the split settlement system.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SplitError>;

#[derive(Error, Debug)]
pub enum SplitError {
	/// Bad caller input. Surfaces synchronously as a 400-equivalent.
	#[error("validation error: {0}")]
	Validation(String),

	/// A bill or intent the caller referenced does not exist.
	#[error("not found: {0}")]
	NotFound(String),

	/// Database I/O failure. Watcher-internal occurrences are logged and
	/// retried on the next event or poll tick rather than propagated.
	#[error("persistence error: {0}")]
	Persistence(String),

	/// Websocket transport failure. Consumed by the stream reconnect loop.
	#[error("chain stream error: {0}")]
	ChainStream(String),

	/// REST lookup failure. The watcher logs it and keeps polling.
	#[error("chain query error: {0}")]
	ChainQuery(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl SplitError {
	pub fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub fn not_found(msg: impl Into<String>) -> Self {
		Self::NotFound(msg.into())
	}
}
