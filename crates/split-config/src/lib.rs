//! Configuration loading for the split service.
//!
//! A TOML file provides the base configuration; a handful of secrets can be
//! overridden from the environment so deployments never write them to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_STREAM_URL: &str = "wss://tonapi.io/v2/websocket";
pub const DEFAULT_TONCENTER_URL: &str = "https://toncenter.com/api/v2/getTransactions";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub bind_address: String,
	pub log_level: String,

	// db
	pub db_host: String,
	pub db_port: u16,
	pub db_name: String,
	pub db_user: String,
	pub db_pass: String,

	// chain
	pub smart_contract_hex: String,
	pub ton_api_token: String,
	pub ton_center_api_key: String,
	pub fee_collector_address: String,

	/// Gateway websocket endpoint; overridable for staging and tests.
	pub stream_url: String,
	/// REST `getTransactions` endpoint; overridable for staging and tests.
	pub toncenter_url: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind_address: "0.0.0.0:8081".to_string(),
			log_level: "debug".to_string(),
			db_host: "localhost".to_string(),
			db_port: 5432,
			db_name: "split".to_string(),
			db_user: "split".to_string(),
			db_pass: "split".to_string(),
			smart_contract_hex: String::new(),
			ton_api_token: String::new(),
			ton_center_api_key: String::new(),
			fee_collector_address: String::new(),
			stream_url: DEFAULT_STREAM_URL.to_string(),
			toncenter_url: DEFAULT_TONCENTER_URL.to_string(),
		}
	}
}

impl Config {
	/// Postgres connection string for the configured database.
	pub fn database_url(&self) -> String {
		format!(
			"postgres://{}:{}@{}:{}/{}",
			self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
		)
	}
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
	/// Load configuration from file, then apply environment overrides.
	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
		let path = path.as_ref();
		info!("Loading configuration from {:?}", path);

		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read config file: {:?}", path))?;
		let mut config = Self::from_toml(&contents)?;

		Self::apply_env_overrides(&mut config);
		Self::validate(&config)?;
		Ok(config)
	}

	/// Load from TOML string
	pub fn from_toml(contents: &str) -> Result<Config> {
		toml::from_str(contents).context("Failed to parse TOML")
	}

	fn apply_env_overrides(config: &mut Config) {
		if let Ok(pass) = std::env::var("SPLIT_DB_PASS") {
			debug!("Overriding db password from environment");
			config.db_pass = pass;
		}
		if let Ok(token) = std::env::var("SPLIT_TON_API_TOKEN") {
			debug!("Overriding gateway token from environment");
			config.ton_api_token = token;
		}
		if let Ok(key) = std::env::var("SPLIT_TONCENTER_API_KEY") {
			debug!("Overriding toncenter api key from environment");
			config.ton_center_api_key = key;
		}
	}

	/// Validate configuration
	pub fn validate(config: &Config) -> Result<()> {
		if config.bind_address.trim().is_empty() {
			anyhow::bail!("bind_address must not be empty");
		}
		if config.db_name.trim().is_empty() || config.db_user.trim().is_empty() {
			anyhow::bail!("db_name and db_user must not be empty");
		}
		if config.fee_collector_address.trim().is_empty() {
			anyhow::bail!("fee_collector_address must not be empty");
		}
		if !config.stream_url.starts_with("ws") {
			anyhow::bail!("stream_url must be a ws:// or wss:// endpoint");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_toml_with_defaults_for_missing_fields() {
		let config = ConfigLoader::from_toml(
			r#"
			bind_address = "127.0.0.1:9000"
			db_pass = "secret"
			fee_collector_address = "0:fee"
			"#,
		)
		.unwrap();

		assert_eq!(config.bind_address, "127.0.0.1:9000");
		assert_eq!(config.db_pass, "secret");
		assert_eq!(config.stream_url, DEFAULT_STREAM_URL);
		assert_eq!(config.toncenter_url, DEFAULT_TONCENTER_URL);
	}

	#[test]
	fn database_url_is_assembled() {
		let mut config = Config::default();
		config.db_user = "u".into();
		config.db_pass = "p".into();
		config.db_host = "db".into();
		config.db_port = 5433;
		config.db_name = "bills".into();
		assert_eq!(config.database_url(), "postgres://u:p@db:5433/bills");
	}

	#[test]
	fn validation_rejects_empty_fee_collector() {
		let mut config = Config::default();
		config.fee_collector_address = String::new();
		assert!(ConfigLoader::validate(&config).is_err());

		config.fee_collector_address = "0:fee".into();
		assert!(ConfigLoader::validate(&config).is_ok());
	}

	#[test]
	fn validation_rejects_http_stream_url() {
		let mut config = Config::default();
		config.fee_collector_address = "0:fee".into();
		config.stream_url = "https://example.com".into();
		assert!(ConfigLoader::validate(&config).is_err());
	}
}
