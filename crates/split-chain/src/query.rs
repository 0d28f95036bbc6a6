//! REST lookup of recent transactions for an address.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use split_types::{ChainQuery, Result, SplitError, TcGetTxResponse, TcTransaction};

const REQUEST_DEADLINE: Duration = Duration::from_secs(7);
const DEFAULT_PAGE_LIMIT: u32 = 20;

pub struct TonCenterClient {
	http: reqwest::Client,
	base_url: String,
	api_key: String,
}

impl TonCenterClient {
	pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(REQUEST_DEADLINE)
			.build()
			.map_err(|e| SplitError::ChainQuery(e.to_string()))?;
		Ok(Self {
			http,
			base_url: base_url.into(),
			api_key: api_key.into(),
		})
	}
}

#[async_trait]
impl ChainQuery for TonCenterClient {
	async fn recent_transactions(&self, address: &str, limit: u32) -> Result<Vec<TcTransaction>> {
		let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit };
		let started = Instant::now();

		let mut request = self
			.http
			.get(&self.base_url)
			.query(&[("address", address), ("limit", &limit.to_string())])
			.header(ACCEPT, "application/json");
		if !self.api_key.trim().is_empty() {
			request = request.header("X-API-Key", self.api_key.trim());
		}

		let response = request.send().await.map_err(|e| {
			warn!(address, limit, error = %e, "getTransactions request failed");
			SplitError::ChainQuery(e.to_string())
		})?;
		let status = response.status();

		let body: TcGetTxResponse = response.json().await.map_err(|e| {
			warn!(address, limit, %status, error = %e, "getTransactions decode failed");
			SplitError::ChainQuery(e.to_string())
		})?;

		debug!(
			address,
			limit,
			%status,
			ok = body.ok,
			ms = started.elapsed().as_millis() as u64,
			"getTransactions"
		);

		if !body.ok {
			return Err(SplitError::ChainQuery(
				"getTransactions returned ok=false".to_string(),
			));
		}
		Ok(body.result)
	}
}
