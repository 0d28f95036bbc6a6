//! Deterministic proxy-address derivation for a bill.
//!
//! The proxy address commits to the contract code blob, the destination,
//! creator and fee-collector addresses, and the goal amount; equal inputs
//! always derive the same workchain-0 raw address. The state-init blob is
//! opaque to the rest of the system and only travels back to the client.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use split_types::address::canonical;
use split_types::{ProxyInfo, Result, SplitError};

pub fn derive_proxy(
	code_hex: &str,
	destination: &str,
	creator: &str,
	fee_collector: &str,
	goal: i64,
) -> Result<ProxyInfo> {
	let code = decode_hex(code_hex)?;

	let mut hasher = Sha256::new();
	hasher.update(&code);
	for part in [
		canonical(destination),
		canonical(creator),
		canonical(fee_collector),
	] {
		hasher.update(part.as_bytes());
		hasher.update([0u8]);
	}
	hasher.update(goal.to_be_bytes());
	let account = hasher.finalize();

	let mut address = String::with_capacity(2 + 64);
	address.push_str("0:");
	for b in account.iter() {
		address.push_str(&format!("{b:02x}"));
	}

	let mut init = Vec::with_capacity(code.len() + account.len());
	init.extend_from_slice(&code);
	init.extend_from_slice(&account);

	Ok(ProxyInfo {
		address,
		state_init_hash: STANDARD.encode(&init),
	})
}

fn decode_hex(code_hex: &str) -> Result<Vec<u8>> {
	let trimmed = code_hex.trim();
	let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
	if trimmed.is_empty() {
		return Err(SplitError::Config(
			"smart contract code blob is empty".to_string(),
		));
	}
	if trimmed.len() % 2 != 0 {
		return Err(SplitError::Config(
			"smart contract code blob has odd hex length".to_string(),
		));
	}

	(0..trimmed.len())
		.step_by(2)
		.map(|i| {
			u8::from_str_radix(&trimmed[i..i + 2], 16).map_err(|_| {
				SplitError::Config("smart contract code blob is not valid hex".to_string())
			})
		})
		.collect()
}
