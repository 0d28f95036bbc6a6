//! Address canonicalisation.
//!
//! All comparisons in the system use the canonical raw form
//! `workchain:hexhash`, lowercase. User-facing ("friendly") addresses are
//! 36 bytes base64: tag, workchain, 32-byte account hash and a CRC-16/XMODEM
//! checksum. Friendly and raw representations of the same account must
//! canonicalise identically; anything unparseable falls back to trimmed
//! lowercase so equality stays at least as strict as string equality.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

const TAG_BOUNCEABLE: u8 = 0x11;
const TAG_NON_BOUNCEABLE: u8 = 0x51;
const TAG_TESTNET_FLAG: u8 = 0x80;

/// Canonical lowercase raw form of an address.
pub fn canonical(addr: &str) -> String {
	let addr = addr.trim();
	if addr.is_empty() {
		return String::new();
	}
	if addr.contains(':') {
		return addr.to_ascii_lowercase();
	}
	match parse_friendly(addr) {
		Some(raw) => raw,
		None => addr.to_ascii_lowercase(),
	}
}

/// Address equality under canonicalisation.
pub fn addr_eq(a: &str, b: &str) -> bool {
	canonical(a) == canonical(b)
}

fn parse_friendly(addr: &str) -> Option<String> {
	let bytes = URL_SAFE_NO_PAD
		.decode(addr)
		.or_else(|_| STANDARD_NO_PAD.decode(addr))
		.ok()?;
	if bytes.len() != 36 {
		return None;
	}

	let tag = bytes[0] & !TAG_TESTNET_FLAG;
	if tag != TAG_BOUNCEABLE && tag != TAG_NON_BOUNCEABLE {
		return None;
	}

	let crc = u16::from_be_bytes([bytes[34], bytes[35]]);
	if crc != crc16_xmodem(&bytes[..34]) {
		return None;
	}

	let workchain = bytes[1] as i8;
	let mut out = String::with_capacity(2 + 64);
	out.push_str(&workchain.to_string());
	out.push(':');
	for b in &bytes[2..34] {
		out.push_str(&format!("{b:02x}"));
	}
	Some(out)
}

fn crc16_xmodem(data: &[u8]) -> u16 {
	let mut crc: u16 = 0;
	for &b in data {
		crc ^= (b as u16) << 8;
		for _ in 0..8 {
			if crc & 0x8000 != 0 {
				crc = (crc << 1) ^ 0x1021;
			} else {
				crc <<= 1;
			}
		}
	}
	crc
}
