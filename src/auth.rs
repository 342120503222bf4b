// SPDX-License-Identifier: MIT
//! Credentials handling: JWT/seed files and nonce signatures.
//!
//! A credentials file is PEM-style multi-block text. A header line has three
//! or more consecutive `-` on both sides; the value of a block is the first
//! non-blank line between two headers. Block one carries the user JWT, block
//! two the NKey seed:
//!
//! ```text
//! -----BEGIN NATS USER JWT-----
//! eyJ0eXAiOiJqd3QiLCJhbGciOiJlZDI1NTE5In0...
//! ------END NATS USER JWT------
//!
//! -----BEGIN USER NKEY SEED-----
//! SUACSSL3UAHUDXKFSNVUZRF5UHPMWZ6BFDTJ7M6USDXIEDNPPQYYYCU3VY
//! ------END USER NKEY SEED------
//! ```
//!
//! Authentication signs the server's `nonce` with the ed25519 key decoded
//! from the seed; the signature travels base64 URL-safe without padding in
//! the CONNECT `sig` field.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer as _, SigningKey};

use crate::errors::{Error, Result};

/// RFC 4648 base32 alphabet used by seed encoding (no padding).
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

// ─── Credentials file ────────────────────────────────────────────────────────

/// Extracts the user JWT (block one) from a credentials file.
pub(crate) fn jwt_from_file(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)?;
    block_value(&content, 0).ok_or_else(|| Error::AuthFailed("credentials file has no JWT".into()))
}

/// Extracts the NKey seed (block two) and signs `nonce` with it.
pub(crate) fn sign_nonce_with_seed_file(path: &Path, nonce: &[u8]) -> Result<Vec<u8>> {
    let content = fs::read_to_string(path)?;
    let seed = block_value(&content, 1)
        .ok_or_else(|| Error::AuthFailed("credentials file has no NKey seed".into()))?;
    sign_nonce(&seed, nonce)
}

/// Returns the value of the `item`-th block (0-based), i.e. the first
/// non-blank line after its opening header.
fn block_value(content: &str, item: usize) -> Option<String> {
    let mut headers_seen = 0usize;
    let mut in_wanted_block = false;
    for line in content.lines() {
        if is_header_line(line) {
            if in_wanted_block {
                // Hit the closing header without a value line.
                return None;
            }
            // Opening headers are the even-numbered ones.
            if headers_seen % 2 == 0 && headers_seen / 2 == item {
                in_wanted_block = true;
            }
            headers_seen += 1;
            continue;
        }
        if in_wanted_block && !line.trim().is_empty() {
            return Some(line.trim().to_string());
        }
    }
    None
}

/// A header line has at least three consecutive `-` at both ends.
fn is_header_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("---") && trimmed.ends_with("---") && trimmed.len() >= 6
}

// ─── Seed decoding & signing ─────────────────────────────────────────────────

/// Signs `nonce` with the ed25519 key carried in a user seed (`SU...`).
pub(crate) fn sign_nonce(seed: &str, nonce: &[u8]) -> Result<Vec<u8>> {
    let key = decode_seed(seed)?;
    Ok(key.sign(nonce).to_bytes().to_vec())
}

/// Decodes a user seed: base32 without padding, two prefix bytes, a 32-byte
/// ed25519 seed, and a trailing CRC-16 over everything before it.
fn decode_seed(seed: &str) -> Result<SigningKey> {
    let seed = seed.trim();
    if !seed.starts_with("SU") {
        return Err(Error::AuthFailed("not a user seed".into()));
    }
    let raw = base32_decode(seed.as_bytes())
        .ok_or_else(|| Error::AuthFailed("seed is not valid base32".into()))?;
    // 2 prefix bytes + 32 key bytes + 2 CRC bytes.
    if raw.len() != 36 {
        return Err(Error::AuthFailed("seed has unexpected length".into()));
    }
    let (body, crc_bytes) = raw.split_at(raw.len() - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if crc16(body) != expected {
        return Err(Error::AuthFailed("seed checksum mismatch".into()));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&body[2..34]);
    Ok(SigningKey::from_bytes(&key_bytes))
}

/// Encodes a signature (or any byte string) base64 URL-safe without padding,
/// the form the CONNECT `sig` field requires.
pub(crate) fn base64_raw_url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn base32_decode(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &c in input {
        let val = BASE32_ALPHABET.iter().position(|&a| a == c)? as u32;
        acc = (acc << 5) | val;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

/// CRC-16/XMODEM (poly 0x1021, init 0), the checksum seeds carry.
fn crc16(data: &[u8]) -> u16 {
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
