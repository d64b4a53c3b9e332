//! Byte-exact key encoding for the data and commit columns.
//!
//! Data keys are `b'd' ++ be_u64(llsn)`, commit keys are `b'c' ++ be_u64(glsn)`
//! and a commit value is the data key it points to. The sentinel prefixes are
//! the exclusive upper bounds of full-column scans. The commit-context key
//! sorts below both columns so a combined store never mixes it into a scan.

use crate::types::{Glsn, Llsn};

pub const DATA_KEY_PREFIX: u8 = b'd';
pub const DATA_KEY_SENTINEL_PREFIX: u8 = b'e';
pub const COMMIT_KEY_PREFIX: u8 = b'c';
pub const COMMIT_KEY_SENTINEL_PREFIX: u8 = b'd';
pub const COMMIT_CONTEXT_KEY: &[u8] = b"_commit_context";

pub const DATA_KEY_LEN: usize = 9;
pub const COMMIT_KEY_LEN: usize = 9;

pub type DataKey = [u8; DATA_KEY_LEN];
pub type CommitKey = [u8; COMMIT_KEY_LEN];

pub fn encode_data_key(llsn: Llsn) -> DataKey {
    encode_key(DATA_KEY_PREFIX, llsn.get())
}

/// Panics when `key` is not a data key; a mismatch means the columns were
/// corrupted or the caller read the wrong column.
pub fn decode_data_key(key: &[u8]) -> Llsn {
    Llsn::new(decode_key(DATA_KEY_PREFIX, key, "data"))
}

pub fn encode_commit_key(glsn: Glsn) -> CommitKey {
    encode_key(COMMIT_KEY_PREFIX, glsn.get())
}

/// Panics when `key` is not a commit key.
pub fn decode_commit_key(key: &[u8]) -> Glsn {
    Glsn::new(decode_key(COMMIT_KEY_PREFIX, key, "commit"))
}

pub fn data_key_lower_bound() -> Vec<u8> {
    vec![DATA_KEY_PREFIX]
}

pub fn data_key_upper_bound() -> Vec<u8> {
    vec![DATA_KEY_SENTINEL_PREFIX]
}

pub fn commit_key_lower_bound() -> Vec<u8> {
    vec![COMMIT_KEY_PREFIX]
}

pub fn commit_key_upper_bound() -> Vec<u8> {
    vec![COMMIT_KEY_SENTINEL_PREFIX]
}

fn encode_key(prefix: u8, value: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix;
    key[1..].copy_from_slice(&value.to_be_bytes());
    key
}

fn decode_key(prefix: u8, key: &[u8], kind: &str) -> u64 {
    if key.len() != 9 || key[0] != prefix {
        panic!(
            "storage: invalid {kind} key (len={} prefix={:?})",
            key.len(),
            key.first().copied().map(char::from)
        );
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[1..]);
    u64::from_be_bytes(raw)
}
