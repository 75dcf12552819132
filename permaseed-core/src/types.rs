use crate::error::{Result, SeedError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Largest chunk of transaction data accepted on the wire.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Chunks below this size get rebalanced into the previous chunk.
pub const MIN_CHUNK_SIZE: usize = 32 * 1024;

/// Single-shot data reads above this must go through chunked retrieval.
pub const MAX_SINGLE_SHOT_SIZE: u64 = 50 * 128 * 1024;

/// Hard cap on a submitted bundle item.
pub const ALLOW_MAX_ITEM_SIZE: usize = 100 * 1024 * 1024;

/// Name/value pair attached to a transaction. On the transaction wire
/// format both halves are base64url; decoded bundle items carry plain
/// UTF-8 tags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

/// Transaction metadata as exchanged with the chain gateway. The data
/// payload itself is never persisted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxMeta {
    #[serde(default)]
    pub format: i32,
    pub id: String,
    pub last_tx: String,
    pub owner: String,
    pub tags: Vec<Tag>,
    pub target: String,
    pub quantity: String,
    #[serde(default)]
    pub data: String,
    pub data_root: String,
    pub data_size: String,
    pub reward: String,
    pub signature: String,
}

impl TxMeta {
    pub fn data_size_bytes(&self) -> Result<u64> {
        self.data_size
            .parse::<u64>()
            .map_err(|_| SeedError::BadRequest(format!("invalid data_size: {}", self.data_size)))
    }

    /// Looks up a tag by its decoded name; tx tags are base64url on the
    /// wire, so both halves get decoded here.
    pub fn decoded_tag(&self, name: &str) -> Option<String> {
        for tag in &self.tags {
            let Ok(tag_name) = b64_decode(&tag.name) else {
                continue;
            };
            if tag_name == name.as_bytes() {
                let value = b64_decode(&tag.value).ok()?;
                return String::from_utf8(value).ok();
            }
        }
        None
    }
}

/// One ≤256 KiB piece of a transaction's data payload, carrying its
/// Merkle proof.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub data_root: String,
    pub data_size: String,
    pub data_path: String,
    pub offset: String,
    pub chunk: String,
}

/// Response payload for `GET /tx/{id}/offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOffset {
    pub size: String,
    pub offset: String,
}

/// Network fee in winston: a flat base plus a per-chunk increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArFee {
    pub base: u64,
    pub per_chunk: u64,
}

impl ArFee {
    pub fn price(&self, data_size: u64) -> u64 {
        self.base + chunk_count(data_size) * self.per_chunk
    }
}

pub fn chunk_count(data_size: u64) -> u64 {
    if data_size == 0 {
        0
    } else {
        (data_size - 1) / MAX_CHUNK_SIZE as u64 + 1
    }
}

pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| SeedError::BadRequest(format!("invalid base64url: {e}")))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A well-formed arId is the base64url form of a 32-byte identifier.
pub fn is_ar_id(s: &str) -> bool {
    matches!(b64_decode(s), Ok(raw) if raw.len() == 32)
}

/// Offsets serialize as 8-byte big-endian so lexicographic key order
/// matches numeric order.
pub fn offset_to_key(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

pub fn offset_from_key(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| SeedError::Internal(format!("bad offset encoding, len {}", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Key of the end-offset index: SHA-256 over the textual
/// `data_root ‖ data_size`.
pub fn end_offset_key(data_root: &str, data_size: &str) -> [u8; 32] {
    sha256(format!("{data_root}{data_size}").as_bytes())
}
