//! ANS-104 data items and bundles: binary codec, signature payloads,
//! verification, and bundle assembly/parsing.

use crate::crypto::deep_hash::{deep_hash, DeepHashItem};
use crate::crypto::wallet::{verify_with_owner, Wallet};
use crate::error::{Result, SeedError};
use crate::types::{b64_decode, b64_encode, sha256, Tag, ALLOW_MAX_ITEM_SIZE};
use serde::{Deserialize, Serialize};

/// Signature scheme 1: chain-native RSA-4096 PSS.
const SIG_TYPE_RSA: u16 = 1;
const SIG_LEN: usize = 512;
const OWNER_LEN: usize = 512;

/// A decoded bundle item. `data` is base64url; tags are plain UTF-8
/// (unlike transaction tags, which stay base64url on the wire).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItem {
    pub id: String,
    pub signature_type: u16,
    pub signature: String,
    pub owner: String,
    pub target: String,
    pub anchor: String,
    pub tags: Vec<Tag>,
    pub data: String,
}

impl DataItem {
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

fn take<'a>(buf: &'a [u8], idx: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = idx
        .checked_add(n)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| SeedError::BadRequest("truncated bundle item".to_string()))?;
    let slice = &buf[*idx..end];
    *idx = end;
    Ok(slice)
}

fn read_u64_le(buf: &[u8], idx: &mut usize) -> Result<u64> {
    let raw = take(buf, idx, 8)?;
    Ok(u64::from_le_bytes(raw.try_into().unwrap()))
}

/// Decodes an item binary without checking its signature.
pub fn decode_data_item(binary: &[u8]) -> Result<DataItem> {
    if binary.len() > ALLOW_MAX_ITEM_SIZE {
        return Err(SeedError::ItemTooLarge);
    }
    let mut idx = 0usize;
    let sig_type = u16::from_le_bytes(take(binary, &mut idx, 2)?.try_into().unwrap());
    if sig_type != SIG_TYPE_RSA {
        return Err(SeedError::BadRequest(format!(
            "unsupported signature type {sig_type}"
        )));
    }
    let signature = take(binary, &mut idx, SIG_LEN)?.to_vec();
    let owner = take(binary, &mut idx, OWNER_LEN)?.to_vec();

    let read_optional = |idx: &mut usize| -> Result<Vec<u8>> {
        match take(binary, idx, 1)?[0] {
            0 => Ok(Vec::new()),
            1 => Ok(take(binary, idx, 32)?.to_vec()),
            other => Err(SeedError::BadRequest(format!(
                "invalid presence byte {other}"
            ))),
        }
    };
    let target = read_optional(&mut idx)?;
    let anchor = read_optional(&mut idx)?;

    let tag_count = read_u64_le(binary, &mut idx)?;
    let tags_len = read_u64_le(binary, &mut idx)? as usize;
    let tags_bytes = take(binary, &mut idx, tags_len)?;
    let tags = decode_tags(tags_bytes)?;
    if tags.len() as u64 != tag_count {
        return Err(SeedError::BadRequest(format!(
            "tag count mismatch: header {tag_count}, decoded {}",
            tags.len()
        )));
    }
    let data = &binary[idx..];

    Ok(DataItem {
        id: b64_encode(&sha256(&signature)),
        signature_type: sig_type,
        signature: b64_encode(&signature),
        owner: b64_encode(&owner),
        target: if target.is_empty() {
            String::new()
        } else {
            b64_encode(&target)
        },
        anchor: if anchor.is_empty() {
            String::new()
        } else {
            b64_encode(&anchor)
        },
        tags,
        data: b64_encode(data),
    })
}

/// Decodes an item binary and verifies its signature against the owner
/// key embedded in it.
pub fn verify_data_item(binary: &[u8]) -> Result<DataItem> {
    let item = decode_data_item(binary)?;
    let payload = signing_payload(
        &b64_decode(&item.owner)?,
        &b64_decode(&item.target)?,
        &b64_decode(&item.anchor)?,
        &encode_tags(&item.tags),
        &b64_decode(&item.data)?,
    );
    verify_with_owner(&item.owner, &payload, &b64_decode(&item.signature)?)?;
    Ok(item)
}

fn signing_payload(
    owner: &[u8],
    target: &[u8],
    anchor: &[u8],
    tags_bytes: &[u8],
    data: &[u8],
) -> Vec<u8> {
    deep_hash(&DeepHashItem::List(vec![
        DeepHashItem::text("dataitem"),
        DeepHashItem::text("1"),
        DeepHashItem::text(&SIG_TYPE_RSA.to_string()),
        DeepHashItem::blob(owner),
        DeepHashItem::blob(target),
        DeepHashItem::blob(anchor),
        DeepHashItem::blob(tags_bytes),
        DeepHashItem::blob(data),
    ]))
    .to_vec()
}

/// Builds and signs a fresh item with the given wallet, returning the
/// decoded item together with its wire binary.
pub fn sign_data_item(
    wallet: &Wallet,
    target: &[u8],
    anchor: &[u8],
    tags: Vec<Tag>,
    data: &[u8],
) -> Result<(DataItem, Vec<u8>)> {
    if !target.is_empty() && target.len() != 32 {
        return Err(SeedError::BadRequest("target must be 32 bytes".to_string()));
    }
    if !anchor.is_empty() && anchor.len() != 32 {
        return Err(SeedError::BadRequest("anchor must be 32 bytes".to_string()));
    }

    let owner = b64_decode(&wallet.owner)?;
    let tags_bytes = encode_tags(&tags);
    let signature = wallet.sign(&signing_payload(&owner, target, anchor, &tags_bytes, data))?;

    let mut binary = Vec::with_capacity(2 + SIG_LEN + OWNER_LEN + 70 + tags_bytes.len() + data.len());
    binary.extend_from_slice(&SIG_TYPE_RSA.to_le_bytes());
    binary.extend_from_slice(&signature);
    binary.extend_from_slice(&owner);
    for optional in [target, anchor] {
        if optional.is_empty() {
            binary.push(0);
        } else {
            binary.push(1);
            binary.extend_from_slice(optional);
        }
    }
    binary.extend_from_slice(&(tags.len() as u64).to_le_bytes());
    binary.extend_from_slice(&(tags_bytes.len() as u64).to_le_bytes());
    binary.extend_from_slice(&tags_bytes);
    binary.extend_from_slice(data);

    let item = decode_data_item(&binary)?;
    Ok((item, binary))
}

// Tags travel as an Avro array of {name, value} records: a zigzag block
// count, varint-framed strings, and a zero terminator.

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

fn write_long(out: &mut Vec<u8>, n: i64) {
    write_varint(out, ((n << 1) ^ (n >> 63)) as u64);
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_long(out, data.len() as i64);
    out.extend_from_slice(data);
}

fn read_varint(buf: &[u8], idx: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*idx)
            .ok_or_else(|| SeedError::BadRequest("truncated tag block".to_string()))?;
        *idx += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(SeedError::BadRequest("varint overflow in tags".to_string()));
        }
    }
}

fn read_long(buf: &[u8], idx: &mut usize) -> Result<i64> {
    let raw = read_varint(buf, idx)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

fn read_string(buf: &[u8], idx: &mut usize) -> Result<String> {
    let len = read_long(buf, idx)?;
    if len < 0 {
        return Err(SeedError::BadRequest("negative tag length".to_string()));
    }
    let mut end = *idx;
    let raw = take(buf, &mut end, len as usize)?;
    *idx = end;
    String::from_utf8(raw.to_vec())
        .map_err(|_| SeedError::BadRequest("tag is not valid UTF-8".to_string()))
}

pub fn encode_tags(tags: &[Tag]) -> Vec<u8> {
    if tags.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    write_long(&mut out, tags.len() as i64);
    for tag in tags {
        write_bytes(&mut out, tag.name.as_bytes());
        write_bytes(&mut out, tag.value.as_bytes());
    }
    write_long(&mut out, 0);
    out
}

pub fn decode_tags(buf: &[u8]) -> Result<Vec<Tag>> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let mut tags = Vec::new();
    let mut idx = 0usize;
    loop {
        let mut count = read_long(buf, &mut idx)?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // Negative block counts are followed by a byte size we skip.
            let _block_size = read_long(buf, &mut idx)?;
            count = -count;
        }
        for _ in 0..count {
            let name = read_string(buf, &mut idx)?;
            let value = read_string(buf, &mut idx)?;
            tags.push(Tag { name, value });
        }
    }
    Ok(tags)
}

// A bundle is a 32-byte LE item count, per-item 32-byte LE size +
// 32-byte id entries, then the item binaries back to back.

fn write_u64_as_32le(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 32];
    buf[..8].copy_from_slice(&v.to_le_bytes());
    out.extend_from_slice(&buf);
}

fn read_u64_from_32le(buf: &[u8], idx: &mut usize) -> Result<u64> {
    let raw = take(buf, idx, 32)?;
    if raw[8..].iter().any(|b| *b != 0) {
        return Err(SeedError::BadRequest("bundle length out of range".to_string()));
    }
    Ok(u64::from_le_bytes(raw[..8].try_into().unwrap()))
}

pub fn assemble_bundle(item_binaries: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_u64_as_32le(&mut out, item_binaries.len() as u64);
    for binary in item_binaries {
        if binary.len() < 2 + SIG_LEN {
            return Err(SeedError::BadRequest("item binary too short".to_string()));
        }
        write_u64_as_32le(&mut out, binary.len() as u64);
        out.extend_from_slice(&sha256(&binary[2..2 + SIG_LEN]));
    }
    for binary in item_binaries {
        out.extend_from_slice(binary);
    }
    Ok(out)
}

pub fn parse_bundle(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut idx = 0usize;
    let count = read_u64_from_32le(data, &mut idx)? as usize;
    let mut sizes = Vec::with_capacity(count);
    for _ in 0..count {
        let size = read_u64_from_32le(data, &mut idx)? as usize;
        let _id = take(data, &mut idx, 32)?;
        sizes.push(size);
    }
    let mut items = Vec::with_capacity(count);
    for size in sizes {
        items.push(take(data, &mut idx, size)?.to_vec());
    }
    if idx != data.len() {
        return Err(SeedError::BadRequest("trailing bytes after bundle".to_string()));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::wallet::test_support::TEST_WALLET;

    #[test]
    fn tags_round_trip() {
        let tags = vec![
            Tag {
                name: "Content-Type".to_string(),
                value: "text/plain".to_string(),
            },
            Tag {
                name: "App-Name".to_string(),
                value: "permaseed".to_string(),
            },
        ];
        assert_eq!(decode_tags(&encode_tags(&tags)).unwrap(), tags);
        assert_eq!(decode_tags(&encode_tags(&[])).unwrap(), Vec::new());
    }

    #[test]
    fn item_sign_and_verify() {
        let wallet = TEST_WALLET.clone();
        let tags = vec![Tag {
            name: "Content-Type".to_string(),
            value: "application/json".to_string(),
        }];
        let (item, binary) =
            sign_data_item(&wallet, &[], &[9u8; 32], tags.clone(), b"{\"k\":1}").unwrap();

        assert_eq!(item.owner, wallet.owner);
        assert_eq!(item.tags, tags);
        assert_eq!(
            item.id,
            b64_encode(&sha256(&b64_decode(&item.signature).unwrap()))
        );

        let verified = verify_data_item(&binary).unwrap();
        assert_eq!(verified.id, item.id);

        // Flip a data byte: decode still succeeds, verification must not.
        let mut tampered = binary.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(decode_data_item(&tampered).is_ok());
        assert!(verify_data_item(&tampered).is_err());
    }

    #[test]
    fn bundle_round_trip() {
        let wallet = TEST_WALLET.clone();
        let (_, first) = sign_data_item(&wallet, &[], &[], Vec::new(), b"first").unwrap();
        let (_, second) = sign_data_item(&wallet, &[], &[], Vec::new(), b"second item").unwrap();

        let bundle = assemble_bundle(&[first.clone(), second.clone()]).unwrap();
        let parsed = parse_bundle(&bundle).unwrap();
        assert_eq!(parsed, vec![first, second]);
    }

    #[test]
    fn truncated_item_rejected() {
        let wallet = TEST_WALLET.clone();
        let (_, binary) = sign_data_item(&wallet, &[], &[], Vec::new(), b"x").unwrap();
        assert!(decode_data_item(&binary[..100]).is_err());
        assert!(parse_bundle(&binary[..40]).is_err());
    }
}
