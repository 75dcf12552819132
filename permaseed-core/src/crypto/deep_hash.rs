//! Deep-hash: the chain's canonical digest over nested byte structures,
//! used as the signing payload for transactions and bundle items.

use sha2::{Digest, Sha384};

#[derive(Debug, Clone)]
pub enum DeepHashItem {
    Blob(Vec<u8>),
    List(Vec<DeepHashItem>),
}

impl DeepHashItem {
    pub fn blob(data: &[u8]) -> Self {
        DeepHashItem::Blob(data.to_vec())
    }

    pub fn text(s: &str) -> Self {
        DeepHashItem::Blob(s.as_bytes().to_vec())
    }
}

fn sha384(data: &[u8]) -> [u8; 48] {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn sha384_pair(a: &[u8], b: &[u8]) -> [u8; 48] {
    let mut hasher = Sha384::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// A blob hashes as H(H("blob{len}") ‖ H(data)); a list folds
/// H("list{len}") over its elements' deep hashes.
pub fn deep_hash(item: &DeepHashItem) -> [u8; 48] {
    match item {
        DeepHashItem::Blob(data) => {
            let tag = format!("blob{}", data.len());
            sha384_pair(&sha384(tag.as_bytes()), &sha384(data))
        }
        DeepHashItem::List(items) => {
            let tag = format!("list{}", items.len());
            let mut acc = sha384(tag.as_bytes());
            for child in items {
                acc = sha384_pair(&acc, &deep_hash(child));
            }
            acc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let item = DeepHashItem::List(vec![
            DeepHashItem::text("dataitem"),
            DeepHashItem::blob(&[1, 2, 3]),
        ]);
        assert_eq!(deep_hash(&item), deep_hash(&item));
    }

    #[test]
    fn blob_and_singleton_list_differ() {
        let blob = DeepHashItem::blob(b"payload");
        let list = DeepHashItem::List(vec![DeepHashItem::blob(b"payload")]);
        assert_ne!(deep_hash(&blob), deep_hash(&list));
    }

    #[test]
    fn length_is_part_of_the_tag() {
        // Same concatenated bytes, different element boundaries.
        let a = DeepHashItem::List(vec![DeepHashItem::blob(b"ab"), DeepHashItem::blob(b"c")]);
        let b = DeepHashItem::List(vec![DeepHashItem::blob(b"a"), DeepHashItem::blob(b"bc")]);
        assert_ne!(deep_hash(&a), deep_hash(&b));
    }
}
