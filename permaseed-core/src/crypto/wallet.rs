//! RSA-PSS wallet loaded from a chain JWK keyfile. Signs transactions
//! and bundle items; verifies third-party item signatures by owner key.

use crate::error::{Result, SeedError};
use crate::types::{b64_decode, b64_encode, sha256};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use std::path::Path;

const RSA_EXPONENT: u64 = 65537;

#[derive(Deserialize)]
struct Jwk {
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
}

pub struct Wallet {
    signing_key: SigningKey<Sha256>,
    /// base64url modulus, the `owner` field of anything this wallet signs.
    pub owner: String,
    /// base64url SHA-256 of the modulus bytes.
    pub address: String,
}

impl Wallet {
    pub fn from_jwk_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| SeedError::Config(format!("read keyfile {}: {e}", path.display())))?;
        let jwk: Jwk = serde_json::from_slice(&raw)
            .map_err(|e| SeedError::Config(format!("decode keyfile: {e}")))?;

        let to_uint = |field: &str, value: &str| -> Result<BigUint> {
            let bytes = b64_decode(value)
                .map_err(|_| SeedError::Config(format!("keyfile field {field} is not base64url")))?;
            Ok(BigUint::from_bytes_be(&bytes))
        };

        let key = RsaPrivateKey::from_components(
            to_uint("n", &jwk.n)?,
            to_uint("e", &jwk.e)?,
            to_uint("d", &jwk.d)?,
            vec![to_uint("p", &jwk.p)?, to_uint("q", &jwk.q)?],
        )
        .map_err(|e| SeedError::Config(format!("invalid keyfile: {e}")))?;

        Ok(Self::from_key(key))
    }

    pub fn from_key(key: RsaPrivateKey) -> Self {
        let modulus = key.to_public_key().n().to_bytes_be();
        let owner = b64_encode(&modulus);
        let address = b64_encode(&sha256(&modulus));
        Self {
            signing_key: SigningKey::new(key),
            owner,
            address,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .signing_key
            .sign_with_rng(&mut rand::thread_rng(), message);
        Ok(signature.to_vec())
    }
}

/// Verifies an RSA-PSS signature against a base64url owner modulus.
pub fn verify_with_owner(owner: &str, message: &[u8], signature: &[u8]) -> Result<()> {
    let modulus = b64_decode(owner)?;
    let public_key = RsaPublicKey::new(
        BigUint::from_bytes_be(&modulus),
        BigUint::from(RSA_EXPONENT),
    )
    .map_err(|e| SeedError::BadRequest(format!("invalid owner key: {e}")))?;
    let verifying_key: VerifyingKey<Sha256> = VerifyingKey::new(public_key);
    let signature = Signature::try_from(signature)
        .map_err(|e| SeedError::BadRequest(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| SeedError::BadRequest("signature verification failed".to_string()))
}
