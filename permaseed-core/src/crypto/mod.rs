pub mod deep_hash;
pub mod merkle;
pub mod wallet;

pub use deep_hash::{deep_hash, DeepHashItem};
pub use wallet::Wallet;
