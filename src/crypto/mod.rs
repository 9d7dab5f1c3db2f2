//! Cryptographic primitives, hand-rolled to exact RFC/FIPS reference
//! behavior rather than pulled from a vetted crate: this daemon is the one
//! place in the stack where that tradeoff is deliberate (see `DESIGN.md`).

pub mod aead_aes128gcm;
pub mod aead_chacha20poly1305;
pub mod aes128;
pub mod chacha20;
pub mod ghash;
pub mod hkdf;
pub mod hmac;
pub mod poly1305;
pub mod rand;
pub mod selftest;
pub mod sha256;
pub mod x25519;

pub use aes128::Aes128;
pub use hmac::hmac_sha256;
pub use rand::Rand;
pub use sha256::{sha256, Sha256};
