//! Known-answer self-tests run once before the first TLS handshake. If any
//! vector fails, the daemon refuses to attempt TLS for the remainder of the
//! process's life (the handshake path will not trust crypto it hasn't
//! verified).

use std::sync::OnceLock;

use super::aead_aes128gcm;
use super::aead_chacha20poly1305;
use super::hkdf;
use super::sha256::sha256;
use super::x25519;

static SELFTEST_RESULT: OnceLock<bool> = OnceLock::new();

fn sha256_kat() -> bool {
    hex::encode(sha256(&[])) == "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
}

fn hkdf_kat() -> bool {
    // RFC 5869 Test Case 1.
    let ikm = [0x0bu8; 22];
    let salt: [u8; 13] = {
        let mut s = [0u8; 13];
        s.copy_from_slice(&hex::decode("000102030405060708090a0b0c").unwrap());
        s
    };
    let info: [u8; 10] = {
        let mut i = [0u8; 10];
        i.copy_from_slice(&hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap());
        i
    };
    let prk = hkdf::extract(&salt, &ikm);
    if hex::encode(prk) != "077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5" {
        return false;
    }
    let okm = hkdf::expand(&prk, &info, 42);
    hex::encode(&okm)
        == "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
}

fn x25519_kat() -> bool {
    let alice_priv: [u8; 32] = {
        let mut k = [0u8; 32];
        k.copy_from_slice(
            &hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2")
                .unwrap(),
        );
        k
    };
    let pubkey = x25519::x25519_public_key(&alice_priv);
    hex::encode(pubkey) == "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
}

fn aes128gcm_kat() -> bool {
    let key = [0u8; 16];
    let nonce = [0u8; 12];
    let pt = [0u8; 16];
    let (ct, tag) = aead_aes128gcm::seal(&key, &nonce, &[], &pt);
    hex::encode(&ct) == "0388dace60b6a392f328c2b971b2fe78"
        && hex::encode(tag) == "ab6e47d42cec13bdf53a67b21257bddf"
}

fn chacha20poly1305_kat() -> bool {
    let key = [0u8; 32];
    let nonce = [0u8; 12];
    let (ct, tag) = aead_chacha20poly1305::seal(&key, &nonce, &[], &[0u8; 16]);
    let opened = aead_chacha20poly1305::open(&key, &nonce, &[], &ct, &tag);
    opened.is_ok()
}

/// Runs (and memoizes) the full known-answer-test suite. Returns `true` iff
/// every primitive matches its reference vector.
pub fn run() -> bool {
    *SELFTEST_RESULT.get_or_init(|| {
        sha256_kat() && hkdf_kat() && x25519_kat() && aes128gcm_kat() && chacha20poly1305_kat()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selftest_passes() {
        assert!(run());
    }
}
