//! ChaCha20-Poly1305 AEAD (RFC 8439 2.8).

use super::chacha20::{keystream_block, xor_keystream};
use super::poly1305::{ct_eq, Poly1305};
use crate::error::CryptoError;

fn pad16(len: usize) -> usize {
    (16 - (len % 16)) % 16
}

fn poly_key(key: &[u8; 32], nonce: &[u8; 12]) -> [u8; 32] {
    let block0 = keystream_block(key, 0, nonce);
    let mut k = [0u8; 32];
    k.copy_from_slice(&block0[..32]);
    k
}

pub fn seal(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> (Vec<u8>, [u8; 16]) {
    let mut ciphertext = plaintext.to_vec();
    xor_keystream(key, 1, nonce, &mut ciphertext);

    let otk = poly_key(key, nonce);
    let mut mac = Poly1305::new(&otk);
    mac.update(aad);
    mac.update(&vec![0u8; pad16(aad.len())]);
    mac.update(&ciphertext);
    mac.update(&vec![0u8; pad16(ciphertext.len())]);
    mac.update(&(aad.len() as u64).to_le_bytes());
    mac.update(&(ciphertext.len() as u64).to_le_bytes());
    let tag = mac.finalize();

    (ciphertext, tag)
}

pub fn open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; 16],
) -> Result<Vec<u8>, CryptoError> {
    let otk = poly_key(key, nonce);
    let mut mac = Poly1305::new(&otk);
    mac.update(aad);
    mac.update(&vec![0u8; pad16(aad.len())]);
    mac.update(ciphertext);
    mac.update(&vec![0u8; pad16(ciphertext.len())]);
    mac.update(&(aad.len() as u64).to_le_bytes());
    mac.update(&(ciphertext.len() as u64).to_le_bytes());
    let computed = mac.finalize();

    if !ct_eq(&computed, tag) {
        return Err(CryptoError::TagMismatch);
    }

    let mut plaintext = ciphertext.to_vec();
    xor_keystream(key, 1, nonce, &mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_key_nonce_round_trip() {
        let key = [0u8; 32];
        let nonce = [0u8; 12];
        for n in 0..32 {
            let pt: Vec<u8> = (0..n as u8).collect();
            let (ct, tag) = seal(&key, &nonce, b"", &pt);
            let opened = open(&key, &nonce, b"", &ct, &tag).unwrap();
            assert_eq!(opened, pt);
        }
    }

    #[test]
    fn tag_mismatch_rejected() {
        let key = [0u8; 32];
        let nonce = [0u8; 12];
        let (ct, mut tag) = seal(&key, &nonce, b"aad", b"hello");
        tag[0] ^= 1;
        assert!(open(&key, &nonce, b"aad", &ct, &tag).is_err());
    }

    #[test]
    fn rfc8439_section_2_8_2_vector() {
        let key: [u8; 32] = {
            let mut k = [0u8; 32];
            let bytes = hex::decode(
                "808182838485868788898a8b8c8d8e8f909192939495969798999a9b9c9d9e9f",
            )
            .unwrap();
            k.copy_from_slice(&bytes[..32]);
            k
        };
        let nonce: [u8; 12] = {
            let mut n = [0u8; 12];
            let bytes = hex::decode("070000004041424344454647").unwrap();
            n.copy_from_slice(&bytes);
            n
        };
        let aad = hex::decode("50515253c0c1c2c3c4c5c6c7").unwrap();
        let plaintext = b"Ladies and Gentlemen of the class of '99: If I could offer you only one tip for the future, sunscreen would be it.";

        let (ct, tag) = seal(&key, &nonce, &aad, plaintext);
        assert_eq!(
            hex::encode(&ct),
            "d31a8d34648e60db7b86afbc53ef7ec2a4aded51296e08fea9e2b5a736ee62d63dbea45e8ca9671282fafb69da92728b1a71de0a9e060b2905d6a5b67ecd3b3692ddbd7f2d778b8c9803aee328091b58fab324e4fad675945585808b4831d7bc3ff4def08e4b7a9de576d26586cec64b6116"
        );
        assert_eq!(hex::encode(tag), "1ae10b594f09e26a7e902ecbd0600691");
    }
}
