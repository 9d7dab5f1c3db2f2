//! AES-128-GCM (SP 800-38D) built from the AES-128 block cipher and GHASH.

use super::aes128::Aes128;
use super::ghash::ghash;
use super::poly1305::ct_eq;
use crate::error::CryptoError;

fn inc32(block: &mut [u8; 16]) {
    let counter = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);
    let next = counter.wrapping_add(1);
    block[12..16].copy_from_slice(&next.to_be_bytes());
}

fn j0(nonce: &[u8; 12]) -> [u8; 16] {
    let mut j = [0u8; 16];
    j[..12].copy_from_slice(nonce);
    j[15] = 1;
    j
}

fn gctr(aes: &Aes128, mut counter_block: [u8; 16], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(16) {
        let ks = aes.encrypt_block(&counter_block);
        for (i, b) in chunk.iter().enumerate() {
            out.push(b ^ ks[i]);
        }
        inc32(&mut counter_block);
    }
    out
}

pub fn seal(
    key: &[u8; 16],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; 16]) {
    let aes = Aes128::new(key);
    let h = aes.encrypt_block(&[0u8; 16]);

    let j0_block = j0(nonce);
    let mut counter0 = j0_block;
    inc32(&mut counter0);

    let ciphertext = gctr(&aes, counter0, plaintext);
    let s = ghash(h, aad, &ciphertext);
    let e_j0 = aes.encrypt_block(&j0_block);

    let mut tag = [0u8; 16];
    for i in 0..16 {
        tag[i] = s[i] ^ e_j0[i];
    }

    (ciphertext, tag)
}

pub fn open(
    key: &[u8; 16],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; 16],
) -> Result<Vec<u8>, CryptoError> {
    let aes = Aes128::new(key);
    let h = aes.encrypt_block(&[0u8; 16]);

    let j0_block = j0(nonce);
    let s = ghash(h, aad, ciphertext);
    let e_j0 = aes.encrypt_block(&j0_block);

    let mut expected = [0u8; 16];
    for i in 0..16 {
        expected[i] = s[i] ^ e_j0[i];
    }

    if !ct_eq(&expected, tag) {
        return Err(CryptoError::TagMismatch);
    }

    let mut counter0 = j0_block;
    inc32(&mut counter0);
    Ok(gctr(&aes, counter0, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nist_zero_key_nonce_vector() {
        let key = [0u8; 16];
        let nonce = [0u8; 12];
        let pt = [0u8; 16];

        let (ct, tag) = seal(&key, &nonce, &[], &pt);
        assert_eq!(hex::encode(&ct), "0388dace60b6a392f328c2b971b2fe78");
        assert_eq!(hex::encode(tag), "ab6e47d42cec13bdf53a67b21257bddf");

        let opened = open(&key, &nonce, &[], &ct, &tag).unwrap();
        assert_eq!(opened, pt);
    }

    #[test]
    fn tag_mismatch_rejected() {
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let (ct, mut tag) = seal(&key, &nonce, b"aad", b"hello world12345");
        tag[0] ^= 0x80;
        assert!(open(&key, &nonce, b"aad", &ct, &tag).is_err());
    }
}
