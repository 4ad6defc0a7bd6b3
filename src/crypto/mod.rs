//! AES-128-XTS for NCA headers.
//!
//! The header is 0xC00 bytes in 0x200-byte sectors.  Unlike IEEE XTS the
//! sector number is written big-endian into the high half of the tweak.
//! Key layout: `key[..16]` is the data key, `key[16..]` the tweak key.

use aes_gcm::aes::cipher::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes128;
use thiserror::Error;

use crate::container::nca::NCA_HEADER_SIZE;

pub const SECTOR_SIZE: usize = 0x200;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("header length {0:#x} is not a whole number of sectors")]
    Unaligned(usize),
    #[error("invalid key length")]
    KeyLength,
}

struct Xts {
    data:  Aes128,
    tweak: Aes128,
}

impl Xts {
    fn new(key: &[u8; 32]) -> Result<Self, CryptoError> {
        Ok(Self {
            data:  Aes128::new_from_slice(&key[..16]).map_err(|_| CryptoError::KeyLength)?,
            tweak: Aes128::new_from_slice(&key[16..]).map_err(|_| CryptoError::KeyLength)?,
        })
    }

    fn apply(&self, buf: &mut [u8], decrypt: bool) -> Result<(), CryptoError> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(CryptoError::Unaligned(buf.len()));
        }
        for (sector, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let mut tweak = [0u8; 16];
            tweak[8..].copy_from_slice(&(sector as u64).to_be_bytes());
            self.tweak.encrypt_block(GenericArray::from_mut_slice(&mut tweak));

            for block in chunk.chunks_exact_mut(16) {
                xor(block, &tweak);
                let b = GenericArray::from_mut_slice(block);
                if decrypt {
                    self.data.decrypt_block(b);
                } else {
                    self.data.encrypt_block(b);
                }
                xor(block, &tweak);
                mul_alpha(&mut tweak);
            }
        }
        Ok(())
    }
}

fn xor(block: &mut [u8], tweak: &[u8; 16]) {
    block.iter_mut().zip(tweak).for_each(|(b, t)| *b ^= t);
}

/// Multiply the tweak by x in GF(2^128), little-endian.
fn mul_alpha(tweak: &mut [u8; 16]) {
    let mut carry = 0u8;
    for byte in tweak.iter_mut() {
        let next = *byte >> 7;
        *byte = (*byte << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        tweak[0] ^= 0x87;
    }
}

/// Decrypt the first 0xC00 bytes of an NCA.
pub fn decrypt_header(raw: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let len = raw.len().min(NCA_HEADER_SIZE);
    let mut out = raw[..len].to_vec();
    Xts::new(key)?.apply(&mut out, true)?;
    Ok(out)
}

/// Inverse of [`decrypt_header`].
pub fn encrypt_header(plain: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let mut out = plain.to_vec();
    Xts::new(key)?.apply(&mut out, false)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [
        0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87, 0x98, 0xA9, 0xBA, 0xCB, 0xDC, 0xED, 0xFE, 0x0F,
        0xF0, 0xE1, 0xD2, 0xC3, 0xB4, 0xA5, 0x96, 0x87, 0x78, 0x69, 0x5A, 0x4B, 0x3C, 0x2D, 0x1E, 0x0F,
    ];

    #[test]
    fn header_roundtrip() {
        let plain: Vec<u8> = (0..NCA_HEADER_SIZE).map(|i| (i * 7) as u8).collect();
        let enc = encrypt_header(&plain, &KEY).unwrap();
        assert_ne!(enc, plain);
        assert_eq!(decrypt_header(&enc, &KEY).unwrap(), plain);
    }

    #[test]
    fn sectors_use_distinct_tweaks() {
        let plain = vec![0u8; SECTOR_SIZE * 2];
        let enc = encrypt_header(&plain, &KEY).unwrap();
        assert_ne!(enc[..SECTOR_SIZE], enc[SECTOR_SIZE..]);
    }

    #[test]
    fn mul_alpha_wraps_with_reduction() {
        let mut t = [0u8; 16];
        t[15] = 0x80;
        mul_alpha(&mut t);
        assert_eq!(t[0], 0x87);
        assert!(t[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn unaligned_input_is_rejected() {
        assert!(matches!(encrypt_header(&[0u8; 100], &KEY), Err(CryptoError::Unaligned(100))));
    }
}
