//! Transfer encryption.
//!
//! The NetDimm decrypts each uploaded chunk with single DES in ECB mode, but reads both
//! the key and the data in the opposite byte order to the host. Each chunk is therefore
//! byte-reversed, encrypted with the byte-reversed key, and reversed back.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;

use crate::error::ValidationError;

/// Key size in bytes.
pub const KEY_SIZE: usize = 8;

/// DES block size in bytes.
pub const BLOCK_SIZE: usize = 8;

/// The all-zero key tells the firmware not to decrypt.
pub const NO_ENCRYPTION_KEY: [u8; KEY_SIZE] = [0; KEY_SIZE];

/// Parse a transfer key from its 16 hex digit form.
pub fn parse_key(text: &str) -> Result<[u8; KEY_SIZE], ValidationError> {
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let bytes = hex::decode(text).map_err(|_| ValidationError::InvalidKeyLength(text.len() / 2))?;
    <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
        .map_err(|_| ValidationError::InvalidKeyLength(bytes.len()))
}

/// Per-chunk cipher matching the firmware's byte order.
#[derive(Clone)]
pub struct ChunkCipher {
    cipher: Des,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher").finish_non_exhaustive()
    }
}

impl ChunkCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let mut reversed = *key;
        reversed.reverse();
        Self {
            cipher: Des::new(GenericArray::from_slice(&reversed)),
        }
    }

    /// Encrypt a chunk in place.
    ///
    /// Bytes that do not fill a whole block after reversal are left as they are.
    pub fn encrypt(&self, chunk: &mut [u8]) {
        chunk.reverse();
        for block in chunk.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
        chunk.reverse();
    }

    /// Decrypt a chunk in place. Inverse of [`ChunkCipher::encrypt`].
    pub fn decrypt(&self, chunk: &mut [u8]) {
        chunk.reverse();
        for block in chunk.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
        chunk.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 8] = [0xF1, 0xDF, 0xBC, 0x9B, 0x79, 0x57, 0x34, 0x13];

    #[test]
    fn test_known_vector_with_reversal() {
        // Standard DES vector (key 133457799BBCDFF1, 0123456789ABCDEF -> 85E813540F0AB405),
        // expressed in the device's byte order.
        let cipher = ChunkCipher::new(&KEY);
        let mut chunk = [0xEF, 0xCD, 0xAB, 0x89, 0x67, 0x45, 0x23, 0x01];
        cipher.encrypt(&mut chunk);
        assert_eq!(chunk, [0x05, 0xB4, 0x0A, 0x0F, 0x54, 0x13, 0xE8, 0x85]);
    }

    #[test]
    fn test_round_trip_sizes() {
        let cipher = ChunkCipher::new(&KEY);
        for size in [1usize, 8, 0x8000] {
            let original: Vec<u8> = (0..size).map(|i| (i * 7 + 3) as u8).collect();
            let mut chunk = original.clone();
            cipher.encrypt(&mut chunk);
            if size >= BLOCK_SIZE {
                assert_ne!(chunk, original);
            }
            cipher.decrypt(&mut chunk);
            assert_eq!(chunk, original, "size {size}");
        }
    }

    #[test]
    fn test_partial_block_passes_through() {
        let cipher = ChunkCipher::new(&KEY);
        let mut chunk = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        cipher.encrypt(&mut chunk);
        // After reversal the two leading bytes form the incomplete block.
        assert_eq!(&chunk[..2], &[1, 2]);
        assert_ne!(&chunk[2..], &[3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("0x0123456789abcdef").unwrap()[0], 0x01);
        assert_eq!(parse_key("F1DFBC9B79573413").unwrap(), KEY);
        assert!(parse_key("0011").is_err());
        assert!(parse_key("zz").is_err());
    }
}
