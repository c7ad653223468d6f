//! Optional per-record encryption (§4.1).
//!
//! `key ∥ value` is encrypted with AES-256-CTR, keyed by the file's
//! data-encryption key and a keystream position derived from the record's
//! offset in the file. The header and trailing CRC are always plaintext, so
//! a reader can decode the header, learn the key/value lengths, and decrypt
//! exactly the right byte range without touching neighboring records.
//!
//! The key registry itself (mapping a `key_id` to a `DataKey`) is an external
//! collaborator (§1 "Out of scope") — this module only defines the trait it
//! must satisfy and the keystream derivation.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::consts::BASE_IV_SIZE;
use crate::err::{Result, VLogError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, Clone)]
pub struct DataKey {
    pub key_id: u64,
    pub data: [u8; 32],
}

/// External collaborator: the key encryption key registry (§1, §6).
pub trait KeyRegistry: Send + Sync {
    /// Returns the data-encryption key for `key_id`, or `None` if `key_id == 0`
    /// (no encryption).
    fn data_key(&self, key_id: u64) -> Result<Option<DataKey>>;

    /// The key id new files should be created with; `0` means "encryption disabled".
    fn latest_key_id(&self) -> u64;
}

/// Applies (or reverses — the cipher is an involution) the keystream to
/// `buf`, where `buf` represents the bytes starting at `file_offset` within
/// the file the key/IV belong to.
pub fn apply_keystream(
    data_key: &DataKey,
    base_iv: &[u8; BASE_IV_SIZE],
    file_offset: u32,
    buf: &mut [u8],
) -> Result<()> {
    let block_size = 16u32;
    let block_index = file_offset / block_size;
    let intra_block = (file_offset % block_size) as u64;

    let mut iv = [0u8; 16];
    iv[..BASE_IV_SIZE].copy_from_slice(base_iv);
    iv[BASE_IV_SIZE..].copy_from_slice(&block_index.to_be_bytes());

    let mut cipher = Aes256Ctr::new((&data_key.data).into(), (&iv).into());
    cipher
        .try_seek(intra_block)
        .map_err(|e| VLogError::Encryption(e.to_string()))?;
    cipher.apply_keystream(buf);
    Ok(())
}
