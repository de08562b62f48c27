//! AES building blocks used by the key derivation pipeline.
//!
//! All functions accept already-loaded key material and are thin wrappers
//! over the RustCrypto `aes`, `ctr` and `cmac` crates. Key derivation itself
//! lives in [`crate::keys`]; nothing here knows about key names or
//! generations.
//!
//! | Function | Purpose |
//! |----------|---------|
//! | [`decrypt_ecb`]   | AES-128-ECB unwrap of one or two blocks |
//! | [`ctr_transform`] | AES-128-CTR with a big-endian 128-bit counter |
//! | [`generate_kek`]  | Two- or three-step ECB key-encryption-key chain |
//! | [`cmac`]          | AES-128-CMAC |
//! | [`verify_cmac`]   | Keyblob integrity check over a sub-range |
//!
//! ## Key-encryption-key chain
//!
//! ```text
//! kek     = ECB-decrypt(key,     kek_seed)
//! src_kek = ECB-decrypt(kek,     source)
//! result  = ECB-decrypt(src_kek, key_seed)   (skipped when key_seed is None)
//! ```

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit, KeyIvInit, StreamCipher};
use cmac::{Cmac, Mac};
use ctr::Ctr128BE;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 0x10;

/// Decrypt `src` block by block with AES-128-ECB under `key`.
///
/// `N` must be a multiple of the AES block size; 0x10 and 0x20 are the only
/// sizes used by the key hierarchy.
pub fn decrypt_ecb<const N: usize>(key: &[u8; 0x10], src: &[u8; N]) -> [u8; N] {
    const { assert!(N % BLOCK_SIZE == 0) };

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = *src;
    for block in out.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    out
}

/// Apply the AES-128-CTR keystream for `key` / `counter` to `data` in place.
///
/// The counter is treated as a single big-endian 128-bit integer.
pub fn ctr_transform(key: &[u8; 0x10], counter: &[u8; 0x10], data: &mut [u8]) {
    let mut crypter = Ctr128BE::<Aes128>::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(counter),
    );
    crypter.apply_keystream(data);
}

/// Derive a key-encryption key from `key` and `source`.
///
/// One unwrap round under `kek_seed` always runs. When `key_seed` is
/// present a final round folds it in; otherwise the intermediate key is
/// returned directly.
pub fn generate_kek(
    key: &[u8; 0x10],
    source: &[u8; 0x10],
    kek_seed: &[u8; 0x10],
    key_seed: Option<&[u8; 0x10]>,
) -> [u8; 0x10] {
    let kek = decrypt_ecb(key, kek_seed);
    let src_kek = decrypt_ecb(&kek, source);
    match key_seed {
        Some(seed) => decrypt_ecb(&src_kek, seed),
        None => src_kek,
    }
}

fn new_cmac(key: &[u8; 0x10]) -> Cmac<Aes128> {
    <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key))
}

/// Compute the AES-128-CMAC of `data` under `key`.
pub fn cmac(key: &[u8; 0x10], data: &[u8]) -> [u8; 0x10] {
    let mut mac = new_cmac(key);
    mac.update(data);
    let mut out = [0u8; 0x10];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Check that the CMAC of `data[offset..offset + len]` equals `expected`.
///
/// Never fails: a range outside `data` simply does not match. What to do
/// on a mismatch is up to the caller.
pub fn verify_cmac(
    data: &[u8],
    mac_key: &[u8; 0x10],
    offset: usize,
    len: usize,
    expected: &[u8; 0x10],
) -> bool {
    let Some(span) = offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
    else {
        return false;
    };

    let mut mac = new_cmac(mac_key);
    mac.update(span);
    mac.verify_slice(expected).is_ok()
}
