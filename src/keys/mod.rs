//! Key management for Nintendo Switch cryptography.
//!
//! Nintendo Switch keys form a layered hierarchy rooted in a handful of
//! per-console secrets:
//!
//! * **Keyblob keys** are unwrapped from the secure boot key and TSEC key.
//!   Each firmware generation has its own encrypted keyblob carrying a
//!   master key seed and the package1 key.
//! * **Master keys** (`master_key_XX`) are read out of the decrypted
//!   keyblobs, one per firmware generation.
//! * **Key area encryption keys** (KAEK) are derived per content type
//!   (Application / Ocean / System) from the master key, along with the
//!   titlekek and package2 key.
//! * **Per-console keys** (device key, BIS keys, save MAC key) come from the
//!   first keyblob key.
//! * **Header key** and **SD card keys** come from the first master key.
//!
//! [`KeySet`] is a plain container of fixed-size buffers. It is filled by
//! the loaders in [`file`] and completed by [`KeySet::derive_keys`], which
//! computes every key that the loaded material allows and silently skips
//! the rest.
//!
//! ## Key file format
//! Nintendo key files are simple `name = hex_value` text files, one entry
//! per line. See [`file`] and [`title`].

use crate::report::TracingReport;

pub mod catalog;
mod derive;
pub mod file;
pub mod title;

pub use catalog::{KeyDescriptor, KeyDict};
pub use derive::IntegrityPolicy;
pub use file::{KeyFiles, print_all_keys, print_common_keys, print_keys, print_unique_keys};
pub use title::{RightsId, TitleKeys};

pub use crate::utils::is_empty;

/// Maximum number of master key generations understood by this library.
pub const MAX_KEY_GENERATION: usize = 32;

/// Size of an AES-128 key.
pub const AES128_KEY_SIZE: usize = 0x10;

/// Size of an AES-XTS key pair (header key, BIS keys, SD card keys).
pub const AES_XTS_KEY_SIZE: usize = 0x20;

/// Size of a decrypted keyblob.
pub const KEYBLOB_SIZE: usize = 0x90;

/// Size of an encrypted keyblob: CMAC, CTR counter, then the ciphertext.
pub const ENCRYPTED_KEYBLOB_SIZE: usize = 0xB0;

/// Number of BIS key slots. Slots 2 and 3 always hold the same key.
pub const BIS_KEY_COUNT: usize = 4;

/// Key area encryption key index (determines which KAEK derivation chain is
/// used for a particular NCA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KaekIndex {
    /// Application content (most games).
    Application = 0,
    /// Ocean content (game-card specific).
    Ocean = 1,
    /// System content (OS modules).
    System = 2,
}

impl KaekIndex {
    /// All indices in slot order.
    pub const ALL: [KaekIndex; 3] = [Self::Application, Self::Ocean, Self::System];

    /// Name used in key files, e.g. `key_area_key_ocean_00`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Ocean => "ocean",
            Self::System => "system",
        }
    }
}

impl TryFrom<u8> for KaekIndex {
    type Error = crate::Error;
    fn try_from(v: u8) -> crate::Result<Self> {
        match v {
            0 => Ok(Self::Application),
            1 => Ok(Self::Ocean),
            2 => Ok(Self::System),
            _ => Err(crate::Error::Parse("invalid KAEK index")),
        }
    }
}

/// The two SD card key roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdKeyKind {
    /// Save data on the SD card.
    Save = 0,
    /// NCAs installed to the SD card.
    Nca = 1,
}

impl SdKeyKind {
    /// Both roles in slot order.
    pub const ALL: [SdKeyKind; 2] = [Self::Save, Self::Nca];
}

/// Every key buffer known to the library.
///
/// Buffers are zero-initialized and never resized. A buffer that is all
/// zero is treated as absent ([`is_empty`]); there is no other validity
/// flag. Per-generation arrays are indexed by key generation
/// (`0..MAX_KEY_GENERATION`).
///
/// Keys are read through [`KeySet::key`] and the typed getters. Only the
/// loaders, [`KeySet::set_key`] and the derivation pipeline write them:
///
/// ```compile_fail
/// let mut keys = nxkeys::KeySet::new();
/// keys.master_keys[0] = [0x01; 0x10];
/// ```
#[derive(Clone)]
pub struct KeySet {
    // Per-console root secrets.
    /// Secure boot key (SBK), fused per console.
    pub(crate) secure_boot_key: [u8; 0x10],
    /// TSEC-derived root key.
    pub(crate) tsec_key: [u8; 0x10],
    /// Per-console device key, unwrapped from `keyblob_key_00`.
    pub(crate) device_key: [u8; 0x10],
    /// Per-session seed mixed into the SD card keys.
    pub(crate) sd_seed: [u8; 0x10],

    // Keyblobs.
    pub(crate) keyblob_key_sources: [[u8; 0x10]; MAX_KEY_GENERATION],
    pub(crate) keyblob_keys: [[u8; 0x10]; MAX_KEY_GENERATION],
    pub(crate) keyblob_mac_key_source: [u8; 0x10],
    pub(crate) keyblob_mac_keys: [[u8; 0x10]; MAX_KEY_GENERATION],
    /// Embedded CMAC, CTR counter, then ciphertext.
    pub(crate) encrypted_keyblobs: [[u8; ENCRYPTED_KEYBLOB_SIZE]; MAX_KEY_GENERATION],
    pub(crate) keyblobs: [[u8; KEYBLOB_SIZE]; MAX_KEY_GENERATION],

    // Per-firmware keys.
    pub(crate) master_key_source: [u8; 0x10],
    pub(crate) master_keys: [[u8; 0x10]; MAX_KEY_GENERATION],
    pub(crate) package1_keys: [[u8; 0x10]; MAX_KEY_GENERATION],
    pub(crate) package2_key_source: [u8; 0x10],
    pub(crate) package2_keys: [[u8; 0x10]; MAX_KEY_GENERATION],
    pub(crate) aes_kek_generation_source: [u8; 0x10],
    pub(crate) aes_key_generation_source: [u8; 0x10],
    /// Indexed by [`KaekIndex`].
    pub(crate) key_area_key_sources: [[u8; 0x10]; 3],
    /// Indexed by generation, then [`KaekIndex`].
    pub(crate) key_area_keys: [[[u8; 0x10]; 3]; MAX_KEY_GENERATION],
    pub(crate) titlekek_source: [u8; 0x10],
    pub(crate) titlekeks: [[u8; 0x10]; MAX_KEY_GENERATION],

    // NCA / XCI headers.
    pub(crate) header_kek_source: [u8; 0x10],
    pub(crate) header_key_source: [u8; 0x20],
    pub(crate) header_key: [u8; 0x20],
    pub(crate) xci_header_key: [u8; 0x10],

    // Per-console derived keys.
    pub(crate) per_console_key_source: [u8; 0x10],
    pub(crate) retail_specific_aes_key_source: [u8; 0x10],
    pub(crate) save_mac_kek_source: [u8; 0x10],
    pub(crate) save_mac_key_source: [u8; 0x10],
    pub(crate) save_mac_key: [u8; 0x10],
    pub(crate) bis_kek_source: [u8; 0x10],
    pub(crate) bis_key_sources: [[u8; 0x20]; 3],
    /// Slot 3 mirrors slot 2.
    pub(crate) bis_keys: [[u8; 0x20]; BIS_KEY_COUNT],

    // SD card. Indexed by [`SdKeyKind`].
    pub(crate) sd_card_kek_source: [u8; 0x10],
    pub(crate) sd_card_key_sources: [[u8; 0x20]; 2],
    /// `sd_card_key_sources` XORed with the repeated `sd_seed`.
    pub(crate) sd_card_key_sources_specific: [[u8; 0x20]; 2],
    pub(crate) sd_card_keys: [[u8; 0x20]; 2],

    pub(crate) eticket_rsa_kek: [u8; 0x10],
}

impl KeySet {
    /// Create an empty key set.
    pub fn new() -> Self {
        Self {
            secure_boot_key: [0; 0x10],
            tsec_key: [0; 0x10],
            device_key: [0; 0x10],
            sd_seed: [0; 0x10],
            keyblob_key_sources: [[0; 0x10]; MAX_KEY_GENERATION],
            keyblob_keys: [[0; 0x10]; MAX_KEY_GENERATION],
            keyblob_mac_key_source: [0; 0x10],
            keyblob_mac_keys: [[0; 0x10]; MAX_KEY_GENERATION],
            encrypted_keyblobs: [[0; ENCRYPTED_KEYBLOB_SIZE]; MAX_KEY_GENERATION],
            keyblobs: [[0; KEYBLOB_SIZE]; MAX_KEY_GENERATION],
            master_key_source: [0; 0x10],
            master_keys: [[0; 0x10]; MAX_KEY_GENERATION],
            package1_keys: [[0; 0x10]; MAX_KEY_GENERATION],
            package2_key_source: [0; 0x10],
            package2_keys: [[0; 0x10]; MAX_KEY_GENERATION],
            aes_kek_generation_source: [0; 0x10],
            aes_key_generation_source: [0; 0x10],
            key_area_key_sources: [[0; 0x10]; 3],
            key_area_keys: [[[0; 0x10]; 3]; MAX_KEY_GENERATION],
            titlekek_source: [0; 0x10],
            titlekeks: [[0; 0x10]; MAX_KEY_GENERATION],
            header_kek_source: [0; 0x10],
            header_key_source: [0; 0x20],
            header_key: [0; 0x20],
            xci_header_key: [0; 0x10],
            per_console_key_source: [0; 0x10],
            retail_specific_aes_key_source: [0; 0x10],
            save_mac_kek_source: [0; 0x10],
            save_mac_key_source: [0; 0x10],
            save_mac_key: [0; 0x10],
            bis_kek_source: [0; 0x10],
            bis_key_sources: [[0; 0x20]; 3],
            bis_keys: [[0; 0x20]; BIS_KEY_COUNT],
            sd_card_kek_source: [0; 0x10],
            sd_card_key_sources: [[0; 0x20]; 2],
            sd_card_key_sources_specific: [[0; 0x20]; 2],
            sd_card_keys: [[0; 0x20]; 2],
            eticket_rsa_kek: [0; 0x10],
        }
    }

    /// Run the full derivation pipeline with the default fail-open keyblob
    /// policy, reporting through [`TracingReport`].
    pub fn derive_keys(&mut self) {
        self.derive_keys_with(IntegrityPolicy::FailOpen, &TracingReport);
    }

    /// Store a new SD seed and recompute the SD card keys.
    ///
    /// Only the SD card stage runs; every other key is left as is.
    pub fn set_sd_seed(&mut self, seed: &[u8; 0x10]) {
        self.sd_seed = *seed;
        self.derive_sd_card_keys();
    }

    /// Look up a key slot by its key file name.
    ///
    /// Returns [`None`] for unknown names; empty slots are returned as-is.
    pub fn key(&self, name: &str) -> Option<&[u8]> {
        catalog::all_keys().get(name).map(|d| d.field.slot(self))
    }

    /// Overwrite a key slot by its key file name.
    ///
    /// Fails with [`crate::Error::UnknownKey`] or
    /// [`crate::Error::InvalidKeySize`]; the slot is unchanged on error.
    pub fn set_key(&mut self, name: &str, value: &[u8]) -> crate::Result<()> {
        let descriptor = catalog::all_keys()
            .get(name)
            .ok_or_else(|| crate::Error::UnknownKey(name.to_owned()))?;
        descriptor.store(self, value)
    }

    /// Look up the KAEK for the given index and firmware generation.
    pub fn key_area_key(&self, index: KaekIndex, generation: u8) -> Option<&[u8; 0x10]> {
        let key = &self.key_area_keys.get(generation as usize)?[index as usize];
        (!is_empty(key)).then_some(key)
    }

    /// Look up the titlekek for the given firmware generation.
    pub fn titlekek(&self, generation: u8) -> Option<&[u8; 0x10]> {
        self.titlekeks
            .get(generation as usize)
            .filter(|key| !is_empty(&key[..]))
    }

    /// Look up the master key for the given firmware generation.
    pub fn master_key(&self, generation: u8) -> Option<&[u8; 0x10]> {
        self.master_keys
            .get(generation as usize)
            .filter(|key| !is_empty(&key[..]))
    }

    /// The NCA header key, if loaded or derived.
    pub fn header_key(&self) -> Option<&[u8; 0x20]> {
        (!is_empty(&self.header_key)).then_some(&self.header_key)
    }

    /// The SD card key for `kind`, if derived.
    pub fn sd_card_key(&self, kind: SdKeyKind) -> Option<&[u8; 0x20]> {
        let key = &self.sd_card_keys[kind as usize];
        (!is_empty(key)).then_some(key)
    }
}

impl Default for KeySet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = catalog::all_keys()
            .iter()
            .filter(|d| !is_empty(d.field.slot(self)))
            .count();
        f.debug_struct("KeySet")
            .field("present_keys", &present)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_all_zero() {
        let keys = KeySet::new();
        for descriptor in catalog::all_keys().iter() {
            assert!(is_empty(descriptor.field.slot(&keys)), "{}", descriptor.name);
        }
    }

    #[test]
    fn test_kaek_index_try_from() {
        assert_eq!(KaekIndex::try_from(1).ok(), Some(KaekIndex::Ocean));
        assert!(matches!(
            KaekIndex::try_from(3),
            Err(crate::Error::Parse("invalid KAEK index"))
        ));
    }

    #[test]
    fn test_typed_lookups_hide_empty_slots() {
        let mut keys = KeySet::new();
        assert!(keys.key_area_key(KaekIndex::System, 5).is_none());
        assert!(keys.key_area_key(KaekIndex::System, 200).is_none());
        assert!(keys.header_key().is_none());

        keys.key_area_keys[5][KaekIndex::System as usize] = [0x5A; 0x10];
        assert_eq!(keys.key_area_key(KaekIndex::System, 5), Some(&[0x5A; 0x10]));
        assert!(keys.key_area_key(KaekIndex::Ocean, 5).is_none());
    }

    #[test]
    fn test_set_key_by_name() {
        let mut keys = KeySet::new();
        keys.set_key("master_key_1f", &[0x11; 0x10])
            .expect("master_key_1f is a catalog key");
        assert_eq!(keys.master_key(0x1F), Some(&[0x11; 0x10]));
        assert_eq!(keys.key("master_key_1f"), Some(&[0x11u8; 0x10][..]));

        assert!(matches!(
            keys.set_key("master_key_20", &[0x11; 0x10]),
            Err(crate::Error::UnknownKey(_))
        ));
        assert!(matches!(
            keys.set_key("header_key", &[0x11; 0x10]),
            Err(crate::Error::InvalidKeySize { expected: 0x20, actual: 0x10, .. })
        ));
        assert!(keys.header_key().is_none());
    }
}
