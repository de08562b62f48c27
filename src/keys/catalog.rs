//! Named key slots understood by the key file loaders.
//!
//! The catalog maps every key file name (`master_key_00`, `bis_key_source_02`,
//! ...) to its size and to the matching buffer inside a [`KeySet`]. It is
//! split in two:
//!
//! * **common** keys are device-independent sources and firmware keys that
//!   can be shared between consoles;
//! * **unique** keys are secrets tied to one console.
//!
//! The tables are built once on first use and never change afterwards.

use std::collections::HashMap;
use std::sync::LazyLock;

use super::{
    AES_XTS_KEY_SIZE, AES128_KEY_SIZE, BIS_KEY_COUNT, ENCRYPTED_KEYBLOB_SIZE, KEYBLOB_SIZE,
    KaekIndex, KeySet, MAX_KEY_GENERATION, SdKeyKind,
};
use crate::{Error, Result};

/// Selects one buffer inside a [`KeySet`].
///
/// Only the catalog builders construct selectors, and they keep every index
/// below `MAX_KEY_GENERATION`, `BIS_KEY_COUNT` or the slot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum KeyField {
    SecureBootKey,
    TsecKey,
    DeviceKey,
    SdSeed,
    KeyblobKey(usize),
    KeyblobMacKey(usize),
    EncryptedKeyblob(usize),
    BisKey(usize),

    AesKekGenerationSource,
    AesKeyGenerationSource,
    KeyAreaKeySource(KaekIndex),
    TitlekekSource,
    HeaderKekSource,
    HeaderKeySource,
    HeaderKey,
    XciHeaderKey,
    Package2KeySource,
    SdCardKekSource,
    SdCardKeySource(SdKeyKind),
    MasterKeySource,
    KeyblobMacKeySource,
    EticketRsaKek,
    RetailSpecificAesKeySource,
    PerConsoleKeySource,
    BisKekSource,
    SaveMacKekSource,
    SaveMacKeySource,
    SaveMacKey,
    KeyblobKeySource(usize),
    Keyblob(usize),
    MasterKey(usize),
    Package1Key(usize),
    Package2Key(usize),
    Titlekek(usize),
    KeyAreaKey(usize, KaekIndex),
    BisKeySource(usize),
}

// One match drives both the shared and the mutable accessor.
macro_rules! select_slot {
    ($field:expr, $keys:ident, $($borrow:tt)+) => {
        match $field {
            KeyField::SecureBootKey => $($borrow)+ $keys.secure_boot_key[..],
            KeyField::TsecKey => $($borrow)+ $keys.tsec_key[..],
            KeyField::DeviceKey => $($borrow)+ $keys.device_key[..],
            KeyField::SdSeed => $($borrow)+ $keys.sd_seed[..],
            KeyField::KeyblobKey(i) => $($borrow)+ $keys.keyblob_keys[i][..],
            KeyField::KeyblobMacKey(i) => $($borrow)+ $keys.keyblob_mac_keys[i][..],
            KeyField::EncryptedKeyblob(i) => $($borrow)+ $keys.encrypted_keyblobs[i][..],
            KeyField::BisKey(i) => $($borrow)+ $keys.bis_keys[i][..],
            KeyField::AesKekGenerationSource => $($borrow)+ $keys.aes_kek_generation_source[..],
            KeyField::AesKeyGenerationSource => $($borrow)+ $keys.aes_key_generation_source[..],
            KeyField::KeyAreaKeySource(k) => $($borrow)+ $keys.key_area_key_sources[k as usize][..],
            KeyField::TitlekekSource => $($borrow)+ $keys.titlekek_source[..],
            KeyField::HeaderKekSource => $($borrow)+ $keys.header_kek_source[..],
            KeyField::HeaderKeySource => $($borrow)+ $keys.header_key_source[..],
            KeyField::HeaderKey => $($borrow)+ $keys.header_key[..],
            KeyField::XciHeaderKey => $($borrow)+ $keys.xci_header_key[..],
            KeyField::Package2KeySource => $($borrow)+ $keys.package2_key_source[..],
            KeyField::SdCardKekSource => $($borrow)+ $keys.sd_card_kek_source[..],
            KeyField::SdCardKeySource(k) => $($borrow)+ $keys.sd_card_key_sources[k as usize][..],
            KeyField::MasterKeySource => $($borrow)+ $keys.master_key_source[..],
            KeyField::KeyblobMacKeySource => $($borrow)+ $keys.keyblob_mac_key_source[..],
            KeyField::EticketRsaKek => $($borrow)+ $keys.eticket_rsa_kek[..],
            KeyField::RetailSpecificAesKeySource => {
                $($borrow)+ $keys.retail_specific_aes_key_source[..]
            }
            KeyField::PerConsoleKeySource => $($borrow)+ $keys.per_console_key_source[..],
            KeyField::BisKekSource => $($borrow)+ $keys.bis_kek_source[..],
            KeyField::SaveMacKekSource => $($borrow)+ $keys.save_mac_kek_source[..],
            KeyField::SaveMacKeySource => $($borrow)+ $keys.save_mac_key_source[..],
            KeyField::SaveMacKey => $($borrow)+ $keys.save_mac_key[..],
            KeyField::KeyblobKeySource(i) => $($borrow)+ $keys.keyblob_key_sources[i][..],
            KeyField::Keyblob(i) => $($borrow)+ $keys.keyblobs[i][..],
            KeyField::MasterKey(i) => $($borrow)+ $keys.master_keys[i][..],
            KeyField::Package1Key(i) => $($borrow)+ $keys.package1_keys[i][..],
            KeyField::Package2Key(i) => $($borrow)+ $keys.package2_keys[i][..],
            KeyField::Titlekek(i) => $($borrow)+ $keys.titlekeks[i][..],
            KeyField::KeyAreaKey(i, k) => $($borrow)+ $keys.key_area_keys[i][k as usize][..],
            KeyField::BisKeySource(i) => $($borrow)+ $keys.bis_key_sources[i][..],
        }
    };
}

impl KeyField {
    /// Borrow the selected buffer.
    pub(crate) fn slot(self, keys: &KeySet) -> &[u8] {
        select_slot!(self, keys, &)
    }

    /// Mutably borrow the selected buffer.
    ///
    /// The returned slice aliases the key set's own storage; writes are
    /// visible to every later reader of `keys`.
    pub(crate) fn slot_mut(self, keys: &mut KeySet) -> &mut [u8] {
        select_slot!(self, keys, &mut)
    }
}

/// One catalog entry: a key file name, its size and where it is stored.
///
/// Descriptors only come from the catalog tables, so the buffer they name
/// always exists:
///
/// ```compile_fail
/// // Selectors cannot be built outside the catalog.
/// let _ = nxkeys::keys::catalog::KeyField::MasterKey(40);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub(crate) name: String,
    pub(crate) size: usize,
    pub(crate) field: KeyField,
}

impl KeyDescriptor {
    fn new(name: impl Into<String>, size: usize, field: KeyField) -> Self {
        Self {
            name: name.into(),
            size,
            field,
        }
    }

    /// Key file name, e.g. `master_key_00`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Borrow the described buffer of `keys`.
    pub fn slot<'k>(&self, keys: &'k KeySet) -> &'k [u8] {
        self.field.slot(keys)
    }

    /// Copy `value` into the described slot.
    ///
    /// The slot is left untouched if `value` has the wrong length.
    pub(crate) fn store(&self, keys: &mut KeySet, value: &[u8]) -> Result<()> {
        if value.len() != self.size {
            return Err(Error::InvalidKeySize {
                name: self.name.clone(),
                expected: self.size,
                actual: value.len(),
            });
        }
        self.field.slot_mut(keys).copy_from_slice(value);
        Ok(())
    }
}

/// A name-indexed, ordered set of [`KeyDescriptor`]s.
#[derive(Debug, Clone, Default)]
pub struct KeyDict {
    entries: Vec<KeyDescriptor>,
    by_name: HashMap<String, usize>,
}

impl KeyDict {
    fn from_entries(entries: Vec<KeyDescriptor>) -> Self {
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        Self { entries, by_name }
    }

    /// Find a descriptor by key file name.
    pub fn get(&self, name: &str) -> Option<&KeyDescriptor> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.entries.iter()
    }

    /// Number of names in the dictionary.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the dictionary has no names.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Zero every slot named by this dictionary.
    pub(crate) fn clear_slots(&self, keys: &mut KeySet) {
        for descriptor in &self.entries {
            descriptor.field.slot_mut(keys).fill(0);
        }
    }
}

static COMMON_KEYS: LazyLock<KeyDict> =
    LazyLock::new(|| KeyDict::from_entries(common_key_list()));
static UNIQUE_KEYS: LazyLock<KeyDict> =
    LazyLock::new(|| KeyDict::from_entries(unique_key_list()));
static ALL_KEYS: LazyLock<KeyDict> = LazyLock::new(|| {
    KeyDict::from_entries(unique_key_list().into_iter().chain(common_key_list()).collect())
});

/// Device-independent keys.
pub fn common_keys() -> &'static KeyDict {
    &COMMON_KEYS
}

/// Per-console secrets.
pub fn unique_keys() -> &'static KeyDict {
    &UNIQUE_KEYS
}

/// Union of [`common_keys`] and [`unique_keys`].
pub fn all_keys() -> &'static KeyDict {
    &ALL_KEYS
}

fn common_key_list() -> Vec<KeyDescriptor> {
    use KeyField as F;

    let mut keys = vec![
        KeyDescriptor::new("aes_kek_generation_source", AES128_KEY_SIZE, F::AesKekGenerationSource),
        KeyDescriptor::new("aes_key_generation_source", AES128_KEY_SIZE, F::AesKeyGenerationSource),
        KeyDescriptor::new("titlekek_source", AES128_KEY_SIZE, F::TitlekekSource),
        KeyDescriptor::new("header_kek_source", AES128_KEY_SIZE, F::HeaderKekSource),
        KeyDescriptor::new("header_key_source", AES_XTS_KEY_SIZE, F::HeaderKeySource),
        KeyDescriptor::new("header_key", AES_XTS_KEY_SIZE, F::HeaderKey),
        KeyDescriptor::new("xci_header_key", AES128_KEY_SIZE, F::XciHeaderKey),
        KeyDescriptor::new("package2_key_source", AES128_KEY_SIZE, F::Package2KeySource),
        KeyDescriptor::new("sd_card_kek_source", AES128_KEY_SIZE, F::SdCardKekSource),
        KeyDescriptor::new(
            "sd_card_save_key_source",
            AES_XTS_KEY_SIZE,
            F::SdCardKeySource(SdKeyKind::Save),
        ),
        KeyDescriptor::new(
            "sd_card_nca_key_source",
            AES_XTS_KEY_SIZE,
            F::SdCardKeySource(SdKeyKind::Nca),
        ),
        KeyDescriptor::new("master_key_source", AES128_KEY_SIZE, F::MasterKeySource),
        KeyDescriptor::new("keyblob_mac_key_source", AES128_KEY_SIZE, F::KeyblobMacKeySource),
        KeyDescriptor::new("eticket_rsa_kek", AES128_KEY_SIZE, F::EticketRsaKek),
        KeyDescriptor::new(
            "retail_specific_aes_key_source",
            AES128_KEY_SIZE,
            F::RetailSpecificAesKeySource,
        ),
        KeyDescriptor::new("per_console_key_source", AES128_KEY_SIZE, F::PerConsoleKeySource),
        KeyDescriptor::new("bis_kek_source", AES128_KEY_SIZE, F::BisKekSource),
        KeyDescriptor::new("save_mac_kek_source", AES128_KEY_SIZE, F::SaveMacKekSource),
        KeyDescriptor::new("save_mac_key_source", AES128_KEY_SIZE, F::SaveMacKeySource),
        KeyDescriptor::new("save_mac_key", AES128_KEY_SIZE, F::SaveMacKey),
    ];

    for kind in KaekIndex::ALL {
        keys.push(KeyDescriptor::new(
            format!("key_area_key_{}_source", kind.name()),
            AES128_KEY_SIZE,
            F::KeyAreaKeySource(kind),
        ));
    }

    for i in 0..MAX_KEY_GENERATION {
        keys.push(KeyDescriptor::new(
            format!("keyblob_key_source_{i:02x}"),
            AES128_KEY_SIZE,
            F::KeyblobKeySource(i),
        ));
        keys.push(KeyDescriptor::new(format!("keyblob_{i:02x}"), KEYBLOB_SIZE, F::Keyblob(i)));
        keys.push(KeyDescriptor::new(
            format!("master_key_{i:02x}"),
            AES128_KEY_SIZE,
            F::MasterKey(i),
        ));
        keys.push(KeyDescriptor::new(
            format!("package1_key_{i:02x}"),
            AES128_KEY_SIZE,
            F::Package1Key(i),
        ));
        keys.push(KeyDescriptor::new(
            format!("package2_key_{i:02x}"),
            AES128_KEY_SIZE,
            F::Package2Key(i),
        ));
        keys.push(KeyDescriptor::new(format!("titlekek_{i:02x}"), AES128_KEY_SIZE, F::Titlekek(i)));
        for kind in KaekIndex::ALL {
            keys.push(KeyDescriptor::new(
                format!("key_area_key_{}_{i:02x}", kind.name()),
                AES128_KEY_SIZE,
                F::KeyAreaKey(i, kind),
            ));
        }
    }

    for i in 0..3 {
        keys.push(KeyDescriptor::new(
            format!("bis_key_source_{i:02x}"),
            AES_XTS_KEY_SIZE,
            F::BisKeySource(i),
        ));
    }

    keys
}

fn unique_key_list() -> Vec<KeyDescriptor> {
    use KeyField as F;

    let mut keys = vec![
        KeyDescriptor::new("secure_boot_key", AES128_KEY_SIZE, F::SecureBootKey),
        KeyDescriptor::new("tsec_key", AES128_KEY_SIZE, F::TsecKey),
        KeyDescriptor::new("device_key", AES128_KEY_SIZE, F::DeviceKey),
        KeyDescriptor::new("sd_seed", AES128_KEY_SIZE, F::SdSeed),
    ];

    for i in 0..MAX_KEY_GENERATION {
        keys.push(KeyDescriptor::new(
            format!("keyblob_key_{i:02x}"),
            AES128_KEY_SIZE,
            F::KeyblobKey(i),
        ));
        keys.push(KeyDescriptor::new(
            format!("keyblob_mac_key_{i:02x}"),
            AES128_KEY_SIZE,
            F::KeyblobMacKey(i),
        ));
        keys.push(KeyDescriptor::new(
            format!("encrypted_keyblob_{i:02x}"),
            ENCRYPTED_KEYBLOB_SIZE,
            F::EncryptedKeyblob(i),
        ));
    }

    for i in 0..BIS_KEY_COUNT {
        keys.push(KeyDescriptor::new(format!("bis_key_{i:02x}"), AES_XTS_KEY_SIZE, F::BisKey(i)));
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_sizes_match_slots() {
        let keys = KeySet::new();
        for descriptor in all_keys().iter() {
            assert_eq!(descriptor.field.slot(&keys).len(), descriptor.size, "{}", descriptor.name);
        }
    }

    #[test]
    fn test_common_and_unique_are_disjoint() {
        assert!(common_keys().iter().all(|d| unique_keys().get(&d.name).is_none()));
        assert_eq!(all_keys().len(), common_keys().len() + unique_keys().len());
    }

    #[test]
    fn test_catalog_counts() {
        // 20 scalars + 3 KAEK sources + 32 * 9 per-generation + 3 BIS sources
        assert_eq!(common_keys().len(), 20 + 3 + MAX_KEY_GENERATION * 9 + 3);
        // 4 scalars + 32 * 3 keyblob slots + 4 BIS keys
        assert_eq!(unique_keys().len(), 4 + MAX_KEY_GENERATION * 3 + BIS_KEY_COUNT);
    }

    #[test]
    fn test_lookup_by_name() {
        let d = all_keys().get("key_area_key_ocean_0a").expect("kaek name is cataloged");
        assert_eq!(d.size, 0x10);
        assert_eq!(d.field, KeyField::KeyAreaKey(0x0A, KaekIndex::Ocean));

        let d = unique_keys().get("encrypted_keyblob_1f").expect("keyblob name is cataloged");
        assert_eq!(d.size, 0xB0);
        assert!(common_keys().get("encrypted_keyblob_1f").is_none());
        assert!(all_keys().get("master_key_20").is_none());
    }

    #[test]
    fn test_slot_mut_aliases_storage() {
        let mut keys = KeySet::new();
        KeyField::BisKey(3).slot_mut(&mut keys)[0] = 0xEE;
        assert_eq!(keys.bis_keys[3][0], 0xEE);

        KeyField::SdCardKeySource(SdKeyKind::Nca).slot_mut(&mut keys).fill(0x42);
        assert_eq!(keys.sd_card_key_sources[1], [0x42; 0x20]);
        assert!(crate::utils::is_empty(&keys.sd_card_key_sources[0]));
    }

    #[test]
    fn test_store_rejects_wrong_size() {
        let mut keys = KeySet::new();
        keys.aes_kek_generation_source = [0x77; 0x10];
        let d = common_keys().get("aes_kek_generation_source").expect("cataloged");

        let err = d.store(&mut keys, &[0x01; 0x0F]).expect_err("one byte short");
        assert!(matches!(err, Error::InvalidKeySize { expected: 0x10, actual: 0x0F, .. }));
        assert_eq!(keys.aes_kek_generation_source, [0x77; 0x10]);
    }

    #[test]
    fn test_clear_slots_only_touches_dict() {
        let mut keys = KeySet::new();
        keys.tsec_key = [1; 0x10];
        keys.master_key_source = [2; 0x10];
        unique_keys().clear_slots(&mut keys);
        assert_eq!(keys.tsec_key, [0; 0x10]);
        assert_eq!(keys.master_key_source, [2; 0x10]);
    }
}
