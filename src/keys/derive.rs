//! Key derivation pipeline.
//!
//! Seven stages run in a fixed order, each reading only what earlier stages
//! have already written:
//!
//! ```text
//! secure_boot_key + tsec_key
//!   └── keyblob_key_XX, keyblob_mac_key_XX        (1)
//!         └── keyblob_XX  (CMAC check, AES-CTR)    (2)
//!               ├── package1_key_XX                (3)
//!               └── master_key_XX                  (3)
//!                     ├── key_area_key_*_XX, titlekek_XX, package2_key_XX  (5)
//!                     ├── header_key              (6, generation 0 only)
//!                     └── sd_card_*_key           (7, generation 0 only)
//!   keyblob_key_00
//!     └── device_key
//!           ├── save_mac_key                       (4)
//!           └── bis_key_00..03                     (4)
//! ```
//!
//! A stage whose inputs are missing (all-zero) leaves its outputs alone and
//! does not report anything: a partial key file still yields every key it
//! can.

use tracing::debug;

use super::{KEYBLOB_SIZE, KaekIndex, KeySet, MAX_KEY_GENERATION, SdKeyKind, is_empty};
use crate::crypto::{ctr_transform, decrypt_ecb, generate_kek, verify_cmac};
use crate::report::ProgressReport;

/// What to do with a keyblob whose embedded CMAC does not match.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Report the mismatch and decrypt the keyblob anyway.
    #[default]
    FailOpen,
    /// Report the mismatch and leave that generation's keyblob empty.
    FailClosed,
}

fn block(buf: &[u8], offset: usize) -> [u8; 0x10] {
    let mut out = [0u8; 0x10];
    out.copy_from_slice(&buf[offset..offset + 0x10]);
    out
}

impl KeySet {
    /// Run the full derivation pipeline.
    ///
    /// Keyblob MAC mismatches are reported through `logger` and handled
    /// according to `policy`. Nothing else is reported.
    pub fn derive_keys_with(&mut self, policy: IntegrityPolicy, logger: &dyn ProgressReport) {
        self.derive_keyblob_keys();
        self.decrypt_keyblobs(policy, logger);
        self.read_keyblobs();

        self.derive_per_console_keys();
        self.derive_per_firmware_keys();
        self.derive_header_key();
        self.derive_sd_card_keys();
    }

    fn derive_keyblob_keys(&mut self) {
        if is_empty(&self.secure_boot_key) || is_empty(&self.tsec_key) {
            return;
        }

        let have_master_key_source = !is_empty(&self.master_key_source);
        let mut derived = 0;

        for i in 0..MAX_KEY_GENERATION {
            if is_empty(&self.keyblob_key_sources[i]) {
                continue;
            }

            let tmp = decrypt_ecb(&self.tsec_key, &self.keyblob_key_sources[i]);
            self.keyblob_keys[i] = decrypt_ecb(&self.secure_boot_key, &tmp);
            derived += 1;

            if !have_master_key_source {
                continue;
            }

            self.keyblob_mac_keys[i] =
                decrypt_ecb(&self.keyblob_keys[i], &self.keyblob_mac_key_source);
        }

        debug!(derived, "keyblob keys");
    }

    fn decrypt_keyblobs(&mut self, policy: IntegrityPolicy, logger: &dyn ProgressReport) {
        for i in 0..MAX_KEY_GENERATION {
            if is_empty(&self.keyblob_keys[i])
                || is_empty(&self.keyblob_mac_keys[i])
                || is_empty(&self.encrypted_keyblobs[i])
            {
                continue;
            }

            let encrypted = &self.encrypted_keyblobs[i];
            let expected_cmac = block(encrypted, 0);

            if !verify_cmac(encrypted, &self.keyblob_mac_keys[i], 0x10, 0xA0, &expected_cmac) {
                logger.log_message(&format!(
                    "Warning: Keyblob MAC {i:02x} is invalid. Are SBK/TSEC key correct?"
                ));
                if policy == IntegrityPolicy::FailClosed {
                    continue;
                }
            }

            let counter = block(encrypted, 0x10);
            let mut keyblob = [0u8; KEYBLOB_SIZE];
            keyblob.copy_from_slice(&encrypted[0x20..0x20 + KEYBLOB_SIZE]);
            ctr_transform(&self.keyblob_keys[i], &counter, &mut keyblob);
            self.keyblobs[i] = keyblob;
        }
    }

    fn read_keyblobs(&mut self) {
        let have_master_key_source = !is_empty(&self.master_key_source);

        for i in 0..MAX_KEY_GENERATION {
            if is_empty(&self.keyblobs[i]) {
                continue;
            }

            self.package1_keys[i] = block(&self.keyblobs[i], 0x80);

            if !have_master_key_source {
                continue;
            }

            let master_kek = block(&self.keyblobs[i], 0);
            self.master_keys[i] = decrypt_ecb(&master_kek, &self.master_key_source);
        }
    }

    fn derive_per_console_keys(&mut self) {
        if !is_empty(&self.per_console_key_source) && !is_empty(&self.keyblob_keys[0]) {
            self.device_key = decrypt_ecb(&self.keyblob_keys[0], &self.per_console_key_source);
        }

        if !is_empty(&self.device_key)
            && !is_empty(&self.save_mac_kek_source)
            && !is_empty(&self.save_mac_key_source)
            && !is_empty(&self.aes_kek_generation_source)
        {
            let kek = generate_kek(
                &self.device_key,
                &self.save_mac_kek_source,
                &self.aes_kek_generation_source,
                None,
            );
            self.save_mac_key = decrypt_ecb(&kek, &self.save_mac_key_source);
        }

        if is_empty(&self.device_key)
            || self.bis_key_sources.iter().any(|s| is_empty(s))
            || is_empty(&self.bis_kek_source)
            || is_empty(&self.aes_kek_generation_source)
            || is_empty(&self.aes_key_generation_source)
            || is_empty(&self.retail_specific_aes_key_source)
        {
            return;
        }

        let kek = decrypt_ecb(&self.device_key, &self.retail_specific_aes_key_source);
        self.bis_keys[0] = decrypt_ecb(&kek, &self.bis_key_sources[0]);

        let kek = generate_kek(
            &self.device_key,
            &self.bis_kek_source,
            &self.aes_kek_generation_source,
            Some(&self.aes_key_generation_source),
        );
        self.bis_keys[1] = decrypt_ecb(&kek, &self.bis_key_sources[1]);
        self.bis_keys[2] = decrypt_ecb(&kek, &self.bis_key_sources[2]);

        // BIS partitions 2 and 3 share a key.
        self.bis_keys[3] = self.bis_keys[2];
    }

    fn derive_per_firmware_keys(&mut self) {
        let have_generation_sources = !is_empty(&self.aes_kek_generation_source)
            && !is_empty(&self.aes_key_generation_source);
        let have_kak_source = KaekIndex::ALL
            .map(|k| have_generation_sources && !is_empty(&self.key_area_key_sources[k as usize]));
        let have_titlekek_source = !is_empty(&self.titlekek_source);
        let have_package2_key_source = !is_empty(&self.package2_key_source);
        let mut derived = 0;

        for i in 0..MAX_KEY_GENERATION {
            if is_empty(&self.master_keys[i]) {
                continue;
            }
            derived += 1;

            for kind in KaekIndex::ALL {
                if !have_kak_source[kind as usize] {
                    continue;
                }
                self.key_area_keys[i][kind as usize] = generate_kek(
                    &self.master_keys[i],
                    &self.key_area_key_sources[kind as usize],
                    &self.aes_kek_generation_source,
                    Some(&self.aes_key_generation_source),
                );
            }

            if have_titlekek_source {
                self.titlekeks[i] = decrypt_ecb(&self.master_keys[i], &self.titlekek_source);
            }

            if have_package2_key_source {
                self.package2_keys[i] =
                    decrypt_ecb(&self.master_keys[i], &self.package2_key_source);
            }
        }

        debug!(generations = derived, "per-firmware keys");
    }

    fn derive_header_key(&mut self) {
        if is_empty(&self.master_keys[0])
            || is_empty(&self.header_kek_source)
            || is_empty(&self.header_key_source)
            || is_empty(&self.aes_kek_generation_source)
            || is_empty(&self.aes_key_generation_source)
        {
            return;
        }

        let header_kek = generate_kek(
            &self.master_keys[0],
            &self.header_kek_source,
            &self.aes_kek_generation_source,
            Some(&self.aes_key_generation_source),
        );
        self.header_key = decrypt_ecb(&header_kek, &self.header_key_source);
    }

    /// Recompute the SD card keys from the first master key and the current
    /// SD seed.
    ///
    /// The 16-byte seed is repeated across each 32-byte key source before
    /// unwrapping. Called by [`KeySet::set_sd_seed`] and as the last
    /// pipeline stage.
    pub fn derive_sd_card_keys(&mut self) {
        for kind in SdKeyKind::ALL {
            let k = kind as usize;
            for (i, b) in self.sd_card_key_sources_specific[k].iter_mut().enumerate() {
                *b = self.sd_card_key_sources[k][i] ^ self.sd_seed[i & 0xF];
            }
        }

        if is_empty(&self.master_keys[0])
            || is_empty(&self.sd_card_kek_source)
            || is_empty(&self.aes_kek_generation_source)
            || is_empty(&self.aes_key_generation_source)
        {
            return;
        }

        let sd_kek = generate_kek(
            &self.master_keys[0],
            &self.sd_card_kek_source,
            &self.aes_kek_generation_source,
            Some(&self.aes_key_generation_source),
        );

        for kind in SdKeyKind::ALL {
            let k = kind as usize;
            if is_empty(&self.sd_card_key_sources[k]) {
                continue;
            }
            self.sd_card_keys[k] = decrypt_ecb(&sd_kek, &self.sd_card_key_sources_specific[k]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::RecordingReport;
    use pretty_assertions::assert_eq;

    fn with_device_key() -> KeySet {
        let mut keys = KeySet::new();
        keys.device_key = [0x01; 0x10];
        keys.retail_specific_aes_key_source = [0x02; 0x10];
        keys.bis_kek_source = [0x03; 0x10];
        keys.aes_kek_generation_source = [0x04; 0x10];
        keys.aes_key_generation_source = [0x05; 0x10];
        keys.bis_key_sources = [[0x06; 0x20], [0x07; 0x20], [0x08; 0x20]];
        keys
    }

    #[test]
    fn test_empty_set_derives_nothing() {
        let mut keys = KeySet::new();
        let report = RecordingReport::default();
        keys.derive_keys_with(IntegrityPolicy::FailOpen, &report);

        for descriptor in crate::keys::catalog::all_keys().iter() {
            assert!(is_empty(descriptor.field.slot(&keys)), "{}", descriptor.name);
        }
        assert!(keys.sd_card_keys.iter().all(|k| is_empty(k)));
        assert_eq!(report.count(), 0);
    }

    #[test]
    fn test_bis_key_3_copies_bis_key_2() {
        let mut keys = with_device_key();
        keys.derive_keys_with(IntegrityPolicy::FailOpen, &RecordingReport::default());

        assert!(!is_empty(&keys.bis_keys[2]));
        assert_eq!(keys.bis_keys[3], keys.bis_keys[2]);
        assert_ne!(keys.bis_keys[0], keys.bis_keys[1]);
    }

    #[test]
    fn test_bis_keys_need_every_source() {
        let mut keys = with_device_key();
        keys.bis_key_sources[1] = [0; 0x20];
        keys.derive_keys_with(IntegrityPolicy::FailOpen, &RecordingReport::default());

        assert!(keys.bis_keys.iter().all(|k| is_empty(k)));
    }

    #[test]
    fn test_save_mac_key_uses_two_round_kek() {
        let mut keys = with_device_key();
        keys.save_mac_kek_source = [0x09; 0x10];
        keys.save_mac_key_source = [0x0A; 0x10];
        keys.derive_keys_with(IntegrityPolicy::FailOpen, &RecordingReport::default());

        let kek = generate_kek(&[0x01; 0x10], &[0x09; 0x10], &[0x04; 0x10], None);
        assert_eq!(keys.save_mac_key, decrypt_ecb(&kek, &[0x0A; 0x10]));
    }

    #[test]
    fn test_per_firmware_sources_gate_individually() {
        let mut keys = KeySet::new();
        keys.master_keys[3] = [0x31; 0x10];
        keys.aes_kek_generation_source = [0x04; 0x10];
        keys.aes_key_generation_source = [0x05; 0x10];
        keys.key_area_key_sources[KaekIndex::Ocean as usize] = [0x0B; 0x10];
        keys.titlekek_source = [0x0C; 0x10];
        keys.derive_keys_with(IntegrityPolicy::FailOpen, &RecordingReport::default());

        assert!(keys.key_area_key(KaekIndex::Ocean, 3).is_some());
        assert!(keys.key_area_key(KaekIndex::Application, 3).is_none());
        assert!(keys.key_area_key(KaekIndex::System, 3).is_none());
        assert_eq!(keys.titlekeks[3], decrypt_ecb(&[0x31; 0x10], &[0x0C; 0x10]));
        assert!(is_empty(&keys.package2_keys[3]));
        assert!(keys.titlekek(2).is_none());
    }

    #[test]
    fn test_keyblob_mac_key_needs_master_key_source() {
        let mut keys = KeySet::new();
        keys.secure_boot_key = [0x01; 0x10];
        keys.tsec_key = [0x02; 0x10];
        keys.keyblob_key_sources[0] = [0x03; 0x10];
        keys.keyblob_mac_key_source = [0x04; 0x10];
        keys.derive_keys_with(IntegrityPolicy::FailOpen, &RecordingReport::default());

        assert!(!is_empty(&keys.keyblob_keys[0]));
        assert!(is_empty(&keys.keyblob_mac_keys[0]));
        assert!(is_empty(&keys.keyblob_keys[1]));
    }

    #[test]
    fn test_sd_seed_is_tiled_across_source() {
        let mut keys = KeySet::new();
        keys.sd_card_key_sources[SdKeyKind::Save as usize] = [0xFF; 0x20];
        let seed: [u8; 0x10] = core::array::from_fn(|i| i as u8);
        keys.set_sd_seed(&seed);

        let specific = keys.sd_card_key_sources_specific[SdKeyKind::Save as usize];
        assert_eq!(specific[0x00], 0xFF);
        assert_eq!(specific[0x05], 0xFA);
        assert_eq!(specific[0x15], 0xFA);
        // No master key yet, so no SD card key either.
        assert!(keys.sd_card_key(SdKeyKind::Save).is_none());
    }
}
