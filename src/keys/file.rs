//! Key file loading and printing.
//!
//! ## Format
//! One key per line, `name = hex_value`. A `,` works as the separator too,
//! as does plain whitespace. Blank lines and lines starting with `;` or `#`
//! are ignored.
//!
//! ```text
//! ; common keys
//! master_key_00             = 0123456789abcdef0123456789abcdef
//! header_key_source, 0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef
//! ```
//!
//! Every other problem (unknown name, bad hex, wrong length) is reported
//! through [`ProgressReport`] and the line is skipped, leaving the slot's
//! previous contents in place.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::catalog::{self, KeyDict};
use super::title::TitleKeys;
use super::{IntegrityPolicy, KeySet, is_empty};
use crate::Result;
use crate::report::ProgressReport;
use crate::utils::{decode_hex, lossy_lines};

/// Split a key file line into `(name, value)`.
fn split_key_line(line: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = line.split([',', '=']).collect();
    match parts.as_slice() {
        [name, value] => Some((name.trim(), value.trim())),
        [_] => {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(name), Some(value), None) => Some((name, value)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Read `name = hex` lines from `reader` into `keys`, accepting only names
/// present in `dict`.
///
/// Returns the number of keys stored. Only I/O errors are returned; every
/// per-line problem goes to `logger`. Invalid UTF-8 is decoded lossily, so
/// such a line fails on its own name or value like any other bad line.
pub fn read_keys<R: Read>(
    keys: &mut KeySet,
    reader: R,
    dict: &KeyDict,
    logger: &dyn ProgressReport,
) -> Result<usize> {
    let mut loaded = 0;

    for line in lossy_lines(reader) {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        let Some((name, value)) = split_key_line(line) else {
            continue;
        };

        let Some(descriptor) = dict.get(name) else {
            logger.log_message(&format!("Failed to match key {name}"));
            continue;
        };

        let Some(bytes) = decode_hex(value) else {
            logger.log_message(&format!("Key {name} has an invalid hex value"));
            continue;
        };

        match descriptor.store(keys, &bytes) {
            Ok(()) => loaded += 1,
            Err(e) => logger.log_message(&e.to_string()),
        }
    }

    debug!(loaded, "read key file");
    Ok(loaded)
}

impl KeySet {
    /// Load keys from a `prod.keys`-style reader.
    ///
    /// Both common and console-unique names are accepted. Derivation is not
    /// run; call [`KeySet::derive_keys`] once all sources are loaded.
    pub fn load_prod_keys<R: Read>(
        &mut self,
        reader: R,
        logger: &dyn ProgressReport,
    ) -> Result<usize> {
        read_keys(self, reader, catalog::all_keys(), logger)
    }

    /// Replace this key set's console-unique keys with those in `reader`
    /// and re-run derivation.
    ///
    /// Every unique slot is zeroed first, so secrets from a previously
    /// loaded console cannot leak into the new set. Only unique key names
    /// are accepted.
    pub fn load_console_keys<R: Read>(
        &mut self,
        reader: R,
        logger: &dyn ProgressReport,
    ) -> Result<usize> {
        catalog::unique_keys().clear_slots(self);
        let loaded = read_keys(self, reader, catalog::unique_keys(), logger)?;
        self.derive_keys_with(IntegrityPolicy::FailOpen, logger);
        Ok(loaded)
    }
}

/// Locations of the optional key files used to build a [`KeySet`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFiles {
    /// Main key file (`prod.keys`); common and unique names.
    pub prod: Option<PathBuf>,
    /// Console-specific key file; common and unique names.
    pub console: Option<PathBuf>,
    /// Title key file (`title.keys`).
    pub title: Option<PathBuf>,
    /// Keyblob MAC handling used for the final derivation.
    pub integrity: IntegrityPolicy,
}

impl KeyFiles {
    /// No files.
    pub fn new() -> Self {
        Self::default()
    }

    /// `prod.keys`, `console.keys` and `title.keys` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            prod: Some(dir.join("prod.keys")),
            console: Some(dir.join("console.keys")),
            title: Some(dir.join("title.keys")),
            integrity: IntegrityPolicy::default(),
        }
    }

    /// Set the main key file.
    pub fn with_prod(mut self, path: impl Into<PathBuf>) -> Self {
        self.prod = Some(path.into());
        self
    }

    /// Set the console-specific key file.
    pub fn with_console(mut self, path: impl Into<PathBuf>) -> Self {
        self.console = Some(path.into());
        self
    }

    /// Set the title key file.
    pub fn with_title(mut self, path: impl Into<PathBuf>) -> Self {
        self.title = Some(path.into());
        self
    }

    /// Set the keyblob MAC policy for [`KeyFiles::read`].
    pub fn with_integrity(mut self, policy: IntegrityPolicy) -> Self {
        self.integrity = policy;
        self
    }

    /// Load every configured file and derive all reachable keys.
    ///
    /// Files that do not exist are skipped. Any other I/O failure is
    /// returned.
    pub fn read(&self, logger: &dyn ProgressReport) -> Result<(KeySet, TitleKeys)> {
        let mut keys = KeySet::new();
        let mut title_keys = TitleKeys::new();

        if let Some(file) = open_optional(self.prod.as_deref())? {
            keys.load_prod_keys(file, logger)?;
        }
        if let Some(file) = open_optional(self.console.as_deref())? {
            keys.load_prod_keys(file, logger)?;
        }
        if let Some(file) = open_optional(self.title.as_deref())? {
            title_keys.load(file, logger)?;
        }

        keys.derive_keys_with(self.integrity, logger);
        Ok((keys, title_keys))
    }
}

fn open_optional(path: Option<&Path>) -> Result<Option<File>> {
    let Some(path) = path else {
        return Ok(None);
    };
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "key file not found, skipping");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Format every non-empty key in `dict` as `name = HEX`, sorted by name.
pub fn print_keys(keys: &KeySet, dict: &KeyDict) -> String {
    let width = dict.iter().map(|d| d.name.len()).max().unwrap_or(0);

    let mut entries: Vec<_> = dict.iter().collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    for descriptor in entries {
        let key = descriptor.field.slot(keys);
        if is_empty(key) {
            continue;
        }
        out.push_str(&format!(
            "{:width$} = {}\n",
            descriptor.name,
            hex::encode_upper(key)
        ));
    }
    out
}

/// [`print_keys`] over the common key names.
pub fn print_common_keys(keys: &KeySet) -> String {
    print_keys(keys, catalog::common_keys())
}

/// [`print_keys`] over the console-unique key names.
pub fn print_unique_keys(keys: &KeySet) -> String {
    print_keys(keys, catalog::unique_keys())
}

/// [`print_keys`] over every known key name.
pub fn print_all_keys(keys: &KeySet) -> String {
    print_keys(keys, catalog::all_keys())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::RecordingReport;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_key_line() {
        assert_eq!(split_key_line("a = 00"), Some(("a", "00")));
        assert_eq!(split_key_line("a,00"), Some(("a", "00")));
        assert_eq!(split_key_line("a   00"), Some(("a", "00")));
        assert_eq!(split_key_line("a = 00 = 11"), None);
        assert_eq!(split_key_line("a 00 11"), None);
        assert_eq!(split_key_line("a"), None);
    }

    #[test]
    fn test_read_keys_logs_unknown_and_skips() {
        let mut keys = KeySet::new();
        let report = RecordingReport::default();
        let text = "\
; comment
# comment

not_a_key = 00112233445566778899aabbccddeeff
tsec_key = 00112233445566778899aabbccddeeff
";
        let loaded = keys
            .load_prod_keys(text.as_bytes(), &report)
            .expect("in-memory read");

        assert_eq!(loaded, 1);
        assert_eq!(keys.tsec_key[1], 0x11);
        assert_eq!(
            *report.messages.borrow(),
            vec!["Failed to match key not_a_key".to_owned()]
        );
    }

    #[test]
    fn test_wrong_size_value_leaves_slot_unchanged() {
        let mut keys = KeySet::new();
        keys.aes_kek_generation_source = [0xAB; 0x10];
        let report = RecordingReport::default();
        let text = "\
aes_kek_generation_source = 00112233445566778899aabbccddee
aes_kek_generation_source = 00112233445566778899aabbccddeef
";
        let loaded = keys
            .load_prod_keys(text.as_bytes(), &report)
            .expect("in-memory read");

        assert_eq!(loaded, 0);
        assert_eq!(keys.aes_kek_generation_source, [0xAB; 0x10]);
        assert_eq!(report.count(), 2);
        assert!(report.messages.borrow()[0].contains("incorrect size 15"));
    }

    #[test]
    fn test_invalid_utf8_line_does_not_stop_reading() {
        let mut keys = KeySet::new();
        let report = RecordingReport::default();
        let input: &[u8] = b"; caf\xE9\n\
              tsec_\xE9 = 00112233445566778899aabbccddeeff\n\
              master_key_00 = 01010101010101010101010101010101\n";

        let loaded = keys.load_prod_keys(input, &report).expect("in-memory read");

        assert_eq!(loaded, 1);
        assert_eq!(keys.master_keys[0], [0x01; 0x10]);
        assert_eq!(
            *report.messages.borrow(),
            vec!["Failed to match key tsec_\u{FFFD}".to_owned()]
        );
    }

    #[test]
    fn test_last_value_wins() {
        let mut keys = KeySet::new();
        let text = "\
master_key_00 = 01010101010101010101010101010101
master_key_00 = 02020202020202020202020202020202
";
        keys.load_prod_keys(text.as_bytes(), &RecordingReport::default())
            .expect("in-memory read");
        assert_eq!(keys.master_keys[0], [0x02; 0x10]);
    }

    #[test]
    fn test_console_keys_clear_previous_console() {
        let mut keys = KeySet::new();
        keys.secure_boot_key = [0x01; 0x10];
        keys.bis_keys[3] = [0x02; 0x20];
        keys.master_key_source = [0x03; 0x10];

        let report = RecordingReport::default();
        let text = "\
tsec_key = 0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f
master_key_source = 04040404040404040404040404040404
";
        let loaded = keys
            .load_console_keys(text.as_bytes(), &report)
            .expect("in-memory read");

        assert_eq!(loaded, 1);
        assert!(is_empty(&keys.secure_boot_key));
        assert!(is_empty(&keys.bis_keys[3]));
        assert_eq!(keys.tsec_key, [0x0F; 0x10]);
        // Common keys are neither cleared nor accepted from a console file.
        assert_eq!(keys.master_key_source, [0x03; 0x10]);
        assert_eq!(report.count(), 1);
    }

    #[test]
    fn test_print_keys_sorted_and_padded() {
        let mut keys = KeySet::new();
        keys.tsec_key = [0xAB; 0x10];
        keys.device_key = [0x01; 0x10];

        let printed = print_keys(&keys, catalog::unique_keys());
        let width = catalog::unique_keys()
            .iter()
            .map(|d| d.name.len())
            .max()
            .unwrap_or(0);
        let expected = format!(
            "{:width$} = {}\n{:width$} = {}\n",
            "device_key",
            "01".repeat(0x10),
            "tsec_key",
            "AB".repeat(0x10),
        );
        assert_eq!(printed, expected);
        assert_eq!(print_common_keys(&keys), "");
    }

    #[test]
    fn test_printed_keys_load_back() {
        let mut keys = KeySet::new();
        keys.header_key = [0x5C; 0x20];
        keys.key_area_keys[2][1] = [0x77; 0x10];
        let printed = print_all_keys(&keys);

        let mut reloaded = KeySet::new();
        reloaded
            .load_prod_keys(printed.as_bytes(), &RecordingReport::default())
            .expect("in-memory read");
        assert_eq!(reloaded.header_key, keys.header_key);
        assert_eq!(reloaded.key_area_keys[2][1], [0x77; 0x10]);
    }
}
