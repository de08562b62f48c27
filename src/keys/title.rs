//! Title keys: per-title content keys indexed by rights ID.
//!
//! ## File format
//! Title key files come from many tools and are loosely structured:
//!
//! * columns are separated by `|` if the line contains one, otherwise by `,`
//!   or `=`;
//! * without a header the columns are `rights_id, title_key, name, ...`
//!   with the version in column 8;
//! * a line whose first column is not hex is a header, and recognized
//!   column names move the columns for all following lines.
//!
//! ```text
//! 01000000000100000000000000000000 = 00112233445566778899aabbccddeeff
//! id|rightsId|key|isUpdate|isDLC|isDemo|baseName|name|version
//! ```
//!
//! Rows are recovered where possible: a missing or all-zero rights ID is
//! rebuilt from an 8-byte title ID column, and a title key of the wrong
//! length is stored as zeros so the row's name and version survive.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use tracing::debug;

use crate::report::ProgressReport;
use crate::utils::{decode_hex, decode_hex_n, is_empty, lossy_lines};
use crate::{Error, Result};

/// Size of a rights ID and of a title key.
pub const TITLE_KEY_SIZE: usize = 0x10;

/// 128-bit identifier binding a title key to a content license.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RightsId(pub [u8; TITLE_KEY_SIZE]);

impl RightsId {
    /// Zero-extend an 8-byte title ID into a rights ID.
    pub fn from_title_id(title_id: [u8; 8]) -> Self {
        let mut id = [0u8; TITLE_KEY_SIZE];
        id[..8].copy_from_slice(&title_id);
        Self(id)
    }

    /// `true` for the all-zero rights ID, which names no title.
    pub fn is_zero(&self) -> bool {
        is_empty(&self.0)
    }
}

impl fmt::Display for RightsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for RightsId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex_n::<TITLE_KEY_SIZE>(s)
            .map(Self)
            .ok_or_else(|| Error::InvalidHex(s.to_owned()))
    }
}

/// Column positions in a title key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    title_id: usize,
    rights_id: usize,
    title_key: usize,
    name: usize,
    version: usize,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            title_id: 0,
            rights_id: 0,
            title_key: 1,
            name: 2,
            version: 8,
        }
    }
}

impl Columns {
    /// Apply recognized column names from a header line.
    ///
    /// Returns `true` if any column was recognized.
    fn update_from_header(&mut self, tokens: &[&str]) -> bool {
        let find = |names: &[&str]| {
            names.iter().find_map(|name| {
                tokens
                    .iter()
                    .position(|t| t.trim().eq_ignore_ascii_case(name))
            })
        };

        let title_id = find(&["id"]);
        let rights_id = find(&["rightsId", "rights_id"]).or(title_id);
        let title_key = find(&["key", "titleKey", "hexadecimal_key_value"]);
        let name = find(&["name", "title_name"]);
        let version = find(&["version"]);

        let mut recognized = false;
        for (slot, found) in [
            (&mut self.title_id, title_id),
            (&mut self.rights_id, rights_id),
            (&mut self.title_key, title_key),
            (&mut self.name, name),
            (&mut self.version, version),
        ] {
            if let Some(index) = found {
                *slot = index;
                recognized = true;
            }
        }
        recognized
    }
}

/// One parsed title key row.
struct TitleKeyRow<'a> {
    rights_id: RightsId,
    title_key: [u8; TITLE_KEY_SIZE],
    name: Option<&'a str>,
    version: Option<u32>,
}

fn parse_row<'a>(
    tokens: &[&'a str],
    columns: &Columns,
    logger: &dyn ProgressReport,
) -> Option<TitleKeyRow<'a>> {
    let field = |index: usize| tokens.get(index).copied().map(str::trim);

    let rights_field = field(columns.rights_id);

    let rights_id = match rights_field
        .and_then(decode_hex_n::<TITLE_KEY_SIZE>)
        .map(RightsId)
        .filter(|id| !id.is_zero())
    {
        Some(id) => id,
        None => match field(columns.title_id).and_then(decode_hex_n::<8>) {
            Some(title_id) => RightsId::from_title_id(title_id),
            None => {
                logger.log_message(&match rights_field {
                    Some(value) => format!("Invalid rights ID \"{value}\" in title key file"),
                    None => "Missing rights ID column in title key file".to_owned(),
                });
                return None;
            }
        },
    };

    let Some(key_field) = field(columns.title_key) else {
        logger.log_message(&format!("Missing title key column for {rights_id} in title key file"));
        return None;
    };

    let Some(key_bytes) = decode_hex(key_field) else {
        logger.log_message(&format!("Invalid title key \"{key_field}\" in title key file"));
        return None;
    };

    let title_key = match <[u8; TITLE_KEY_SIZE]>::try_from(key_bytes.as_slice()) {
        Ok(key) => key,
        Err(_) => {
            logger.log_message(&format!(
                "Title key {} had incorrect size {} (expected {TITLE_KEY_SIZE})",
                hex::encode_upper(&key_bytes),
                key_bytes.len()
            ));
            [0u8; TITLE_KEY_SIZE]
        }
    };

    Some(TitleKeyRow {
        rights_id,
        title_key,
        name: field(columns.name).filter(|s| !s.is_empty()),
        version: field(columns.version).and_then(|s| s.parse().ok()),
    })
}

/// Title keys with optional display names and versions.
#[derive(Debug, Clone, Default)]
pub struct TitleKeys {
    keys: HashMap<RightsId, [u8; TITLE_KEY_SIZE]>,
    names: HashMap<RightsId, String>,
    versions: HashMap<RightsId, u32>,
}

impl TitleKeys {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a title key, replacing any previous key for `rights_id`.
    pub fn insert(&mut self, rights_id: RightsId, title_key: [u8; TITLE_KEY_SIZE]) {
        self.keys.insert(rights_id, title_key);
    }

    /// Look up a title key by rights ID.
    pub fn get(&self, rights_id: &RightsId) -> Option<&[u8; TITLE_KEY_SIZE]> {
        self.keys.get(rights_id)
    }

    /// Display name from the title key file, if it had one.
    pub fn name(&self, rights_id: &RightsId) -> Option<&str> {
        self.names.get(rights_id).map(String::as_str)
    }

    /// Title version from the title key file, if it had one.
    pub fn version(&self, rights_id: &RightsId) -> Option<u32> {
        self.versions.get(rights_id).copied()
    }

    /// Number of stored title keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// `true` if no title key is stored.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over `(rights_id, title_key)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&RightsId, &[u8; TITLE_KEY_SIZE])> {
        self.keys.iter()
    }

    /// Load title keys from a `title.keys`-style reader.
    ///
    /// Entries accumulate across calls; a rights ID seen again replaces the
    /// earlier entry. Returns the number of rows stored.
    pub fn load<R: Read>(&mut self, reader: R, logger: &dyn ProgressReport) -> Result<usize> {
        let mut columns = Columns::default();
        let mut loaded = 0;

        for line in lossy_lines(reader) {
            let line = line?;

            let tokens: Vec<&str> = if line.contains('|') {
                line.split('|').collect()
            } else {
                line.split([',', '=']).collect()
            };

            if tokens.len() < 2 {
                continue;
            }

            if decode_hex(tokens[0]).is_none() && columns.update_from_header(&tokens) {
                continue;
            }

            let Some(row) = parse_row(&tokens, &columns, logger) else {
                continue;
            };

            self.keys.insert(row.rights_id, row.title_key);
            if let Some(name) = row.name {
                self.names.insert(row.rights_id, name.to_owned());
            }
            if let Some(version) = row.version {
                self.versions.insert(row.rights_id, version);
            }
            loaded += 1;
        }

        debug!(loaded, total = self.keys.len(), "read title keys");
        Ok(loaded)
    }
}

impl fmt::Display for TitleKeys {
    /// One `RIGHTS_ID = TITLE_KEY` line per entry, sorted by rights ID.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.keys.iter().collect();
        entries.sort_by_key(|(rights_id, _)| **rights_id);
        for (rights_id, key) in entries {
            writeln!(f, "{rights_id} = {}", hex::encode_upper(key))?;
        }
        Ok(())
    }
}
