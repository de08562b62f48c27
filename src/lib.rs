//! **nxkeys** - Nintendo Switch key loading and key hierarchy derivation.
//!
//! # Modules
//! | Module | Contents |
//! |--------|----------|
//! | [`keys`]          | [`KeySet`] store, derivation pipeline, key name catalog |
//! | [`keys::file`]    | `prod.keys` / `console.keys` reader and printer |
//! | [`keys::title`]   | `title.keys` reader, [`TitleKeys`] and [`RightsId`] |
//! | [`crypto`]        | AES-ECB / AES-CTR / AES-CMAC primitives and `generate_kek` |
//! | [`report`]        | [`ProgressReport`] sinks for advisory messages |
//!
//! ```no_run
//! use nxkeys::{KeySet, TracingReport};
//!
//! # fn main() -> nxkeys::Result<()> {
//! let mut keys = KeySet::new();
//! keys.load_prod_keys(std::fs::File::open("prod.keys")?, &TracingReport)?;
//! keys.derive_keys();
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod keys;
pub mod report;
pub mod utils;

pub use error::{Error, Result};
pub use keys::{KeySet, RightsId, TitleKeys};
pub use report::{NullReport, ProgressReport, TracingReport};
