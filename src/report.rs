//! Advisory diagnostics sink.
//!
//! Key loading and derivation are best-effort: malformed lines and keyblob
//! MAC mismatches are reported here and then skipped or tolerated. Nothing
//! sent through [`ProgressReport`] is fatal.

/// Receiver for advisory messages produced while loading or deriving keys.
pub trait ProgressReport {
    /// Record one human-readable message.
    fn log_message(&self, message: &str);
}

/// Forwards every message to [`tracing::warn!`].
///
/// This is the sink used by [`crate::KeySet::derive_keys`] and by
/// [`crate::keys::KeyFiles::read`] when no other sink is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReport;

impl ProgressReport for TracingReport {
    fn log_message(&self, message: &str) {
        tracing::warn!(target: "nxkeys", "{message}");
    }
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReport;

impl ProgressReport for NullReport {
    fn log_message(&self, _message: &str) {}
}

impl<T: ProgressReport + ?Sized> ProgressReport for &T {
    fn log_message(&self, message: &str) {
        (**self).log_message(message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::ProgressReport;

    /// Collects messages so tests can assert on them.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingReport {
        pub(crate) messages: RefCell<Vec<String>>,
    }

    impl RecordingReport {
        pub(crate) fn count(&self) -> usize {
            self.messages.borrow().len()
        }
    }

    impl ProgressReport for RecordingReport {
        fn log_message(&self, message: &str) {
            self.messages.borrow_mut().push(message.to_owned());
        }
    }
}
