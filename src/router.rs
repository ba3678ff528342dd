//! The Router interface a shard calls into on split adoption.
//!
//! The Router itself — the upper-layer B-tree-like index that owns a set
//! of shards keyed by their max-key ranges — is out of scope for this
//! crate. A shard calls it at most once per completed split, on
//! adoption; this module only defines that one seam.

use crate::error::Result;

/// Required of the upper-layer index that owns a set of shards.
///
/// A shard never otherwise interacts with its Router: no shared state,
/// no re-entrant calls back into the shard from within `on_split`.
pub trait Router: Send + Sync {
    /// Notifies the Router that a split completed.
    ///
    /// `old_max_key` is the max-key the parent shard owned before the
    /// split. `left`/`right` are fresh prefixes (not yet renamed) paired
    /// with their own max-keys. Called under the parent shard's write
    /// lock; the Router must not re-enter the shard.
    ///
    /// # Errors
    ///
    /// Returns an error if the Router cannot record the split (e.g. its
    /// own index is unavailable). The parent remains in `SplitDone` and
    /// adoption is retried by the next foreground caller.
    fn on_split(
        &self,
        old_max_key: &[u8],
        left_prefix: &str,
        left_max_key: &[u8],
        right_prefix: &str,
        right_max_key: &[u8],
    ) -> Result<()>;

    /// Returns a globally unique fresh filename prefix for a promoted
    /// child shard.
    fn next_filename(&self) -> String;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Router;
    use crate::error::Result;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A `Router` double that records every `on_split` call for test
    /// assertions and hands out sequential fresh prefixes.
    pub struct RecordingRouter {
        pub base_dir: std::path::PathBuf,
        pub counter: AtomicU64,
        pub calls: Mutex<Vec<(Vec<u8>, String, Vec<u8>, String, Vec<u8>)>>,
    }

    impl RecordingRouter {
        pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
            Self {
                base_dir: base_dir.into(),
                counter: AtomicU64::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    impl Router for RecordingRouter {
        fn on_split(
            &self,
            old_max_key: &[u8],
            left_prefix: &str,
            left_max_key: &[u8],
            right_prefix: &str,
            right_max_key: &[u8],
        ) -> Result<()> {
            self.calls.lock().push((
                old_max_key.to_vec(),
                left_prefix.to_string(),
                left_max_key.to_vec(),
                right_prefix.to_string(),
                right_max_key.to_vec(),
            ));
            Ok(())
        }

        fn next_filename(&self) -> String {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            self.base_dir
                .join(format!("promoted-{n}"))
                .to_string_lossy()
                .into_owned()
        }
    }
}
