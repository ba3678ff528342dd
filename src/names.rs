//! Filesystem naming for a shard's files and its children's prefixes.
//!
//! Mirrors `_sl_names` in the original `skiplist.c`: everything about a
//! shard's on-disk identity is derived from a single filesystem prefix.

use std::path::{Path, PathBuf};

const META_SUFFIX: &str = ".meta";
const DATA_SUFFIX: &str = ".data";
const REDO_SUFFIX: &str = ".redo";
const LEFT_SUFFIX: &str = ".l";
const RIGHT_SUFFIX: &str = ".r";

/// Derived filenames for a shard identified by `prefix`.
#[derive(Debug, Clone)]
pub struct Names {
    /// The prefix itself.
    pub prefix: PathBuf,
    /// Meta file path (`<prefix>.meta`).
    pub meta: PathBuf,
    /// Data file path (`<prefix>.data`).
    pub data: PathBuf,
    /// Redo log path, present only while splitting (`<prefix>.redo`).
    pub redo: PathBuf,
    /// Left child's prefix (`<prefix>.l`).
    pub left_prefix: PathBuf,
    /// Right child's prefix (`<prefix>.r`).
    pub right_prefix: PathBuf,
}

impl Names {
    /// Derives all shard-related paths from `prefix`.
    pub fn new(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref().to_path_buf();
        Self {
            meta: append(&prefix, META_SUFFIX),
            data: append(&prefix, DATA_SUFFIX),
            redo: append(&prefix, REDO_SUFFIX),
            left_prefix: append(&prefix, LEFT_SUFFIX),
            right_prefix: append(&prefix, RIGHT_SUFFIX),
            prefix,
        }
    }
}

fn append(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_expected_suffixes() {
        let ns = Names::new("/tmp/shard-1");
        assert_eq!(ns.meta, PathBuf::from("/tmp/shard-1.meta"));
        assert_eq!(ns.data, PathBuf::from("/tmp/shard-1.data"));
        assert_eq!(ns.redo, PathBuf::from("/tmp/shard-1.redo"));
        assert_eq!(ns.left_prefix, PathBuf::from("/tmp/shard-1.l"));
        assert_eq!(ns.right_prefix, PathBuf::from("/tmp/shard-1.r"));
    }
}
