//! # `skipshard`
//!
//! An embedded, on-disk, ordered key-value store whose unit of storage is
//! a memory-mapped skiplist ("shard"). A higher-level index (the
//! `Router`, external to this crate) organizes many shards by key range
//! so a single logical keyspace scales beyond any one shard's capacity.
//!
//! This crate implements the shard itself: its on-disk meta/data file
//! layout, the in-memory skiplist built over that layout, the background
//! split protocol that turns one full shard into two, and the state
//! machine coordinating foreground writers, the splitter, and the
//! Router's eventual adoption of the resulting halves.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use skipshard::{Router, Shard, ShardConfig};
//! use std::sync::Arc;
//!
//! struct NoopRouter;
//! impl Router for NoopRouter {
//!     fn on_split(
//!         &self,
//!         _old_max_key: &[u8],
//!         _left_prefix: &str,
//!         _left_max_key: &[u8],
//!         _right_prefix: &str,
//!         _right_max_key: &[u8],
//!     ) -> skipshard::Result<()> {
//!         Ok(())
//!     }
//!     fn next_filename(&self) -> String {
//!         "/tmp/promoted".to_string()
//!     }
//! }
//!
//! # fn main() -> skipshard::Result<()> {
//! let shard = Shard::open("/tmp/skipshard-example", ShardConfig::default(), Arc::new(NoopRouter))?;
//! shard.put(b"key", 42)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod config;
pub mod data;
pub mod error;
pub mod meta;
pub mod names;
pub mod redolog;
pub mod router;
pub mod shard;
pub mod skiplist;
pub mod split;

pub use arena::Arena;
pub use config::ShardConfig;
pub use error::{Error, Result};
pub use names::Names;
pub use redolog::{FileRedoLog, RedoEntry, RedoLog};
pub use router::Router;
pub use shard::{Shard, ShardState};
pub use skiplist::{Lookup, PutOutcome, Skiplist};
