//! The shard facade: the skiplist plus its split state machine.
//!
//! A shard is always in exactly one of four states (mirroring the
//! `SL_NORMAL` / `SL_SPLITED` / `SL_SPLITDONE` / `SL_SPLITER` flags on
//! the original `skiplist_t`):
//!
//! - `Normal` — ordinary reads and writes go straight to the skiplist.
//! - `Splited` — a background thread is bulk-copying into two fresh
//!   children; writes are redirected to a redo log instead of the
//!   frozen parent skiplist, reads check the redo log first.
//! - `SplitDone` — the background copy and redo drain finished; the
//!   very next call routes its own key into whichever child now owns
//!   it, notifies the Router, promotes the children to permanent
//!   names, destroys the parent, and returns that routed operation's
//!   own result — not an error.
//! - `Spliter` — this shard *is* one of those two fresh children,
//!   still being populated by a parent's split and therefore barred
//!   from triggering a split of its own.
//!
//! All of it is guarded by one `parking_lot::RwLock`, taken for write
//! on every operation: the conservative reading of "exactly one
//! reader-writer lock per shard" (see `DESIGN.md`).

use crate::config::ShardConfig;
use crate::error::{Error, Result};
use crate::names::Names;
use crate::redolog::{FileRedoLog, RedoEntry, RedoLog};
use crate::router::Router;
use crate::skiplist::{Lookup, PutOutcome, Skiplist};
use crate::split;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

/// The externally observable state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Serving ordinary reads and writes.
    Normal,
    /// A background split is copying data into two children.
    Splited,
    /// The background split finished; adoption is pending.
    SplitDone,
    /// This shard is itself a child being populated by a parent split.
    Spliter,
}

/// What the background coordinator hands back: two freshly bulk-copied
/// children, not yet drained against the redo log. The drain happens
/// synchronously under the shard's write lock (see `ensure_drained`)
/// rather than racing the foreground `put`/`del` calls that are still
/// appending to that same log.
struct BulkCopyResult {
    left: Skiplist,
    right: Skiplist,
    left_names: Names,
    right_names: Names,
}

/// Children ready for adoption: bulk-copied and redo-drained, still
/// reachable in memory under their pre-promotion names. Kept as live
/// `Skiplist` handles (not just names/max-keys) so the foreground call
/// that first observes them ready can route its own operation into
/// whichever one owns the key before finalizing the split.
struct ReadyChildren {
    left: Skiplist,
    right: Skiplist,
    left_names: Names,
    right_names: Names,
    old_max_key: Vec<u8>,
}

struct Splitting {
    redo: FileRedoLog,
    rx: mpsc::Receiver<Result<BulkCopyResult>>,
    /// The bulk-copy coordinator thread. Retained (not dropped) so
    /// `close`/`destroy` can block on it rather than leaving it an
    /// orphan that could outlive the shard and its files.
    handle: Option<JoinHandle<()>>,
    ready: Option<ReadyChildren>,
}

enum Inner {
    Normal(Skiplist),
    Spliter(Skiplist),
    Splitting { frozen: Skiplist, ctx: Splitting },
    /// Reached only between adoption and the caller observing it;
    /// never persisted.
    Destroyed,
}

/// A single memory-mapped skiplist shard with its split state machine.
pub struct Shard<R: Router> {
    names: Names,
    config: ShardConfig,
    router: Arc<R>,
    inner: RwLock<Inner>,
}

impl<R: Router> Shard<R> {
    /// Opens the shard at `prefix`, creating it fresh if no meta file
    /// exists yet, and recovering a crash-interrupted split if one is
    /// found.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened/created or are
    /// corrupt.
    pub fn open(prefix: impl Into<std::path::PathBuf>, config: ShardConfig, router: Arc<R>) -> Result<Self> {
        let names = Names::new(prefix.into());
        let inner = if names.meta.exists() {
            Self::recover(&names, &config)?
        } else {
            Inner::Normal(Skiplist::create(&names.meta, &names.data, &config)?)
        };
        Ok(Self {
            names,
            config,
            router,
            inner: RwLock::new(inner),
        })
    }

    /// Opens a shard that is itself a split child: permitted to accept
    /// writes (from the redo drain and thereafter) without triggering
    /// a split of its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened.
    pub fn open_as_spliter(
        prefix: impl Into<std::path::PathBuf>,
        config: ShardConfig,
        router: Arc<R>,
    ) -> Result<Self> {
        let names = Names::new(prefix.into());
        let skiplist = Skiplist::open(&names.meta, &names.data, &config)?;
        Ok(Self {
            names,
            config,
            router,
            inner: RwLock::new(Inner::Spliter(skiplist)),
        })
    }

    fn recover(names: &Names, config: &ShardConfig) -> Result<Inner> {
        if !names.redo.exists() {
            return Ok(Inner::Normal(Skiplist::open(&names.meta, &names.data, config)?));
        }
        let left_meta_present = Names::new(&names.left_prefix).meta.exists();
        let right_meta_present = Names::new(&names.right_prefix).meta.exists();
        if !left_meta_present || !right_meta_present {
            tracing::warn!(
                prefix = %names.prefix.display(),
                "discarding incomplete split attempt found on open"
            );
            let _ = std::fs::remove_file(&names.redo);
            let left_names = Names::new(&names.left_prefix);
            let right_names = Names::new(&names.right_prefix);
            let _ = std::fs::remove_file(&left_names.meta);
            let _ = std::fs::remove_file(&left_names.data);
            let _ = std::fs::remove_file(&right_names.meta);
            let _ = std::fs::remove_file(&right_names.data);
            return Ok(Inner::Normal(Skiplist::open(&names.meta, &names.data, config)?));
        }

        tracing::warn!(prefix = %names.prefix.display(), "resuming interrupted split on open");
        let redo = FileRedoLog::open(&names.redo)?;
        let left_names = Names::new(&names.left_prefix);
        let right_names = Names::new(&names.right_prefix);
        let mut left = Skiplist::open(&left_names.meta, &left_names.data, config)?;
        let mut right = Skiplist::open(&right_names.meta, &right_names.data, config)?;
        let frozen = Skiplist::open(&names.meta, &names.data, config)?;

        // A crash can only have interrupted the drain (redo-apply) step,
        // never the bulk copy that precedes it — both children's files
        // already existed on disk, which is what routed us into this
        // branch. Replaying the whole redo log again is safe: every put
        // overwrites to the same recorded value and every delete is
        // idempotent, so re-draining a log that was partially drained
        // before the crash reaches the same end state.
        let drain_entries = redo.iterate();
        let mut rng = StdRng::seed_from_u64(3);
        split::drain_redo(&drain_entries, &mut left, &mut right, &mut rng)?;
        left.sync()?;
        right.sync()?;
        let old_max_key = frozen.max_key()?.unwrap_or_default();

        let (_tx, rx) = mpsc::channel();
        Ok(Inner::Splitting {
            frozen,
            ctx: Splitting {
                redo,
                rx,
                handle: None,
                ready: Some(ReadyChildren {
                    left,
                    right,
                    left_names,
                    right_names,
                    old_max_key,
                }),
            },
        })
    }

    /// Current externally observable state.
    pub fn state(&self) -> ShardState {
        match &*self.inner.read() {
            Inner::Normal(_) => ShardState::Normal,
            Inner::Spliter(_) => ShardState::Spliter,
            Inner::Splitting { ctx, .. } if ctx.ready.is_none() => ShardState::Splited,
            Inner::Splitting { .. } | Inner::Destroyed => ShardState::SplitDone,
        }
    }

    /// Looks up `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is too long, the shard is corrupt,
    /// or the shard was destroyed by a previous call's adoption
    /// (callers should re-resolve the key's owner through the Router
    /// and retry).
    pub fn get(&self, key: &[u8]) -> Result<Lookup> {
        let mut guard = self.inner.write();
        if self.ensure_drained(&mut guard)? {
            return self.finish_split_with(&mut guard, |left, right| pick_child(left, right, key)?.get(key));
        }
        match &*guard {
            Inner::Normal(sl) | Inner::Spliter(sl) => sl.get(key),
            Inner::Splitting { frozen, ctx } => match redo_lookup(&ctx.redo, key) {
                Some(Lookup::Found(v)) => Ok(Lookup::Found(v)),
                Some(Lookup::Missing) => Ok(Lookup::Missing),
                None => frozen.get(key),
            },
            Inner::Destroyed => Err(destroyed_err()),
        }
    }

    /// Inserts or overwrites `key` with `value`, triggering a
    /// background split once the meta arena no longer has room for the
    /// next node (spec §4.2 step 4: only meta-capacity pressure ever
    /// triggers a split, never live-entry count or data-file growth).
    ///
    /// # Errors
    ///
    /// Returns an error if the key is too long or the shard is
    /// corrupt/destroyed.
    pub fn put(&self, key: &[u8], value: u64) -> Result<()> {
        let mut guard = self.inner.write();
        if self.ensure_drained(&mut guard)? {
            return self.finish_split_with(&mut guard, |left, right| {
                let mut rng = rand::thread_rng();
                pick_child(left, right, key)?.put_unconditional(key, value, &mut rng)
            });
        }
        match &mut *guard {
            Inner::Normal(sl) => {
                let mut rng = rand::thread_rng();
                match sl.put(key, value, &mut rng, false)? {
                    PutOutcome::Applied => Ok(()),
                    PutOutcome::NeedsSplit => {
                        self.begin_split(&mut guard)?;
                        if let Inner::Splitting { ctx, .. } = &mut *guard {
                            ctx.redo.put(key, value)?;
                        }
                        Ok(())
                    }
                }
            }
            Inner::Spliter(sl) => {
                let mut rng = rand::thread_rng();
                sl.put_unconditional(key, value, &mut rng)
            }
            Inner::Splitting { ctx, .. } => ctx.redo.put(key, value),
            Inner::Destroyed => Err(destroyed_err()),
        }
    }

    /// Deletes `key`. Idempotent: deleting an already-absent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is corrupt/destroyed.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.inner.write();
        if self.ensure_drained(&mut guard)? {
            return self.finish_split_with(&mut guard, |left, right| pick_child(left, right, key)?.del(key));
        }
        match &mut *guard {
            Inner::Normal(sl) | Inner::Spliter(sl) => sl.del(key),
            Inner::Splitting { ctx, .. } => ctx.redo.delput(key),
            Inner::Destroyed => Err(destroyed_err()),
        }
    }

    /// The greatest live key in the shard, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is corrupt/destroyed.
    pub fn max_key(&self) -> Result<Option<Vec<u8>>> {
        let mut guard = self.inner.write();
        if self.ensure_drained(&mut guard)? {
            return self.finish_split_with(&mut guard, |left, right| {
                let l = left.max_key()?;
                let r = right.max_key()?;
                Ok(combine_max(l, r))
            });
        }
        match &*guard {
            Inner::Normal(sl) | Inner::Spliter(sl) => sl.max_key(),
            Inner::Splitting { frozen, ctx } => {
                // `frozen` never receives new writes once split starts, so
                // its max key at freeze time is still valid unless the
                // redo log has since recorded a greater live put.
                Ok(combine_max(frozen.max_key()?, ctx.redo.max_key()))
            }
            Inner::Destroyed => Err(destroyed_err()),
        }
    }

    /// Flushes the shard's arenas (and redo log, while splitting) to
    /// disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any underlying flush fails.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.inner.write();
        match &mut *guard {
            Inner::Normal(sl) | Inner::Spliter(sl) => sl.sync(),
            Inner::Splitting { frozen, ctx } => {
                frozen.sync()?;
                ctx.redo.sync()
            }
            Inner::Destroyed => Ok(()),
        }
    }

    /// Closes the shard (spec §4.5): joins a running splitter (blocking
    /// until the bulk copy finishes, per §8 boundary property 3), syncs
    /// its arenas, and removes its own files only if it holds no live
    /// entries (spec §3.7: a shard emptied by deletions is considered
    /// destroyed). If a split had finished but not yet been adopted,
    /// closing finishes that adoption instead — there is no triggering
    /// key to route, so only the Router notification and the rename/
    /// destroy steps run.
    ///
    /// # Errors
    ///
    /// Returns an error if the splitter panicked, the Router rejects
    /// adoption, or a filesystem operation fails.
    pub fn close(&self) -> Result<()> {
        self.close_impl(false)
    }

    /// Destroys the shard (spec §4.5): same as [`close`](Self::close),
    /// but always removes its files regardless of live entry count.
    ///
    /// # Errors
    ///
    /// See [`close`](Self::close).
    pub fn destroy(&self) -> Result<()> {
        self.close_impl(true)
    }

    fn close_impl(&self, always_remove: bool) -> Result<()> {
        let mut guard = self.inner.write();
        if self.ensure_drained_blocking(&mut guard)? {
            let Inner::Splitting { ctx, .. } = &mut *guard else {
                return Err(Error::InvalidState("close: expected a drained split".into()));
            };
            let Some(ready) = ctx.ready.take() else {
                return Err(Error::InvalidState("close: expected a drained split".into()));
            };
            self.adopt(&ready)?;
            *guard = Inner::Destroyed;
            return Ok(());
        }

        match &mut *guard {
            Inner::Normal(sl) | Inner::Spliter(sl) => {
                sl.sync()?;
                if always_remove || sl.count() == 0 {
                    let _ = std::fs::remove_file(&self.names.meta);
                    let _ = std::fs::remove_file(&self.names.data);
                }
            }
            Inner::Splitting { .. } => {
                unreachable!("ensure_drained_blocking always resolves a split to ready")
            }
            Inner::Destroyed => {}
        }
        *guard = Inner::Destroyed;
        Ok(())
    }

    /// Begins a background split. Caller must already hold the write
    /// lock and the shard must be `Normal`. All fallible setup runs
    /// before the shard commits to the `Splitting` state, so a failure
    /// here leaves the shard `Normal` rather than permanently
    /// `Destroyed`.
    fn begin_split(&self, guard: &mut Inner) -> Result<()> {
        let Inner::Normal(sl) = guard else {
            return Ok(());
        };
        let entries = sl.iter_entries()?;
        sl.sync()?;
        let redo = FileRedoLog::create(&self.names.redo)?;

        let Inner::Normal(sl) = std::mem::replace(guard, Inner::Destroyed) else {
            unreachable!()
        };

        let left_names = Names::new(&self.names.left_prefix);
        let right_names = Names::new(&self.names.right_prefix);
        let config = self.config;
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let outcome = run_bulk_copy(&left_names, &right_names, &config, entries);
            let _ = tx.send(outcome);
        });

        *guard = Inner::Splitting {
            frozen: sl,
            ctx: Splitting {
                redo,
                rx,
                handle: Some(handle),
                ready: None,
            },
        };
        Ok(())
    }

    /// Non-blocking: reaps the background splitter's result if it has
    /// arrived and, the first time it does, drains the redo log against
    /// it. Returns `true` once the shard has a drained, ready-to-adopt
    /// split (whether just drained here or already ready from a prior
    /// call or from crash recovery).
    fn ensure_drained(&self, guard: &mut Inner) -> Result<bool> {
        let Inner::Splitting { ctx, .. } = guard else {
            return Ok(false);
        };
        if ctx.ready.is_some() {
            return Ok(true);
        }
        let bulk = match ctx.rx.try_recv() {
            Ok(Ok(bulk)) => bulk,
            Ok(Err(e)) => return Err(e),
            Err(mpsc::TryRecvError::Empty) => return Ok(false),
            Err(mpsc::TryRecvError::Disconnected) => {
                return Err(Error::Splitter("coordinator thread vanished".into()))
            }
        };
        if let Some(handle) = ctx.handle.take() {
            let _ = handle.join();
        }
        self.drain_into_ready(guard, bulk)?;
        Ok(true)
    }

    /// Blocking variant of [`ensure_drained`](Self::ensure_drained):
    /// joins the splitter thread if one is still running instead of
    /// giving up when the channel is momentarily empty. Used by
    /// `close`/`destroy`, which must not return while a splitter could
    /// still be mutating files this shard is about to remove.
    fn ensure_drained_blocking(&self, guard: &mut Inner) -> Result<bool> {
        let Inner::Splitting { ctx, .. } = guard else {
            return Ok(false);
        };
        if ctx.ready.is_some() {
            return Ok(true);
        }
        if let Some(handle) = ctx.handle.take() {
            handle
                .join()
                .map_err(|_| Error::Splitter("splitter thread panicked".into()))?;
        }
        let bulk = {
            let Inner::Splitting { ctx, .. } = guard else {
                unreachable!()
            };
            match ctx.rx.recv() {
                Ok(Ok(bulk)) => bulk,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::Splitter("coordinator thread vanished".into())),
            }
        };
        self.drain_into_ready(guard, bulk)?;
        Ok(true)
    }

    /// Drains the redo log into a just-finished bulk copy and stashes
    /// the result as `ready`. The parent's own arenas aren't touched
    /// here — only its `max_key`, needed for the Router notification.
    fn drain_into_ready(&self, guard: &mut Inner, bulk: BulkCopyResult) -> Result<()> {
        let Inner::Splitting { frozen, ctx } = guard else {
            unreachable!()
        };
        let BulkCopyResult {
            mut left,
            mut right,
            left_names,
            right_names,
        } = bulk;
        let drain_entries = ctx.redo.iterate();
        let mut rng = StdRng::seed_from_u64(3);
        split::drain_redo(&drain_entries, &mut left, &mut right, &mut rng)?;
        left.sync()?;
        right.sync()?;
        let old_max_key = frozen.max_key()?.ok_or_else(|| {
            Error::CorruptShard(
                self.names.prefix.display().to_string(),
                "split parent has no max key".into(),
            )
        })?;
        ctx.ready = Some(ReadyChildren {
            left,
            right,
            left_names,
            right_names,
            old_max_key,
        });
        Ok(())
    }

    /// Finalizes a ready split (spec §4.4 Adoption): runs `op` against
    /// the live children first — this is the triggering call's "route
    /// its own operation into the appropriate child" step — then
    /// notifies the Router, promotes the children to permanent names,
    /// and destroys this shard's own files. Returns `op`'s own result.
    ///
    /// If `op` fails, the children are put back so the next caller gets
    /// another chance at adoption instead of losing them.
    fn finish_split_with<T>(
        &self,
        guard: &mut Inner,
        op: impl FnOnce(&mut Skiplist, &mut Skiplist) -> Result<T>,
    ) -> Result<T> {
        let Inner::Splitting { ctx, .. } = guard else {
            return Err(Error::InvalidState("finish_split_with requires a splitting shard".into()));
        };
        let Some(mut ready) = ctx.ready.take() else {
            return Err(Error::InvalidState("finish_split_with requires a drained split".into()));
        };
        match op(&mut ready.left, &mut ready.right) {
            Ok(value) => {
                self.adopt(&ready)?;
                *guard = Inner::Destroyed;
                Ok(value)
            }
            Err(e) => {
                if let Inner::Splitting { ctx, .. } = guard {
                    ctx.ready = Some(ready);
                }
                Err(e)
            }
        }
    }

    fn adopt(&self, ready: &ReadyChildren) -> Result<()> {
        let left_final = self.router.next_filename();
        let right_final = self.router.next_filename();
        rename_pair(&ready.left_names, std::path::Path::new(&left_final))?;
        rename_pair(&ready.right_names, std::path::Path::new(&right_final))?;

        let left_max = ready.left.max_key()?.unwrap_or_default();
        let right_max = ready.right.max_key()?.unwrap_or_default();
        self.router
            .on_split(&ready.old_max_key, &left_final, &left_max, &right_final, &right_max)
            .map_err(|e| Error::Router(e.to_string()))?;

        let _ = std::fs::remove_file(&self.names.meta);
        let _ = std::fs::remove_file(&self.names.data);
        let _ = std::fs::remove_file(&self.names.redo);
        tracing::debug!(
            prefix = %self.names.prefix.display(),
            left = %left_final,
            right = %right_final,
            "shard adopted children and destroyed itself"
        );
        Ok(())
    }
}

/// Picks whichever child owns `key`: at or below the left child's tail
/// goes left, everything else (including an empty left child) goes
/// right — the same pivot rule the redo drain uses (`split.rs`).
fn pick_child<'a>(left: &'a mut Skiplist, right: &'a mut Skiplist, key: &[u8]) -> Result<&'a mut Skiplist> {
    match left.max_key()? {
        Some(pivot) if key <= pivot.as_slice() => Ok(left),
        _ => Ok(right),
    }
}

fn combine_max(a: Option<Vec<u8>>, b: Option<Vec<u8>>) -> Option<Vec<u8>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a >= b { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn rename_pair(from: &Names, to_prefix: &std::path::Path) -> Result<()> {
    let to = Names::new(to_prefix);
    std::fs::rename(&from.meta, &to.meta)?;
    std::fs::rename(&from.data, &to.data)?;
    Ok(())
}

fn redo_lookup(redo: &FileRedoLog, key: &[u8]) -> Option<Lookup> {
    for entry in redo.iterate() {
        match entry {
            RedoEntry::Put(k, v) if k == key => return Some(Lookup::Found(v)),
            RedoEntry::Del(k) if k == key => return Some(Lookup::Missing),
            _ => {}
        }
    }
    None
}

fn destroyed_err() -> Error {
    Error::InvalidState("shard destroyed after split adoption; resolve key via Router".into())
}

/// Phase 1 of a split: partition the parent's snapshotted entries and
/// bulk-populate two fresh children. Runs entirely off the parent's
/// lock; the redo drain that finishes the split happens back on the
/// foreground side, in `Shard::ensure_drained`/`ensure_drained_blocking`.
fn run_bulk_copy(
    left_names: &Names,
    right_names: &Names,
    config: &ShardConfig,
    entries: Vec<(Vec<u8>, u64)>,
) -> Result<BulkCopyResult> {
    let partition = split::partition(entries);
    let left = split::bulk_populate(&left_names.meta, &left_names.data, config, &partition.left, 1)?;
    let right = split::bulk_populate(&right_names.meta, &right_names.data, config, &partition.right, 2)?;
    left.sync()?;
    right.sync()?;
    Ok(BulkCopyResult {
        left,
        right,
        left_names: left_names.clone(),
        right_names: right_names.clone(),
    })
}
