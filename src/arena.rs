//! File-backed, growable memory-mapped arena.
//!
//! A thin wrapper around a single file and its `MmapMut`, used for both
//! the meta file and the data file. Growth is doubling-then-linear:
//! capacity doubles while it is below `growth_doubling_ceiling`, then
//! grows by fixed `growth_linear_step` increments.

use crate::error::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A growable mmap'd file.
///
/// Every method that can invalidate previously returned byte slices
/// takes `&mut self`; the shard's single `RwLock` is what makes that
/// borrow-checker guarantee line up with the actual concurrency model
/// (no raw pointers escape across a remap).
pub struct Arena {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    growth_doubling_ceiling: u64,
    growth_linear_step: u64,
}

impl Arena {
    /// Opens an existing arena file, mapping its current length.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(
        path: impl AsRef<Path>,
        growth_doubling_ceiling: u64,
        growth_linear_step: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path,
            file,
            mmap,
            growth_doubling_ceiling,
            growth_linear_step,
        })
    }

    /// Creates a new arena file of `initial_size` bytes and maps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, sized, or mapped.
    pub fn create(
        path: impl AsRef<Path>,
        initial_size: u64,
        growth_doubling_ceiling: u64,
        growth_linear_step: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(initial_size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path,
            file,
            mmap,
            growth_doubling_ceiling,
            growth_linear_step,
        })
    }

    /// Current mapped capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only view of the mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    /// Mutable view of the mapped bytes.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Grows the arena, if necessary, so that at least `needed` bytes
    /// are mapped. No-op if capacity already suffices.
    ///
    /// Growth is geometric (doubling) while the resulting capacity
    /// would stay under `growth_doubling_ceiling`, and linear (fixed
    /// `growth_linear_step` increments) beyond it, avoiding both the
    /// overhead of many tiny remaps early on and the waste of doubling
    /// an already-huge file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized or remapped.
    pub fn ensure_capacity(&mut self, needed: u64) -> Result<()> {
        let mut cap = self.capacity();
        if cap == 0 {
            cap = self.growth_linear_step.max(1);
        }
        while cap < needed {
            cap = if cap < self.growth_doubling_ceiling {
                cap.saturating_mul(2)
            } else {
                cap.saturating_add(self.growth_linear_step)
            };
        }
        if cap == self.capacity() {
            return Ok(());
        }
        tracing::debug!(
            path = %self.path.display(),
            old_capacity = self.capacity(),
            new_capacity = cap,
            "growing arena"
        );
        self.file.set_len(cap)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Flushes mapped pages to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `msync` fails.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(Error::Io)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(err) = self.mmap.flush() {
            tracing::warn!(path = %self.path.display(), %err, "arena flush on drop failed");
        }
    }
}
