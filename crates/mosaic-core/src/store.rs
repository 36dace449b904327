//! The chunked pixel store.
//!
//! The canvas lives in memory as a grid of fixed-size chunks, each behind its
//! own mutex. Reads and writes lock exactly one chunk, and only for the
//! in-memory byte update; serialization and disk I/O always operate on a
//! snapshot taken under the lock, never while holding it.
//!
//! In-memory state is the source of truth. Persistence is write-behind: a
//! write marks its chunk dirty and a background flusher calls
//! [`CanvasStore::snapshot_if_dirty`] + [`CanvasStore::persist`]. A failed
//! flush re-marks the chunk dirty so a later pass retries it.
//!
//! # Invariants
//!
//! - Pixel coordinates are bounds-checked with exclusive upper bounds before
//!   any chunk lock is taken.
//! - Every pixel byte in memory addresses a valid palette entry; corrupt
//!   files are replaced by blank chunks at load time, never loaded as-is.
//! - `(cx, cy) = (x / chunk_size, y / chunk_size)`; the in-chunk offset is
//!   `(x % chunk_size, y % chunk_size)`, row-major.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk;
use crate::fs_safe;

/// Errors raised by pixel reads and writes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanvasError {
    /// The coordinates fall outside the canvas.
    #[error("pixel ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// The color index does not address a palette entry.
    #[error("color index {index} is outside the palette (size {palette_len})")]
    InvalidColor { index: u8, palette_len: usize },
}

/// A point-in-time copy of one chunk, safe to serialize or render without
/// holding the chunk's lock.
#[derive(Debug, Clone)]
pub struct ChunkSnapshot {
    pub cx: u32,
    pub cy: u32,
    pub pixels: Box<[u8]>,
    /// Epoch seconds of the most recent write to this chunk.
    pub last_modified: i64,
}

struct ChunkSlot {
    pixels: Box<[u8]>,
    last_modified: i64,
    last_writer: Option<Uuid>,
    dirty: bool,
}

/// The canvas as a grid of independently locked chunks.
pub struct CanvasStore {
    width: u32,
    height: u32,
    chunk_size: u32,
    cols: u32,
    rows: u32,
    palette_len: usize,
    data_dir: PathBuf,
    chunks: Vec<Mutex<ChunkSlot>>,
}

impl CanvasStore {
    /// Creates the store, loading persisted chunk files from `data_dir`.
    ///
    /// Missing files produce blank chunks (palette index 0). Unreadable or
    /// corrupt files are logged and replaced by blank chunks; they never
    /// abort startup. Each existing file is first copied to a timestamped
    /// `.bck` sibling so a bad deploy can be rolled back by hand.
    ///
    /// `chunk_size` must divide `width` and `height`; configuration
    /// validation enforces this before the store is built.
    ///
    /// # Errors
    ///
    /// Returns an error only if the data directory itself cannot be created.
    pub fn load(
        width: u32,
        height: u32,
        chunk_size: u32,
        palette_len: usize,
        data_dir: &Path,
        now: i64,
    ) -> std::io::Result<Self> {
        debug_assert!(chunk_size > 0 && width % chunk_size == 0 && height % chunk_size == 0);
        fs_safe::ensure_dir(data_dir)?;

        let cols = width / chunk_size;
        let rows = height / chunk_size;
        let area = (chunk_size * chunk_size) as usize;

        let mut chunks = Vec::with_capacity((cols * rows) as usize);
        let mut loaded = 0usize;
        for cx in 0..cols {
            for cy in 0..rows {
                let path = chunk_file_path(data_dir, cx, cy);
                let slot = match load_chunk_file(&path, chunk_size, palette_len, now) {
                    Some((pixels, last_modified)) => {
                        loaded += 1;
                        ChunkSlot {
                            pixels,
                            last_modified,
                            last_writer: None,
                            dirty: false,
                        }
                    },
                    None => ChunkSlot {
                        pixels: vec![0u8; area].into_boxed_slice(),
                        last_modified: now,
                        last_writer: None,
                        dirty: false,
                    },
                };
                chunks.push(Mutex::new(slot));
            }
        }

        info!(
            width,
            height,
            chunk_size,
            loaded,
            total = chunks.len(),
            "canvas loaded"
        );

        Ok(Self {
            width,
            height,
            chunk_size,
            cols,
            rows,
            palette_len,
            data_dir: data_dir.to_path_buf(),
            chunks,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.cols
    }

    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    /// Reads the color index at `(x, y)`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` for coordinates outside the canvas.
    pub fn get(&self, x: u32, y: u32) -> Result<u8, CanvasError> {
        self.check_bounds(x, y)?;
        let (cx, cy) = (x / self.chunk_size, y / self.chunk_size);
        let (ix, iy) = (x % self.chunk_size, y % self.chunk_size);
        let slot = self.lock_slot(cx, cy);
        Ok(slot.pixels[(iy * self.chunk_size + ix) as usize])
    }

    /// Writes `color` at `(x, y)` and returns the previous color index.
    ///
    /// Updates the owning chunk's modification time and last writer, and
    /// marks it dirty for the background flusher. The chunk lock is held only
    /// for the byte update.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` or `InvalidColor` without touching any state.
    pub fn set(
        &self,
        x: u32,
        y: u32,
        color: u8,
        writer: Uuid,
        now: i64,
    ) -> Result<u8, CanvasError> {
        self.check_bounds(x, y)?;
        if (color as usize) >= self.palette_len {
            return Err(CanvasError::InvalidColor {
                index: color,
                palette_len: self.palette_len,
            });
        }

        let (cx, cy) = (x / self.chunk_size, y / self.chunk_size);
        let (ix, iy) = (x % self.chunk_size, y % self.chunk_size);
        let mut slot = self.lock_slot(cx, cy);
        let offset = (iy * self.chunk_size + ix) as usize;
        let previous = slot.pixels[offset];
        slot.pixels[offset] = color;
        slot.last_modified = now;
        slot.last_writer = Some(writer);
        slot.dirty = true;
        Ok(previous)
    }

    /// The identity that last wrote to the chunk containing `(x, y)`, if any
    /// write happened this process lifetime.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` for coordinates outside the canvas.
    pub fn last_writer(&self, x: u32, y: u32) -> Result<Option<Uuid>, CanvasError> {
        self.check_bounds(x, y)?;
        let (cx, cy) = (x / self.chunk_size, y / self.chunk_size);
        Ok(self.lock_slot(cx, cy).last_writer)
    }

    /// Takes a snapshot of chunk `(cx, cy)` and clears its dirty flag, or
    /// returns `None` if the chunk is clean.
    ///
    /// The flusher uses this for latest-wins semantics: whatever queue depth
    /// of notifications accumulated, the snapshot always reflects current
    /// state, so a stale write can never clobber a newer one on disk.
    #[must_use]
    pub fn snapshot_if_dirty(&self, cx: u32, cy: u32) -> Option<ChunkSnapshot> {
        let mut slot = self.lock_slot(cx, cy);
        if !slot.dirty {
            return None;
        }
        slot.dirty = false;
        Some(ChunkSnapshot {
            cx,
            cy,
            pixels: slot.pixels.clone(),
            last_modified: slot.last_modified,
        })
    }

    /// Takes an unconditional snapshot of chunk `(cx, cy)`.
    #[must_use]
    pub fn snapshot(&self, cx: u32, cy: u32) -> ChunkSnapshot {
        let slot = self.lock_slot(cx, cy);
        ChunkSnapshot {
            cx,
            cy,
            pixels: slot.pixels.clone(),
            last_modified: slot.last_modified,
        }
    }

    /// Re-marks a chunk dirty after a failed flush so the rescan pass
    /// retries it.
    pub fn mark_dirty(&self, cx: u32, cy: u32) {
        self.lock_slot(cx, cy).dirty = true;
    }

    /// Chunk coordinates of every currently dirty chunk.
    #[must_use]
    pub fn dirty_chunks(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for cx in 0..self.cols {
            for cy in 0..self.rows {
                if self.lock_slot(cx, cy).dirty {
                    out.push((cx, cy));
                }
            }
        }
        out
    }

    /// Serializes a snapshot and atomically replaces its chunk file.
    ///
    /// # Errors
    ///
    /// Returns an error on compression or I/O failure; the previous file, if
    /// any, stays intact.
    pub fn persist(&self, snapshot: &ChunkSnapshot) -> std::io::Result<()> {
        let compressed = chunk::encode(&snapshot.pixels, snapshot.last_modified)?;
        let path = chunk_file_path(&self.data_dir, snapshot.cx, snapshot.cy);
        fs_safe::atomic_write(&path, &compressed)?;
        debug!(
            cx = snapshot.cx,
            cy = snapshot.cy,
            bytes = compressed.len(),
            "chunk persisted"
        );
        Ok(())
    }

    fn check_bounds(&self, x: u32, y: u32) -> Result<(), CanvasError> {
        if x >= self.width || y >= self.height {
            return Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    fn lock_slot(&self, cx: u32, cy: u32) -> std::sync::MutexGuard<'_, ChunkSlot> {
        self.chunks[(cx * self.rows + cy) as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn chunk_file_path(data_dir: &Path, cx: u32, cy: u32) -> PathBuf {
    data_dir.join(format!("c_{cx}_{cy}.bin"))
}

fn load_chunk_file(
    path: &Path,
    chunk_size: u32,
    palette_len: usize,
    now: i64,
) -> Option<(Box<[u8]>, i64)> {
    if !path.exists() {
        return None;
    }

    let backup = path.with_extension(format!("bin.{now}.bck"));
    if let Err(e) = fs::copy(path, &backup) {
        warn!(path = %path.display(), error = %e, "chunk backup failed");
    }

    let compressed = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "chunk file unreadable, substituting blank chunk");
            return None;
        },
    };
    match chunk::decode(&compressed, chunk_size, palette_len, now) {
        Ok((pixels, last_modified)) => Some((pixels, last_modified)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt chunk file, substituting blank chunk");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const PALETTE_LEN: usize = 32;

    fn test_store(dir: &Path) -> CanvasStore {
        CanvasStore::load(256, 256, 128, PALETTE_LEN, dir, chunk::EPOCH_BASE + 1000).unwrap()
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let writer = Uuid::new_v4();

        let prev = store.set(10, 10, 5, writer, chunk::EPOCH_BASE + 1001).unwrap();
        assert_eq!(prev, 0);
        assert_eq!(store.get(10, 10).unwrap(), 5);
        assert_eq!(store.last_writer(10, 10).unwrap(), Some(writer));

        // Pixels land in the right chunk: (200, 30) is chunk (1, 0).
        store.set(200, 30, 9, writer, chunk::EPOCH_BASE + 1002).unwrap();
        assert_eq!(store.get(200, 30).unwrap(), 9);
        assert_eq!(store.get(200 - 128, 30).unwrap(), 0);
    }

    #[test]
    fn bounds_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        assert!(matches!(
            store.get(256, 0),
            Err(CanvasError::OutOfBounds { x: 256, .. })
        ));
        assert!(matches!(
            store.set(0, 256, 1, Uuid::new_v4(), 0),
            Err(CanvasError::OutOfBounds { y: 256, .. })
        ));
        assert!(store.get(255, 255).is_ok());
    }

    #[test]
    fn color_index_must_be_inside_palette() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let err = store
            .set(0, 0, PALETTE_LEN as u8, Uuid::new_v4(), 0)
            .unwrap_err();
        assert_eq!(
            err,
            CanvasError::InvalidColor {
                index: 32,
                palette_len: PALETTE_LEN
            }
        );
        // The failed write left no trace.
        assert_eq!(store.get(0, 0).unwrap(), 0);
    }

    #[test]
    fn persist_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let modified = chunk::EPOCH_BASE + 5000;
        {
            let store = test_store(dir.path());
            store.set(10, 10, 5, Uuid::new_v4(), modified).unwrap();
            store.set(130, 140, 17, Uuid::new_v4(), modified).unwrap();
            for (cx, cy) in store.dirty_chunks() {
                let snap = store.snapshot_if_dirty(cx, cy).unwrap();
                store.persist(&snap).unwrap();
            }
        }

        let reloaded = test_store(dir.path());
        assert_eq!(reloaded.get(10, 10).unwrap(), 5);
        assert_eq!(reloaded.get(130, 140).unwrap(), 17);
        assert_eq!(reloaded.snapshot(0, 0).last_modified, modified);
        assert_eq!(reloaded.snapshot(1, 1).last_modified, modified);
        // Untouched chunk keeps the load-time fallback.
        assert_eq!(
            reloaded.snapshot(0, 1).last_modified,
            chunk::EPOCH_BASE + 1000
        );
    }

    #[test]
    fn corrupt_file_falls_back_to_blank_chunk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("c_0_0.bin"), b"definitely not zlib").unwrap();

        let store = test_store(dir.path());
        assert_eq!(store.get(0, 0).unwrap(), 0);
        assert_eq!(store.get(127, 127).unwrap(), 0);
    }

    #[test]
    fn load_backs_up_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = test_store(dir.path());
            store.set(0, 0, 1, Uuid::new_v4(), chunk::EPOCH_BASE + 1).unwrap();
            let snap = store.snapshot_if_dirty(0, 0).unwrap();
            store.persist(&snap).unwrap();
        }
        let _ = test_store(dir.path());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bck"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn dirty_tracking_drives_flush_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        assert!(store.dirty_chunks().is_empty());
        assert!(store.snapshot_if_dirty(0, 0).is_none());

        store.set(1, 1, 2, Uuid::new_v4(), 0).unwrap();
        assert_eq!(store.dirty_chunks(), vec![(0, 0)]);

        let snap = store.snapshot_if_dirty(0, 0).unwrap();
        assert_eq!(snap.pixels[(1 * 128 + 1) as usize], 2);
        assert!(store.snapshot_if_dirty(0, 0).is_none());

        // A failed flush re-marks the chunk for the rescan pass.
        store.mark_dirty(0, 0);
        assert_eq!(store.dirty_chunks(), vec![(0, 0)]);
    }

    /// Two concurrent writers to the same pixel: exactly one color survives
    /// and no read ever observes a byte outside the palette.
    #[test]
    fn concurrent_same_pixel_writes_do_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(dir.path()));

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let writer = Uuid::new_v4();
                    for _ in 0..200 {
                        store.set(64, 64, i + 1, writer, i64::from(i)).unwrap();
                        let seen = store.get(64, 64).unwrap();
                        assert!((1..=8).contains(&seen), "saw corrupt byte {seen}");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let survivor = store.get(64, 64).unwrap();
        assert!((1..=8).contains(&survivor));
    }
}
