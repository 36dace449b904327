//! Chunk snapshot rendering and the published manifest.
//!
//! Clients poll a manifest: one image filename per chunk, where the filename
//! encodes the chunk's modification time (`c_{t}_{cx}-{cy}.png`). Diffing two
//! manifests tells a client exactly which chunks to refetch, and the
//! versioned filenames make the images independently and indefinitely
//! cacheable over plain HTTP.
//!
//! The manifest itself is copy-on-write: publishing swaps in a freshly built
//! immutable list, so readers never block on publishers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use image::{ExtendedColorType, ImageEncoder};
use image::codecs::png::PngEncoder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs_safe;
use crate::palette::Palette;
use crate::store::ChunkSnapshot;

/// Errors raised while publishing a chunk image.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// PNG encoding failed.
    #[error("failed to encode chunk image: {0}")]
    Encode(#[from] image::ImageError),

    /// The image file could not be written.
    #[error("failed to write chunk image: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders dirty chunks to versioned PNG files and maintains the manifest.
pub struct SnapshotPublisher {
    images_dir: PathBuf,
    palette: Palette,
    chunk_size: u32,
    cols: u32,
    rows: u32,
    /// Modification time currently published per chunk; drives filenames.
    published: Mutex<Vec<i64>>,
    manifest: RwLock<Arc<Vec<String>>>,
}

impl SnapshotPublisher {
    /// Creates the publisher and its image directory.
    ///
    /// Every chunk starts published at `now`; callers publish real content
    /// per chunk right after construction so the manifest never references
    /// images from a previous process life.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be created.
    pub fn new(
        images_dir: &Path,
        palette: Palette,
        chunk_size: u32,
        cols: u32,
        rows: u32,
        now: i64,
    ) -> std::io::Result<Self> {
        fs_safe::ensure_dir(images_dir)?;
        let published = vec![now; (cols * rows) as usize];
        let manifest = build_manifest(&published, cols, rows);
        Ok(Self {
            images_dir: images_dir.to_path_buf(),
            palette,
            chunk_size,
            cols,
            rows,
            published: Mutex::new(published),
            manifest: RwLock::new(Arc::new(manifest)),
        })
    }

    /// Renders a chunk snapshot to its versioned image file and republishes
    /// the manifest.
    ///
    /// Returns the published filename. Publishing the same snapshot twice is
    /// idempotent: the filename is derived from the snapshot's modification
    /// time, not the wall clock.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the file write fails; the manifest
    /// keeps its previous entry for the chunk in that case.
    pub fn publish(&self, snapshot: &ChunkSnapshot) -> Result<String, SnapshotError> {
        let size = self.chunk_size;
        let mut rgb = Vec::with_capacity((size * size * 3) as usize);
        for &index in snapshot.pixels.iter() {
            // The store only admits palette-valid bytes; fall back to black
            // rather than panicking if that ever breaks.
            let [r, g, b] = self.palette.rgb(index).unwrap_or([0, 0, 0]);
            rgb.extend_from_slice(&[r, g, b]);
        }

        let mut encoded = Vec::new();
        PngEncoder::new(&mut encoded).write_image(&rgb, size, size, ExtendedColorType::Rgb8)?;

        let name = image_name(snapshot.last_modified, snapshot.cx, snapshot.cy);
        fs_safe::atomic_write(&self.images_dir.join(&name), &encoded)?;

        let manifest = {
            let mut published = self
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            published[(snapshot.cx * self.rows + snapshot.cy) as usize] = snapshot.last_modified;
            build_manifest(&published, self.cols, self.rows)
        };
        *self
            .manifest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(manifest);

        debug!(cx = snapshot.cx, cy = snapshot.cy, name, "chunk image published");
        Ok(name)
    }

    /// The current manifest: one filename per chunk, ordered column-major.
    ///
    /// This is a cheap atomic handle clone; the list itself is immutable.
    #[must_use]
    pub fn manifest(&self) -> Arc<Vec<String>> {
        Arc::clone(
            &self
                .manifest
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Deletes image files older than `max_age` that the current manifest no
    /// longer references. Returns how many files were removed.
    ///
    /// Superseded images are kept around for a while on purpose: clients
    /// holding a stale manifest can still fetch them.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be listed; individual
    /// file failures are logged and skipped.
    pub fn sweep(&self, max_age: Duration) -> std::io::Result<usize> {
        let manifest = self.manifest();
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.images_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "unreadable image directory entry");
                    continue;
                },
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".png") || manifest.iter().any(|m| m == &name) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| modified <= cutoff)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(name, error = %e, "stale image removal failed"),
            }
        }
        if removed > 0 {
            debug!(removed, "stale chunk images swept");
        }
        Ok(removed)
    }
}

/// Filename for a chunk image: modification time and chunk coordinates.
#[must_use]
pub fn image_name(modified: i64, cx: u32, cy: u32) -> String {
    format!("c_{modified}_{cx}-{cy}.png")
}

fn build_manifest(published: &[i64], cols: u32, rows: u32) -> Vec<String> {
    let mut manifest = Vec::with_capacity(published.len());
    for cx in 0..cols {
        for cy in 0..rows {
            manifest.push(image_name(published[(cx * rows + cy) as usize], cx, cy));
        }
    }
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u32 = 8;

    fn snapshot_with(cx: u32, cy: u32, modified: i64, color: u8) -> ChunkSnapshot {
        ChunkSnapshot {
            cx,
            cy,
            pixels: vec![color; (SIZE * SIZE) as usize].into_boxed_slice(),
            last_modified: modified,
        }
    }

    fn publisher(dir: &Path) -> SnapshotPublisher {
        SnapshotPublisher::new(dir, Palette::default(), SIZE, 2, 2, 100).unwrap()
    }

    #[test]
    fn publish_writes_versioned_png_with_palette_colors() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());

        let name = publisher.publish(&snapshot_with(0, 1, 12345, 29)).unwrap();
        assert_eq!(name, "c_12345_0-1.png");

        let bytes = std::fs::read(dir.path().join(&name)).unwrap();
        let img = image::load_from_memory(&bytes).unwrap().into_rgb8();
        assert_eq!(img.dimensions(), (SIZE, SIZE));
        // Index 29 is #ff4500.
        assert_eq!(img.get_pixel(3, 3).0, [0xff, 0x45, 0x00]);
    }

    #[test]
    fn manifest_changes_iff_chunk_mutated() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());

        let before = publisher.manifest();
        assert_eq!(before.len(), 4);

        // Re-reading without publishing yields the identical list.
        assert!(Arc::ptr_eq(&before, &publisher.manifest()));

        publisher.publish(&snapshot_with(1, 0, 777, 3)).unwrap();
        let after = publisher.manifest();
        assert_eq!(after[2], "c_777_1-0.png");
        // Only the mutated chunk's entry changed.
        assert_eq!(before[0], after[0]);
        assert_eq!(before[1], after[1]);
        assert_eq!(before[3], after[3]);
        assert_ne!(before[2], after[2]);

        // Republishing the same snapshot leaves the manifest unchanged.
        publisher.publish(&snapshot_with(1, 0, 777, 3)).unwrap();
        assert_eq!(*publisher.manifest(), *after);
    }

    #[test]
    fn manifest_order_is_column_major() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());
        let manifest = publisher.manifest();
        assert_eq!(manifest[0], "c_100_0-0.png");
        assert_eq!(manifest[1], "c_100_0-1.png");
        assert_eq!(manifest[2], "c_100_1-0.png");
        assert_eq!(manifest[3], "c_100_1-1.png");
    }

    #[test]
    fn sweep_removes_only_unreferenced_files() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path());

        publisher.publish(&snapshot_with(0, 0, 200, 1)).unwrap();
        // Supersede it; the old file stays on disk but leaves the manifest.
        publisher.publish(&snapshot_with(0, 0, 300, 2)).unwrap();
        assert!(dir.path().join("c_200_0-0.png").exists());

        let removed = publisher.sweep(Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("c_200_0-0.png").exists());
        assert!(dir.path().join("c_300_0-0.png").exists());
    }
}
