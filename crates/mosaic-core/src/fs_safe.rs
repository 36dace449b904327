//! Atomic file replacement primitives.
//!
//! Chunk files and rendered images are replaced, never appended: a reader
//! must observe either the old or the new content, not a torn write.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Writes `bytes` to `path` atomically via temp-file-then-rename.
///
/// The temp file is created in the destination's parent directory with a
/// random name (`O_EXCL` semantics), synced, then renamed over `path`. A
/// pre-existing symlink at `path` is refused.
///
/// # Errors
///
/// Returns an error on any I/O failure; the destination is left untouched.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if path.is_symlink() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to replace symlink {}", path.display()),
        ));
    }
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.as_file_mut().write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Creates `dir` and its parents if missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}
