// SPDX-License-Identifier: MPL-2.0

//! Output naming and file writing for captured images

use crate::constants::{DEFAULT_FILE_PREFIX, PICTURES_SUBDIR};
use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Timestamp used in file names and log records, millisecond precision
///
/// Format: `YYYYMMDDHHMMSS.mmm` in local time.
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S%.3f").to_string()
}

/// Default output directory: `~/Pictures/stillcam`, falling back to home or cwd
pub fn default_photo_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(PICTURES_SUBDIR)
}

/// Where output images go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputNaming {
    /// Always the same file; later frames overwrite earlier ones
    Fixed(PathBuf),
    /// `<dir>/<prefix>_<timestamp>_<index>.<ext>`, one new file per frame
    Timestamped { dir: PathBuf, prefix: String },
}

impl OutputNaming {
    pub fn timestamped(dir: impl Into<PathBuf>) -> Self {
        OutputNaming::Timestamped {
            dir: dir.into(),
            prefix: DEFAULT_FILE_PREFIX.to_string(),
        }
    }

    /// Path for output number `index`
    ///
    /// A fixed path keeps its own extension when it has one.
    pub fn path_for(&self, index: u64, extension: &str) -> PathBuf {
        match self {
            OutputNaming::Fixed(path) => {
                if path.extension().is_some() {
                    path.clone()
                } else {
                    path.with_extension(extension)
                }
            }
            OutputNaming::Timestamped { dir, prefix } => {
                dir.join(format!("{}_{}_{:03}.{}", prefix, timestamp(), index, extension))
            }
        }
    }

    /// Directory the files end up in
    pub fn directory(&self) -> PathBuf {
        match self {
            OutputNaming::Fixed(path) => path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            OutputNaming::Timestamped { dir, .. } => dir.clone(),
        }
    }
}

/// Hands out output paths with a monotonically increasing index
///
/// Safe to share between the capture thread and the driver's event thread.
#[derive(Debug)]
pub struct OutputSequence {
    naming: OutputNaming,
    next_index: AtomicU64,
}

impl OutputSequence {
    pub fn new(naming: OutputNaming) -> Self {
        Self {
            naming,
            next_index: AtomicU64::new(0),
        }
    }

    pub fn next_path(&self, extension: &str) -> PathBuf {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.naming.path_for(index, extension)
    }

    pub fn naming(&self) -> &OutputNaming {
        &self.naming
    }
}

/// Write `data` to `path` without ever leaving a partial file there
///
/// Data goes to a hidden temporary sibling first, then replaces `path` by
/// rename. Missing parent directories are created.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let result = (|| {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&temp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result?;

    debug!(path = %path.display(), bytes = data.len(), "File written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stillcam-storage-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        // YYYYMMDDHHMMSS.mmm
        assert_eq!(ts.len(), 18);
        assert_eq!(&ts[14..15], ".");
        assert!(ts.chars().filter(|c| *c != '.').all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_fixed_naming_keeps_extension() {
        let naming = OutputNaming::Fixed(PathBuf::from("/tmp/out/captured_image.jpg"));
        assert_eq!(
            naming.path_for(3, "png"),
            PathBuf::from("/tmp/out/captured_image.jpg")
        );
        assert_eq!(naming.directory(), PathBuf::from("/tmp/out"));

        let bare = OutputNaming::Fixed(PathBuf::from("shot"));
        assert_eq!(bare.path_for(0, "png"), PathBuf::from("shot.png"));
        assert_eq!(bare.directory(), PathBuf::from("."));
    }

    #[test]
    fn test_sequence_indices_are_unique() {
        let sequence = OutputSequence::new(OutputNaming::timestamped("/tmp"));
        let first = sequence.next_path("jpg");
        let second = sequence.next_path("jpg");
        assert_ne!(first, second);
        assert!(first.to_string_lossy().ends_with("_000.jpg"));
        assert!(second.to_string_lossy().ends_with("_001.jpg"));
    }

    #[test]
    fn test_write_atomic_creates_parent_and_leaves_no_temp() {
        let dir = temp_dir();
        let path = dir.join("nested").join("image.jpg");
        write_atomic(&path, b"data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
