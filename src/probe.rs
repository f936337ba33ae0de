//! Path classification: missing, regular file, directory, or symlink.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::fs;

/// Outcome of probing one path.
///
/// `resolved` is `None` when the path does not exist ("skip"); `is_dir`
/// marks paths that are not hashable leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub resolved: Option<PathBuf>,
    pub is_dir: bool,
}

impl Probe {
    fn missing() -> Self {
        Probe { resolved: None, is_dir: false }
    }
}

/// Classify a path.
///
/// Symlinks are resolved one level: the link target is returned whether or
/// not it exists, and directory targets are flagged so they are not hashed.
/// Directory symlinks are never recursed into.
pub async fn probe(path: &Path) -> io::Result<Probe> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::missing()),
        Err(e) => return Err(e),
    };

    if meta.is_symlink() {
        let target = fs::read_link(path).await?;
        // A relative link target is relative to the link's directory.
        let target = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(Path::new("")).join(target)
        };
        let is_dir = match fs::metadata(&target).await {
            Ok(target_meta) => target_meta.is_dir(),
            Err(_) => false,
        };
        return Ok(Probe { resolved: Some(target), is_dir });
    }

    Ok(Probe {
        resolved: Some(path.to_path_buf()),
        is_dir: meta.is_dir(),
    })
}

/// Format a file's modification time for display in the given zone.
pub async fn mtime_display(path: &Path, tz: Tz) -> io::Result<String> {
    let mtime = fs::metadata(path).await?.modified()?;
    let utc: DateTime<Utc> = mtime.into();
    Ok(utc.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string())
}
