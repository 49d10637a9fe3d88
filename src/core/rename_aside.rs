//! Rename-based rollback anchor for the live data directory.
//!
//! Before a restore overwrites the data directory, the current one is renamed
//! to a sibling path. The rename is the only rollback anchor: `commit()` drops
//! the old copy once the new data is in place, `rollback()` puts it back. A
//! guard that is dropped without either rolls back, so an early return or a
//! panic in the restore path cannot leave the data directory missing.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const ASIDE_TAG: &str = "pre-restore";

#[derive(Debug)]
pub struct RenameAside {
    live: PathBuf,
    aside: Option<PathBuf>,
    armed: bool,
}

impl RenameAside {
    /// Move `live` out of the way if it exists. When it does not, the guard
    /// still tracks `live` so a failed restore removes whatever it left behind.
    pub fn set_aside(live: &Path) -> io::Result<Self> {
        let aside = if path_present(live) {
            let aside = unique_sibling(live)?;
            fs::rename(live, &aside)?;
            info!(live = %live.display(), aside = %aside.display(), "Moved data directory aside");
            Some(aside)
        } else {
            None
        };

        Ok(Self {
            live: live.to_path_buf(),
            aside,
            armed: true,
        })
    }

    pub fn aside_path(&self) -> Option<&Path> {
        self.aside.as_deref()
    }

    /// Keep the new data. Removing the old copy is best-effort.
    pub fn commit(mut self) {
        self.armed = false;
        if let Some(aside) = self.aside.take() {
            if let Err(e) = fs::remove_dir_all(&aside) {
                warn!(aside = %aside.display(), error = %e, "Failed to remove previous data directory");
            }
        }
    }

    /// Put the original data directory back, discarding any partial content
    /// at the live path.
    pub fn rollback(mut self) -> io::Result<()> {
        self.armed = false;
        self.restore()
    }

    fn restore(&mut self) -> io::Result<()> {
        if path_present(&self.live) {
            remove_path(&self.live)?;
        }
        if let Some(aside) = self.aside.take() {
            fs::rename(&aside, &self.live)?;
            info!(live = %self.live.display(), "Restored previous data directory");
        }
        Ok(())
    }
}

impl Drop for RenameAside {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            if let Err(e) = self.restore() {
                error!(live = %self.live.display(), error = %e, "Rollback of data directory failed");
            }
        }
    }
}

fn path_present(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = path.symlink_metadata()?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn unique_sibling(live: &Path) -> io::Result<PathBuf> {
    let name = live.file_name().ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("Data directory has no name: {}", live.display()),
        )
    })?;
    let name = name.to_string_lossy();

    let mut candidate = live.with_file_name(format!("{}.{}", name, ASIDE_TAG));
    let mut counter = 1;
    while path_present(&candidate) {
        candidate = live.with_file_name(format!("{}.{}-{}", name, ASIDE_TAG, counter));
        counter += 1;
    }
    Ok(candidate)
}
