use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

struct QueuedLink {
    out: PathBuf,
    target: PathBuf,
    resolved: PathBuf,
}

/// Symlinks are deferred until all regular entries exist so Windows can
/// tell file links from directory links.
#[derive(Default)]
pub(super) struct PendingSymlinks {
    queue: Vec<QueuedLink>,
}

impl PendingSymlinks {
    pub(super) fn push(&mut self, out: PathBuf, target: PathBuf, resolved: PathBuf) {
        self.queue.push(QueuedLink {
            out,
            target,
            resolved,
        });
    }

    pub(super) fn create_all(self) -> Result<usize> {
        let count = self.queue.len();
        for link in self.queue {
            if let Some(parent) = link.out.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    AppError::extraction(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
            let target_is_dir = link.resolved.exists().then(|| link.resolved.is_dir());
            make_symlink(&link.target, &link.out, target_is_dir)?;
        }
        Ok(count)
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path, _target_is_dir: Option<bool>) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        AppError::extraction(format!("failed to create symlink {}: {}", link.display(), e))
    })
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path, target_is_dir: Option<bool>) -> Result<()> {
    let result = match target_is_dir {
        Some(true) => std::os::windows::fs::symlink_dir(target, link),
        Some(false) => std::os::windows::fs::symlink_file(target, link),
        None => {
            return Err(AppError::extraction(format!(
                "symlink {} points at an entry missing from the archive",
                link.display()
            )))
        }
    };
    result.map_err(|e| {
        AppError::extraction(format!("failed to create symlink {}: {}", link.display(), e))
    })
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_target: &Path, _link: &Path, _target_is_dir: Option<bool>) -> Result<()> {
    Err(AppError::extraction("symlinks are not supported on this platform"))
}

pub(super) fn hard_link_or_copy(source: &Path, link: &Path) -> Result<()> {
    if let Err(e) = fs::hard_link(source, link) {
        log::warn!("hard link {} failed ({}), copying instead", link.display(), e);
        fs::copy(source, link).map_err(|e| {
            AppError::extraction(format!(
                "failed to copy {} to {}: {}",
                source.display(),
                link.display(),
                e
            ))
        })?;
    }
    Ok(())
}
