use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

use super::links::{hard_link_or_copy, PendingSymlinks};
use super::path::{check_link_target, confine, entry_rel_path, strip_top_dir};

/// Where an entry lands, or why it is skipped.
pub(super) enum Placement {
    Skip,
    At(PathBuf),
}

/// Shared extraction state for one archive.
pub(super) struct Unpacker<'a> {
    dest: &'a Path,
    top_dir: Option<OsString>,
    written: HashSet<PathBuf>,
    symlinks: PendingSymlinks,
}

impl<'a> Unpacker<'a> {
    pub(super) fn new(dest: &'a Path, top_dir: Option<OsString>) -> Self {
        Self {
            dest,
            top_dir,
            written: HashSet::new(),
            symlinks: PendingSymlinks::default(),
        }
    }

    /// Map a raw entry name to its confined output path.
    pub(super) fn place(&self, raw: &str) -> Result<Placement> {
        let relative = entry_rel_path(raw)
            .ok_or_else(|| AppError::extraction(format!("unsafe entry path {raw:?}")))?;
        match strip_top_dir(&relative, self.top_dir.as_ref()) {
            None => Ok(Placement::Skip),
            Some(stripped) => Ok(Placement::At(confine(self.dest, &stripped)?)),
        }
    }

    pub(super) fn create_dir(&self, out: &Path) -> Result<()> {
        fs::create_dir_all(out)
            .map_err(|e| AppError::extraction(format!("failed to create {}: {}", out.display(), e)))
    }

    pub(super) fn write_file<R: io::Read>(
        &mut self,
        out: PathBuf,
        reader: &mut R,
        mode: Option<u32>,
        declared_size: u64,
    ) -> Result<()> {
        if let Some(parent) = out.parent() {
            self.create_dir(parent)?;
        }
        let mut file = fs::File::create(&out).map_err(|e| {
            AppError::extraction(format!("failed to create {}: {}", out.display(), e))
        })?;
        let written = io::copy(reader, &mut file).map_err(|e| {
            AppError::extraction(format!("failed to write {}: {}", out.display(), e))
        })?;
        if written != declared_size {
            return Err(AppError::extraction(format!(
                "{} is truncated: expected {} bytes, got {}",
                out.display(),
                declared_size,
                written
            )));
        }
        apply_mode(&out, mode)?;
        self.written.insert(out);
        Ok(())
    }

    pub(super) fn queue_symlink(&mut self, out: PathBuf, target: &Path) -> Result<()> {
        check_link_target(target, "symlink")?;
        let parent = out
            .parent()
            .ok_or_else(|| AppError::extraction("symlink has no parent directory"))?;
        let resolved = confine(self.dest, &parent.join(target))?;
        self.symlinks.push(out, target.to_path_buf(), resolved);
        Ok(())
    }

    /// Hard links may only point at files already written from this archive.
    pub(super) fn hard_link(&mut self, out: PathBuf, target_name: &str) -> Result<()> {
        let target = Path::new(target_name);
        check_link_target(target, "hard link")?;

        let mut candidates = Vec::with_capacity(2);
        if let Ok(Placement::At(mapped)) = self.place(target_name) {
            candidates.push(mapped);
        }
        if let Some(parent) = out.parent() {
            candidates.push(confine(self.dest, &parent.join(target))?);
        }
        let source = candidates
            .into_iter()
            .find(|c| self.written.contains(c))
            .ok_or_else(|| {
                AppError::extraction(format!(
                    "hard link target {target_name:?} was not extracted before the link"
                ))
        })?;

        if let Some(parent) = out.parent() {
            self.create_dir(parent)?;
        }
        hard_link_or_copy(&source, &out)?;
        self.written.insert(out);
        Ok(())
    }

    /// Create queued symlinks and report how many files were written.
    pub(super) fn finish(self) -> Result<usize> {
        let links = self.symlinks.create_all()?;
        Ok(self.written.len() + links)
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)).map_err(|e| {
            AppError::extraction(format!(
                "failed to set permissions on {}: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
