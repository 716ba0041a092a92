use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Parse an archive entry name into a relative path.
///
/// Backslashes count as separators. Empty names, absolute names, drive
/// prefixes and `..` segments are rejected.
pub(super) fn entry_rel_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return None;
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => relative.push(part),
        }
    }

    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// Tracks whether every entry shares one top-level directory.
#[derive(Default)]
pub(super) struct TopDirScan {
    candidate: Option<OsString>,
    nested: bool,
    mixed: bool,
}

impl TopDirScan {
    pub(super) fn observe(&mut self, relative: &Path) {
        if self.mixed {
            return;
        }
        let mut parts = relative.components();
        let Some(Component::Normal(first)) = parts.next() else {
            self.mixed = true;
            return;
        };
        if parts.next().is_some() {
            self.nested = true;
        }
        match &self.candidate {
            None => self.candidate = Some(first.to_os_string()),
            Some(existing) if existing == first => {}
            Some(_) => self.mixed = true,
        }
    }

    /// The shared directory, only if at least one entry lives below it.
    pub(super) fn finish(self) -> Option<OsString> {
        if self.mixed || !self.nested {
            None
        } else {
            self.candidate
        }
    }
}

/// Drop `top` from the front of `relative`. The top directory entry itself maps to `None`.
pub(super) fn strip_top_dir(relative: &Path, top: Option<&OsString>) -> Option<PathBuf> {
    let Some(top) = top else {
        return Some(relative.to_path_buf());
    };
    let stripped = relative.strip_prefix(top).ok()?;
    (!stripped.as_os_str().is_empty()).then(|| stripped.to_path_buf())
}

/// Lexically normalize, then canonicalize the deepest existing ancestor and
/// re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::Normal(segment) => normalized.push(segment),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::extraction(format!(
                        "path {} escapes the filesystem root",
                        path.display()
                    )));
                }
            }
        }
    }

    let mut existing = normalized.as_path();
    let mut missing: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut resolved) => {
                resolved.extend(missing.iter().rev());
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(name), Some(parent)) = (existing.file_name(), existing.parent()) else {
                    return Err(AppError::extraction(format!(
                        "no existing ancestor for {}",
                        normalized.display()
                    )));
                };
                missing.push(name);
                existing = parent;
            }
            Err(e) => {
                return Err(AppError::extraction(format!(
                    "failed to resolve {}: {}",
                    existing.display(),
                    e
                )));
            }
        }
    }
}

/// Resolve `path` (relative paths are taken from `base`) and require it to stay inside `base`.
pub(super) fn confine(base: &Path, path: &Path) -> Result<PathBuf> {
    let canonical_base = base.canonicalize().map_err(|e| {
        AppError::extraction(format!("failed to resolve {}: {}", base.display(), e))
    })?;
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        canonical_base.join(path)
    };
    let resolved = canonicalize_existing_prefix(&candidate)?;
    if !resolved.starts_with(&canonical_base) {
        return Err(AppError::extraction(format!(
            "entry {} resolves outside the destination",
            path.display()
        )));
    }
    Ok(resolved)
}

/// Link targets must be non-empty relative paths.
pub(super) fn check_link_target(target: &Path, what: &str) -> Result<()> {
    let text = target.to_string_lossy();
    if text.is_empty() {
        return Err(AppError::extraction(format!("{what} has an empty target")));
    }
    if target.is_absolute() || text.starts_with('/') || has_drive_prefix(&text) {
        return Err(AppError::extraction(format!(
            "{what} target {text} is absolute"
        )));
    }
    if target
        .components()
        .any(|c| matches!(c, Component::Prefix(_)))
    {
        return Err(AppError::extraction(format!(
            "{what} target {text} has a drive prefix"
        )));
    }
    Ok(())
}
