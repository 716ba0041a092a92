use std::ffi::OsString;
use std::fs;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{AppError, Result};

use super::path::{entry_rel_path, TopDirScan};
use super::unpack::{Placement, Unpacker};

fn open(archive_path: &Path) -> Result<tar::Archive<GzDecoder<fs::File>>> {
    let file = fs::File::open(archive_path).map_err(|e| {
        AppError::extraction(format!("failed to open {}: {}", archive_path.display(), e))
    })?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

fn tar_err(e: std::io::Error) -> AppError {
    AppError::extraction(format!("corrupt tar.gz archive: {e}"))
}

fn entry_name<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path().map_err(tar_err)?;
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::extraction(format!("entry path is not UTF-8: {path:?}")))
}

/// First pass over the stream: find the shared top-level directory.
fn scan_top_dir(archive_path: &Path) -> Result<Option<OsString>> {
    let mut archive = open(archive_path)?;
    let mut scan = TopDirScan::default();
    for entry in archive.entries().map_err(tar_err)? {
        let entry = entry.map_err(tar_err)?;
        if let Some(relative) = entry_rel_path(&entry_name(&entry)?) {
            scan.observe(&relative);
        }
    }
    Ok(scan.finish())
}

pub(super) fn extract(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let top_dir = scan_top_dir(archive_path)?;
    let mut unpacker = Unpacker::new(dest_dir, top_dir);

    let mut archive = open(archive_path)?;
    for entry in archive.entries().map_err(tar_err)? {
        let mut entry = entry.map_err(tar_err)?;
        let name = entry_name(&entry)?;
        let Placement::At(out) = unpacker.place(&name)? else {
            continue;
        };

        let kind = entry.header().entry_type();
        match kind {
            tar::EntryType::Symlink | tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(tar_err)?
                    .ok_or_else(|| AppError::extraction(format!("{name:?} has no link target")))?;
                if kind == tar::EntryType::Symlink {
                    unpacker.queue_symlink(out, &target)?;
                } else {
                    let target = target.to_str().ok_or_else(|| {
                        AppError::extraction(format!("link target of {name:?} is not UTF-8"))
                    })?;
                    unpacker.hard_link(out, target)?;
                }
            }
            _ if kind.is_dir() => unpacker.create_dir(&out)?,
            _ if kind.is_file() => {
                let mode = entry.header().mode().ok();
                let size = entry.header().size().map_err(tar_err)?;
                unpacker.write_file(out, &mut entry, mode, size)?;
            }
            // pax/gnu metadata records carry nothing to write
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => {}
            other => {
                return Err(AppError::extraction(format!(
                    "unsupported entry type {other:?} at {name:?}"
                )));
            }
        }
    }

    unpacker.finish()
}
