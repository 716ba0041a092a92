use std::fs;
use std::io::Read as _;
use std::path::Path;

use crate::error::{AppError, Result};

use super::path::{entry_rel_path, TopDirScan};
use super::unpack::{Placement, Unpacker};

fn open(archive_path: &Path) -> Result<zip::ZipArchive<fs::File>> {
    let file = fs::File::open(archive_path).map_err(|e| {
        AppError::extraction(format!("failed to open {}: {}", archive_path.display(), e))
    })?;
    Ok(zip::ZipArchive::new(file)?)
}

pub(super) fn extract(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let mut archive = open(archive_path)?;

    let mut scan = TopDirScan::default();
    for name in archive.file_names() {
        if let Some(relative) = entry_rel_path(name) {
            scan.observe(&relative);
        }
    }
    let mut unpacker = Unpacker::new(dest_dir, scan.finish());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let Placement::At(out) = unpacker.place(&name)? else {
            continue;
        };

        if entry.is_symlink() {
            let mut target = String::new();
            entry.read_to_string(&mut target).map_err(|e| {
                AppError::extraction(format!("failed to read link target of {name:?}: {e}"))
            })?;
            unpacker.queue_symlink(out, Path::new(&target))?;
        } else if entry.is_dir() {
            unpacker.create_dir(&out)?;
        } else {
            let mode = entry.unix_mode();
            let size = entry.size();
            unpacker.write_file(out, &mut entry, mode, size)?;
        }
    }

    unpacker.finish()
}
