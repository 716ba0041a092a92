//! Safe extraction of downloaded runtime archives.
//!
//! Entry paths are confined to the destination, a single common top-level
//! directory is stripped, and symlinks are created only after every regular
//! entry has been written and their targets validated.

mod links;
mod path;
mod tar_gz;
mod unpack;
mod zip_archive;

use std::path::Path;

use crate::error::{AppError, Result};

/// Archive container formats found in the runtime manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from a URL or file name suffix.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name
            .split(['?', '#'])
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

/// Extract `archive_path` into `dest_dir`, returning the number of files written.
pub fn extract_archive(
    archive_path: &Path,
    format: ArchiveFormat,
    dest_dir: &Path,
) -> Result<usize> {
    std::fs::create_dir_all(dest_dir).map_err(|e| {
        AppError::extraction(format!("failed to create {}: {}", dest_dir.display(), e))
    })?;
    log::debug!(
        "Extracting {} ({:?}) into {}",
        archive_path.display(),
        format,
        dest_dir.display()
    );
    match format {
        ArchiveFormat::Zip => zip_archive::extract(archive_path, dest_dir),
        ArchiveFormat::TarGz => tar_gz::extract(archive_path, dest_dir),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write as _;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;
    use crate::error::ErrorKind;

    fn tar_gz_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn format_from_url() {
        assert_eq!(
            ArchiveFormat::from_name("https://x/caddy_2.8_linux_amd64.tar.gz"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_name("https://x/php-8.3.zip?sig=abc"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(ArchiveFormat::from_name("pkg.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("pkg.7z"), None);
    }

    #[test]
    fn tar_gz_strips_common_top_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("php.tar.gz");
        fs::write(
            &archive,
            tar_gz_with(&[
                ("php-8.3.0/php-cgi", b"#!cgi"),
                ("php-8.3.0/ext/curl.so", b"so"),
            ]),
        )
        .unwrap();

        let dest = tmp.path().join("out");
        let count = extract_archive(&archive, ArchiveFormat::TarGz, &dest).unwrap();
        assert_eq!(count, 2);
        assert_eq!(fs::read(dest.join("php-cgi")).unwrap(), b"#!cgi");
        assert!(dest.join("ext").join("curl.so").is_file());
    }

    #[test]
    fn zip_without_common_dir_is_kept_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("caddy.zip");
        fs::write(
            &archive,
            zip_with(&[("caddy.exe", b"bin"), ("LICENSE", b"text")]),
        )
        .unwrap();

        let dest = tmp.path().join("out");
        extract_archive(&archive, ArchiveFormat::Zip, &dest).unwrap();
        assert!(dest.join("caddy.exe").is_file());
        assert!(dest.join("LICENSE").is_file());
    }

    #[test]
    fn zip_traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("evil.zip");
        fs::write(&archive, zip_with(&[("../escape.txt", b"x")])).unwrap();

        let err = extract_archive(&archive, ArchiveFormat::Zip, &tmp.path().join("out"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn corrupt_archive_is_extraction_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("broken.tar.gz");
        fs::write(&archive, b"not a gzip stream").unwrap();

        let err = extract_archive(&archive, ArchiveFormat::TarGz, &tmp.path().join("out"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }

    #[cfg(unix)]
    #[test]
    fn tar_symlink_inside_tree_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "mariadb/bin/mariadbd", &b"bin"[..])
            .unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        builder
            .append_link(&mut link, "mariadb/bin/mysqld", "mariadbd")
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let archive = tmp.path().join("mariadb.tar.gz");
        fs::write(&archive, bytes).unwrap();
        let dest = tmp.path().join("out");
        extract_archive(&archive, ArchiveFormat::TarGz, &dest).unwrap();

        let link_path = dest.join("bin").join("mysqld");
        assert!(fs::symlink_metadata(&link_path).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(link_path).unwrap(), b"bin");
    }

    #[cfg(unix)]
    #[test]
    fn tar_symlink_escaping_tree_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        builder
            .append_link(&mut link, "pkg/passwd", "../../../etc/passwd")
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let archive = tmp.path().join("evil.tar.gz");
        fs::write(&archive, bytes).unwrap();
        let err = extract_archive(&archive, ArchiveFormat::TarGz, &tmp.path().join("out"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }
}
