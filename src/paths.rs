//! Centralized path utilities for the application.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::service::ServiceKind;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CAMPP_HOME";

/// Default data directory (`<local data dir>/campp`), honoring `CAMPP_HOME`.
pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|d| d.join("campp"))
        .ok_or_else(|| AppError::io("Cannot find a local data directory"))
}

/// On-disk layout rooted at a single data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install root for provisioned components.
    pub fn install_root(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.install_root().join(".downloads")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.install_root().join(".staging")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn service_log_path(&self, kind: ServiceKind) -> PathBuf {
        self.logs_dir().join(format!("{}.log", kind.as_str()))
    }

    pub fn db_data_dir(&self) -> PathBuf {
        self.root.join("data").join("mariadb")
    }

    /// Scratch directory handed to phpMyAdmin.
    pub fn db_admin_tmp_dir(&self) -> PathBuf {
        self.root.join("data").join("phpmyadmin-tmp")
    }

    /// Caddy's own data and config home.
    pub fn caddy_state_dir(&self) -> PathBuf {
        self.root.join("data").join("caddy")
    }

    /// Pid records of the services this data dir launched.
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn pid_record_path(&self, kind: ServiceKind) -> PathBuf {
        self.run_dir().join(format!("{}.pid", kind.as_str()))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn default_project_root(&self) -> PathBuf {
        self.root.join("projects")
    }

    /// Ensure all required data directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            self.root.clone(),
            self.install_root(),
            self.config_dir(),
            self.logs_dir(),
            self.run_dir(),
            self.db_data_dir(),
            self.db_admin_tmp_dir(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::io(format!("Failed to create {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::io(format!("No parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    fs::write(&tmp, contents)
        .map_err(|e| AppError::io(format!("Failed to write {}: {}", tmp.display(), e)))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(AppError::io(format!(
            "Failed to replace {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Render a path with forward slashes, as the generated config files expect.
pub fn to_forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_data_dir() {
        let layout = DataLayout::new("/tmp/campp");
        assert_eq!(layout.install_root(), PathBuf::from("/tmp/campp/runtime"));
        assert_eq!(
            layout.staging_dir(),
            PathBuf::from("/tmp/campp/runtime/.staging")
        );
        assert_eq!(
            layout.service_log_path(ServiceKind::PhpRuntime),
            PathBuf::from("/tmp/campp/logs/php-runtime.log")
        );
        assert_eq!(
            layout.db_data_dir(),
            PathBuf::from("/tmp/campp/data/mariadb")
        );
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path().join("campp"));
        layout.ensure_dirs().unwrap();
        assert!(layout.install_root().is_dir());
        assert!(layout.config_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.run_dir().is_dir());
        assert!(layout.db_data_dir().is_dir());
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("file.txt");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn forward_slashes() {
        assert_eq!(
            to_forward_slashes(Path::new(r"C:\campp\projects")),
            "C:/campp/projects"
        );
    }
}
