//! Persisted user settings (`settings.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::write_atomic;
use crate::service::ServiceKind;

/// Preferred port per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePorts {
    #[serde(default = "default_web_server_port")]
    pub web_server: u16,
    #[serde(default = "default_php_runtime_port")]
    pub php_runtime: u16,
    #[serde(default = "default_database_port")]
    pub database: u16,
    #[serde(default = "default_db_admin_port")]
    pub db_admin: u16,
}

fn default_web_server_port() -> u16 {
    ServiceKind::WebServer.default_port()
}

fn default_php_runtime_port() -> u16 {
    ServiceKind::PhpRuntime.default_port()
}

fn default_database_port() -> u16 {
    ServiceKind::Database.default_port()
}

fn default_db_admin_port() -> u16 {
    ServiceKind::DbAdmin.default_port()
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self {
            web_server: default_web_server_port(),
            php_runtime: default_php_runtime_port(),
            database: default_database_port(),
            db_admin: default_db_admin_port(),
        }
    }
}

impl ServicePorts {
    pub fn get(&self, kind: ServiceKind) -> u16 {
        match kind {
            ServiceKind::WebServer => self.web_server,
            ServiceKind::PhpRuntime => self.php_runtime,
            ServiceKind::Database => self.database,
            ServiceKind::DbAdmin => self.db_admin,
        }
    }

    pub fn set(&mut self, kind: ServiceKind, port: u16) {
        match kind {
            ServiceKind::WebServer => self.web_server = port,
            ServiceKind::PhpRuntime => self.php_runtime = port,
            ServiceKind::Database => self.database = port,
            ServiceKind::DbAdmin => self.db_admin = port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ports: ServicePorts,
    pub project_root: PathBuf,
    /// Manifest URLs tried in order instead of the built-in sources.
    #[serde(default)]
    pub manifest_sources: Vec<String>,
    /// Prefix prepended to every download URL, empty for none.
    #[serde(default)]
    pub download_proxy: String,
    #[serde(default = "generate_secret")]
    pub db_admin_secret: String,
}

/// 32-character secret used as phpMyAdmin's cookie encryption key.
pub fn generate_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl AppSettings {
    pub fn with_project_root(project_root: PathBuf) -> Self {
        Self {
            ports: ServicePorts::default(),
            project_root,
            manifest_sources: Vec::new(),
            download_proxy: String::new(),
            db_admin_secret: generate_secret(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for kind in ServiceKind::ALL {
            let port = self.ports.get(kind);
            if port == 0 {
                return Err(AppError::config(format!("Port for {} must be non-zero", kind)));
            }
            if let Some(other) = ServiceKind::ALL
                .iter()
                .find(|&&o| o > kind && self.ports.get(o) == port)
            {
                return Err(AppError::config(format!(
                    "Port {} is assigned to both {} and {}",
                    port, kind, other
                )));
            }
        }
        if self.project_root.as_os_str().is_empty() {
            return Err(AppError::config("Project root must not be empty"));
        }
        if self.db_admin_secret.len() < 32 {
            return Err(AppError::config(
                "phpMyAdmin secret must be at least 32 characters",
            ));
        }
        Ok(())
    }
}

/// Settings file with an in-memory snapshot and guarded read-modify-write.
pub struct SettingsStore {
    path: PathBuf,
    update_lock: Mutex<()>,
    cache: RwLock<Arc<AppSettings>>,
}

impl SettingsStore {
    /// Load settings from `path`, writing `defaults` there if the file is absent.
    pub fn load_or_init(path: &Path, defaults: impl FnOnce() -> AppSettings) -> Result<Self> {
        let settings = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                AppError::config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            toml::from_str(&content)?
        } else {
            let settings = defaults();
            save_to_disk(path, &settings)?;
            log::info!("Created default settings at {}", path.display());
            settings
        };

        Ok(Self {
            path: path.to_path_buf(),
            update_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn get(&self) -> Arc<AppSettings> {
        let settings = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&settings)
    }

    /// Execute a read-modify-write on the settings while holding the update lock.
    pub fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut AppSettings) -> Result<T>,
    {
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut updated = (*self.get()).clone();
        let result = f(&mut updated)?;
        updated.validate()?;
        save_to_disk(&self.path, &updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);
        Ok(result)
    }

    pub fn replace(&self, settings: AppSettings) -> Result<()> {
        self.update(move |current| {
            *current = settings;
            Ok(())
        })
    }
}

fn save_to_disk(path: &Path, settings: &AppSettings) -> Result<()> {
    let content = toml::to_string_pretty(settings)?;
    write_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample(root: &Path) -> AppSettings {
        AppSettings::with_project_root(root.join("projects"))
    }

    #[test]
    fn defaults_match_service_table() {
        let ports = ServicePorts::default();
        assert_eq!(ports.web_server, 8080);
        assert_eq!(ports.php_runtime, 9000);
        assert_eq!(ports.database, 3307);
        assert_eq!(ports.db_admin, 8088);
    }

    #[test]
    fn secret_is_32_chars() {
        assert_eq!(generate_secret().len(), 32);
    }

    #[test]
    fn duplicate_ports_rejected() {
        let mut settings = sample(Path::new("/tmp"));
        settings.ports.set(ServiceKind::DbAdmin, 8080);
        let err = settings.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn zero_port_and_empty_root_rejected() {
        let mut settings = sample(Path::new("/tmp"));
        settings.ports.set(ServiceKind::Database, 0);
        assert!(settings.validate().is_err());

        let mut settings = sample(Path::new("/tmp"));
        settings.project_root = PathBuf::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn store_creates_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.toml");

        let store = SettingsStore::load_or_init(&path, || sample(tmp.path())).unwrap();
        assert!(path.exists());
        let secret = store.get().db_admin_secret.clone();

        store
            .update(|s| {
                s.ports.set(ServiceKind::WebServer, 8181);
                Ok(())
            })
            .unwrap();

        let reloaded = SettingsStore::load_or_init(&path, || unreachable!()).unwrap();
        assert_eq!(reloaded.get().ports.web_server, 8181);
        assert_eq!(reloaded.get().db_admin_secret, secret);
    }

    #[test]
    fn invalid_update_keeps_previous_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.toml");
        let store = SettingsStore::load_or_init(&path, || sample(tmp.path())).unwrap();

        let result = store.update(|s| {
            s.ports.set(ServiceKind::PhpRuntime, 0);
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.get().ports.php_runtime, 9000);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.toml");
        fs::write(&path, "project_root = \"/srv/www\"\n[ports]\nweb_server = 9090\n").unwrap();

        let store = SettingsStore::load_or_init(&path, || unreachable!()).unwrap();
        let settings = store.get();
        assert_eq!(settings.ports.web_server, 9090);
        assert_eq!(settings.ports.database, 3307);
        assert_eq!(settings.db_admin_secret.len(), 32);
    }
}
