//! Single entry point for callers driving the local stack.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::{self, ConfigContext};
use crate::download::{HttpFetcher, RetryPolicy, RuntimeFetcher};
use crate::error::{AppError, Result};
use crate::paths::{default_data_dir, DataLayout};
use crate::process::{ManagerOptions, ProcessManager, ServiceEvent, Timeouts};
use crate::runtime::{locate, ProvisionRequest, ProvisionTask, Provisioner, RuntimePaths};
use crate::service::{ServiceKind, ServiceStatus};
use crate::settings::{AppSettings, SettingsStore};

/// How to build an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub data_dir: PathBuf,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    /// Manifest platform key; detected from the build target when unset.
    pub target: Option<String>,
}

impl OrchestratorOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            target: None,
        }
    }

    /// Options rooted at the default data directory (`CAMPP_HOME` or the local data dir).
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(default_data_dir()?))
    }
}

pub struct Orchestrator<F = HttpFetcher> {
    layout: DataLayout,
    settings: Arc<SettingsStore>,
    processes: ProcessManager,
    provisioner: Provisioner<F>,
    first_run: bool,
}

impl Orchestrator<HttpFetcher> {
    pub fn new(options: OrchestratorOptions) -> Result<Self> {
        Self::with_fetcher(options, HttpFetcher::new()?)
    }
}

impl<F: RuntimeFetcher + 'static> Orchestrator<F> {
    pub fn with_fetcher(options: OrchestratorOptions, fetcher: F) -> Result<Self> {
        let layout = DataLayout::new(options.data_dir);
        layout.ensure_dirs()?;

        let settings_existed = layout.settings_path().exists();
        let default_root = layout.default_project_root();
        let settings = Arc::new(SettingsStore::load_or_init(&layout.settings_path(), || {
            AppSettings::with_project_root(default_root)
        })?);
        let project_root = settings.get().project_root.clone();
        std::fs::create_dir_all(&project_root).map_err(|e| {
            AppError::io(format!(
                "Failed to create project root {}: {}",
                project_root.display(),
                e
            ))
        })?;

        let installed = locate(&layout.install_root()).is_ok();
        let first_run = !settings_existed || !installed;
        if first_run {
            log::info!(
                "First run at {} (runtime installed: {})",
                layout.root().display(),
                installed
            );
        }

        let mut provisioner =
            Provisioner::new(layout.clone(), fetcher).with_retry(options.retry);
        if let Some(target) = options.target {
            provisioner = provisioner.with_target(target);
        }
        let processes = ProcessManager::new(
            layout.clone(),
            Arc::clone(&settings),
            ManagerOptions {
                timeouts: options.timeouts,
            },
        );

        Ok(Self {
            layout,
            settings,
            processes,
            provisioner,
            first_run,
        })
    }

    /// Whether this data directory had no settings or no runtime when opened.
    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    /// Whether every runtime executable can be located.
    pub fn check_installed(&self) -> bool {
        locate(&self.layout.install_root()).is_ok()
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.layout.install_root()
    }

    pub fn data_dir(&self) -> &Path {
        self.layout.root()
    }

    /// Start downloading and installing the runtime in the background.
    pub fn provision_runtime(&self) -> ProvisionTask {
        let settings = self.settings.get();
        self.provisioner.start(ProvisionRequest {
            manifest_sources: settings.manifest_sources.clone(),
            download_proxy: settings.download_proxy.clone(),
        })
    }

    pub async fn start_service(&self, kind: ServiceKind) -> ServiceStatus {
        self.processes.start(kind).await
    }

    pub async fn stop_service(&self, kind: ServiceKind) -> ServiceStatus {
        self.processes.stop(kind).await
    }

    pub async fn restart_service(&self, kind: ServiceKind) -> ServiceStatus {
        self.processes.restart(kind).await
    }

    pub fn get_status(&self, kind: ServiceKind) -> ServiceStatus {
        self.processes.status(kind)
    }

    pub fn get_all_statuses(&self) -> BTreeMap<ServiceKind, ServiceStatus> {
        self.processes
            .status_all()
            .into_iter()
            .map(|status| (status.kind, status))
            .collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.processes.subscribe_events()
    }

    pub fn get_settings(&self) -> AppSettings {
        (*self.settings.get()).clone()
    }

    /// Validate and persist `settings`, then regenerate configs if the runtime is present.
    pub fn save_settings(&self, settings: AppSettings) -> Result<()> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.project_root).map_err(|e| {
            AppError::io(format!(
                "Failed to create project root {}: {}",
                settings.project_root.display(),
                e
            ))
        })?;
        self.settings.replace(settings)?;
        log::info!("Settings saved");

        match locate(&self.layout.install_root()) {
            Ok(runtime) => {
                let written = self.regenerate_configs(&runtime)?;
                log::info!("Regenerated {} config files", written.len());
            }
            Err(_) => log::debug!("Runtime not installed; config generation deferred"),
        }
        Ok(())
    }

    fn regenerate_configs(&self, runtime: &RuntimePaths) -> Result<Vec<PathBuf>> {
        let settings = self.settings.get();
        let ctx = ConfigContext {
            ports: self.processes.port_plan(),
            runtime,
            layout: &self.layout,
            project_root: &settings.project_root,
            db_admin_secret: &settings.db_admin_secret,
        };
        config::generate_all(&ctx)
    }

    /// Gracefully stop every service, web server first.
    pub async fn stop_all_services(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(ServiceKind::STARTUP_ORDER.len());
        for kind in ServiceKind::STARTUP_ORDER.into_iter().rev() {
            statuses.push(self.processes.stop(kind).await);
        }
        statuses
    }

    /// Force kill everything without waiting.
    pub fn cleanup_all_services(&self) {
        self.processes.cleanup_all();
    }

    /// Stop every service and delete the installed runtime.
    pub async fn reset_installation(&self) -> Result<()> {
        self.stop_all_services().await;
        self.processes.cleanup_all();

        let root = self.layout.install_root();
        if tokio::fs::try_exists(&root).await? {
            tokio::fs::remove_dir_all(&root).await.map_err(|e| {
                AppError::io(format!("Failed to remove {}: {}", root.display(), e))
            })?;
        }
        tokio::fs::create_dir_all(&root).await?;
        log::info!("Runtime removed from {}", root.display());
        Ok(())
    }

    /// The last `lines` lines of a service's log, empty if it has not run yet.
    pub async fn read_service_log(&self, kind: ServiceKind, lines: usize) -> Result<String> {
        let path = self.layout.service_log_path(kind);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(tail_lines(&String::from_utf8_lossy(&bytes), lines))
    }
}

fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
