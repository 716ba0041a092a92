//! Downloads, verifies and installs the runtime components.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::archive::{extract_archive, ArchiveFormat};
use crate::download::{sha256_file, with_proxy, RetryPolicy, RuntimeFetcher};
use crate::error::{AppError, ErrorKind, Result};
use crate::paths::{write_atomic, DataLayout};
use crate::platform::get_arch_target;

use super::locator::{locate_phpmyadmin, verify_component};
use super::manifest::{fetch_manifest, ArtifactSpec};
use super::progress::{DownloadProgress, ProgressPhase};
use super::Component;

/// Receipt file written at the top of every installed component.
pub const RECEIPT_FILE: &str = ".campp-receipt.toml";

/// Environment variable read by the phpMyAdmin config stub.
pub const PMA_CONFIG_ENV: &str = "CAMPP_PMA_CONFIG";

const PROGRESS_CAPACITY: usize = 64;

/// How long a phase milestone waits for room in a full progress channel.
const MILESTONE_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// How long the final `complete` or `error` event waits.
const FINAL_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Download updates are forwarded at most once per this many bytes when the
/// total size is unknown.
const UNKNOWN_SIZE_STEP: u64 = 1024 * 1024;

const PMA_CONFIG_STUB: &str = "<?php
$campp_config = getenv('CAMPP_PMA_CONFIG');
if ($campp_config !== false && is_readable($campp_config)) {
    require $campp_config;
}
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub component: Component,
    pub version: String,
    pub sha256: String,
    pub installed_at: DateTime<Utc>,
}

impl InstallReceipt {
    pub fn read(component_dir: &Path) -> Option<Self> {
        let content = fs::read_to_string(component_dir.join(RECEIPT_FILE)).ok()?;
        match toml::from_str(&content) {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable receipt in {}: {}",
                    component_dir.display(),
                    e
                );
                None
            }
        }
    }

    fn write(&self, component_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        write_atomic(&component_dir.join(RECEIPT_FILE), content.as_bytes())
    }
}

/// Outcome of a successful provisioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub installed: Vec<Component>,
    pub skipped: Vec<Component>,
}

/// Where to fetch from.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub manifest_sources: Vec<String>,
    pub download_proxy: String,
}

/// Requests cancellation of a running provisioning task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running provisioning job.
pub struct ProvisionTask {
    pub progress: mpsc::Receiver<DownloadProgress>,
    pub cancel: CancelHandle,
    pub join: JoinHandle<Result<ProvisionReport>>,
}

impl ProvisionTask {
    /// Wait for the outcome, discarding progress events.
    pub async fn wait(self) -> Result<ProvisionReport> {
        drop(self.progress);
        join_result(self.join).await
    }
}

pub(crate) async fn join_result<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| AppError::other(format!("Background task failed: {}", e)))?
}

/// Installs runtime components under the layout's install root.
pub struct Provisioner<F> {
    layout: DataLayout,
    fetcher: Arc<F>,
    retry: RetryPolicy,
    target: String,
    run_lock: Arc<Mutex<()>>,
}

impl<F: RuntimeFetcher + 'static> Provisioner<F> {
    pub fn new(layout: DataLayout, fetcher: F) -> Self {
        let target = get_arch_target().map_or_else(
            |_| format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            str::to_string,
        );
        Self {
            layout,
            fetcher: Arc::new(fetcher),
            retry: RetryPolicy::default(),
            target,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the manifest platform key.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Spawn a provisioning run. Runs are serialized: a second call waits for the first.
    pub fn start(&self, request: ProvisionRequest) -> ProvisionTask {
        let (tx, rx) = mpsc::channel(PROGRESS_CAPACITY);
        let cancel = CancelHandle::default();
        let run = ProvisionRun {
            layout: self.layout.clone(),
            fetcher: Arc::clone(&self.fetcher),
            retry: self.retry,
            target: self.target.clone(),
            request,
            cancel: cancel.clone(),
            tx,
            current: None,
            total: 0,
        };
        let run_lock = Arc::clone(&self.run_lock);

        let join = tokio::spawn(async move {
            let _guard = run_lock.lock_owned().await;
            run.execute().await
        });

        ProvisionTask {
            progress: rx,
            cancel,
            join,
        }
    }
}

struct ProvisionRun<F> {
    layout: DataLayout,
    fetcher: Arc<F>,
    retry: RetryPolicy,
    target: String,
    request: ProvisionRequest,
    cancel: CancelHandle,
    tx: mpsc::Sender<DownloadProgress>,
    current: Option<(Component, usize)>,
    total: usize,
}

impl<F: RuntimeFetcher + 'static> ProvisionRun<F> {
    async fn execute(mut self) -> Result<ProvisionReport> {
        match self.install_all().await {
            Ok(report) => {
                self.emit(DownloadProgress::complete(self.total), FINAL_SEND_TIMEOUT)
                    .await;
                log::info!(
                    "Runtime provisioning complete: {} installed, {} already present",
                    report.installed.len(),
                    report.skipped.len()
                );
                Ok(report)
            }
            Err(e) => {
                let (component, index) = self
                    .current
                    .map_or((None, 0), |(c, i)| (Some(c), i));
                log::error!("Runtime provisioning failed: {}", e);
                self.emit(
                    DownloadProgress::failed(component, index, self.total, e.to_string()),
                    FINAL_SEND_TIMEOUT,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Send `event`, giving up after `timeout` if nobody drains the channel.
    async fn emit(&self, event: DownloadProgress, timeout: Duration) {
        let phase = event.phase;
        if self.tx.send_timeout(event, timeout).await.is_err() {
            log::debug!("Dropped {:?} progress event: receiver is not reading", phase);
        }
    }

    async fn milestone(&self, event: DownloadProgress) {
        self.emit(event, MILESTONE_SEND_TIMEOUT).await;
    }

    async fn install_all(&mut self) -> Result<ProvisionReport> {
        sweep_leftovers(&self.layout);

        let sources = if self.request.manifest_sources.is_empty() {
            super::manifest::DEFAULT_MANIFEST_SOURCES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.request.manifest_sources.clone()
        };
        let manifest = fetch_manifest(self.fetcher.as_ref(), &sources, self.retry).await?;
        let artifacts = manifest.artifacts_for(&self.target)?;
        self.total = artifacts.len();

        let mut report = ProvisionReport::default();
        for (position, (component, spec)) in artifacts.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("Provisioning cancelled before {}", component);
                return Err(AppError::cancelled());
            }
            let index = position + 1;
            self.current = Some((component, index));

            let dest = self.layout.install_root().join(component.id());
            if is_current(component, &dest, &spec) {
                log::info!("{} {} already installed", component.display_name(), spec.version);
                self.milestone(
                    DownloadProgress::step(ProgressPhase::Installing, component, index, self.total)
                        .with_percent(100.0)
                        .with_message("already installed"),
                )
                .await;
                report.skipped.push(component);
                continue;
            }

            self.install_component(component, &spec, index, &dest).await?;
            report.installed.push(component);
        }

        Ok(report)
    }

    async fn install_component(
        &self,
        component: Component,
        spec: &ArtifactSpec,
        index: usize,
        dest: &Path,
    ) -> Result<()> {
        let format = ArchiveFormat::from_name(&spec.url).ok_or_else(|| {
            AppError::extraction(format!("unrecognized archive type for {}", spec.url))
        })?;

        let archive = self.download(component, spec, index).await?;
        let result = self
            .unpack_and_promote(component, spec, index, format, &archive, dest)
            .await;
        if let Err(e) = fs::remove_file(&archive) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", archive.display(), e);
            }
        }
        result
    }

    async fn download(
        &self,
        component: Component,
        spec: &ArtifactSpec,
        index: usize,
    ) -> Result<PathBuf> {
        let part = self.layout.downloads_dir().join(format!(
            "{}-{}.part",
            component.id(),
            uuid::Uuid::new_v4().simple()
        ));
        let total_components = self.total;
        self.milestone(
            DownloadProgress::step(ProgressPhase::Downloading, component, index, total_components)
                .with_message(format!("{} {}", component.display_name(), spec.version)),
        )
        .await;

        let mut last_error = None;
        for raw_url in spec.urls() {
            let url = with_proxy(&self.request.download_proxy, raw_url);
            let (url_ref, part_ref, tx, fetcher) =
                (url.as_str(), part.as_path(), &self.tx, self.fetcher.as_ref());

            let attempt = self
                .retry
                .run(&format!("download of {} from {}", component, url), move || async move {
                    let mut last_step: Option<u64> = None;
                    let mut on_progress = |downloaded: u64, total: Option<u64>| {
                        let step = match total {
                            Some(total) if total > 0 => downloaded * 100 / total,
                            _ => downloaded / UNKNOWN_SIZE_STEP,
                        };
                        if last_step != Some(step) {
                            last_step = Some(step);
                            let _ = tx.try_send(
                                DownloadProgress::step(
                                    ProgressPhase::Downloading,
                                    component,
                                    index,
                                    total_components,
                                )
                                .with_bytes(downloaded, total),
                            );
                        }
                    };
                    fetcher.download(url_ref, part_ref, &mut on_progress).await
                })
                .await;

            match attempt {
                Ok(bytes) => {
                    log::info!("Downloaded {} ({} bytes) from {}", component, bytes, url);
                    return Ok(part);
                }
                Err(e) => {
                    log::warn!("Download of {} from {} failed: {}", component, url, e);
                    last_error = Some(e);
                }
            }
        }

        let _ = fs::remove_file(&part);
        Err(last_error.unwrap_or_else(|| AppError::network(format!("no URL for {}", component))))
    }

    async fn unpack_and_promote(
        &self,
        component: Component,
        spec: &ArtifactSpec,
        index: usize,
        format: ArchiveFormat,
        archive: &Path,
        dest: &Path,
    ) -> Result<()> {
        let archive_owned = archive.to_path_buf();
        let actual = blocking(move || sha256_file(&archive_owned)).await?;
        if !spec.matches_digest(&actual) {
            log::error!(
                "Checksum mismatch for {}: expected {}, got {}",
                component,
                spec.sha256,
                actual
            );
            return Err(AppError::checksum_mismatch(component.id(), &spec.sha256, &actual));
        }

        self.milestone(DownloadProgress::step(
            ProgressPhase::Extracting,
            component,
            index,
            self.total,
        ))
        .await;

        let staging = self.layout.staging_dir().join(format!(
            "{}-{}",
            component.id(),
            uuid::Uuid::new_v4().simple()
        ));
        let receipt = InstallReceipt {
            component,
            version: spec.version.clone(),
            sha256: actual.to_ascii_lowercase(),
            installed_at: Utc::now(),
        };

        let (archive_owned, staging_owned) = (archive.to_path_buf(), staging.clone());
        let prepared = blocking(move || {
            let files = extract_archive(&archive_owned, format, &staging_owned)?;
            log::debug!("Extracted {} files for {}", files, component);
            finish_staging(component, &staging_owned, &receipt)
        })
        .await;
        if let Err(e) = prepared {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        self.milestone(DownloadProgress::step(
            ProgressPhase::Installing,
            component,
            index,
            self.total,
        ))
        .await;

        let (staging_owned, dest_owned, aside_root) =
            (staging.clone(), dest.to_path_buf(), self.layout.staging_dir());
        let promoted = blocking(move || promote(&staging_owned, &dest_owned, &aside_root)).await;
        if let Err(e) = promoted {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        log::info!("Installed {} {}", component.display_name(), spec.version);
        Ok(())
    }
}

async fn blocking<T, C>(f: C) -> Result<T>
where
    T: Send + 'static,
    C: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::other(format!("Blocking task failed: {}", e)))?
}

/// Whether `dest` already holds the artifact described by `spec`.
fn is_current(component: Component, dest: &Path, spec: &ArtifactSpec) -> bool {
    let Some(receipt) = InstallReceipt::read(dest) else {
        return false;
    };
    if !spec.matches_digest(&receipt.sha256) {
        match (
            semver::Version::parse(&receipt.version),
            semver::Version::parse(&spec.version),
        ) {
            (Ok(have), Ok(want)) if want > have => {
                log::info!("Upgrading {} {} -> {}", component, have, want);
            }
            _ => log::info!(
                "Reinstalling {} (installed {}, manifest {})",
                component,
                receipt.version,
                spec.version
            ),
        }
        return false;
    }
    match verify_component(component, dest) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("{} receipt present but install is incomplete: {}", component, e);
            false
        }
    }
}

/// Add receipt and stub files, then check the staged tree is usable.
fn finish_staging(component: Component, staging: &Path, receipt: &InstallReceipt) -> Result<()> {
    if component == Component::PhpMyAdmin {
        let root = locate_phpmyadmin(staging).map_err(|_| {
            AppError::extraction("phpMyAdmin archive has no index.php")
        })?;
        write_atomic(&root.join("config.inc.php"), PMA_CONFIG_STUB.as_bytes())?;
    }
    receipt.write(staging)?;

    verify_component(component, staging).map_err(|e| {
        let missing = e.detail("missing").unwrap_or("executables").to_string();
        AppError::extraction(format!("{} archive lacks {}", component, missing))
    })
}

/// Swap `staging` into `dest`, keeping the previous tree until the swap succeeds.
fn promote(staging: &Path, dest: &Path, aside_root: &Path) -> Result<()> {
    let aside = dest.exists().then(|| {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        aside_root.join(format!("{}-old-{}", name, uuid::Uuid::new_v4().simple()))
    });

    if let Some(aside) = &aside {
        fs::rename(dest, aside).map_err(|e| {
            AppError::io(format!("Failed to move {} aside: {}", dest.display(), e))
        })?;
    }

    if let Err(e) = fs::rename(staging, dest) {
        if let Some(aside) = &aside {
            if let Err(restore) = fs::rename(aside, dest) {
                log::error!(
                    "Failed to restore {} after failed install: {}",
                    dest.display(),
                    restore
                );
            }
        }
        return Err(AppError::io(format!(
            "Failed to install into {}: {}",
            dest.display(),
            e
        )));
    }

    if let Some(aside) = aside {
        if let Err(e) = fs::remove_dir_all(&aside) {
            log::warn!("Failed to remove previous install {}: {}", aside.display(), e);
        }
    }
    Ok(())
}

/// Remove partial downloads and staging trees left by an interrupted run.
fn sweep_leftovers(layout: &DataLayout) {
    for dir in [layout.staging_dir(), layout.downloads_dir()] {
        if dir.exists() {
            log::debug!("Sweeping {}", dir.display());
            if let Err(e) = fs::remove_dir_all(&dir) {
                log::warn!("Failed to sweep {}: {}", dir.display(), e);
            }
        }
        if let Err(e) = fs::create_dir_all(&dir) {
            log::warn!("Failed to create {}: {}", dir.display(), e);
        }
    }
}

/// Whether the error ended a run because the user asked it to.
pub fn is_cancellation(error: &AppError) -> bool {
    error.kind() == ErrorKind::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(sha: &str, version: &str) -> InstallReceipt {
        InstallReceipt {
            component: Component::Caddy,
            version: version.to_string(),
            sha256: sha.to_string(),
            installed_at: Utc::now(),
        }
    }

    fn spec(sha: &str) -> ArtifactSpec {
        ArtifactSpec {
            url: "https://a/caddy.tar.gz".into(),
            sha256: sha.into(),
            version: "2.8.4".into(),
            mirrors: Vec::new(),
        }
    }

    #[test]
    fn receipt_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let written = receipt("abc", "2.8.4");
        written.write(tmp.path()).unwrap();
        assert_eq!(InstallReceipt::read(tmp.path()).unwrap(), written);
    }

    #[test]
    fn current_requires_matching_digest_and_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("caddy");
        fs::create_dir_all(&dir).unwrap();
        receipt("ABC", "2.8.4").write(&dir).unwrap();
        assert!(!is_current(Component::Caddy, &dir, &spec("abc")));

        fs::write(dir.join(crate::platform::exe_name("caddy")), b"").unwrap();
        assert!(is_current(Component::Caddy, &dir, &spec("abc")));
        assert!(!is_current(Component::Caddy, &dir, &spec("def")));
    }

    #[test]
    fn promote_replaces_existing_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let aside = tmp.path().join(".staging");
        fs::create_dir_all(&aside).unwrap();
        let dest = tmp.path().join("php");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("old.txt"), b"old").unwrap();
        let staging = aside.join("php-new");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("new.txt"), b"new").unwrap();

        promote(&staging, &dest, &aside).unwrap();
        assert!(dest.join("new.txt").is_file());
        assert!(!dest.join("old.txt").exists());
        assert!(!staging.exists());
        assert_eq!(fs::read_dir(&aside).unwrap().count(), 0);
    }

    #[test]
    fn promote_failure_restores_previous_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let aside = tmp.path().join(".staging");
        fs::create_dir_all(&aside).unwrap();
        let dest = tmp.path().join("php");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("old.txt"), b"old").unwrap();

        let missing = aside.join("does-not-exist");
        assert!(promote(&missing, &dest, &aside).is_err());
        assert!(dest.join("old.txt").is_file());
    }

    #[test]
    fn sweep_clears_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path());
        fs::create_dir_all(layout.staging_dir().join("caddy-123")).unwrap();
        fs::create_dir_all(layout.downloads_dir()).unwrap();
        fs::write(layout.downloads_dir().join("php-1.part"), b"x").unwrap();

        sweep_leftovers(&layout);
        assert_eq!(fs::read_dir(layout.staging_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(layout.downloads_dir()).unwrap().count(), 0);
    }

    #[test]
    fn cancel_handle_is_shared() {
        let handle = CancelHandle::default();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(is_cancellation(&AppError::cancelled()));
    }
}
