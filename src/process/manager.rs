//! Per-service lifecycle state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};

use crate::config::{self, ConfigContext};
use crate::error::{AppError, Result};
use crate::paths::DataLayout;
use crate::ports::{is_port_usable, resolve_port};
use crate::runtime::locate;
use crate::service::{ServiceKind, ServiceState, ServiceStatus};
use crate::settings::{ServicePorts, SettingsStore};

use super::bootstrap::ensure_database_initialized;
use super::control::{force_kill, graceful_signal};
use super::health::{wait_for_exit, wait_until_listening, StartupFailure};
use super::launch::{launch_spec, spawn_service};
use super::records::{clear_pid_record, reap_stale_process, PidRecord};
use super::{ServiceDescriptor, Timeouts};

const EVENT_CAPACITY: usize = 128;

/// Tunables for a [`ProcessManager`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerOptions {
    pub timeouts: Timeouts,
}

/// A committed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEvent {
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub port: u16,
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Start,
    Stop,
    Restart,
}

#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    exited: watch::Receiver<Option<String>>,
}

#[derive(Debug)]
struct ServiceHandle {
    state: ServiceState,
    /// Resolved port, set while a process is live.
    port: Option<u16>,
    process: Option<ProcessHandle>,
    pending: Option<Operation>,
    /// Bumped whenever a start or restart finishes.
    settled_starts: u64,
}

impl ServiceHandle {
    fn new() -> Self {
        Self {
            state: ServiceState::Stopped,
            port: None,
            process: None,
            pending: None,
            settled_starts: 0,
        }
    }

    fn live_port(&self) -> Option<u16> {
        self.process.as_ref().and(self.port)
    }

    fn clear_process(&mut self) {
        self.process = None;
        self.port = None;
    }
}

struct ServiceSlot {
    descriptor: ServiceDescriptor,
    transition: Mutex<()>,
    handle: RwLock<ServiceHandle>,
}

impl ServiceSlot {
    fn new(kind: ServiceKind) -> Self {
        Self {
            descriptor: ServiceDescriptor::for_kind(kind),
            transition: Mutex::new(()),
            handle: RwLock::new(ServiceHandle::new()),
        }
    }

    fn kind(&self) -> ServiceKind {
        self.descriptor.kind
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceHandle> {
        self.handle.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceHandle> {
        self.handle.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Marks a service as in transition for as long as it lives.
struct PendingGuard<'a> {
    slot: &'a ServiceSlot,
}

impl<'a> PendingGuard<'a> {
    fn set(slot: &'a ServiceSlot, op: Operation) -> Self {
        slot.write().pending = Some(op);
        Self { slot }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.slot.write().pending = None;
    }
}

fn make_event(kind: ServiceKind, handle: &ServiceHandle, preferred: u16) -> ServiceEvent {
    ServiceEvent {
        kind,
        state: handle.state.clone(),
        port: handle.live_port().unwrap_or(preferred),
        pid: handle.process.as_ref().map(|p| p.pid),
        at: Utc::now(),
    }
}

/// Supervises one process per [`ServiceKind`].
pub struct ProcessManager {
    slots: Vec<Arc<ServiceSlot>>,
    layout: DataLayout,
    settings: Arc<SettingsStore>,
    timeouts: Timeouts,
    events: broadcast::Sender<ServiceEvent>,
    /// Bumped by every `cleanup_all`; a start that sees it change gives up.
    cleanups: AtomicU64,
}

impl ProcessManager {
    pub fn new(layout: DataLayout, settings: Arc<SettingsStore>, options: ManagerOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slots: ServiceKind::ALL
                .into_iter()
                .map(|kind| Arc::new(ServiceSlot::new(kind)))
                .collect(),
            layout,
            settings,
            timeouts: options.timeouts,
            events,
            cleanups: AtomicU64::new(0),
        }
    }

    fn slot(&self, kind: ServiceKind) -> &Arc<ServiceSlot> {
        // ALL lists the kinds in declaration order
        &self.slots[kind as usize]
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    fn preferred_port(&self, kind: ServiceKind) -> u16 {
        self.settings.get().ports.get(kind)
    }

    /// Apply `update` to the handle and broadcast the resulting state.
    fn commit(&self, slot: &ServiceSlot, update: impl FnOnce(&mut ServiceHandle)) {
        let kind = slot.kind();
        let preferred = self.preferred_port(kind);
        let event = {
            let mut handle = slot.write();
            update(&mut handle);
            make_event(kind, &handle, preferred)
        };
        log::debug!("{} -> {}", kind, event.state);
        let _ = self.events.send(event);
    }

    fn snapshot(&self, slot: &ServiceSlot) -> ServiceStatus {
        let kind = slot.kind();
        let preferred = self.preferred_port(kind);
        let handle = slot.read();
        ServiceStatus {
            kind,
            state: handle.state.clone(),
            port: handle.live_port().unwrap_or(preferred),
            pid: handle.process.as_ref().map(|p| p.pid),
            error_message: match &handle.state {
                ServiceState::Error(message) => Some(message.clone()),
                _ => None,
            },
            in_transition: handle.pending.is_some(),
        }
    }

    pub fn status(&self, kind: ServiceKind) -> ServiceStatus {
        self.snapshot(self.slot(kind))
    }

    pub fn status_all(&self) -> Vec<ServiceStatus> {
        self.slots.iter().map(|slot| self.snapshot(slot)).collect()
    }

    /// Ports every service uses now: the live port if running, else the preferred one.
    pub fn port_plan(&self) -> ServicePorts {
        let mut ports = self.settings.get().ports;
        for slot in &self.slots {
            if let Some(port) = slot.read().live_port() {
                ports.set(slot.kind(), port);
            }
        }
        ports
    }

    fn reserved_ports(&self, except: ServiceKind) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|slot| slot.kind() != except)
            .filter_map(|slot| slot.read().live_port())
            .collect()
    }

    /// Take the transition lock. The flag is set when the caller waited while
    /// another start or restart settled the service.
    async fn lock_transition<'a>(&self, slot: &'a ServiceSlot) -> (MutexGuard<'a, ()>, bool) {
        let seen = slot.read().settled_starts;
        if let Ok(guard) = slot.transition.try_lock() {
            return (guard, false);
        }
        log::debug!("{}", AppError::already_in_transition(slot.kind().as_str()));
        let guard = slot.transition.lock().await;
        let superseded = slot.read().settled_starts != seen;
        (guard, superseded)
    }

    pub async fn start(&self, kind: ServiceKind) -> ServiceStatus {
        let slot = self.slot(kind);
        let (_transition, superseded) = self.lock_transition(slot).await;
        if superseded {
            return self.snapshot(slot);
        }
        {
            let _pending = PendingGuard::set(slot, Operation::Start);
            self.start_locked(slot).await;
            slot.write().settled_starts += 1;
        }
        self.snapshot(slot)
    }

    pub async fn stop(&self, kind: ServiceKind) -> ServiceStatus {
        let slot = self.slot(kind);
        let (_transition, _) = self.lock_transition(slot).await;
        {
            let _pending = PendingGuard::set(slot, Operation::Stop);
            self.stop_locked(slot).await;
        }
        self.snapshot(slot)
    }

    /// Stop then start under one transition. Always attempts the start, even
    /// when it had to wait behind another start.
    pub async fn restart(&self, kind: ServiceKind) -> ServiceStatus {
        let slot = self.slot(kind);
        let (_transition, _) = self.lock_transition(slot).await;
        {
            let _pending = PendingGuard::set(slot, Operation::Restart);
            self.stop_locked(slot).await;
            self.start_locked(slot).await;
            slot.write().settled_starts += 1;
        }
        self.snapshot(slot)
    }

    async fn start_locked(&self, slot: &Arc<ServiceSlot>) {
        let kind = slot.kind();
        let active = matches!(
            slot.read().state,
            ServiceState::Starting | ServiceState::Running
        );
        if active {
            return;
        }

        let epoch = self.cleanups.load(Ordering::SeqCst);
        if let Err(e) = self.launch(slot, epoch).await {
            if self.cleaned_up_since(epoch) {
                log::info!("Start of {} abandoned by cleanup: {}", kind.display_name(), e);
                self.commit(slot, |handle| {
                    handle.clear_process();
                    handle.state = ServiceState::Stopped;
                });
                return;
            }
            log::error!("Failed to start {}: {}", kind.display_name(), e);
            self.commit(slot, |handle| {
                handle.clear_process();
                handle.state = ServiceState::Error(e.to_string());
            });
        }
    }

    fn cleaned_up_since(&self, epoch: u64) -> bool {
        self.cleanups.load(Ordering::SeqCst) != epoch
    }

    async fn launch(&self, slot: &Arc<ServiceSlot>, epoch: u64) -> Result<()> {
        let descriptor = slot.descriptor;
        let kind = descriptor.kind;
        let runtime = locate(&self.layout.install_root())?;
        let settings = self.settings.get();

        reap_stale_process(&self.layout, kind, self.timeouts.force_kill_wait).await;

        let preferred = settings.ports.get(kind);
        let port = resolve_port(preferred, &self.reserved_ports(kind))?;
        if port != preferred {
            log::warn!(
                "Port {} for {} is in use, falling back to {}",
                preferred,
                kind.display_name(),
                port
            );
        }

        let mut ports = self.port_plan();
        ports.set(kind, port);
        std::fs::create_dir_all(&settings.project_root)?;
        let ctx = ConfigContext {
            ports,
            runtime: &runtime,
            layout: &self.layout,
            project_root: &settings.project_root,
            db_admin_secret: &settings.db_admin_secret,
        };
        config::generate(kind, &ctx)?;
        if kind == ServiceKind::DbAdmin {
            config::generate(ServiceKind::PhpRuntime, &ctx)?;
        }

        let log_path = self.layout.service_log_path(kind);
        if kind == ServiceKind::Database {
            ensure_database_initialized(&runtime, &self.layout, &log_path, self.timeouts.bootstrap)
                .await?;
        }

        if !is_port_usable(port) {
            return Err(AppError::spawn_failed(
                kind.as_str(),
                format!("port {} was taken before the process could bind it", port),
            ));
        }

        if self.cleaned_up_since(epoch) {
            return Err(AppError::cancelled());
        }
        let spec = launch_spec(kind, port, &runtime, &self.layout);
        let (child, pid) = spawn_service(kind, port, &spec, &log_path)?;
        let (exit_tx, mut exit_rx) = watch::channel(None);
        let watched = exit_rx.clone();
        self.commit(slot, |handle| {
            handle.state = ServiceState::Starting;
            handle.port = Some(port);
            handle.process = Some(ProcessHandle {
                pid,
                exited: watched,
            });
        });
        self.spawn_exit_watcher(slot, child, pid, exit_tx);
        if let Err(e) = PidRecord::new(pid, port).write(&self.layout, kind) {
            log::warn!("Failed to record pid {} for {}: {}", pid, kind, e);
        }
        if self.cleaned_up_since(epoch) {
            if let Err(e) = force_kill(pid) {
                log::warn!("{}", e);
            }
            wait_for_exit(&mut exit_rx, self.timeouts.force_kill_wait).await;
            return Err(AppError::cancelled());
        }

        let timeout = self.timeouts.startup_for(&descriptor);
        match wait_until_listening(port, &mut exit_rx, timeout).await {
            Ok(()) => {
                let mut outcome = Ok(());
                self.commit(slot, |handle| {
                    if handle.process.as_ref().map(|p| p.pid) != Some(pid) {
                        // cleanup_all took the process while it was starting
                        outcome = Err(AppError::cancelled());
                    } else if let Some(status) = exit_rx.borrow().clone() {
                        outcome = Err(AppError::unexpected_exit(kind.as_str(), status));
                    } else {
                        handle.state = ServiceState::Running;
                    }
                });
                if outcome.is_ok() {
                    log::info!("{} is running on port {} (pid {})", kind.display_name(), port, pid);
                }
                outcome
            }
            Err(StartupFailure::Exited(status)) => {
                Err(AppError::unexpected_exit(kind.as_str(), status))
            }
            Err(StartupFailure::TimedOut) => {
                log::warn!(
                    "{} did not listen on port {} within {:?}, killing pid {}",
                    kind.display_name(),
                    port,
                    timeout,
                    pid
                );
                if let Err(e) = force_kill(pid) {
                    log::warn!("{}", e);
                }
                wait_for_exit(&mut exit_rx, self.timeouts.force_kill_wait).await;
                Err(AppError::process_timed_out(
                    kind.as_str(),
                    port,
                    timeout.as_secs(),
                ))
            }
        }
    }

    /// Reap the child and report its exit. A running service that exits on
    /// its own moves to `Error`.
    fn spawn_exit_watcher(
        &self,
        slot: &Arc<ServiceSlot>,
        mut child: Child,
        pid: u32,
        exit_tx: watch::Sender<Option<String>>,
    ) {
        let slot = Arc::clone(slot);
        let events = self.events.clone();
        let settings = Arc::clone(&self.settings);
        let layout = self.layout.clone();

        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            let kind = slot.kind();
            clear_pid_record(&layout, kind, pid);
            exit_tx.send_replace(Some(status.clone()));

            let preferred = settings.get().ports.get(kind);
            let event = {
                let mut handle = slot.write();
                let current = handle.process.as_ref().is_some_and(|p| p.pid == pid);
                if current && handle.state == ServiceState::Running {
                    let err = AppError::unexpected_exit(kind.as_str(), status);
                    handle.clear_process();
                    handle.state = ServiceState::Error(err.to_string());
                    Some(make_event(kind, &handle, preferred))
                } else {
                    None
                }
            };
            if let Some(event) = event {
                log::error!("{} exited unexpectedly: {}", kind.display_name(), event.state);
                let _ = events.send(event);
            } else {
                log::debug!("{} (pid {}) exited", kind, pid);
            }
        });
    }

    async fn stop_locked(&self, slot: &ServiceSlot) {
        let kind = slot.kind();
        let target = {
            let handle = slot.read();
            match (&handle.state, &handle.process) {
                (ServiceState::Stopped, _) => return,
                (_, Some(process)) => Some((process.pid, process.exited.clone())),
                (_, None) => None,
            }
        };
        let Some((pid, mut exited)) = target else {
            // Error without a process: clearing the error is the whole stop.
            self.commit(slot, |handle| {
                handle.clear_process();
                handle.state = ServiceState::Stopped;
            });
            return;
        };

        self.commit(slot, |handle| handle.state = ServiceState::Stopping);
        log::info!("Stopping {} (pid {})", kind.display_name(), pid);

        if let Err(e) = graceful_signal(pid) {
            log::warn!("{}", e);
        }
        let mut gone = wait_for_exit(&mut exited, self.timeouts.graceful_stop).await;
        if !gone {
            log::warn!(
                "{} did not exit within {:?}, force killing",
                kind.display_name(),
                self.timeouts.graceful_stop
            );
            if let Err(e) = force_kill(pid) {
                log::warn!("{}", e);
            }
            gone = wait_for_exit(&mut exited, self.timeouts.force_kill_wait).await;
        }

        self.commit(slot, |handle| {
            handle.clear_process();
            handle.state = if gone {
                ServiceState::Stopped
            } else {
                ServiceState::Error(format!("process {} did not exit after being killed", pid))
            };
        });
        if gone {
            log::info!("{} stopped", kind.display_name());
        } else {
            log::error!("{} (pid {}) could not be stopped", kind.display_name(), pid);
        }
    }

    /// Force kill every live process without waiting. All services end
    /// `Stopped`, and starts still in flight give up before spawning.
    pub fn cleanup_all(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        for slot in &self.slots {
            let pid = slot.read().process.as_ref().map(|p| p.pid);
            if let Some(pid) = pid {
                log::info!("Killing {} (pid {})", slot.kind(), pid);
                if let Err(e) = force_kill(pid) {
                    log::warn!("{}", e);
                }
                clear_pid_record(&self.layout, slot.kind(), pid);
            }
            let was_stopped = slot.read().state == ServiceState::Stopped;
            if !was_stopped || pid.is_some() {
                self.commit(slot, |handle| {
                    handle.clear_process();
                    handle.state = ServiceState::Stopped;
                });
            }
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::error::ErrorKind;
    use crate::settings::AppSettings;

    fn manager(root: &Path) -> ProcessManager {
        let layout = DataLayout::new(root.join("campp"));
        layout.ensure_dirs().unwrap();
        let project = root.join("www");
        let settings = SettingsStore::load_or_init(&layout.settings_path(), || {
            AppSettings::with_project_root(project)
        })
        .unwrap();
        ProcessManager::new(layout, Arc::new(settings), ManagerOptions::default())
    }

    #[test]
    fn fresh_manager_reports_everything_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let pm = manager(tmp.path());
        let all = pm.status_all();
        assert_eq!(all.len(), 4);
        for status in all {
            assert_eq!(status.state, ServiceState::Stopped);
            assert_eq!(status.port, status.kind.default_port());
            assert!(status.pid.is_none());
            assert!(!status.in_transition);
        }
    }

    #[test]
    fn slots_follow_kind_order() {
        let tmp = tempfile::tempdir().unwrap();
        let pm = manager(tmp.path());
        for kind in ServiceKind::ALL {
            assert_eq!(pm.slot(kind).kind(), kind);
        }
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let pm = manager(tmp.path());
        let mut events = pm.subscribe_events();
        let status = pm.stop(ServiceKind::WebServer).await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_without_runtime_is_an_error_then_stop_clears_it() {
        let tmp = tempfile::tempdir().unwrap();
        let pm = manager(tmp.path());

        let status = pm.start(ServiceKind::PhpRuntime).await;
        assert!(status.state.is_error());
        let message = status.error_message.unwrap();
        assert!(message.starts_with("RuntimeNotInstalled"), "{}", message);
        assert!(pm.status(ServiceKind::Database).state == ServiceState::Stopped);

        let status = pm.stop(ServiceKind::PhpRuntime).await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.error_message.is_none());
    }

    #[test]
    fn port_plan_uses_preferred_ports_when_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let pm = manager(tmp.path());
        let plan = pm.port_plan();
        for kind in ServiceKind::ALL {
            assert_eq!(plan.get(kind), kind.default_port());
        }
    }

    #[test]
    fn timeout_error_names_the_port() {
        let err = AppError::process_timed_out("php-runtime", 9000, 30);
        assert_eq!(err.kind(), ErrorKind::ProcessTimedOut);
        assert_eq!(err.detail("port"), Some("9000"));
    }
}
