//! Pid records under `<data>/run`, used to find service processes an earlier
//! session left running.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths::{write_atomic, DataLayout};
use crate::service::ServiceKind;

use super::control::{force_kill, is_process_alive, leads_own_group};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct PidRecord {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

impl PidRecord {
    pub(super) fn new(pid: u32, port: u16) -> Self {
        Self {
            pid,
            port,
            started_at: Utc::now(),
        }
    }

    pub(super) fn read(layout: &DataLayout, kind: ServiceKind) -> Option<Self> {
        let path = layout.pid_record_path(kind);
        let content = std::fs::read_to_string(&path).ok()?;
        match toml::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Ignoring unreadable pid record {}: {}", path.display(), e);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    pub(super) fn write(&self, layout: &DataLayout, kind: ServiceKind) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        write_atomic(&layout.pid_record_path(kind), content.as_bytes())
    }
}

/// Remove the record for `kind` if it still names `pid`.
pub(super) fn clear_pid_record(layout: &DataLayout, kind: ServiceKind, pid: u32) {
    if PidRecord::read(layout, kind).is_some_and(|record| record.pid == pid) {
        let _ = std::fs::remove_file(layout.pid_record_path(kind));
    }
}

/// Kill the process recorded for `kind` if it is still alive, then drop the
/// record. Returns the pid that was killed.
///
/// Only call this while no process of this manager owns `kind`.
pub(super) async fn reap_stale_process(
    layout: &DataLayout,
    kind: ServiceKind,
    wait: Duration,
) -> Option<u32> {
    let record = PidRecord::read(layout, kind)?;
    let path = layout.pid_record_path(kind);
    let pid = record.pid;

    // A recycled pid that is not a group leader cannot be one of ours.
    if !is_process_alive(pid) || !leads_own_group(pid) {
        log::debug!("Dropping stale pid record for {} (pid {})", kind, pid);
        let _ = std::fs::remove_file(&path);
        return None;
    }

    log::warn!(
        "Killing {} left over from an earlier session (pid {}, port {}, started {})",
        kind.display_name(),
        pid,
        record.port,
        record.started_at
    );
    if let Err(e) = force_kill(pid) {
        log::warn!("{}", e);
    }
    let deadline = tokio::time::Instant::now() + wait;
    while is_process_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(REAP_POLL_INTERVAL).await;
    }
    if is_process_alive(pid) {
        log::warn!("Leftover {} (pid {}) is still alive", kind, pid);
    }
    let _ = std::fs::remove_file(&path);
    Some(pid)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::CommandExt as _;

    use super::*;

    fn layout(root: &std::path::Path) -> DataLayout {
        let layout = DataLayout::new(root.join("campp"));
        layout.ensure_dirs().unwrap();
        layout
    }

    #[test]
    fn clear_only_removes_matching_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        PidRecord::new(4242, 8080)
            .write(&layout, ServiceKind::WebServer)
            .unwrap();

        clear_pid_record(&layout, ServiceKind::WebServer, 1);
        assert_eq!(
            PidRecord::read(&layout, ServiceKind::WebServer).map(|r| r.pid),
            Some(4242)
        );
        clear_pid_record(&layout, ServiceKind::WebServer, 4242);
        assert!(!layout.pid_record_path(ServiceKind::WebServer).exists());
    }

    #[tokio::test]
    async fn dead_pid_record_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        PidRecord::new(pid, 9000)
            .write(&layout, ServiceKind::PhpRuntime)
            .unwrap();

        let reaped =
            reap_stale_process(&layout, ServiceKind::PhpRuntime, Duration::from_secs(1)).await;
        assert_eq!(reaped, None);
        assert!(!layout.pid_record_path(ServiceKind::PhpRuntime).exists());
    }

    #[tokio::test]
    async fn live_leftover_is_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        // Reap the child as soon as it dies so it does not linger as a zombie.
        let waiter = std::thread::spawn(move || child.wait().unwrap());
        PidRecord::new(pid, 3307)
            .write(&layout, ServiceKind::Database)
            .unwrap();

        let reaped =
            reap_stale_process(&layout, ServiceKind::Database, Duration::from_secs(5)).await;
        assert_eq!(reaped, Some(pid));
        assert!(!waiter.join().unwrap().success());
        assert!(!layout.pid_record_path(ServiceKind::Database).exists());
    }

    #[test]
    fn garbage_record_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        std::fs::write(layout.pid_record_path(ServiceKind::DbAdmin), "not toml [").unwrap();
        assert!(PidRecord::read(&layout, ServiceKind::DbAdmin).is_none());
        assert!(!layout.pid_record_path(ServiceKind::DbAdmin).exists());
    }
}
