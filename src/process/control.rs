//! Platform-specific signalling of service process groups.

use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
        .unwrap_or(false)
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Whether `pid` heads its own process group, as every spawned service does.
#[cfg(target_os = "windows")]
pub(super) fn leads_own_group(_pid: u32) -> bool {
    true
}

/// Whether `pid` heads its own process group, as every spawned service does.
#[cfg(not(target_os = "windows"))]
pub(super) fn leads_own_group(pid: u32) -> bool {
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    getpgid(Some(target)).is_ok_and(|pgid| pgid == target)
}

#[cfg(target_os = "windows")]
fn run_taskkill(pid: u32, force: bool) -> Result<()> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let output = std::process::Command::new("taskkill")
        .args(&args)
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr.trim();
    Err(AppError::process(format!(
        "taskkill failed for pid {}: {}",
        pid,
        if detail.is_empty() { "(no output)" } else { detail }
    )))
}

/// Ask the process tree to close.
#[cfg(target_os = "windows")]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    run_taskkill(pid, false)
}

#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    run_taskkill(pid, true)
}

#[cfg(not(target_os = "windows"))]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, signal).map_err(|e| {
            AppError::process(format!(
                "Failed to send {} to process group {} (from pid {}): {}",
                signal,
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Err(e) => kill(target, signal).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to send {} to pid {} (getpgid failed: {}): {}",
                signal, pid, e, kill_err
            ))
        }),
    }
}

/// Send SIGTERM to the service's process group.
#[cfg(not(target_os = "windows"))]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

/// SIGKILL the service's process group.
#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::CommandExt as _;

    use super::*;

    #[test]
    fn force_kill_ends_process_group() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        force_kill(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn graceful_signal_terminates_sleep() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        graceful_signal(child.id()).unwrap();
        assert!(!child.wait().unwrap().success());
    }

    #[test]
    fn group_leadership_detected() {
        let mut leader = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let mut member = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        assert!(leads_own_group(leader.id()));
        assert!(!leads_own_group(member.id()));
        leader.kill().unwrap();
        member.kill().unwrap();
        leader.wait().unwrap();
        member.wait().unwrap();
    }
}
