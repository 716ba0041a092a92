//! Readiness probing for starting services.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub async fn probe_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Why a service never became ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum StartupFailure {
    Exited(String),
    TimedOut,
}

/// Poll until the port accepts connections, the process exits or `timeout` passes.
pub(super) async fn wait_until_listening(
    port: u16,
    exit: &mut watch::Receiver<Option<String>>,
    timeout: Duration,
) -> Result<(), StartupFailure> {
    let deadline = Instant::now() + timeout;
    let mut interval = INITIAL_POLL_INTERVAL;

    loop {
        if let Some(status) = exit.borrow().clone() {
            return Err(StartupFailure::Exited(status));
        }
        if probe_listening(port).await {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(StartupFailure::TimedOut);
        }

        let nap = interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = exit.changed() => {}
        }
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Wait up to `timeout` for the exit watcher to report. Returns whether it did.
pub(super) async fn wait_for_exit(
    exit: &mut watch::Receiver<Option<String>>,
    timeout: Duration,
) -> bool {
    let waited = tokio::time::timeout(timeout, exit.wait_for(|status| status.is_some())).await;
    match waited {
        Ok(Ok(_)) => true,
        // sender dropped: the watcher task is gone, so the child was reaped
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_when_listener_present() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_tx, mut rx) = watch::channel(None);
        assert!(wait_until_listening(port, &mut rx, Duration::from_secs(2))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn times_out_without_listener() {
        let port = portpicker::pick_unused_port().unwrap();
        let (_tx, mut rx) = watch::channel(None);
        let result = wait_until_listening(port, &mut rx, Duration::from_millis(300)).await;
        assert_eq!(result, Err(StartupFailure::TimedOut));
    }

    #[tokio::test]
    async fn exit_short_circuits_the_wait() {
        let port = portpicker::pick_unused_port().unwrap();
        let (tx, mut rx) = watch::channel(None);
        tx.send(Some("exit status: 1".to_string())).unwrap();
        let result = wait_until_listening(port, &mut rx, Duration::from_secs(5)).await;
        assert_eq!(result, Err(StartupFailure::Exited("exit status: 1".into())));
        assert!(wait_for_exit(&mut rx, Duration::from_millis(10)).await);
    }
}
