//! Supervision of the service processes.

mod bootstrap;
mod control;
mod health;
mod launch;
mod manager;
mod records;

use std::time::Duration;

use crate::runtime::Component;
use crate::service::ServiceKind;

pub use control::{force_kill, is_process_alive};
pub use health::probe_listening;
pub use launch::{launch_spec, LaunchSpec};
pub use manager::{ManagerOptions, ProcessManager, ServiceEvent};

/// Time a web, PHP or admin service gets to start listening.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The database may run crash recovery before it listens.
const DATABASE_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for graceful shutdown before force killing.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the exit after a force kill.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

/// Upper bound on the first-run database initialization.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Immutable identity of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub default_port: u16,
    pub component: Component,
    pub config_file: &'static str,
    pub startup_timeout: Duration,
}

impl ServiceDescriptor {
    pub fn for_kind(kind: ServiceKind) -> Self {
        Self {
            kind,
            default_port: kind.default_port(),
            component: kind.component(),
            config_file: crate::config::config_file_name(kind),
            startup_timeout: match kind {
                ServiceKind::Database => DATABASE_STARTUP_TIMEOUT,
                _ => DEFAULT_STARTUP_TIMEOUT,
            },
        }
    }
}

/// Bounds on every wait the manager performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Overrides every descriptor's startup timeout when set.
    pub startup: Option<Duration>,
    pub graceful_stop: Duration,
    pub force_kill_wait: Duration,
    pub bootstrap: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup: None,
            graceful_stop: GRACEFUL_STOP_TIMEOUT,
            force_kill_wait: FORCE_KILL_WAIT,
            bootstrap: BOOTSTRAP_TIMEOUT,
        }
    }
}

impl Timeouts {
    pub fn startup_for(&self, descriptor: &ServiceDescriptor) -> Duration {
        self.startup.unwrap_or(descriptor.startup_timeout)
    }
}
