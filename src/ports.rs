//! Port resolution for the supervised services.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use crate::error::{AppError, Result};

/// Number of consecutive candidates tried, starting at the preferred port.
pub const PORT_SCAN_ATTEMPTS: u16 = 20;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Whether something is accepting connections on loopback at `port`.
pub fn is_port_listening(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_ok()
}

pub fn check_port_available(port: u16) -> Result<()> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .map_err(|e| AppError::io(format!("Port {} is not bindable: {}", port, e)))?;
    Ok(())
}

/// Usable when nothing answers on it and it can be bound.
pub fn is_port_usable(port: u16) -> bool {
    port != 0 && !is_port_listening(port) && check_port_available(port).is_ok()
}

/// Resolve `preferred` to the first usable port in the scan window that is
/// not in `reserved`. Probes only; nothing is held open afterwards.
pub fn resolve_port(preferred: u16, reserved: &[u16]) -> Result<u16> {
    resolve_port_within(preferred, reserved, PORT_SCAN_ATTEMPTS)
}

pub(crate) fn resolve_port_within(preferred: u16, reserved: &[u16], attempts: u16) -> Result<u16> {
    if preferred == 0 {
        return Err(AppError::no_port_available(preferred, attempts));
    }

    for offset in 0..attempts {
        let Some(candidate) = preferred.checked_add(offset) else {
            break;
        };
        if reserved.contains(&candidate) {
            log::debug!("Port {} is reserved by another service", candidate);
            continue;
        }
        if is_port_usable(candidate) {
            if candidate != preferred {
                log::info!("Port {} is busy, using {} instead", preferred, candidate);
            }
            return Ok(candidate);
        }
        log::debug!("Port {} is in use", candidate);
    }

    Err(AppError::no_port_available(preferred, attempts))
}
