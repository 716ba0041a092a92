use std::env::consts::{ARCH, OS};

use crate::error::{AppError, Result};

/// Executable file suffix for the current platform.
pub const EXE_SUFFIX: &str = std::env::consts::EXE_SUFFIX;

/// Target triple used as the platform key of the runtime manifest.
pub fn get_arch_target() -> Result<&'static str> {
    match (OS, ARCH) {
        ("windows", "x86_64") => Ok("x86_64-pc-windows-msvc"),
        ("windows", "aarch64") => Ok("aarch64-pc-windows-msvc"),
        ("linux", "x86_64") => Ok("x86_64-unknown-linux-gnu"),
        ("linux", "aarch64") => Ok("aarch64-unknown-linux-gnu"),
        ("macos", "x86_64") => Ok("x86_64-apple-darwin"),
        ("macos", "aarch64") => Ok("aarch64-apple-darwin"),
        _ => Err(AppError::unsupported_platform(&format!("{OS}-{ARCH}"))),
    }
}

/// Append the platform executable suffix to a bare program name.
pub fn exe_name(name: &str) -> String {
    format!("{name}{EXE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exe_name_uses_platform_suffix() {
        if cfg!(windows) {
            assert_eq!(exe_name("caddy"), "caddy.exe");
        } else {
            assert_eq!(exe_name("caddy"), "caddy");
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn linux_x86_64_target() {
        assert_eq!(get_arch_target().unwrap(), "x86_64-unknown-linux-gnu");
    }
}
