//! Platform-specific process management.

use crate::error::{Result, RpcError};
#[cfg(unix)]
use tracing::debug;
#[cfg(not(unix))]
use tracing::warn;

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)` signal check
/// - **Windows**: `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
#[allow(unsafe_code)]
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // EPERM means the process exists but belongs to someone else
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(e) => e == nix::errno::Errno::EPERM,
        }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

        // SAFETY: OpenProcess has no preconditions; a non-null handle is
        // closed exactly once before returning.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if !handle.is_null() {
                CloseHandle(handle);
                true
            } else {
                false
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Ask a process to exit.
///
/// Returns `Ok(false)` when the process is already gone.
///
/// # Platform Behavior
/// - **Linux/macOS**: sends SIGTERM
/// - **Windows**: not supported; callers fall back to a forced kill
pub fn send_terminate(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| RpcError::Io {
            message: format!("invalid pid {}", pid),
            source: None,
        })?;
        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(RpcError::Io {
                message: format!("failed to signal process {}: {}", pid, e),
                source: Some(std::io::Error::from(e)),
            }),
        }
    }

    #[cfg(not(unix))]
    {
        warn!("Graceful termination not supported on this platform (pid {})", pid);
        Err(RpcError::Io {
            message: format!("cannot request termination of process {}", pid),
            source: Some(std::io::Error::from(std::io::ErrorKind::Unsupported)),
        })
    }
}
