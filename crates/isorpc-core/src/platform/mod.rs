//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than being
//! scattered through the crate.
//!
//! - `process` - process liveness checks and termination signals
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support
//! - **Windows**: Termination is always forced (no SIGTERM equivalent)

pub mod process;

pub use process::{is_process_alive, send_terminate};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        let platform = current_platform();
        assert!(["linux", "windows", "macos", "unknown"].contains(&platform));
    }
}
