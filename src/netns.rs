//! Network namespace entry and loopback bring-up.
//!
//! Attach expects the pod's loopback interface to be up before the first
//! non-loopback plugin runs. Entering a namespace moves the *calling thread*,
//! so the whole operation runs on a dedicated blocking thread: save the
//! current namespace, `setns` into the pod's, bring `lo` up, restore.
//!
//! A pod with an empty netns path is a host-network pod and skips this
//! entirely.

use crate::error::{Error, Result};

/// Brings the loopback interface up inside `netns`.
///
/// No-op for an empty path. Fatal for the caller's setUp on failure.
pub async fn bring_up_loopback(netns: &str) -> Result<()> {
    if netns.is_empty() {
        return Ok(());
    }

    let netns = netns.to_string();
    let netns_for_err = netns.clone();
    tokio::task::spawn_blocking(move || linux::loopback_up(&netns))
        .await
        .map_err(|e| Error::Loopback {
            netns: netns_for_err,
            reason: format!("loopback task failed: {e}"),
        })?
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use nix::sched::{CloneFlags, setns};
    use std::fs::File;
    use std::process::Command;

    /// Saves the current network namespace and restores it on drop.
    struct NetnsGuard {
        original: File,
    }

    impl NetnsGuard {
        fn enter(netns_path: &str) -> Result<Self> {
            let original = File::open("/proc/self/ns/net").map_err(|e| Error::Loopback {
                netns: netns_path.to_string(),
                reason: format!("failed to open current netns: {e}"),
            })?;

            let target = File::open(netns_path).map_err(|e| Error::Loopback {
                netns: netns_path.to_string(),
                reason: format!("failed to open netns: {e}"),
            })?;

            setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| Error::Loopback {
                netns: netns_path.to_string(),
                reason: format!("failed to enter netns: {e}"),
            })?;

            Ok(Self { original })
        }
    }

    impl Drop for NetnsGuard {
        fn drop(&mut self) {
            // Restore is best-effort; the thread is dedicated to this call.
            let _ = setns(&self.original, CloneFlags::CLONE_NEWNET);
        }
    }

    pub(super) fn loopback_up(netns: &str) -> Result<()> {
        let _guard = NetnsGuard::enter(netns)?;

        let output = Command::new("ip")
            .args(["link", "set", "dev", "lo", "up"])
            .output()
            .map_err(|e| Error::Loopback {
                netns: netns.to_string(),
                reason: format!("failed to run ip: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::Loopback {
                netns: netns.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod linux {
    use super::*;

    pub(super) fn loopback_up(netns: &str) -> Result<()> {
        Err(Error::Loopback {
            netns: netns.to_string(),
            reason: "network namespaces require Linux".to_string(),
        })
    }
}
