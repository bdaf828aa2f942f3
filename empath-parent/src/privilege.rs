//! Privilege-drop scoping guard (§4.4 ambient "Privileged-side dispatch"):
//! assumes a requested uid's privileges for the duration of one deliverer
//! call, then restores the parent's own. Full privilege dropping is
//! platform-specific (`seteuid`/`setresuid` on Unix, nothing comparable
//! elsewhere) so this crate models it as a scoping guard rather than
//! wiring `libc` directly into the portable core.

use tracing::{trace, warn};

/// Restores the effective uid the parent was running as when dropped,
/// regardless of whether [`PrivilegeGuard::assume`] actually managed to
/// change anything on this platform.
pub struct PrivilegeGuard {
    target_uid: u32,
}

impl PrivilegeGuard {
    /// Best-effort: on Unix, calls `seteuid` to the requested uid and logs
    /// (rather than fails) if the process lacks the capability to do so —
    /// a deliverer failing for lack of privilege surfaces as an ordinary
    /// `DelivererFailed` from the call itself, not from this guard.
    #[must_use]
    pub fn assume(uid: u32) -> Self {
        #[cfg(unix)]
        {
            // SAFETY: `seteuid` with a uid obtained from validated ruleset
            // configuration; failure is logged and left to surface through
            // the deliverer call that follows.
            let result = unsafe { libc::seteuid(uid) };
            if result != 0 {
                warn!(uid, "failed to assume uid for this delivery, continuing as current user");
            } else {
                trace!(uid, "assumed uid for the duration of this delivery");
            }
        }
        #[cfg(not(unix))]
        {
            warn!(uid, "privilege dropping is a no-op on this platform");
        }
        Self { target_uid: uid }
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: returns to the parent's own original effective uid (0,
            // since only a privileged process can assume another uid at all).
            let result = unsafe { libc::seteuid(0) };
            if result != 0 {
                warn!(
                    assumed = self.target_uid,
                    "failed to restore privileges after delivery; parent should be restarted"
                );
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.target_uid;
        }
    }
}
