//! Best-effort resource ceilings for tool children.
//!
//! Activated by the `rlimits` Cargo feature.  When the feature is absent,
//! or on non-unix hosts, the public surface compiles to no-ops so callers
//! never need `#[cfg]` guards.
//!
//! Memory maps to `RLIMIT_AS` and disk-write to `RLIMIT_FSIZE`, installed
//! in a `pre_exec` hook between fork and exec.  CPU percent has no rlimit
//! equivalent and stays advisory — it is recorded on the tool definition
//! and logged, never enforced.  The only *hard* bound the engine
//! guarantees is the wall-clock timeout; these ceilings are insurance the
//! host may or may not honor.

use hireling_tools::ResourceCaps;

/// Install the cap hooks on `cmd`.  No-op when no caps are set or the
/// platform cannot apply them.
#[allow(unused_variables)]
pub fn apply(cmd: &mut tokio::process::Command, caps: &ResourceCaps) {
    #[cfg(all(feature = "rlimits", unix))]
    {
        use std::os::unix::process::CommandExt as _;

        let memory_bytes = caps.max_memory_mb.map(|mb| mb.saturating_mul(1024 * 1024));
        let fsize_bytes = caps
            .max_disk_write_mb
            .map(|mb| mb.saturating_mul(1024 * 1024));
        if memory_bytes.is_none() && fsize_bytes.is_none() {
            return;
        }
        // SAFETY: the closure runs between fork and exec and only calls
        // setrlimit, which is async-signal-safe.
        unsafe {
            cmd.as_std_mut().pre_exec(move || {
                if let Some(bytes) = memory_bytes {
                    set_rlimit(libc::RLIMIT_AS as libc::c_int, bytes)?;
                }
                if let Some(bytes) = fsize_bytes {
                    set_rlimit(libc::RLIMIT_FSIZE as libc::c_int, bytes)?;
                }
                Ok(())
            });
        }
    }
}

/// Returns `true` when the rlimits feature is active on this platform.
/// Useful for logging / status reporting.
pub fn is_active() -> bool {
    cfg!(all(feature = "rlimits", unix))
}

// The resource constant's type differs between libc targets (c_int on
// macOS/musl, a dedicated enum type on glibc); the `as _` casts bridge
// both without a cfg ladder.
#[cfg(all(feature = "rlimits", unix))]
fn set_rlimit(resource: libc::c_int, bytes: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    // SAFETY: limit is a valid rlimit struct for the duration of the call.
    if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
