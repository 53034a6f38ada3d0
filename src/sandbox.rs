//! Child-side confinement: resource limits and process-group signalling.
//!
//! Batch children (`install`, `exec`) get best-effort rlimits applied between
//! fork and exec. Every child leads its own process group so that
//! cancellation reaches anything it forked.

use std::io;

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Resource limits applied to a child before it execs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// RLIMIT_CPU, in seconds of CPU time.
    pub cpu_secs: Option<u64>,
    /// RLIMIT_AS, in bytes.
    pub address_space_bytes: Option<u64>,
    /// RLIMIT_FSIZE, in bytes.
    pub file_size_bytes: Option<u64>,
}

impl ResourceLimits {
    /// No limits at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.cpu_secs.is_none()
            && self.address_space_bytes.is_none()
            && self.file_size_bytes.is_none()
    }

    /// Applies the limits to the calling process, ignoring failures (a hard
    /// limit already lower than requested makes `setrlimit` fail with EPERM).
    ///
    /// Runs between fork and exec: must not allocate, lock or log.
    pub fn apply(&self) {
        if let Some(cpu) = self.cpu_secs {
            let _ = setrlimit(Resource::RLIMIT_CPU, cpu as libc::rlim_t, cpu as libc::rlim_t);
        }
        if let Some(bytes) = self.address_space_bytes {
            let _ = setrlimit(Resource::RLIMIT_AS, bytes as libc::rlim_t, bytes as libc::rlim_t);
        }
        if let Some(bytes) = self.file_size_bytes {
            let _ = setrlimit(
                Resource::RLIMIT_FSIZE,
                bytes as libc::rlim_t,
                bytes as libc::rlim_t,
            );
        }
        let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);
    }
}

/// Sends `signal` to the process group led by `pid`.
///
/// Returns `false` when the group no longer exists.
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => {
            debug!(pgid = pid, ?signal, "Signalled process group");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid = pid, ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// Blocks until the child `pid` has exited, leaving it unreaped.
///
/// While the zombie exists its pid, and with it the process group id, cannot
/// be handed to another process, so the group can still be signalled safely.
pub fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: `info` is a valid out-pointer for the duration of the call.
        let rc = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reaps the child `pid`. Signal deaths are reported as `128 + signo`.
pub fn reap(pid: u32) -> io::Result<i32> {
    let pid = i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| io::Error::from_raw_os_error(libc::ECHILD))?;
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_unlimited() {
        assert!(ResourceLimits::unlimited().is_unlimited());
        let limits = ResourceLimits {
            cpu_secs: Some(1),
            ..Default::default()
        };
        assert!(!limits.is_unlimited());
    }

    #[test]
    fn test_signalled_group_keeps_pgid_until_reaped() {
        use std::os::unix::process::CommandExt;

        let child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 60 & kill -TERM $$")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        wait_exited(pid).unwrap();
        // The leader is a zombie; its background sleep still holds the group.
        assert!(signal_group(pid, Signal::SIGKILL));
        assert_eq!(reap(pid).unwrap(), 128 + libc::SIGTERM);
        assert!(reap(pid).is_err());
    }

    #[test]
    fn test_signal_missing_group_is_not_an_error() {
        // Pid 0x7fff_fff0 is never a live group leader on Linux (pid_max <= 2^22).
        assert!(!signal_group(0x7fff_fff0, Signal::SIGTERM));
    }
}
