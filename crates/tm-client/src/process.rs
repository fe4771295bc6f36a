//! Local process liveness and signalling.

use std::io;

/// Probe and signal local processes by PID.
pub trait ProcessControl: Send + Sync {
    /// True while a process with this PID exists.
    fn is_running(&self, pid: u32) -> bool;

    /// Sends `SIGTERM`. `Ok(false)` means no such process.
    fn signal_terminate(&self, pid: u32) -> io::Result<bool>;
}

/// [`ProcessControl`] backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

/// PIDs that would address a process group or be out of range are refused.
fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        )),
    }
}

impl ProcessControl for SystemProcesses {
    fn is_running(&self, pid: u32) -> bool {
        let Ok(pid) = to_pid(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs only the existence and permission check.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    fn signal_terminate(&self, pid: u32) -> io::Result<bool> {
        let pid = to_pid(pid)?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        assert!(SystemProcesses.is_running(std::process::id()));
    }

    #[test]
    fn test_pid_zero_is_refused() {
        assert!(!SystemProcesses.is_running(0));
        assert!(SystemProcesses.signal_terminate(0).is_err());
    }

    #[test]
    fn test_exited_child_is_not_running() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!SystemProcesses.is_running(pid));
        assert!(!SystemProcesses.signal_terminate(pid).unwrap());
    }
}
