//! Signalling the shell's process group.

#[cfg(unix)]
use tracing::debug;

/// Handle to the process group a session shell leads.
///
/// Signals go to the whole group so jobs the shell started are reached too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    pub const fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    pub const fn id(self) -> Option<u32> {
        self.pgid
    }

    /// SIGKILL every member. A group that no longer exists is not an error.
    pub fn kill(self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_ignoring_gone(libc::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    }

    /// SIGCONT every member, resuming a stopped shell.
    pub fn resume(self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_ignoring_gone(libc::SIGCONT)
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    }

    #[cfg(unix)]
    fn signal_ignoring_gone(self, signal: libc::c_int) -> std::io::Result<()> {
        match self.signal(signal) {
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                debug!(pgid = ?self.pgid, signal, "Process group already gone");
                Ok(())
            }
            other => other,
        }
    }

    #[cfg(unix)]
    fn signal(self, signal: libc::c_int) -> std::io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        let pgid = i32::try_from(pgid).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "process group id out of range")
        })?;
        // SAFETY: pgid is the pid of a child we spawned as leader of its own
        // group; kill(2) on a negative pid only signals that group.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}
