use cfg_if::cfg_if;
use nix::{
    errno::Errno,
    sys::signal::{
        Signal,
        kill,
    },
    unistd::Pid,
};
use precisej_printable_errno::{
    PrintableErrno,
    printable_error,
};
use std::{
    fmt,
    os::unix::prelude::RawFd,
};

use crate::{
    command::SignalSink,
    variant::LaunchPlan,
    PROGRAM_NAME,
};

#[cfg(target_os = "linux")]
mod linux;

pub mod identity {
    use cfg_if::cfg_if;
    use nix::unistd::{
        ResUid,
        Uid,
    };
    use precisej_printable_errno::{
        ErrnoResult,
        PrintableErrno,
    };

    use crate::PROGRAM_NAME;

    #[cfg(target_os = "linux")]
    use crate::platforms::linux;

    /// Where the process credentials come from. The real process is one source, tests are another.
    pub trait CredentialSource {
        fn query(&self) -> nix::Result<ResUid>;
        /// Set the real, effective and saved user ids to `uid`.
        fn assume(&self, uid: Uid) -> nix::Result<()>;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Elevation {
        /// The real user id already was root; nothing was changed.
        AlreadyRoot,
        /// All three ids now equal the former effective id.
        Elevated(Uid),
    }

    /// The daemons need a real user id of root. A setuid-root binary only gets the effective
    /// and saved ids raised, so copy the effective id over the other two.
    pub fn force_root_identity() -> Result<Elevation, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                elevate(&linux::ProcessCredentials)
            } else {
                unimplemented!()
            }
        }
    }

    pub(crate) fn elevate<C: CredentialSource>(source: &C) -> Result<Elevation, PrintableErrno<String>> {
        let ids = source.query()
            .printable(PROGRAM_NAME, "unable to get real, effective and saved user ids".to_string())?;
        if ids.real.is_root() {
            return Ok(Elevation::AlreadyRoot);
        }
        source.assume(ids.effective)
            .printable(PROGRAM_NAME, format!("unable to elevate to the identity required by the daemon (uid {})", ids.effective))?;
        Ok(Elevation::Elevated(ids.effective))
    }
}

/// Overwrites the calling thread's `errno`. Async-signal-safe.
pub fn set_errno(raw: i32) {
    cfg_if! {
        if #[cfg(target_os = "linux")] {
            linux::set_errno(raw)
        } else {
            unimplemented!()
        }
    }
}

/// Read side of the self-pipe the SIGCHLD handler writes to.
pub struct ExitNotifier {
    #[cfg(target_os = "linux")]
    opaque: linux::OpaqueExitNotifier,
}
impl ExitNotifier {
    pub fn open() -> Result<ExitNotifier, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(ExitNotifier {
                    opaque: linux::OpaqueExitNotifier::open()?
                })
            } else {
                unimplemented!()
            }
        }
    }

    pub fn read_fd(&self) -> RawFd {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.read_fd()
            } else {
                unimplemented!()
            }
        }
    }

    pub fn write_fd(&self) -> RawFd {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.write_fd()
            } else {
                unimplemented!()
            }
        }
    }

    /// Empties the pipe. Returns how many wake-ups were pending, which is only ever a hint.
    pub fn drain(&self) -> Result<usize, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.drain()
            } else {
                unimplemented!()
            }
        }
    }
}

/// What a non-blocking look at the daemon found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapStatus {
    /// Still running, or merely stopped or continued.
    Running,
    Exited(i32),
    Killed(Signal),
    /// Somebody already collected it.
    Gone,
}
impl ReapStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, ReapStatus::Running)
    }
}
impl fmt::Display for ReapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapStatus::Running => write!(f, "daemon is still running"),
            ReapStatus::Exited(code) => write!(f, "daemon exited with status {}", code),
            ReapStatus::Killed(signal) => write!(f, "daemon was killed with {}", signal.as_str()),
            ReapStatus::Gone => write!(f, "daemon was already reaped"),
        }
    }
}

/// The one daemon this supervisor spawned.
pub struct DaemonHandle {
    #[cfg(target_os = "linux")]
    opaque: linux::OpaqueDaemonHandle,
}
impl DaemonHandle {
    pub fn spawn(plan: &LaunchPlan) -> Result<DaemonHandle, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                Ok(DaemonHandle {
                    opaque: linux::OpaqueDaemonHandle::spawn(plan)?
                })
            } else {
                unimplemented!()
            }
        }
    }

    pub fn pid(&self) -> Pid {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.pid()
            } else {
                unimplemented!()
            }
        }
    }

    /// Collect the daemon's exit status if there is one. Never blocks.
    pub fn try_reap(&mut self) -> Result<ReapStatus, PrintableErrno<String>> {
        cfg_if! {
            if #[cfg(target_os = "linux")] {
                self.opaque.try_reap()
            } else {
                unimplemented!()
            }
        }
    }
}
impl SignalSink for DaemonHandle {
    fn deliver(&self, signal: Signal) {
        match kill(self.pid(), signal) {
            // ESRCH: it died already, which is what SIGKILL wanted anyway
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                printable_error(PROGRAM_NAME, format!("unable to send {} to daemon: {}", signal.as_str(), errno))
                    .eprint();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::identity::*;
    use nix::unistd::{
        ResUid,
        Uid,
    };
    use std::cell::RefCell;

    struct ScriptedCredentials {
        ids: Option<(u32, u32, u32)>,
        refuse: bool,
        assumed: RefCell<Vec<Uid>>,
    }
    impl ScriptedCredentials {
        fn new(real: u32, effective: u32, saved: u32) -> ScriptedCredentials {
            ScriptedCredentials {
                ids: Some((real, effective, saved)),
                refuse: false,
                assumed: RefCell::new(Vec::new()),
            }
        }
    }
    impl CredentialSource for ScriptedCredentials {
        fn query(&self) -> nix::Result<ResUid> {
            let (real, effective, saved) = self.ids.ok_or(nix::errno::Errno::EFAULT)?;
            Ok(ResUid {
                real: Uid::from_raw(real),
                effective: Uid::from_raw(effective),
                saved: Uid::from_raw(saved),
            })
        }

        fn assume(&self, uid: Uid) -> nix::Result<()> {
            self.assumed.borrow_mut().push(uid);
            if self.refuse {
                Err(nix::errno::Errno::EPERM)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn root_is_left_alone() {
        let creds = ScriptedCredentials::new(0, 0, 0);
        assert_eq!(elevate(&creds).ok(), Some(Elevation::AlreadyRoot));
        assert!(creds.assumed.borrow().is_empty());

        // Real root with a dropped effective id is still "already root".
        let creds = ScriptedCredentials::new(0, 1000, 0);
        assert_eq!(elevate(&creds).ok(), Some(Elevation::AlreadyRoot));
        assert!(creds.assumed.borrow().is_empty());
    }

    #[test]
    fn setuid_root_is_completed() {
        let creds = ScriptedCredentials::new(1000, 0, 0);
        assert_eq!(elevate(&creds).ok(), Some(Elevation::Elevated(Uid::from_raw(0))));
        assert_eq!(*creds.assumed.borrow(), [Uid::from_raw(0)]);
    }

    #[test]
    fn unprivileged_copies_effective_id() {
        let creds = ScriptedCredentials::new(1000, 1000, 1000);
        assert_eq!(elevate(&creds).ok(), Some(Elevation::Elevated(Uid::from_raw(1000))));
    }

    #[test]
    fn refused_elevation_is_an_error() {
        let mut creds = ScriptedCredentials::new(1000, 0, 0);
        creds.refuse = true;
        assert!(elevate(&creds).is_err());
        assert_eq!(creds.assumed.borrow().len(), 1);
    }

    #[test]
    fn failed_query_never_elevates() {
        let mut creds = ScriptedCredentials::new(1000, 0, 0);
        creds.ids = None;
        assert!(elevate(&creds).is_err());
        assert!(creds.assumed.borrow().is_empty());
    }
}
